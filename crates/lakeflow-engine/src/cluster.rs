// Cluster name resolution: ask the source what it calls itself, then map
// the raw hostname onto a logical cluster via configurable patterns.

use anyhow::Result;
use lakeflow_core::{ConnectionParams, DatabaseEngine};
use serde_json::Value;

use crate::sources::SourceClient;

/// Ordered (pattern, cluster) pairs; `*` matches any run of characters.
/// First match wins; unmatched hostnames pass through unchanged.
#[derive(Debug, Clone, Default)]
pub struct HostnamePatternMatcher {
    patterns: Vec<(String, String)>,
}

impl HostnamePatternMatcher {
    pub fn new(patterns: Vec<(String, String)>) -> Self {
        Self { patterns }
    }

    pub fn resolve(&self, hostname: &str) -> String {
        for (pattern, cluster) in &self.patterns {
            if wildcard_match(pattern, hostname) {
                return cluster.clone();
            }
        }
        hostname.to_string()
    }
}

fn wildcard_match(pattern: &str, input: &str) -> bool {
    fn inner(p: &[u8], s: &[u8]) -> bool {
        match (p.first(), s.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], s) || (!s.is_empty() && inner(p, &s[1..]))
            }
            (Some(pc), Some(sc)) if pc.eq_ignore_ascii_case(sc) => inner(&p[1..], &s[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), input.as_bytes())
}

/// Resolve a source's cluster name. Engines with a self-identification
/// query are asked directly; the rest fall back to the connection host.
pub async fn resolve_cluster_name(
    engine: DatabaseEngine,
    client: Option<&dyn SourceClient>,
    connection_string: &str,
    matcher: &HostnamePatternMatcher,
) -> Result<Option<String>> {
    if let (Some(sql), Some(client)) = (engine.cluster_name_query(), client) {
        let rows = client.query(sql).await?;
        if let Some(name) = rows.first().and_then(|row| {
            row.values().next().and_then(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                _ => None,
            })
        }) {
            return Ok(Some(matcher.resolve(&name)));
        }
    }

    match ConnectionParams::parse(connection_string) {
        Ok(params) => Ok(Some(matcher.resolve(&params.host))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_patterns() {
        assert!(wildcard_match("db-*", "db-prod-01"));
        assert!(wildcard_match("*prod*", "eu-prod-db"));
        assert!(wildcard_match("exact", "EXACT"));
        assert!(!wildcard_match("db-*", "replica-01"));
        assert!(wildcard_match("*", "anything"));
    }

    #[test]
    fn first_matching_pattern_wins() {
        let matcher = HostnamePatternMatcher::new(vec![
            ("*-prod-*".into(), "production".into()),
            ("*-stg-*".into(), "staging".into()),
        ]);
        assert_eq!(matcher.resolve("db-prod-03"), "production");
        assert_eq!(matcher.resolve("db-stg-01"), "staging");
        assert_eq!(matcher.resolve("db-dev-01"), "db-dev-01");
    }

    #[tokio::test]
    async fn falls_back_to_connection_host() {
        let matcher = HostnamePatternMatcher::default();
        let name = resolve_cluster_name(
            DatabaseEngine::Oracle,
            None,
            "host=ora-scan.internal;user=app;db=FIN",
            &matcher,
        )
        .await
        .unwrap();
        assert_eq!(name.as_deref(), Some("ora-scan.internal"));
    }

    #[tokio::test]
    async fn unparseable_connection_yields_none() {
        let matcher = HostnamePatternMatcher::default();
        let name = resolve_cluster_name(DatabaseEngine::MongoDb, None, "not a conn", &matcher)
            .await
            .unwrap();
        assert_eq!(name, None);
    }
}
