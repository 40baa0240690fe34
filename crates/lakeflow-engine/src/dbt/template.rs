// SQL template expansion: {{ macro(...) }}, {{ ref('model') }},
// {{ source('name', 'table') }}. Macros expand first (recursively,
// bounded), then refs, then sources. Unresolved refs/sources are left as
// bare identifiers with a warning.

use std::collections::HashMap;

use regex::Regex;
use tracing::warn;

/// Hard bound on recursive macro expansion passes
const MACRO_RECURSION_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct MacroDef {
    pub sql: String,
    /// Positional parameter names substituted into the body by `{{ name }}`
    pub parameters: Vec<String>,
}

/// How a `ref` resolves
#[derive(Debug, Clone)]
pub enum RefTarget {
    /// Materialized model: fully qualified relation name
    Relation(String),
    /// Ephemeral model: compiled SQL inlined as a subquery
    Inline(String),
}

#[derive(Debug, Default)]
pub struct ExpandOutcome {
    pub sql: String,
    /// Model names referenced via {{ ref(...) }}, resolved or not
    pub refs: Vec<String>,
    /// (source_name, table_name) pairs referenced via {{ source(...) }}
    pub sources: Vec<(String, String)>,
    /// References that had no registration and were left bare
    pub unresolved: Vec<String>,
}

pub struct SqlTemplateExpander {
    macros: HashMap<String, MacroDef>,
    refs: HashMap<String, RefTarget>,
    sources: HashMap<(String, String), String>,
}

impl SqlTemplateExpander {
    pub fn new(
        macros: HashMap<String, MacroDef>,
        refs: HashMap<String, RefTarget>,
        sources: HashMap<(String, String), String>,
    ) -> Self {
        Self {
            macros,
            refs,
            sources,
        }
    }

    pub fn expand(&self, sql: &str) -> ExpandOutcome {
        let mut outcome = ExpandOutcome::default();
        let expanded = self.expand_macros(sql);
        let expanded = self.expand_refs(&expanded, &mut outcome);
        outcome.sql = self.expand_sources(&expanded, &mut outcome);
        outcome
    }

    fn expand_macros(&self, sql: &str) -> String {
        let mut current = sql.to_string();
        // One sweep per pass: text a macro body produces is only rescanned on
        // the next pass, so self-referential macros stop at the bound.
        for _ in 0..MACRO_RECURSION_LIMIT {
            let mut changed = false;
            for (name, def) in &self.macros {
                let pattern = Regex::new(&format!(
                    r"\{{\{{\s*{}\s*\(([^)]*)\)\s*\}}\}}",
                    regex::escape(name)
                ))
                .expect("macro pattern is valid");

                let mut result = String::with_capacity(current.len());
                let mut last = 0;
                let mut matched = false;
                for captures in pattern.captures_iter(&current) {
                    let call = captures.get(0).expect("whole match");
                    let args = split_args(captures.get(1).map_or("", |m| m.as_str()));
                    let mut body = def.sql.clone();
                    for (param, arg) in def.parameters.iter().zip(args.iter()) {
                        let param_pattern = Regex::new(&format!(
                            r"\{{\{{\s*{}\s*\}}\}}",
                            regex::escape(param)
                        ))
                        .expect("param pattern is valid");
                        body = param_pattern.replace_all(&body, arg.as_str()).into_owned();
                    }
                    result.push_str(&current[last..call.start()]);
                    result.push_str(&body);
                    last = call.end();
                    matched = true;
                }
                if matched {
                    result.push_str(&current[last..]);
                    current = result;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        current
    }

    fn expand_refs(&self, sql: &str, outcome: &mut ExpandOutcome) -> String {
        let pattern = Regex::new(r#"\{\{\s*ref\s*\(\s*['"]?([^'")\s]+)['"]?\s*\)\s*\}\}"#)
            .expect("ref pattern is valid");
        let mut current = sql.to_string();
        while let Some(captures) = pattern.captures(&current) {
            let call = captures.get(0).expect("whole match");
            let model_name = captures[1].to_string();
            outcome.refs.push(model_name.clone());
            let replacement = match self.refs.get(&model_name) {
                Some(RefTarget::Relation(qualified)) => qualified.clone(),
                Some(RefTarget::Inline(inner_sql)) => format!("({inner_sql})"),
                None => {
                    warn!(model = %model_name, "Model reference not found, leaving bare");
                    outcome.unresolved.push(model_name.clone());
                    model_name.clone()
                }
            };
            current.replace_range(call.range(), &replacement);
        }
        current
    }

    fn expand_sources(&self, sql: &str, outcome: &mut ExpandOutcome) -> String {
        let pattern = Regex::new(
            r#"\{\{\s*source\s*\(\s*['"]?([^'",)\s]+)['"]?\s*,\s*['"]?([^'")\s]+)['"]?\s*\)\s*\}\}"#,
        )
        .expect("source pattern is valid");
        let mut current = sql.to_string();
        while let Some(captures) = pattern.captures(&current) {
            let call = captures.get(0).expect("whole match");
            let source_name = captures[1].to_string();
            let table_name = captures[2].to_string();
            outcome
                .sources
                .push((source_name.clone(), table_name.clone()));
            let key = (source_name.clone(), table_name.clone());
            let replacement = match self.sources.get(&key) {
                Some(qualified) => qualified.clone(),
                None => {
                    warn!(source = %source_name, table = %table_name, "Source not found, leaving bare");
                    outcome.unresolved.push(format!("{source_name}.{table_name}"));
                    table_name.clone()
                }
            };
            current.replace_range(call.range(), &replacement);
        }
        current
    }
}

/// Split macro call arguments on top-level commas
fn split_args(args: &str) -> Vec<String> {
    if args.trim().is_empty() {
        return Vec::new();
    }
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in args.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    parts.push(current.trim().to_string());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expander() -> SqlTemplateExpander {
        let mut macros = HashMap::new();
        macros.insert(
            "cents_to_dollars".to_string(),
            MacroDef {
                sql: "({{ amount }} / 100.0)".to_string(),
                parameters: vec!["amount".to_string()],
            },
        );
        macros.insert(
            "rounded".to_string(),
            MacroDef {
                sql: "ROUND({{ cents_to_dollars(value) }}, 2)".to_string(),
                parameters: vec!["value".to_string()],
            },
        );

        let mut refs = HashMap::new();
        refs.insert(
            "stg_orders".to_string(),
            RefTarget::Relation("\"analytics\".\"stg_orders\"".to_string()),
        );
        refs.insert(
            "eph_base".to_string(),
            RefTarget::Inline("SELECT id FROM raw.base".to_string()),
        );

        let mut sources = HashMap::new();
        sources.insert(
            ("crm".to_string(), "accounts".to_string()),
            "\"crm\".\"accounts\"".to_string(),
        );

        SqlTemplateExpander::new(macros, refs, sources)
    }

    #[test]
    fn ref_resolves_to_qualified_name() {
        let outcome = expander().expand("SELECT * FROM {{ ref('stg_orders') }}");
        assert_eq!(outcome.sql, "SELECT * FROM \"analytics\".\"stg_orders\"");
        assert_eq!(outcome.refs, vec!["stg_orders"]);
        assert!(outcome.unresolved.is_empty());
    }

    #[test]
    fn ephemeral_ref_inlines_subquery() {
        let outcome = expander().expand("SELECT * FROM {{ ref('eph_base') }} b");
        assert_eq!(outcome.sql, "SELECT * FROM (SELECT id FROM raw.base) b");
    }

    #[test]
    fn unresolved_ref_left_bare() {
        let outcome = expander().expand("SELECT * FROM {{ ref('ghost') }}");
        assert_eq!(outcome.sql, "SELECT * FROM ghost");
        assert_eq!(outcome.unresolved, vec!["ghost"]);
    }

    #[test]
    fn source_resolves_to_qualified_name() {
        let outcome = expander().expand("SELECT * FROM {{ source('crm', 'accounts') }}");
        assert_eq!(outcome.sql, "SELECT * FROM \"crm\".\"accounts\"");
        assert_eq!(outcome.sources, vec![("crm".to_string(), "accounts".to_string())]);
    }

    #[test]
    fn macro_substitutes_positional_params() {
        let outcome = expander().expand("SELECT {{ cents_to_dollars(total) }} FROM t");
        assert_eq!(outcome.sql, "SELECT (total / 100.0) FROM t");
    }

    #[test]
    fn macros_expand_recursively_but_bounded() {
        let outcome = expander().expand("SELECT {{ rounded(price) }} FROM t");
        assert_eq!(outcome.sql, "SELECT ROUND((price / 100.0), 2) FROM t");

        // A self-referential macro terminates at the recursion bound
        let mut macros = HashMap::new();
        macros.insert(
            "forever".to_string(),
            MacroDef {
                sql: "{{ forever(x) }}".to_string(),
                parameters: vec!["x".to_string()],
            },
        );
        let looping = SqlTemplateExpander::new(macros, HashMap::new(), HashMap::new());
        let outcome = looping.expand("{{ forever(1) }}");
        assert!(outcome.sql.contains("forever"));
    }

    #[test]
    fn double_quoted_and_unquoted_refs_parse() {
        let outcome = expander().expand("{{ ref(\"stg_orders\") }} JOIN {{ ref(stg_orders) }}");
        assert_eq!(
            outcome.sql,
            "\"analytics\".\"stg_orders\" JOIN \"analytics\".\"stg_orders\""
        );
    }

    #[test]
    fn split_args_respects_nesting() {
        assert_eq!(split_args("a, f(b, c), d"), vec!["a", "f(b, c)", "d"]);
        assert!(split_args("").is_empty());
    }
}
