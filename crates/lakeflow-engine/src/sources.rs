// Source database access behind a minimal trait.
// The kernel only needs metadata queries (discovery, keys, counts); the
// per-engine SQL lives on DatabaseEngine and drivers are injected through
// the registry. A Postgres client ships in-tree.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use lakeflow_core::DatabaseEngine;
use serde_json::{Map, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Column, PgPool, Row};
use tokio::sync::Mutex;

/// A discovered (schema, table) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTable {
    pub schema: String,
    pub table: String,
}

/// Minimal async query surface over one source connection
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Run a metadata query and return rows as JSON objects keyed by
    /// column name. For MongoDB the "query" is a command document.
    async fn query(&self, query: &str) -> Result<Vec<Map<String, Value>>>;
}

/// Discovery over any engine's client
pub async fn discover_tables(
    engine: DatabaseEngine,
    client: &dyn SourceClient,
) -> Result<Vec<SourceTable>> {
    let rows = client.query(engine.discover_tables_query()).await?;
    Ok(rows
        .iter()
        .filter_map(|row| {
            let schema = string_field(row, "schema_name")?;
            let table = string_field(row, "table_name")?;
            Some(SourceTable { schema, table })
        })
        .collect())
}

pub async fn table_columns(
    engine: DatabaseEngine,
    client: &dyn SourceClient,
    schema: &str,
    table: &str,
) -> Result<Vec<String>> {
    let sql = DatabaseEngine::bind_table(engine.columns_query(), schema, table);
    let rows = client.query(&sql).await?;
    Ok(rows
        .iter()
        .filter_map(|row| string_field(row, "column_name"))
        .collect())
}

pub async fn primary_key_columns(
    engine: DatabaseEngine,
    client: &dyn SourceClient,
    schema: &str,
    table: &str,
) -> Result<Vec<String>> {
    let sql = DatabaseEngine::bind_table(engine.primary_key_query(), schema, table);
    let rows = client.query(&sql).await?;
    Ok(rows
        .iter()
        .filter_map(|row| string_field(row, "column_name"))
        .collect())
}

/// Field lookup tolerant of engines that report uppercase column names
fn string_field(row: &Map<String, Value>, name: &str) -> Option<String> {
    row.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

// ============================================
// Postgres client (in-tree)
// ============================================

pub struct PgSourceClient {
    pool: PgPool,
}

impl PgSourceClient {
    pub async fn connect(connection_string: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(connection_string)
            .await
            .context("Failed to connect to Postgres source")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl SourceClient for PgSourceClient {
    async fn query(&self, query: &str) -> Result<Vec<Map<String, Value>>> {
        let rows = sqlx::query(query).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(pg_row_to_json).collect())
    }
}

fn pg_row_to_json(row: &sqlx::postgres::PgRow) -> Map<String, Value> {
    let mut map = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<String>, _>(i) {
            v.map(Value::String).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<bool>, _>(i) {
            v.map(Value::Bool).unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        map.insert(column.name().to_string(), value);
    }
    map
}

// ============================================
// Registry
// ============================================

type ClientFactory =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Arc<dyn SourceClient>>> + Send + Sync>;

/// Maps each engine to a client factory. Only Postgres is registered by
/// default; embedders add the rest. Clients are cached per connection
/// string.
pub struct SourceRegistry {
    factories: HashMap<DatabaseEngine, ClientFactory>,
    cache: Mutex<HashMap<(DatabaseEngine, String), Arc<dyn SourceClient>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
        };
        registry.register(DatabaseEngine::PostgreSql, |conn| {
            Box::pin(async move {
                let client = PgSourceClient::connect(&conn).await?;
                Ok(Arc::new(client) as Arc<dyn SourceClient>)
            })
        });
        registry
    }

    pub fn register<F>(&mut self, engine: DatabaseEngine, factory: F)
    where
        F: Fn(String) -> BoxFuture<'static, Result<Arc<dyn SourceClient>>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(engine, Arc::new(factory));
    }

    pub fn supports(&self, engine: DatabaseEngine) -> bool {
        self.factories.contains_key(&engine)
    }

    /// None when no driver is registered for the engine
    pub async fn connect(
        &self,
        engine: DatabaseEngine,
        connection_string: &str,
    ) -> Result<Option<Arc<dyn SourceClient>>> {
        let Some(factory) = self.factories.get(&engine) else {
            return Ok(None);
        };
        let key = (engine, connection_string.to_string());
        let mut cache = self.cache.lock().await;
        if let Some(client) = cache.get(&key) {
            return Ok(Some(client.clone()));
        }
        let client = factory(connection_string.to_string()).await?;
        cache.insert(key, client.clone());
        Ok(Some(client))
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticClient {
        rows: Vec<Map<String, Value>>,
    }

    #[async_trait]
    impl SourceClient for StaticClient {
        async fn query(&self, _query: &str) -> Result<Vec<Map<String, Value>>> {
            Ok(self.rows.clone())
        }
    }

    fn row(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    #[tokio::test]
    async fn discovery_reads_schema_and_table() {
        let client = StaticClient {
            rows: vec![
                row(&[("schema_name", "sales"), ("table_name", "orders")]),
                row(&[("SCHEMA_NAME", "HR"), ("TABLE_NAME", "EMPLOYEES")]),
            ],
        };
        let tables = discover_tables(DatabaseEngine::Oracle, &client).await.unwrap();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].schema, "sales");
        assert_eq!(tables[1].table, "EMPLOYEES");
    }

    #[tokio::test]
    async fn registry_defaults_cover_postgres_only() {
        let registry = SourceRegistry::new();
        assert!(registry.supports(DatabaseEngine::PostgreSql));
        assert!(!registry.supports(DatabaseEngine::Oracle));
        let client = registry
            .connect(DatabaseEngine::Oracle, "host=h;user=u;db=d")
            .await
            .unwrap();
        assert!(client.is_none());
    }
}
