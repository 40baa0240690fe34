// Source database engines as a closed tagged variant.
// Each engine carries the metadata queries the catalog manager needs
// (discovery, primary key, column counts, cluster name); execution goes
// through the SourceClient trait in the engine crate, so drivers stay out
// of the kernel. MongoDB has no SQL surface — its queries are command
// documents interpreted by the injected client.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Column names probed, in order, when deriving a table's time column
pub const TIME_COLUMN_CANDIDATES: &[&str] = &[
    "updated_at",
    "modified_at",
    "last_modified",
    "updated_time",
    "created_at",
    "created_time",
    "timestamp",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatabaseEngine {
    MariaDb,
    Mssql,
    PostgreSql,
    Oracle,
    MongoDb,
}

pub const ALL_ENGINES: &[DatabaseEngine] = &[
    DatabaseEngine::MariaDb,
    DatabaseEngine::Mssql,
    DatabaseEngine::PostgreSql,
    DatabaseEngine::Oracle,
    DatabaseEngine::MongoDb,
];

impl DatabaseEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseEngine::MariaDb => "MariaDB",
            DatabaseEngine::Mssql => "MSSQL",
            DatabaseEngine::PostgreSql => "PostgreSQL",
            DatabaseEngine::Oracle => "Oracle",
            DatabaseEngine::MongoDb => "MongoDB",
        }
    }

    /// Lowercase tag used in lock names (`catalog_sync_<engine>`)
    pub fn tag(&self) -> &'static str {
        match self {
            DatabaseEngine::MariaDb => "mariadb",
            DatabaseEngine::Mssql => "mssql",
            DatabaseEngine::PostgreSql => "postgresql",
            DatabaseEngine::Oracle => "oracle",
            DatabaseEngine::MongoDb => "mongodb",
        }
    }

    /// Engines whose connection strings are URI style
    pub fn uses_uri_connection_string(&self) -> bool {
        matches!(self, DatabaseEngine::PostgreSql | DatabaseEngine::MongoDb)
    }

    /// Query listing user tables as (schema, table) rows
    pub fn discover_tables_query(&self) -> &'static str {
        match self {
            DatabaseEngine::MariaDb => {
                "SELECT table_schema AS schema_name, table_name \
                 FROM information_schema.tables \
                 WHERE table_type = 'BASE TABLE' \
                   AND table_schema NOT IN ('mysql', 'information_schema', 'performance_schema', 'sys')"
            }
            DatabaseEngine::Mssql => {
                "SELECT s.name AS schema_name, t.name AS table_name \
                 FROM sys.tables t JOIN sys.schemas s ON t.schema_id = s.schema_id \
                 WHERE t.is_ms_shipped = 0"
            }
            DatabaseEngine::PostgreSql => {
                "SELECT table_schema AS schema_name, table_name \
                 FROM information_schema.tables \
                 WHERE table_type = 'BASE TABLE' \
                   AND table_schema NOT IN ('pg_catalog', 'information_schema', 'metadata')"
            }
            DatabaseEngine::Oracle => {
                "SELECT owner AS schema_name, table_name FROM all_tables \
                 WHERE owner NOT IN ('SYS', 'SYSTEM', 'OUTLN', 'XDB')"
            }
            DatabaseEngine::MongoDb => r#"{"listCollections": 1, "nameOnly": true}"#,
        }
    }

    /// Query listing a table's column names in ordinal order.
    /// `{schema}` / `{table}` placeholders are bound by `bind_table`.
    pub fn columns_query(&self) -> &'static str {
        match self {
            DatabaseEngine::MariaDb | DatabaseEngine::PostgreSql => {
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_schema = '{schema}' AND table_name = '{table}' \
                 ORDER BY ordinal_position"
            }
            DatabaseEngine::Mssql => {
                "SELECT c.name AS column_name \
                 FROM sys.columns c \
                 JOIN sys.tables t ON c.object_id = t.object_id \
                 JOIN sys.schemas s ON t.schema_id = s.schema_id \
                 WHERE s.name = '{schema}' AND t.name = '{table}' \
                 ORDER BY c.column_id"
            }
            DatabaseEngine::Oracle => {
                "SELECT column_name FROM all_tab_columns \
                 WHERE owner = '{schema}' AND table_name = '{table}' \
                 ORDER BY column_id"
            }
            DatabaseEngine::MongoDb => r#"{"sampleFields": {"collection": "{table}"}}"#,
        }
    }

    /// Query listing primary-key column names
    pub fn primary_key_query(&self) -> &'static str {
        match self {
            DatabaseEngine::MariaDb => {
                "SELECT column_name FROM information_schema.key_column_usage \
                 WHERE table_schema = '{schema}' AND table_name = '{table}' \
                   AND constraint_name = 'PRIMARY' \
                 ORDER BY ordinal_position"
            }
            DatabaseEngine::Mssql => {
                "SELECT c.name AS column_name \
                 FROM sys.index_columns ic \
                 JOIN sys.indexes i ON ic.object_id = i.object_id AND ic.index_id = i.index_id \
                 JOIN sys.columns c ON ic.object_id = c.object_id AND ic.column_id = c.column_id \
                 JOIN sys.tables t ON i.object_id = t.object_id \
                 JOIN sys.schemas s ON t.schema_id = s.schema_id \
                 WHERE i.is_primary_key = 1 AND s.name = '{schema}' AND t.name = '{table}' \
                 ORDER BY ic.key_ordinal"
            }
            DatabaseEngine::PostgreSql => {
                "SELECT a.attname AS column_name \
                 FROM pg_index i \
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
                 WHERE i.indrelid = '\"{schema}\".\"{table}\"'::regclass AND i.indisprimary"
            }
            DatabaseEngine::Oracle => {
                "SELECT cols.column_name \
                 FROM all_constraints cons JOIN all_cons_columns cols \
                   ON cons.constraint_name = cols.constraint_name AND cons.owner = cols.owner \
                 WHERE cons.constraint_type = 'P' \
                   AND cons.owner = '{schema}' AND cols.table_name = '{table}' \
                 ORDER BY cols.position"
            }
            DatabaseEngine::MongoDb => r#"{"primaryKey": "_id"}"#,
        }
    }

    /// Query resolving the source cluster's own name, where the engine
    /// exposes one; None means "fall back to the connection host".
    pub fn cluster_name_query(&self) -> Option<&'static str> {
        match self {
            DatabaseEngine::MariaDb => Some("SELECT @@hostname AS cluster_name"),
            DatabaseEngine::Mssql => {
                Some("SELECT CAST(SERVERPROPERTY('MachineName') AS NVARCHAR(128)) AS cluster_name")
            }
            DatabaseEngine::PostgreSql => {
                Some("SELECT COALESCE(host(inet_server_addr())::text, 'localhost') AS cluster_name")
            }
            DatabaseEngine::Oracle | DatabaseEngine::MongoDb => None,
        }
    }

    /// Substitute the `{schema}` / `{table}` placeholders of a metadata query
    pub fn bind_table(query: &str, schema: &str, table: &str) -> String {
        query
            .replace("{schema}", &escape_identifier(schema))
            .replace("{table}", &escape_identifier(table))
    }

    /// First time-column candidate present among the table's columns
    pub fn detect_time_column(columns: &[String]) -> Option<String> {
        for candidate in TIME_COLUMN_CANDIDATES {
            if let Some(col) = columns
                .iter()
                .find(|c| c.eq_ignore_ascii_case(candidate))
            {
                return Some(col.clone());
            }
        }
        None
    }
}

/// Metadata identifiers come from our own catalog, but a stray quote must
/// never break out of the literal.
fn escape_identifier(ident: &str) -> String {
    ident.replace('\'', "''")
}

impl FromStr for DatabaseEngine {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MariaDB" => Ok(DatabaseEngine::MariaDb),
            "MSSQL" => Ok(DatabaseEngine::Mssql),
            "PostgreSQL" => Ok(DatabaseEngine::PostgreSql),
            "Oracle" => Ok(DatabaseEngine::Oracle),
            "MongoDB" => Ok(DatabaseEngine::MongoDb),
            other => Err(CoreError::config(format!("unknown engine: {other}"))),
        }
    }
}

impl fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How incremental sync addresses a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PkStrategy {
    /// Single-column primary key: offset by last processed key
    SinglePk,
    /// Composite primary key: offset by ordered key tuple
    CompositePk,
    /// No key, but a usable time column: offset by last sync timestamp
    TimeColumn,
    /// Neither: full scans only
    FullScan,
}

impl PkStrategy {
    pub fn derive(pk_columns: &[String], time_column: Option<&str>) -> Self {
        match (pk_columns.len(), time_column) {
            (1, _) => PkStrategy::SinglePk,
            (n, _) if n > 1 => PkStrategy::CompositePk,
            (_, Some(_)) => PkStrategy::TimeColumn,
            _ => PkStrategy::FullScan,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PkStrategy::SinglePk => "single_pk",
            PkStrategy::CompositePk => "composite_pk",
            PkStrategy::TimeColumn => "time_column",
            PkStrategy::FullScan => "full_scan",
        }
    }
}

impl FromStr for PkStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single_pk" => Ok(PkStrategy::SinglePk),
            "composite_pk" => Ok(PkStrategy::CompositePk),
            "time_column" => Ok(PkStrategy::TimeColumn),
            "full_scan" => Ok(PkStrategy::FullScan),
            other => Err(CoreError::config(format!("unknown pk strategy: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_names_round_trip() {
        for engine in ALL_ENGINES {
            assert_eq!(&engine.as_str().parse::<DatabaseEngine>().unwrap(), engine);
        }
    }

    #[test]
    fn time_column_candidate_order_wins() {
        let columns = vec![
            "id".to_string(),
            "created_at".to_string(),
            "updated_at".to_string(),
        ];
        assert_eq!(
            DatabaseEngine::detect_time_column(&columns).as_deref(),
            Some("updated_at")
        );
    }

    #[test]
    fn time_column_is_case_insensitive() {
        let columns = vec!["ID".to_string(), "Updated_At".to_string()];
        assert_eq!(
            DatabaseEngine::detect_time_column(&columns).as_deref(),
            Some("Updated_At")
        );
    }

    #[test]
    fn no_time_column() {
        let columns = vec!["id".to_string(), "name".to_string()];
        assert_eq!(DatabaseEngine::detect_time_column(&columns), None);
    }

    #[test]
    fn bind_table_substitutes_and_escapes() {
        let sql = DatabaseEngine::bind_table(
            DatabaseEngine::MariaDb.columns_query(),
            "sales",
            "o'rders",
        );
        assert!(sql.contains("table_schema = 'sales'"));
        assert!(sql.contains("table_name = 'o''rders'"));
    }

    #[test]
    fn pk_strategy_derivation() {
        let single = vec!["id".to_string()];
        let composite = vec!["a".to_string(), "b".to_string()];
        assert_eq!(PkStrategy::derive(&single, None), PkStrategy::SinglePk);
        assert_eq!(
            PkStrategy::derive(&composite, Some("updated_at")),
            PkStrategy::CompositePk
        );
        assert_eq!(
            PkStrategy::derive(&[], Some("updated_at")),
            PkStrategy::TimeColumn
        );
        assert_eq!(PkStrategy::derive(&[], None), PkStrategy::FullScan);
    }
}
