// Hot-reloadable runtime config and the process log.

use anyhow::Result;
use lakeflow_core::{config::CONFIG_KEYS, RuntimeConfig};
use tracing::debug;

use crate::db::Database;
use crate::models::ConfigRow;

impl Database {
    /// Load recognized keys from metadata.config onto `config`.
    /// Returns the keys whose values were accepted.
    pub async fn load_runtime_config(&self, config: &mut RuntimeConfig) -> Result<Vec<String>> {
        let keys: Vec<String> = CONFIG_KEYS.iter().map(|k| k.to_string()).collect();
        let rows = sqlx::query_as::<_, ConfigRow>(
            r#"
            SELECT key, value, description, updated_at
            FROM metadata.config
            WHERE key = ANY($1)
            "#,
        )
        .bind(&keys)
        .fetch_all(self.pool())
        .await?;

        let mut applied = Vec::new();
        for row in rows {
            if config.apply(&row.key, &row.value) {
                applied.push(row.key);
            } else {
                debug!(key = %row.key, value = %row.value, "Ignoring invalid config value");
            }
        }
        Ok(applied)
    }

    pub async fn set_config_value(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata.config (key, value)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// One row per significant operation, keyed by a correlation id so a
    /// whole workflow execution or sync cycle can be traced back.
    pub async fn log_process(
        &self,
        correlation_id: &str,
        component: &str,
        operation: &str,
        status: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata.process_log (correlation_id, component, operation, status, detail)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(correlation_id)
        .bind(component)
        .bind(operation)
        .bind(status)
        .bind(detail)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn prune_process_log(&self, retention_hours: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM metadata.process_log WHERE created_at < NOW() - ($1 || ' hours')::interval",
        )
        .bind(retention_hours.to_string())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
