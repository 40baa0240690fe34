// Source-table catalog and its hygiene operations.
// Target tables live in this same database under the lowercased source
// schema/table names; hygiene touches them with dynamic identifiers.

use anyhow::Result;
use lakeflow_core::{CatalogStatus, DatabaseEngine};
use tracing::{debug, warn};

use crate::db::Database;
use crate::models::{CatalogEntryRow, UpsertCatalogEntry};

const CATALOG_COLUMNS: &str = "id, schema_name, table_name, db_engine, connection_string, status, \
     last_sync_column, pk_columns, pk_strategy, has_pk, table_size, cluster_name, active, \
     last_processed_pk, last_sync_time, updated_at";

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.to_lowercase().replace('"', ""))
}

fn target_name(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

impl Database {
    /// Upsert a discovered table, updating only discovery fields so sync
    /// state (status, offsets) survives re-discovery.
    pub async fn upsert_catalog_entry(&self, entry: &UpsertCatalogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata.catalog
                (schema_name, table_name, db_engine, connection_string, last_sync_column,
                 pk_columns, pk_strategy, has_pk, table_size)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (schema_name, table_name, db_engine, connection_string) DO UPDATE SET
                last_sync_column = EXCLUDED.last_sync_column,
                pk_columns = EXCLUDED.pk_columns,
                pk_strategy = EXCLUDED.pk_strategy,
                has_pk = EXCLUDED.has_pk,
                table_size = EXCLUDED.table_size,
                updated_at = NOW()
            "#,
        )
        .bind(&entry.schema_name)
        .bind(&entry.table_name)
        .bind(entry.db_engine.as_str())
        .bind(&entry.connection_string)
        .bind(&entry.last_sync_column)
        .bind(serde_json::to_value(&entry.pk_columns)?)
        .bind(&entry.pk_strategy)
        .bind(entry.has_pk)
        .bind(entry.table_size)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_catalog_entries(
        &self,
        engine: DatabaseEngine,
    ) -> Result<Vec<CatalogEntryRow>> {
        let rows = sqlx::query_as::<_, CatalogEntryRow>(&format!(
            "SELECT {CATALOG_COLUMNS} FROM metadata.catalog \
             WHERE db_engine = $1 ORDER BY schema_name, table_name"
        ))
        .bind(engine.as_str())
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn list_catalog_entries_in_status(
        &self,
        status: CatalogStatus,
        limit: i64,
    ) -> Result<Vec<CatalogEntryRow>> {
        let rows = sqlx::query_as::<_, CatalogEntryRow>(&format!(
            "SELECT {CATALOG_COLUMNS} FROM metadata.catalog \
             WHERE status = $1 AND active = TRUE \
             ORDER BY schema_name, table_name LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Distinct source connection strings registered for an engine
    pub async fn catalog_connection_strings(
        &self,
        engine: DatabaseEngine,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT connection_string FROM metadata.catalog
            WHERE db_engine = $1 AND active = TRUE
            "#,
        )
        .bind(engine.as_str())
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Move an entry through the status state machine; refuses (and logs)
    /// transitions the lifecycle does not allow.
    pub async fn set_catalog_status(
        &self,
        schema: &str,
        table: &str,
        engine: DatabaseEngine,
        next: CatalogStatus,
    ) -> Result<bool> {
        let Some(entry) = self.get_catalog_entry(schema, table, engine).await? else {
            return Ok(false);
        };
        let current = entry.status()?;
        if !current.can_transition_to(next) {
            warn!(
                schema, table, engine = %engine,
                from = current.as_str(), to = next.as_str(),
                "Refusing illegal catalog status transition"
            );
            return Ok(false);
        }
        sqlx::query(
            r#"
            UPDATE metadata.catalog SET status = $4, updated_at = NOW()
            WHERE schema_name = $1 AND table_name = $2 AND db_engine = $3
            "#,
        )
        .bind(schema)
        .bind(table)
        .bind(engine.as_str())
        .bind(next.as_str())
        .execute(self.pool())
        .await?;
        Ok(true)
    }

    pub async fn get_catalog_entry(
        &self,
        schema: &str,
        table: &str,
        engine: DatabaseEngine,
    ) -> Result<Option<CatalogEntryRow>> {
        let row = sqlx::query_as::<_, CatalogEntryRow>(&format!(
            "SELECT {CATALOG_COLUMNS} FROM metadata.catalog \
             WHERE schema_name = $1 AND table_name = $2 AND db_engine = $3"
        ))
        .bind(schema)
        .bind(table)
        .bind(engine.as_str())
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    // ============================================
    // Hygiene (all idempotent)
    // ============================================

    /// Remove catalog rows whose source table vanished; optionally drop the
    /// target table too. `existing` is the discovery result for this
    /// engine+connection.
    pub async fn clean_missing_tables(
        &self,
        engine: DatabaseEngine,
        connection_string: &str,
        existing: &[(String, String)],
        drop_target: bool,
    ) -> Result<u64> {
        let rows = sqlx::query_as::<_, CatalogEntryRow>(&format!(
            "SELECT {CATALOG_COLUMNS} FROM metadata.catalog \
             WHERE db_engine = $1 AND connection_string = $2"
        ))
        .bind(engine.as_str())
        .bind(connection_string)
        .fetch_all(self.pool())
        .await?;

        let mut removed = 0u64;
        for row in rows {
            let still_there = existing.iter().any(|(s, t)| {
                s.eq_ignore_ascii_case(&row.schema_name) && t.eq_ignore_ascii_case(&row.table_name)
            });
            if still_there {
                continue;
            }
            if drop_target {
                self.drop_target_table(&row.schema_name, &row.table_name)
                    .await?;
            }
            sqlx::query("DELETE FROM metadata.catalog WHERE id = $1")
                .bind(row.id)
                .execute(self.pool())
                .await?;
            debug!(
                schema = %row.schema_name, table = %row.table_name, engine = %engine,
                "Removed vanished table from catalog"
            );
            removed += 1;
        }
        Ok(removed)
    }

    /// Inactive rows whose target table holds rows become active again
    pub async fn reactivate_tables_with_data(&self) -> Result<u64> {
        let rows = sqlx::query_as::<_, CatalogEntryRow>(&format!(
            "SELECT {CATALOG_COLUMNS} FROM metadata.catalog WHERE active = FALSE"
        ))
        .fetch_all(self.pool())
        .await?;

        let mut reactivated = 0u64;
        for row in rows {
            let count = self
                .target_row_count(&row.schema_name, &row.table_name)
                .await
                .unwrap_or(None);
            if count.unwrap_or(0) > 0 {
                sqlx::query(
                    "UPDATE metadata.catalog SET active = TRUE, updated_at = NOW() WHERE id = $1",
                )
                .bind(row.id)
                .execute(self.pool())
                .await?;
                reactivated += 1;
            }
        }
        Ok(reactivated)
    }

    /// Active rows stuck in NO_DATA become inactive
    pub async fn deactivate_no_data_tables(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE metadata.catalog SET active = FALSE, updated_at = NOW()
            WHERE active = TRUE AND status = 'NO_DATA'
            "#,
        )
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Inactive rows outside NO_DATA move to SKIP with their offset cleared;
    /// optionally truncating the target first.
    pub async fn mark_inactive_as_skip(&self, truncate_target: bool) -> Result<u64> {
        let rows = sqlx::query_as::<_, CatalogEntryRow>(&format!(
            "SELECT {CATALOG_COLUMNS} FROM metadata.catalog \
             WHERE active = FALSE AND status NOT IN ('NO_DATA', 'SKIP')"
        ))
        .fetch_all(self.pool())
        .await?;

        let mut marked = 0u64;
        for row in rows {
            if truncate_target {
                self.truncate_target_table(&row.schema_name, &row.table_name)
                    .await?;
            }
            sqlx::query(
                r#"
                UPDATE metadata.catalog
                SET status = 'SKIP', last_processed_pk = NULL, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(row.id)
            .execute(self.pool())
            .await?;
            marked += 1;
        }
        Ok(marked)
    }

    /// Drop the target and restart from FULL_LOAD with a cleared offset
    pub async fn reset_table(
        &self,
        schema: &str,
        table: &str,
        engine: DatabaseEngine,
    ) -> Result<bool> {
        self.drop_target_table(schema, table).await?;
        let result = sqlx::query(
            r#"
            UPDATE metadata.catalog
            SET status = 'FULL_LOAD', last_processed_pk = NULL, last_sync_time = NULL,
                updated_at = NOW()
            WHERE schema_name = $1 AND table_name = $2 AND db_engine = $3
            "#,
        )
        .bind(schema)
        .bind(table)
        .bind(engine.as_str())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Offsets only make sense with a primary key
    pub async fn clean_invalid_offsets(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE metadata.catalog SET last_processed_pk = NULL, updated_at = NOW()
            WHERE has_pk = FALSE AND last_processed_pk IS NOT NULL
            "#,
        )
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    // ============================================
    // Cluster names
    // ============================================

    /// Distinct (connection_string, db_engine) pairs still missing a name
    pub async fn connections_missing_cluster_name(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT DISTINCT connection_string, db_engine FROM metadata.catalog
            WHERE (cluster_name IS NULL OR cluster_name = '') AND active = TRUE
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn update_cluster_name(
        &self,
        cluster_name: &str,
        connection_string: &str,
        engine: DatabaseEngine,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE metadata.catalog SET cluster_name = $1, updated_at = NOW()
            WHERE connection_string = $2 AND db_engine = $3
            "#,
        )
        .bind(cluster_name)
        .bind(connection_string)
        .bind(engine.as_str())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    // ============================================
    // Target-table helpers
    // ============================================

    pub async fn target_table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT FROM information_schema.tables
                WHERE table_schema = $1 AND table_name = $2
            )
            "#,
        )
        .bind(schema.to_lowercase())
        .bind(table.to_lowercase())
        .fetch_one(self.pool())
        .await?;
        Ok(exists)
    }

    /// None when the target does not exist
    pub async fn target_row_count(&self, schema: &str, table: &str) -> Result<Option<i64>> {
        if !self.target_table_exists(schema, table).await? {
            return Ok(None);
        }
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {}",
            target_name(schema, table)
        ))
        .fetch_one(self.pool())
        .await?;
        Ok(Some(count))
    }

    pub async fn target_column_count(&self, schema: &str, table: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            "#,
        )
        .bind(schema.to_lowercase())
        .bind(table.to_lowercase())
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    pub async fn drop_target_table(&self, schema: &str, table: &str) -> Result<()> {
        sqlx::query(&format!(
            "DROP TABLE IF EXISTS {} CASCADE",
            target_name(schema, table)
        ))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn truncate_target_table(&self, schema: &str, table: &str) -> Result<()> {
        if self.target_table_exists(schema, table).await? {
            sqlx::query(&format!("TRUNCATE TABLE {}", target_name(schema, table)))
                .execute(self.pool())
                .await?;
        }
        Ok(())
    }
}
