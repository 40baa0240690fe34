// Catalog manager: per-engine source discovery, hygiene, cluster names,
// schema-drift detection. Every cluster-wide operation runs under a named
// catalog lock so independent instances never race.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use lakeflow_core::{CatalogStatus, DatabaseEngine, PkStrategy, RuntimeConfig};
use lakeflow_storage::{CatalogLock, Database, UpsertCatalogEntry};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cluster::{resolve_cluster_name, HostnamePatternMatcher};
use crate::sources::{discover_tables, primary_key_columns, table_columns, SourceRegistry};

const SYNC_LOCK_TTL_SECONDS: i64 = 600;
const CLEAN_LOCK_TTL_SECONDS: i64 = 300;
const LOCK_WAIT: Duration = Duration::from_secs(30);
const LOG_RETENTION_HOURS: i64 = 168;

pub struct CatalogManager {
    db: Database,
    sources: Arc<SourceRegistry>,
    matcher: HostnamePatternMatcher,
    config: Arc<RwLock<RuntimeConfig>>,
}

impl CatalogManager {
    pub fn new(
        db: Database,
        sources: Arc<SourceRegistry>,
        matcher: HostnamePatternMatcher,
        config: Arc<RwLock<RuntimeConfig>>,
    ) -> Self {
        Self {
            db,
            sources,
            matcher,
            config,
        }
    }

    async fn named_lock(&self, name: String) -> CatalogLock {
        let sleep_ms = self.config.read().await.lock_retry_sleep_ms;
        CatalogLock::new(self.db.clone(), name).with_retry_sleep_ms(sleep_ms)
    }

    /// Discover the engine's sources and upsert what they expose.
    /// Serialized across instances by `catalog_sync_<engine>`.
    pub async fn sync_catalog(&self, engine: DatabaseEngine) -> Result<()> {
        if !self.sources.supports(engine) {
            debug!(engine = %engine, "No source driver registered, skipping sync");
            return Ok(());
        }

        let mut lock = self
            .named_lock(format!("catalog_sync_{}", engine.tag()))
            .await;
        if !lock
            .try_acquire(SYNC_LOCK_TTL_SECONDS, LOCK_WAIT)
            .await
            .is_acquired()
        {
            warn!(
                engine = %engine,
                "Could not acquire catalog sync lock - another instance may be running"
            );
            return Ok(());
        }

        let result = self.sync_catalog_locked(engine).await;
        let _ = lock.release().await;
        result
    }

    async fn sync_catalog_locked(&self, engine: DatabaseEngine) -> Result<()> {
        for connection_string in self.db.catalog_connection_strings(engine).await? {
            let client = match self.sources.connect(engine, &connection_string).await {
                Ok(Some(client)) => client,
                Ok(None) => continue,
                Err(e) => {
                    warn!(engine = %engine, error = %e, "Source connection failed");
                    continue;
                }
            };

            let tables = match discover_tables(engine, client.as_ref()).await {
                Ok(tables) => tables,
                Err(e) => {
                    warn!(engine = %engine, error = %e, "Table discovery failed");
                    continue;
                }
            };

            for table in &tables {
                let columns =
                    table_columns(engine, client.as_ref(), &table.schema, &table.table)
                        .await
                        .unwrap_or_default();
                let time_column = DatabaseEngine::detect_time_column(&columns);
                let pk_columns =
                    primary_key_columns(engine, client.as_ref(), &table.schema, &table.table)
                        .await
                        .unwrap_or_default();
                let strategy = PkStrategy::derive(&pk_columns, time_column.as_deref());
                let table_size = self
                    .db
                    .target_row_count(&table.schema, &table.table)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or(0);

                let entry = UpsertCatalogEntry {
                    schema_name: table.schema.clone(),
                    table_name: table.table.clone(),
                    db_engine: engine,
                    connection_string: connection_string.clone(),
                    last_sync_column: time_column,
                    has_pk: !pk_columns.is_empty(),
                    pk_columns,
                    pk_strategy: strategy.as_str().to_string(),
                    table_size,
                };
                if let Err(e) = self.db.upsert_catalog_entry(&entry).await {
                    warn!(
                        schema = %table.schema, table = %table.table, error = %e,
                        "Catalog upsert failed"
                    );
                }
            }

            // Source list in hand: purge entries whose table vanished
            let existing: Vec<(String, String)> = tables
                .iter()
                .map(|t| (t.schema.clone(), t.table.clone()))
                .collect();
            match self
                .db
                .clean_missing_tables(engine, &connection_string, &existing, false)
                .await
            {
                Ok(0) => {}
                Ok(removed) => info!(engine = %engine, removed, "Removed vanished tables"),
                Err(e) => warn!(engine = %engine, error = %e, "Missing-table cleanup failed"),
            }
        }

        self.update_cluster_names().await;
        Ok(())
    }

    /// Catalog-wide hygiene under the `catalog_clean` lock
    pub async fn clean_catalog(&self) -> Result<()> {
        let mut lock = self.named_lock("catalog_clean".to_string()).await;
        if !lock
            .try_acquire(CLEAN_LOCK_TTL_SECONDS, LOCK_WAIT)
            .await
            .is_acquired()
        {
            warn!("Could not acquire lock for catalog cleaning - another instance may be running");
            return Ok(());
        }

        let reactivated = self.db.reactivate_tables_with_data().await.unwrap_or(0);
        let deactivated = self.db.deactivate_no_data_tables().await.unwrap_or(0);
        let skipped = self.db.mark_inactive_as_skip(false).await.unwrap_or(0);
        let offsets = self.db.clean_invalid_offsets().await.unwrap_or(0);
        let pruned = self
            .db
            .prune_process_log(LOG_RETENTION_HOURS)
            .await
            .unwrap_or(0);
        self.update_cluster_names().await;

        if reactivated + deactivated + skipped + offsets > 0 {
            info!(
                reactivated,
                deactivated, skipped, offsets, pruned, "Catalog hygiene applied"
            );
            let _ = self
                .db
                .log_process(
                    "catalog_clean",
                    "catalog_manager",
                    "clean_catalog",
                    "applied",
                    Some(&format!(
                        "reactivated={reactivated} deactivated={deactivated} skipped={skipped} offsets={offsets}"
                    )),
                )
                .await;
        }
        let _ = lock.release().await;
        Ok(())
    }

    /// Compare source and target column counts; drift resets the entry to
    /// FULL_LOAD via the reset path.
    pub async fn validate_schema_consistency(&self, engine: DatabaseEngine) -> Result<()> {
        if !self.sources.supports(engine) {
            return Ok(());
        }
        for entry in self.db.list_catalog_entries(engine).await? {
            let status = match entry.status() {
                Ok(s) => s,
                Err(_) => continue,
            };
            if !entry.active
                || !matches!(status, CatalogStatus::ListeningChanges | CatalogStatus::FullLoad)
            {
                continue;
            }
            let Ok(Some(client)) = self.sources.connect(engine, &entry.connection_string).await
            else {
                continue;
            };
            let source_columns = match table_columns(
                engine,
                client.as_ref(),
                &entry.schema_name,
                &entry.table_name,
            )
            .await
            {
                Ok(columns) => columns.len() as i64,
                Err(_) => continue,
            };
            if source_columns == 0 {
                continue;
            }
            let target_columns = self
                .db
                .target_column_count(&entry.schema_name, &entry.table_name)
                .await
                .unwrap_or(0);
            if target_columns > 0 && source_columns != target_columns {
                warn!(
                    schema = %entry.schema_name,
                    table = %entry.table_name,
                    source_columns,
                    target_columns,
                    "Schema drift detected, resetting table"
                );
                let _ = self
                    .db
                    .reset_table(&entry.schema_name, &entry.table_name, engine)
                    .await;
                let _ = self
                    .db
                    .log_process(
                        &format!("{}.{}", entry.schema_name, entry.table_name),
                        "catalog_manager",
                        "schema_drift_reset",
                        "applied",
                        Some(&format!("source={source_columns} target={target_columns}")),
                    )
                    .await;
            }
        }
        Ok(())
    }

    pub async fn update_cluster_names(&self) {
        let pairs = match self.db.connections_missing_cluster_name().await {
            Ok(pairs) => pairs,
            Err(e) => {
                warn!(error = %e, "Failed to list connections missing cluster names");
                return;
            }
        };
        for (connection_string, engine_name) in pairs {
            let Ok(engine) = engine_name.parse::<DatabaseEngine>() else {
                continue;
            };
            let client = self
                .sources
                .connect(engine, &connection_string)
                .await
                .ok()
                .flatten();
            match resolve_cluster_name(
                engine,
                client.as_deref(),
                &connection_string,
                &self.matcher,
            )
            .await
            {
                Ok(Some(cluster_name)) => {
                    if let Err(e) = self
                        .db
                        .update_cluster_name(&cluster_name, &connection_string, engine)
                        .await
                    {
                        warn!(error = %e, "Cluster name update failed");
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(engine = %engine, error = %e, "Cluster name resolution failed"),
            }
        }
    }
}
