// Engine loop: owns the process lifecycle. Spawns the long-lived worker
// loops (initialization, catalog sync, per-engine transfer, quality,
// maintenance, monitoring) plus the trigger plane, all under one
// cooperative shutdown flag. One cycle's failure never kills its loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use lakeflow_core::engines::ALL_ENGINES;
use lakeflow_core::{CatalogStatus, DatabaseEngine, RuntimeConfig};
use lakeflow_storage::{CatalogEntryRow, Database};
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::catalog_manager::CatalogManager;
use crate::cluster::HostnamePatternMatcher;
use crate::collaborators::{
    CatalogSyncRunner, Collaborators, HttpApiCaller, ProcessScriptRunner, SqlJobRunner,
};
use crate::cron_scheduler::{BackupRunner, CronScheduler, UnconfiguredBackupRunner};
use crate::data_driven::DataDrivenScheduler;
use crate::dbt::DbtModelExecutor;
use crate::events::EventTriggerManager;
use crate::executor::WorkflowExecutor;
use crate::governance::GovernanceCollector;
use crate::quality::QualityValidator;
use crate::queue::TaskQueue;
use crate::sources::SourceRegistry;
use crate::versioning::VersionManager;

/// Moves one table's rows from source to target. Chunked copying is
/// driver territory; the kernel only drives the status lifecycle around
/// the outcome.
#[async_trait::async_trait]
pub trait TransferRunner: Send + Sync {
    async fn transfer(
        &self,
        entry: &CatalogEntryRow,
        chunk_size: u32,
    ) -> Result<TransferOutcome>;
}

#[derive(Debug, Clone, Copy)]
pub struct TransferOutcome {
    pub rows_copied: u64,
    pub source_empty: bool,
    /// A full load that reached the end of the source
    pub completed: bool,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub worker_pool_size: usize,
    pub hostname_patterns: Vec<(String, String)>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            hostname_patterns: Vec::new(),
        }
    }
}

pub struct Engine {
    db: Database,
    config: Arc<RwLock<RuntimeConfig>>,
    executor: WorkflowExecutor,
    queue: TaskQueue,
    events: EventTriggerManager,
    data_driven: DataDrivenScheduler,
    versions: VersionManager,
    catalog_manager: Arc<CatalogManager>,
    quality: QualityValidator,
    governance: GovernanceCollector,
    cron: Arc<CronScheduler>,
    sources: Arc<SourceRegistry>,
    transfer: Option<Arc<dyn TransferRunner>>,
    options: EngineOptions,
    shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    pub fn new(db: Database, options: EngineOptions) -> Self {
        let sources = Arc::new(SourceRegistry::new());
        let config = Arc::new(RwLock::new(RuntimeConfig::default()));
        let model_executor = DbtModelExecutor::new(db.clone());
        let collaborators = Collaborators {
            custom_jobs: Arc::new(SqlJobRunner::new(db.clone())),
            models: Arc::new(model_executor),
            sync: Arc::new(CatalogSyncRunner::new(db.clone())),
            api: Arc::new(HttpApiCaller::new()),
            scripts: Arc::new(ProcessScriptRunner),
        };
        let executor = WorkflowExecutor::new(db.clone(), collaborators);
        let matcher = HostnamePatternMatcher::new(options.hostname_patterns.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            executor: executor.clone(),
            queue: TaskQueue::new(),
            events: EventTriggerManager::new(executor.clone()),
            data_driven: DataDrivenScheduler::new(executor.clone(), sources.clone()),
            versions: VersionManager::new(db.clone()),
            catalog_manager: Arc::new(CatalogManager::new(
                db.clone(),
                sources.clone(),
                matcher,
                config.clone(),
            )),
            quality: QualityValidator::new(db.clone()),
            governance: GovernanceCollector::new(db.clone()),
            cron: Arc::new(CronScheduler::new(
                db.clone(),
                executor,
                Arc::new(UnconfiguredBackupRunner),
                config.clone(),
            )),
            sources,
            transfer: None,
            options,
            shutdown_tx,
            config,
            db,
        }
    }

    pub fn with_transfer_runner(mut self, runner: Arc<dyn TransferRunner>) -> Self {
        self.transfer = Some(runner);
        self
    }

    pub fn with_backup_runner(mut self, runner: Arc<dyn BackupRunner>) -> Self {
        self.cron = Arc::new(CronScheduler::new(
            self.db.clone(),
            self.executor.clone(),
            runner,
            self.config.clone(),
        ));
        self
    }

    pub fn executor(&self) -> &WorkflowExecutor {
        &self.executor
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn events(&self) -> &EventTriggerManager {
        &self.events
    }

    pub fn data_driven(&self) -> &DataDrivenScheduler {
        &self.data_driven
    }

    pub fn versions(&self) -> &VersionManager {
        &self.versions
    }

    pub fn sources(&self) -> &Arc<SourceRegistry> {
        &self.sources
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run until shutdown. The caller migrates the catalog first.
    pub async fn run(&self) -> Result<()> {
        self.initialize().await;

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        handles.push(self.spawn_catalog_sync_loop());
        for &engine in ALL_ENGINES {
            handles.push(self.spawn_transfer_loop(engine));
        }
        handles.push(self.spawn_quality_loop());
        handles.push(self.spawn_maintenance_loop());
        handles.push(self.spawn_monitoring_loop());

        {
            let cron = self.cron.clone();
            let shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move { cron.run(shutdown).await }));
        }
        {
            let events = self.events.clone();
            let shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move { events.run(shutdown).await }));
        }
        {
            let data_driven = self.data_driven.clone();
            let shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move { data_driven.run(shutdown).await }));
        }

        self.queue
            .start(self.options.worker_pool_size, self.executor.clone())
            .await;

        info!("Engine started");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        shutdown_rx.changed().await.ok();
        info!("Shutdown signal received, stopping loops");

        self.queue.stop().await;
        for handle in handles {
            let _ = handle.await;
        }
        info!("Engine stopped");
        Ok(())
    }

    /// One-shot bootstrap: config, baseline metrics, startup health check
    async fn initialize(&self) {
        {
            let mut config = self.config.write().await;
            match self.db.load_runtime_config(&mut config).await {
                Ok(applied) if !applied.is_empty() => {
                    info!(keys = ?applied, "Loaded runtime config from catalog")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Initial config load failed"),
            }
        }
        if let Err(e) = self.governance.collect_apm_metrics().await {
            warn!(error = %e, "Initial metric collection failed");
        }
        let _ = self
            .db
            .log_process("engine", "engine_loop", "initialize", "success", None)
            .await;
    }

    fn spawn_catalog_sync_loop(&self) -> JoinHandle<()> {
        let catalog_manager = self.catalog_manager.clone();
        let config = self.config.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            info!("Catalog sync loop started");
            loop {
                let interval = config.read().await.sync_interval;
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(interval)) => {
                        join_all(ALL_ENGINES.iter().map(|&engine| {
                            let manager = catalog_manager.clone();
                            async move {
                                if let Err(e) = manager.sync_catalog(engine).await {
                                    error!(engine = %engine, error = %e, "Catalog sync failed");
                                }
                            }
                        }))
                        .await;
                        if let Err(e) = catalog_manager.clean_catalog().await {
                            error!(error = %e, "Catalog hygiene failed");
                        }
                    }
                }
            }
            info!("Catalog sync loop stopped");
        })
    }

    fn spawn_transfer_loop(&self, engine: DatabaseEngine) -> JoinHandle<()> {
        let db = self.db.clone();
        let config = self.config.clone();
        let transfer = self.transfer.clone();
        let sources = self.sources.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            debug!(engine = %engine, "Transfer loop started");
            loop {
                let (interval, snapshot) = {
                    let config = config.read().await;
                    (config.transfer_interval(), *config)
                };
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(interval)) => {
                        if let Err(e) =
                            transfer_cycle(&db, engine, &snapshot, transfer.as_ref(), &sources).await
                        {
                            error!(engine = %engine, error = %e, "Transfer cycle failed");
                        }
                    }
                }
            }
            debug!(engine = %engine, "Transfer loop stopped");
        })
    }

    fn spawn_quality_loop(&self) -> JoinHandle<()> {
        let quality = self.quality.clone();
        let config = self.config.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            info!("Quality loop started");
            loop {
                let (interval, max_tables) = {
                    let config = config.read().await;
                    (config.quality_interval(), config.max_tables_per_cycle as i64)
                };
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(interval)) => {
                        if let Err(e) = quality.validate_listening_tables(max_tables).await {
                            error!(error = %e, "Quality cycle failed");
                        }
                    }
                }
            }
            info!("Quality loop stopped");
        })
    }

    fn spawn_maintenance_loop(&self) -> JoinHandle<()> {
        let db = self.db.clone();
        let catalog_manager = self.catalog_manager.clone();
        let governance = self.governance.clone();
        let config = self.config.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            info!("Maintenance loop started");
            loop {
                let (interval, max_tables) = {
                    let config = config.read().await;
                    (
                        config.maintenance_interval(),
                        config.max_tables_per_cycle as i64,
                    )
                };
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(interval)) => {
                        if let Err(e) = maintenance_cycle(&db, &catalog_manager, &governance, max_tables).await {
                            error!(error = %e, "Maintenance cycle failed");
                        }
                    }
                }
            }
            info!("Maintenance loop stopped");
        })
    }

    fn spawn_monitoring_loop(&self) -> JoinHandle<()> {
        let db = self.db.clone();
        let governance = self.governance.clone();
        let config = self.config.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            info!("Monitoring loop started");
            loop {
                let interval = config.read().await.sync_interval;
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(interval)) => {
                        // Hot-reload recognized config keys from the catalog
                        {
                            let mut current = config.write().await;
                            let before = *current;
                            match db.load_runtime_config(&mut current).await {
                                Ok(applied) => {
                                    if *current != before {
                                        info!(keys = ?applied, "Runtime config reloaded");
                                        let _ = db
                                            .log_process(
                                                "engine",
                                                "engine_loop",
                                                "config_reload",
                                                "applied",
                                                Some(&format!("{applied:?}")),
                                            )
                                            .await;
                                    }
                                }
                                Err(e) => warn!(error = %e, "Config reload failed"),
                            }
                        }
                        if let Err(e) = governance.collect_query_activity().await {
                            warn!(error = %e, "Query activity sampling failed");
                        }
                        if let Err(e) = governance.import_query_store().await {
                            warn!(error = %e, "Query store import failed");
                        }
                    }
                }
            }
            info!("Monitoring loop stopped");
        })
    }
}

/// One transfer pass for one engine: promote newly discovered tables,
/// then hand eligible entries to the transfer runner and apply the status
/// lifecycle to its outcomes.
async fn transfer_cycle(
    db: &Database,
    engine: DatabaseEngine,
    config: &RuntimeConfig,
    transfer: Option<&Arc<dyn TransferRunner>>,
    sources: &SourceRegistry,
) -> Result<()> {
    let budget = config.max_tables_per_cycle as i64;

    // Newly discovered tables enter the load pipeline
    for entry in db
        .list_catalog_entries_in_status(CatalogStatus::Pending, budget)
        .await?
    {
        if entry.db_engine == engine.as_str() {
            db.set_catalog_status(
                &entry.schema_name,
                &entry.table_name,
                engine,
                CatalogStatus::FullLoad,
            )
            .await?;
        }
    }

    let Some(runner) = transfer else {
        return Ok(());
    };
    if !sources.supports(engine) {
        return Ok(());
    }

    let mut eligible = Vec::new();
    for status in [
        CatalogStatus::FullLoad,
        CatalogStatus::ListeningChanges,
        CatalogStatus::NoData,
    ] {
        for entry in db.list_catalog_entries_in_status(status, budget).await? {
            if entry.db_engine == engine.as_str() {
                eligible.push(entry);
            }
        }
        if eligible.len() as i64 >= budget {
            eligible.truncate(budget as usize);
            break;
        }
    }

    let semaphore = Arc::new(Semaphore::new(config.max_workers as usize));
    let chunk_size = config.chunk_size;
    join_all(eligible.iter().map(|entry| {
        let semaphore = semaphore.clone();
        async move {
            let _permit = semaphore.acquire().await;
            let status = match entry.status() {
                Ok(status) => status,
                Err(_) => return,
            };
            match runner.transfer(entry, chunk_size).await {
                Ok(outcome) => {
                    let next = match status {
                        CatalogStatus::FullLoad if outcome.source_empty => {
                            Some(CatalogStatus::NoData)
                        }
                        CatalogStatus::FullLoad if outcome.completed => {
                            Some(CatalogStatus::ListeningChanges)
                        }
                        CatalogStatus::NoData if outcome.rows_copied > 0 => {
                            Some(CatalogStatus::ListeningChanges)
                        }
                        _ => None,
                    };
                    if let Some(next) = next {
                        let _ = db
                            .set_catalog_status(
                                &entry.schema_name,
                                &entry.table_name,
                                engine,
                                next,
                            )
                            .await;
                    }
                }
                Err(e) => {
                    warn!(
                        schema = %entry.schema_name,
                        table = %entry.table_name,
                        engine = %engine,
                        error = %e,
                        "Transfer failed"
                    );
                    let _ = db
                        .set_catalog_status(
                            &entry.schema_name,
                            &entry.table_name,
                            engine,
                            CatalogStatus::Error,
                        )
                        .await;
                }
            }
        }
    }))
    .await;
    Ok(())
}

/// Re-run target-table upkeep, collect metrics, and analyze hot tables
async fn maintenance_cycle(
    db: &Database,
    catalog_manager: &CatalogManager,
    governance: &GovernanceCollector,
    max_tables: i64,
) -> Result<()> {
    for &engine in ALL_ENGINES {
        if let Err(e) = catalog_manager.validate_schema_consistency(engine).await {
            warn!(engine = %engine, error = %e, "Schema consistency check failed");
        }
    }
    for entry in db
        .list_catalog_entries_in_status(CatalogStatus::ListeningChanges, max_tables)
        .await?
    {
        if let Err(e) = db
            .analyze_target_table(&entry.schema_name, &entry.table_name)
            .await
        {
            debug!(
                schema = %entry.schema_name,
                table = %entry.table_name,
                error = %e,
                "Analyze failed"
            );
        }
    }
    governance.collect_apm_metrics().await?;
    Ok(())
}
