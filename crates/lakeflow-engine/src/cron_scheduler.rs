// Wall-clock trigger: wakes once per minute, enumerates due workflow
// schedules and scheduled backups, takes a per-entity catalog lock for the
// run, and dispatches.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lakeflow_core::{CronSchedule, RuntimeConfig, TriggerType};
use lakeflow_storage::{BackupOutcome, BackupRow, CatalogLock, Database};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::executor::WorkflowExecutor;

// Lock names are scoped to the wall-clock minute, held until expiry, so a
// peer waking in the same minute can never double-dispatch.
const SCHEDULE_LOCK_TTL_SECONDS: i64 = 120;
const SCHEDULE_LOCK_WAIT: Duration = Duration::from_secs(1);

/// Performs the actual dump; subprocess orchestration stays outside the
/// kernel. The default reports an explanatory failure.
#[async_trait]
pub trait BackupRunner: Send + Sync {
    async fn create_backup(&self, backup: &BackupRow, file_path: &str) -> BackupOutcome;
}

pub struct UnconfiguredBackupRunner;

#[async_trait]
impl BackupRunner for UnconfiguredBackupRunner {
    async fn create_backup(&self, _backup: &BackupRow, file_path: &str) -> BackupOutcome {
        BackupOutcome {
            success: false,
            file_path: file_path.to_string(),
            file_size: 0,
            error_message: Some("no backup runner configured".to_string()),
        }
    }
}

pub struct CronScheduler {
    db: Database,
    executor: WorkflowExecutor,
    backup_runner: Arc<dyn BackupRunner>,
    config: Arc<RwLock<RuntimeConfig>>,
}

impl CronScheduler {
    pub fn new(
        db: Database,
        executor: WorkflowExecutor,
        backup_runner: Arc<dyn BackupRunner>,
        config: Arc<RwLock<RuntimeConfig>>,
    ) -> Self {
        Self {
            db,
            executor,
            backup_runner,
            config,
        }
    }

    async fn dispatch_lock(&self, kind: &str, name: &str, now: DateTime<Utc>) -> CatalogLock {
        let sleep_ms = self.config.read().await.lock_retry_sleep_ms;
        CatalogLock::new(
            self.db.clone(),
            format!("{kind}_{name}_{}", now.format("%Y%m%d%H%M")),
        )
        .with_retry_sleep_ms(sleep_ms)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Cron scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(Duration::from_secs(60)) => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "Cron scheduler cycle failed");
                    }
                }
            }
        }
        info!("Cron scheduler stopped");
    }

    /// One evaluation pass at `now`
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        self.dispatch_due_workflows(now).await?;
        self.dispatch_due_backups(now).await?;
        Ok(())
    }

    async fn dispatch_due_workflows(&self, now: DateTime<Utc>) -> Result<()> {
        for row in self.db.list_scheduled_workflows().await? {
            let Some(cron) = &row.schedule_cron else {
                continue;
            };
            // Unparseable strings never match
            let Ok(schedule) = CronSchedule::parse(cron) else {
                debug!(workflow = %row.workflow_name, cron = %cron, "Skipping unparseable schedule");
                continue;
            };
            if !schedule.matches(now) {
                continue;
            }

            // Serialize this minute's launch across instances
            let mut lock = self
                .dispatch_lock("workflow_schedule", &row.workflow_name, now)
                .await;
            if !lock
                .try_acquire(SCHEDULE_LOCK_TTL_SECONDS, SCHEDULE_LOCK_WAIT)
                .await
                .is_acquired()
            {
                debug!(workflow = %row.workflow_name, "Another instance owns this scheduled run");
                continue;
            }

            info!(workflow = %row.workflow_name, cron = %cron, "Cron schedule due");
            self.executor
                .execute_workflow_async(&row.workflow_name, TriggerType::Scheduled);
            // The minute-scoped row stays until its TTL passes
            lock.hold_until_expiry();
        }
        Ok(())
    }

    async fn dispatch_due_backups(&self, now: DateTime<Utc>) -> Result<()> {
        for backup in self.db.list_due_backup_candidates().await? {
            let Some(cron) = &backup.cron_schedule else {
                continue;
            };
            let Ok(schedule) = CronSchedule::parse(cron) else {
                debug!(backup = %backup.backup_name, cron = %cron, "Skipping unparseable schedule");
                continue;
            };
            if !schedule.matches(now) {
                continue;
            }

            let mut lock = self.dispatch_lock("backup", &backup.backup_name, now).await;
            if !lock
                .try_acquire(SCHEDULE_LOCK_TTL_SECONDS, SCHEDULE_LOCK_WAIT)
                .await
                .is_acquired()
            {
                continue;
            }

            if let Err(e) = self.run_backup(&backup, &schedule, now).await {
                error!(backup = %backup.backup_name, error = %e, "Scheduled backup failed");
            }
            lock.hold_until_expiry();
        }
        Ok(())
    }

    async fn run_backup(
        &self,
        backup: &BackupRow,
        schedule: &CronSchedule,
        now: DateTime<Utc>,
    ) -> Result<()> {
        info!(backup = %backup.backup_name, "Executing scheduled backup");
        let file_path = stamped_file_path(&backup.file_path, now);
        let history_id = self.db.begin_backup_run(backup, "scheduled").await?;

        let started = tokio::time::Instant::now();
        let outcome = self.backup_runner.create_backup(backup, &file_path).await;
        let duration = started.elapsed().as_secs() as i64;

        self.db
            .finish_backup_run(backup.backup_id, history_id, &outcome, duration)
            .await?;
        if outcome.success {
            info!(backup = %backup.backup_name, file = %outcome.file_path, "Backup completed");
        } else {
            warn!(
                backup = %backup.backup_name,
                error = outcome.error_message.as_deref().unwrap_or(""),
                "Backup did not complete"
            );
        }

        if let Some(next) = schedule.next_after(now) {
            self.db.set_backup_next_run(backup.backup_id, next).await?;
        }
        Ok(())
    }
}

/// `/backups/sales.dump` -> `/backups/sales_2024-01-01T09-00-00.dump`
fn stamped_file_path(base: &str, now: DateTime<Utc>) -> String {
    let stamp = now.format("%Y-%m-%dT%H-%M-%S");
    match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => {
            format!("{stem}_{stamp}.{ext}")
        }
        _ => format!("{base}_{stamp}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn file_path_stamping() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        assert_eq!(
            stamped_file_path("/backups/sales.dump", now),
            "/backups/sales_2024-01-01T09-00-00.dump"
        );
        assert_eq!(
            stamped_file_path("/backups/raw", now),
            "/backups/raw_2024-01-01T09-00-00"
        );
        // A dot in a directory name is not an extension
        assert_eq!(
            stamped_file_path("/backups.d/raw", now),
            "/backups.d/raw_2024-01-01T09-00-00"
        );
    }
}
