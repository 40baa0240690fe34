// Backup bookkeeping. The cron scheduler enumerates due rows, stamps
// history, and delegates the actual dump to the injected BackupRunner.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::db::Database;
use crate::models::{BackupOutcome, BackupRow};

impl Database {
    /// Scheduled backups eligible to run (not currently in progress)
    pub async fn list_due_backup_candidates(&self) -> Result<Vec<BackupRow>> {
        let rows = sqlx::query_as::<_, BackupRow>(
            r#"
            SELECT backup_id, backup_name, db_engine, connection_string, database_name,
                   backup_type, file_path, cron_schedule, is_scheduled, status, last_run_at,
                   next_run_at, run_count, file_size, error_message, created_at
            FROM metadata.backups
            WHERE is_scheduled = TRUE AND status <> 'in_progress'
                  AND cron_schedule IS NOT NULL
            ORDER BY backup_name
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Open a history row and mark the backup in progress
    pub async fn begin_backup_run(&self, backup: &BackupRow, triggered_by: &str) -> Result<i64> {
        let mut tx = self.pool().begin().await?;

        let history_id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO metadata.backup_history (backup_id, backup_name, status, triggered_by)
            VALUES ($1, $2, 'in_progress', $3)
            RETURNING id
            "#,
        )
        .bind(backup.backup_id)
        .bind(&backup.backup_name)
        .bind(triggered_by)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE metadata.backups
            SET status = 'in_progress', last_run_at = NOW(), run_count = run_count + 1
            WHERE backup_id = $1
            "#,
        )
        .bind(backup.backup_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(history_id)
    }

    pub async fn finish_backup_run(
        &self,
        backup_id: i64,
        history_id: i64,
        outcome: &BackupOutcome,
        duration_seconds: i64,
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        if outcome.success {
            sqlx::query(
                r#"
                UPDATE metadata.backups
                SET status = 'completed', file_size = $2, error_message = NULL
                WHERE backup_id = $1
                "#,
            )
            .bind(backup_id)
            .bind(outcome.file_size)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                UPDATE metadata.backup_history
                SET status = 'completed', completed_at = NOW(), duration_seconds = $2,
                    file_path = $3, file_size = $4
                WHERE id = $1
                "#,
            )
            .bind(history_id)
            .bind(duration_seconds)
            .bind(&outcome.file_path)
            .bind(outcome.file_size)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE metadata.backups
                SET status = 'failed', error_message = $2
                WHERE backup_id = $1
                "#,
            )
            .bind(backup_id)
            .bind(&outcome.error_message)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                UPDATE metadata.backup_history
                SET status = 'failed', completed_at = NOW(), duration_seconds = $2,
                    error_message = $3
                WHERE id = $1
                "#,
            )
            .bind(history_id)
            .bind(duration_seconds)
            .bind(&outcome.error_message)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn set_backup_next_run(
        &self,
        backup_id: i64,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE metadata.backups SET next_run_at = $2 WHERE backup_id = $1")
            .bind(backup_id)
            .bind(next_run_at)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
