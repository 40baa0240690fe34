// Workflow and task execution rows. Executions are append-only; counter
// bumps are single-row UPDATEs so concurrent task completions stay atomic
// per task.

use anyhow::Result;
use chrono::Utc;
use lakeflow_core::{ExecutionStatus, RollbackStatus};
use serde_json::Value;

use crate::db::Database;
use crate::models::{
    CreateWorkflowExecution, FinishTaskExecution, TaskExecutionRow, WorkflowExecutionRow,
};

impl Database {
    pub async fn create_workflow_execution(
        &self,
        input: CreateWorkflowExecution,
    ) -> Result<WorkflowExecutionRow> {
        let row = sqlx::query_as::<_, WorkflowExecutionRow>(
            r#"
            INSERT INTO metadata.workflow_executions
                (execution_id, workflow_name, status, trigger_type, start_time, total_tasks)
            VALUES ($1, $2, 'RUNNING', $3, NOW(), $4)
            RETURNING execution_id, workflow_name, status, trigger_type, start_time, end_time,
                      duration_seconds, total_tasks, completed_tasks, failed_tasks, skipped_tasks,
                      error_message, rollback_status, created_at
            "#,
        )
        .bind(&input.execution_id)
        .bind(&input.workflow_name)
        .bind(input.trigger_type.as_str())
        .bind(input.total_tasks)
        .fetch_one(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn finish_workflow_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE metadata.workflow_executions
            SET status = $2,
                error_message = $3,
                end_time = NOW(),
                duration_seconds = EXTRACT(EPOCH FROM (NOW() - start_time))::bigint
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .bind(status.as_str())
        .bind(error_message)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Bump exactly one of the completed/failed/skipped counters
    pub async fn bump_execution_counter(
        &self,
        execution_id: &str,
        outcome: ExecutionStatus,
    ) -> Result<()> {
        let column = match outcome {
            ExecutionStatus::Success => "completed_tasks",
            ExecutionStatus::Failed | ExecutionStatus::Cancelled => "failed_tasks",
            ExecutionStatus::Skipped => "skipped_tasks",
            _ => return Ok(()),
        };
        let sql = format!(
            "UPDATE metadata.workflow_executions SET {column} = {column} + 1 WHERE execution_id = $1"
        );
        sqlx::query(&sql)
            .bind(execution_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_rollback_status(
        &self,
        execution_id: &str,
        status: RollbackStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE metadata.workflow_executions SET rollback_status = $2 WHERE execution_id = $1",
        )
        .bind(execution_id)
        .bind(status.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_workflow_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecutionRow>> {
        let row = sqlx::query_as::<_, WorkflowExecutionRow>(
            r#"
            SELECT execution_id, workflow_name, status, trigger_type, start_time, end_time,
                   duration_seconds, total_tasks, completed_tasks, failed_tasks, skipped_tasks,
                   error_message, rollback_status, created_at
            FROM metadata.workflow_executions
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn list_workflow_executions(
        &self,
        workflow_name: &str,
        limit: i64,
    ) -> Result<Vec<WorkflowExecutionRow>> {
        let rows = sqlx::query_as::<_, WorkflowExecutionRow>(
            r#"
            SELECT execution_id, workflow_name, status, trigger_type, start_time, end_time,
                   duration_seconds, total_tasks, completed_tasks, failed_tasks, skipped_tasks,
                   error_message, rollback_status, created_at
            FROM metadata.workflow_executions
            WHERE workflow_name = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(workflow_name)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    // ============================================
    // Task executions
    // ============================================

    /// Insert a task execution in RUNNING state, returning its id
    pub async fn start_task_execution(
        &self,
        execution_id: &str,
        workflow_name: &str,
        task_name: &str,
    ) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO metadata.workflow_task_executions
                (execution_id, workflow_name, task_name, status, start_time)
            VALUES ($1, $2, $3, 'RUNNING', NOW())
            RETURNING id
            "#,
        )
        .bind(execution_id)
        .bind(workflow_name)
        .bind(task_name)
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    pub async fn update_task_execution_status(
        &self,
        task_execution_id: i64,
        status: ExecutionStatus,
        retry_count: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE metadata.workflow_task_executions
            SET status = $2, retry_count = $3
            WHERE id = $1
            "#,
        )
        .bind(task_execution_id)
        .bind(status.as_str())
        .bind(retry_count)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn finish_task_execution(
        &self,
        task_execution_id: i64,
        finish: FinishTaskExecution,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE metadata.workflow_task_executions
            SET status = $2,
                retry_count = $3,
                error_message = $4,
                task_output = $5,
                end_time = NOW(),
                duration_seconds = EXTRACT(EPOCH FROM (NOW() - start_time))::bigint
            WHERE id = $1
            "#,
        )
        .bind(task_execution_id)
        .bind(finish.status.as_str())
        .bind(finish.retry_count)
        .bind(&finish.error_message)
        .bind(&finish.task_output)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Record a task that resolved SKIPPED without ever dispatching
    pub async fn record_skipped_task(
        &self,
        execution_id: &str,
        workflow_name: &str,
        task_name: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata.workflow_task_executions
                (execution_id, workflow_name, task_name, status, start_time, end_time,
                 duration_seconds, task_output)
            VALUES ($1, $2, $3, 'SKIPPED', NOW(), NOW(), 0, $4)
            "#,
        )
        .bind(execution_id)
        .bind(workflow_name)
        .bind(task_name)
        .bind(Value::Null)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_task_executions(
        &self,
        execution_id: &str,
    ) -> Result<Vec<TaskExecutionRow>> {
        let rows = sqlx::query_as::<_, TaskExecutionRow>(
            r#"
            SELECT id, execution_id, workflow_name, task_name, status, start_time, end_time,
                   duration_seconds, retry_count, error_message, task_output
            FROM metadata.workflow_task_executions
            WHERE execution_id = $1
            ORDER BY id
            "#,
        )
        .bind(execution_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Generate an execution id: UTC stamp + random suffix
    pub fn generate_execution_id() -> String {
        format!(
            "{}_{:04}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            rand::random::<u16>() % 10_000
        )
    }
}
