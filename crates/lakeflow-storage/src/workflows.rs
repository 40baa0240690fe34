// Workflow definitions: workflows, tasks, dependency edges.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use lakeflow_core::{Workflow, WorkflowDefinition, WorkflowDependency, WorkflowTask};

use crate::db::Database;
use crate::models::{WorkflowDependencyRow, WorkflowRow, WorkflowTaskRow};

impl Database {
    pub async fn create_workflow(&self, workflow: &Workflow) -> Result<()> {
        if workflow.name.trim().is_empty() {
            bail!("workflow name must not be empty");
        }
        sqlx::query(
            r#"
            INSERT INTO metadata.workflows
                (workflow_name, description, schedule_cron, active, enabled,
                 retry_policy, sla_config, rollback_config, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(&workflow.schedule_cron)
        .bind(workflow.active)
        .bind(workflow.enabled)
        .bind(serde_json::to_value(workflow.retry_policy)?)
        .bind(serde_json::to_value(workflow.sla_config)?)
        .bind(serde_json::to_value(workflow.rollback_config)?)
        .bind(&workflow.metadata)
        .execute(self.pool())
        .await
        .with_context(|| format!("Failed to create workflow {}", workflow.name))?;
        Ok(())
    }

    pub async fn update_workflow(&self, workflow: &Workflow) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE metadata.workflows
            SET description = $2,
                schedule_cron = $3,
                active = $4,
                enabled = $5,
                retry_policy = $6,
                sla_config = $7,
                rollback_config = $8,
                metadata = $9,
                updated_at = NOW()
            WHERE workflow_name = $1
            "#,
        )
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(&workflow.schedule_cron)
        .bind(workflow.active)
        .bind(workflow.enabled)
        .bind(serde_json::to_value(workflow.retry_policy)?)
        .bind(serde_json::to_value(workflow.sla_config)?)
        .bind(serde_json::to_value(workflow.rollback_config)?)
        .bind(&workflow.metadata)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_workflow(&self, name: &str) -> Result<Option<WorkflowRow>> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT workflow_name, description, schedule_cron, active, enabled,
                   retry_policy, sla_config, rollback_config, metadata,
                   last_execution_time, last_execution_status, created_at, updated_at
            FROM metadata.workflows
            WHERE workflow_name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowRow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT workflow_name, description, schedule_cron, active, enabled,
                   retry_policy, sla_config, rollback_config, metadata,
                   last_execution_time, last_execution_status, created_at, updated_at
            FROM metadata.workflows
            ORDER BY workflow_name
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Workflows the cron scheduler should consider
    pub async fn list_scheduled_workflows(&self) -> Result<Vec<WorkflowRow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT workflow_name, description, schedule_cron, active, enabled,
                   retry_policy, sla_config, rollback_config, metadata,
                   last_execution_time, last_execution_status, created_at, updated_at
            FROM metadata.workflows
            WHERE schedule_cron IS NOT NULL AND active = TRUE AND enabled = TRUE
            ORDER BY workflow_name
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn delete_workflow(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM metadata.workflows WHERE workflow_name = $1")
            .bind(name)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_last_execution(
        &self,
        name: &str,
        time: DateTime<Utc>,
        status: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE metadata.workflows
            SET last_execution_time = $2, last_execution_status = $3, updated_at = NOW()
            WHERE workflow_name = $1
            "#,
        )
        .bind(name)
        .bind(time)
        .bind(status)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // ============================================
    // Tasks & dependencies
    // ============================================

    pub async fn upsert_task(&self, task: &WorkflowTask) -> Result<()> {
        if task.task_name.trim().is_empty() {
            bail!("task name must not be empty");
        }
        sqlx::query(
            r#"
            INSERT INTO metadata.workflow_tasks
                (workflow_name, task_name, task_type, task_reference, task_config,
                 retry_policy, priority, condition_type, condition_expression,
                 loop_type, loop_config)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (workflow_name, task_name) DO UPDATE SET
                task_type = EXCLUDED.task_type,
                task_reference = EXCLUDED.task_reference,
                task_config = EXCLUDED.task_config,
                retry_policy = EXCLUDED.retry_policy,
                priority = EXCLUDED.priority,
                condition_type = EXCLUDED.condition_type,
                condition_expression = EXCLUDED.condition_expression,
                loop_type = EXCLUDED.loop_type,
                loop_config = EXCLUDED.loop_config
            "#,
        )
        .bind(&task.workflow_name)
        .bind(&task.task_name)
        .bind(task.task_type.as_str())
        .bind(&task.task_reference)
        .bind(&task.task_config)
        .bind(serde_json::to_value(task.retry_policy)?)
        .bind(task.priority)
        .bind(task.condition_type.as_str())
        .bind(&task.condition_expression)
        .bind(task.loop_type.map(|l| l.as_str()))
        .bind(&task.loop_config)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn upsert_dependency(&self, dep: &WorkflowDependency) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata.workflow_dependencies
                (workflow_name, upstream_task, downstream_task, dependency_type, condition_expression)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (workflow_name, upstream_task, downstream_task) DO UPDATE SET
                dependency_type = EXCLUDED.dependency_type,
                condition_expression = EXCLUDED.condition_expression
            "#,
        )
        .bind(&dep.workflow_name)
        .bind(&dep.upstream_task)
        .bind(&dep.downstream_task)
        .bind(dep.dependency_type.as_str())
        .bind(&dep.condition_expression)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_tasks(&self, workflow_name: &str) -> Result<Vec<WorkflowTaskRow>> {
        let rows = sqlx::query_as::<_, WorkflowTaskRow>(
            r#"
            SELECT id, workflow_name, task_name, task_type, task_reference, task_config,
                   retry_policy, priority, condition_type, condition_expression,
                   loop_type, loop_config
            FROM metadata.workflow_tasks
            WHERE workflow_name = $1
            ORDER BY id
            "#,
        )
        .bind(workflow_name)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn list_dependencies(
        &self,
        workflow_name: &str,
    ) -> Result<Vec<WorkflowDependencyRow>> {
        let rows = sqlx::query_as::<_, WorkflowDependencyRow>(
            r#"
            SELECT id, workflow_name, upstream_task, downstream_task,
                   dependency_type, condition_expression
            FROM metadata.workflow_dependencies
            WHERE workflow_name = $1
            ORDER BY id
            "#,
        )
        .bind(workflow_name)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Load a workflow with its full task and dependency set, converted to
    /// domain types. None when the workflow does not exist.
    pub async fn load_definition(&self, name: &str) -> Result<Option<WorkflowDefinition>> {
        let Some(workflow) = self.get_workflow(name).await? else {
            return Ok(None);
        };
        let tasks = self
            .list_tasks(name)
            .await?
            .into_iter()
            .map(WorkflowTaskRow::into_domain)
            .collect::<Result<Vec<_>>>()?;
        let dependencies = self
            .list_dependencies(name)
            .await?
            .into_iter()
            .map(WorkflowDependencyRow::into_domain)
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(WorkflowDefinition {
            workflow: workflow.into_domain(),
            tasks,
            dependencies,
        }))
    }

    /// Replace a workflow's tasks and dependencies atomically (used by
    /// version restore and bulk definition updates).
    pub async fn replace_definition(
        &self,
        workflow_name: &str,
        tasks: &[WorkflowTask],
        dependencies: &[WorkflowDependency],
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM metadata.workflow_dependencies WHERE workflow_name = $1")
            .bind(workflow_name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM metadata.workflow_tasks WHERE workflow_name = $1")
            .bind(workflow_name)
            .execute(&mut *tx)
            .await?;

        for task in tasks {
            sqlx::query(
                r#"
                INSERT INTO metadata.workflow_tasks
                    (workflow_name, task_name, task_type, task_reference, task_config,
                     retry_policy, priority, condition_type, condition_expression,
                     loop_type, loop_config)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(workflow_name)
            .bind(&task.task_name)
            .bind(task.task_type.as_str())
            .bind(&task.task_reference)
            .bind(&task.task_config)
            .bind(serde_json::to_value(task.retry_policy)?)
            .bind(task.priority)
            .bind(task.condition_type.as_str())
            .bind(&task.condition_expression)
            .bind(task.loop_type.map(|l| l.as_str()))
            .bind(&task.loop_config)
            .execute(&mut *tx)
            .await?;
        }

        for dep in dependencies {
            sqlx::query(
                r#"
                INSERT INTO metadata.workflow_dependencies
                    (workflow_name, upstream_task, downstream_task, dependency_type, condition_expression)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(workflow_name)
            .bind(&dep.upstream_task)
            .bind(&dep.downstream_task)
            .bind(dep.dependency_type.as_str())
            .bind(&dep.condition_expression)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
