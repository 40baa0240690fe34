// Immutable workflow snapshots with restore.
// Version numbers only grow; the clear-then-set transaction keeps
// `is_current` unique per workflow.

use anyhow::{bail, Context, Result};
use lakeflow_core::{WorkflowDefinition, WorkflowDependency, WorkflowTask};

use crate::db::Database;
use crate::models::WorkflowVersionRow;

impl Database {
    /// Snapshot the workflow's current tasks+dependencies as the next
    /// version and mark it current. Returns the new version number.
    pub async fn create_workflow_version(
        &self,
        workflow_name: &str,
        created_by: &str,
        description: &str,
    ) -> Result<i32> {
        let definition = self
            .load_definition(workflow_name)
            .await?
            .with_context(|| format!("workflow not found: {workflow_name}"))?;
        let payload = serde_json::to_value(&definition)?;

        let mut tx = self.pool().begin().await?;

        let next: i32 = sqlx::query_scalar::<_, Option<i32>>(
            "SELECT MAX(version) FROM metadata.workflow_versions WHERE workflow_name = $1",
        )
        .bind(workflow_name)
        .fetch_one(&mut *tx)
        .await?
        .unwrap_or(0)
            + 1;

        sqlx::query(
            "UPDATE metadata.workflow_versions SET is_current = FALSE WHERE workflow_name = $1",
        )
        .bind(workflow_name)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO metadata.workflow_versions
                (workflow_name, version, payload, created_by, description, is_current)
            VALUES ($1, $2, $3, $4, $5, TRUE)
            "#,
        )
        .bind(workflow_name)
        .bind(next)
        .bind(&payload)
        .bind(created_by)
        .bind(description)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(next)
    }

    pub async fn get_workflow_version(
        &self,
        workflow_name: &str,
        version: i32,
    ) -> Result<Option<WorkflowVersionRow>> {
        let row = sqlx::query_as::<_, WorkflowVersionRow>(
            r#"
            SELECT id, workflow_name, version, payload, created_by, description,
                   is_current, created_at
            FROM metadata.workflow_versions
            WHERE workflow_name = $1 AND version = $2
            "#,
        )
        .bind(workflow_name)
        .bind(version)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn list_workflow_versions(
        &self,
        workflow_name: &str,
    ) -> Result<Vec<WorkflowVersionRow>> {
        let rows = sqlx::query_as::<_, WorkflowVersionRow>(
            r#"
            SELECT id, workflow_name, version, payload, created_by, description,
                   is_current, created_at
            FROM metadata.workflow_versions
            WHERE workflow_name = $1
            ORDER BY version DESC
            "#,
        )
        .bind(workflow_name)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn current_workflow_version(&self, workflow_name: &str) -> Result<Option<i32>> {
        let version = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT version FROM metadata.workflow_versions
            WHERE workflow_name = $1 AND is_current = TRUE
            "#,
        )
        .bind(workflow_name)
        .fetch_optional(self.pool())
        .await?;
        Ok(version)
    }

    /// Replace the live definition with a snapshot's payload and move the
    /// `is_current` marker onto that version.
    pub async fn restore_workflow_version(
        &self,
        workflow_name: &str,
        version: i32,
    ) -> Result<()> {
        let Some(row) = self.get_workflow_version(workflow_name, version).await? else {
            bail!("version {version} not found for workflow {workflow_name}");
        };
        let definition: WorkflowDefinition = serde_json::from_value(row.payload)
            .context("Corrupt version payload")?;

        let tasks: Vec<WorkflowTask> = definition.tasks;
        let dependencies: Vec<WorkflowDependency> = definition.dependencies;
        self.replace_definition(workflow_name, &tasks, &dependencies)
            .await?;

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "UPDATE metadata.workflow_versions SET is_current = FALSE WHERE workflow_name = $1",
        )
        .bind(workflow_name)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            UPDATE metadata.workflow_versions SET is_current = TRUE
            WHERE workflow_name = $1 AND version = $2
            "#,
        )
        .bind(workflow_name)
        .bind(version)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_workflow_version(
        &self,
        workflow_name: &str,
        version: i32,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM metadata.workflow_versions
            WHERE workflow_name = $1 AND version = $2 AND is_current = FALSE
            "#,
        )
        .bind(workflow_name)
        .bind(version)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
