// Version manager: immutable workflow snapshots with restore.

use anyhow::Result;
use lakeflow_storage::{Database, WorkflowVersionRow};
use tracing::info;

#[derive(Clone)]
pub struct VersionManager {
    db: Database,
}

impl VersionManager {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Snapshot the workflow's live definition as the next version
    pub async fn create_version(
        &self,
        workflow_name: &str,
        created_by: &str,
        description: &str,
    ) -> Result<i32> {
        let version = self
            .db
            .create_workflow_version(workflow_name, created_by, description)
            .await?;
        info!(workflow = workflow_name, version, "Created workflow version");
        let _ = self
            .db
            .log_process(
                workflow_name,
                "version_manager",
                "create_version",
                "success",
                Some(&format!("version {version}")),
            )
            .await;
        Ok(version)
    }

    /// Replace the live definition with a snapshot
    pub async fn restore_version(&self, workflow_name: &str, version: i32) -> Result<()> {
        self.db
            .restore_workflow_version(workflow_name, version)
            .await?;
        info!(workflow = workflow_name, version, "Restored workflow version");
        let _ = self
            .db
            .log_process(
                workflow_name,
                "version_manager",
                "restore_version",
                "success",
                Some(&format!("version {version}")),
            )
            .await;
        Ok(())
    }

    pub async fn versions(&self, workflow_name: &str) -> Result<Vec<WorkflowVersionRow>> {
        self.db.list_workflow_versions(workflow_name).await
    }

    pub async fn current_version(&self, workflow_name: &str) -> Result<Option<i32>> {
        self.db.current_workflow_version(workflow_name).await
    }

    pub async fn delete_version(&self, workflow_name: &str, version: i32) -> Result<bool> {
        self.db.delete_workflow_version(workflow_name, version).await
    }
}
