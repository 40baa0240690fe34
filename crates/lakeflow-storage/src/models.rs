// Catalog row models. Status/type columns are TEXT in the database; rows
// convert into `lakeflow-core` domain types at the boundary so the engine
// never sees raw strings.

use chrono::{DateTime, Utc};
use lakeflow_core::{
    CatalogStatus, ConditionType, DatabaseEngine, DependencyType, ExecutionStatus, LoopType,
    RetryPolicy, RollbackConfig, SlaConfig, TaskType, TriggerType, Workflow, WorkflowDependency,
    WorkflowTask,
};
use serde_json::Value;
use sqlx::FromRow;

use anyhow::Result;

// ============================================
// Workflows
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowRow {
    pub workflow_name: String,
    pub description: Option<String>,
    pub schedule_cron: Option<String>,
    pub active: bool,
    pub enabled: bool,
    #[sqlx(json)]
    pub retry_policy: RetryPolicy,
    #[sqlx(json)]
    pub sla_config: SlaConfig,
    #[sqlx(json)]
    pub rollback_config: RollbackConfig,
    pub metadata: Value,
    pub last_execution_time: Option<DateTime<Utc>>,
    pub last_execution_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRow {
    pub fn into_domain(self) -> Workflow {
        Workflow {
            name: self.workflow_name,
            description: self.description,
            schedule_cron: self.schedule_cron,
            active: self.active,
            enabled: self.enabled,
            retry_policy: self.retry_policy,
            sla_config: self.sla_config,
            rollback_config: self.rollback_config,
            metadata: self.metadata,
            last_execution_time: self.last_execution_time,
            last_execution_status: self.last_execution_status,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowTaskRow {
    pub id: i64,
    pub workflow_name: String,
    pub task_name: String,
    pub task_type: String,
    pub task_reference: String,
    pub task_config: Value,
    #[sqlx(json)]
    pub retry_policy: RetryPolicy,
    pub priority: i32,
    pub condition_type: String,
    pub condition_expression: Option<String>,
    pub loop_type: Option<String>,
    pub loop_config: Value,
}

impl WorkflowTaskRow {
    pub fn into_domain(self) -> Result<WorkflowTask> {
        Ok(WorkflowTask {
            workflow_name: self.workflow_name,
            task_name: self.task_name,
            task_type: self.task_type.parse::<TaskType>()?,
            task_reference: self.task_reference,
            task_config: self.task_config,
            retry_policy: self.retry_policy,
            priority: self.priority,
            condition_type: self.condition_type.parse::<ConditionType>()?,
            condition_expression: self.condition_expression,
            loop_type: self
                .loop_type
                .as_deref()
                .map(str::parse::<LoopType>)
                .transpose()?,
            loop_config: self.loop_config,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowDependencyRow {
    pub id: i64,
    pub workflow_name: String,
    pub upstream_task: String,
    pub downstream_task: String,
    pub dependency_type: String,
    pub condition_expression: Option<String>,
}

impl WorkflowDependencyRow {
    pub fn into_domain(self) -> Result<WorkflowDependency> {
        Ok(WorkflowDependency {
            workflow_name: self.workflow_name,
            upstream_task: self.upstream_task,
            downstream_task: self.downstream_task,
            dependency_type: self.dependency_type.parse::<DependencyType>()?,
            condition_expression: self.condition_expression,
        })
    }
}

// ============================================
// Executions
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowExecutionRow {
    pub execution_id: String,
    pub workflow_name: String,
    pub status: String,
    pub trigger_type: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub total_tasks: i32,
    pub completed_tasks: i32,
    pub failed_tasks: i32,
    pub skipped_tasks: i32,
    pub error_message: Option<String>,
    pub rollback_status: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowExecutionRow {
    pub fn status(&self) -> Result<ExecutionStatus> {
        Ok(self.status.parse()?)
    }
}

#[derive(Debug, Clone)]
pub struct CreateWorkflowExecution {
    pub execution_id: String,
    pub workflow_name: String,
    pub trigger_type: TriggerType,
    pub total_tasks: i32,
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskExecutionRow {
    pub id: i64,
    pub execution_id: String,
    pub workflow_name: String,
    pub task_name: String,
    pub status: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub task_output: Value,
}

#[derive(Debug, Clone)]
pub struct FinishTaskExecution {
    pub status: ExecutionStatus,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub task_output: Value,
}

// ============================================
// Versions
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowVersionRow {
    pub id: i64,
    pub workflow_name: String,
    pub version: i32,
    pub payload: Value,
    pub created_by: String,
    pub description: String,
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
}

// ============================================
// Source catalog
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct CatalogEntryRow {
    pub id: i64,
    pub schema_name: String,
    pub table_name: String,
    pub db_engine: String,
    pub connection_string: String,
    pub status: String,
    pub last_sync_column: Option<String>,
    pub pk_columns: Value,
    pub pk_strategy: Option<String>,
    pub has_pk: bool,
    pub table_size: i64,
    pub cluster_name: Option<String>,
    pub active: bool,
    pub last_processed_pk: Option<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CatalogEntryRow {
    pub fn status(&self) -> Result<CatalogStatus> {
        Ok(self.status.parse()?)
    }

    pub fn engine(&self) -> Result<DatabaseEngine> {
        Ok(self.db_engine.parse()?)
    }

    pub fn pk_column_names(&self) -> Vec<String> {
        self.pk_columns
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Discovery result to upsert. Only dirty fields overwrite; sync state
/// (status, offsets) is preserved on conflict.
#[derive(Debug, Clone)]
pub struct UpsertCatalogEntry {
    pub schema_name: String,
    pub table_name: String,
    pub db_engine: DatabaseEngine,
    pub connection_string: String,
    pub last_sync_column: Option<String>,
    pub pk_columns: Vec<String>,
    pub pk_strategy: String,
    pub has_pk: bool,
    pub table_size: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct CatalogLockRow {
    pub lock_name: String,
    pub acquired_by: String,
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
    pub acquired_at: DateTime<Utc>,
}

// ============================================
// Custom jobs & feeds
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct CustomJobRow {
    pub job_name: String,
    pub description: Option<String>,
    pub job_type: String,
    pub sql_query: String,
    pub target_schema: Option<String>,
    pub target_table: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct JobResultRow {
    pub id: i64,
    pub job_name: String,
    pub status: String,
    pub rows_affected: i64,
    pub duration_seconds: f64,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreateJobResult {
    pub job_name: String,
    pub status: String,
    pub rows_affected: i64,
    pub duration_seconds: f64,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ApiCatalogRow {
    pub id: i64,
    pub api_name: String,
    pub endpoint_url: String,
    pub method: String,
    pub headers: Value,
    pub auth_config: Value,
    pub target_schema: String,
    pub target_table: String,
    pub sync_interval_seconds: i32,
    pub active: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_sync_status: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct CsvCatalogRow {
    pub id: i64,
    pub file_name: String,
    pub file_path: String,
    pub delimiter: String,
    pub has_header: bool,
    pub target_schema: String,
    pub target_table: String,
    pub active: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_sync_status: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct GoogleSheetsCatalogRow {
    pub id: i64,
    pub sheet_name: String,
    pub spreadsheet_id: String,
    pub range_spec: String,
    pub target_schema: String,
    pub target_table: String,
    pub active: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_sync_status: Option<String>,
}

// ============================================
// Transformation models
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct DbtModelRow {
    pub model_name: String,
    pub materialization: String,
    pub schema_name: String,
    pub sql_content: String,
    pub depends_on: Value,
    pub columns: Value,
    pub tags: Value,
    pub config: Value,
    pub documentation: Option<String>,
    pub version: i32,
    pub git_commit_hash: Option<String>,
    pub git_branch: Option<String>,
    pub active: bool,
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,
    pub rows_affected: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DbtModelRow {
    pub fn depends_on_names(&self) -> Vec<String> {
        self.depends_on
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// config.unique_key for incremental upserts, if declared
    pub fn unique_key(&self) -> Option<&str> {
        self.config.get("unique_key").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DbtTestRow {
    pub id: i64,
    pub test_name: String,
    pub model_name: String,
    pub test_type: String,
    pub column_name: Option<String>,
    pub test_config: Value,
    pub test_sql: Option<String>,
    pub severity: String,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct CreateTestResult {
    pub test_name: String,
    pub model_name: String,
    pub test_type: String,
    pub run_id: String,
    pub status: String,
    pub rows_affected: i64,
    pub execution_time_seconds: f64,
    pub error_message: Option<String>,
    pub test_result: Value,
}

#[derive(Debug, Clone, FromRow)]
pub struct DbtTestResultRow {
    pub id: i64,
    pub test_name: String,
    pub model_name: String,
    pub test_type: String,
    pub run_id: String,
    pub status: String,
    pub rows_affected: i64,
    pub execution_time_seconds: f64,
    pub error_message: Option<String>,
    pub test_result: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct DbtMacroRow {
    pub macro_name: String,
    pub macro_sql: String,
    pub parameters: Value,
    pub description: Option<String>,
    pub active: bool,
}

impl DbtMacroRow {
    /// Declared parameter names, in order
    pub fn parameter_names(&self) -> Vec<String> {
        self.parameters
            .as_array()
            .map(|a| {
                a.iter()
                    .enumerate()
                    .map(|(i, v)| match v {
                        Value::String(s) => s.clone(),
                        Value::Object(o) => o
                            .get("name")
                            .and_then(|n| n.as_str())
                            .map(String::from)
                            .unwrap_or_else(|| format!("param{i}")),
                        _ => format!("param{i}"),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DbtSourceRow {
    pub id: i64,
    pub source_name: String,
    pub schema_name: String,
    pub table_name: String,
    pub database_name: Option<String>,
    pub description: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct DbtLineageRow {
    pub id: i64,
    pub source_model: String,
    pub target_model: String,
    pub source_column: String,
    pub target_column: String,
    pub transformation_type: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UpsertLineage {
    pub source_model: String,
    pub target_model: String,
    pub source_column: String,
    pub target_column: String,
    pub transformation_type: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct DbtModelRunRow {
    pub id: i64,
    pub model_name: String,
    pub run_id: String,
    pub status: String,
    pub materialization: String,
    pub compiled_sql: Option<String>,
    pub executed_sql: Option<String>,
    pub rows_affected: i64,
    pub duration_seconds: f64,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ============================================
// Backups
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct BackupRow {
    pub backup_id: i64,
    pub backup_name: String,
    pub db_engine: String,
    pub connection_string: String,
    pub database_name: String,
    pub backup_type: String,
    pub file_path: String,
    pub cron_schedule: Option<String>,
    pub is_scheduled: bool,
    pub status: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: i32,
    pub file_size: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What a BackupRunner reports back
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub success: bool,
    pub file_path: String,
    pub file_size: i64,
    pub error_message: Option<String>,
}

// ============================================
// Runtime config & observability
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct ConfigRow {
    pub key: String,
    pub value: String,
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DataQualityRecord {
    pub schema_name: String,
    pub table_name: String,
    pub db_engine: String,
    pub row_count: i64,
    pub column_count: i32,
    pub null_fraction: Option<f64>,
    pub size_drift_pct: Option<f64>,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct QueryActivitySample {
    pub usename: Option<String>,
    pub application_name: Option<String>,
    pub state: Option<String>,
    pub query_hash: Option<String>,
    pub query_text: Option<String>,
    pub duration_ms: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct QueryPerformanceRecord {
    pub query_hash: String,
    pub query_text: String,
    pub calls: i64,
    pub total_time_ms: f64,
    pub mean_time_ms: f64,
    pub rows_returned: i64,
}

#[derive(Debug, Clone)]
pub struct ApmMetric {
    pub metric_name: String,
    pub metric_value: f64,
    pub tags: Value,
}
