// Workflow domain model: tasks, dependencies, policies, statuses.
// Serialized forms match the catalog's string columns (SCREAMING_SNAKE_CASE
// for statuses and type tags), so FromRow structs can convert losslessly.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// What a task node invokes when dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    CustomJob,
    DataWarehouse,
    DataVault,
    Sync,
    ApiCall,
    Script,
    SubWorkflow,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::CustomJob => "CUSTOM_JOB",
            TaskType::DataWarehouse => "DATA_WAREHOUSE",
            TaskType::DataVault => "DATA_VAULT",
            TaskType::Sync => "SYNC",
            TaskType::ApiCall => "API_CALL",
            TaskType::Script => "SCRIPT",
            TaskType::SubWorkflow => "SUB_WORKFLOW",
        }
    }
}

impl FromStr for TaskType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CUSTOM_JOB" => Ok(TaskType::CustomJob),
            "DATA_WAREHOUSE" => Ok(TaskType::DataWarehouse),
            "DATA_VAULT" => Ok(TaskType::DataVault),
            "SYNC" => Ok(TaskType::Sync),
            "API_CALL" => Ok(TaskType::ApiCall),
            "SCRIPT" => Ok(TaskType::Script),
            "SUB_WORKFLOW" => Ok(TaskType::SubWorkflow),
            other => Err(CoreError::config(format!("unknown task type: {other}"))),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conditional gating applied before a task is dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionType {
    #[default]
    Always,
    If,
    Else,
    ElseIf,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Always => "ALWAYS",
            ConditionType::If => "IF",
            ConditionType::Else => "ELSE",
            ConditionType::ElseIf => "ELSE_IF",
        }
    }
}

impl FromStr for ConditionType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ALWAYS" => Ok(ConditionType::Always),
            "IF" => Ok(ConditionType::If),
            "ELSE" => Ok(ConditionType::Else),
            "ELSE_IF" => Ok(ConditionType::ElseIf),
            other => Err(CoreError::config(format!("unknown condition type: {other}"))),
        }
    }
}

/// Iteration style for loop tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopType {
    For,
    While,
    Foreach,
}

impl LoopType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopType::For => "FOR",
            LoopType::While => "WHILE",
            LoopType::Foreach => "FOREACH",
        }
    }
}

impl FromStr for LoopType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FOR" => Ok(LoopType::For),
            "WHILE" => Ok(LoopType::While),
            "FOREACH" => Ok(LoopType::Foreach),
            other => Err(CoreError::config(format!("unknown loop type: {other}"))),
        }
    }
}

/// Edge semantics between an upstream and a downstream task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyType {
    #[default]
    Success,
    Completion,
    SkipOnFailure,
}

impl DependencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyType::Success => "SUCCESS",
            DependencyType::Completion => "COMPLETION",
            DependencyType::SkipOnFailure => "SKIP_ON_FAILURE",
        }
    }
}

impl FromStr for DependencyType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(DependencyType::Success),
            "COMPLETION" => Ok(DependencyType::Completion),
            "SKIP_ON_FAILURE" => Ok(DependencyType::SkipOnFailure),
            other => Err(CoreError::config(format!(
                "unknown dependency type: {other}"
            ))),
        }
    }
}

/// Status of a workflow or task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Skipped,
    Retrying,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
            ExecutionStatus::Skipped => "SKIPPED",
            ExecutionStatus::Retrying => "RETRYING",
        }
    }

    /// Terminal statuses never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Skipped
        )
    }
}

impl FromStr for ExecutionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ExecutionStatus::Pending),
            "RUNNING" => Ok(ExecutionStatus::Running),
            "SUCCESS" => Ok(ExecutionStatus::Success),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "CANCELLED" => Ok(ExecutionStatus::Cancelled),
            "SKIPPED" => Ok(ExecutionStatus::Skipped),
            "RETRYING" => Ok(ExecutionStatus::Retrying),
            other => Err(CoreError::config(format!("unknown status: {other}"))),
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an execution was launched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    Scheduled,
    Manual,
    Api,
    Event,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Scheduled => "SCHEDULED",
            TriggerType::Manual => "MANUAL",
            TriggerType::Api => "API",
            TriggerType::Event => "EVENT",
        }
    }
}

impl FromStr for TriggerType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(TriggerType::Scheduled),
            "MANUAL" => Ok(TriggerType::Manual),
            "API" => Ok(TriggerType::Api),
            "EVENT" => Ok(TriggerType::Event),
            other => Err(CoreError::config(format!("unknown trigger type: {other}"))),
        }
    }
}

/// Rollback progress recorded on the execution row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl RollbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackStatus::Pending => "PENDING",
            RollbackStatus::InProgress => "IN_PROGRESS",
            RollbackStatus::Completed => "COMPLETED",
            RollbackStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for RollbackStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RollbackStatus::Pending),
            "IN_PROGRESS" => Ok(RollbackStatus::InProgress),
            "COMPLETED" => Ok(RollbackStatus::Completed),
            "FAILED" => Ok(RollbackStatus::Failed),
            other => Err(CoreError::config(format!(
                "unknown rollback status: {other}"
            ))),
        }
    }
}

/// Retry policy applied per task (workflow-level acts as the default)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_seconds: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay_seconds: 60,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry_count + 1`: base * multiplier^retry_count
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let secs =
            (self.base_delay_seconds as f64) * self.backoff_multiplier.powi(retry_count as i32);
        // Cap at one hour so a runaway multiplier cannot park a worker for days
        Duration::from_secs_f64(secs.clamp(0.0, 3600.0))
    }

    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

/// SLA enforcement settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaConfig {
    pub max_execution_time_seconds: i64,
    pub alert_on_breach: bool,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            max_execution_time_seconds: 0,
            alert_on_breach: false,
        }
    }
}

impl SlaConfig {
    /// A max of zero disables the check
    pub fn is_breached(&self, duration_seconds: i64) -> bool {
        self.max_execution_time_seconds > 0 && duration_seconds > self.max_execution_time_seconds
    }
}

/// Rollback settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackConfig {
    pub enabled: bool,
    pub on_failure: bool,
    pub on_timeout: bool,
    pub max_rollback_depth: u32,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            on_failure: true,
            on_timeout: false,
            max_rollback_depth: 10,
        }
    }
}

/// A named DAG of tasks with retry/SLA/rollback policies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub description: Option<String>,
    pub schedule_cron: Option<String>,
    pub active: bool,
    pub enabled: bool,
    pub retry_policy: RetryPolicy,
    pub sla_config: SlaConfig,
    pub rollback_config: RollbackConfig,
    pub metadata: Value,
    pub last_execution_time: Option<DateTime<Utc>>,
    pub last_execution_status: Option<String>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            schedule_cron: None,
            active: true,
            enabled: true,
            retry_policy: RetryPolicy::default(),
            sla_config: SlaConfig::default(),
            rollback_config: RollbackConfig::default(),
            metadata: Value::Null,
            last_execution_time: None,
            last_execution_status: None,
        }
    }
}

/// A single node in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub workflow_name: String,
    pub task_name: String,
    pub task_type: TaskType,
    pub task_reference: String,
    pub task_config: Value,
    pub retry_policy: RetryPolicy,
    pub priority: i32,
    pub condition_type: ConditionType,
    pub condition_expression: Option<String>,
    pub loop_type: Option<LoopType>,
    pub loop_config: Value,
}

impl WorkflowTask {
    pub fn new(
        workflow_name: impl Into<String>,
        task_name: impl Into<String>,
        task_type: TaskType,
        task_reference: impl Into<String>,
    ) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            task_name: task_name.into(),
            task_type,
            task_reference: task_reference.into(),
            task_config: Value::Null,
            retry_policy: RetryPolicy::default(),
            priority: 0,
            condition_type: ConditionType::Always,
            condition_expression: None,
            loop_type: None,
            loop_config: Value::Null,
        }
    }

    /// Compensating action declared under task_config.rollback, if any
    pub fn rollback_action(&self) -> Option<&Value> {
        self.task_config.get("rollback").filter(|v| !v.is_null())
    }
}

/// A directed edge between two tasks of the same workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDependency {
    pub workflow_name: String,
    pub upstream_task: String,
    pub downstream_task: String,
    pub dependency_type: DependencyType,
    pub condition_expression: Option<String>,
}

/// A workflow loaded with its full task and dependency set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow: Workflow,
    pub tasks: Vec<WorkflowTask>,
    pub dependencies: Vec<WorkflowDependency>,
}

impl WorkflowDefinition {
    pub fn task(&self, name: &str) -> Option<&WorkflowTask> {
        self.tasks.iter().find(|t| t.task_name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
            ExecutionStatus::Skipped,
            ExecutionStatus::Retrying,
        ] {
            assert_eq!(s.as_str().parse::<ExecutionStatus>().unwrap(), s);
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Skipped.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Retrying.is_terminal());
        assert!(!ExecutionStatus::Pending.is_terminal());
    }

    #[test]
    fn retry_delay_is_exponential() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay_seconds: 1,
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn retry_delay_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay_seconds: 600,
            backoff_multiplier: 10.0,
        };
        assert_eq!(policy.delay_for(5), Duration::from_secs(3600));
    }

    #[test]
    fn sla_zero_disables_check() {
        let sla = SlaConfig::default();
        assert!(!sla.is_breached(999_999));
        let sla = SlaConfig {
            max_execution_time_seconds: 10,
            alert_on_breach: true,
        };
        assert!(sla.is_breached(11));
        assert!(!sla.is_breached(10));
    }

    #[test]
    fn rollback_action_requires_non_null_config() {
        let mut task = WorkflowTask::new("wf", "t", TaskType::CustomJob, "job");
        assert!(task.rollback_action().is_none());
        task.task_config = serde_json::json!({"rollback": {"type": "CUSTOM_JOB", "reference": "undo"}});
        assert!(task.rollback_action().is_some());
    }
}
