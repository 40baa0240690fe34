// Domain types and pure orchestration logic.
// Everything here is I/O-free: the storage and engine crates depend on this
// crate, never the other way around.

pub mod catalog;
pub mod config;
pub mod conn;
pub mod cron;
pub mod dag;
pub mod engines;
pub mod error;
pub mod expr;
pub mod model;
pub mod workflow;

pub use catalog::CatalogStatus;
pub use config::RuntimeConfig;
pub use conn::ConnectionParams;
pub use cron::CronSchedule;
pub use dag::{TaskGraph, TaskResolution};
pub use engines::{DatabaseEngine, PkStrategy};
pub use error::{CoreError, Result};
pub use model::{
    Materialization, ModelColumn, TestSeverity, TestStatus, TestType, TransformationType,
};
pub use workflow::{
    ConditionType, DependencyType, ExecutionStatus, LoopType, RetryPolicy, RollbackConfig,
    RollbackStatus, SlaConfig, TaskType, TriggerType, Workflow, WorkflowDefinition,
    WorkflowDependency, WorkflowTask,
};
