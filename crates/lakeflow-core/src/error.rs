// Error types shared across the kernel

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the orchestration core
#[derive(Debug, Error)]
pub enum CoreError {
    /// A named entity does not exist in the catalog
    #[error("not found: {0}")]
    NotFound(String),

    /// Entity exists but is inactive or disabled
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The workflow dependency graph contains a cycle
    #[error("cycle detected in workflow {0}")]
    CycleDetected(String),

    /// No task is ready yet some remain unfinished
    #[error("deadlock: no tasks can be executed")]
    Deadlock,

    /// A named lock could not be acquired within the wait budget
    #[error("lock timeout: {0}")]
    LockTimeout(String),

    /// Invalid cron expression
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid connection string
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// Invalid condition expression
    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    /// Invalid configuration value or contract violation at construction
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CoreError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        CoreError::NotFound(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        CoreError::Unavailable(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        CoreError::Configuration(msg.into())
    }
}
