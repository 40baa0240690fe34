// Postgres catalog layer with sqlx.
// One `Database` value wraps the pool; repository methods are grouped into
// one module per catalog area, all as `impl Database` blocks.

pub mod backups;
pub mod catalog_entries;
pub mod db;
pub mod dbt;
pub mod executions;
pub mod jobs;
pub mod lock;
pub mod models;
pub mod observability;
pub mod runtime_config;
pub mod versions;
pub mod workflows;

pub use db::Database;
pub use lock::{CatalogLock, LockAcquisition};
pub use models::*;
