// Data-driven scheduler: polls registered source queries every 30 s and
// launches the workflow when the predicate holds.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use lakeflow_core::{DatabaseEngine, TriggerType};
use serde_json::{Map, Value};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::executor::WorkflowExecutor;
use crate::sources::SourceRegistry;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DataDrivenSchedule {
    pub workflow_name: String,
    pub query: String,
    pub connection_string: String,
    pub db_engine: DatabaseEngine,
    pub predicate_field: Option<String>,
    pub predicate_value: Option<String>,
    pub check_interval_seconds: u64,
    pub active: bool,
}

#[derive(Clone)]
pub struct DataDrivenScheduler {
    executor: WorkflowExecutor,
    sources: Arc<SourceRegistry>,
    schedules: Arc<Mutex<Vec<DataDrivenSchedule>>>,
}

impl DataDrivenScheduler {
    pub fn new(executor: WorkflowExecutor, sources: Arc<SourceRegistry>) -> Self {
        Self {
            executor,
            sources,
            schedules: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registration by workflow name replaces any prior schedule
    pub async fn register_schedule(&self, schedule: DataDrivenSchedule) {
        let mut schedules = self.schedules.lock().await;
        info!(workflow = %schedule.workflow_name, "Registered data-driven schedule");
        if let Some(existing) = schedules
            .iter_mut()
            .find(|s| s.workflow_name == schedule.workflow_name)
        {
            *existing = schedule;
        } else {
            schedules.push(schedule);
        }
    }

    pub async fn unregister_schedule(&self, workflow_name: &str) {
        self.schedules
            .lock()
            .await
            .retain(|s| s.workflow_name != workflow_name);
    }

    pub async fn schedules(&self) -> Vec<DataDrivenSchedule> {
        self.schedules.lock().await.clone()
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Data-driven scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(CHECK_INTERVAL) => self.check_all().await,
            }
        }
        info!("Data-driven scheduler stopped");
    }

    async fn check_all(&self) {
        let active: Vec<DataDrivenSchedule> = {
            let schedules = self.schedules.lock().await;
            schedules.iter().filter(|s| s.active).cloned().collect()
        };
        for schedule in active {
            match self.check_schedule(&schedule).await {
                Ok(true) => {
                    info!(
                        workflow = %schedule.workflow_name,
                        "Data-driven condition met, executing workflow"
                    );
                    self.executor
                        .execute_workflow_async(&schedule.workflow_name, TriggerType::Scheduled);
                }
                Ok(false) => {}
                Err(e) => {
                    error!(
                        workflow = %schedule.workflow_name,
                        error = %e,
                        "Data-driven check failed"
                    );
                }
            }
        }
    }

    async fn check_schedule(&self, schedule: &DataDrivenSchedule) -> Result<bool> {
        let Some(client) = self
            .sources
            .connect(schedule.db_engine, &schedule.connection_string)
            .await?
        else {
            warn!(
                workflow = %schedule.workflow_name,
                engine = %schedule.db_engine,
                "No source driver registered for data-driven check"
            );
            return Ok(false);
        };
        let rows = client.query(&schedule.query).await?;
        Ok(predicate_holds(
            &rows,
            schedule.predicate_field.as_deref(),
            schedule.predicate_value.as_deref(),
        ))
    }
}

/// With a predicate: at least one row whose field equals the value.
/// Without: any row at all.
fn predicate_holds(
    rows: &[Map<String, Value>],
    field: Option<&str>,
    value: Option<&str>,
) -> bool {
    match (field, value) {
        (Some(field), Some(value)) => rows.iter().any(|row| {
            row.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(field))
                .is_some_and(|(_, v)| match v {
                    Value::String(s) => s == value,
                    Value::Number(n) => n.to_string() == value,
                    Value::Bool(b) => b.to_string() == value,
                    _ => false,
                })
        }),
        _ => !rows.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(values: &[Value]) -> Vec<Map<String, Value>> {
        values
            .iter()
            .map(|v| {
                let mut m = Map::new();
                m.insert("ready".to_string(), v.clone());
                m
            })
            .collect()
    }

    #[test]
    fn no_predicate_fires_on_any_row() {
        assert!(predicate_holds(&rows(&[json!("x")]), None, None));
        assert!(!predicate_holds(&[], None, None));
    }

    #[test]
    fn predicate_compares_field_value() {
        let data = rows(&[json!("no"), json!("yes")]);
        assert!(predicate_holds(&data, Some("ready"), Some("yes")));
        assert!(!predicate_holds(&data, Some("ready"), Some("maybe")));
        assert!(!predicate_holds(&data, Some("missing"), Some("yes")));
    }

    #[test]
    fn predicate_handles_numeric_and_bool_columns() {
        let data = rows(&[json!(1), json!(true)]);
        assert!(predicate_holds(&data, Some("ready"), Some("1")));
        assert!(predicate_holds(&data, Some("READY"), Some("true")));
    }
}
