// Event trigger manager: maps workflows to external events and runs the
// file watcher. A changed modification time fires the workflow; paths that
// do not exist yet are tolerated.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use lakeflow_core::{CoreError, TriggerType};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::executor::WorkflowExecutor;

const FILE_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    FileArrival,
    ApiCall,
    DatabaseChange,
    Schedule,
    Manual,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::FileArrival => "FILE_ARRIVAL",
            EventType::ApiCall => "API_CALL",
            EventType::DatabaseChange => "DATABASE_CHANGE",
            EventType::Schedule => "SCHEDULE",
            EventType::Manual => "MANUAL",
        }
    }
}

impl FromStr for EventType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FILE_ARRIVAL" => Ok(EventType::FileArrival),
            "API_CALL" => Ok(EventType::ApiCall),
            "DATABASE_CHANGE" => Ok(EventType::DatabaseChange),
            "SCHEDULE" => Ok(EventType::Schedule),
            "MANUAL" => Ok(EventType::Manual),
            other => Err(CoreError::config(format!("unknown event type: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventTrigger {
    pub workflow_name: String,
    pub event_type: EventType,
    pub event_config: Value,
    pub active: bool,
}

#[derive(Default)]
struct Registry {
    triggers: HashMap<String, EventTrigger>,
    /// file path -> workflow name
    file_watchers: HashMap<String, String>,
    /// file path -> last observed mtime
    file_mtimes: HashMap<String, SystemTime>,
}

#[derive(Clone)]
pub struct EventTriggerManager {
    executor: WorkflowExecutor,
    registry: Arc<Mutex<Registry>>,
}

impl EventTriggerManager {
    pub fn new(executor: WorkflowExecutor) -> Self {
        Self {
            executor,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Duplicate registration by workflow name replaces the prior trigger
    pub async fn register_trigger(&self, trigger: EventTrigger) {
        let mut registry = self.registry.lock().await;
        if let Some(old) = registry.triggers.get(&trigger.workflow_name) {
            if let Some(path) = file_path_of(old) {
                registry.file_watchers.remove(&path);
                registry.file_mtimes.remove(&path);
            }
        }
        if trigger.event_type == EventType::FileArrival {
            match file_path_of(&trigger) {
                Some(path) => {
                    if let Ok(meta) = tokio::fs::metadata(&path).await {
                        if let Ok(mtime) = meta.modified() {
                            registry.file_mtimes.insert(path.clone(), mtime);
                        }
                    }
                    registry
                        .file_watchers
                        .insert(path, trigger.workflow_name.clone());
                }
                None => {
                    warn!(
                        workflow = %trigger.workflow_name,
                        "FILE_ARRIVAL trigger without event_config.file_path"
                    );
                }
            }
        }
        info!(
            workflow = %trigger.workflow_name,
            event = trigger.event_type.as_str(),
            "Registered trigger"
        );
        registry
            .triggers
            .insert(trigger.workflow_name.clone(), trigger);
    }

    pub async fn unregister_trigger(&self, workflow_name: &str) {
        let mut registry = self.registry.lock().await;
        if let Some(trigger) = registry.triggers.remove(workflow_name) {
            if let Some(path) = file_path_of(&trigger) {
                registry.file_watchers.remove(&path);
                registry.file_mtimes.remove(&path);
            }
            info!(workflow = workflow_name, "Unregistered trigger");
        }
    }

    pub async fn triggers(&self) -> Vec<EventTrigger> {
        self.registry.lock().await.triggers.values().cloned().collect()
    }

    /// Fire a workflow for an externally observed event (API call, database
    /// change). Only active triggers of the matching type launch.
    pub async fn trigger_workflow(&self, workflow_name: &str, event_type: EventType) {
        let registry = self.registry.lock().await;
        let Some(trigger) = registry.triggers.get(workflow_name) else {
            return;
        };
        if trigger.active && trigger.event_type == event_type {
            info!(
                workflow = workflow_name,
                event = event_type.as_str(),
                "Event fired workflow"
            );
            self.executor
                .execute_workflow_async(workflow_name, TriggerType::Event);
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Event trigger manager started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(FILE_POLL_INTERVAL) => {
                    if let Err(e) = self.check_file_changes().await {
                        error!(error = %e, "File watcher cycle failed");
                    }
                }
            }
        }
        info!("Event trigger manager stopped");
    }

    async fn check_file_changes(&self) -> anyhow::Result<()> {
        let watched: Vec<(String, String)> = {
            let registry = self.registry.lock().await;
            registry
                .file_watchers
                .iter()
                .map(|(p, w)| (p.clone(), w.clone()))
                .collect()
        };

        for (path, workflow_name) in watched {
            let Ok(meta) = tokio::fs::metadata(&path).await else {
                // Not there yet; keep watching
                continue;
            };
            let Ok(mtime) = meta.modified() else {
                continue;
            };

            let changed = {
                let mut registry = self.registry.lock().await;
                let changed = registry.file_mtimes.get(&path) != Some(&mtime);
                registry.file_mtimes.insert(path.clone(), mtime);
                changed && registry
                    .triggers
                    .get(&workflow_name)
                    .is_some_and(|t| t.active)
            };
            if changed {
                info!(file = %path, workflow = %workflow_name, "File changed, firing workflow");
                self.executor
                    .execute_workflow_async(&workflow_name, TriggerType::Event);
            }
        }
        Ok(())
    }
}

fn file_path_of(trigger: &EventTrigger) -> Option<String> {
    trigger
        .event_config
        .get("file_path")
        .and_then(Value::as_str)
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips() {
        for t in [
            EventType::FileArrival,
            EventType::ApiCall,
            EventType::DatabaseChange,
            EventType::Schedule,
            EventType::Manual,
        ] {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
        }
    }

    #[test]
    fn file_path_extraction() {
        let trigger = EventTrigger {
            workflow_name: "wf".into(),
            event_type: EventType::FileArrival,
            event_config: serde_json::json!({"file_path": "/data/in.csv"}),
            active: true,
        };
        assert_eq!(file_path_of(&trigger).as_deref(), Some("/data/in.csv"));
    }
}
