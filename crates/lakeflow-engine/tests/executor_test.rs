// Workflow executor scenarios against a live catalog. Ignored by default:
//
//   DATABASE_URL=postgres://localhost/lakeflow_test cargo test -- --ignored

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lakeflow_core::{
    DependencyType, ExecutionStatus, RetryPolicy, TaskType, TriggerType, Workflow,
    WorkflowDependency, WorkflowTask,
};
use lakeflow_engine::collaborators::{
    ApiCaller, Collaborators, CustomJobRunner, ModelBuilder, ScriptRunner, SyncRunner,
    TaskContext,
};
use lakeflow_engine::WorkflowExecutor;
use lakeflow_storage::Database;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

async fn test_db() -> Database {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a test database");
    let db = Database::from_url(&url).await.expect("connect");
    db.migrate().await.expect("migrate");
    db
}

fn unique(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

/// Records dispatch times per task and fails the tasks it is told to fail
#[derive(Default)]
struct RecordingRunner {
    starts: Mutex<Vec<(String, DateTime<Utc>)>>,
    fail_always: Vec<String>,
    delay: Option<Duration>,
}

impl RecordingRunner {
    async fn starts(&self) -> Vec<(String, DateTime<Utc>)> {
        self.starts.lock().await.clone()
    }
}

#[async_trait]
impl CustomJobRunner for RecordingRunner {
    async fn run_job(&self, job_name: &str, ctx: &TaskContext) -> Result<Value> {
        self.starts
            .lock()
            .await
            .push((ctx.task_name.clone(), Utc::now()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_always.iter().any(|t| t == &ctx.task_name) {
            bail!("synthetic failure");
        }
        Ok(json!({ "job": job_name, "row_count": 7 }))
    }
}

struct NoopRest;

#[async_trait]
impl ModelBuilder for NoopRest {
    async fn build_model(&self, _name: &str) -> Result<Value> {
        Ok(json!({}))
    }
}
#[async_trait]
impl SyncRunner for NoopRest {
    async fn run_sync(&self, _config: &Value) -> Result<Value> {
        Ok(json!({}))
    }
}
#[async_trait]
impl ApiCaller for NoopRest {
    async fn call(&self, _config: &Value, _ctx: &TaskContext) -> Result<Value> {
        Ok(json!({}))
    }
}
#[async_trait]
impl ScriptRunner for NoopRest {
    async fn run_script(&self, _config: &Value, _ctx: &TaskContext) -> Result<Value> {
        Ok(json!({}))
    }
}

fn executor_with(db: Database, runner: Arc<RecordingRunner>) -> WorkflowExecutor {
    WorkflowExecutor::new(
        db,
        Collaborators {
            custom_jobs: runner,
            models: Arc::new(NoopRest),
            sync: Arc::new(NoopRest),
            api: Arc::new(NoopRest),
            scripts: Arc::new(NoopRest),
        },
    )
}

async fn seed_workflow(
    db: &Database,
    name: &str,
    tasks: &[(&str, RetryPolicy)],
    deps: &[(&str, &str, DependencyType)],
) {
    db.create_workflow(&Workflow::new(name.to_string()))
        .await
        .expect("create workflow");
    for (task_name, retry) in tasks {
        let mut task = WorkflowTask::new(name, *task_name, TaskType::CustomJob, *task_name);
        task.retry_policy = *retry;
        db.upsert_task(&task).await.expect("task");
    }
    for (up, down, dep_type) in deps {
        db.upsert_dependency(&WorkflowDependency {
            workflow_name: name.to_string(),
            upstream_task: up.to_string(),
            downstream_task: down.to_string(),
            dependency_type: *dep_type,
            condition_expression: None,
        })
        .await
        .expect("dependency");
    }
}

fn no_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 0,
        base_delay_seconds: 1,
        backoff_multiplier: 2.0,
    }
}

#[tokio::test]
#[ignore]
async fn diamond_executes_in_dependency_order() {
    let db = test_db().await;
    let name = unique("wf_diamond");
    seed_workflow(
        &db,
        &name,
        &[
            ("a", no_retry()),
            ("b", no_retry()),
            ("c", no_retry()),
            ("d", no_retry()),
        ],
        &[
            ("a", "b", DependencyType::Success),
            ("a", "c", DependencyType::Success),
            ("b", "d", DependencyType::Success),
            ("c", "d", DependencyType::Success),
        ],
    )
    .await;

    let runner = Arc::new(RecordingRunner {
        delay: Some(Duration::from_millis(50)),
        ..RecordingRunner::default()
    });
    let executor = executor_with(db.clone(), runner.clone());
    let execution = executor
        .execute_workflow(&name, TriggerType::Manual)
        .await
        .expect("execute");

    assert_eq!(execution.status, "SUCCESS");
    assert_eq!(execution.completed_tasks, 4);
    assert_eq!(
        execution.completed_tasks + execution.failed_tasks + execution.skipped_tasks,
        execution.total_tasks
    );

    let starts: HashMap<String, DateTime<Utc>> =
        runner.starts().await.into_iter().collect();
    assert!(starts["a"] < starts["b"]);
    assert!(starts["a"] < starts["c"]);
    // d starts only after both b and c terminated
    assert!(starts["d"] > starts["b"]);
    assert!(starts["d"] > starts["c"]);
}

#[tokio::test]
#[ignore]
async fn retry_uses_exponential_backoff() {
    let db = test_db().await;
    let name = unique("wf_retry");
    seed_workflow(
        &db,
        &name,
        &[(
            "flaky",
            RetryPolicy {
                max_retries: 3,
                base_delay_seconds: 1,
                backoff_multiplier: 2.0,
            },
        )],
        &[],
    )
    .await;

    let runner = Arc::new(RecordingRunner {
        fail_always: vec!["flaky".to_string()],
        ..RecordingRunner::default()
    });
    let executor = executor_with(db.clone(), runner.clone());
    let execution = executor
        .execute_workflow(&name, TriggerType::Manual)
        .await
        .expect("execute");

    assert_eq!(execution.status, "FAILED");

    // Exactly 4 attempts at approximate relative offsets 0, 1, 3, 7 seconds
    let starts = runner.starts().await;
    assert_eq!(starts.len(), 4);
    let offsets: Vec<f64> = starts
        .iter()
        .map(|(_, t)| (*t - starts[0].1).num_milliseconds() as f64 / 1000.0)
        .collect();
    for (actual, expected) in offsets.iter().zip([0.0, 1.0, 3.0, 7.0]) {
        assert!(
            (actual - expected).abs() < 0.8,
            "attempt offsets {offsets:?} should approximate [0, 1, 3, 7]"
        );
    }

    let tasks = db
        .list_task_executions(&execution.execution_id)
        .await
        .expect("task executions");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].retry_count, 3);
    assert_eq!(tasks[0].status, "FAILED");
}

#[tokio::test]
#[ignore]
async fn skip_on_failure_propagates_skip() {
    let db = test_db().await;
    let name = unique("wf_skip");
    seed_workflow(
        &db,
        &name,
        &[("a", no_retry()), ("b", no_retry())],
        &[("a", "b", DependencyType::SkipOnFailure)],
    )
    .await;

    let runner = Arc::new(RecordingRunner {
        fail_always: vec!["a".to_string()],
        ..RecordingRunner::default()
    });
    let executor = executor_with(db.clone(), runner.clone());
    let execution = executor
        .execute_workflow(&name, TriggerType::Manual)
        .await
        .expect("execute");

    assert_eq!(execution.status, "FAILED");
    assert_eq!(execution.failed_tasks, 1);
    assert_eq!(execution.skipped_tasks, 1);
    assert_eq!(
        execution.completed_tasks + execution.failed_tasks + execution.skipped_tasks,
        execution.total_tasks
    );

    let tasks = db
        .list_task_executions(&execution.execution_id)
        .await
        .expect("task executions");
    let b = tasks.iter().find(|t| t.task_name == "b").expect("b row");
    assert_eq!(b.status, "SKIPPED");
    // b never dispatched
    assert!(runner.starts().await.iter().all(|(t, _)| t != "b"));
}

#[tokio::test]
#[ignore]
async fn cycle_fails_before_any_task_runs() {
    let db = test_db().await;
    let name = unique("wf_cycle");
    seed_workflow(
        &db,
        &name,
        &[("a", no_retry()), ("b", no_retry())],
        &[
            ("a", "b", DependencyType::Success),
            ("b", "a", DependencyType::Success),
        ],
    )
    .await;

    let runner = Arc::new(RecordingRunner::default());
    let executor = executor_with(db.clone(), runner.clone());
    let execution = executor
        .execute_workflow(&name, TriggerType::Manual)
        .await
        .expect("execute returns the failed row");

    assert_eq!(execution.status, "FAILED");
    assert_eq!(execution.error_message.as_deref(), Some("cycle detected"));
    assert!(runner.starts().await.is_empty(), "no tasks may run");
}

#[tokio::test]
#[ignore]
async fn conditional_task_skips_on_false_expression() {
    let db = test_db().await;
    let name = unique("wf_cond");
    db.create_workflow(&Workflow::new(name.clone())).await.expect("create");

    let producer = WorkflowTask::new(&name, "produce", TaskType::CustomJob, "produce");
    db.upsert_task(&producer).await.expect("task");
    let mut gated = WorkflowTask::new(&name, "gated", TaskType::CustomJob, "gated");
    gated.condition_expression = Some("produce.row_count > 100".to_string());
    db.upsert_task(&gated).await.expect("task");
    db.upsert_dependency(&WorkflowDependency {
        workflow_name: name.clone(),
        upstream_task: "produce".into(),
        downstream_task: "gated".into(),
        dependency_type: DependencyType::Success,
        condition_expression: None,
    })
    .await
    .expect("dependency");

    let runner = Arc::new(RecordingRunner::default());
    let executor = executor_with(db.clone(), runner.clone());
    let execution = executor
        .execute_workflow(&name, TriggerType::Manual)
        .await
        .expect("execute");

    // The producer reports row_count 7, so the gate evaluates false
    assert_eq!(execution.status, "SUCCESS");
    assert_eq!(execution.completed_tasks, 1);
    assert_eq!(execution.skipped_tasks, 1);
    assert!(runner.starts().await.iter().all(|(t, _)| t != "gated"));
}

#[tokio::test]
#[ignore]
async fn inactive_workflow_is_unavailable() {
    let db = test_db().await;
    let name = unique("wf_disabled");
    let mut workflow = Workflow::new(name.clone());
    workflow.enabled = false;
    db.create_workflow(&workflow).await.expect("create");

    let executor = executor_with(db.clone(), Arc::new(RecordingRunner::default()));
    let result = executor.execute_workflow(&name, TriggerType::Manual).await;
    assert!(result.is_err());

    let missing = executor
        .execute_workflow(&unique("wf_ghost"), TriggerType::Manual)
        .await;
    assert!(missing.is_err());
}
