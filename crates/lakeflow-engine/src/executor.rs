// Workflow executor: runs a workflow's DAG under its retry/SLA/rollback
// policies. Each scheduling round launches the whole ready cohort
// concurrently and waits for it before recomputing readiness; per-task
// retry happens inside the task run so an execution round owns its tasks
// start to finish.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::future::join_all;
use lakeflow_core::{
    expr, CoreError, ExecutionStatus, LoopType, RollbackStatus, TaskGraph, TaskType, TriggerType,
    WorkflowDefinition, WorkflowTask,
};
use lakeflow_storage::{
    CreateWorkflowExecution, Database, FinishTaskExecution, WorkflowExecutionRow,
};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::collaborators::{Collaborators, TaskContext};

/// A mis-configured self-referencing SUB_WORKFLOW must not recurse forever
const MAX_SUB_WORKFLOW_DEPTH: usize = 8;
/// Default bound for WHILE loops without an explicit max_iterations
const DEFAULT_WHILE_BOUND: u64 = 100;

#[derive(Clone)]
pub struct WorkflowExecutor {
    db: Database,
    collaborators: Collaborators,
}

struct ExecState {
    statuses: Vec<Option<ExecutionStatus>>,
    outputs: Map<String, Value>,
    first_error: Option<String>,
}

impl WorkflowExecutor {
    pub fn new(db: Database, collaborators: Collaborators) -> Self {
        Self { db, collaborators }
    }

    /// Run the workflow to completion and return its persisted execution row.
    pub async fn execute_workflow(
        &self,
        workflow_name: &str,
        trigger: TriggerType,
    ) -> Result<WorkflowExecutionRow> {
        self.execute_inner(workflow_name, trigger, 0).await
    }

    /// Fire-and-forget variant; all state is observable via the repository.
    pub fn execute_workflow_async(&self, workflow_name: &str, trigger: TriggerType) {
        let executor = self.clone();
        let name = workflow_name.to_string();
        tokio::spawn(async move {
            if let Err(e) = executor.execute_inner(&name, trigger, 0).await {
                error!(workflow = %name, error = %e, "Async workflow execution failed");
            }
        });
    }

    async fn execute_inner(
        &self,
        workflow_name: &str,
        trigger: TriggerType,
        depth: usize,
    ) -> Result<WorkflowExecutionRow> {
        if depth > MAX_SUB_WORKFLOW_DEPTH {
            return Err(anyhow!(CoreError::config(format!(
                "sub-workflow nesting exceeds {MAX_SUB_WORKFLOW_DEPTH}: {workflow_name}"
            ))));
        }

        let definition = self
            .db
            .load_definition(workflow_name)
            .await?
            .ok_or_else(|| anyhow!(CoreError::not_found(format!("workflow: {workflow_name}"))))?;
        if !definition.workflow.active || !definition.workflow.enabled {
            return Err(anyhow!(CoreError::unavailable(format!(
                "workflow is not active or enabled: {workflow_name}"
            ))));
        }

        let execution_id = Database::generate_execution_id();
        let row = self
            .db
            .create_workflow_execution(CreateWorkflowExecution {
                execution_id: execution_id.clone(),
                workflow_name: workflow_name.to_string(),
                trigger_type: trigger,
                total_tasks: definition.tasks.len() as i32,
            })
            .await?;
        info!(
            workflow = workflow_name,
            execution = %execution_id,
            trigger = trigger.as_str(),
            tasks = definition.tasks.len(),
            "Starting workflow execution"
        );

        // Validate the graph before any task runs
        let graph = match TaskGraph::build(&definition.tasks, &definition.dependencies)
            .and_then(|g| g.validate_acyclic(workflow_name).map(|_| g))
        {
            Ok(graph) => graph,
            Err(e) => {
                let message = match &e {
                    CoreError::CycleDetected(_) => "cycle detected".to_string(),
                    other => other.to_string(),
                };
                return self
                    .finalize(&row.execution_id, workflow_name, ExecutionStatus::Failed, Some(&message))
                    .await;
            }
        };

        let state = Arc::new(Mutex::new(ExecState {
            statuses: vec![None; graph.len()],
            outputs: Map::new(),
            first_error: None,
        }));

        let mut deadlock = false;
        loop {
            let snapshot = {
                let guard = state.lock().await;
                guard.statuses.clone()
            };
            if snapshot.iter().all(|s| s.is_some()) {
                break;
            }

            let (ready, to_skip) = graph.ready_cohort(&snapshot);

            for node in &to_skip {
                self.mark_skipped(&definition, &graph, *node, &execution_id, &state)
                    .await;
            }

            if ready.is_empty() {
                if to_skip.is_empty() {
                    // Unreachable for acyclic graphs; kept as a safety net
                    deadlock = true;
                    self.cancel_remaining(&definition, &graph, &execution_id, &state)
                        .await;
                    break;
                }
                continue;
            }

            // Launch the whole cohort and wait for it before recomputing
            join_all(ready.iter().map(|&node| {
                self.run_task(&definition, &graph, node, &execution_id, trigger, depth, &state)
            }))
            .await;
        }

        let (status, message) = {
            let guard = state.lock().await;
            if deadlock {
                (ExecutionStatus::Failed, Some("deadlock".to_string()))
            } else if guard
                .statuses
                .iter()
                .any(|s| matches!(s, Some(ExecutionStatus::Failed | ExecutionStatus::Cancelled)))
            {
                (ExecutionStatus::Failed, guard.first_error.clone())
            } else {
                (ExecutionStatus::Success, None)
            }
        };

        let finished = self
            .finalize(&execution_id, workflow_name, status, message.as_deref())
            .await?;

        let sla_breached = self.check_sla(&definition, &finished).await;
        let rollback_wanted = definition.workflow.rollback_config.enabled
            && ((status == ExecutionStatus::Failed && definition.workflow.rollback_config.on_failure)
                || (sla_breached && definition.workflow.rollback_config.on_timeout));
        if rollback_wanted {
            self.rollback(&definition, &graph, &execution_id, &state).await;
        }

        self.db
            .get_workflow_execution(&execution_id)
            .await?
            .context("execution row vanished")
    }

    async fn finalize(
        &self,
        execution_id: &str,
        workflow_name: &str,
        status: ExecutionStatus,
        message: Option<&str>,
    ) -> Result<WorkflowExecutionRow> {
        self.db
            .finish_workflow_execution(execution_id, status, message)
            .await?;
        self.db
            .update_last_execution(workflow_name, Utc::now(), status.as_str())
            .await?;
        if let Err(e) = self
            .db
            .log_process(
                execution_id,
                "workflow_executor",
                "execute_workflow",
                status.as_str(),
                message,
            )
            .await
        {
            warn!(error = %e, "Failed to write process log");
        }
        self.db
            .get_workflow_execution(execution_id)
            .await?
            .context("execution row vanished")
    }

    async fn check_sla(
        &self,
        definition: &WorkflowDefinition,
        execution: &WorkflowExecutionRow,
    ) -> bool {
        let sla = definition.workflow.sla_config;
        let duration = execution.duration_seconds.unwrap_or(0);
        if !sla.is_breached(duration) {
            return false;
        }
        if sla.alert_on_breach {
            warn!(
                workflow = %execution.workflow_name,
                execution = %execution.execution_id,
                duration_seconds = duration,
                max_seconds = sla.max_execution_time_seconds,
                "SLA breach detected"
            );
            let _ = self
                .db
                .log_process(
                    &execution.execution_id,
                    "workflow_executor",
                    "sla_check",
                    "breach",
                    Some(&format!(
                        "duration {duration}s exceeded {}s",
                        sla.max_execution_time_seconds
                    )),
                )
                .await;
        }
        true
    }

    async fn mark_skipped(
        &self,
        definition: &WorkflowDefinition,
        graph: &TaskGraph,
        node: usize,
        execution_id: &str,
        state: &Arc<Mutex<ExecState>>,
    ) {
        let task = &definition.tasks[node];
        if let Err(e) = self
            .db
            .record_skipped_task(execution_id, &task.workflow_name, &task.task_name)
            .await
        {
            warn!(task = %task.task_name, error = %e, "Failed to record skipped task");
        }
        let _ = self
            .db
            .bump_execution_counter(execution_id, ExecutionStatus::Skipped)
            .await;
        let mut guard = state.lock().await;
        guard.statuses[node] = Some(ExecutionStatus::Skipped);
        drop(guard);
        info!(task = %graph.name(node), "Task skipped by dependency resolution");
    }

    /// Deadlock safety net: resolve whatever never became runnable
    async fn cancel_remaining(
        &self,
        definition: &WorkflowDefinition,
        _graph: &TaskGraph,
        execution_id: &str,
        state: &Arc<Mutex<ExecState>>,
    ) {
        let unfinished: Vec<usize> = {
            let guard = state.lock().await;
            (0..guard.statuses.len())
                .filter(|&n| guard.statuses[n].is_none())
                .collect()
        };
        for node in unfinished {
            let task = &definition.tasks[node];
            let id = self
                .db
                .start_task_execution(execution_id, &task.workflow_name, &task.task_name)
                .await;
            if let Ok(id) = id {
                let _ = self
                    .db
                    .finish_task_execution(
                        id,
                        FinishTaskExecution {
                            status: ExecutionStatus::Cancelled,
                            retry_count: 0,
                            error_message: Some("deadlock".to_string()),
                            task_output: Value::Null,
                        },
                    )
                    .await;
            }
            let _ = self
                .db
                .bump_execution_counter(execution_id, ExecutionStatus::Cancelled)
                .await;
            let mut guard = state.lock().await;
            guard.statuses[node] = Some(ExecutionStatus::Cancelled);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_task(
        &self,
        definition: &WorkflowDefinition,
        graph: &TaskGraph,
        node: usize,
        execution_id: &str,
        trigger: TriggerType,
        depth: usize,
        state: &Arc<Mutex<ExecState>>,
    ) {
        let task = &definition.tasks[node];
        let outputs_snapshot = {
            let guard = state.lock().await;
            guard.outputs.clone()
        };

        // Conditional gating happens before any execution row exists
        if let Some(expr_text) = &task.condition_expression {
            match expr::evaluate(expr_text, &outputs_snapshot) {
                Ok(true) => {}
                Ok(false) => {
                    self.mark_skipped(definition, graph, node, execution_id, state)
                        .await;
                    return;
                }
                Err(e) => {
                    self.record_task_outcome(
                        node,
                        task,
                        execution_id,
                        None,
                        ExecutionStatus::Failed,
                        0,
                        Some(format!("condition error: {e}")),
                        Value::Null,
                        state,
                    )
                    .await;
                    return;
                }
            }
        }

        let task_execution_id = match self
            .db
            .start_task_execution(execution_id, &task.workflow_name, &task.task_name)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                error!(task = %task.task_name, error = %e, "Failed to create task execution row");
                self.record_task_outcome(
                    node,
                    task,
                    execution_id,
                    None,
                    ExecutionStatus::Failed,
                    0,
                    Some(format!("task bookkeeping failed: {e}")),
                    Value::Null,
                    state,
                )
                .await;
                return;
            }
        };

        let mut retry_count: u32 = 0;
        let outcome = self
            .run_task_body(
                task,
                execution_id,
                trigger,
                depth,
                task_execution_id,
                &outputs_snapshot,
                &mut retry_count,
            )
            .await;

        let (status, error_message, output) = match outcome {
            Ok(output) => (ExecutionStatus::Success, None, output),
            Err((message, partial)) => (ExecutionStatus::Failed, Some(message), partial),
        };
        self.record_task_outcome(
            node,
            task,
            execution_id,
            Some(task_execution_id),
            status,
            retry_count as i32,
            error_message,
            output,
            state,
        )
        .await;
    }

    /// Run the task body honoring the loop protocol. On failure returns the
    /// error plus whatever partial loop output accumulated.
    async fn run_task_body(
        &self,
        task: &WorkflowTask,
        execution_id: &str,
        trigger: TriggerType,
        depth: usize,
        task_execution_id: i64,
        outputs: &Map<String, Value>,
        retry_count: &mut u32,
    ) -> std::result::Result<Value, (String, Value)> {
        let base_ctx = TaskContext {
            execution_id: execution_id.to_string(),
            workflow_name: task.workflow_name.clone(),
            task_name: task.task_name.clone(),
            outputs: outputs.clone(),
            loop_item: None,
            loop_index: None,
        };

        let Some(loop_type) = task.loop_type else {
            return self
                .attempt_with_retry(task, trigger, depth, task_execution_id, &base_ctx, retry_count)
                .await
                .map_err(|e| (e, Value::Null));
        };

        let mut accumulated: Vec<Value> = Vec::new();
        match loop_type {
            LoopType::For => {
                let iterations = task
                    .loop_config
                    .get("iterations")
                    .and_then(Value::as_u64)
                    .unwrap_or(1);
                for index in 0..iterations {
                    let ctx = TaskContext {
                        loop_index: Some(index as usize),
                        ..base_ctx.clone()
                    };
                    match self
                        .attempt_with_retry(task, trigger, depth, task_execution_id, &ctx, retry_count)
                        .await
                    {
                        Ok(value) => accumulated.push(value),
                        Err(e) => return Err((e, Value::Array(accumulated))),
                    }
                }
            }
            LoopType::Foreach => {
                let items = task
                    .loop_config
                    .get("items")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for (index, item) in items.into_iter().enumerate() {
                    let ctx = TaskContext {
                        loop_item: Some(item),
                        loop_index: Some(index),
                        ..base_ctx.clone()
                    };
                    match self
                        .attempt_with_retry(task, trigger, depth, task_execution_id, &ctx, retry_count)
                        .await
                    {
                        Ok(value) => accumulated.push(value),
                        Err(e) => return Err((e, Value::Array(accumulated))),
                    }
                }
            }
            LoopType::While => {
                let condition = task
                    .loop_config
                    .get("condition")
                    .and_then(Value::as_str)
                    .map(String::from);
                let bound = task
                    .loop_config
                    .get("max_iterations")
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_WHILE_BOUND);
                for index in 0..bound {
                    if let Some(condition) = &condition {
                        // The loop's own partial output is visible to its condition
                        let mut scope = outputs.clone();
                        scope.insert(
                            task.task_name.clone(),
                            Value::Array(accumulated.clone()),
                        );
                        match expr::evaluate(condition, &scope) {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => {
                                return Err((
                                    format!("while condition error: {e}"),
                                    Value::Array(accumulated),
                                ))
                            }
                        }
                    }
                    let ctx = TaskContext {
                        loop_index: Some(index as usize),
                        ..base_ctx.clone()
                    };
                    match self
                        .attempt_with_retry(task, trigger, depth, task_execution_id, &ctx, retry_count)
                        .await
                    {
                        Ok(value) => accumulated.push(value),
                        Err(e) => return Err((e, Value::Array(accumulated))),
                    }
                }
            }
        }
        Ok(Value::Array(accumulated))
    }

    /// Dispatch one attempt, retrying with exponential backoff per the
    /// task's policy. No task dispatches more than max_retries + 1 times.
    async fn attempt_with_retry(
        &self,
        task: &WorkflowTask,
        trigger: TriggerType,
        depth: usize,
        task_execution_id: i64,
        ctx: &TaskContext,
        retry_count: &mut u32,
    ) -> std::result::Result<Value, String> {
        loop {
            match self.dispatch(task, trigger, depth, ctx).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !task.retry_policy.should_retry(*retry_count) {
                        return Err(format!("task {} failed: {e:#}", task.task_name));
                    }
                    let delay = task.retry_policy.delay_for(*retry_count);
                    warn!(
                        task = %task.task_name,
                        retry = *retry_count + 1,
                        delay_secs = delay.as_secs_f64(),
                        error = %e,
                        "Task attempt failed, retrying"
                    );
                    *retry_count += 1;
                    let _ = self
                        .db
                        .update_task_execution_status(
                            task_execution_id,
                            ExecutionStatus::Retrying,
                            *retry_count as i32,
                        )
                        .await;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn dispatch(
        &self,
        task: &WorkflowTask,
        trigger: TriggerType,
        depth: usize,
        ctx: &TaskContext,
    ) -> Result<Value> {
        match task.task_type {
            TaskType::CustomJob => {
                self.collaborators
                    .custom_jobs
                    .run_job(&task.task_reference, ctx)
                    .await
            }
            TaskType::DataWarehouse | TaskType::DataVault => {
                self.collaborators
                    .models
                    .build_model(&task.task_reference)
                    .await
            }
            TaskType::Sync => self.collaborators.sync.run_sync(&task.task_config).await,
            TaskType::ApiCall => self.collaborators.api.call(&task.task_config, ctx).await,
            TaskType::Script => {
                self.collaborators
                    .scripts
                    .run_script(&task.task_config, ctx)
                    .await
            }
            TaskType::SubWorkflow => {
                let child = self
                    .execute_sub_workflow(task.task_reference.clone(), trigger, depth + 1)
                    .await?;
                let child_status = child.status()?;
                let output = json!({
                    "execution_id": child.execution_id,
                    "status": child_status.as_str(),
                });
                if child_status == ExecutionStatus::Success {
                    Ok(output)
                } else {
                    Err(anyhow!(
                        "sub-workflow {} finished {}",
                        task.task_reference,
                        child_status
                    ))
                }
            }
        }
    }

    /// Boxed indirection so the recursive future type stays finite
    fn execute_sub_workflow(
        &self,
        name: String,
        trigger: TriggerType,
        depth: usize,
    ) -> futures::future::BoxFuture<'_, Result<WorkflowExecutionRow>> {
        Box::pin(async move { self.execute_inner(&name, trigger, depth).await })
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_task_outcome(
        &self,
        node: usize,
        task: &WorkflowTask,
        execution_id: &str,
        task_execution_id: Option<i64>,
        status: ExecutionStatus,
        retry_count: i32,
        error_message: Option<String>,
        output: Value,
        state: &Arc<Mutex<ExecState>>,
    ) {
        if let Some(id) = task_execution_id {
            if let Err(e) = self
                .db
                .finish_task_execution(
                    id,
                    FinishTaskExecution {
                        status,
                        retry_count,
                        error_message: error_message.clone(),
                        task_output: output.clone(),
                    },
                )
                .await
            {
                warn!(task = %task.task_name, error = %e, "Failed to persist task outcome");
            }
        }
        if let Err(e) = self.db.bump_execution_counter(execution_id, status).await {
            warn!(task = %task.task_name, error = %e, "Failed to bump execution counter");
        }

        let mut guard = state.lock().await;
        guard.statuses[node] = Some(status);
        guard
            .outputs
            .insert(task.task_name.clone(), output);
        if status == ExecutionStatus::Failed && guard.first_error.is_none() {
            guard.first_error = error_message.clone();
        }
        drop(guard);

        match status {
            ExecutionStatus::Success => {
                info!(task = %task.task_name, "Task finished")
            }
            _ => {
                warn!(
                    task = %task.task_name,
                    status = status.as_str(),
                    error = error_message.as_deref().unwrap_or(""),
                    "Task did not succeed"
                )
            }
        }
    }

    // ============================================
    // Rollback
    // ============================================

    /// Walk completed tasks in reverse topological order, invoking each
    /// declared compensating action, bounded by max_rollback_depth.
    async fn rollback(
        &self,
        definition: &WorkflowDefinition,
        graph: &TaskGraph,
        execution_id: &str,
        state: &Arc<Mutex<ExecState>>,
    ) {
        let _ = self
            .db
            .set_rollback_status(execution_id, RollbackStatus::Pending)
            .await;
        let _ = self
            .db
            .set_rollback_status(execution_id, RollbackStatus::InProgress)
            .await;
        info!(execution = %execution_id, "Starting rollback");

        let completed: Vec<usize> = {
            let guard = state.lock().await;
            graph
                .topo_order()
                .into_iter()
                .rev()
                .filter(|&n| guard.statuses[n] == Some(ExecutionStatus::Success))
                .take(definition.workflow.rollback_config.max_rollback_depth as usize)
                .collect()
        };

        let mut failed = false;
        for node in completed {
            let task = &definition.tasks[node];
            let Some(action) = task.rollback_action().cloned() else {
                continue;
            };
            if let Err(e) = self.run_compensation(task, &action, execution_id).await {
                error!(
                    task = %task.task_name,
                    error = %e,
                    "Compensating action failed; aborting rollback"
                );
                failed = true;
                break;
            }
            info!(task = %task.task_name, "Compensating action finished");
        }

        let final_status = if failed {
            RollbackStatus::Failed
        } else {
            RollbackStatus::Completed
        };
        let _ = self
            .db
            .set_rollback_status(execution_id, final_status)
            .await;
        let _ = self
            .db
            .log_process(
                execution_id,
                "workflow_executor",
                "rollback",
                final_status.as_str(),
                None,
            )
            .await;
    }

    /// A compensating action is a mini task declaration:
    /// {"type": "...", "reference": "...", "config": {...}}
    async fn run_compensation(
        &self,
        task: &WorkflowTask,
        action: &Value,
        execution_id: &str,
    ) -> Result<Value> {
        let action_type: TaskType = action
            .get("type")
            .and_then(Value::as_str)
            .context("rollback action missing 'type'")?
            .parse()?;
        let reference = action
            .get("reference")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let config = action.get("config").cloned().unwrap_or(Value::Null);

        let ctx = TaskContext {
            execution_id: execution_id.to_string(),
            workflow_name: task.workflow_name.clone(),
            task_name: format!("{}::rollback", task.task_name),
            outputs: Map::new(),
            loop_item: None,
            loop_index: None,
        };

        match action_type {
            TaskType::CustomJob => self.collaborators.custom_jobs.run_job(&reference, &ctx).await,
            TaskType::DataWarehouse | TaskType::DataVault => {
                self.collaborators.models.build_model(&reference).await
            }
            TaskType::Sync => self.collaborators.sync.run_sync(&config).await,
            TaskType::ApiCall => self.collaborators.api.call(&config, &ctx).await,
            TaskType::Script => self.collaborators.scripts.run_script(&config, &ctx).await,
            TaskType::SubWorkflow => {
                anyhow::bail!("SUB_WORKFLOW is not a valid compensating action")
            }
        }
    }
}
