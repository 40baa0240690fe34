// Task collaborators: the executor dispatches each task type to one of
// these trait objects. In-tree defaults cover the catalog-backed paths;
// every seam is replaceable for embedding and tests.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use lakeflow_core::{CatalogStatus, DatabaseEngine};
use lakeflow_storage::{CreateJobResult, Database};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

/// Context handed to a collaborator for one dispatch
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub execution_id: String,
    pub workflow_name: String,
    pub task_name: String,
    /// Snapshot of prior task outputs by task name
    pub outputs: Map<String, Value>,
    /// FOREACH binding for the current iteration
    pub loop_item: Option<Value>,
    pub loop_index: Option<usize>,
}

#[async_trait]
pub trait CustomJobRunner: Send + Sync {
    async fn run_job(&self, job_name: &str, ctx: &TaskContext) -> Result<Value>;
}

#[async_trait]
pub trait ModelBuilder: Send + Sync {
    /// DATA_WAREHOUSE and DATA_VAULT tasks both materialize a registered
    /// transformation model by name.
    async fn build_model(&self, model_name: &str) -> Result<Value>;
}

#[async_trait]
pub trait SyncRunner: Send + Sync {
    async fn run_sync(&self, config: &Value) -> Result<Value>;
}

#[async_trait]
pub trait ApiCaller: Send + Sync {
    async fn call(&self, config: &Value, ctx: &TaskContext) -> Result<Value>;
}

#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run_script(&self, config: &Value, ctx: &TaskContext) -> Result<Value>;
}

/// The bundle the executor owns
#[derive(Clone)]
pub struct Collaborators {
    pub custom_jobs: Arc<dyn CustomJobRunner>,
    pub models: Arc<dyn ModelBuilder>,
    pub sync: Arc<dyn SyncRunner>,
    pub api: Arc<dyn ApiCaller>,
    pub scripts: Arc<dyn ScriptRunner>,
}

// ============================================
// Custom jobs: SQL against the catalog database
// ============================================

pub struct SqlJobRunner {
    db: Database,
}

impl SqlJobRunner {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CustomJobRunner for SqlJobRunner {
    async fn run_job(&self, job_name: &str, _ctx: &TaskContext) -> Result<Value> {
        let job = self
            .db
            .get_custom_job(job_name)
            .await?
            .with_context(|| format!("custom job not found: {job_name}"))?;
        if !job.active {
            bail!("custom job is inactive: {job_name}");
        }
        if job.sql_query.trim().is_empty() {
            bail!("custom job has no SQL: {job_name}");
        }

        let started = Utc::now();
        let run = sqlx::raw_sql(&job.sql_query).execute(self.db.pool()).await;
        let duration = (Utc::now() - started).num_milliseconds() as f64 / 1000.0;

        match run {
            Ok(done) => {
                let rows = done.rows_affected() as i64;
                self.db
                    .create_job_result(&CreateJobResult {
                        job_name: job_name.to_string(),
                        status: "success".into(),
                        rows_affected: rows,
                        duration_seconds: duration,
                        error_message: None,
                        started_at: started,
                    })
                    .await?;
                info!(job = job_name, rows, "Custom job finished");
                Ok(json!({ "job_name": job_name, "rows_affected": rows }))
            }
            Err(e) => {
                self.db
                    .create_job_result(&CreateJobResult {
                        job_name: job_name.to_string(),
                        status: "error".into(),
                        rows_affected: 0,
                        duration_seconds: duration,
                        error_message: Some(e.to_string()),
                        started_at: started,
                    })
                    .await?;
                Err(anyhow!(e).context(format!("custom job failed: {job_name}")))
            }
        }
    }
}

// ============================================
// Sync: nudge a catalog entry back through FULL_LOAD so the transfer
// loop picks it up on its next cycle
// ============================================

pub struct CatalogSyncRunner {
    db: Database,
}

impl CatalogSyncRunner {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SyncRunner for CatalogSyncRunner {
    async fn run_sync(&self, config: &Value) -> Result<Value> {
        let schema = config
            .get("schema")
            .and_then(Value::as_str)
            .context("sync config missing 'schema'")?;
        let table = config
            .get("table")
            .and_then(Value::as_str)
            .context("sync config missing 'table'")?;
        let engine: DatabaseEngine = config
            .get("db_engine")
            .and_then(Value::as_str)
            .context("sync config missing 'db_engine'")?
            .parse()?;

        let entry = self
            .db
            .get_catalog_entry(schema, table, engine)
            .await?
            .with_context(|| format!("catalog entry not found: {schema}.{table} ({engine})"))?;

        let moved = self
            .db
            .set_catalog_status(schema, table, engine, CatalogStatus::FullLoad)
            .await?;
        if !moved {
            warn!(
                schema, table, engine = %engine, status = %entry.status,
                "Sync request left catalog status unchanged"
            );
        }
        Ok(json!({
            "schema": schema,
            "table": table,
            "db_engine": engine.as_str(),
            "rescheduled": moved,
        }))
    }
}

// ============================================
// API calls
// ============================================

pub struct HttpApiCaller {
    client: reqwest::Client,
}

impl HttpApiCaller {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpApiCaller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApiCaller for HttpApiCaller {
    async fn call(&self, config: &Value, _ctx: &TaskContext) -> Result<Value> {
        let url = config
            .get("url")
            .and_then(Value::as_str)
            .context("api config missing 'url'")?;
        let method = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let timeout = config
            .get("timeout_seconds")
            .and_then(Value::as_u64)
            .unwrap_or(30);

        let mut request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "DELETE" => self.client.delete(url),
            "PATCH" => self.client.patch(url),
            other => bail!("unsupported http method: {other}"),
        }
        .timeout(Duration::from_secs(timeout));

        if let Some(headers) = config.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                if let Some(v) = value.as_str() {
                    request = request.header(key, v);
                }
            }
        }
        if let Some(body) = config.get("body").filter(|b| !b.is_null()) {
            request = request.json(body);
        }

        let response = request.send().await.context("api call failed")?;
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let body: Value = serde_json::from_str(&text)
            .unwrap_or_else(|_| Value::String(text.chars().take(2000).collect()));

        let expected = config
            .get("expected_status")
            .and_then(Value::as_u64)
            .map(|s| s as u16);
        let ok = match expected {
            Some(code) => status == code,
            None => (200..300).contains(&status),
        };
        if !ok {
            bail!("api call returned status {status}");
        }
        Ok(json!({ "status": status, "body": body }))
    }
}

// ============================================
// Scripts
// ============================================

pub struct ProcessScriptRunner;

#[async_trait]
impl ScriptRunner for ProcessScriptRunner {
    async fn run_script(&self, config: &Value, ctx: &TaskContext) -> Result<Value> {
        let command = config
            .get("command")
            .and_then(Value::as_str)
            .context("script config missing 'command'")?;
        let args: Vec<String> = config
            .get("args")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        let timeout = config
            .get("timeout_seconds")
            .and_then(Value::as_u64)
            .unwrap_or(300);

        let mut cmd = tokio::process::Command::new(command);
        cmd.args(&args)
            .env("LAKEFLOW_EXECUTION_ID", &ctx.execution_id)
            .env("LAKEFLOW_WORKFLOW", &ctx.workflow_name)
            .env("LAKEFLOW_TASK", &ctx.task_name)
            .kill_on_drop(true)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(item) = &ctx.loop_item {
            cmd.env("LAKEFLOW_LOOP_ITEM", item.to_string());
        }

        let output = tokio::time::timeout(Duration::from_secs(timeout), cmd.output())
            .await
            .map_err(|_| anyhow!("script timed out after {timeout}s: {command}"))?
            .with_context(|| format!("failed to spawn script: {command}"))?;

        let stdout_tail: String = String::from_utf8_lossy(&output.stdout)
            .chars()
            .rev()
            .take(2000)
            .collect::<String>()
            .chars()
            .rev()
            .collect();
        if !output.status.success() {
            let stderr_tail: String = String::from_utf8_lossy(&output.stderr)
                .chars()
                .take(500)
                .collect();
            bail!(
                "script exited with {}: {stderr_tail}",
                output.status.code().unwrap_or(-1)
            );
        }
        Ok(json!({
            "exit_code": output.status.code().unwrap_or(0),
            "stdout": stdout_tail,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TaskContext {
        TaskContext {
            execution_id: "e1".into(),
            workflow_name: "wf".into(),
            task_name: "t".into(),
            outputs: Map::new(),
            loop_item: None,
            loop_index: None,
        }
    }

    #[tokio::test]
    async fn script_runner_captures_stdout() {
        let runner = ProcessScriptRunner;
        let config = json!({"command": "echo", "args": ["hello"]});
        let output = runner.run_script(&config, &ctx()).await.unwrap();
        assert_eq!(output["exit_code"], 0);
        assert!(output["stdout"].as_str().unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn script_runner_fails_on_nonzero_exit() {
        let runner = ProcessScriptRunner;
        let config = json!({"command": "false"});
        assert!(runner.run_script(&config, &ctx()).await.is_err());
    }

    #[tokio::test]
    async fn script_runner_requires_command() {
        let runner = ProcessScriptRunner;
        assert!(runner.run_script(&json!({}), &ctx()).await.is_err());
    }
}
