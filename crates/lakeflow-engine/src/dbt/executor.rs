// Model executor: compiles the templated SQL, materializes the result,
// emits lineage and documentation, and runs the model's tests.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use lakeflow_core::model::qualified_name;
use lakeflow_core::{Materialization, ModelColumn, TestSeverity, TestStatus};
use lakeflow_storage::{
    CreateTestResult, Database, DbtModelRow, UpsertLineage,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::lineage::select_list_columns;
use super::template::{MacroDef, RefTarget, SqlTemplateExpander};
use super::tests_gen::generate_test_sql;
use crate::collaborators::ModelBuilder;

#[derive(Clone)]
pub struct DbtModelExecutor {
    db: Database,
    git_commit: Option<String>,
    git_branch: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct TestSummary {
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
    /// Failures whose severity is `error` (warn-severity failures only log)
    pub hard_failures: usize,
}

impl DbtModelExecutor {
    /// Git stamps come from the environment at process start; the kernel
    /// never shells out to git itself.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            git_commit: std::env::var("LAKEFLOW_GIT_COMMIT").ok(),
            git_branch: std::env::var("LAKEFLOW_GIT_BRANCH").ok(),
        }
    }

    pub fn with_git_stamps(
        db: Database,
        git_commit: Option<String>,
        git_branch: Option<String>,
    ) -> Self {
        Self {
            db,
            git_commit,
            git_branch,
        }
    }

    /// Compile a model's SQL without executing it
    pub async fn compile_model(&self, model_name: &str) -> Result<String> {
        let model = self
            .db
            .get_model(model_name)
            .await?
            .with_context(|| format!("model not found: {model_name}"))?;
        let expander = self.build_expander().await?;
        Ok(expander.expand(&model.sql_content).sql)
    }

    async fn build_expander(&self) -> Result<SqlTemplateExpander> {
        let macros: HashMap<String, MacroDef> = self
            .db
            .list_macros()
            .await?
            .into_iter()
            .map(|m| {
                let parameters = m.parameter_names();
                (
                    m.macro_name,
                    MacroDef {
                        sql: m.macro_sql,
                        parameters,
                    },
                )
            })
            .collect();

        let sources: HashMap<(String, String), String> = self
            .db
            .list_sources()
            .await?
            .into_iter()
            .map(|s| {
                (
                    (s.source_name.clone(), s.table_name.clone()),
                    qualified_name(&s.schema_name, &s.table_name),
                )
            })
            .collect();

        let models = self.db.list_active_models().await?;
        let refs = resolve_ref_targets(&models, &macros, &sources);
        Ok(SqlTemplateExpander::new(macros, refs, sources))
    }

    // ============================================
    // Execution
    // ============================================

    pub async fn execute_model(&self, model_name: &str) -> Result<Value> {
        let mut model = self
            .db
            .get_model(model_name)
            .await?
            .with_context(|| format!("model not found: {model_name}"))?;
        if !model.active {
            info!(model = model_name, "Model is inactive, skipping");
            return Ok(json!({ "model": model_name, "skipped": true }));
        }
        if model.git_commit_hash.is_none() {
            model.git_commit_hash = self.git_commit.clone();
        }
        if model.git_branch.is_none() {
            model.git_branch = self.git_branch.clone();
        }

        let materialization: Materialization = model.materialization.parse()?;
        let run_id = Utc::now().timestamp_millis().to_string();
        let run_row_id = self
            .db
            .create_model_run(model_name, &run_id, materialization.as_str())
            .await?;
        let started = tokio::time::Instant::now();

        let expander = self.build_expander().await?;
        let outcome = expander.expand(&model.sql_content);

        let result = self.materialize(&model, materialization, &outcome.sql).await;
        let duration = started.elapsed().as_secs_f64();

        match result {
            Ok(rows_affected) => {
                self.db
                    .finish_model_run(
                        run_row_id,
                        "success",
                        Some(&outcome.sql),
                        Some(&outcome.sql),
                        rows_affected,
                        duration,
                        None,
                    )
                    .await?;
                self.db
                    .update_model_last_run(model_name, "success", rows_affected)
                    .await?;

                self.record_lineage(&model, &outcome.refs, &outcome.sources, &outcome.sql)
                    .await;
                self.record_documentation(&model).await;

                info!(
                    model = model_name,
                    rows = rows_affected,
                    materialization = materialization.as_str(),
                    "Model executed"
                );
                Ok(json!({
                    "model": model_name,
                    "run_id": run_id,
                    "rows_affected": rows_affected,
                    "materialization": materialization.as_str(),
                }))
            }
            Err(e) => {
                let message = format!("{e:#}");
                self.db
                    .finish_model_run(
                        run_row_id,
                        "error",
                        Some(&outcome.sql),
                        None,
                        0,
                        duration,
                        Some(&message),
                    )
                    .await?;
                self.db
                    .update_model_last_run(model_name, "error", 0)
                    .await?;
                Err(anyhow!("model {model_name} failed: {message}"))
            }
        }
    }

    /// Returns rows in the target after materialization (0 for ephemeral)
    async fn materialize(
        &self,
        model: &DbtModelRow,
        materialization: Materialization,
        compiled_sql: &str,
    ) -> Result<i64> {
        let relation = qualified_name(&model.schema_name, &model.model_name);
        let pool = self.db.pool();

        if materialization != Materialization::Ephemeral {
            sqlx::query(&format!(
                "CREATE SCHEMA IF NOT EXISTS \"{}\"",
                model.schema_name.replace('"', "")
            ))
            .execute(pool)
            .await?;
        }

        match materialization {
            Materialization::Table => {
                sqlx::query(&format!("DROP TABLE IF EXISTS {relation} CASCADE"))
                    .execute(pool)
                    .await?;
                sqlx::query(&format!("CREATE TABLE {relation} AS {compiled_sql}"))
                    .execute(pool)
                    .await?;
            }
            Materialization::View => {
                sqlx::query(&format!("DROP VIEW IF EXISTS {relation} CASCADE"))
                    .execute(pool)
                    .await?;
                sqlx::query(&format!("CREATE VIEW {relation} AS {compiled_sql}"))
                    .execute(pool)
                    .await?;
            }
            Materialization::Incremental => {
                self.materialize_incremental(model, &relation, compiled_sql)
                    .await?;
            }
            Materialization::Ephemeral => {
                info!(model = %model.model_name, "Ephemeral model, not materializing");
                return Ok(0);
            }
        }

        let rows = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {relation}"))
            .fetch_one(pool)
            .await?;
        Ok(rows)
    }

    async fn materialize_incremental(
        &self,
        model: &DbtModelRow,
        relation: &str,
        compiled_sql: &str,
    ) -> Result<()> {
        let pool = self.db.pool();
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT FROM information_schema.tables
                WHERE table_schema = $1 AND table_name = $2
            )
            "#,
        )
        .bind(&model.schema_name)
        .bind(&model.model_name)
        .fetch_one(pool)
        .await?;

        let unique_key = model.unique_key().map(String::from);
        if !exists {
            sqlx::query(&format!("CREATE TABLE {relation} AS {compiled_sql}"))
                .execute(pool)
                .await?;
            // The upsert path needs a unique index on the key
            if let Some(key) = &unique_key {
                sqlx::query(&format!(
                    "CREATE UNIQUE INDEX ON {relation} (\"{}\")",
                    key.replace('"', "")
                ))
                .execute(pool)
                .await?;
            }
            return Ok(());
        }

        match unique_key {
            Some(key) => {
                let key_quoted = format!("\"{}\"", key.replace('"', ""));
                let updates = declared_columns(model)
                    .into_iter()
                    .filter(|c| !c.name.eq_ignore_ascii_case(&key))
                    .map(|c| {
                        let col = format!("\"{}\"", c.name.replace('"', ""));
                        format!("{col} = EXCLUDED.{col}")
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                let conflict_clause = if updates.is_empty() {
                    format!("ON CONFLICT ({key_quoted}) DO NOTHING")
                } else {
                    format!("ON CONFLICT ({key_quoted}) DO UPDATE SET {updates}")
                };
                sqlx::query(&format!(
                    "INSERT INTO {relation} {compiled_sql} {conflict_clause}"
                ))
                .execute(pool)
                .await?;
            }
            None => {
                sqlx::query(&format!("INSERT INTO {relation} {compiled_sql}"))
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }

    // ============================================
    // Lineage & documentation
    // ============================================

    async fn record_lineage(
        &self,
        model: &DbtModelRow,
        refs: &[String],
        sources: &[(String, String)],
        compiled_sql: &str,
    ) {
        let mut ref_models = Vec::new();
        for ref_name in refs {
            match self.db.get_model(ref_name).await {
                Ok(Some(_)) => {
                    ref_models.push(ref_name.clone());
                    let edge = UpsertLineage {
                        source_model: ref_name.clone(),
                        target_model: model.model_name.clone(),
                        source_column: String::new(),
                        target_column: String::new(),
                        transformation_type: "ref".to_string(),
                    };
                    if let Err(e) = self.db.upsert_lineage(&edge).await {
                        warn!(error = %e, "Failed to record ref lineage");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Lineage lookup failed"),
            }
        }

        for (source_name, table_name) in sources {
            match self.db.get_source(source_name, table_name).await {
                Ok(Some(source)) => {
                    let edge = UpsertLineage {
                        source_model: format!("{}.{}", source.schema_name, source.table_name),
                        target_model: model.model_name.clone(),
                        source_column: String::new(),
                        target_column: String::new(),
                        transformation_type: "source".to_string(),
                    };
                    if let Err(e) = self.db.upsert_lineage(&edge).await {
                        warn!(error = %e, "Failed to record source lineage");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Lineage lookup failed"),
            }
        }

        // Column-level edges from the outer select list
        for (source_column, target_column) in select_list_columns(compiled_sql) {
            for ref_name in &ref_models {
                let edge = UpsertLineage {
                    source_model: ref_name.clone(),
                    target_model: model.model_name.clone(),
                    source_column: source_column.clone(),
                    target_column: target_column.clone(),
                    transformation_type: "select".to_string(),
                };
                if let Err(e) = self.db.upsert_lineage(&edge).await {
                    warn!(error = %e, "Failed to record column lineage");
                }
            }
        }
    }

    async fn record_documentation(&self, model: &DbtModelRow) {
        if let Some(doc) = model.documentation.as_deref().filter(|d| !d.is_empty()) {
            if let Err(e) = self
                .db
                .upsert_documentation(&model.model_name, "model", "description", doc)
                .await
            {
                warn!(error = %e, "Failed to record model documentation");
            }
        }
        for column in declared_columns(model) {
            if let Some(description) = column.description.as_deref().filter(|d| !d.is_empty()) {
                if let Err(e) = self
                    .db
                    .upsert_documentation(&model.model_name, "column", &column.name, description)
                    .await
                {
                    warn!(error = %e, "Failed to record column documentation");
                }
            }
        }
    }

    // ============================================
    // Tests
    // ============================================

    /// Run all of a model's tests under one shared run id
    pub async fn run_model_tests(&self, model_name: &str) -> Result<TestSummary> {
        let model = self
            .db
            .get_model(model_name)
            .await?
            .with_context(|| format!("model not found: {model_name}"))?;
        let relation = qualified_name(&model.schema_name, &model.model_name);
        let run_id = Utc::now().timestamp_millis().to_string();
        let tests = self.db.list_model_tests(model_name).await?;

        let mut summary = TestSummary::default();
        for test in tests {
            let severity: TestSeverity = test.severity.parse().unwrap_or_default();
            let started = tokio::time::Instant::now();

            let (status, rows, error_message, check_sql) = if !test.active {
                (TestStatus::Skipped, 0, None, None)
            } else {
                match generate_test_sql(&test, model_name, &relation) {
                    None => (
                        TestStatus::Error,
                        0,
                        Some("could not generate test SQL".to_string()),
                        None,
                    ),
                    Some(sql) => {
                        match sqlx::query_scalar::<_, i64>(&sql).fetch_one(self.db.pool()).await {
                            Ok(0) => (TestStatus::Pass, 0, None, Some(sql)),
                            Ok(failures) => (
                                TestStatus::Fail,
                                failures,
                                Some(format!("test failed: {failures} rows failed")),
                                Some(sql),
                            ),
                            Err(e) => (TestStatus::Error, 0, Some(e.to_string()), Some(sql)),
                        }
                    }
                }
            };

            match status {
                TestStatus::Pass => summary.passed += 1,
                TestStatus::Fail => {
                    summary.failed += 1;
                    if severity == TestSeverity::Error {
                        summary.hard_failures += 1;
                    } else {
                        warn!(
                            test = %test.test_name,
                            model = model_name,
                            rows,
                            "Test failed with warn severity"
                        );
                    }
                }
                TestStatus::Error => summary.errored += 1,
                TestStatus::Skipped => summary.skipped += 1,
            }

            let result = CreateTestResult {
                test_name: test.test_name.clone(),
                model_name: model_name.to_string(),
                test_type: test.test_type.clone(),
                run_id: run_id.clone(),
                status: status.as_str().to_string(),
                rows_affected: rows,
                execution_time_seconds: started.elapsed().as_secs_f64(),
                error_message,
                test_result: check_sql
                    .map(|sql| json!({ "failure_count": rows, "test_sql": sql }))
                    .unwrap_or(Value::Null),
            };
            if let Err(e) = self.db.create_test_result(&result).await {
                warn!(test = %test.test_name, error = %e, "Failed to persist test result");
            }
        }
        Ok(summary)
    }

    /// Run every active model's tests
    pub async fn run_all_tests(&self) -> Result<()> {
        for model in self.db.list_active_models().await? {
            if let Err(e) = self.run_model_tests(&model.model_name).await {
                warn!(model = %model.model_name, error = %e, "Test run failed");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ModelBuilder for DbtModelExecutor {
    async fn build_model(&self, model_name: &str) -> Result<Value> {
        let output = self.execute_model(model_name).await?;
        if output.get("skipped").and_then(Value::as_bool) == Some(true) {
            return Ok(output);
        }
        let tests = self.run_model_tests(model_name).await?;
        if tests.hard_failures > 0 {
            bail!(
                "model {model_name} has {} failing error-severity tests",
                tests.hard_failures
            );
        }
        Ok(json!({
            "build": output,
            "tests": {
                "passed": tests.passed,
                "failed": tests.failed,
                "errored": tests.errored,
                "skipped": tests.skipped,
            },
        }))
    }
}

fn declared_columns(model: &DbtModelRow) -> Vec<ModelColumn> {
    serde_json::from_value(model.columns.clone()).unwrap_or_default()
}

/// Non-ephemeral models resolve to their qualified relation; ephemeral
/// models inline their own compiled SQL, resolved to a fixed point so
/// ephemeral-on-ephemeral chains work. Cyclic ephemerals stay unresolved.
fn resolve_ref_targets(
    models: &[DbtModelRow],
    macros: &HashMap<String, MacroDef>,
    sources: &HashMap<(String, String), String>,
) -> HashMap<String, RefTarget> {
    let mut targets: HashMap<String, RefTarget> = HashMap::new();
    let mut ephemerals = Vec::new();
    for model in models {
        if model.materialization == Materialization::Ephemeral.as_str() {
            ephemerals.push(model);
        } else {
            targets.insert(
                model.model_name.clone(),
                RefTarget::Relation(qualified_name(&model.schema_name, &model.model_name)),
            );
        }
    }

    for _ in 0..=ephemerals.len() {
        let mut progressed = false;
        for model in &ephemerals {
            if targets.contains_key(&model.model_name) {
                continue;
            }
            let expander =
                SqlTemplateExpander::new(macros.clone(), targets.clone(), sources.clone());
            let outcome = expander.expand(&model.sql_content);
            let pending_ephemeral = outcome.refs.iter().any(|r| {
                !targets.contains_key(r) && ephemerals.iter().any(|e| &e.model_name == r)
            });
            if !pending_ephemeral {
                targets.insert(model.model_name.clone(), RefTarget::Inline(outcome.sql));
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn model(name: &str, materialization: &str, sql: &str) -> DbtModelRow {
        DbtModelRow {
            model_name: name.into(),
            materialization: materialization.into(),
            schema_name: "analytics".into(),
            sql_content: sql.into(),
            depends_on: json!([]),
            columns: json!([]),
            tags: json!([]),
            config: json!(null),
            documentation: None,
            version: 1,
            git_commit_hash: None,
            git_branch: None,
            active: true,
            last_run_time: None,
            last_run_status: None,
            rows_affected: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn ephemeral_chain_resolves_to_fixed_point() {
        let models = vec![
            model("base", "table", "SELECT 1 AS id"),
            model("eph_a", "ephemeral", "SELECT id FROM {{ ref('base') }}"),
            model("eph_b", "ephemeral", "SELECT id FROM {{ ref('eph_a') }}"),
        ];
        let targets = resolve_ref_targets(&models, &HashMap::new(), &HashMap::new());
        match targets.get("eph_b") {
            Some(RefTarget::Inline(sql)) => {
                assert!(sql.contains("(SELECT id FROM \"analytics\".\"base\")"));
            }
            other => panic!("expected inline target, got {other:?}"),
        }
    }

    #[test]
    fn cyclic_ephemerals_stay_unresolved() {
        let models = vec![
            model("eph_x", "ephemeral", "SELECT * FROM {{ ref('eph_y') }}"),
            model("eph_y", "ephemeral", "SELECT * FROM {{ ref('eph_x') }}"),
        ];
        let targets = resolve_ref_targets(&models, &HashMap::new(), &HashMap::new());
        assert!(!targets.contains_key("eph_x"));
        assert!(!targets.contains_key("eph_y"));
    }

    #[test]
    fn declared_columns_tolerate_malformed_json() {
        let mut m = model("m", "table", "SELECT 1");
        m.columns = json!("not an array");
        assert!(declared_columns(&m).is_empty());
        m.columns = json!([{"name": "id", "tests": ["unique"]}]);
        let cols = declared_columns(&m);
        assert_eq!(cols.len(), 1);
        assert_eq!(cols[0].name, "id");
    }
}
