// Transformation-model repositories: models, tests, results, docs,
// lineage, macros, sources, runs.

use anyhow::{bail, Result};
use serde_json::Value;

use crate::db::Database;
use crate::models::{
    CreateTestResult, DbtLineageRow, DbtMacroRow, DbtModelRow, DbtModelRunRow, DbtSourceRow,
    DbtTestResultRow, DbtTestRow, UpsertLineage,
};

const MODEL_COLUMNS: &str = "model_name, materialization, schema_name, sql_content, depends_on, \
     columns, tags, config, documentation, version, git_commit_hash, git_branch, active, \
     last_run_time, last_run_status, rows_affected, created_at, updated_at";

impl Database {
    // ============================================
    // Models
    // ============================================

    pub async fn upsert_model(&self, model: &DbtModelRow) -> Result<()> {
        if model.model_name.trim().is_empty() {
            bail!("model name must not be empty");
        }
        sqlx::query(
            r#"
            INSERT INTO metadata.dbt_models
                (model_name, materialization, schema_name, sql_content, depends_on, columns,
                 tags, config, documentation, version, git_commit_hash, git_branch, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (model_name) DO UPDATE SET
                materialization = EXCLUDED.materialization,
                schema_name = EXCLUDED.schema_name,
                sql_content = EXCLUDED.sql_content,
                depends_on = EXCLUDED.depends_on,
                columns = EXCLUDED.columns,
                tags = EXCLUDED.tags,
                config = EXCLUDED.config,
                documentation = EXCLUDED.documentation,
                version = metadata.dbt_models.version + 1,
                git_commit_hash = EXCLUDED.git_commit_hash,
                git_branch = EXCLUDED.git_branch,
                active = EXCLUDED.active,
                updated_at = NOW()
            "#,
        )
        .bind(&model.model_name)
        .bind(&model.materialization)
        .bind(&model.schema_name)
        .bind(&model.sql_content)
        .bind(&model.depends_on)
        .bind(&model.columns)
        .bind(&model.tags)
        .bind(&model.config)
        .bind(&model.documentation)
        .bind(model.version)
        .bind(&model.git_commit_hash)
        .bind(&model.git_branch)
        .bind(model.active)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_model(&self, model_name: &str) -> Result<Option<DbtModelRow>> {
        let row = sqlx::query_as::<_, DbtModelRow>(&format!(
            "SELECT {MODEL_COLUMNS} FROM metadata.dbt_models WHERE model_name = $1"
        ))
        .bind(model_name)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn list_active_models(&self) -> Result<Vec<DbtModelRow>> {
        let rows = sqlx::query_as::<_, DbtModelRow>(&format!(
            "SELECT {MODEL_COLUMNS} FROM metadata.dbt_models \
             WHERE active = TRUE ORDER BY model_name"
        ))
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn update_model_last_run(
        &self,
        model_name: &str,
        status: &str,
        rows_affected: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE metadata.dbt_models
            SET last_run_time = NOW(), last_run_status = $2, rows_affected = $3,
                updated_at = NOW()
            WHERE model_name = $1
            "#,
        )
        .bind(model_name)
        .bind(status)
        .bind(rows_affected)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // ============================================
    // Model runs
    // ============================================

    pub async fn create_model_run(
        &self,
        model_name: &str,
        run_id: &str,
        materialization: &str,
    ) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO metadata.dbt_model_runs (model_name, run_id, status, materialization)
            VALUES ($1, $2, 'running', $3)
            RETURNING id
            "#,
        )
        .bind(model_name)
        .bind(run_id)
        .bind(materialization)
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn finish_model_run(
        &self,
        run_row_id: i64,
        status: &str,
        compiled_sql: Option<&str>,
        executed_sql: Option<&str>,
        rows_affected: i64,
        duration_seconds: f64,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE metadata.dbt_model_runs
            SET status = $2, compiled_sql = $3, executed_sql = $4, rows_affected = $5,
                duration_seconds = $6, error_message = $7, finished_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_row_id)
        .bind(status)
        .bind(compiled_sql)
        .bind(executed_sql)
        .bind(rows_affected)
        .bind(duration_seconds)
        .bind(error_message)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_model_runs(
        &self,
        model_name: &str,
        limit: i64,
    ) -> Result<Vec<DbtModelRunRow>> {
        let rows = sqlx::query_as::<_, DbtModelRunRow>(
            r#"
            SELECT id, model_name, run_id, status, materialization, compiled_sql, executed_sql,
                   rows_affected, duration_seconds, error_message, started_at, finished_at
            FROM metadata.dbt_model_runs
            WHERE model_name = $1
            ORDER BY started_at DESC
            LIMIT $2
            "#,
        )
        .bind(model_name)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    // ============================================
    // Tests & results
    // ============================================

    pub async fn upsert_test(&self, test: &DbtTestRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata.dbt_tests
                (test_name, model_name, test_type, column_name, test_config, test_sql,
                 severity, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (test_name, model_name) DO UPDATE SET
                test_type = EXCLUDED.test_type,
                column_name = EXCLUDED.column_name,
                test_config = EXCLUDED.test_config,
                test_sql = EXCLUDED.test_sql,
                severity = EXCLUDED.severity,
                active = EXCLUDED.active
            "#,
        )
        .bind(&test.test_name)
        .bind(&test.model_name)
        .bind(&test.test_type)
        .bind(&test.column_name)
        .bind(&test.test_config)
        .bind(&test.test_sql)
        .bind(&test.severity)
        .bind(test.active)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_model_tests(&self, model_name: &str) -> Result<Vec<DbtTestRow>> {
        let rows = sqlx::query_as::<_, DbtTestRow>(
            r#"
            SELECT id, test_name, model_name, test_type, column_name, test_config, test_sql,
                   severity, active
            FROM metadata.dbt_tests
            WHERE model_name = $1
            ORDER BY test_name
            "#,
        )
        .bind(model_name)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn create_test_result(&self, result: &CreateTestResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata.dbt_test_results
                (test_name, model_name, test_type, run_id, status, rows_affected,
                 execution_time_seconds, error_message, test_result)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&result.test_name)
        .bind(&result.model_name)
        .bind(&result.test_type)
        .bind(&result.run_id)
        .bind(&result.status)
        .bind(result.rows_affected)
        .bind(result.execution_time_seconds)
        .bind(&result.error_message)
        .bind(&result.test_result)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_test_results(
        &self,
        model_name: &str,
        run_id: &str,
    ) -> Result<Vec<DbtTestResultRow>> {
        let rows = sqlx::query_as::<_, DbtTestResultRow>(
            r#"
            SELECT id, test_name, model_name, test_type, run_id, status, rows_affected,
                   execution_time_seconds, error_message, test_result, created_at
            FROM metadata.dbt_test_results
            WHERE model_name = $1 AND run_id = $2
            ORDER BY test_name
            "#,
        )
        .bind(model_name)
        .bind(run_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    // ============================================
    // Documentation & lineage
    // ============================================

    pub async fn upsert_documentation(
        &self,
        model_name: &str,
        doc_type: &str,
        doc_key: &str,
        doc_content: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata.dbt_documentation
                (model_name, doc_type, doc_key, doc_content, doc_format)
            VALUES ($1, $2, $3, $4, 'markdown')
            ON CONFLICT (model_name, doc_type, doc_key) DO UPDATE SET
                doc_content = EXCLUDED.doc_content,
                updated_at = NOW()
            "#,
        )
        .bind(model_name)
        .bind(doc_type)
        .bind(doc_key)
        .bind(doc_content)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn upsert_lineage(&self, edge: &UpsertLineage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata.dbt_lineage
                (source_model, target_model, source_column, target_column, transformation_type)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_model, target_model, source_column, target_column, transformation_type)
                DO UPDATE SET updated_at = NOW()
            "#,
        )
        .bind(&edge.source_model)
        .bind(&edge.target_model)
        .bind(&edge.source_column)
        .bind(&edge.target_column)
        .bind(&edge.transformation_type)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_lineage_for_target(
        &self,
        target_model: &str,
    ) -> Result<Vec<DbtLineageRow>> {
        let rows = sqlx::query_as::<_, DbtLineageRow>(
            r#"
            SELECT id, source_model, target_model, source_column, target_column,
                   transformation_type, updated_at
            FROM metadata.dbt_lineage
            WHERE target_model = $1
            ORDER BY source_model
            "#,
        )
        .bind(target_model)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    // ============================================
    // Macros & sources
    // ============================================

    pub async fn upsert_macro(
        &self,
        macro_name: &str,
        macro_sql: &str,
        parameters: &Value,
        description: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata.dbt_macros (macro_name, macro_sql, parameters, description)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (macro_name) DO UPDATE SET
                macro_sql = EXCLUDED.macro_sql,
                parameters = EXCLUDED.parameters,
                description = EXCLUDED.description
            "#,
        )
        .bind(macro_name)
        .bind(macro_sql)
        .bind(parameters)
        .bind(description)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_macros(&self) -> Result<Vec<DbtMacroRow>> {
        let rows = sqlx::query_as::<_, DbtMacroRow>(
            r#"
            SELECT macro_name, macro_sql, parameters, description, active
            FROM metadata.dbt_macros
            WHERE active = TRUE
            ORDER BY macro_name
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn list_sources(&self) -> Result<Vec<DbtSourceRow>> {
        let rows = sqlx::query_as::<_, DbtSourceRow>(
            r#"
            SELECT id, source_name, schema_name, table_name, database_name, description, active
            FROM metadata.dbt_sources
            WHERE active = TRUE
            ORDER BY source_name, table_name
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn get_source(
        &self,
        source_name: &str,
        table_name: &str,
    ) -> Result<Option<DbtSourceRow>> {
        let row = sqlx::query_as::<_, DbtSourceRow>(
            r#"
            SELECT id, source_name, schema_name, table_name, database_name, description, active
            FROM metadata.dbt_sources
            WHERE source_name = $1 AND table_name = $2 AND active = TRUE
            "#,
        )
        .bind(source_name)
        .bind(table_name)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn upsert_source(&self, source: &DbtSourceRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata.dbt_sources
                (source_name, schema_name, table_name, database_name, description, active)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (source_name, table_name) DO UPDATE SET
                schema_name = EXCLUDED.schema_name,
                database_name = EXCLUDED.database_name,
                description = EXCLUDED.description,
                active = EXCLUDED.active
            "#,
        )
        .bind(&source.source_name)
        .bind(&source.schema_name)
        .bind(&source.table_name)
        .bind(&source.database_name)
        .bind(&source.description)
        .bind(source.active)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
