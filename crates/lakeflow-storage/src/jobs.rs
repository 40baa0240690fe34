// Custom jobs, their run results, and the non-relational feed catalogs.

use anyhow::Result;

use crate::db::Database;
use crate::models::{
    ApiCatalogRow, CreateJobResult, CsvCatalogRow, CustomJobRow, GoogleSheetsCatalogRow,
    JobResultRow,
};

impl Database {
    pub async fn get_custom_job(&self, job_name: &str) -> Result<Option<CustomJobRow>> {
        let row = sqlx::query_as::<_, CustomJobRow>(
            r#"
            SELECT job_name, description, job_type, sql_query, target_schema, target_table,
                   active, created_at, updated_at
            FROM metadata.custom_jobs
            WHERE job_name = $1
            "#,
        )
        .bind(job_name)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn upsert_custom_job(&self, job: &CustomJobRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata.custom_jobs
                (job_name, description, job_type, sql_query, target_schema, target_table, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (job_name) DO UPDATE SET
                description = EXCLUDED.description,
                job_type = EXCLUDED.job_type,
                sql_query = EXCLUDED.sql_query,
                target_schema = EXCLUDED.target_schema,
                target_table = EXCLUDED.target_table,
                active = EXCLUDED.active,
                updated_at = NOW()
            "#,
        )
        .bind(&job.job_name)
        .bind(&job.description)
        .bind(&job.job_type)
        .bind(&job.sql_query)
        .bind(&job.target_schema)
        .bind(&job.target_table)
        .bind(job.active)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn create_job_result(&self, result: &CreateJobResult) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO metadata.job_results
                (job_name, status, rows_affected, duration_seconds, error_message,
                 started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            RETURNING id
            "#,
        )
        .bind(&result.job_name)
        .bind(&result.status)
        .bind(result.rows_affected)
        .bind(result.duration_seconds)
        .bind(&result.error_message)
        .bind(result.started_at)
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    pub async fn list_job_results(&self, job_name: &str, limit: i64) -> Result<Vec<JobResultRow>> {
        let rows = sqlx::query_as::<_, JobResultRow>(
            r#"
            SELECT id, job_name, status, rows_affected, duration_seconds, error_message,
                   started_at, finished_at
            FROM metadata.job_results
            WHERE job_name = $1
            ORDER BY started_at DESC
            LIMIT $2
            "#,
        )
        .bind(job_name)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    // ============================================
    // Non-relational feed catalogs (scheduling metadata only; the engines
    // that move the data are injected)
    // ============================================

    pub async fn list_active_api_feeds(&self) -> Result<Vec<ApiCatalogRow>> {
        let rows = sqlx::query_as::<_, ApiCatalogRow>(
            r#"
            SELECT id, api_name, endpoint_url, method, headers, auth_config, target_schema,
                   target_table, sync_interval_seconds, active, last_sync_time, last_sync_status
            FROM metadata.api_catalog
            WHERE active = TRUE
            ORDER BY api_name
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn list_active_csv_feeds(&self) -> Result<Vec<CsvCatalogRow>> {
        let rows = sqlx::query_as::<_, CsvCatalogRow>(
            r#"
            SELECT id, file_name, file_path, delimiter, has_header, target_schema, target_table,
                   active, last_sync_time, last_sync_status
            FROM metadata.csv_catalog
            WHERE active = TRUE
            ORDER BY file_name
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn list_active_sheet_feeds(&self) -> Result<Vec<GoogleSheetsCatalogRow>> {
        let rows = sqlx::query_as::<_, GoogleSheetsCatalogRow>(
            r#"
            SELECT id, sheet_name, spreadsheet_id, range_spec, target_schema, target_table,
                   active, last_sync_time, last_sync_status
            FROM metadata.google_sheets_catalog
            WHERE active = TRUE
            ORDER BY sheet_name
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn update_api_feed_status(&self, api_name: &str, status: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE metadata.api_catalog
            SET last_sync_time = NOW(), last_sync_status = $2
            WHERE api_name = $1
            "#,
        )
        .bind(api_name)
        .bind(status)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
