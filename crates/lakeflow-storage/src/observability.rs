// Quality, governance, and APM row writers plus the catalog-side queries
// they sample from (pg_stat_activity / pg_stat_statements).

use anyhow::Result;

use crate::db::Database;
use crate::models::{
    ApmMetric, DataQualityRecord, QueryActivitySample, QueryPerformanceRecord,
};

impl Database {
    pub async fn record_data_quality(&self, record: &DataQualityRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata.data_quality
                (schema_name, table_name, db_engine, row_count, column_count,
                 null_fraction, size_drift_pct, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&record.schema_name)
        .bind(&record.table_name)
        .bind(&record.db_engine)
        .bind(record.row_count)
        .bind(record.column_count)
        .bind(record.null_fraction)
        .bind(record.size_drift_pct)
        .bind(&record.status)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Fraction of NULLs in one column of a target table; None when the
    /// table is empty or the column is missing.
    pub async fn target_null_fraction(
        &self,
        schema: &str,
        table: &str,
        column: &str,
    ) -> Result<Option<f64>> {
        let column_exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT FROM information_schema.columns
                WHERE table_schema = $1 AND table_name = $2 AND column_name = $3
            )
            "#,
        )
        .bind(schema.to_lowercase())
        .bind(table.to_lowercase())
        .bind(column.to_lowercase())
        .fetch_one(self.pool())
        .await?;
        if !column_exists {
            return Ok(None);
        }

        let quoted = format!(
            "\"{}\".\"{}\"",
            schema.to_lowercase().replace('"', ""),
            table.to_lowercase().replace('"', "")
        );
        let quoted_col = format!("\"{}\"", column.to_lowercase().replace('"', ""));
        let fraction = sqlx::query_scalar::<_, Option<f64>>(&format!(
            "SELECT CASE WHEN COUNT(*) = 0 THEN NULL \
                    ELSE COUNT(*) FILTER (WHERE {quoted_col} IS NULL)::float / COUNT(*) END \
             FROM {quoted}"
        ))
        .fetch_one(self.pool())
        .await?;
        Ok(fraction)
    }

    // ============================================
    // Governance sampling
    // ============================================

    /// Snapshot of currently active queries (excluding ourselves)
    pub async fn sample_query_activity(&self) -> Result<Vec<QueryActivitySample>> {
        let rows = sqlx::query_as::<_, (Option<String>, Option<String>, Option<String>, Option<String>, Option<f64>)>(
            r#"
            SELECT usename::text, application_name, state,
                   LEFT(query, 2000) AS query_text,
                   EXTRACT(EPOCH FROM (NOW() - query_start)) * 1000 AS duration_ms
            FROM pg_stat_activity
            WHERE state IS NOT NULL AND state <> 'idle' AND pid <> pg_backend_pid()
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(usename, application_name, state, query_text, duration_ms)| {
                    let query_hash = query_text.as_deref().map(hash_query);
                    QueryActivitySample {
                        usename,
                        application_name,
                        state,
                        query_hash,
                        query_text,
                        duration_ms,
                    }
                },
            )
            .collect())
    }

    pub async fn record_query_activity(&self, sample: &QueryActivitySample) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata.query_activity_log
                (usename, application_name, state, query_hash, query_text, duration_ms)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&sample.usename)
        .bind(&sample.application_name)
        .bind(&sample.state)
        .bind(&sample.query_hash)
        .bind(&sample.query_text)
        .bind(sample.duration_ms)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Aggregate import from pg_stat_statements. Empty when the extension
    /// is not installed.
    pub async fn import_query_store(&self, limit: i64) -> Result<Vec<QueryPerformanceRecord>> {
        let installed = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT FROM pg_extension WHERE extname = 'pg_stat_statements')",
        )
        .fetch_one(self.pool())
        .await?;
        if !installed {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, (String, i64, f64, f64, i64)>(
            r#"
            SELECT LEFT(query, 2000) AS query_text, calls, total_exec_time, mean_exec_time, rows
            FROM pg_stat_statements
            ORDER BY total_exec_time DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|(query_text, calls, total_time_ms, mean_time_ms, rows_returned)| {
                QueryPerformanceRecord {
                    query_hash: hash_query(&query_text),
                    query_text,
                    calls,
                    total_time_ms,
                    mean_time_ms,
                    rows_returned,
                }
            })
            .collect())
    }

    pub async fn record_query_performance(
        &self,
        record: &QueryPerformanceRecord,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata.query_performance
                (query_hash, query_text, calls, total_time_ms, mean_time_ms, rows_returned)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&record.query_hash)
        .bind(&record.query_text)
        .bind(record.calls)
        .bind(record.total_time_ms)
        .bind(record.mean_time_ms)
        .bind(record.rows_returned)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // ============================================
    // APM
    // ============================================

    pub async fn record_apm_metric(&self, metric: &ApmMetric) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata.apm_metrics (metric_name, metric_value, tags)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(&metric.metric_name)
        .bind(metric.metric_value)
        .bind(&metric.tags)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_apm_baseline(&self, metric_name: &str) -> Result<Option<(f64, f64)>> {
        let row = sqlx::query_as::<_, (f64, f64)>(
            r#"
            SELECT baseline_value, threshold_pct FROM metadata.apm_baselines
            WHERE metric_name = $1
            "#,
        )
        .bind(metric_name)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn record_health_check(
        &self,
        check_name: &str,
        status: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata.apm_health_checks (check_name, status, detail)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(check_name)
        .bind(status)
        .bind(detail)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Vacuum/analyze a target table (maintenance loop)
    pub async fn analyze_target_table(&self, schema: &str, table: &str) -> Result<()> {
        let quoted = format!(
            "\"{}\".\"{}\"",
            schema.to_lowercase().replace('"', ""),
            table.to_lowercase().replace('"', "")
        );
        sqlx::query(&format!("ANALYZE {quoted}"))
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

/// Stable short hash used to correlate query text across samples without
/// storing duplicates of long SQL.
fn hash_query(query: &str) -> String {
    // FNV-1a, hex-encoded; collision risk is acceptable for correlation
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in query.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x1000_0000_01b3);
    }
    format!("{hash:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_hash_is_stable_and_distinguishes() {
        let a = hash_query("SELECT 1");
        let b = hash_query("SELECT 1");
        let c = hash_query("SELECT 2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }
}
