// Governance collector: active-query sampling, aggregate query-store
// import, and APM rollups against the catalog database.

use anyhow::Result;
use lakeflow_storage::{ApmMetric, Database};
use serde_json::json;
use tracing::{debug, warn};

const QUERY_STORE_IMPORT_LIMIT: i64 = 100;

#[derive(Clone)]
pub struct GovernanceCollector {
    db: Database,
}

impl GovernanceCollector {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Snapshot currently active queries into the activity log
    pub async fn collect_query_activity(&self) -> Result<usize> {
        let samples = self.db.sample_query_activity().await?;
        let mut recorded = 0usize;
        for sample in &samples {
            if let Err(e) = self.db.record_query_activity(sample).await {
                warn!(error = %e, "Failed to record query activity sample");
            } else {
                recorded += 1;
            }
        }
        debug!(recorded, "Query activity sampled");
        Ok(recorded)
    }

    /// Import top statements from pg_stat_statements when available
    pub async fn import_query_store(&self) -> Result<usize> {
        let records = self.db.import_query_store(QUERY_STORE_IMPORT_LIMIT).await?;
        let mut recorded = 0usize;
        for record in &records {
            if let Err(e) = self.db.record_query_performance(record).await {
                warn!(error = %e, "Failed to record query performance row");
            } else {
                recorded += 1;
            }
        }
        debug!(recorded, "Query store imported");
        Ok(recorded)
    }

    /// Coarse platform metrics with baseline-backed health checks
    pub async fn collect_apm_metrics(&self) -> Result<()> {
        let listening = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM metadata.catalog WHERE status = 'LISTENING_CHANGES'",
        )
        .fetch_one(self.db.pool())
        .await?;
        let errored = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM metadata.catalog WHERE status = 'ERROR'",
        )
        .fetch_one(self.db.pool())
        .await?;
        let running_executions = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM metadata.workflow_executions WHERE status = 'RUNNING'",
        )
        .fetch_one(self.db.pool())
        .await?;
        let failed_last_hour = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM metadata.workflow_executions
            WHERE status = 'FAILED' AND created_at > NOW() - interval '1 hour'
            "#,
        )
        .fetch_one(self.db.pool())
        .await?;
        let api_feeds = self.db.list_active_api_feeds().await?.len();
        let csv_feeds = self.db.list_active_csv_feeds().await?.len();
        let sheet_feeds = self.db.list_active_sheet_feeds().await?.len();

        for (name, value) in [
            ("catalog.listening_tables", listening as f64),
            ("catalog.error_tables", errored as f64),
            ("workflows.running", running_executions as f64),
            ("workflows.failed_last_hour", failed_last_hour as f64),
            (
                "feeds.active",
                (api_feeds + csv_feeds + sheet_feeds) as f64,
            ),
        ] {
            let metric = ApmMetric {
                metric_name: name.to_string(),
                metric_value: value,
                tags: json!({}),
            };
            if let Err(e) = self.db.record_apm_metric(&metric).await {
                warn!(metric = name, error = %e, "Failed to record metric");
            }
            self.check_against_baseline(name, value).await;
        }
        Ok(())
    }

    async fn check_against_baseline(&self, metric_name: &str, value: f64) {
        let Ok(Some((baseline, threshold_pct))) = self.db.get_apm_baseline(metric_name).await
        else {
            return;
        };
        let limit = baseline * (1.0 + threshold_pct / 100.0);
        let (status, detail) = if value > limit {
            (
                "degraded",
                format!("{metric_name}={value} exceeds baseline {baseline} (+{threshold_pct}%)"),
            )
        } else {
            ("healthy", format!("{metric_name}={value}"))
        };
        if status == "degraded" {
            warn!(metric = metric_name, value, baseline, "APM baseline exceeded");
        }
        if let Err(e) = self
            .db
            .record_health_check(metric_name, status, Some(&detail))
            .await
        {
            warn!(error = %e, "Failed to record health check");
        }
    }
}
