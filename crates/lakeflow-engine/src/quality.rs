// Quality validator: per-table metrics for everything currently in
// LISTENING_CHANGES.

use anyhow::Result;
use lakeflow_core::CatalogStatus;
use lakeflow_storage::{Database, DataQualityRecord};
use tracing::{info, warn};

/// Size drift beyond this fraction of the cataloged size flags a warning
const DRIFT_WARN_FRACTION: f64 = 0.5;

#[derive(Clone)]
pub struct QualityValidator {
    db: Database,
}

impl QualityValidator {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Validate up to `max_tables` listening tables; returns how many were
    /// checked.
    pub async fn validate_listening_tables(&self, max_tables: i64) -> Result<usize> {
        let entries = self
            .db
            .list_catalog_entries_in_status(CatalogStatus::ListeningChanges, max_tables)
            .await?;
        let mut checked = 0usize;
        for entry in entries {
            match self.validate_entry(&entry).await {
                Ok(record) => {
                    if record.status != "pass" {
                        warn!(
                            schema = %record.schema_name,
                            table = %record.table_name,
                            status = %record.status,
                            rows = record.row_count,
                            "Quality check flagged table"
                        );
                    }
                    if let Err(e) = self.db.record_data_quality(&record).await {
                        warn!(error = %e, "Failed to persist quality record");
                    }
                    checked += 1;
                }
                Err(e) => {
                    warn!(
                        schema = %entry.schema_name,
                        table = %entry.table_name,
                        error = %e,
                        "Quality check failed"
                    );
                }
            }
        }
        if checked > 0 {
            info!(checked, "Quality validation cycle finished");
        }
        Ok(checked)
    }

    async fn validate_entry(
        &self,
        entry: &lakeflow_storage::CatalogEntryRow,
    ) -> Result<DataQualityRecord> {
        let row_count = self
            .db
            .target_row_count(&entry.schema_name, &entry.table_name)
            .await?
            .unwrap_or(0);
        let column_count = self
            .db
            .target_column_count(&entry.schema_name, &entry.table_name)
            .await? as i32;

        let null_fraction = match &entry.last_sync_column {
            Some(column) => {
                self.db
                    .target_null_fraction(&entry.schema_name, &entry.table_name, column)
                    .await?
            }
            None => None,
        };

        let size_drift_pct = drift_pct(entry.table_size, row_count);
        let status = classify(row_count, size_drift_pct);

        Ok(DataQualityRecord {
            schema_name: entry.schema_name.clone(),
            table_name: entry.table_name.clone(),
            db_engine: entry.db_engine.clone(),
            row_count,
            column_count,
            null_fraction,
            size_drift_pct,
            status: status.to_string(),
        })
    }
}

fn drift_pct(expected: i64, actual: i64) -> Option<f64> {
    if expected <= 0 {
        return None;
    }
    Some(((actual - expected).abs() as f64 / expected as f64) * 100.0)
}

fn classify(row_count: i64, drift_pct: Option<f64>) -> &'static str {
    if row_count == 0 {
        return "warn";
    }
    match drift_pct {
        Some(pct) if pct > DRIFT_WARN_FRACTION * 100.0 => "warn",
        _ => "pass",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drift_is_relative_to_expected() {
        assert_eq!(drift_pct(100, 150), Some(50.0));
        assert_eq!(drift_pct(100, 50), Some(50.0));
        assert_eq!(drift_pct(0, 50), None);
        assert_eq!(drift_pct(-1, 50), None);
    }

    #[test]
    fn classification() {
        assert_eq!(classify(0, None), "warn");
        assert_eq!(classify(100, Some(10.0)), "pass");
        assert_eq!(classify(100, Some(60.0)), "warn");
        assert_eq!(classify(100, None), "pass");
    }
}
