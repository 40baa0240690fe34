// Backfill manager: slices a date range into periods and re-executes the
// workflow per period, optionally in bounded parallel.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Datelike, Duration, NaiveDate};
use futures::future::join_all;
use lakeflow_core::{CoreError, TriggerType};
use lakeflow_storage::Database;
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::executor::WorkflowExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillInterval {
    Daily,
    Weekly,
    Monthly,
}

impl FromStr for BackfillInterval {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(BackfillInterval::Daily),
            "weekly" => Ok(BackfillInterval::Weekly),
            "monthly" => Ok(BackfillInterval::Monthly),
            other => Err(CoreError::config(format!("unknown interval: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    pub workflow_name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub date_field: String,
    pub interval: BackfillInterval,
    pub parallel: bool,
    pub max_parallel_jobs: usize,
}

/// Inclusive period boundaries covering [start, end]
pub fn generate_periods(
    start: NaiveDate,
    end: NaiveDate,
    interval: BackfillInterval,
) -> Vec<(NaiveDate, NaiveDate)> {
    let mut periods = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        let next = match interval {
            BackfillInterval::Daily => cursor + Duration::days(1),
            BackfillInterval::Weekly => cursor + Duration::days(7),
            BackfillInterval::Monthly => add_month(cursor),
        };
        let period_end = std::cmp::min(next - Duration::days(1), end);
        periods.push((cursor, period_end));
        cursor = next;
    }
    periods
}

fn add_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    // Clamp the day for short months
    let mut day = date.day();
    loop {
        if let Some(next) = NaiveDate::from_ymd_opt(year, month, day) {
            return next;
        }
        day -= 1;
    }
}

#[derive(Clone)]
pub struct BackfillManager {
    db: Database,
    executor: WorkflowExecutor,
}

impl BackfillManager {
    pub fn new(db: Database, executor: WorkflowExecutor) -> Self {
        Self { db, executor }
    }

    /// Run the whole backfill; returns the number of periods launched.
    pub async fn execute_backfill(&self, config: &BackfillConfig) -> Result<usize> {
        if config.start_date > config.end_date {
            anyhow::bail!(
                "backfill start {} is after end {}",
                config.start_date,
                config.end_date
            );
        }
        let periods = generate_periods(config.start_date, config.end_date, config.interval);
        info!(
            workflow = %config.workflow_name,
            periods = periods.len(),
            parallel = config.parallel,
            "Starting backfill"
        );

        if config.parallel && config.max_parallel_jobs > 1 {
            let semaphore = Arc::new(Semaphore::new(config.max_parallel_jobs));
            let jobs = periods.iter().map(|&(period_start, period_end)| {
                let semaphore = semaphore.clone();
                let manager = self.clone();
                let config = config.clone();
                async move {
                    let _permit = semaphore.acquire().await;
                    manager
                        .execute_period(&config, period_start, period_end)
                        .await;
                }
            });
            join_all(jobs).await;
        } else {
            for &(period_start, period_end) in &periods {
                self.execute_period(config, period_start, period_end).await;
            }
        }

        info!(workflow = %config.workflow_name, "Backfill completed");
        Ok(periods.len())
    }

    async fn execute_period(
        &self,
        config: &BackfillConfig,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) {
        info!(
            workflow = %config.workflow_name,
            field = %config.date_field,
            period_start = %period_start,
            period_end = %period_end,
            "Executing backfill period"
        );
        let detail = format!(
            "{} [{period_start} .. {period_end}]",
            config.date_field
        );
        match self
            .executor
            .execute_workflow(&config.workflow_name, TriggerType::Manual)
            .await
        {
            Ok(execution) => {
                let _ = self
                    .db
                    .log_process(
                        &execution.execution_id,
                        "backfill_manager",
                        "execute_period",
                        &execution.status,
                        Some(&detail),
                    )
                    .await;
            }
            Err(e) => {
                error!(
                    workflow = %config.workflow_name,
                    period_start = %period_start,
                    error = %e,
                    "Backfill period failed to launch"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn daily_periods_cover_range_inclusively() {
        let periods = generate_periods(d(2024, 1, 1), d(2024, 1, 3), BackfillInterval::Daily);
        assert_eq!(
            periods,
            vec![
                (d(2024, 1, 1), d(2024, 1, 1)),
                (d(2024, 1, 2), d(2024, 1, 2)),
                (d(2024, 1, 3), d(2024, 1, 3)),
            ]
        );
    }

    #[test]
    fn weekly_periods_clamp_final_boundary() {
        let periods = generate_periods(d(2024, 1, 1), d(2024, 1, 10), BackfillInterval::Weekly);
        assert_eq!(
            periods,
            vec![
                (d(2024, 1, 1), d(2024, 1, 7)),
                (d(2024, 1, 8), d(2024, 1, 10)),
            ]
        );
    }

    #[test]
    fn monthly_periods_handle_short_months() {
        let periods = generate_periods(d(2024, 1, 31), d(2024, 3, 15), BackfillInterval::Monthly);
        assert_eq!(periods[0], (d(2024, 1, 31), d(2024, 2, 28)));
        // 2024 is a leap year: Jan 31 + 1 month clamps to Feb 29
        assert_eq!(periods[1].0, d(2024, 2, 29));
    }

    #[test]
    fn single_day_range() {
        let periods = generate_periods(d(2024, 6, 1), d(2024, 6, 1), BackfillInterval::Daily);
        assert_eq!(periods, vec![(d(2024, 6, 1), d(2024, 6, 1))]);
    }

    #[test]
    fn interval_parsing() {
        assert_eq!(
            "daily".parse::<BackfillInterval>().unwrap(),
            BackfillInterval::Daily
        );
        assert_eq!(
            "Weekly".parse::<BackfillInterval>().unwrap(),
            BackfillInterval::Weekly
        );
        assert!("hourly".parse::<BackfillInterval>().is_err());
    }
}
