// Five-field cron schedules, matched per minute in UTC.
// Grammar: `*`, `a`, `a-b`, `a,b,c`, `*/n`, `a/n` for
// minute / hour / day-of-month / month / day-of-week.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

use crate::error::CoreError;

const NEXT_RUN_MAX_STEPS: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldPart {
    Any,
    Value(u32),
    Range(u32, u32),
    /// `*/n`: matches when value % n == 0
    AnyStep(u32),
    /// `a/n`: matches when value >= a and (value - a) % n == 0
    FromStep(u32, u32),
}

impl FieldPart {
    fn matches(&self, value: u32) -> bool {
        match *self {
            FieldPart::Any => true,
            FieldPart::Value(v) => value == v,
            FieldPart::Range(lo, hi) => value >= lo && value <= hi,
            FieldPart::AnyStep(step) => value % step == 0,
            FieldPart::FromStep(from, step) => value >= from && (value - from) % step == 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CronField {
    parts: Vec<FieldPart>,
}

impl CronField {
    fn parse(field: &str, min: u32, max: u32) -> Result<Self, CoreError> {
        let mut parts = Vec::new();
        for item in field.split(',') {
            parts.push(Self::parse_part(item, min, max)?);
        }
        if parts.is_empty() {
            return Err(CoreError::InvalidCron(field.to_string()));
        }
        Ok(Self { parts })
    }

    fn parse_part(item: &str, min: u32, max: u32) -> Result<FieldPart, CoreError> {
        let invalid = || CoreError::InvalidCron(item.to_string());

        if item == "*" {
            return Ok(FieldPart::Any);
        }
        if let Some((base, step)) = item.split_once('/') {
            let step: u32 = step.parse().map_err(|_| invalid())?;
            if step == 0 {
                return Err(invalid());
            }
            if base == "*" {
                return Ok(FieldPart::AnyStep(step));
            }
            let from: u32 = base.parse().map_err(|_| invalid())?;
            if from < min || from > max {
                return Err(invalid());
            }
            return Ok(FieldPart::FromStep(from, step));
        }
        if let Some((lo, hi)) = item.split_once('-') {
            let lo: u32 = lo.parse().map_err(|_| invalid())?;
            let hi: u32 = hi.parse().map_err(|_| invalid())?;
            if lo > hi || lo < min || hi > max {
                return Err(invalid());
            }
            return Ok(FieldPart::Range(lo, hi));
        }
        let value: u32 = item.parse().map_err(|_| invalid())?;
        if value < min || value > max {
            return Err(invalid());
        }
        Ok(FieldPart::Value(value))
    }

    fn matches(&self, value: u32) -> bool {
        self.parts.iter().any(|p| p.matches(value))
    }
}

/// A parsed five-field cron schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
    source: String,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CoreError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CoreError::InvalidCron(expr.to_string()));
        }
        Ok(Self {
            minute: CronField::parse(fields[0], 0, 59)?,
            hour: CronField::parse(fields[1], 0, 23)?,
            day_of_month: CronField::parse(fields[2], 1, 31)?,
            month: CronField::parse(fields[3], 1, 12)?,
            // 7 is accepted as an alias for Sunday and normalized at match time
            day_of_week: CronField::parse(fields[4], 0, 7)?,
            source: expr.to_string(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// A schedule matches `t` iff every field matches t's UTC component.
    /// Seconds are ignored; the scheduler evaluates once per minute.
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        let dow = t.weekday().num_days_from_sunday() % 7;
        self.minute.matches(t.minute())
            && self.hour.matches(t.hour())
            && self.day_of_month.matches(t.day())
            && self.month.matches(t.month())
            && (self.day_of_week.matches(dow) || (dow == 0 && self.day_of_week.matches(7)))
    }

    /// First matching minute strictly after `t`. Scans forward bounded to
    /// 10 000 steps; non-matching days and hours advance in one step each, so
    /// the bound covers any yearly schedule.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = t
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(t)
            + Duration::minutes(1);
        for _ in 0..NEXT_RUN_MAX_STEPS {
            let dow = candidate.weekday().num_days_from_sunday() % 7;
            let day_ok = self.month.matches(candidate.month())
                && self.day_of_month.matches(candidate.day())
                && (self.day_of_week.matches(dow)
                    || (dow == 0 && self.day_of_week.matches(7)));
            if !day_ok {
                candidate = (candidate + Duration::days(1))
                    .with_hour(0)
                    .and_then(|t| t.with_minute(0))?;
                continue;
            }
            if !self.hour.matches(candidate.hour()) {
                candidate = (candidate + Duration::hours(1)).with_minute(0)?;
                continue;
            }
            if !self.minute.matches(candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }
            return Some(candidate);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn monday_nine_am() {
        let schedule = CronSchedule::parse("0 9 * * 1").unwrap();
        // 2024-01-01 is a Monday
        assert!(schedule.matches(at(2024, 1, 1, 9, 0)));
        assert!(!schedule.matches(at(2024, 1, 1, 9, 1)));
        assert!(!schedule.matches(at(2024, 1, 2, 9, 0)));
    }

    #[test]
    fn wildcard_matches_everything() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        assert!(schedule.matches(at(2024, 6, 15, 23, 59)));
    }

    #[test]
    fn step_expressions() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        assert!(schedule.matches(at(2024, 1, 1, 0, 0)));
        assert!(schedule.matches(at(2024, 1, 1, 0, 45)));
        assert!(!schedule.matches(at(2024, 1, 1, 0, 20)));

        let schedule = CronSchedule::parse("5/10 * * * *").unwrap();
        assert!(schedule.matches(at(2024, 1, 1, 0, 5)));
        assert!(schedule.matches(at(2024, 1, 1, 0, 25)));
        assert!(!schedule.matches(at(2024, 1, 1, 0, 0)));
        assert!(!schedule.matches(at(2024, 1, 1, 0, 4)));
    }

    #[test]
    fn ranges_and_lists() {
        let schedule = CronSchedule::parse("0 9-17 * * 1,2,3,4,5").unwrap();
        assert!(schedule.matches(at(2024, 1, 3, 12, 0))); // Wednesday
        assert!(!schedule.matches(at(2024, 1, 6, 12, 0))); // Saturday
        assert!(!schedule.matches(at(2024, 1, 3, 18, 0)));
    }

    #[test]
    fn sunday_as_seven() {
        let schedule = CronSchedule::parse("0 0 * * 7").unwrap();
        // 2024-01-07 is a Sunday
        assert!(schedule.matches(at(2024, 1, 7, 0, 0)));
        assert!(!schedule.matches(at(2024, 1, 8, 0, 0)));
    }

    #[test]
    fn unparseable_strings_are_errors() {
        for bad in ["", "* * * *", "61 * * * *", "* 25 * * *", "a b c d e", "*/0 * * * *", "9-1 * * * *"] {
            assert!(CronSchedule::parse(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn next_after_scans_forward() {
        let schedule = CronSchedule::parse("30 10 * * *").unwrap();
        let next = schedule.next_after(at(2024, 1, 1, 9, 0)).unwrap();
        assert_eq!(next, at(2024, 1, 1, 10, 30));

        // Already past today's slot: tomorrow
        let next = schedule.next_after(at(2024, 1, 1, 10, 30)).unwrap();
        assert_eq!(next, at(2024, 1, 2, 10, 30));
    }

    #[test]
    fn next_after_handles_yearly_schedule() {
        let schedule = CronSchedule::parse("0 0 1 7 *").unwrap();
        let next = schedule.next_after(at(2024, 7, 1, 0, 0)).unwrap();
        assert_eq!(next, at(2025, 7, 1, 0, 0));
    }
}
