// Runtime configuration hot-reloaded from metadata.config.
// Every key has a clamped legal range; invalid values are silently ignored
// (the caller decides whether to log).

use serde::{Deserialize, Serialize};

pub const CONFIG_KEYS: &[&str] = &[
    "chunk_size",
    "sync_interval",
    "max_workers",
    "max_tables_per_cycle",
    "lock_retry_sleep_ms",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Rows per batch in transfers (1..2^30)
    pub chunk_size: u32,
    /// Base cycle period in seconds (5..3600)
    pub sync_interval: u64,
    /// Parallelism cap for per-engine transfers (1..128)
    pub max_workers: u32,
    /// Upper bound on tables touched per sync pass (1..10^6)
    pub max_tables_per_cycle: u32,
    /// Catalog-lock spin interval in milliseconds (100..10000)
    pub lock_retry_sleep_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            sync_interval: 60,
            max_workers: 4,
            max_tables_per_cycle: 100,
            lock_retry_sleep_ms: 500,
        }
    }
}

impl RuntimeConfig {
    /// Apply one key/value pair. Returns true when the value was accepted.
    pub fn apply(&mut self, key: &str, value: &str) -> bool {
        match key {
            "chunk_size" => parse_in_range(value, 1, 1 << 30).map(|v| self.chunk_size = v),
            "sync_interval" => parse_in_range(value, 5, 3600).map(|v| self.sync_interval = v),
            "max_workers" => parse_in_range(value, 1, 128).map(|v| self.max_workers = v),
            "max_tables_per_cycle" => {
                parse_in_range(value, 1, 1_000_000).map(|v| self.max_tables_per_cycle = v)
            }
            "lock_retry_sleep_ms" => {
                parse_in_range(value, 100, 10_000).map(|v| self.lock_retry_sleep_ms = v)
            }
            _ => None,
        }
        .is_some()
    }

    /// Transfer loop cadence: max(5, sync_interval / 4) seconds
    pub fn transfer_interval(&self) -> u64 {
        (self.sync_interval / 4).max(5)
    }

    pub fn quality_interval(&self) -> u64 {
        self.sync_interval * 2
    }

    pub fn maintenance_interval(&self) -> u64 {
        self.sync_interval * 4
    }
}

fn parse_in_range<T: std::str::FromStr + PartialOrd + Copy>(
    value: &str,
    min: T,
    max: T,
) -> Option<T> {
    let parsed = value.trim().parse::<T>().ok()?;
    (parsed >= min && parsed <= max).then_some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_values_in_range() {
        let mut config = RuntimeConfig::default();
        assert!(config.apply("chunk_size", "500"));
        assert_eq!(config.chunk_size, 500);
        assert!(config.apply("sync_interval", "30"));
        assert_eq!(config.sync_interval, 30);
        assert!(config.apply("max_workers", "128"));
        assert_eq!(config.max_workers, 128);
        assert!(config.apply("lock_retry_sleep_ms", "100"));
        assert_eq!(config.lock_retry_sleep_ms, 100);
    }

    #[test]
    fn rejects_out_of_range_silently() {
        let mut config = RuntimeConfig::default();
        assert!(!config.apply("sync_interval", "4"));
        assert!(!config.apply("sync_interval", "3601"));
        assert!(!config.apply("max_workers", "0"));
        assert!(!config.apply("lock_retry_sleep_ms", "10001"));
        assert!(!config.apply("chunk_size", "-1"));
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn rejects_garbage_and_unknown_keys() {
        let mut config = RuntimeConfig::default();
        assert!(!config.apply("sync_interval", "soon"));
        assert!(!config.apply("nope", "1"));
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn derived_intervals() {
        let mut config = RuntimeConfig::default();
        config.apply("sync_interval", "60");
        assert_eq!(config.transfer_interval(), 15);
        assert_eq!(config.quality_interval(), 120);
        assert_eq!(config.maintenance_interval(), 240);

        config.apply("sync_interval", "8");
        assert_eq!(config.transfer_interval(), 5);
    }
}
