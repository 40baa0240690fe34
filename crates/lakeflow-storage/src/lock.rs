// Cluster-wide named mutual exclusion backed by metadata.catalog_locks.
//
// Protocol per attempt, in one transaction: delete expired rows, then
// insert-if-absent our (lock_name, host, session_id, now + ttl). A returned
// row means we own the lock. Release deletes only when lock_name AND
// session_id match, so a stale holder cannot clobber a successor.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, warn};

use crate::db::Database;

const MAX_TTL_SECONDS: i64 = 3600;
const DEFAULT_RETRY_SLEEP_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquisition {
    Acquired,
    TimedOut,
}

impl LockAcquisition {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockAcquisition::Acquired)
    }
}

pub struct CatalogLock {
    db: Database,
    lock_name: String,
    session_id: String,
    host: String,
    retry_sleep: Duration,
    acquired: bool,
}

impl CatalogLock {
    pub fn new(db: Database, lock_name: impl Into<String>) -> Self {
        Self {
            db,
            lock_name: lock_name.into(),
            session_id: format!("{:016x}", rand::random::<u64>()),
            host: hostname(),
            retry_sleep: Duration::from_millis(DEFAULT_RETRY_SLEEP_MS),
            acquired: false,
        }
    }

    /// Spin interval between attempts, clamped to [100, 10000] ms
    pub fn with_retry_sleep_ms(mut self, ms: u64) -> Self {
        self.retry_sleep = Duration::from_millis(ms.clamp(100, 10_000));
        self
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Try to take the lock with the given TTL, waiting up to `max_wait`.
    /// A TTL outside (0, 3600] times out without touching the database.
    /// Database failures count as "did not acquire" and the loop keeps
    /// retrying until the wait budget runs out.
    pub async fn try_acquire(
        &mut self,
        ttl_seconds: i64,
        max_wait: Duration,
    ) -> LockAcquisition {
        if ttl_seconds <= 0 || ttl_seconds > MAX_TTL_SECONDS {
            warn!(
                lock = %self.lock_name,
                ttl_seconds,
                "Refusing lock with out-of-range TTL"
            );
            return LockAcquisition::TimedOut;
        }

        let started = tokio::time::Instant::now();
        loop {
            match self.attempt(ttl_seconds).await {
                Ok(true) => {
                    self.acquired = true;
                    debug!(lock = %self.lock_name, session = %self.session_id, "Acquired lock");
                    return LockAcquisition::Acquired;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(lock = %self.lock_name, error = %e, "Lock attempt failed");
                }
            }

            if started.elapsed() >= max_wait {
                warn!(
                    lock = %self.lock_name,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Failed to acquire lock within wait budget"
                );
                return LockAcquisition::TimedOut;
            }
            tokio::time::sleep(self.retry_sleep).await;
        }
    }

    async fn attempt(&self, ttl_seconds: i64) -> Result<bool> {
        let mut tx = self.db.pool().begin().await?;

        // Shared cleanup policy: any acquirer may remove expired rows
        let cleaned = sqlx::query("DELETE FROM metadata.catalog_locks WHERE expires_at < NOW()")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if cleaned > 0 {
            debug!(cleaned, "Removed expired catalog locks");
        }

        let expires_at = Utc::now() + chrono::Duration::seconds(ttl_seconds);
        let inserted = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO metadata.catalog_locks (lock_name, acquired_by, session_id, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (lock_name) DO NOTHING
            RETURNING lock_name
            "#,
        )
        .bind(&self.lock_name)
        .bind(&self.host)
        .bind(&self.session_id)
        .bind(expires_at)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted.is_some())
    }

    /// Keep the row until its TTL expires instead of releasing on drop.
    /// Per-minute schedulers use this so a fast dispatch cannot double-fire
    /// on a peer that wakes within the same window.
    pub fn hold_until_expiry(mut self) {
        self.acquired = false;
    }

    /// Idempotent; deletes the row only when our session still holds it.
    pub async fn release(&mut self) -> Result<()> {
        if !self.acquired {
            return Ok(());
        }
        sqlx::query(
            "DELETE FROM metadata.catalog_locks WHERE lock_name = $1 AND session_id = $2",
        )
        .bind(&self.lock_name)
        .bind(&self.session_id)
        .execute(self.db.pool())
        .await?;
        self.acquired = false;
        debug!(lock = %self.lock_name, "Released lock");
        Ok(())
    }
}

impl Drop for CatalogLock {
    // Backstop for early returns: release in the background. The TTL covers
    // the case where the process dies before the spawned task runs.
    fn drop(&mut self) {
        if !self.acquired {
            return;
        }
        let pool = self.db.pool().clone();
        let lock_name = std::mem::take(&mut self.lock_name);
        let session_id = std::mem::take(&mut self.session_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let result = sqlx::query(
                    "DELETE FROM metadata.catalog_locks WHERE lock_name = $1 AND session_id = $2",
                )
                .bind(&lock_name)
                .bind(&session_id)
                .execute(&pool)
                .await;
                if let Err(e) = result {
                    error!(lock = %lock_name, error = %e, "Failed to release lock on drop");
                }
            });
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}
