//! Degraded-mode supervisor.
//!
//! The supervisor gates writes: while `Degraded`, write operations return
//! `DEGRADED_MODE` immediately and never touch the database. A background
//! probe runs a read (`SELECT 1`) and a harmless write (self-update on the
//! request log) every `reconnectEveryS` seconds; the first successful probe
//! flips the state back to `Healthy`.

use crate::errors::{CoreError, CoreResult, ErrorCode};
use crate::pool::Db;
use sqlx::Executor;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Reserved idempotency scope for the probe's harmless write.
pub const PROBE_SCOPE: &str = "core:probe";

/// Refusals are logged at most once per operation in this window.
const REFUSAL_LOG_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
        }
    }
}

#[derive(Debug)]
pub struct HealthState {
    degraded: AtomicBool,
    last_refusal_log: Mutex<HashMap<&'static str, Instant>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            degraded: AtomicBool::new(false),
            last_refusal_log: Mutex::new(HashMap::new()),
        }
    }
}

impl HealthState {
    pub fn status(&self) -> HealthStatus {
        if self.degraded.load(Ordering::Acquire) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn mark_degraded(&self, op: &'static str) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            tracing::error!(code = %ErrorCode::ConnectionLost, op, "entering degraded mode");
        }
    }

    pub fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            tracing::info!("database reachable again, leaving degraded mode");
        }
    }

    /// Refuse a write while degraded. Logging is rate-limited per operation
    /// so a chatty caller cannot flood the log.
    pub fn guard_write(&self, op: &'static str) -> CoreResult<()> {
        if !self.is_degraded() {
            return Ok(());
        }
        let should_log = {
            let mut last = self
                .last_refusal_log
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let now = Instant::now();
            match last.get(op) {
                Some(at) if now.duration_since(*at) < REFUSAL_LOG_WINDOW => false,
                _ => {
                    last.insert(op, now);
                    true
                }
            }
        };
        if should_log {
            tracing::warn!(code = %ErrorCode::DegradedMode, op, "write refused while degraded");
        }
        Err(CoreError::new(
            ErrorCode::DegradedMode,
            op,
            "database unavailable, write refused",
        ))
    }
}

/// One probe round: read then harmless write. Both must succeed for the
/// node to count as healthy.
pub async fn probe_once(db: &Db) -> bool {
    let read = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(db.pool())
        .await;
    if read.is_err() {
        return false;
    }

    // Self-update on the request log under the reserved probe scope. The
    // row carries zeroed hashes and an already-passed expiry so the sweep
    // reclaims it like any other expired request.
    let now = crate::now_ts();
    let write = db
        .pool()
        .execute(
            sqlx::query(
                r#"
                INSERT INTO core_requests (scope, key_hash, payload_hash, ok, created_at, expires_at)
                VALUES (?, ?, ?, 1, ?, ?)
                ON DUPLICATE KEY UPDATE created_at = VALUES(created_at), expires_at = VALUES(expires_at)
                "#,
            )
            .bind(PROBE_SCOPE)
            .bind(&[0u8; 32][..])
            .bind(&[0u8; 32][..])
            .bind(now)
            .bind(now),
        )
        .await;
    write.is_ok()
}

/// Spawn the background probe task. Runs until the returned handle is
/// aborted (pool shutdown) or the process exits.
pub fn spawn_probe(db: Db, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if probe_once(&db).await {
                db.health().mark_healthy();
            } else {
                db.health().mark_degraded("health.probe");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_write_refuses_only_while_degraded() {
        let h = HealthState::default();
        assert!(h.guard_write("wallet.deposit").is_ok());

        h.mark_degraded("test");
        let err = h.guard_write("wallet.deposit").unwrap_err();
        assert_eq!(err.code, ErrorCode::DegradedMode);

        h.mark_healthy();
        assert!(h.guard_write("wallet.deposit").is_ok());
    }

    #[test]
    fn degraded_transitions_are_idempotent() {
        let h = HealthState::default();
        h.mark_degraded("test");
        h.mark_degraded("test");
        assert_eq!(h.status(), HealthStatus::Degraded);
        h.mark_healthy();
        h.mark_healthy();
        assert_eq!(h.status(), HealthStatus::Healthy);
    }
}
