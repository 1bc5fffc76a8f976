//! Bounded connection pool and the `Db` handle the rest of the core hangs
//! off. Every borrowed session is pinned to UTC when the config asks for
//! it, so stored UTC-second timestamps never shift with server zones.

use crate::errors::{CoreError, CoreResult, ErrorCode};
use crate::health::HealthState;
use crate::metrics::CoreMetrics;
use anyhow::{Context, Result};
use coffer_config::{CoreConfig, DbConfig};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlSslMode};
use sqlx::Executor;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared handle: pool + health supervisor + metrics + the few config
/// values the data layer needs at call time. Cheap to clone.
#[derive(Clone)]
pub struct Db {
    pool: MySqlPool,
    health: Arc<HealthState>,
    metrics: Arc<CoreMetrics>,
    slow_query_ms: u64,
    server_node: Option<String>,
}

impl Db {
    /// Open the pool with startup retries and security warnings, per the
    /// operator configuration. The pool is bounded; timeouts and lifetimes
    /// come straight from `db.pool`.
    pub async fn connect(cfg: &CoreConfig) -> Result<Db> {
        warn_insecure_defaults(&cfg.db);

        let connect_opts = MySqlConnectOptions::new()
            .host(&cfg.db.host)
            .port(cfg.db.port)
            .database(&cfg.db.database)
            .username(&cfg.db.user)
            .password(&cfg.db.password)
            .ssl_mode(if cfg.db.tls.enabled {
                MySqlSslMode::Required
            } else {
                MySqlSslMode::Disabled
            });

        let force_utc = cfg.db.session.force_utc;
        let pool_opts = MySqlPoolOptions::new()
            .max_connections(cfg.db.pool.max_pool_size)
            .min_connections(cfg.db.pool.minimum_idle)
            .acquire_timeout(Duration::from_millis(cfg.db.pool.connection_timeout_ms))
            .idle_timeout(Duration::from_millis(cfg.db.pool.idle_timeout_ms))
            .max_lifetime(Duration::from_millis(cfg.db.pool.max_lifetime_ms))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if force_utc {
                        conn.execute("SET time_zone = '+00:00'").await?;
                    }
                    Ok(())
                })
            });

        let attempts = cfg.db.pool.startup_attempts.max(1);
        let mut last_err = None;
        let mut pool = None;
        for attempt in 1..=attempts {
            match pool_opts.clone().connect_with(connect_opts.clone()).await {
                Ok(p) => {
                    pool = Some(p);
                    break;
                }
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "database connect failed");
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                    }
                }
            }
        }
        let pool = match pool {
            Some(p) => p,
            None => {
                return Err(anyhow::Error::new(last_err.context("no connect attempt ran")?)
                    .context("database unreachable after startup attempts"))
            }
        };

        Ok(Db {
            pool,
            health: Arc::new(HealthState::default()),
            metrics: Arc::new(CoreMetrics::default()),
            slow_query_ms: cfg.log.slow_query_ms,
            server_node: cfg.runtime.server_node.clone(),
        })
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    pub fn health(&self) -> &HealthState {
        &self.health
    }

    pub fn metrics(&self) -> &CoreMetrics {
        &self.metrics
    }

    pub fn server_node(&self) -> Option<&str> {
        self.server_node.as_deref()
    }

    /// Refuse the write right away when degraded.
    pub fn guard_write(&self, op: &'static str) -> CoreResult<()> {
        self.health.guard_write(op)
    }

    /// Classify a driver error, flip the supervisor on connection loss, and
    /// hand back the structured failure.
    pub fn fail(&self, op: &'static str, err: sqlx::Error) -> CoreError {
        let e = CoreError::from_sqlx(op, err);
        if e.code == ErrorCode::ConnectionLost {
            self.health.mark_degraded(op);
        }
        e
    }

    /// Emit `DB_SLOW_QUERY` when `started` is older than the configured
    /// threshold. Call at the end of any operation worth watching.
    pub fn observe_query(&self, op: &'static str, started: Instant) {
        let elapsed = started.elapsed();
        if self.slow_query_ms > 0 && elapsed >= Duration::from_millis(self.slow_query_ms) {
            CoreMetrics::incr(&self.metrics.slow_queries);
            tracing::warn!(
                code = %ErrorCode::DbSlowQuery,
                op,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow query"
            );
        }
    }

    /// Close the pool. In-flight writers observe `CONNECTION_LOST`.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn warn_insecure_defaults(db: &DbConfig) {
    if !db.tls.enabled && !db.is_loopback() {
        tracing::warn!(
            host = %db.host,
            "TLS is disabled against a non-loopback host; credentials and \
             ledger data travel in cleartext"
        );
    }
    if db.uses_default_credentials() {
        tracing::warn!("database credentials match the documented defaults; change them");
    }
}
