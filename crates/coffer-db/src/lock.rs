//! Named database advisory locks (`GET_LOCK` / `RELEASE_LOCK`).
//!
//! Lock names are validated against a strict character class and always
//! bound as parameters, never interpolated. A lock is session-bound, so the
//! guard owns its pooled connection for the whole critical section; if the
//! guard is dropped without an explicit release, the connection is detached
//! from the pool and closed, which releases the lock server-side.

use crate::errors::{CoreError, CoreResult, ErrorCode};
use crate::pool::Db;
use sqlx::pool::PoolConnection;
use sqlx::MySql;

pub const MAX_LOCK_NAME_LEN: usize = 64;

/// `[A-Za-z0-9:_\-\.]{1,64}`
pub fn is_valid_lock_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_LOCK_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '.'))
}

/// Holds a named advisory lock on a dedicated session.
pub struct AdvisoryLock {
    conn: Option<PoolConnection<MySql>>,
    name: String,
}

impl AdvisoryLock {
    /// Try to take `name` without blocking. `Ok(None)` means another
    /// session holds it.
    pub async fn try_acquire(db: &Db, name: &str) -> CoreResult<Option<AdvisoryLock>> {
        if !is_valid_lock_name(name) {
            return Err(CoreError::new(
                ErrorCode::MigrationLocked,
                "lock.acquire",
                format!("invalid lock name: {name:?}"),
            ));
        }

        let mut conn = db
            .pool()
            .acquire()
            .await
            .map_err(|e| db.fail("lock.acquire", e))?;

        let got: Option<i64> = sqlx::query_scalar("SELECT GET_LOCK(?, 0)")
            .bind(name)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| db.fail("lock.acquire", e))?;

        if got == Some(1) {
            Ok(Some(AdvisoryLock {
                conn: Some(conn),
                name: name.to_string(),
            }))
        } else {
            Ok(None)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock and return the session to the pool.
    pub async fn release(mut self) -> CoreResult<()> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query_scalar::<_, Option<i64>>("SELECT RELEASE_LOCK(?)")
                .bind(&self.name)
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| CoreError::from_sqlx("lock.release", e))?;
        }
        Ok(())
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Not released explicitly: close the session instead of handing
            // a still-locked connection back to the pool.
            tracing::warn!(lock = %self.name, "advisory lock dropped without release, closing session");
            drop(conn.detach());
        }
    }
}

/// Probe whether `name` is currently free, without holding it.
pub async fn is_free(db: &Db, name: &str) -> CoreResult<bool> {
    if !is_valid_lock_name(name) {
        return Err(CoreError::new(
            ErrorCode::MigrationLocked,
            "lock.probe",
            format!("invalid lock name: {name:?}"),
        ));
    }
    let free: Option<i64> = sqlx::query_scalar("SELECT IS_FREE_LOCK(?)")
        .bind(name)
        .fetch_one(db.pool())
        .await
        .map_err(|e| db.fail("lock.probe", e))?;
    Ok(free == Some(1))
}
