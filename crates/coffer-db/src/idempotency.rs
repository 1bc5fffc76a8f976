//! Idempotency registry: a `(scope, key)`-keyed request log that makes any
//! named operation exactly-once within a retention window.
//!
//! The registry stores the SHA-256 of the caller's key and of the
//! operation's canonical payload. A replay with the same payload is
//! acknowledged without re-running the work; the same key with a different
//! payload is a caller bug and is rejected. Once a row is marked `ok`,
//! neither its payload hash nor the flag ever changes.

use crate::errors::{is_duplicate_key, CoreError, CoreResult, ErrorCode};
use crate::metrics::CoreMetrics;
use crate::pool::Db;
use futures_util::future::BoxFuture;
use sha2::{Digest, Sha256};
use sqlx::{MySql, Row, Transaction};

/// Default request retention: 30 days.
pub const DEFAULT_TTL_SECS: u64 = 30 * 86_400;

/// Outcome of [`apply_idempotent`].
#[derive(Debug)]
pub enum IdemOutcome<T> {
    /// The work ran and committed; `T` is its result.
    Success(T),
    /// The same `(scope, key, payload)` already committed once.
    Replay,
    /// The key was seen before with a different payload; nothing ran.
    Mismatch,
    /// The work itself refused; the transaction was rolled back.
    WorkFailed(CoreError),
    /// The registry could not do its own bookkeeping.
    DbError(CoreError),
}

pub fn hash_key(key: &str) -> [u8; 32] {
    sha256(key.as_bytes())
}

pub fn hash_payload(payload: &str) -> [u8; 32] {
    sha256(payload.as_bytes())
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// The work closure runs inside the registry's transaction. A `CoreError`
/// rolls everything back (`WorkFailed`); an `Ok` marks the request done and
/// commits atomically with the work's own writes.
pub type IdemWork<'a, T> = Box<
    dyn for<'t> FnOnce(&'t mut Transaction<'static, MySql>) -> BoxFuture<'t, CoreResult<T>>
        + Send
        + 'a,
>;

/// Run `work` at most once for `(scope, key)`.
///
/// Algorithm: insert-or-leave the request row, lock it, compare the payload
/// hash, short-circuit replays, run the work, flip `ok`, commit. All inside
/// one transaction so a crash anywhere leaves either nothing or the
/// complete effect.
pub async fn apply_idempotent<T>(
    db: &Db,
    scope: &str,
    key: &str,
    payload_hash: [u8; 32],
    ttl_secs: u64,
    work: IdemWork<'_, T>,
) -> IdemOutcome<T> {
    let op = "idempotency.apply";
    let key_hash = hash_key(key);
    let now = crate::now_ts();

    let mut tx = match db.pool().begin().await {
        Ok(tx) => tx,
        Err(e) => return IdemOutcome::DbError(db.fail(op, e)),
    };

    // Insert-or-leave. INSERT IGNORE keeps an existing row untouched, which
    // is exactly the semantics the replay check below needs.
    let insert = sqlx::query(
        r#"
        INSERT IGNORE INTO core_requests (scope, key_hash, payload_hash, ok, created_at, expires_at)
        VALUES (?, ?, ?, 0, ?, ?)
        "#,
    )
    .bind(scope)
    .bind(&key_hash[..])
    .bind(&payload_hash[..])
    .bind(now)
    .bind(now + ttl_secs)
    .execute(&mut *tx)
    .await;
    if let Err(e) = insert {
        // A concurrent inserter racing us to the same key is fine, the row
        // lock below serializes the decision.
        if !is_duplicate_key(&e) {
            return IdemOutcome::DbError(db.fail(op, e));
        }
    }

    let row = sqlx::query(
        r#"
        SELECT payload_hash, ok FROM core_requests
        WHERE scope = ? AND key_hash = ?
        FOR UPDATE
        "#,
    )
    .bind(scope)
    .bind(&key_hash[..])
    .fetch_one(&mut *tx)
    .await;
    let row = match row {
        Ok(row) => row,
        Err(e) => return IdemOutcome::DbError(db.fail(op, e)),
    };

    let stored_payload: Vec<u8> = match row.try_get("payload_hash") {
        Ok(v) => v,
        Err(e) => return IdemOutcome::DbError(db.fail(op, e)),
    };
    let already_ok: bool = match row.try_get::<i8, _>("ok") {
        Ok(v) => v != 0,
        Err(e) => return IdemOutcome::DbError(db.fail(op, e)),
    };

    if stored_payload != payload_hash {
        let _ = tx.rollback().await;
        CoreMetrics::incr(&db.metrics().idem_mismatches);
        return IdemOutcome::Mismatch;
    }

    if already_ok {
        if let Err(e) = tx.commit().await {
            return IdemOutcome::DbError(db.fail(op, e));
        }
        CoreMetrics::incr(&db.metrics().idem_replays);
        return IdemOutcome::Replay;
    }

    let result = match work(&mut tx).await {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback().await;
            return IdemOutcome::WorkFailed(e);
        }
    };

    let mark = sqlx::query(
        r#"
        UPDATE core_requests SET ok = 1
        WHERE scope = ? AND key_hash = ?
        "#,
    )
    .bind(scope)
    .bind(&key_hash[..])
    .execute(&mut *tx)
    .await;
    if let Err(e) = mark {
        let _ = tx.rollback().await;
        return IdemOutcome::DbError(db.fail(op, e));
    }

    if let Err(e) = tx.commit().await {
        return IdemOutcome::DbError(db.fail(op, e));
    }
    IdemOutcome::Success(result)
}

/// One sweep round: delete up to `batch_limit` expired rows, repeating
/// while a full batch was deleted. `retention_days > 0` narrows the sweep:
/// an expired row is reclaimed only once it is also older than the
/// retention horizon.
pub async fn sweep_expired(
    db: &Db,
    batch_limit: u32,
    retention_days: u32,
) -> CoreResult<u64> {
    let op = "idempotency.sweep";
    let now = crate::now_ts();
    let batch = batch_limit.max(1) as u64;
    let cutoff = if retention_days > 0 {
        Some(now.saturating_sub(retention_days as u64 * 86_400))
    } else {
        None
    };

    let mut total = 0u64;
    loop {
        // DELETE ... LIMIT is MariaDB/MySQL dialect, which is the only
        // dialect this engine targets.
        let deleted = match cutoff {
            Some(cutoff) => sqlx::query(
                r#"
                DELETE FROM core_requests
                WHERE expires_at <= ? AND created_at <= ?
                LIMIT ?
                "#,
            )
            .bind(now)
            .bind(cutoff)
            .bind(batch)
            .execute(db.pool())
            .await,
            None => sqlx::query(
                r#"
                DELETE FROM core_requests
                WHERE expires_at <= ?
                LIMIT ?
                "#,
            )
            .bind(now)
            .bind(batch)
            .execute(db.pool())
            .await,
        };

        let affected = deleted.map_err(|e| db.fail(op, e))?.rows_affected();
        total += affected;
        if affected < batch {
            break;
        }
    }

    if total > 0 {
        CoreMetrics::add(&db.metrics().requests_swept, total);
        tracing::info!(op, deleted = total, "swept expired requests");
    }
    Ok(total)
}

/// Convenience wrapper for callers that do not need transactional work:
/// records the request and reports whether it was fresh.
pub async fn record_once(
    db: &Db,
    scope: &str,
    key: &str,
    payload: &str,
    ttl_secs: u64,
) -> CoreResult<bool> {
    let payload_hash = hash_payload(payload);
    let outcome = apply_idempotent::<()>(
        db,
        scope,
        key,
        payload_hash,
        ttl_secs,
        Box::new(|_tx| Box::pin(async { Ok(()) })),
    )
    .await;
    match outcome {
        IdemOutcome::Success(()) => Ok(true),
        IdemOutcome::Replay => Ok(false),
        IdemOutcome::Mismatch => Err(CoreError::new(
            ErrorCode::IdempotencyMismatch,
            "idempotency.record",
            format!("payload mismatch for scope={scope}"),
        )),
        IdemOutcome::WorkFailed(e) | IdemOutcome::DbError(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_and_payload_hashes_are_independent() {
        assert_ne!(hash_key("k"), hash_payload("p"));
        assert_eq!(hash_key("k"), hash_key("k"));
        assert_ne!(hash_key("k"), hash_key("K"));
    }

    #[test]
    fn sha256_matches_known_vector() {
        // sha256("abc")
        assert_eq!(
            hex::encode(hash_key("abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
