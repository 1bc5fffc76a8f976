//! Structured error taxonomy and database-error classification.
//!
//! Every operation the core exposes surfaces one of the [`ErrorCode`]
//! enumerants; raw driver errors never escape. Classification is by SQL
//! state / vendor code: the deadlock class (40001, 1213, 1205) is retryable
//! inside [`with_retry`], everything else is `CONNECTION_LOST`.

use std::future::Future;
use std::time::Duration;

/// Machine-readable failure codes. The host maps these to locale messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InsufficientFunds,
    InvalidAmount,
    UnknownPlayer,
    NameAmbiguous,
    /// Treated as success by callers: the work already ran once.
    IdempotencyReplay,
    IdempotencyMismatch,
    DeadlockRetryExhausted,
    ConnectionLost,
    DegradedMode,
    MigrationLocked,
    InvalidTz,
    OverridesDisabled,
    /// Attribute value failed to parse as JSON.
    AttrInvalidJson,
    /// Attribute key or value exceeds its size limit.
    AttrTooLarge,
    /// Warning-only code attached to slow-query log lines.
    DbSlowQuery,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorCode::InvalidAmount => "INVALID_AMOUNT",
            ErrorCode::UnknownPlayer => "UNKNOWN_PLAYER",
            ErrorCode::NameAmbiguous => "NAME_AMBIGUOUS",
            ErrorCode::IdempotencyReplay => "IDEMPOTENCY_REPLAY",
            ErrorCode::IdempotencyMismatch => "IDEMPOTENCY_MISMATCH",
            ErrorCode::DeadlockRetryExhausted => "DEADLOCK_RETRY_EXHAUSTED",
            ErrorCode::ConnectionLost => "CONNECTION_LOST",
            ErrorCode::DegradedMode => "DEGRADED_MODE",
            ErrorCode::MigrationLocked => "MIGRATION_LOCKED",
            ErrorCode::InvalidTz => "INVALID_TZ",
            ErrorCode::OverridesDisabled => "OVERRIDES_DISABLED",
            ErrorCode::AttrInvalidJson => "ATTR_INVALID_JSON",
            ErrorCode::AttrTooLarge => "ATTR_TOO_LARGE",
            ErrorCode::DbSlowQuery => "DB_SLOW_QUERY",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure: code plus a short operator-facing message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("code={code} op={op} message={message}")]
pub struct CoreError {
    pub code: ErrorCode,
    pub op: &'static str,
    pub message: String,
}

impl CoreError {
    pub fn new(code: ErrorCode, op: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            op,
            message: message.into(),
        }
    }

    /// Classify a raw driver error. Deadlocks and lock-wait timeouts land in
    /// the retryable class; everything else is `CONNECTION_LOST`.
    pub fn from_sqlx(op: &'static str, err: sqlx::Error) -> Self {
        let code = classify_sqlx(&err);
        let message = match &err {
            sqlx::Error::Database(db) => {
                let state = db.code().map(|c| c.to_string()).unwrap_or_default();
                format!("{} [sqlState={state}]", db.message())
            }
            other => other.to_string(),
        };
        Self::new(code, op, message)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// SQLSTATE 40001 plus MariaDB/MySQL vendor codes 1213 (deadlock) and
/// 1205 (lock wait timeout) form the retryable class.
pub fn classify_sqlx(err: &sqlx::Error) -> ErrorCode {
    if let sqlx::Error::Database(db) = err {
        let state = db.code();
        let state = state.as_deref().unwrap_or("");
        if state == "40001" || state == "1213" || state == "1205" {
            return ErrorCode::DeadlockRetryExhausted;
        }
        // MySQL drivers may expose the vendor code through the message
        // prefix instead of the SQLSTATE slot.
        let msg = db.message();
        if msg.contains("Deadlock found") || msg.contains("Lock wait timeout") {
            return ErrorCode::DeadlockRetryExhausted;
        }
    }
    ErrorCode::ConnectionLost
}

/// `true` for `(scope, key_hash)`-style duplicate-key rejections.
pub fn is_duplicate_key(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("23000") || db.message().contains("Duplicate entry")
        }
        _ => false,
    }
}

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 50;

/// Run `f`, retrying the deadlock class with linear backoff. Attempts are
/// capped at three; the final deadlock surfaces as
/// `DEADLOCK_RETRY_EXHAUSTED`. Non-deadlock failures return immediately.
pub async fn with_retry<T, F, Fut>(op: &'static str, mut f: F) -> CoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.code == ErrorCode::DeadlockRetryExhausted && attempt < RETRY_ATTEMPTS => {
                tracing::warn!(
                    code = %e.code,
                    op,
                    attempt,
                    "deadlock, retrying"
                );
                tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
