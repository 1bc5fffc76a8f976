//! MariaDB/MySQL-backed persistence core: pool and health supervision,
//! idempotent schema management, the exactly-once wallet engine, the
//! request registry, the player directory, the attributes store and the
//! append-only ledger.
//!
//! All timestamps are UTC seconds. All UUIDs cross the wire as 16-byte
//! `BINARY(16)` parameters.

pub mod attributes;
pub mod errors;
pub mod health;
pub mod idempotency;
pub mod ledger;
pub mod lock;
pub mod metrics;
pub mod players;
pub mod pool;
pub mod schema;
pub mod wallet;

pub use errors::{classify_sqlx, with_retry, CoreError, CoreResult, ErrorCode};
pub use health::{HealthState, HealthStatus};
pub use metrics::{CoreMetrics, MetricsSnapshot};
pub use pool::Db;
pub use wallet::{BalanceChange, Wallet, WalletReceipt};

use uuid::Uuid;

/// Current wall-clock time as UTC seconds.
pub fn now_ts() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Decode a `BINARY(16)` column back into a `Uuid`.
pub fn uuid_from_bytes(op: &'static str, bytes: &[u8]) -> CoreResult<Uuid> {
    Uuid::from_slice(bytes).map_err(|e| {
        CoreError::new(
            ErrorCode::ConnectionLost,
            op,
            format!("uuid column holds {} bytes: {e}", bytes.len()),
        )
    })
}

/// Compact JSON with recursively sorted object keys. One value == one
/// stable line, independent of map iteration order.
pub fn canonical_json_line(v: &serde_json::Value) -> String {
    fn sort_keys(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Object(map) => {
                let mut keys: Vec<_> = map.keys().cloned().collect();
                keys.sort();
                let mut new = serde_json::Map::new();
                for k in keys {
                    new.insert(k.clone(), sort_keys(&map[&k]));
                }
                serde_json::Value::Object(new)
            }
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(sort_keys).collect())
            }
            _ => v.clone(),
        }
    }
    serde_json::to_string(&sort_keys(v)).unwrap_or_default()
}
