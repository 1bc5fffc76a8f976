//! Append-only wallet ledger.
//!
//! One row per participant balance change: `amount` is the signed delta
//! applied to the row's participant (`to` when positive, `from` when
//! negative), and `new_units - old_units == amount` always holds. Rows are
//! written inside the causing transaction, so a rollback leaves no trace.
//!
//! An optional file mirror appends every committed entry as one canonical
//! JSON line, for hosts that ship flat files instead of querying the table.

use crate::errors::{CoreError, CoreResult};
use crate::pool::Db;
use crate::uuid_from_bytes;
use serde::Serialize;
use sqlx::{MySql, Row, Transaction};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

pub const MAX_REASON_LEN: usize = 64;

/// Lowercase, trim, clamp to 64 chars: the canonical form used both for
/// payload hashing and for the stored `reason` column.
pub fn canonical_reason(reason: &str) -> String {
    reason.trim().to_lowercase().chars().take(MAX_REASON_LEN).collect()
}

#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub ts: u64,
    pub module_id: String,
    pub op: String,
    pub from_uuid: Option<Uuid>,
    pub to_uuid: Option<Uuid>,
    /// Signed balance delta for this row's participant.
    pub amount: i64,
    pub reason: String,
    pub seq: u64,
    pub idem_scope: Option<String>,
    pub idem_key_hash: Option<[u8; 32]>,
    pub old_units: i64,
    pub new_units: i64,
    pub server_node: Option<String>,
    pub extra_json: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub id: u64,
    pub ts: u64,
    pub module_id: String,
    pub op: String,
    pub from_uuid: Option<Uuid>,
    pub to_uuid: Option<Uuid>,
    pub amount: i64,
    pub reason: String,
    pub ok: bool,
    pub code: Option<String>,
    pub seq: u64,
    pub old_units: Option<i64>,
    pub new_units: Option<i64>,
    pub server_node: Option<String>,
    pub extra_json: Option<String>,
}

/// Append one entry inside the caller's transaction.
pub async fn insert_entry(
    tx: &mut Transaction<'static, MySql>,
    entry: &NewLedgerEntry,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO core_ledger
            (ts, module_id, op, from_uuid, to_uuid, amount, reason, ok, code,
             seq, idem_scope, idem_key_hash, old_units, new_units, server_node, extra_json)
        VALUES (?, ?, ?, ?, ?, ?, ?, 1, NULL, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.ts)
    .bind(&entry.module_id)
    .bind(&entry.op)
    .bind(entry.from_uuid.as_ref().map(|u| u.as_bytes().to_vec()))
    .bind(entry.to_uuid.as_ref().map(|u| u.as_bytes().to_vec()))
    .bind(entry.amount)
    .bind(&entry.reason)
    .bind(entry.seq)
    .bind(&entry.idem_scope)
    .bind(entry.idem_key_hash.as_ref().map(|h| h.to_vec()))
    .bind(entry.old_units)
    .bind(entry.new_units)
    .bind(&entry.server_node)
    .bind(&entry.extra_json)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn row_to_entry(op: &'static str, row: &sqlx::mysql::MySqlRow) -> CoreResult<LedgerEntry> {
    let from: Option<Vec<u8>> = row.try_get("from_uuid").map_err(|e| CoreError::from_sqlx(op, e))?;
    let to: Option<Vec<u8>> = row.try_get("to_uuid").map_err(|e| CoreError::from_sqlx(op, e))?;
    Ok(LedgerEntry {
        id: row.try_get("id").map_err(|e| CoreError::from_sqlx(op, e))?,
        ts: row.try_get("ts").map_err(|e| CoreError::from_sqlx(op, e))?,
        module_id: row.try_get("module_id").map_err(|e| CoreError::from_sqlx(op, e))?,
        op: row.try_get("op").map_err(|e| CoreError::from_sqlx(op, e))?,
        from_uuid: from.map(|b| uuid_from_bytes(op, &b)).transpose()?,
        to_uuid: to.map(|b| uuid_from_bytes(op, &b)).transpose()?,
        amount: row.try_get("amount").map_err(|e| CoreError::from_sqlx(op, e))?,
        reason: row.try_get("reason").map_err(|e| CoreError::from_sqlx(op, e))?,
        ok: row.try_get::<i8, _>("ok").map_err(|e| CoreError::from_sqlx(op, e))? != 0,
        code: row.try_get("code").map_err(|e| CoreError::from_sqlx(op, e))?,
        seq: row.try_get("seq").map_err(|e| CoreError::from_sqlx(op, e))?,
        old_units: row.try_get("old_units").map_err(|e| CoreError::from_sqlx(op, e))?,
        new_units: row.try_get("new_units").map_err(|e| CoreError::from_sqlx(op, e))?,
        server_node: row.try_get("server_node").map_err(|e| CoreError::from_sqlx(op, e))?,
        extra_json: row.try_get("extra_json").map_err(|e| CoreError::from_sqlx(op, e))?,
    })
}

const SELECT_COLS: &str = "id, ts, module_id, op, from_uuid, to_uuid, amount, reason, ok, code, \
                           seq, old_units, new_units, server_node, extra_json";

/// Newest-first stream; `ORDER BY id DESC` rides the primary key.
pub async fn recent(db: &Db, limit: u32) -> CoreResult<Vec<LedgerEntry>> {
    let op = "ledger.recent";
    let rows = sqlx::query(&format!(
        "SELECT {SELECT_COLS} FROM core_ledger ORDER BY id DESC LIMIT ?"
    ))
    .bind(limit.max(1))
    .fetch_all(db.pool())
    .await
    .map_err(|e| db.fail(op, e))?;
    rows.iter().map(|r| row_to_entry(op, r)).collect()
}

pub async fn by_player(db: &Db, player: Uuid, limit: u32) -> CoreResult<Vec<LedgerEntry>> {
    let op = "ledger.by_player";
    let bytes = player.as_bytes().to_vec();
    let rows = sqlx::query(&format!(
        "SELECT {SELECT_COLS} FROM core_ledger \
         WHERE from_uuid = ? OR to_uuid = ? ORDER BY id DESC LIMIT ?"
    ))
    .bind(&bytes)
    .bind(&bytes)
    .bind(limit.max(1))
    .fetch_all(db.pool())
    .await
    .map_err(|e| db.fail(op, e))?;
    rows.iter().map(|r| row_to_entry(op, r)).collect()
}

pub async fn by_module(db: &Db, module_id: &str, limit: u32) -> CoreResult<Vec<LedgerEntry>> {
    let op = "ledger.by_module";
    let rows = sqlx::query(&format!(
        "SELECT {SELECT_COLS} FROM core_ledger WHERE module_id = ? ORDER BY id DESC LIMIT ?"
    ))
    .bind(module_id)
    .bind(limit.max(1))
    .fetch_all(db.pool())
    .await
    .map_err(|e| db.fail(op, e))?;
    rows.iter().map(|r| row_to_entry(op, r)).collect()
}

pub async fn by_reason(db: &Db, needle: &str, limit: u32) -> CoreResult<Vec<LedgerEntry>> {
    let op = "ledger.by_reason";
    let rows = sqlx::query(&format!(
        "SELECT {SELECT_COLS} FROM core_ledger \
         WHERE reason LIKE CONCAT('%', ?, '%') ORDER BY id DESC LIMIT ?"
    ))
    .bind(canonical_reason(needle))
    .bind(limit.max(1))
    .fetch_all(db.pool())
    .await
    .map_err(|e| db.fail(op, e))?;
    rows.iter().map(|r| row_to_entry(op, r)).collect()
}

/// Batched retention prune; returns total rows deleted.
pub async fn prune_older_than(db: &Db, cutoff_ts: u64, batch_limit: u32) -> CoreResult<u64> {
    let op = "ledger.prune";
    db.guard_write(op)?;
    let batch = batch_limit.max(1) as u64;
    let mut total = 0u64;
    loop {
        let res = sqlx::query("DELETE FROM core_ledger WHERE ts < ? LIMIT ?")
            .bind(cutoff_ts)
            .bind(batch)
            .execute(db.pool())
            .await
            .map_err(|e| db.fail(op, e))?;
        total += res.rows_affected();
        if res.rows_affected() < batch {
            break;
        }
    }
    if total > 0 {
        tracing::info!(op, deleted = total, cutoff_ts, "pruned ledger rows");
    }
    Ok(total)
}

/// Append-only JSONL mirror of committed ledger entries. One entry == one
/// canonical line (object keys sorted, compact).
pub struct LedgerMirror {
    path: PathBuf,
    file: Mutex<()>,
}

impl LedgerMirror {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path,
            file: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &LedgerEntry) -> anyhow::Result<()> {
        let raw = serde_json::to_value(entry)?;
        let line = crate::canonical_json_line(&raw);
        let _guard = self.file.lock().unwrap_or_else(|p| p.into_inner());
        let mut f = OpenOptions::new().create(true).append(true).open(&self.path)?;
        f.write_all(line.as_bytes())?;
        f.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_reason_lowercases_trims_and_clamps() {
        assert_eq!(canonical_reason("  Welcome Bonus "), "welcome bonus");
        let long = "R".repeat(100);
        assert_eq!(canonical_reason(&long).len(), MAX_REASON_LEN);
    }

    #[test]
    fn mirror_appends_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = LedgerMirror::open(dir.path().join("ledger.jsonl")).unwrap();
        let entry = LedgerEntry {
            id: 1,
            ts: 1_735_689_600,
            module_id: "core.wallet".into(),
            op: "deposit".into(),
            from_uuid: None,
            to_uuid: Some(Uuid::from_u128(1)),
            amount: 100,
            reason: "welcome".into(),
            ok: true,
            code: None,
            seq: 1,
            old_units: Some(0),
            new_units: Some(100),
            server_node: None,
            extra_json: None,
        };
        mirror.append(&entry).unwrap();
        mirror.append(&entry).unwrap();

        let text = std::fs::read_to_string(mirror.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["amount"], 100);
        assert_eq!(parsed["reason"], "welcome");
    }
}
