//! Snapshot importer: three restore strategies behind one entry point.
//!
//! * `fresh/atomic`: wipe and replay inside one transaction.
//! * `fresh/staging`: load into `CREATE TABLE ... LIKE` staging tables, then
//!   swap in one transaction; staging is dropped on every exit path.
//! * `merge`: upsert rows, `GREATEST` on event sequences, ledger dedupe on
//!   `(ts, module_id, op, seq, reason)`.
//!
//! The header gates the run: format must be `jsonl/v1` and the snapshot's
//! schema version must equal the runtime version. An empty
//! `core_schema_version` table is stamped with the runtime version first.

use crate::export::sidecar_path;
use crate::{
    sha256_file, uuid_from_field, uuid_required, LedgerLine, SnapshotHeader, SnapshotLine,
    SNAPSHOT_FORMAT,
};
use anyhow::{bail, Context, Result};
use coffer_db::schema::{self, SCHEMA_VERSION};
use coffer_db::Db;
use flate2::read::GzDecoder;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, MySql, Row};
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStrategy {
    Atomic,
    Staging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    Fresh(RestoreStrategy),
    Merge { overwrite: bool },
}

impl RestoreMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreMode::Fresh(RestoreStrategy::Atomic) => "fresh/atomic",
            RestoreMode::Fresh(RestoreStrategy::Staging) => "fresh/staging",
            RestoreMode::Merge { .. } => "merge",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// A snapshot file, or a directory whose newest snapshot is taken.
    pub from: PathBuf,
    pub mode: RestoreMode,
    pub skip_fk_checks: bool,
    pub allow_missing_checksum: bool,
}

#[derive(Debug, Clone)]
pub struct ImportReport {
    pub file: PathBuf,
    pub mode: &'static str,
    pub players: u64,
    pub attributes: u64,
    pub event_seqs: u64,
    pub ledger: u64,
    /// Merge only: ledger rows already present and not overwritten.
    pub skipped: u64,
}

#[derive(Debug)]
struct Loaded {
    header: SnapshotHeader,
    players: Vec<crate::PlayerLine>,
    attributes: Vec<crate::AttributeLine>,
    event_seqs: Vec<crate::EventSeqLine>,
    ledger: Vec<LedgerLine>,
}

pub async fn import(db: &Db, opts: &ImportOptions) -> Result<ImportReport> {
    let file = resolve_input(&opts.from)?;
    verify_checksum(&file, opts.allow_missing_checksum)?;

    let loaded = read_snapshot(&file)?;
    gate_schema_version(db, &loaded.header).await?;

    let mut conn = db.pool().acquire().await.context("acquire import connection")?;

    if opts.skip_fk_checks {
        tracing::warn!("foreign key checks disabled for the duration of the import");
        sqlx::query("SET FOREIGN_KEY_CHECKS = 0")
            .execute(&mut *conn)
            .await
            .context("disable fk checks")?;
    }

    let result = run_mode(&mut conn, &loaded, opts.mode).await;

    if opts.skip_fk_checks {
        // Re-enable on every exit path, including failures.
        if let Err(e) = sqlx::query("SET FOREIGN_KEY_CHECKS = 1").execute(&mut *conn).await {
            tracing::error!(error = %e, "failed to re-enable foreign key checks");
        }
    }

    let (players, attributes, event_seqs, ledger, skipped) = result?;
    let report = ImportReport {
        file,
        mode: opts.mode.as_str(),
        players,
        attributes,
        event_seqs,
        ledger,
        skipped,
    };
    tracing::info!(
        file = %report.file.display(),
        mode = report.mode,
        players = report.players,
        ledger = report.ledger,
        skipped = report.skipped,
        "snapshot imported"
    );
    Ok(report)
}

async fn run_mode(
    conn: &mut PoolConnection<MySql>,
    loaded: &Loaded,
    mode: RestoreMode,
) -> Result<(u64, u64, u64, u64, u64)> {
    match mode {
        RestoreMode::Fresh(RestoreStrategy::Atomic) => restore_atomic(conn, loaded).await,
        RestoreMode::Fresh(RestoreStrategy::Staging) => restore_staging(conn, loaded).await,
        RestoreMode::Merge { overwrite } => merge(conn, loaded, overwrite).await,
    }
}

/// Pick the newest `.jsonl`/`.jsonl.gz` by mtime when given a directory.
fn resolve_input(from: &Path) -> Result<PathBuf> {
    if from.is_file() {
        return Ok(from.to_path_buf());
    }
    if !from.is_dir() {
        bail!("restore source {from:?} is neither a file nor a directory");
    }
    let mut newest: Option<(PathBuf, std::time::SystemTime)> = None;
    for entry in fs::read_dir(from).with_context(|| format!("read dir {from:?}"))? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !(name.ends_with(".jsonl") || name.ends_with(".jsonl.gz")) {
            continue;
        }
        let mtime = entry.metadata()?.modified()?;
        if newest.as_ref().map_or(true, |(_, t)| mtime > *t) {
            newest = Some((path, mtime));
        }
    }
    match newest {
        Some((path, _)) => Ok(path),
        None => bail!("no snapshot files in {from:?}"),
    }
}

fn verify_checksum(file: &Path, allow_missing: bool) -> Result<()> {
    let sidecar = sidecar_path(file);
    if !sidecar.exists() {
        if allow_missing {
            tracing::warn!(file = %file.display(), "no .sha256 sidecar, proceeding unchecked");
            return Ok(());
        }
        bail!("missing checksum sidecar {sidecar:?} (pass allowMissingChecksum to override)");
    }
    let recorded = fs::read_to_string(&sidecar)
        .with_context(|| format!("read sidecar {sidecar:?}"))?;
    let recorded = recorded.split_whitespace().next().unwrap_or("").to_lowercase();
    let actual = sha256_file(file)?;
    if recorded != actual {
        bail!("checksum mismatch for {file:?}: sidecar {recorded}, file {actual}");
    }
    Ok(())
}

fn read_snapshot(file: &Path) -> Result<Loaded> {
    let raw = File::open(file).with_context(|| format!("open {file:?}"))?;
    let reader: Box<dyn BufRead> = if file.extension().and_then(|e| e.to_str()) == Some("gz") {
        Box::new(BufReader::new(GzDecoder::new(raw)))
    } else {
        Box::new(BufReader::new(raw))
    };

    let mut lines = reader.lines();
    let header_line = match lines.next() {
        Some(line) => line.context("read header line")?,
        None => bail!("snapshot {file:?} is empty"),
    };
    let header: SnapshotHeader =
        serde_json::from_str(&header_line).context("parse snapshot header")?;
    if header.version != SNAPSHOT_FORMAT {
        bail!(
            "unsupported snapshot format {:?} (expected {SNAPSHOT_FORMAT:?})",
            header.version
        );
    }

    let mut loaded = Loaded {
        header,
        players: Vec::new(),
        attributes: Vec::new(),
        event_seqs: Vec::new(),
        ledger: Vec::new(),
    };
    for (idx, line) in lines.enumerate() {
        let line = line.with_context(|| format!("read line {}", idx + 2))?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: SnapshotLine = serde_json::from_str(&line)
            .with_context(|| format!("parse line {}", idx + 2))?;
        match parsed {
            SnapshotLine::Player(l) => loaded.players.push(l),
            SnapshotLine::Attribute(l) => loaded.attributes.push(l),
            SnapshotLine::EventSeq(l) => loaded.event_seqs.push(l),
            SnapshotLine::Ledger(l) => loaded.ledger.push(l),
        }
    }
    Ok(loaded)
}

/// Header and database versions must both equal the runtime version. A
/// database that has never recorded a version is stamped now.
async fn gate_schema_version(db: &Db, header: &SnapshotHeader) -> Result<()> {
    if header.schema_version != SCHEMA_VERSION {
        bail!(
            "snapshot schema version {} does not match runtime {}",
            header.schema_version,
            SCHEMA_VERSION
        );
    }
    match schema::recorded_version(db).await? {
        None => {
            tracing::info!(version = SCHEMA_VERSION, "recording runtime schema version");
            schema::record_version(db, SCHEMA_VERSION).await?;
        }
        Some(v) if v == SCHEMA_VERSION => {}
        Some(v) => bail!("database schema version {v} does not match runtime {SCHEMA_VERSION}"),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// fresh / atomic
// ---------------------------------------------------------------------------

async fn restore_atomic(
    conn: &mut PoolConnection<MySql>,
    loaded: &Loaded,
) -> Result<(u64, u64, u64, u64, u64)> {
    let mut tx = conn.begin().await.context("begin atomic restore")?;

    for table in [
        "core_ledger",
        "player_attributes",
        "player_event_seq",
        "players",
        "core_requests",
    ] {
        // Fixed table list; identifiers never come from input.
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("clear {table}"))?;
    }

    for line in &loaded.players {
        insert_player(&mut tx, "players", line).await?;
    }
    for line in &loaded.attributes {
        insert_attribute(&mut tx, "player_attributes", line).await?;
    }
    for line in &loaded.event_seqs {
        insert_event_seq(&mut tx, "player_event_seq", line).await?;
    }
    for line in &loaded.ledger {
        insert_ledger(&mut tx, "core_ledger", line).await?;
    }

    tx.commit().await.context("commit atomic restore")?;
    Ok((
        loaded.players.len() as u64,
        loaded.attributes.len() as u64,
        loaded.event_seqs.len() as u64,
        loaded.ledger.len() as u64,
        0,
    ))
}

// ---------------------------------------------------------------------------
// fresh / staging
// ---------------------------------------------------------------------------

const STAGED_TABLES: [&str; 4] = ["players", "player_attributes", "player_event_seq", "core_ledger"];

async fn restore_staging(
    conn: &mut PoolConnection<MySql>,
    loaded: &Loaded,
) -> Result<(u64, u64, u64, u64, u64)> {
    let suffix: String = Uuid::new_v4().simple().to_string()[..8].to_string();

    for table in STAGED_TABLES {
        sqlx::query(&format!(
            "CREATE TABLE {table}__stg_{suffix} LIKE {table}"
        ))
        .execute(&mut **conn)
        .await
        .with_context(|| format!("create staging table for {table}"))?;
    }

    let result = load_and_swap(conn, loaded, &suffix).await;

    // Drop staging on every exit path. The reference behavior: no staging
    // forensics are kept after a failure, only the log line below.
    for table in STAGED_TABLES {
        if let Err(e) = sqlx::query(&format!("DROP TABLE IF EXISTS {table}__stg_{suffix}"))
            .execute(&mut **conn)
            .await
        {
            tracing::warn!(table, suffix = %suffix, error = %e, "staging drop failed");
        }
    }
    if result.is_err() {
        tracing::warn!(suffix = %suffix, "staging restore failed, staging tables dropped");
    }

    result?;
    Ok((
        loaded.players.len() as u64,
        loaded.attributes.len() as u64,
        loaded.event_seqs.len() as u64,
        loaded.ledger.len() as u64,
        0,
    ))
}

async fn load_and_swap(
    conn: &mut PoolConnection<MySql>,
    loaded: &Loaded,
    suffix: &str,
) -> Result<()> {
    let players_stg = format!("players__stg_{suffix}");
    let attrs_stg = format!("player_attributes__stg_{suffix}");
    let seq_stg = format!("player_event_seq__stg_{suffix}");
    let ledger_stg = format!("core_ledger__stg_{suffix}");

    // Bulk load outside the swap transaction; staging tables are invisible
    // to the running system.
    {
        let mut tx = conn.begin().await.context("begin staging load")?;
        for line in &loaded.players {
            insert_player(&mut tx, &players_stg, line).await?;
        }
        for line in &loaded.attributes {
            insert_attribute(&mut tx, &attrs_stg, line).await?;
        }
        for line in &loaded.event_seqs {
            insert_event_seq(&mut tx, &seq_stg, line).await?;
        }
        for line in &loaded.ledger {
            insert_ledger(&mut tx, &ledger_stg, line).await?;
        }
        tx.commit().await.context("commit staging load")?;
    }

    // The swap itself: short transaction, plain INSERT ... SELECT.
    let mut tx = conn.begin().await.context("begin staging swap")?;
    for table in [
        "core_ledger",
        "player_attributes",
        "player_event_seq",
        "players",
        "core_requests",
    ] {
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("clear {table}"))?;
    }
    sqlx::query(&format!(
        "INSERT INTO players (uuid, name, balance, created_at, updated_at, seen_at) \
         SELECT uuid, name, balance, created_at, updated_at, seen_at FROM {players_stg}"
    ))
    .execute(&mut *tx)
    .await
    .context("swap players")?;
    sqlx::query(&format!(
        "INSERT INTO player_attributes (owner_uuid, attr_key, value_json, created_at, updated_at) \
         SELECT owner_uuid, attr_key, value_json, created_at, updated_at FROM {attrs_stg}"
    ))
    .execute(&mut *tx)
    .await
    .context("swap attributes")?;
    sqlx::query(&format!(
        "INSERT INTO player_event_seq (uuid, seq) SELECT uuid, seq FROM {seq_stg}"
    ))
    .execute(&mut *tx)
    .await
    .context("swap event seqs")?;
    sqlx::query(&format!(
        "INSERT INTO core_ledger (ts, module_id, op, from_uuid, to_uuid, amount, reason, ok, \
         code, seq, idem_scope, idem_key_hash, old_units, new_units, server_node, extra_json) \
         SELECT ts, module_id, op, from_uuid, to_uuid, amount, reason, ok, code, seq, \
         idem_scope, idem_key_hash, old_units, new_units, server_node, extra_json \
         FROM {ledger_stg} ORDER BY id"
    ))
    .execute(&mut *tx)
    .await
    .context("swap ledger")?;
    tx.commit().await.context("commit staging swap")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// merge
// ---------------------------------------------------------------------------

async fn merge(
    conn: &mut PoolConnection<MySql>,
    loaded: &Loaded,
    overwrite: bool,
) -> Result<(u64, u64, u64, u64, u64)> {
    let mut tx = conn.begin().await.context("begin merge")?;

    for line in &loaded.players {
        let uuid = uuid_required(&line.uuid)?;
        sqlx::query(
            r#"
            INSERT INTO players (uuid, name, balance, created_at, updated_at, seen_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON DUPLICATE KEY UPDATE
                name = VALUES(name),
                balance = VALUES(balance),
                updated_at = VALUES(updated_at),
                seen_at = VALUES(seen_at)
            "#,
        )
        .bind(&uuid.as_bytes()[..])
        .bind(&line.name)
        .bind(line.balance)
        .bind(line.created_at)
        .bind(line.updated_at)
        .bind(line.seen_at)
        .execute(&mut *tx)
        .await
        .context("merge player")?;
    }

    for line in &loaded.attributes {
        let owner = uuid_required(&line.owner_uuid)?;
        sqlx::query(
            r#"
            INSERT INTO player_attributes (owner_uuid, attr_key, value_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON DUPLICATE KEY UPDATE
                value_json = VALUES(value_json),
                updated_at = VALUES(updated_at)
            "#,
        )
        .bind(&owner.as_bytes()[..])
        .bind(&line.attr_key)
        .bind(&line.value_json)
        .bind(line.created_at)
        .bind(line.updated_at)
        .execute(&mut *tx)
        .await
        .context("merge attribute")?;
    }

    for line in &loaded.event_seqs {
        let uuid = uuid_required(&line.uuid)?;
        // Sequences only move forward; keep the larger of live and import.
        sqlx::query(
            r#"
            INSERT INTO player_event_seq (uuid, seq)
            VALUES (?, ?)
            ON DUPLICATE KEY UPDATE seq = GREATEST(seq, VALUES(seq))
            "#,
        )
        .bind(&uuid.as_bytes()[..])
        .bind(line.seq)
        .execute(&mut *tx)
        .await
        .context("merge event seq")?;
    }

    let mut inserted = 0u64;
    let mut skipped = 0u64;
    for line in &loaded.ledger {
        let existing: Option<u64> = sqlx::query(
            r#"
            SELECT id FROM core_ledger
            WHERE ts = ? AND module_id = ? AND op = ? AND seq = ? AND reason = ?
            LIMIT 1
            "#,
        )
        .bind(line.ts)
        .bind(&line.module_id)
        .bind(&line.op)
        .bind(line.seq)
        .bind(&line.reason)
        .fetch_optional(&mut *tx)
        .await
        .context("probe ledger entry")?
        .map(|row| row.try_get::<u64, _>("id"))
        .transpose()?;

        match existing {
            Some(id) if overwrite => {
                sqlx::query("DELETE FROM core_ledger WHERE id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .context("overwrite ledger entry")?;
                insert_ledger(&mut tx, "core_ledger", line).await?;
                inserted += 1;
            }
            Some(_) => skipped += 1,
            None => {
                insert_ledger(&mut tx, "core_ledger", line).await?;
                inserted += 1;
            }
        }
    }

    tx.commit().await.context("commit merge")?;
    Ok((
        loaded.players.len() as u64,
        loaded.attributes.len() as u64,
        loaded.event_seqs.len() as u64,
        inserted,
        skipped,
    ))
}

// ---------------------------------------------------------------------------
// row inserters (shared by atomic/staging/merge)
// ---------------------------------------------------------------------------

async fn insert_player(
    tx: &mut sqlx::Transaction<'_, MySql>,
    table: &str,
    line: &crate::PlayerLine,
) -> Result<()> {
    let uuid = uuid_required(&line.uuid)?;
    sqlx::query(&format!(
        "INSERT INTO {table} (uuid, name, balance, created_at, updated_at, seen_at) \
         VALUES (?, ?, ?, ?, ?, ?)"
    ))
    .bind(&uuid.as_bytes()[..])
    .bind(&line.name)
    .bind(line.balance)
    .bind(line.created_at)
    .bind(line.updated_at)
    .bind(line.seen_at)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("insert player {}", line.uuid))?;
    Ok(())
}

async fn insert_attribute(
    tx: &mut sqlx::Transaction<'_, MySql>,
    table: &str,
    line: &crate::AttributeLine,
) -> Result<()> {
    let owner = uuid_required(&line.owner_uuid)?;
    sqlx::query(&format!(
        "INSERT INTO {table} (owner_uuid, attr_key, value_json, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?)"
    ))
    .bind(&owner.as_bytes()[..])
    .bind(&line.attr_key)
    .bind(&line.value_json)
    .bind(line.created_at)
    .bind(line.updated_at)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("insert attribute {}/{}", line.owner_uuid, line.attr_key))?;
    Ok(())
}

async fn insert_event_seq(
    tx: &mut sqlx::Transaction<'_, MySql>,
    table: &str,
    line: &crate::EventSeqLine,
) -> Result<()> {
    let uuid = uuid_required(&line.uuid)?;
    sqlx::query(&format!("INSERT INTO {table} (uuid, seq) VALUES (?, ?)"))
        .bind(&uuid.as_bytes()[..])
        .bind(line.seq)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("insert event seq {}", line.uuid))?;
    Ok(())
}

async fn insert_ledger(
    tx: &mut sqlx::Transaction<'_, MySql>,
    table: &str,
    line: &LedgerLine,
) -> Result<()> {
    let from = uuid_from_field(&line.from_uuid)?;
    let to = uuid_from_field(&line.to_uuid)?;
    let key_hash = match &line.idem_key_hash {
        Some(hexstr) => Some(hex::decode(hexstr).context("bad idem_key_hash hex")?),
        None => None,
    };
    sqlx::query(&format!(
        "INSERT INTO {table} (ts, module_id, op, from_uuid, to_uuid, amount, reason, ok, code, \
         seq, idem_scope, idem_key_hash, old_units, new_units, server_node, extra_json) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(line.ts)
    .bind(&line.module_id)
    .bind(&line.op)
    .bind(from.map(|u| u.as_bytes().to_vec()))
    .bind(to.map(|u| u.as_bytes().to_vec()))
    .bind(line.amount)
    .bind(&line.reason)
    .bind(line.ok)
    .bind(&line.code)
    .bind(line.seq)
    .bind(&line.idem_scope)
    .bind(key_hash)
    .bind(line.old_units)
    .bind(line.new_units)
    .bind(&line.server_node)
    .bind(&line.extra_json)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("insert ledger entry ts={} seq={}", line.ts, line.seq))?;
    Ok(())
}
