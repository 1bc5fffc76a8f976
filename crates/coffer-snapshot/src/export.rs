//! Snapshot exporter.
//!
//! The whole dump runs on one connection under `REPEATABLE READ` with an
//! explicit transaction that is rolled back at the end, so the file is a
//! point-in-time view and the export never writes to the database. Dump
//! order: header, players, attributes, player_event_seq, ledger.

use crate::{
    AttributeLine, EventSeqLine, HashingWriter, LedgerLine, PlayerLine, SnapshotHeader,
    SnapshotLine, SNAPSHOT_FORMAT, SNAPSHOT_PREFIX,
};
use anyhow::{Context, Result};
use chrono::Utc;
use coffer_db::schema::SCHEMA_VERSION;
use coffer_db::{uuid_from_bytes, Db};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::TryStreamExt;
use sqlx::{Connection, Row};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub out_dir: PathBuf,
    pub gzip: bool,
    /// Carried verbatim into the header for the host's display helpers.
    pub default_zone: String,
    pub prune: Option<PruneOptions>,
}

#[derive(Debug, Clone, Copy)]
pub struct PruneOptions {
    pub keep_days: u32,
    pub keep_max: u32,
}

#[derive(Debug, Clone)]
pub struct ExportReport {
    pub file: PathBuf,
    pub sha256_file: PathBuf,
    pub sha256: String,
    pub players: u64,
    pub attributes: u64,
    pub event_seqs: u64,
    pub ledger: u64,
    pub pruned: Vec<PathBuf>,
}

enum Sink {
    Plain(HashingWriter<BufWriter<File>>),
    Gzip(GzEncoder<HashingWriter<BufWriter<File>>>),
}

impl Sink {
    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        match self {
            Sink::Plain(w) => {
                w.write_all(line.as_bytes())?;
                w.write_all(b"\n")
            }
            Sink::Gzip(w) => {
                w.write_all(line.as_bytes())?;
                w.write_all(b"\n")
            }
        }
    }

    fn finish(self) -> std::io::Result<String> {
        let hashed = match self {
            Sink::Plain(w) => w,
            Sink::Gzip(gz) => gz.finish()?,
        };
        let (mut file, digest) = hashed.finish()?;
        file.flush()?;
        Ok(digest)
    }
}

/// Dump everything into `outDir` and write the `.sha256` sidecar. Returns
/// per-table row counts and the list of pruned older snapshots.
pub async fn export_all(db: &Db, opts: &ExportOptions) -> Result<ExportReport> {
    let started = Instant::now();
    fs::create_dir_all(&opts.out_dir)
        .with_context(|| format!("create out dir {:?}", opts.out_dir))?;

    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let ext = if opts.gzip { "jsonl.gz" } else { "jsonl" };
    let file_path = opts.out_dir.join(format!("{SNAPSHOT_PREFIX}{stamp}.{ext}"));

    let file = File::create(&file_path).with_context(|| format!("create {file_path:?}"))?;
    let hashed = HashingWriter::new(BufWriter::new(file));
    let mut sink = if opts.gzip {
        Sink::Gzip(GzEncoder::new(hashed, Compression::default()))
    } else {
        Sink::Plain(hashed)
    };

    // One session, REPEATABLE READ, rolled back: a pure read.
    let mut conn = db.pool().acquire().await.context("acquire export connection")?;
    sqlx::query("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        .execute(&mut *conn)
        .await
        .context("set isolation level")?;
    let mut tx = conn.begin().await.context("begin export transaction")?;

    let header = SnapshotHeader {
        version: SNAPSHOT_FORMAT.to_string(),
        schema_version: SCHEMA_VERSION,
        generated_at: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        default_zone: opts.default_zone.clone(),
    };
    sink.write_line(&serde_json::to_string(&header)?)?;

    let mut report = ExportReport {
        file: file_path.clone(),
        sha256_file: sidecar_path(&file_path),
        sha256: String::new(),
        players: 0,
        attributes: 0,
        event_seqs: 0,
        ledger: 0,
        pruned: Vec::new(),
    };

    {
        let mut rows = sqlx::query(
            "SELECT uuid, name, balance, created_at, updated_at, seen_at FROM players ORDER BY uuid",
        )
        .fetch(&mut *tx);
        while let Some(row) = rows.try_next().await.context("stream players")? {
            let uuid_bytes: Vec<u8> = row.try_get("uuid")?;
            let line = SnapshotLine::Player(PlayerLine {
                uuid: uuid_from_bytes("export", &uuid_bytes)?.to_string(),
                name: row.try_get("name")?,
                balance: row.try_get("balance")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
                seen_at: row.try_get("seen_at")?,
            });
            sink.write_line(&serde_json::to_string(&line)?)?;
            report.players += 1;
        }
    }

    {
        let mut rows = sqlx::query(
            "SELECT owner_uuid, attr_key, value_json, created_at, updated_at \
             FROM player_attributes ORDER BY owner_uuid, attr_key",
        )
        .fetch(&mut *tx);
        while let Some(row) = rows.try_next().await.context("stream attributes")? {
            let owner_bytes: Vec<u8> = row.try_get("owner_uuid")?;
            let line = SnapshotLine::Attribute(AttributeLine {
                owner_uuid: uuid_from_bytes("export", &owner_bytes)?.to_string(),
                attr_key: row.try_get("attr_key")?,
                value_json: row.try_get("value_json")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            });
            sink.write_line(&serde_json::to_string(&line)?)?;
            report.attributes += 1;
        }
    }

    {
        let mut rows =
            sqlx::query("SELECT uuid, seq FROM player_event_seq ORDER BY uuid").fetch(&mut *tx);
        while let Some(row) = rows.try_next().await.context("stream event seqs")? {
            let uuid_bytes: Vec<u8> = row.try_get("uuid")?;
            let line = SnapshotLine::EventSeq(EventSeqLine {
                uuid: uuid_from_bytes("export", &uuid_bytes)?.to_string(),
                seq: row.try_get("seq")?,
            });
            sink.write_line(&serde_json::to_string(&line)?)?;
            report.event_seqs += 1;
        }
    }

    {
        let mut rows = sqlx::query(
            "SELECT id, ts, module_id, op, from_uuid, to_uuid, amount, reason, ok, code, seq, \
             idem_scope, idem_key_hash, old_units, new_units, server_node, extra_json \
             FROM core_ledger ORDER BY id",
        )
        .fetch(&mut *tx);
        while let Some(row) = rows.try_next().await.context("stream ledger")? {
            let from: Option<Vec<u8>> = row.try_get("from_uuid")?;
            let to: Option<Vec<u8>> = row.try_get("to_uuid")?;
            let key_hash: Option<Vec<u8>> = row.try_get("idem_key_hash")?;
            let line = SnapshotLine::Ledger(LedgerLine {
                id: row.try_get("id")?,
                ts: row.try_get("ts")?,
                module_id: row.try_get("module_id")?,
                op: row.try_get("op")?,
                from_uuid: decode_uuid_field(from)?,
                to_uuid: decode_uuid_field(to)?,
                amount: row.try_get("amount")?,
                reason: row.try_get("reason")?,
                ok: row.try_get::<i8, _>("ok")? != 0,
                code: row.try_get("code")?,
                seq: row.try_get("seq")?,
                idem_scope: row.try_get("idem_scope")?,
                idem_key_hash: key_hash.map(hex::encode),
                old_units: row.try_get("old_units")?,
                new_units: row.try_get("new_units")?,
                server_node: row.try_get("server_node")?,
                extra_json: row.try_get("extra_json")?,
            });
            sink.write_line(&serde_json::to_string(&line)?)?;
            report.ledger += 1;
        }
    }

    tx.rollback().await.context("rollback export transaction")?;

    let digest = sink.finish().context("finish snapshot file")?;
    fs::write(&report.sha256_file, format!("{digest}\n"))
        .with_context(|| format!("write sidecar {:?}", report.sha256_file))?;
    report.sha256 = digest;

    if let Some(prune) = opts.prune {
        report.pruned = prune_out_dir(&opts.out_dir, &file_path, prune)?;
    }

    db.observe_query("export.all", started);
    tracing::info!(
        file = %report.file.display(),
        players = report.players,
        ledger = report.ledger,
        pruned = report.pruned.len(),
        "snapshot written"
    );
    Ok(report)
}

fn decode_uuid_field(bytes: Option<Vec<u8>>) -> Result<String> {
    Ok(match bytes {
        Some(b) => uuid_from_bytes("export", &b)?.to_string(),
        None => String::new(),
    })
}

pub fn sidecar_path(file: &Path) -> PathBuf {
    let mut name = file.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".sha256");
    file.with_file_name(name)
}

fn is_snapshot_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.starts_with(SNAPSHOT_PREFIX)
        && (name.ends_with(".jsonl") || name.ends_with(".jsonl.gz"))
}

/// Drop the oldest snapshots past `keep_max` and anything older than
/// `keep_days`. The file just written is exempt. Sidecars go with their
/// snapshots.
fn prune_out_dir(out_dir: &Path, just_written: &Path, prune: PruneOptions) -> Result<Vec<PathBuf>> {
    let mut candidates: Vec<(PathBuf, SystemTime)> = Vec::new();
    for entry in fs::read_dir(out_dir).with_context(|| format!("read out dir {out_dir:?}"))? {
        let entry = entry?;
        let path = entry.path();
        if !is_snapshot_file(&path) || path == just_written {
            continue;
        }
        let mtime = entry.metadata()?.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        candidates.push((path, mtime));
    }
    // Newest first.
    candidates.sort_by(|a, b| b.1.cmp(&a.1));

    let mut doomed: Vec<PathBuf> = Vec::new();
    // The just-written file occupies one keepMax slot.
    let allowed = (prune.keep_max.max(1) as usize).saturating_sub(1);
    for (path, _) in candidates.iter().skip(allowed) {
        doomed.push(path.clone());
    }
    if prune.keep_days > 0 {
        let horizon = SystemTime::now() - Duration::from_secs(prune.keep_days as u64 * 86_400);
        for (path, mtime) in &candidates {
            if *mtime < horizon && !doomed.contains(path) {
                doomed.push(path.clone());
            }
        }
    }

    for path in &doomed {
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!(file = %path.display(), error = %e, "snapshot prune failed");
        }
        let sidecar = sidecar_path(path);
        if sidecar.exists() {
            let _ = fs::remove_file(&sidecar);
        }
    }
    Ok(doomed)
}
