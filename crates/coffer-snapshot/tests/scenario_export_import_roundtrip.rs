//! Export → wipe → fresh/atomic import must reproduce the table contents
//! (modulo ledger auto-increment ids), and the sidecar digest must match
//! the snapshot bytes.
//!
//! Requires a reachable MariaDB/MySQL instance via COFFER_DB_*. The
//! fresh-restore tests REPLACE the database contents; point COFFER_DB_* at
//! a disposable database.

use coffer_db::{players, schema, Db, ErrorCode, Wallet};
use coffer_snapshot::{
    export_all, import, sha256_file, ExportOptions, ImportOptions, RestoreMode, RestoreStrategy,
};
use std::collections::HashMap;
use uuid::Uuid;

async fn test_db() -> Db {
    if std::env::var("COFFER_DB_HOST").is_err() {
        panic!("DB tests require COFFER_DB_HOST (and friends); run: COFFER_DB_HOST=127.0.0.1 COFFER_DB_DATABASE=coffer_test cargo test -p coffer-snapshot -- --include-ignored");
    }
    let loaded = coffer_config::load_defaults().expect("config");
    let db = Db::connect(&loaded.config).await.expect("connect");
    for _ in 0..20 {
        match schema::apply(&db).await {
            Ok(_) => return db,
            Err(e) if e.code == ErrorCode::MigrationLocked => {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
            Err(e) => panic!("migrate failed: {e}"),
        }
    }
    panic!("migration lock never freed");
}

async fn table_count(db: &Db, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(db.pool())
        .await
        .expect("count")
}

async fn seed(db: &Db, players_n: usize, deposits_each: usize) -> Vec<Uuid> {
    let wallet = Wallet::new(db.clone());
    let mut uuids = Vec::with_capacity(players_n);
    for i in 0..players_n {
        let uuid = Uuid::new_v4();
        players::ensure_player(db, uuid, &format!("Snap{i}"))
            .await
            .expect("ensure player");
        for d in 0..deposits_each {
            wallet
                .deposit("core.wallet", uuid, (d + 1) as i64, "seed", None)
                .await
                .expect("deposit");
        }
        uuids.push(uuid);
    }
    uuids
}

#[tokio::test]
#[ignore = "requires COFFER_DB_HOST and a disposable database; see module docs"]
async fn atomic_roundtrip_preserves_rows_and_balances() {
    let db = test_db().await;
    let dir = tempfile::tempdir().expect("tempdir");

    let uuids = seed(&db, 50, 4).await;

    let mut balances: HashMap<Uuid, i64> = HashMap::new();
    for uuid in &uuids {
        let row = players::get(&db, *uuid).await.expect("get").expect("player");
        balances.insert(*uuid, row.balance);
    }
    let players_before = table_count(&db, "players").await;
    let ledger_before = table_count(&db, "core_ledger").await;
    let seq_before = table_count(&db, "player_event_seq").await;

    let report = export_all(
        &db,
        &ExportOptions {
            out_dir: dir.path().to_path_buf(),
            gzip: false,
            default_zone: "UTC".to_string(),
            prune: None,
        },
    )
    .await
    .expect("export");

    // Sidecar digest matches the snapshot bytes.
    let sidecar = std::fs::read_to_string(&report.sha256_file).expect("sidecar");
    assert_eq!(sidecar.trim(), report.sha256);
    assert_eq!(sha256_file(&report.file).expect("digest"), report.sha256);
    assert_eq!(report.players, players_before as u64);
    assert_eq!(report.ledger, ledger_before as u64);

    let imported = import(
        &db,
        &ImportOptions {
            from: report.file.clone(),
            mode: RestoreMode::Fresh(RestoreStrategy::Atomic),
            skip_fk_checks: false,
            allow_missing_checksum: false,
        },
    )
    .await
    .expect("import");
    assert_eq!(imported.players, players_before as u64);

    assert_eq!(table_count(&db, "players").await, players_before);
    assert_eq!(table_count(&db, "core_ledger").await, ledger_before);
    assert_eq!(table_count(&db, "player_event_seq").await, seq_before);
    for (uuid, expected) in &balances {
        let row = players::get(&db, *uuid).await.expect("get").expect("player");
        assert_eq!(row.balance, *expected, "balance for {uuid}");
    }
}

#[tokio::test]
#[ignore = "requires COFFER_DB_HOST and a disposable database; see module docs"]
async fn gzip_roundtrip_and_staging_restore() {
    let db = test_db().await;
    let dir = tempfile::tempdir().expect("tempdir");

    seed(&db, 5, 2).await;
    let players_before = table_count(&db, "players").await;
    let ledger_before = table_count(&db, "core_ledger").await;

    let report = export_all(
        &db,
        &ExportOptions {
            out_dir: dir.path().to_path_buf(),
            gzip: true,
            default_zone: "UTC".to_string(),
            prune: None,
        },
    )
    .await
    .expect("export");
    assert!(report.file.to_string_lossy().ends_with(".jsonl.gz"));

    let imported = import(
        &db,
        &ImportOptions {
            from: dir.path().to_path_buf(), // directory: newest snapshot wins
            mode: RestoreMode::Fresh(RestoreStrategy::Staging),
            skip_fk_checks: true,
            allow_missing_checksum: false,
        },
    )
    .await
    .expect("staging import");
    assert_eq!(imported.file, report.file);

    assert_eq!(table_count(&db, "players").await, players_before);
    assert_eq!(table_count(&db, "core_ledger").await, ledger_before);

    // No staging leftovers on the happy path.
    let staging_leftovers: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables \
         WHERE table_schema = DATABASE() AND table_name LIKE '%__stg_%'",
    )
    .fetch_one(db.pool())
    .await
    .expect("staging probe");
    assert_eq!(staging_leftovers, 0);
}

#[tokio::test]
#[ignore = "requires COFFER_DB_HOST and a disposable database; see module docs"]
async fn merge_skips_existing_ledger_rows_unless_overwrite() {
    let db = test_db().await;
    let dir = tempfile::tempdir().expect("tempdir");

    seed(&db, 3, 1).await;
    let ledger_before = table_count(&db, "core_ledger").await;

    let report = export_all(
        &db,
        &ExportOptions {
            out_dir: dir.path().to_path_buf(),
            gzip: false,
            default_zone: "UTC".to_string(),
            prune: None,
        },
    )
    .await
    .expect("export");

    // Merging a snapshot of the live state back in: every ledger row is a
    // duplicate and must be skipped.
    let merged = import(
        &db,
        &ImportOptions {
            from: report.file.clone(),
            mode: RestoreMode::Merge { overwrite: false },
            skip_fk_checks: false,
            allow_missing_checksum: false,
        },
    )
    .await
    .expect("merge import");
    assert_eq!(merged.ledger, 0, "no new ledger rows");
    assert_eq!(merged.skipped as i64, ledger_before);
    assert_eq!(table_count(&db, "core_ledger").await, ledger_before);

    // With overwrite the rows are replaced in place, count unchanged.
    let overwritten = import(
        &db,
        &ImportOptions {
            from: report.file,
            mode: RestoreMode::Merge { overwrite: true },
            skip_fk_checks: false,
            allow_missing_checksum: false,
        },
    )
    .await
    .expect("overwrite import");
    assert_eq!(overwritten.skipped, 0);
    assert_eq!(table_count(&db, "core_ledger").await, ledger_before);
}

#[tokio::test]
#[ignore = "requires COFFER_DB_HOST and a disposable database; see module docs"]
async fn import_refuses_missing_checksum_unless_allowed() {
    let db = test_db().await;
    let dir = tempfile::tempdir().expect("tempdir");

    seed(&db, 1, 1).await;
    let report = export_all(
        &db,
        &ExportOptions {
            out_dir: dir.path().to_path_buf(),
            gzip: false,
            default_zone: "UTC".to_string(),
            prune: None,
        },
    )
    .await
    .expect("export");

    std::fs::remove_file(&report.sha256_file).expect("drop sidecar");

    let err = import(
        &db,
        &ImportOptions {
            from: report.file.clone(),
            mode: RestoreMode::Fresh(RestoreStrategy::Atomic),
            skip_fk_checks: false,
            allow_missing_checksum: false,
        },
    )
    .await
    .expect_err("must refuse without sidecar");
    assert!(err.to_string().contains("sidecar"), "{err}");

    import(
        &db,
        &ImportOptions {
            from: report.file,
            mode: RestoreMode::Fresh(RestoreStrategy::Atomic),
            skip_fk_checks: false,
            allow_missing_checksum: true,
        },
    )
    .await
    .expect("allowed without sidecar");
}
