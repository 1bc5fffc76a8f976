//! Welcome-deposit idempotency: the same `(scope, key, payload)` commits
//! exactly once; the second call is acknowledged as a replay with no new
//! side effects.
//!
//! Requires a reachable MariaDB/MySQL instance configured via the
//! COFFER_DB_* environment variables. Tests skip in CI without a database.

use coffer_db::{ledger, players, schema, Db, ErrorCode, Wallet};
use uuid::Uuid;

async fn test_db() -> Db {
    if std::env::var("COFFER_DB_HOST").is_err() {
        panic!("DB tests require COFFER_DB_HOST (and friends); run: COFFER_DB_HOST=127.0.0.1 COFFER_DB_DATABASE=coffer_test cargo test -p coffer-db -- --include-ignored");
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

async fn cleanup(db: &Db, players: &[Uuid]) {
    for p in players {
        let bytes = p.as_bytes().to_vec();
        for sql in [
            "DELETE FROM core_ledger WHERE from_uuid = ? OR to_uuid = ?",
            "DELETE FROM player_event_seq WHERE uuid = ? OR uuid = ?",
            "DELETE FROM player_attributes WHERE owner_uuid = ? OR owner_uuid = ?",
            "DELETE FROM players WHERE uuid = ? OR uuid = ?",
        ] {
            let _ = sqlx::query(sql)
                .bind(&bytes)
                .bind(&bytes)
                .execute(db.pool())
                .await;
        }
    }
}

#[tokio::test]
#[ignore = "requires COFFER_DB_HOST; see module docs"]
async fn same_key_deposits_commit_exactly_once() {
    let db = test_db().await;
    let wallet = Wallet::new(db.clone());

    let p1 = Uuid::new_v4();
    players::ensure_player(&db, p1, "IdemOne").await.expect("ensure");
    let key = format!("idem:welcome:{p1}");

    let first = wallet
        .deposit("core.wallet", p1, 100, "welcome", Some(&key))
        .await
        .expect("first deposit");
    assert!(!first.replay);
    assert_eq!(first.changes.len(), 1);
    assert_eq!(first.changes[0].old_units, 0);
    assert_eq!(first.changes[0].new_units, 100);
    assert_eq!(first.changes[0].seq, 1);

    let second = wallet
        .deposit("core.wallet", p1, 100, "welcome", Some(&key))
        .await
        .expect("second deposit");
    assert!(second.replay, "second identical call must be a replay");
    assert!(second.changes.is_empty());

    let row = players::get(&db, p1).await.expect("get").expect("player");
    assert_eq!(row.balance, 100, "balance applied exactly once");

    let entries = ledger::by_player(&db, p1, 10).await.expect("ledger");
    assert_eq!(entries.len(), 1, "exactly one ledger row");
    assert_eq!(entries[0].amount, 100);
    assert_eq!(entries[0].reason, "welcome");
    assert_eq!(entries[0].op, "deposit");

    cleanup(&db, &[p1]).await;
}

#[tokio::test]
#[ignore = "requires COFFER_DB_HOST; see module docs"]
async fn same_key_different_payload_is_rejected_without_side_effects() {
    let db = test_db().await;
    let wallet = Wallet::new(db.clone());

    let p1 = Uuid::new_v4();
    players::ensure_player(&db, p1, "IdemTwo").await.expect("ensure");
    let key = format!("idem:mismatch:{p1}");

    wallet
        .deposit("core.wallet", p1, 100, "welcome", Some(&key))
        .await
        .expect("first deposit");

    // Same key, different amount: a caller bug, never silently accepted.
    let err = wallet
        .deposit("core.wallet", p1, 200, "welcome", Some(&key))
        .await
        .expect_err("mismatched payload must be rejected");
    assert_eq!(err.code, ErrorCode::IdempotencyMismatch);

    let row = players::get(&db, p1).await.expect("get").expect("player");
    assert_eq!(row.balance, 100, "mismatch must not move money");
    let entries = ledger::by_player(&db, p1, 10).await.expect("ledger");
    assert_eq!(entries.len(), 1);

    cleanup(&db, &[p1]).await;
}

#[tokio::test]
#[ignore = "requires COFFER_DB_HOST; see module docs"]
async fn auto_keys_never_replay() {
    let db = test_db().await;
    let wallet = Wallet::new(db.clone());

    let p1 = Uuid::new_v4();
    players::ensure_player(&db, p1, "IdemThree").await.expect("ensure");

    wallet
        .deposit("core.wallet", p1, 10, "drip", None)
        .await
        .expect("first");
    wallet
        .deposit("core.wallet", p1, 10, "drip", None)
        .await
        .expect("second");

    let row = players::get(&db, p1).await.expect("get").expect("player");
    assert_eq!(row.balance, 20, "keyless calls are independent operations");

    cleanup(&db, &[p1]).await;
}

#[tokio::test]
#[ignore = "requires COFFER_DB_HOST; see module docs"]
async fn zero_amount_deposit_succeeds_and_is_recorded() {
    let db = test_db().await;
    let wallet = Wallet::new(db.clone());

    let p1 = Uuid::new_v4();
    players::ensure_player(&db, p1, "ZeroDep").await.expect("ensure");

    let receipt = wallet
        .deposit("core.wallet", p1, 0, "noop", None)
        .await
        .expect("zero deposit");
    assert_eq!(receipt.changes[0].old_units, receipt.changes[0].new_units);

    let entries = ledger::by_player(&db, p1, 10).await.expect("ledger");
    assert_eq!(entries.len(), 1, "zero delta still recorded");
    assert_eq!(entries[0].amount, 0);

    let err = wallet
        .deposit("core.wallet", p1, -5, "bad", None)
        .await
        .expect_err("negative amount");
    assert_eq!(err.code, ErrorCode::InvalidAmount);

    cleanup(&db, &[p1]).await;
}
