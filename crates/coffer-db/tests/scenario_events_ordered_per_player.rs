//! Interleaved deposits on two players: each subscriber sees each player's
//! events in seq order 1..10, with per-player totals of 10. Cross-player
//! interleaving is unconstrained.
//!
//! Requires a reachable MariaDB/MySQL instance via COFFER_DB_*.

use coffer_db::{players, schema, Db, ErrorCode, Wallet};
use coffer_events::{BalanceChanged, EventBus, Subscriber};
use std::sync::{Arc, Mutex};
use std::time::Duration;
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
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => panic!("migrate failed: {e}"),
        }
    }
    panic!("migration lock never freed");
}

struct SeqRecorder {
    seen: Mutex<Vec<(Uuid, u64)>>,
}

impl Subscriber for SeqRecorder {
    fn name(&self) -> &str {
        "seq-recorder"
    }

    fn on_balance_changed(&self, event: &BalanceChanged) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push((event.uuid, event.seq));
        Ok(())
    }
}

#[tokio::test]
#[ignore = "requires COFFER_DB_HOST; see module docs"]
async fn interleaved_deposits_deliver_in_seq_order() {
    let db = test_db().await;
    let bus = EventBus::new(4);
    let recorder = Arc::new(SeqRecorder {
        seen: Mutex::new(Vec::new()),
    });
    bus.subscribe(recorder.clone());
    let wallet = Wallet::new(db.clone()).with_bus(bus.clone());

    let p1 = Uuid::new_v4();
    let p2 = Uuid::new_v4();
    players::ensure_player(&db, p1, "EvOne").await.expect("ensure p1");
    players::ensure_player(&db, p2, "EvTwo").await.expect("ensure p2");

    for _ in 0..10 {
        wallet.deposit("core.wallet", p1, 1, "tick", None).await.expect("p1 deposit");
        wallet.deposit("core.wallet", p2, 1, "tick", None).await.expect("p2 deposit");
    }

    bus.shutdown().await;

    let seen = recorder.seen.lock().unwrap();
    let p1_seqs: Vec<u64> = seen.iter().filter(|(u, _)| *u == p1).map(|(_, s)| *s).collect();
    let p2_seqs: Vec<u64> = seen.iter().filter(|(u, _)| *u == p2).map(|(_, s)| *s).collect();

    assert_eq!(p1_seqs, (1..=10).collect::<Vec<_>>(), "p1 in seq order");
    assert_eq!(p2_seqs, (1..=10).collect::<Vec<_>>(), "p2 in seq order");
    drop(seen);

    for p in [p1, p2] {
        let bytes = p.as_bytes().to_vec();
        for sql in [
            "DELETE FROM core_ledger WHERE to_uuid = ?",
            "DELETE FROM player_event_seq WHERE uuid = ?",
            "DELETE FROM players WHERE uuid = ?",
        ] {
            let _ = sqlx::query(sql).bind(&bytes).execute(db.pool()).await;
        }
    }
}
