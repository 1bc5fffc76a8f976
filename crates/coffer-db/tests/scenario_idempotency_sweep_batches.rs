//! Sweep semantics: expired request rows go in batches of `batchLimit`
//! until none remain; unexpired rows survive.
//!
//! Requires a reachable MariaDB/MySQL instance via COFFER_DB_*.

use coffer_db::{idempotency, now_ts, schema, Db, ErrorCode};

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

const SCOPE: &str = "test:sweep";

async fn seed_request(db: &Db, n: u32, expires_at: u64) {
    let key_hash = idempotency::hash_key(&format!("sweep-key-{n}-{expires_at}"));
    let payload_hash = idempotency::hash_payload("payload");
    sqlx::query(
        "INSERT IGNORE INTO core_requests (scope, key_hash, payload_hash, ok, created_at, expires_at) \
         VALUES (?, ?, ?, 1, ?, ?)",
    )
    .bind(SCOPE)
    .bind(&key_hash[..])
    .bind(&payload_hash[..])
    .bind(now_ts())
    .bind(expires_at)
    .execute(db.pool())
    .await
    .expect("seed request row");
}

async fn count_scope(db: &Db) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM core_requests WHERE scope = ?")
        .bind(SCOPE)
        .fetch_one(db.pool())
        .await
        .expect("count")
}

async fn count_key(db: &Db, key_hash: &[u8; 32]) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM core_requests WHERE scope = ? AND key_hash = ?")
        .bind(SCOPE)
        .bind(&key_hash[..])
        .fetch_one(db.pool())
        .await
        .expect("count")
}

#[tokio::test]
#[ignore = "requires COFFER_DB_HOST; see module docs"]
async fn sweep_deletes_expired_in_batches_and_keeps_live_rows() {
    let db = test_db().await;
    let now = now_ts();

    // Start from a clean scope so counts are exact.
    sqlx::query("DELETE FROM core_requests WHERE scope = ?")
        .bind(SCOPE)
        .execute(db.pool())
        .await
        .expect("pre-clean");

    for n in 0..1_000 {
        seed_request(&db, n, now - 1).await;
    }
    for n in 1_000..1_010 {
        seed_request(&db, n, now + 3_600).await;
    }
    assert_eq!(count_scope(&db).await, 1_010);

    let deleted = idempotency::sweep_expired(&db, 200, 0).await.expect("sweep");
    // Other scopes may contribute expired rows (the probe does), so the
    // floor is what this test seeded.
    assert!(deleted >= 1_000, "swept {deleted}, expected >= 1000");

    let remaining = count_scope(&db).await;
    assert_eq!(remaining, 10, "unexpired rows must survive");

    sqlx::query("DELETE FROM core_requests WHERE scope = ?")
        .bind(SCOPE)
        .execute(db.pool())
        .await
        .expect("post-clean");
}

#[tokio::test]
#[ignore = "requires COFFER_DB_HOST; see module docs"]
async fn retention_horizon_narrows_the_sweep() {
    let db = test_db().await;
    let now = now_ts();
    let payload_hash = idempotency::hash_payload("payload");

    // Expired AND older than the horizon: reclaimed.
    let doomed = idempotency::hash_key("sweep-retention-doomed");
    sqlx::query(
        "INSERT IGNORE INTO core_requests (scope, key_hash, payload_hash, ok, created_at, expires_at) \
         VALUES (?, ?, ?, 1, ?, ?)",
    )
    .bind(SCOPE)
    .bind(&doomed[..])
    .bind(&payload_hash[..])
    .bind(now - 10 * 86_400)
    .bind(now - 1)
    .execute(db.pool())
    .await
    .expect("seed doomed row");

    // Expired but younger than the horizon: retention keeps it around.
    let recent = idempotency::hash_key("sweep-retention-recent");
    sqlx::query(
        "INSERT IGNORE INTO core_requests (scope, key_hash, payload_hash, ok, created_at, expires_at) \
         VALUES (?, ?, ?, 1, ?, ?)",
    )
    .bind(SCOPE)
    .bind(&recent[..])
    .bind(&payload_hash[..])
    .bind(now - 86_400)
    .bind(now - 1)
    .execute(db.pool())
    .await
    .expect("seed recent row");

    // Unexpired but old: never swept, expiry is still required.
    let unexpired = idempotency::hash_key("sweep-retention-unexpired");
    sqlx::query(
        "INSERT IGNORE INTO core_requests (scope, key_hash, payload_hash, ok, created_at, expires_at) \
         VALUES (?, ?, ?, 1, ?, ?)",
    )
    .bind(SCOPE)
    .bind(&unexpired[..])
    .bind(&payload_hash[..])
    .bind(now - 10 * 86_400)
    .bind(now + 30 * 86_400)
    .execute(db.pool())
    .await
    .expect("seed unexpired row");

    idempotency::sweep_expired(&db, 100, 7).await.expect("sweep");

    assert_eq!(count_key(&db, &doomed).await, 0, "expired + past horizon is reclaimed");
    assert_eq!(count_key(&db, &recent).await, 1, "horizon keeps recently expired rows");
    assert_eq!(count_key(&db, &unexpired).await, 1, "unexpired rows always survive");

    sqlx::query("DELETE FROM core_requests WHERE scope = ?")
        .bind(SCOPE)
        .execute(db.pool())
        .await
        .expect("post-clean");
}
