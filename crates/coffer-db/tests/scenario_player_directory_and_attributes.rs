//! Player directory semantics (first-seen insert, case-insensitive lookup,
//! ambiguity) and the attributes store's constraints.
//!
//! Requires a reachable MariaDB/MySQL instance via COFFER_DB_*.

use coffer_db::{attributes, players, schema, Db, ErrorCode};
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

async fn remove_players(db: &Db, uuids: &[Uuid]) {
    for p in uuids {
        let bytes = p.as_bytes().to_vec();
        for sql in [
            "DELETE FROM player_attributes WHERE owner_uuid = ?",
            "DELETE FROM players WHERE uuid = ?",
        ] {
            let _ = sqlx::query(sql).bind(&bytes).execute(db.pool()).await;
        }
    }
}

#[tokio::test]
#[ignore = "requires COFFER_DB_HOST; see module docs"]
async fn lookup_is_case_insensitive_and_flags_ambiguity() {
    let db = test_db().await;

    let p1 = Uuid::new_v4();
    let p2 = Uuid::new_v4();
    // A unique marker keeps this test independent of leftover data.
    let marker = &Uuid::new_v4().simple().to_string()[..8];
    let name = format!("Dir{marker}");

    players::ensure_player(&db, p1, &name).await.expect("ensure p1");

    let found = players::by_name(&db, &name.to_uppercase())
        .await
        .expect("lookup")
        .expect("found");
    assert_eq!(found.uuid, p1);
    assert_eq!(found.name, name);

    // Second player with the same lowercased name makes lookup ambiguous.
    players::ensure_player(&db, p2, &name.to_lowercase()).await.expect("ensure p2");
    let err = players::by_name(&db, &name).await.expect_err("ambiguous");
    assert_eq!(err.code, ErrorCode::NameAmbiguous);

    remove_players(&db, &[p1, p2]).await;
}

#[tokio::test]
#[ignore = "requires COFFER_DB_HOST; see module docs"]
async fn rejoin_updates_name_and_seen_at_but_not_balance() {
    let db = test_db().await;

    let p1 = Uuid::new_v4();
    players::ensure_player(&db, p1, "OldName").await.expect("first join");

    sqlx::query("UPDATE players SET balance = 77 WHERE uuid = ?")
        .bind(&p1.as_bytes()[..])
        .execute(db.pool())
        .await
        .expect("set balance");

    players::ensure_player(&db, p1, "NewName").await.expect("rejoin");

    let row = players::get(&db, p1).await.expect("get").expect("player");
    assert_eq!(row.name, "NewName");
    assert_eq!(row.balance, 77, "rejoin never touches the balance");
    assert!(row.seen_at.is_some());

    assert!(players::touch_seen(&db, p1).await.expect("touch"));
    assert!(!players::touch_seen(&db, Uuid::new_v4()).await.expect("touch missing"));

    remove_players(&db, &[p1]).await;
}

#[tokio::test]
#[ignore = "requires COFFER_DB_HOST; see module docs"]
async fn attributes_round_trip_and_enforce_limits() {
    let db = test_db().await;

    let p1 = Uuid::new_v4();
    players::ensure_player(&db, p1, "AttrOwner").await.expect("ensure");

    attributes::put(&db, p1, "profile", r#"{"color":"teal","rank":3}"#)
        .await
        .expect("put");
    let value = attributes::get(&db, p1, "profile").await.expect("get").expect("value");
    assert_eq!(value, r#"{"color":"teal","rank":3}"#);

    // Update keeps created_at and bumps updated_at.
    attributes::put(&db, p1, "profile", r#"{"color":"red"}"#).await.expect("update");
    let rows = attributes::list(&db, p1).await.expect("list");
    assert_eq!(rows.len(), 1);
    assert!(rows[0].updated_at >= rows[0].created_at);

    let err = attributes::put(&db, p1, "bad", "not json").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::AttrInvalidJson);
    let oversized = format!("\"{}\"", "x".repeat(8 * 1024));
    let err = attributes::put(&db, p1, "big", &oversized).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::AttrTooLarge);

    assert!(attributes::delete(&db, p1, "profile").await.expect("delete"));
    assert!(!attributes::delete(&db, p1, "profile").await.expect("re-delete"));

    remove_players(&db, &[p1]).await;
}
