//! Player directory: UUID→name mapping with case-insensitive lookup.
//!
//! Rows are created on first sight and never destroyed by the core.
//! `name_lower` is a stored generated column, so lookups stay indexed no
//! matter how the host cases names.

use crate::errors::{CoreError, CoreResult, ErrorCode};
use crate::pool::Db;
use crate::{now_ts, uuid_from_bytes};
use sqlx::Row;
use uuid::Uuid;

pub const MAX_NAME_LEN: usize = 48;

#[derive(Debug, Clone)]
pub struct PlayerRow {
    pub uuid: Uuid,
    pub name: String,
    pub balance: i64,
    pub created_at: u64,
    pub updated_at: u64,
    pub seen_at: Option<u64>,
}

fn row_to_player(row: &sqlx::mysql::MySqlRow) -> CoreResult<PlayerRow> {
    let op = "players.decode";
    let uuid_bytes: Vec<u8> = row.try_get("uuid").map_err(|e| CoreError::from_sqlx(op, e))?;
    Ok(PlayerRow {
        uuid: uuid_from_bytes(op, &uuid_bytes)?,
        name: row.try_get("name").map_err(|e| CoreError::from_sqlx(op, e))?,
        balance: row.try_get("balance").map_err(|e| CoreError::from_sqlx(op, e))?,
        created_at: row.try_get("created_at").map_err(|e| CoreError::from_sqlx(op, e))?,
        updated_at: row.try_get("updated_at").map_err(|e| CoreError::from_sqlx(op, e))?,
        seen_at: row.try_get("seen_at").map_err(|e| CoreError::from_sqlx(op, e))?,
    })
}

/// First-seen insert, name refresh and `seen_at` bump on join. Balance is
/// untouched for existing rows.
pub async fn ensure_player(db: &Db, uuid: Uuid, name: &str) -> CoreResult<()> {
    let op = "players.ensure";
    db.guard_write(op)?;
    let name = clamp_name(name);
    let now = now_ts();

    sqlx::query(
        r#"
        INSERT INTO players (uuid, name, balance, created_at, updated_at, seen_at)
        VALUES (?, ?, 0, ?, ?, ?)
        ON DUPLICATE KEY UPDATE
            name = VALUES(name),
            seen_at = VALUES(seen_at),
            updated_at = VALUES(updated_at)
        "#,
    )
    .bind(&uuid.as_bytes()[..])
    .bind(&name)
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(db.pool())
    .await
    .map_err(|e| db.fail(op, e))?;
    Ok(())
}

pub async fn get(db: &Db, uuid: Uuid) -> CoreResult<Option<PlayerRow>> {
    let op = "players.get";
    let row = sqlx::query(
        r#"
        SELECT uuid, name, balance, created_at, updated_at, seen_at
        FROM players WHERE uuid = ?
        "#,
    )
    .bind(&uuid.as_bytes()[..])
    .fetch_optional(db.pool())
    .await
    .map_err(|e| db.fail(op, e))?;
    row.as_ref().map(row_to_player).transpose()
}

/// Case-insensitive name lookup. Distinct players sharing a lowercased
/// name is a host-visible conflict, reported as `NAME_AMBIGUOUS`.
pub async fn by_name(db: &Db, name: &str) -> CoreResult<Option<PlayerRow>> {
    let op = "players.by_name";
    let rows = sqlx::query(
        r#"
        SELECT uuid, name, balance, created_at, updated_at, seen_at
        FROM players WHERE name_lower = LOWER(?)
        LIMIT 2
        "#,
    )
    .bind(name.trim())
    .fetch_all(db.pool())
    .await
    .map_err(|e| db.fail(op, e))?;

    match rows.len() {
        0 => Ok(None),
        1 => Ok(Some(row_to_player(&rows[0])?)),
        _ => Err(CoreError::new(
            ErrorCode::NameAmbiguous,
            op,
            format!("more than one player named {:?}", name.trim()),
        )),
    }
}

/// Stamp `seen_at` for a join without touching anything else.
pub async fn touch_seen(db: &Db, uuid: Uuid) -> CoreResult<bool> {
    let op = "players.touch_seen";
    db.guard_write(op)?;
    let res = sqlx::query("UPDATE players SET seen_at = ? WHERE uuid = ?")
        .bind(now_ts())
        .bind(&uuid.as_bytes()[..])
        .execute(db.pool())
        .await
        .map_err(|e| db.fail(op, e))?;
    Ok(res.rows_affected() > 0)
}

pub fn clamp_name(name: &str) -> String {
    let trimmed = name.trim();
    trimmed.chars().take(MAX_NAME_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_name_trims_and_caps() {
        assert_eq!(clamp_name("  Steve  "), "Steve");
        let long = "x".repeat(60);
        assert_eq!(clamp_name(&long).len(), MAX_NAME_LEN);
    }
}
