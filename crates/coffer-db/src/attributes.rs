//! Per-owner JSON attributes. Values must parse as JSON and stay under
//! 8 KiB; the table's `JSON_VALID` check backs the application-side
//! validation.

use crate::errors::{CoreError, CoreResult, ErrorCode};
use crate::pool::Db;
use crate::{now_ts, uuid_from_bytes};
use sqlx::Row;
use uuid::Uuid;

pub const MAX_VALUE_BYTES: usize = 8 * 1024;
pub const MAX_KEY_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct AttributeRow {
    pub owner_uuid: Uuid,
    pub attr_key: String,
    pub value_json: String,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Upsert one attribute. `created_at` is preserved on update.
pub async fn put(db: &Db, owner: Uuid, key: &str, value_json: &str) -> CoreResult<()> {
    let op = "attributes.put";
    db.guard_write(op)?;
    validate(op, key, value_json)?;
    let now = now_ts();

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
    .bind(key)
    .bind(value_json)
    .bind(now)
    .bind(now)
    .execute(db.pool())
    .await
    .map_err(|e| db.fail(op, e))?;
    Ok(())
}

pub async fn get(db: &Db, owner: Uuid, key: &str) -> CoreResult<Option<String>> {
    let op = "attributes.get";
    let value: Option<String> = sqlx::query_scalar(
        "SELECT value_json FROM player_attributes WHERE owner_uuid = ? AND attr_key = ?",
    )
    .bind(&owner.as_bytes()[..])
    .bind(key)
    .fetch_optional(db.pool())
    .await
    .map_err(|e| db.fail(op, e))?;
    Ok(value)
}

pub async fn delete(db: &Db, owner: Uuid, key: &str) -> CoreResult<bool> {
    let op = "attributes.delete";
    db.guard_write(op)?;
    let res = sqlx::query("DELETE FROM player_attributes WHERE owner_uuid = ? AND attr_key = ?")
        .bind(&owner.as_bytes()[..])
        .bind(key)
        .execute(db.pool())
        .await
        .map_err(|e| db.fail(op, e))?;
    Ok(res.rows_affected() > 0)
}

pub async fn list(db: &Db, owner: Uuid) -> CoreResult<Vec<AttributeRow>> {
    let op = "attributes.list";
    let rows = sqlx::query(
        r#"
        SELECT owner_uuid, attr_key, value_json, created_at, updated_at
        FROM player_attributes WHERE owner_uuid = ?
        ORDER BY attr_key
        "#,
    )
    .bind(&owner.as_bytes()[..])
    .fetch_all(db.pool())
    .await
    .map_err(|e| db.fail(op, e))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let owner_bytes: Vec<u8> = row.try_get("owner_uuid").map_err(|e| db.fail(op, e))?;
        out.push(AttributeRow {
            owner_uuid: uuid_from_bytes(op, &owner_bytes)?,
            attr_key: row.try_get("attr_key").map_err(|e| db.fail(op, e))?,
            value_json: row.try_get("value_json").map_err(|e| db.fail(op, e))?,
            created_at: row.try_get("created_at").map_err(|e| db.fail(op, e))?,
            updated_at: row.try_get("updated_at").map_err(|e| db.fail(op, e))?,
        });
    }
    Ok(out)
}

fn validate(op: &'static str, key: &str, value_json: &str) -> CoreResult<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(CoreError::new(
            ErrorCode::AttrTooLarge,
            op,
            format!("attribute key length must be 1..={MAX_KEY_LEN}"),
        ));
    }
    if value_json.len() > MAX_VALUE_BYTES {
        return Err(CoreError::new(
            ErrorCode::AttrTooLarge,
            op,
            format!(
                "attribute value is {} bytes, limit is {MAX_VALUE_BYTES}",
                value_json.len()
            ),
        ));
    }
    if serde_json::from_str::<serde_json::Value>(value_json).is_err() {
        return Err(CoreError::new(
            ErrorCode::AttrInvalidJson,
            op,
            "attribute value is not valid JSON",
        ));
    }
    Ok(())
}
