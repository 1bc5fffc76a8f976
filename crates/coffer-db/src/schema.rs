//! Idempotent schema management.
//!
//! A fixed, ordered sequence of `CREATE TABLE IF NOT EXISTS` statements,
//! followed by additive column/index/check guards that consult the
//! information schema before issuing any `ALTER`. The runtime version is
//! recorded only after a fully successful pass. Safe to run on every boot
//! and from any number of nodes: a `core:migrate` advisory lock serializes
//! concurrent migrators.

use crate::errors::{CoreError, CoreResult, ErrorCode};
use crate::lock::AdvisoryLock;
use crate::pool::Db;
use sqlx::Row;

/// Version this build of the core writes after a successful pass.
pub const SCHEMA_VERSION: i32 = 1;

pub const MIGRATE_LOCK: &str = "coffer:core:migrate";

/// Core tables, creation order. Restores and doctors walk the same list.
pub const CORE_TABLES: [&str; 6] = [
    "core_schema_version",
    "players",
    "player_event_seq",
    "core_requests",
    "player_attributes",
    "core_ledger",
];

const CREATE_TABLES: [(&str, &str); 6] = [
    (
        "core_schema_version",
        r#"
        CREATE TABLE IF NOT EXISTS core_schema_version (
            version     INT NOT NULL PRIMARY KEY,
            applied_at  BIGINT UNSIGNED NOT NULL
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 ROW_FORMAT=DYNAMIC
        "#,
    ),
    (
        "players",
        r#"
        CREATE TABLE IF NOT EXISTS players (
            uuid        BINARY(16) NOT NULL PRIMARY KEY,
            name        VARCHAR(48) NOT NULL,
            name_lower  VARCHAR(48) AS (LOWER(name)) STORED,
            balance     BIGINT NOT NULL DEFAULT 0,
            created_at  BIGINT UNSIGNED NOT NULL,
            updated_at  BIGINT UNSIGNED NOT NULL,
            seen_at     BIGINT UNSIGNED NULL,
            KEY idx_players_name_lower (name_lower),
            CONSTRAINT chk_players_balance CHECK (balance >= 0)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 ROW_FORMAT=DYNAMIC
        "#,
    ),
    (
        "player_event_seq",
        r#"
        CREATE TABLE IF NOT EXISTS player_event_seq (
            uuid  BINARY(16) NOT NULL PRIMARY KEY,
            seq   BIGINT UNSIGNED NOT NULL DEFAULT 0
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 ROW_FORMAT=DYNAMIC
        "#,
    ),
    (
        "core_requests",
        r#"
        CREATE TABLE IF NOT EXISTS core_requests (
            scope         VARCHAR(64) NOT NULL,
            key_hash      BINARY(32) NOT NULL,
            payload_hash  BINARY(32) NOT NULL,
            ok            TINYINT(1) NOT NULL DEFAULT 0,
            created_at    BIGINT UNSIGNED NOT NULL,
            expires_at    BIGINT UNSIGNED NOT NULL,
            PRIMARY KEY (scope, key_hash),
            KEY idx_core_requests_expires (expires_at)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 ROW_FORMAT=DYNAMIC
        "#,
    ),
    (
        "player_attributes",
        r#"
        CREATE TABLE IF NOT EXISTS player_attributes (
            owner_uuid  BINARY(16) NOT NULL,
            attr_key    VARCHAR(64) NOT NULL,
            value_json  TEXT NOT NULL,
            created_at  BIGINT UNSIGNED NOT NULL,
            updated_at  BIGINT UNSIGNED NOT NULL,
            PRIMARY KEY (owner_uuid, attr_key),
            CONSTRAINT chk_player_attributes_json CHECK (JSON_VALID(value_json))
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 ROW_FORMAT=DYNAMIC
        "#,
    ),
    (
        "core_ledger",
        r#"
        CREATE TABLE IF NOT EXISTS core_ledger (
            id             BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
            ts             BIGINT UNSIGNED NOT NULL,
            module_id      VARCHAR(64) NOT NULL,
            op             VARCHAR(16) NOT NULL,
            from_uuid      BINARY(16) NULL,
            to_uuid        BINARY(16) NULL,
            amount         BIGINT NOT NULL,
            reason         VARCHAR(64) NOT NULL,
            ok             TINYINT(1) NOT NULL,
            code           VARCHAR(32) NULL,
            seq            BIGINT UNSIGNED NOT NULL DEFAULT 0,
            idem_scope     VARCHAR(64) NULL,
            idem_key_hash  BINARY(32) NULL,
            old_units      BIGINT NULL,
            new_units      BIGINT NULL,
            server_node    VARCHAR(64) NULL,
            extra_json     TEXT NULL,
            KEY idx_core_ledger_from (from_uuid, id),
            KEY idx_core_ledger_to (to_uuid, id),
            KEY idx_core_ledger_module (module_id, id)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 ROW_FORMAT=DYNAMIC
        "#,
    ),
];

/// Additive column guards: `(table, column, ALTER)`. Applied only when the
/// information schema says the column is missing, so a node running newer
/// DDL against an older database converges without destructive work.
const COLUMN_GUARDS: [(&str, &str, &str); 3] = [
    (
        "players",
        "seen_at",
        "ALTER TABLE players ADD COLUMN seen_at BIGINT UNSIGNED NULL",
    ),
    (
        "core_ledger",
        "server_node",
        "ALTER TABLE core_ledger ADD COLUMN server_node VARCHAR(64) NULL",
    ),
    (
        "core_ledger",
        "extra_json",
        "ALTER TABLE core_ledger ADD COLUMN extra_json TEXT NULL",
    ),
];

/// Additive index guards: `(table, index, ALTER)`.
const INDEX_GUARDS: [(&str, &str, &str); 2] = [
    (
        "core_requests",
        "idx_core_requests_expires",
        "ALTER TABLE core_requests ADD KEY idx_core_requests_expires (expires_at)",
    ),
    (
        "core_ledger",
        "idx_core_ledger_module",
        "ALTER TABLE core_ledger ADD KEY idx_core_ledger_module (module_id, id)",
    ),
];

#[derive(Debug, Clone, Default)]
pub struct SchemaReport {
    pub recorded_version: Option<i32>,
    pub runtime_version: i32,
    pub missing_tables: Vec<String>,
    pub missing_columns: Vec<String>,
    pub missing_indexes: Vec<String>,
    pub applied: bool,
}

impl SchemaReport {
    pub fn is_current(&self) -> bool {
        self.recorded_version == Some(self.runtime_version)
            && self.missing_tables.is_empty()
            && self.missing_columns.is_empty()
            && self.missing_indexes.is_empty()
    }
}

/// Inspect without mutating: which tables/columns/indexes are missing and
/// what version the database has recorded.
pub async fn check(db: &Db) -> CoreResult<SchemaReport> {
    let mut report = SchemaReport {
        runtime_version: SCHEMA_VERSION,
        ..Default::default()
    };

    for table in CORE_TABLES {
        if !table_exists(db, table).await? {
            report.missing_tables.push(table.to_string());
        }
    }

    for (table, column, _) in COLUMN_GUARDS {
        if !report.missing_tables.iter().any(|t| t == table)
            && !column_exists(db, table, column).await?
        {
            report.missing_columns.push(format!("{table}.{column}"));
        }
    }

    for (table, index, _) in INDEX_GUARDS {
        if !report.missing_tables.iter().any(|t| t == table)
            && !index_exists(db, table, index).await?
        {
            report.missing_indexes.push(format!("{table}.{index}"));
        }
    }

    report.recorded_version = recorded_version(db).await?;
    Ok(report)
}

/// Run the full pass under the migration lock and record the version.
/// Nothing is recorded when any statement fails.
pub async fn apply(db: &Db) -> CoreResult<SchemaReport> {
    let lock = match AdvisoryLock::try_acquire(db, MIGRATE_LOCK).await? {
        Some(lock) => lock,
        None => {
            return Err(CoreError::new(
                ErrorCode::MigrationLocked,
                "migrate.apply",
                "another node holds the migration lock",
            ))
        }
    };

    let result = apply_locked(db).await;
    lock.release().await?;
    result
}

async fn apply_locked(db: &Db) -> CoreResult<SchemaReport> {
    for (table, ddl) in CREATE_TABLES {
        sqlx::query(ddl)
            .execute(db.pool())
            .await
            .map_err(|e| db.fail("migrate.apply", e))?;
        tracing::debug!(table, "table ensured");
    }

    for (table, column, alter) in COLUMN_GUARDS {
        if !column_exists(db, table, column).await? {
            sqlx::query(alter)
                .execute(db.pool())
                .await
                .map_err(|e| db.fail("migrate.apply", e))?;
            tracing::info!(table, column, "added column");
        }
    }

    for (table, index, alter) in INDEX_GUARDS {
        if !index_exists(db, table, index).await? {
            sqlx::query(alter)
                .execute(db.pool())
                .await
                .map_err(|e| db.fail("migrate.apply", e))?;
            tracing::info!(table, index, "added index");
        }
    }

    record_version(db, SCHEMA_VERSION).await?;

    let mut report = check(db).await?;
    report.applied = true;
    Ok(report)
}

/// The highest version ever recorded, `None` on a fresh database.
pub async fn recorded_version(db: &Db) -> CoreResult<Option<i32>> {
    if !table_exists(db, "core_schema_version").await? {
        return Ok(None);
    }
    let v: Option<i32> = sqlx::query_scalar("SELECT MAX(version) FROM core_schema_version")
        .fetch_one(db.pool())
        .await
        .map_err(|e| db.fail("migrate.check", e))?;
    Ok(v)
}

/// Record `version` exactly once; re-recording an applied version is a
/// no-op.
pub async fn record_version(db: &Db, version: i32) -> CoreResult<()> {
    sqlx::query("INSERT IGNORE INTO core_schema_version (version, applied_at) VALUES (?, ?)")
        .bind(version)
        .bind(crate::now_ts())
        .execute(db.pool())
        .await
        .map_err(|e| db.fail("migrate.apply", e))?;
    Ok(())
}

pub async fn table_exists(db: &Db, table: &str) -> CoreResult<bool> {
    let exists: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM information_schema.tables
        WHERE table_schema = DATABASE() AND table_name = ?
        "#,
    )
    .bind(table)
    .fetch_one(db.pool())
    .await
    .map_err(|e| db.fail("migrate.check", e))?;
    Ok(exists > 0)
}

async fn column_exists(db: &Db, table: &str, column: &str) -> CoreResult<bool> {
    let exists: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM information_schema.columns
        WHERE table_schema = DATABASE() AND table_name = ? AND column_name = ?
        "#,
    )
    .bind(table)
    .bind(column)
    .fetch_one(db.pool())
    .await
    .map_err(|e| db.fail("migrate.check", e))?;
    Ok(exists > 0)
}

async fn index_exists(db: &Db, table: &str, index: &str) -> CoreResult<bool> {
    let exists: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM information_schema.statistics
        WHERE table_schema = DATABASE() AND table_name = ? AND index_name = ?
        "#,
    )
    .bind(table)
    .bind(index)
    .fetch_one(db.pool())
    .await
    .map_err(|e| db.fail("migrate.check", e))?;
    Ok(exists > 0)
}

/// Row counts per core table, for `doctor --counts`.
pub async fn table_counts(db: &Db) -> CoreResult<Vec<(String, i64)>> {
    let mut out = Vec::with_capacity(CORE_TABLES.len());
    for table in CORE_TABLES {
        if !table_exists(db, table).await? {
            out.push((table.to_string(), -1));
            continue;
        }
        // Table names come from the fixed CORE_TABLES list, never from
        // callers, so formatting the identifier here is safe.
        let n: i64 = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table}"))
            .fetch_one(db.pool())
            .await
            .map_err(|e| db.fail("doctor.counts", e))?
            .try_get("n")
            .map_err(|e| db.fail("doctor.counts", e))?;
        out.push((table.to_string(), n));
    }
    Ok(out)
}
