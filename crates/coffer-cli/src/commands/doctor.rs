use crate::services::{print_kv, Services};
use anyhow::{Context, Result};
use coffer_db::lock;
use coffer_db::schema::{self, CORE_TABLES};
use coffer_sched::jobs::{JOB_BACKUP, JOB_IDEMPOTENCY_SWEEP, JOB_LEDGER_PRUNE};

pub struct Flags {
    pub fk: bool,
    pub orphans: bool,
    pub counts: bool,
    pub analyze: bool,
    pub locks: bool,
}

pub async fn run(services: &Services, flags: Flags) -> Result<()> {
    let db = &services.db;

    if flags.counts {
        for (table, count) in schema::table_counts(db).await? {
            print_kv(&[
                ("check", "counts".to_string()),
                ("table", table),
                (
                    "rows",
                    if count < 0 { "missing".to_string() } else { count.to_string() },
                ),
            ]);
        }
    }

    if flags.fk {
        // The core schema declares no inter-table foreign keys; anything
        // found here was added out-of-band.
        let declared: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM information_schema.referential_constraints
            WHERE constraint_schema = DATABASE()
            "#,
        )
        .fetch_one(db.pool())
        .await
        .context("fk declarations query")?;
        print_kv(&[
            ("check", "fk".to_string()),
            ("declared", declared.to_string()),
            ("expected", "0".to_string()),
        ]);
    }

    if flags.orphans {
        for (label, sql) in [
            (
                "ledger_from",
                "SELECT COUNT(*) FROM core_ledger l LEFT JOIN players p ON p.uuid = l.from_uuid \
                 WHERE l.from_uuid IS NOT NULL AND p.uuid IS NULL",
            ),
            (
                "ledger_to",
                "SELECT COUNT(*) FROM core_ledger l LEFT JOIN players p ON p.uuid = l.to_uuid \
                 WHERE l.to_uuid IS NOT NULL AND p.uuid IS NULL",
            ),
            (
                "attributes",
                "SELECT COUNT(*) FROM player_attributes a LEFT JOIN players p ON p.uuid = a.owner_uuid \
                 WHERE p.uuid IS NULL",
            ),
            (
                "event_seq",
                "SELECT COUNT(*) FROM player_event_seq s LEFT JOIN players p ON p.uuid = s.uuid \
                 WHERE p.uuid IS NULL",
            ),
        ] {
            let orphans: i64 = sqlx::query_scalar(sql)
                .fetch_one(db.pool())
                .await
                .with_context(|| format!("orphan query {label}"))?;
            print_kv(&[
                ("check", "orphans".to_string()),
                ("relation", label.to_string()),
                ("rows", orphans.to_string()),
            ]);
        }
    }

    if flags.analyze {
        for table in CORE_TABLES {
            // Fixed identifier list, not caller input.
            sqlx::query(&format!("ANALYZE TABLE {table}"))
                .fetch_all(db.pool())
                .await
                .with_context(|| format!("analyze {table}"))?;
            print_kv(&[
                ("check", "analyze".to_string()),
                ("table", table.to_string()),
                ("analyzed", "true".to_string()),
            ]);
        }
    }

    if flags.locks {
        let mut names = vec![schema::MIGRATE_LOCK.to_string()];
        for job in [JOB_BACKUP, JOB_IDEMPOTENCY_SWEEP, JOB_LEDGER_PRUNE] {
            names.push(format!("coffer:job:{job}"));
        }
        for name in names {
            let free = lock::is_free(db, &name).await?;
            print_kv(&[
                ("check", "locks".to_string()),
                ("lock", name),
                ("free", free.to_string()),
            ]);
        }
    }

    print_kv(&[("ok", "true".to_string())]);
    Ok(())
}
