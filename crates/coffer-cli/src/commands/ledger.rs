use crate::services::{print_kv, Services};
use anyhow::{bail, Result};
use coffer_db::ledger::{self, LedgerEntry};
use coffer_db::players;
use uuid::Uuid;

pub async fn recent(services: &Services, limit: u32) -> Result<()> {
    print_entries(&ledger::recent(&services.db, limit).await?);
    Ok(())
}

pub async fn by_player(services: &Services, player: &str, limit: u32) -> Result<()> {
    let uuid = resolve_player(services, player).await?;
    print_entries(&ledger::by_player(&services.db, uuid, limit).await?);
    Ok(())
}

pub async fn by_module(services: &Services, module: &str, limit: u32) -> Result<()> {
    print_entries(&ledger::by_module(&services.db, module, limit).await?);
    Ok(())
}

pub async fn by_reason(services: &Services, needle: &str, limit: u32) -> Result<()> {
    print_entries(&ledger::by_reason(&services.db, needle, limit).await?);
    Ok(())
}

/// Accept a canonical UUID or a player name.
async fn resolve_player(services: &Services, player: &str) -> Result<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(player) {
        return Ok(uuid);
    }
    match players::by_name(&services.db, player).await? {
        Some(row) => Ok(row.uuid),
        None => bail!("no player named {player:?}"),
    }
}

fn print_entries(entries: &[LedgerEntry]) {
    for e in entries {
        print_kv(&[
            ("id", e.id.to_string()),
            ("ts", e.ts.to_string()),
            ("module", e.module_id.clone()),
            ("op", e.op.clone()),
            (
                "from",
                e.from_uuid.map(|u| u.to_string()).unwrap_or_default(),
            ),
            ("to", e.to_uuid.map(|u| u.to_string()).unwrap_or_default()),
            ("amount", e.amount.to_string()),
            ("reason", e.reason.clone()),
            ("seq", e.seq.to_string()),
            (
                "new_units",
                e.new_units.map(|v| v.to_string()).unwrap_or_default(),
            ),
        ]);
    }
    print_kv(&[("ok", "true".to_string()), ("rows", entries.len().to_string())]);
}
