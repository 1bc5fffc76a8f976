use crate::services::{print_kv, Services};
use anyhow::{bail, Result};
use coffer_snapshot::{import, ImportOptions, RestoreMode, RestoreStrategy};
use std::path::PathBuf;

#[allow(clippy::too_many_arguments)]
pub async fn run(
    services: &Services,
    mode: &str,
    strategy: Option<&str>,
    from: PathBuf,
    overwrite: bool,
    skip_fk_checks: bool,
    allow_missing_checksum: bool,
) -> Result<()> {
    let mode = match (mode, strategy) {
        ("fresh", None | Some("atomic")) => RestoreMode::Fresh(RestoreStrategy::Atomic),
        ("fresh", Some("staging")) => RestoreMode::Fresh(RestoreStrategy::Staging),
        ("fresh", Some(other)) => bail!("unknown strategy {other:?} (atomic|staging)"),
        ("merge", None) => RestoreMode::Merge { overwrite },
        ("merge", Some(_)) => bail!("strategy only applies to fresh mode"),
        (other, _) => bail!("unknown mode {other:?} (fresh|merge)"),
    };

    let report = import(
        &services.db,
        &ImportOptions {
            from,
            mode,
            skip_fk_checks,
            allow_missing_checksum,
        },
    )
    .await?;

    print_kv(&[
        ("ok", "true".to_string()),
        ("mode", report.mode.to_string()),
        ("file", report.file.display().to_string()),
        ("players", report.players.to_string()),
        ("attributes", report.attributes.to_string()),
        ("event_seqs", report.event_seqs.to_string()),
        ("ledger", report.ledger.to_string()),
        ("skipped", report.skipped.to_string()),
    ]);
    Ok(())
}
