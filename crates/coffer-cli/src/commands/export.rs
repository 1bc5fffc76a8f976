use crate::services::{print_kv, Services};
use anyhow::Result;
use coffer_snapshot::{export_all, ExportOptions, PruneOptions};
use std::path::PathBuf;

pub async fn all(services: &Services, out_dir: Option<PathBuf>, gzip: bool) -> Result<()> {
    let backup_cfg = &services.config().modules.scheduler.jobs.backup;
    let opts = ExportOptions {
        out_dir: out_dir.unwrap_or_else(|| PathBuf::from(&backup_cfg.out_dir)),
        gzip: gzip || backup_cfg.gzip,
        default_zone: services.config().runtime.default_zone.clone(),
        // Manual exports never prune; retention belongs to the backup job.
        prune: None,
    };

    let report = export_all(&services.db, &opts).await?;
    print_kv(&[
        ("ok", "true".to_string()),
        ("file", report.file.display().to_string()),
        ("sha256", report.sha256.clone()),
        ("players", report.players.to_string()),
        ("attributes", report.attributes.to_string()),
        ("event_seqs", report.event_seqs.to_string()),
        ("ledger", report.ledger.to_string()),
    ]);
    Ok(())
}

/// The configured backup job settings, for `backup now`.
pub fn job_options(services: &Services) -> ExportOptions {
    let backup_cfg = &services.config().modules.scheduler.jobs.backup;
    ExportOptions {
        out_dir: PathBuf::from(&backup_cfg.out_dir),
        gzip: backup_cfg.gzip,
        default_zone: services.config().runtime.default_zone.clone(),
        prune: Some(PruneOptions {
            keep_days: backup_cfg.prune.keep_days,
            keep_max: backup_cfg.prune.keep_max,
        }),
    }
}
