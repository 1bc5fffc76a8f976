//! Built-in jobs: snapshot backup, idempotency sweep, ledger retention.
//!
//! Each builder turns its config section into a [`JobSpec`] whose body
//! captures everything it needs, so the scheduler stays generic.

use crate::{CronExpr, JobSpec};
use anyhow::{Context, Result};
use coffer_config::{CoreConfig, MissedFirePolicy};
use coffer_db::{idempotency, ledger, now_ts, Db};
use coffer_snapshot::{export_all, ExportOptions, PruneOptions};
use std::path::PathBuf;
use std::sync::Arc;

pub const JOB_BACKUP: &str = "backup";
pub const JOB_IDEMPOTENCY_SWEEP: &str = "idempotency-sweep";
pub const JOB_LEDGER_PRUNE: &str = "ledger-prune";

/// Jobs the config enables, ready to register.
pub fn built_in_jobs(cfg: &CoreConfig, db: &Db) -> Result<Vec<JobSpec>> {
    let mut jobs = Vec::new();
    if !cfg.modules.scheduler.enabled {
        return Ok(jobs);
    }
    jobs.push(backup_job(cfg, db)?);
    jobs.push(sweep_job(cfg, db)?);
    if cfg.modules.ledger.enabled && cfg.modules.ledger.retention_days > 0 {
        jobs.push(ledger_prune_job(cfg, db)?);
    }
    Ok(jobs)
}

pub fn backup_job(cfg: &CoreConfig, db: &Db) -> Result<JobSpec> {
    let job_cfg = &cfg.modules.scheduler.jobs.backup;
    let cron = CronExpr::parse(&job_cfg.schedule)
        .with_context(|| format!("backup schedule {:?}", job_cfg.schedule))?;

    let db = db.clone();
    let opts = ExportOptions {
        out_dir: PathBuf::from(&job_cfg.out_dir),
        gzip: job_cfg.gzip,
        default_zone: cfg.runtime.default_zone.clone(),
        prune: Some(PruneOptions {
            keep_days: job_cfg.prune.keep_days,
            keep_max: job_cfg.prune.keep_max,
        }),
    };

    Ok(JobSpec {
        id: JOB_BACKUP.to_string(),
        cron,
        description: format!("snapshot export into {:?}", job_cfg.out_dir),
        enabled: job_cfg.enabled,
        on_missed: job_cfg.on_missed,
        work: Arc::new(move || {
            let db = db.clone();
            let opts = opts.clone();
            Box::pin(async move {
                let report = export_all(&db, &opts).await?;
                tracing::info!(
                    job = JOB_BACKUP,
                    file = %report.file.display(),
                    sha256 = %report.sha256,
                    "backup complete"
                );
                Ok(())
            })
        }),
    })
}

pub fn sweep_job(cfg: &CoreConfig, db: &Db) -> Result<JobSpec> {
    let job_cfg = &cfg.modules.scheduler.jobs.cleanup.idempotency_sweep;
    let cron = CronExpr::parse(&job_cfg.schedule)
        .with_context(|| format!("sweep schedule {:?}", job_cfg.schedule))?;

    let db = db.clone();
    let batch_limit = job_cfg.batch_limit;
    let retention_days = job_cfg.retention_days;

    Ok(JobSpec {
        id: JOB_IDEMPOTENCY_SWEEP.to_string(),
        cron,
        description: format!("request-log sweep, batches of {batch_limit}"),
        enabled: job_cfg.enabled,
        // A missed sweep is made up for by the next one.
        on_missed: MissedFirePolicy::Skip,
        work: Arc::new(move || {
            let db = db.clone();
            Box::pin(async move {
                let deleted = idempotency::sweep_expired(&db, batch_limit, retention_days).await?;
                tracing::debug!(job = JOB_IDEMPOTENCY_SWEEP, deleted, "sweep round done");
                Ok(())
            })
        }),
    })
}

pub fn ledger_prune_job(cfg: &CoreConfig, db: &Db) -> Result<JobSpec> {
    let retention_days = cfg.modules.ledger.retention_days;
    let batch_limit = cfg.modules.scheduler.jobs.cleanup.idempotency_sweep.batch_limit;
    // Rides the sweep cadence; a separate schedule has never been needed.
    let cron = CronExpr::parse(&cfg.modules.scheduler.jobs.cleanup.idempotency_sweep.schedule)
        .context("ledger prune schedule")?;

    let db = db.clone();
    Ok(JobSpec {
        id: JOB_LEDGER_PRUNE.to_string(),
        cron,
        description: format!("ledger retention, horizon {retention_days}d"),
        enabled: true,
        on_missed: MissedFirePolicy::Skip,
        work: Arc::new(move || {
            let db = db.clone();
            Box::pin(async move {
                let cutoff = now_ts().saturating_sub(retention_days as u64 * 86_400);
                ledger::prune_older_than(&db, cutoff, batch_limit).await?;
                Ok(())
            })
        }),
    })
}
