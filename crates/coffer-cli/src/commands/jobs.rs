use crate::commands::export::job_options;
use crate::services::{print_kv, Services};
use anyhow::Result;
use chrono::{TimeZone, Utc};
use coffer_sched::jobs::built_in_jobs;
use coffer_sched::Scheduler;
use coffer_snapshot::export_all;

pub async fn list(services: &Services) -> Result<()> {
    let scheduler = Scheduler::new(services.db.clone());
    for spec in built_in_jobs(services.config(), &services.db)? {
        scheduler.register(spec)?;
    }

    for job in scheduler.list() {
        print_kv(&[
            ("job", job.id),
            ("cron", job.cron),
            ("enabled", job.enabled.to_string()),
            ("next_fire", job.next_fire.map(fmt_ts).unwrap_or_default()),
            ("description", job.description),
        ]);
    }
    print_kv(&[("ok", "true".to_string())]);
    Ok(())
}

pub async fn run(services: &Services, name: &str) -> Result<()> {
    let scheduler = Scheduler::new(services.db.clone());
    for spec in built_in_jobs(services.config(), &services.db)? {
        scheduler.register(spec)?;
    }

    let result = scheduler.run_blocking(name).await?;
    print_kv(&[
        ("ok", "true".to_string()),
        ("job", name.to_string()),
        ("result", result.as_str().to_string()),
    ]);
    Ok(())
}

pub async fn backup_now(services: &Services) -> Result<()> {
    let report = export_all(&services.db, &job_options(services)).await?;
    print_kv(&[
        ("ok", "true".to_string()),
        ("file", report.file.display().to_string()),
        ("sha256", report.sha256.clone()),
        ("pruned", report.pruned.len().to_string()),
    ]);
    Ok(())
}

fn fmt_ts(ts: u64) -> String {
    Utc.timestamp_opt(ts as i64, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
