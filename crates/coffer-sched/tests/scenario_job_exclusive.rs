//! Scheduler exclusivity: while a job body runs, a manual trigger reports
//! `InProgress` and no second execution starts. The advisory lock keeps
//! other nodes (here: a second scheduler on the same database) out too.
//!
//! Requires a reachable MariaDB/MySQL instance via COFFER_DB_*.

use coffer_config::MissedFirePolicy;
use coffer_db::{schema, Db, ErrorCode};
use coffer_sched::{CronExpr, JobSpec, RunResult, Scheduler};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn test_db() -> Db {
    if std::env::var("COFFER_DB_HOST").is_err() {
        panic!("DB tests require COFFER_DB_HOST (and friends); run: COFFER_DB_HOST=127.0.0.1 COFFER_DB_DATABASE=coffer_test cargo test -p coffer-sched -- --include-ignored");
    }
    let loaded = coffer_config::load_defaults().expect("config");
    let db = Db::connect(&loaded.config).await.expect("connect");
    for _ in 0..20 {
        match schema::apply(&db).await {
            Ok(_) => return db,
            Err(e) if e.code == ErrorCode::MigrationLocked => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => panic!("migrate failed: {e}"),
        }
    }
    panic!("migration lock never freed");
}

fn slow_job(id: &str, runs: Arc<AtomicU32>, hold: Duration) -> JobSpec {
    JobSpec {
        id: id.to_string(),
        cron: CronExpr::parse("*/2 * * * * *").expect("cron"),
        description: "sleeps while holding its lock".to_string(),
        enabled: true,
        on_missed: MissedFirePolicy::Skip,
        work: Arc::new(move || {
            let runs = runs.clone();
            Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(hold).await;
                Ok(())
            })
        }),
    }
}

#[tokio::test]
#[ignore = "requires COFFER_DB_HOST; see module docs"]
async fn manual_trigger_during_execution_reports_in_progress() {
    let db = test_db().await;
    let runs = Arc::new(AtomicU32::new(0));

    let scheduler = Scheduler::new(db.clone());
    scheduler
        .register(slow_job("exclusive-test", runs.clone(), Duration::from_secs(5)))
        .expect("register");

    assert_eq!(scheduler.run_now("exclusive-test"), RunResult::Queued);

    // Give the execution time to start and take its lock.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    assert_eq!(
        scheduler.run_now("exclusive-test"),
        RunResult::InProgress,
        "second trigger while running"
    );
    // Still exactly one execution.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1, "no overlapping execution");

    assert_eq!(scheduler.run_now("missing"), RunResult::Unknown);
    scheduler.shutdown();
}

#[tokio::test]
#[ignore = "requires COFFER_DB_HOST; see module docs"]
async fn advisory_lock_keeps_second_node_out() {
    let db = test_db().await;

    let runs_a = Arc::new(AtomicU32::new(0));
    let runs_b = Arc::new(AtomicU32::new(0));

    // Two schedulers on the same database: the same job id maps to the same
    // advisory lock name, so only one body runs at a time.
    let node_a = Scheduler::new(db.clone());
    node_a
        .register(slow_job("contended-test", runs_a.clone(), Duration::from_secs(3)))
        .expect("register a");
    let node_b = Scheduler::new(db.clone());
    node_b
        .register(slow_job("contended-test", runs_b.clone(), Duration::from_secs(3)))
        .expect("register b");

    assert_eq!(node_a.run_now("contended-test"), RunResult::Queued);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(runs_a.load(Ordering::SeqCst), 1);

    // Node B accepts the trigger but skips the body: the lock is taken.
    assert_eq!(node_b.run_now("contended-test"), RunResult::Queued);
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(runs_b.load(Ordering::SeqCst), 0, "lock holder excludes node b");

    node_a.shutdown();
    node_b.shutdown();
}

#[tokio::test]
#[ignore = "requires COFFER_DB_HOST; see module docs"]
async fn disabled_jobs_refuse_manual_triggers() {
    let db = test_db().await;
    let runs = Arc::new(AtomicU32::new(0));

    let scheduler = Scheduler::new(db.clone());
    let mut spec = slow_job("disabled-test", runs.clone(), Duration::from_millis(10));
    spec.enabled = false;
    scheduler.register(spec).expect("register");

    assert_eq!(scheduler.run_now("disabled-test"), RunResult::Disabled);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    scheduler.shutdown();
}
