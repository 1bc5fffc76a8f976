//! Cron-driven job scheduler with single-node execution.
//!
//! Every registered job gets its own ticker task that sleeps until the next
//! cron match. At most one execution per job is in flight; a fire landing
//! while the previous execution still runs is dropped, so a slow job never
//! builds a backlog. Before the body runs, the job takes a named database
//! advisory lock non-blocking; losing the race means another node is
//! already on it and this tick is skipped.

pub mod cron;
pub mod jobs;

pub use cron::CronExpr;

use coffer_config::MissedFirePolicy;
use coffer_db::lock::AdvisoryLock;
use coffer_db::{now_ts, Db};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Job bodies are plain async closures; everything they need is captured.
pub type JobFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone)]
pub struct JobSpec {
    pub id: String,
    pub cron: CronExpr,
    pub description: String,
    pub enabled: bool,
    pub on_missed: MissedFirePolicy,
    pub work: JobFn,
}

/// Outcome of a manual trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    Queued,
    InProgress,
    Unknown,
    Disabled,
}

impl RunResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunResult::Queued => "queued",
            RunResult::InProgress => "in_progress",
            RunResult::Unknown => "unknown",
            RunResult::Disabled => "disabled",
        }
    }
}

/// Row for `jobs list`.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: String,
    pub cron: String,
    pub description: String,
    pub enabled: bool,
    pub running: bool,
    pub next_fire: Option<u64>,
}

struct JobState {
    spec: JobSpec,
    running: AtomicBool,
}

pub struct Scheduler {
    db: Db,
    jobs: Mutex<HashMap<String, Arc<JobState>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    started: AtomicBool,
}

impl Scheduler {
    pub fn new(db: Db) -> Arc<Scheduler> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Scheduler {
            db,
            jobs: Mutex::new(HashMap::new()),
            shutdown_tx,
            shutdown_rx,
            started: AtomicBool::new(false),
        })
    }

    /// Register a job. Registration after [`Scheduler::start`] is an error;
    /// the registry is fixed at boot.
    pub fn register(&self, spec: JobSpec) -> anyhow::Result<()> {
        if self.started.load(Ordering::Acquire) {
            anyhow::bail!("scheduler already started");
        }
        let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        if jobs.contains_key(&spec.id) {
            anyhow::bail!("duplicate job id {:?}", spec.id);
        }
        jobs.insert(
            spec.id.clone(),
            Arc::new(JobState {
                spec,
                running: AtomicBool::new(false),
            }),
        );
        Ok(())
    }

    /// Spawn one ticker task per enabled job and fire startup catch-ups for
    /// jobs configured with `runAtNextStartup`.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let jobs: Vec<Arc<JobState>> = {
            let jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
            jobs.values().cloned().collect()
        };
        for state in jobs {
            if !state.spec.enabled {
                tracing::info!(job = %state.spec.id, "job disabled, not scheduled");
                continue;
            }
            if state.spec.on_missed == MissedFirePolicy::RunAtNextStartup {
                tracing::info!(job = %state.spec.id, "startup catch-up fire");
                self.fire(&state, "startup");
            }
            self.spawn_ticker(Arc::clone(&state));
        }
    }

    fn spawn_ticker(self: &Arc<Self>, state: Arc<JobState>) {
        let scheduler = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                let now = now_ts();
                let Some(next) = state.spec.cron.next_after(now) else {
                    tracing::warn!(job = %state.spec.id, "cron has no future match, ticker stops");
                    return;
                };
                let wait = Duration::from_secs(next.saturating_sub(now));
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        scheduler.fire(&state, "cron");
                    }
                    _ = shutdown.changed() => {
                        tracing::debug!(job = %state.spec.id, "ticker stopped");
                        return;
                    }
                }
            }
        });
    }

    /// Start an execution unless one is already in flight (the fire is then
    /// dropped, not queued).
    fn fire(&self, state: &Arc<JobState>, origin: &'static str) {
        if *self.shutdown_rx.borrow() {
            return;
        }
        if state.running.swap(true, Ordering::AcqRel) {
            tracing::debug!(job = %state.spec.id, origin, "fire dropped, execution in flight");
            return;
        }
        let db = self.db.clone();
        let state = Arc::clone(state);
        tokio::spawn(async move {
            run_locked(&db, &state.spec).await;
            state.running.store(false, Ordering::Release);
        });
    }

    /// Manual trigger (`jobs run`). Never blocks on the job body.
    pub fn run_now(&self, id: &str) -> RunResult {
        let state = {
            let jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
            jobs.get(id).cloned()
        };
        let Some(state) = state else {
            return RunResult::Unknown;
        };
        if !state.spec.enabled {
            return RunResult::Disabled;
        }
        if state.running.load(Ordering::Acquire) {
            return RunResult::InProgress;
        }
        self.fire(&state, "manual");
        RunResult::Queued
    }

    /// Run a job inline and wait for it, for one-shot admin processes. The
    /// in-flight guard still applies.
    pub async fn run_blocking(&self, id: &str) -> anyhow::Result<RunResult> {
        let state = {
            let jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
            jobs.get(id).cloned()
        };
        let Some(state) = state else {
            return Ok(RunResult::Unknown);
        };
        if !state.spec.enabled {
            return Ok(RunResult::Disabled);
        }
        if state.running.swap(true, Ordering::AcqRel) {
            return Ok(RunResult::InProgress);
        }
        run_locked(&self.db, &state.spec).await;
        state.running.store(false, Ordering::Release);
        Ok(RunResult::Queued)
    }

    pub fn list(&self) -> Vec<JobInfo> {
        let now = now_ts();
        let jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<JobInfo> = jobs
            .values()
            .map(|state| JobInfo {
                id: state.spec.id.clone(),
                cron: state.spec.cron.source().to_string(),
                description: state.spec.description.clone(),
                enabled: state.spec.enabled,
                running: state.running.load(Ordering::Acquire),
                next_fire: if state.spec.enabled {
                    state.spec.cron.next_after(now)
                } else {
                    None
                },
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Stop accepting fires and cancel pending schedules. Executions
    /// already past the lock acquire finish on their own.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Acquire the job's advisory lock non-blocking, run the body, release.
/// Losing the lock race means another node runs this job; skip the tick.
async fn run_locked(db: &Db, spec: &JobSpec) {
    let lock_name = format!("coffer:job:{}", spec.id);
    let lock = match AdvisoryLock::try_acquire(db, &lock_name).await {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            tracing::info!(job = %spec.id, "advisory lock busy, skipping this tick");
            return;
        }
        Err(e) => {
            tracing::warn!(job = %spec.id, code = %e.code, "advisory lock acquire failed");
            return;
        }
    };

    let started = std::time::Instant::now();
    match (spec.work)().await {
        Ok(()) => {
            tracing::info!(job = %spec.id, elapsed_ms = started.elapsed().as_millis() as u64, "job finished");
        }
        Err(e) => {
            tracing::error!(job = %spec.id, error = %e, "job failed");
        }
    }

    if let Err(e) = lock.release().await {
        tracing::warn!(job = %spec.id, code = %e.code, "advisory lock release failed");
    }
}
