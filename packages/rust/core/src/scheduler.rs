//! Per-job recurring triggers.
//!
//! Each active job owns one timer task. A tick dispatches one run on its own
//! task, guarded by a per-job in-flight flag:
//!
//! ```text
//! trigger(job) ──tick──► in-flight? ──yes──► dropped (coalesced)
//!                                  └──no───► spawn run ──► flag cleared on exit
//! ```
//!
//! The flag outlives trigger replacement, so rescheduling a job while a run
//! is in flight never lets a second run start. Runs are never cancelled:
//! stopping a trigger only stops future ticks.
//!
//! Job rows can change outside this process (`riskwatch jobs ...` against
//! the same database). [`Scheduler::watch`] re-reads the active jobs every
//! [`RECONCILE_INTERVAL`] and brings the triggers in line.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use riskwatch_shared::{JobId, JobStatus, MIN_INTERVAL_SECS, Result};
use riskwatch_storage::Storage;

/// Period of [`Scheduler::watch`]; no job ticks faster than this.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(MIN_INTERVAL_SECS as u64);

/// Executes one run of a job. Failures are handled by the implementor.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run_job(&self, job_id: &JobId);
}

struct Trigger {
    interval_secs: u32,
    cancel: CancellationToken,
}

/// Clears the in-flight flag when a run finishes, however it finishes.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Owns every job's trigger. Construct once per process and share via `Arc`.
pub struct Scheduler {
    runner: Arc<dyn JobRunner>,
    triggers: Mutex<HashMap<JobId, Trigger>>,
    in_flight: Mutex<HashMap<JobId, Arc<AtomicBool>>>,
    shutdown: CancellationToken,
    runs: TaskTracker,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        Self {
            runner,
            triggers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            runs: TaskTracker::new(),
        }
    }

    /// Install a trigger for every active job. Returns how many were installed.
    #[instrument(skip_all)]
    pub async fn start(&self, storage: &Storage) -> Result<usize> {
        let scheduled = self.reconcile(storage).await?;
        info!(jobs = scheduled, "scheduler started");
        Ok(scheduled)
    }

    /// Schedule every active job at its stored interval and remove every
    /// other trigger. Idle in-flight flags of removed jobs are dropped.
    /// Returns the number of active jobs.
    pub async fn reconcile(&self, storage: &Storage) -> Result<usize> {
        let jobs = storage.list_jobs(Some(JobStatus::Active)).await?;
        let active: HashSet<&JobId> = jobs.iter().map(|job| &job.id).collect();

        let stale: Vec<JobId> = self
            .triggers
            .lock()
            .await
            .keys()
            .filter(|id| !active.contains(id))
            .cloned()
            .collect();
        for id in &stale {
            self.remove_job(id).await;
        }
        for job in &jobs {
            self.schedule_job(&job.id, job.interval_secs).await;
        }

        self.in_flight
            .lock()
            .await
            .retain(|id, flag| active.contains(&id) || flag.load(Ordering::Acquire));

        if !stale.is_empty() {
            debug!(removed = stale.len(), "stale triggers removed");
        }
        Ok(jobs.len())
    }

    /// Run [`reconcile`](Self::reconcile) every `every` until shutdown.
    pub fn watch(self: &Arc<Self>, storage: Arc<Storage>, every: Duration) {
        let scheduler = Arc::clone(self);
        let cancel = self.shutdown.child_token();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.reconcile(&storage).await {
                            warn!(error = %e, "job reconcile failed");
                        }
                    }
                }
            }
        });
    }

    /// Install or replace the trigger for `job_id`.
    ///
    /// Scheduling a job again with its current interval leaves the running
    /// timer untouched; a new interval restarts the timer, so the first
    /// tick comes one full interval after this call.
    pub async fn schedule_job(&self, job_id: &JobId, interval_secs: u32) {
        if self.shutdown.is_cancelled() {
            debug!(%job_id, "scheduler stopped, not scheduling");
            return;
        }

        let mut triggers = self.triggers.lock().await;
        if let Some(existing) = triggers.get(job_id) {
            if existing.interval_secs == interval_secs && !existing.cancel.is_cancelled() {
                return;
            }
            existing.cancel.cancel();
        }

        let cancel = self.shutdown.child_token();
        let flag = self.flag_for(job_id).await;
        let period = Duration::from_secs(u64::from(interval_secs.max(1)));

        tokio::spawn(tick_loop(
            job_id.clone(),
            Instant::now() + period,
            period,
            cancel.clone(),
            flag,
            Arc::clone(&self.runner),
            self.runs.clone(),
        ));

        triggers.insert(
            job_id.clone(),
            Trigger {
                interval_secs,
                cancel,
            },
        );
        debug!(%job_id, interval_secs, "trigger installed");
    }

    /// Cancel the trigger for `job_id`. Returns `false` if none existed.
    ///
    /// The job's in-flight flag is dropped too unless a run is still going.
    pub async fn remove_job(&self, job_id: &JobId) -> bool {
        let removed = self.triggers.lock().await.remove(job_id);

        let mut in_flight = self.in_flight.lock().await;
        if in_flight
            .get(job_id)
            .is_some_and(|flag| !flag.load(Ordering::Acquire))
        {
            in_flight.remove(job_id);
        }
        drop(in_flight);

        match removed {
            Some(trigger) => {
                trigger.cancel.cancel();
                debug!(%job_id, "trigger removed");
                true
            }
            None => false,
        }
    }

    /// Dispatch a run now, outside the job's timer. Returns `false` if a run
    /// for this job is already in flight and this request was coalesced.
    pub async fn run_now(&self, job_id: &JobId) -> bool {
        let flag = self.flag_for(job_id).await;
        dispatch(job_id, &flag, &self.runner, &self.runs)
    }

    /// Whether a trigger is installed for `job_id`.
    pub async fn is_scheduled(&self, job_id: &JobId) -> bool {
        self.triggers.lock().await.contains_key(job_id)
    }

    /// Number of installed triggers.
    pub async fn trigger_count(&self) -> usize {
        self.triggers.lock().await.len()
    }

    /// Stop every trigger, then wait for in-flight runs to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.triggers.lock().await.clear();
        self.runs.close();
        self.runs.wait().await;
        info!("scheduler stopped");
    }

    async fn flag_for(&self, job_id: &JobId) -> Arc<AtomicBool> {
        Arc::clone(
            self.in_flight
                .lock()
                .await
                .entry(job_id.clone())
                .or_insert_with(|| Arc::new(AtomicBool::new(false))),
        )
    }
}

async fn tick_loop(
    job_id: JobId,
    first_tick: Instant,
    period: Duration,
    cancel: CancellationToken,
    flag: Arc<AtomicBool>,
    runner: Arc<dyn JobRunner>,
    runs: TaskTracker,
) {
    let mut ticker = tokio::time::interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                dispatch(&job_id, &flag, &runner, &runs);
            }
        }
    }
}

/// Start a run unless one is already in flight for this job.
fn dispatch(
    job_id: &JobId,
    flag: &Arc<AtomicBool>,
    runner: &Arc<dyn JobRunner>,
    runs: &TaskTracker,
) -> bool {
    if flag
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        debug!(%job_id, "run already in flight, tick dropped");
        return false;
    }

    let guard = InFlightGuard(Arc::clone(flag));
    let runner = Arc::clone(runner);
    let job_id = job_id.clone();
    runs.spawn(async move {
        let _guard = guard;
        runner.run_job(&job_id).await;
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use chrono::Utc;
    use riskwatch_shared::{Job, JobMode};
    use tokio::time::sleep;
    use uuid::Uuid;

    /// Counts runs and the highest number seen in flight at once.
    #[derive(Default)]
    struct CountingRunner {
        started: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        run_for: Duration,
    }

    impl CountingRunner {
        fn taking(run_for: Duration) -> Arc<Self> {
            Arc::new(Self {
                run_for,
                ..Self::default()
            })
        }

        fn started(&self) -> usize {
            self.started.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobRunner for CountingRunner {
        async fn run_job(&self, _job_id: &JobId) {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            sleep(self.run_for).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_after_one_interval() {
        let runner = CountingRunner::taking(Duration::ZERO);
        let scheduler = Scheduler::new(runner.clone());
        scheduler.schedule_job(&JobId::new(), 60).await;

        sleep(secs(59)).await;
        assert_eq!(runner.started(), 0);

        sleep(secs(2)).await;
        assert_eq!(runner.started(), 1);

        sleep(secs(60)).await;
        assert_eq!(runner.started(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_ticks_are_dropped() {
        let runner = CountingRunner::taking(secs(150));
        let scheduler = Scheduler::new(runner.clone());
        scheduler.schedule_job(&JobId::new(), 60).await;

        // Ticks at 60 (runs until 210), 120 and 180 (dropped), 240 (runs).
        sleep(secs(250)).await;
        assert_eq!(runner.started(), 2);
        assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_fire_independently() {
        let runner = CountingRunner::taking(secs(500));
        let scheduler = Scheduler::new(runner.clone());
        scheduler.schedule_job(&JobId::new(), 60).await;
        scheduler.schedule_job(&JobId::new(), 60).await;

        sleep(secs(61)).await;
        assert_eq!(runner.started(), 2);
        assert_eq!(runner.max_active.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_same_interval_is_idempotent() {
        let runner = CountingRunner::taking(Duration::ZERO);
        let scheduler = Scheduler::new(runner.clone());
        let job = JobId::new();

        scheduler.schedule_job(&job, 60).await;
        sleep(secs(30)).await;
        scheduler.schedule_job(&job, 60).await;

        // Still on the original timer: fires at 60, once.
        sleep(secs(31)).await;
        assert_eq!(runner.started(), 1);
        assert_eq!(scheduler.trigger_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn new_interval_replaces_trigger() {
        let runner = CountingRunner::taking(Duration::ZERO);
        let scheduler = Scheduler::new(runner.clone());
        let job = JobId::new();

        scheduler.schedule_job(&job, 60).await;
        sleep(secs(30)).await;
        scheduler.schedule_job(&job, 120).await;

        // The old 60s timer must not fire.
        sleep(secs(100)).await;
        assert_eq!(runner.started(), 0);

        sleep(secs(21)).await;
        assert_eq!(runner.started(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn removed_job_stops_firing() {
        let runner = CountingRunner::taking(Duration::ZERO);
        let scheduler = Scheduler::new(runner.clone());
        let job = JobId::new();

        scheduler.schedule_job(&job, 60).await;
        sleep(secs(61)).await;
        assert!(scheduler.remove_job(&job).await);
        assert!(!scheduler.is_scheduled(&job).await);

        sleep(secs(300)).await;
        assert_eq!(runner.started(), 1);
        assert!(!scheduler.remove_job(&job).await);
    }

    #[tokio::test(start_paused = true)]
    async fn run_now_shares_in_flight_guard() {
        let runner = CountingRunner::taking(secs(10));
        let scheduler = Scheduler::new(runner.clone());
        let job = JobId::new();
        scheduler.schedule_job(&job, 3600).await;

        assert!(scheduler.run_now(&job).await);
        assert!(!scheduler.run_now(&job).await);

        sleep(secs(11)).await;
        assert!(scheduler.run_now(&job).await);
        // Let the spawned run reach its first await.
        sleep(Duration::from_millis(1)).await;
        assert_eq!(runner.started(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_run_survives_reschedule() {
        let runner = CountingRunner::taking(secs(100));
        let scheduler = Scheduler::new(runner.clone());
        let job = JobId::new();

        scheduler.schedule_job(&job, 30).await;
        sleep(secs(31)).await;
        assert_eq!(runner.started(), 1);

        // The replacement trigger ticks at 51, 71, 91 and 111 while the first
        // run is still going.
        scheduler.schedule_job(&job, 20).await;
        sleep(secs(90)).await;
        assert_eq!(runner.started(), 1);
        assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_in_flight_runs() {
        let runner = CountingRunner::taking(secs(20));
        let scheduler = Scheduler::new(runner.clone());
        let job = JobId::new();
        scheduler.schedule_job(&job, 60).await;
        assert!(scheduler.run_now(&job).await);

        scheduler.shutdown().await;
        assert_eq!(runner.active.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.trigger_count().await, 0);

        scheduler.schedule_job(&job, 60).await;
        sleep(secs(120)).await;
        assert_eq!(runner.started(), 1);
    }

    // --- Storage-backed ----------------------------------------------------

    async fn test_storage() -> Arc<Storage> {
        let tmp = std::env::temp_dir().join(format!("rw_sched_test_{}.db", Uuid::now_v7()));
        Arc::new(Storage::open(&tmp).await.expect("open test db"))
    }

    async fn insert_job(storage: &Storage, status: JobStatus, interval_secs: u32) -> Job {
        let now = Utc::now();
        let job = Job {
            id: JobId::new(),
            url: "https://shop.example.com/".into(),
            interval_secs,
            mode: JobMode::Static,
            webhook_url: None,
            status,
            created_at: now,
            updated_at: now,
        };
        storage.insert_job(&job).await.unwrap();
        job
    }

    async fn interval_of(scheduler: &Scheduler, job_id: &JobId) -> Option<u32> {
        scheduler
            .triggers
            .lock()
            .await
            .get(job_id)
            .map(|t| t.interval_secs)
    }

    #[tokio::test]
    async fn start_schedules_only_active_jobs() {
        let storage = test_storage().await;
        let a = insert_job(&storage, JobStatus::Active, 3600).await;
        let b = insert_job(&storage, JobStatus::Active, 1800).await;
        let paused = insert_job(&storage, JobStatus::Paused, 3600).await;

        let scheduler = Scheduler::new(CountingRunner::taking(Duration::ZERO));
        assert_eq!(scheduler.start(&storage).await.unwrap(), 2);

        assert!(scheduler.is_scheduled(&a.id).await);
        assert!(scheduler.is_scheduled(&b.id).await);
        assert!(!scheduler.is_scheduled(&paused.id).await);
        assert_eq!(scheduler.trigger_count().await, 2);
        assert_eq!(interval_of(&scheduler, &b.id).await, Some(1800));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn start_with_no_jobs_installs_nothing() {
        let storage = test_storage().await;
        let scheduler = Scheduler::new(CountingRunner::taking(Duration::ZERO));
        assert_eq!(scheduler.start(&storage).await.unwrap(), 0);
        assert_eq!(scheduler.trigger_count().await, 0);
    }

    #[tokio::test]
    async fn reconcile_applies_database_changes() {
        let storage = test_storage().await;
        let kept = insert_job(&storage, JobStatus::Active, 3600).await;
        let mut to_pause = insert_job(&storage, JobStatus::Active, 3600).await;
        let to_delete = insert_job(&storage, JobStatus::Active, 3600).await;
        let mut to_retime = insert_job(&storage, JobStatus::Active, 3600).await;

        let scheduler = Scheduler::new(CountingRunner::taking(Duration::ZERO));
        assert_eq!(scheduler.start(&storage).await.unwrap(), 4);

        // Changes made by another process directly in the database.
        let added = insert_job(&storage, JobStatus::Active, 600).await;
        to_pause.status = JobStatus::Paused;
        assert!(storage.update_job(&to_pause).await.unwrap());
        assert!(storage.delete_job(&to_delete.id).await.unwrap());
        to_retime.interval_secs = 120;
        assert!(storage.update_job(&to_retime).await.unwrap());

        assert_eq!(scheduler.reconcile(&storage).await.unwrap(), 3);

        assert!(scheduler.is_scheduled(&kept.id).await);
        assert!(scheduler.is_scheduled(&added.id).await);
        assert!(!scheduler.is_scheduled(&to_pause.id).await);
        assert!(!scheduler.is_scheduled(&to_delete.id).await);
        assert_eq!(interval_of(&scheduler, &to_retime.id).await, Some(120));
        assert_eq!(scheduler.trigger_count().await, 3);

        let flags = scheduler.in_flight.lock().await;
        assert!(!flags.contains_key(&to_pause.id));
        assert!(!flags.contains_key(&to_delete.id));
        drop(flags);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn watch_picks_up_jobs_added_elsewhere() {
        let storage = test_storage().await;
        let scheduler = Arc::new(Scheduler::new(CountingRunner::taking(Duration::ZERO)));
        scheduler.start(&storage).await.unwrap();
        scheduler.watch(Arc::clone(&storage), Duration::from_millis(50));

        let job = insert_job(&storage, JobStatus::Active, 3600).await;

        let mut scheduled = false;
        for _ in 0..80 {
            if scheduler.is_scheduled(&job.id).await {
                scheduled = true;
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }
        assert!(scheduled, "watch never scheduled the new job");

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn remove_job_drops_idle_flag_only() {
        let runner = CountingRunner::taking(secs(10));
        let scheduler = Scheduler::new(runner.clone());
        let idle = JobId::new();
        let busy = JobId::new();
        scheduler.schedule_job(&idle, 60).await;
        scheduler.schedule_job(&busy, 60).await;
        assert!(scheduler.run_now(&busy).await);

        scheduler.remove_job(&idle).await;
        scheduler.remove_job(&busy).await;

        let flags = scheduler.in_flight.lock().await;
        assert!(!flags.contains_key(&idle));
        assert!(flags.contains_key(&busy), "running job keeps its guard");
        drop(flags);

        // The kept guard still coalesces a manual trigger mid-run.
        assert!(!scheduler.run_now(&busy).await);
    }
}
