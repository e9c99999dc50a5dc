// ABOUTME: Background scheduler - weekly sync, delayed regeneration and manual triggers
// ABOUTME: All jobs run one at a time on a single runner task fed by a channel

pub mod control;
pub mod election;
pub mod schedule;

pub use control::{ControlRequest, ControlResponse};
pub use election::{current_leader, elect, ElectionOutcome, LeaderGuard};
pub use schedule::WeeklySchedule;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::orchestrator::SyncRunReport;
use crate::regenerate::TriggerSource;

/// Work the scheduler drives.
#[async_trait]
pub trait SchedulerJobs: Send + Sync + 'static {
    async fn sync_all(&self) -> SyncRunReport;

    async fn regenerate(&self, trigger: TriggerSource) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerOutcome {
    Started,
    AlreadyRunning,
    SchedulerStopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub sync_in_progress: bool,
    pub regeneration_pending_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncOrigin {
    Schedule,
    Manual,
}

#[derive(Debug)]
enum Job {
    Sync(SyncOrigin),
    Regenerate(TriggerSource),
}

struct PendingRegeneration {
    due_at: DateTime<Utc>,
    timer: JoinHandle<()>,
}

/// Wall clock anchored to tokio's clock, so paused test time moves both.
#[derive(Debug, Clone, Copy)]
struct Clock {
    wall_base: DateTime<Utc>,
    instant_base: Instant,
}

impl Clock {
    fn starting_at(wall_base: DateTime<Utc>) -> Self {
        Self {
            wall_base,
            instant_base: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().duration_since(self.instant_base);
        self.wall_base + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }

    fn instant_at(&self, at: DateTime<Utc>) -> Instant {
        let offset = (at - self.wall_base).to_std().unwrap_or(Duration::ZERO);
        self.instant_base + offset
    }
}

#[derive(Default)]
struct SchedulerState {
    running: AtomicBool,
    sync_in_progress: AtomicBool,
    next_sync_at: Mutex<Option<DateTime<Utc>>>,
    pending_regeneration: Mutex<Option<PendingRegeneration>>,
}

impl SchedulerState {
    /// Claim the single sync slot; false when a sync is queued or running.
    fn claim_sync(&self) -> bool {
        self.sync_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release_sync(&self) {
        self.sync_in_progress.store(false, Ordering::Release);
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Scheduler {
    jobs: Arc<dyn SchedulerJobs>,
    schedule: WeeklySchedule,
    regeneration_delay: Duration,
    clock: Clock,
}

impl Scheduler {
    pub fn new(
        jobs: Arc<dyn SchedulerJobs>,
        schedule: WeeklySchedule,
        regeneration_delay: Duration,
    ) -> Self {
        Self {
            jobs,
            schedule,
            regeneration_delay,
            clock: Clock::starting_at(Utc::now()),
        }
    }

    /// Pretend the wall clock reads `now` when the scheduler starts.
    pub fn with_start_time(mut self, now: DateTime<Utc>) -> Self {
        self.clock = Clock::starting_at(now);
        self
    }

    /// Spawn the cron and runner tasks. The returned join handle completes
    /// once `shutdown` fires and the runner has stopped.
    pub fn start(self, shutdown: &broadcast::Sender<()>) -> (SchedulerHandle, JoinHandle<()>) {
        let state = Arc::new(SchedulerState::default());
        state.running.store(true, Ordering::Release);
        let (tx, rx) = mpsc::unbounded_channel();

        tracing::info!(
            "Scheduler started: sync {}, regeneration {:?} after each successful run",
            self.schedule,
            self.regeneration_delay
        );

        let cron = tokio::spawn(cron_loop(
            self.schedule,
            self.clock,
            state.clone(),
            tx.clone(),
            shutdown.subscribe(),
        ));

        let runner = Runner {
            jobs: self.jobs,
            state: state.clone(),
            tx: tx.clone(),
            clock: self.clock,
            regeneration_delay: self.regeneration_delay,
        };
        let mut shutdown_rx = shutdown.subscribe();
        let task = tokio::spawn(async move {
            runner.run(rx, &mut shutdown_rx).await;
            cron.abort();
            runner.cancel_pending_regeneration();
            runner.state.running.store(false, Ordering::Release);
            runner.state.release_sync();
            tracing::info!("Scheduler stopped");
        });

        (SchedulerHandle { state, tx }, task)
    }
}

/// Operator surface of a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    state: Arc<SchedulerState>,
    tx: mpsc::UnboundedSender<Job>,
}

impl SchedulerHandle {
    /// Queue a full sync unless one is already queued or running.
    pub fn trigger_sync_now(&self) -> TriggerOutcome {
        if !self.state.running.load(Ordering::Acquire) {
            return TriggerOutcome::SchedulerStopped;
        }
        if !self.state.claim_sync() {
            tracing::info!("Manual sync rejected: a sync is already in progress");
            return TriggerOutcome::AlreadyRunning;
        }
        if self.tx.send(Job::Sync(SyncOrigin::Manual)).is_err() {
            self.state.release_sync();
            return TriggerOutcome::SchedulerStopped;
        }
        tracing::info!("Manual sync queued");
        TriggerOutcome::Started
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.state.running.load(Ordering::Acquire),
            next_sync_at: *locked(&self.state.next_sync_at),
            sync_in_progress: self.state.sync_in_progress.load(Ordering::Acquire),
            regeneration_pending_at: locked(&self.state.pending_regeneration)
                .as_ref()
                .map(|pending| pending.due_at),
        }
    }
}

async fn cron_loop(
    schedule: WeeklySchedule,
    clock: Clock,
    state: Arc<SchedulerState>,
    tx: mpsc::UnboundedSender<Job>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let next = schedule.next_after(clock.now());
        *locked(&state.next_sync_at) = Some(next);
        tracing::info!("Next scheduled sync at {}", next);

        tokio::select! {
            biased;

            _ = shutdown.recv() => break,
            _ = tokio::time::sleep_until(clock.instant_at(next)) => {}
        }

        if !state.claim_sync() {
            tracing::info!("Scheduled sync skipped: a sync is already in progress");
            continue;
        }
        if tx.send(Job::Sync(SyncOrigin::Schedule)).is_err() {
            state.release_sync();
            break;
        }
    }
    *locked(&state.next_sync_at) = None;
}

struct Runner {
    jobs: Arc<dyn SchedulerJobs>,
    state: Arc<SchedulerState>,
    tx: mpsc::UnboundedSender<Job>,
    clock: Clock,
    regeneration_delay: Duration,
}

impl Runner {
    async fn run(&self, mut rx: mpsc::UnboundedReceiver<Job>, shutdown: &mut broadcast::Receiver<()>) {
        loop {
            let job = tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping scheduler");
                    return;
                }
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => return,
                },
            };

            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received during {:?}, aborting", job);
                    return;
                }
                _ = self.execute(&job) => {}
            }
        }
    }

    async fn execute(&self, job: &Job) {
        match job {
            Job::Sync(origin) => {
                tracing::info!("Starting {:?} sync of all tables", origin);
                let report = self.jobs.sync_all().await;
                self.state.release_sync();
                tracing::info!(
                    "Sync finished: {} succeeded, {} failed in {:.1}s",
                    report.succeeded(),
                    report.failed(),
                    report.duration.as_secs_f64()
                );
                if report.wants_regeneration() {
                    self.schedule_regeneration();
                } else {
                    tracing::warn!("No table synced successfully; regeneration not scheduled");
                }
            }
            Job::Regenerate(trigger) => {
                {
                    let mut pending = locked(&self.state.pending_regeneration);
                    if pending.as_ref().map_or(false, |p| p.due_at <= self.clock.now()) {
                        *pending = None;
                    }
                }
                tracing::info!("Starting regeneration ({})", trigger);
                match self.jobs.regenerate(*trigger).await {
                    Ok(()) => tracing::info!("Regeneration completed"),
                    Err(e) => tracing::error!("Regeneration failed: {:?}", e),
                }
            }
        }
    }

    /// Replace any pending regeneration with one due after the configured delay.
    fn schedule_regeneration(&self) {
        let due_at = self.clock.now()
            + chrono::Duration::from_std(self.regeneration_delay)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let tx = self.tx.clone();
        let delay = self.regeneration_delay;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Job::Regenerate(TriggerSource::Scheduler));
        });

        let mut pending = locked(&self.state.pending_regeneration);
        if let Some(previous) = pending.replace(PendingRegeneration { due_at, timer }) {
            previous.timer.abort();
            tracing::info!("Replaced regeneration pending at {}", previous.due_at);
        }
        tracing::info!("Regeneration scheduled for {}", due_at);
    }

    fn cancel_pending_regeneration(&self) {
        if let Some(pending) = locked(&self.state.pending_regeneration).take() {
            pending.timer.abort();
        }
    }
}
