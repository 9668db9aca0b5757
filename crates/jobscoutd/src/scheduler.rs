//! Scheduler: ticks, selects due subscriptions, dispatches pipeline
//! drivers, and runs the stuck-run sweep and lock janitor.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use jobscout_core::{Stage, Subscription, TriggerType};
use jobscout_pipeline::PipelineDriver;
use jobscout_queue::{QueueName, SubscriptionLock, WorkQueues};
use jobscout_store::{RunTracker, Store};

use crate::metrics::DaemonMetrics;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick: Duration,
    pub tick_batch: i64,
    pub max_parallel_runs: usize,
    pub scan_interval_hours: i64,
    pub lock_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            tick_batch: 50,
            max_parallel_runs: 10,
            scan_interval_hours: 24,
            lock_ttl: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug)]
pub enum TriggerError {
    NotFound,
    AlreadyRunning,
    ShuttingDown,
    Internal(anyhow::Error),
}

#[derive(Debug, Default, Serialize)]
pub struct StuckSweepSummary {
    pub failed_run_ids: Vec<Uuid>,
}

pub struct Scheduler {
    store: Store,
    tracker: RunTracker,
    lock: Arc<SubscriptionLock>,
    queues: Arc<WorkQueues>,
    driver: Arc<PipelineDriver>,
    metrics: DaemonMetrics,
    config: SchedulerConfig,
    semaphore: Arc<Semaphore>,
    draining: AtomicBool,
    /// Sweep cutoff in minutes; admin-tunable at runtime.
    pub stuck_threshold_min: AtomicI64,
}

impl Scheduler {
    pub fn new(
        store: Store,
        tracker: RunTracker,
        lock: Arc<SubscriptionLock>,
        queues: Arc<WorkQueues>,
        driver: Arc<PipelineDriver>,
        metrics: DaemonMetrics,
        config: SchedulerConfig,
        stuck_threshold_min: i64,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_parallel_runs));
        Self {
            store,
            tracker,
            lock,
            queues,
            driver,
            metrics,
            config,
            semaphore,
            draining: AtomicBool::new(false),
            stuck_threshold_min: AtomicI64::new(stuck_threshold_min),
        }
    }

    /// Main tick loop. Returns when shutdown flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.tick);
        info!(
            tick_secs = self.config.tick.as_secs(),
            max_parallel_runs = self.config.max_parallel_runs,
            "scheduler started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler stopping");
                        break;
                    }
                }
            }
        }
    }

    async fn tick(self: &Arc<Self>) {
        if self.draining.load(Ordering::Relaxed) {
            return;
        }
        let due = match self.store.due_subscriptions(self.config.tick_batch).await {
            Ok(due) => due,
            Err(e) => {
                error!("due-subscription query failed: {e}");
                return;
            }
        };
        if !due.is_empty() {
            debug!(count = due.len(), "due subscriptions");
        }
        for sub in due {
            match self.launch(sub, TriggerType::Scheduled).await {
                Ok(_) | Err(TriggerError::AlreadyRunning) => {}
                Err(TriggerError::ShuttingDown) => return,
                Err(TriggerError::NotFound) => {}
                Err(TriggerError::Internal(e)) => warn!("failed to launch run: {e}"),
            }
        }
        self.refresh_queue_gauges().await;
    }

    async fn refresh_queue_gauges(&self) {
        if let Ok(stats) = self.queues.queue_stats(QueueName::Collection).await {
            self.metrics.collection_queue_depth.set(stats.waiting as i64);
        }
        if let Ok(stats) = self.queues.queue_stats(QueueName::Matching).await {
            self.metrics.matching_queue_depth.set(stats.waiting as i64);
        }
    }

    /// Manual trigger from the admin surface. Same path as scheduled runs:
    /// lock first, then run row, then a bounded driver task.
    pub async fn trigger_manual(self: &Arc<Self>, subscription_id: &str) -> Result<Uuid, TriggerError> {
        let sub = self
            .store
            .get_subscription(subscription_id)
            .await
            .map_err(TriggerError::Internal)?
            .ok_or(TriggerError::NotFound)?;
        self.launch(sub, TriggerType::Manual).await
    }

    async fn launch(
        self: &Arc<Self>,
        sub: Subscription,
        trigger: TriggerType,
    ) -> Result<Uuid, TriggerError> {
        if self.draining.load(Ordering::Relaxed) {
            return Err(TriggerError::ShuttingDown);
        }
        let run_id = Uuid::new_v4();
        let acquired = self
            .lock
            .try_acquire(&sub.id, run_id, self.config.lock_ttl)
            .await
            .map_err(|e| TriggerError::Internal(e.into()))?;
        if !acquired {
            debug!(subscription_id = %sub.id, "lock held, skipping");
            return Err(TriggerError::AlreadyRunning);
        }
        if let Err(e) = self.tracker.start_run(run_id, &sub.id, trigger).await {
            let _ = self.lock.release(&sub.id, run_id).await;
            return Err(TriggerError::Internal(e));
        }

        let scheduler = self.clone();
        tokio::spawn(async move {
            let _permit = match scheduler.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            scheduler.metrics.active_runs.inc();
            let result = scheduler.driver.run(&sub, trigger, run_id).await;
            scheduler.metrics.active_runs.dec();
            match &result {
                Ok(report) => {
                    info!(
                        %run_id,
                        subscription_id = %sub.id,
                        matches = report.matches_found,
                        notifications = report.notifications_sent,
                        "run finished"
                    );
                    let cancelled = report
                        .stats
                        .get("cancelled")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    if cancelled {
                        scheduler.metrics.runs_cancelled.inc();
                    } else {
                        scheduler.metrics.runs_completed.inc();
                        scheduler
                            .metrics
                            .notifications_sent
                            .inc_by(report.notifications_sent as u64);
                    }
                }
                Err(e) => {
                    // One bad subscription must not stop the others.
                    error!(%run_id, subscription_id = %sub.id, "run failed: {e}");
                    scheduler.metrics.runs_failed.inc();
                }
            }
            scheduler.finalize(&sub, run_id).await;
        });
        Ok(run_id)
    }

    async fn finalize(&self, sub: &Subscription, run_id: Uuid) {
        let next_run_at = Utc::now() + chrono::Duration::hours(self.config.scan_interval_hours);
        if let Err(e) = self
            .store
            .finalize_subscription_schedule(&sub.id, next_run_at)
            .await
        {
            warn!(subscription_id = %sub.id, "failed to schedule next run: {e}");
        }
        if let Err(e) = self.lock.release(&sub.id, run_id).await {
            warn!(subscription_id = %sub.id, "lock release failed: {e}");
        }
    }

    /// Fail runs stuck in `running` since before the cutoff, release their
    /// locks, and reschedule their subscriptions for a near retry.
    pub async fn sweep_stuck(&self, min_age_minutes: i64) -> Result<StuckSweepSummary> {
        let cutoff = Utc::now() - chrono::Duration::minutes(min_age_minutes);
        let stuck = self.store.runs_running_since_before(cutoff).await?;
        let mut summary = StuckSweepSummary::default();
        for run in stuck {
            warn!(
                run_id = %run.id,
                subscription_id = %run.subscription_id,
                started_at = %run.started_at,
                "failing stuck run"
            );
            let stage = run.current_stage.as_deref().and_then(Stage::parse);
            if let Err(e) = self
                .tracker
                .fail(
                    run.id,
                    &run.subscription_id,
                    stage,
                    "stuck-sweep",
                    serde_json::json!({
                        "started_at": run.started_at,
                        "progress_percent": run.progress_percent,
                        "had_checkpoint": run.checkpoint.is_some(),
                    }),
                )
                .await
            {
                warn!(run_id = %run.id, "stuck-sweep fail write failed: {e}");
                continue;
            }
            if let Err(e) = self.lock.release(&run.subscription_id, run.id).await {
                warn!(run_id = %run.id, "stuck-sweep lock release failed: {e}");
            }
            if let Err(e) = self.store.reschedule_soon(&run.subscription_id).await {
                warn!(run_id = %run.id, "stuck-sweep reschedule failed: {e}");
            }
            self.metrics.stuck_runs_failed.inc();
            summary.failed_run_ids.push(run.id);
        }
        Ok(summary)
    }

    /// Background stuck-run sweep on a five-minute cadence.
    pub fn spawn_stuck_sweeper(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let threshold = scheduler.stuck_threshold_min.load(Ordering::Relaxed);
                        match scheduler.sweep_stuck(threshold).await {
                            Ok(summary) if !summary.failed_run_ids.is_empty() => {
                                info!(count = summary.failed_run_ids.len(), "stuck-run sweep");
                            }
                            Ok(_) => {}
                            Err(e) => warn!("stuck-run sweep failed: {e}"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Background janitor: refresh the lock of every run observed
    /// `running`, every 30 seconds.
    pub fn spawn_lock_janitor(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let active = match scheduler.store.active_runs().await {
                            Ok(active) => active,
                            Err(e) => {
                                warn!("lock janitor query failed: {e}");
                                continue;
                            }
                        };
                        for run in active {
                            match scheduler
                                .lock
                                .refresh(&run.subscription_id, run.id, scheduler.config.lock_ttl)
                                .await
                            {
                                Ok(true) => {}
                                Ok(false) => debug!(
                                    run_id = %run.id,
                                    "janitor found running run without its lock"
                                ),
                                Err(e) => warn!(run_id = %run.id, "janitor refresh failed: {e}"),
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Stop accepting new runs and wait for in-flight runs to finish, up to
    /// the given grace period.
    pub async fn drain(&self, grace: Duration) {
        self.draining.store(true, Ordering::Relaxed);
        let all = self.config.max_parallel_runs as u32;
        match tokio::time::timeout(grace, self.semaphore.acquire_many(all)).await {
            Ok(Ok(_permits)) => info!("all in-flight runs drained"),
            Ok(Err(_)) => warn!("run semaphore closed during drain"),
            Err(_) => warn!(
                grace_secs = grace.as_secs(),
                "drain grace period elapsed with runs still in flight"
            ),
        }
    }
}
