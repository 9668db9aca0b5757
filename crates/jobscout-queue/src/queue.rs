//! Two priority queues (collection, matching) on the KV store.
//!
//! A queued job is a JSON payload at `jobs:{queue}:payload:{id}` plus its id
//! in one of three sets: the `waiting` sorted set (score = priority then
//! FIFO sequence), the `delayed` sorted set (score = ready-at millis, used
//! for retry back-off), or the `active` hash while a worker holds it.
//! Completions are published on a per-queue pub/sub channel and mirrored to
//! a short-TTL result key so a waiter that subscribed late still finds the
//! outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use jobscout_agents::CollectionRequest;
use jobscout_core::{Error, Job, MatchVerdict, RawPosting, Result};

use crate::dedup::{Claim, RequestDedupCache};
use crate::kv::Kv;
use crate::worker::WorkerEnv;

/// Priority of scheduler-initiated work; lower value wins.
pub const PRIORITY_SCHEDULED: i64 = 10;
/// Priority of admin/API-initiated work.
pub const PRIORITY_API_REQUEST: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    Collection,
    Matching,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Collection => "collection",
            QueueName::Matching => "matching",
        }
    }

    pub(crate) fn waiting_key(&self) -> String {
        format!("jobs:{}:waiting", self.as_str())
    }

    pub(crate) fn delayed_key(&self) -> String {
        format!("jobs:{}:delayed", self.as_str())
    }

    pub(crate) fn active_key(&self) -> String {
        format!("jobs:{}:active", self.as_str())
    }

    pub(crate) fn payload_key(&self, id: Uuid) -> String {
        format!("jobs:{}:payload:{id}", self.as_str())
    }

    pub(crate) fn result_key(&self, id: Uuid) -> String {
        format!("jobs:{}:result:{id}", self.as_str())
    }

    pub(crate) fn done_channel(&self) -> String {
        format!("jobs:{}:done", self.as_str())
    }

    pub(crate) fn completed_counter_key(&self) -> String {
        format!("jobs:{}:completed", self.as_str())
    }

    pub(crate) fn failed_counter_key(&self) -> String {
        format!("jobs:{}:failed", self.as_str())
    }
}

/// Correlation context carried by every payload so `cancel_run` can find
/// the jobs belonging to a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
}

impl RunContext {
    pub fn for_run(run_id: Uuid, subscription_id: impl Into<String>) -> Self {
        Self {
            run_id: Some(run_id),
            subscription_id: Some(subscription_id.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingRequest {
    pub job: Job,
    pub resume_text: String,
    pub resume_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobPayload {
    Collection(CollectionRequest),
    Matching(MatchingRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: Uuid,
    pub priority: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub timeout_ms: u64,
    #[serde(default)]
    pub ctx: RunContext,
    pub payload: JobPayload,
    pub enqueued_at: DateTime<Utc>,
}

/// Wire outcome of a queued job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum JobOutcome {
    Collected {
        postings: Vec<RawPosting>,
    },
    Matched {
        verdict: MatchVerdict,
        cached: bool,
        job_match_id: Option<Uuid>,
    },
    Cancelled,
    Failed {
        code: String,
        message: String,
    },
}

#[derive(Serialize, Deserialize)]
struct DoneMessage {
    job_id: Uuid,
    outcome: JobOutcome,
}

/// Result of awaiting a matching job.
#[derive(Debug, Clone)]
pub struct MatchedResult {
    pub verdict: MatchVerdict,
    pub cached: bool,
    pub job_match_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CancelCounts {
    pub collection_removed: usize,
    pub matching_removed: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub collection_attempts: u32,
    pub matching_attempts: u32,
    pub collection_timeout: Duration,
    pub matching_timeout: Duration,
    pub backoff_base: Duration,
    pub result_ttl_secs: u64,
    pub cancel_flag_ttl_secs: u64,
    pub fallback_enabled: bool,
    pub fallback_collection_permits: usize,
    pub fallback_matching_permits: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            collection_attempts: 2,
            matching_attempts: 3,
            collection_timeout: Duration::from_secs(180),
            matching_timeout: Duration::from_secs(60),
            backoff_base: Duration::from_secs(2),
            result_ttl_secs: 120,
            cancel_flag_ttl_secs: 600,
            fallback_enabled: true,
            fallback_collection_permits: 2,
            fallback_matching_permits: 5,
        }
    }
}

impl QueueConfig {
    pub(crate) fn attempts_for(&self, queue: QueueName) -> u32 {
        match queue {
            QueueName::Collection => self.collection_attempts,
            QueueName::Matching => self.matching_attempts,
        }
    }

    pub(crate) fn timeout_for(&self, queue: QueueName) -> Duration {
        match queue {
            QueueName::Collection => self.collection_timeout,
            QueueName::Matching => self.matching_timeout,
        }
    }

    /// Exponential back-off before re-queueing a failed attempt.
    pub(crate) fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1)).min(64);
        self.backoff_base * factor
    }
}

struct FallbackExec {
    env: Arc<WorkerEnv>,
    collection: Semaphore,
    matching: Semaphore,
}

/// The dispatch layer: enqueue, await, cancel. Workers (crate::worker)
/// drain the queues from the other side.
pub struct WorkQueues {
    kv: Kv,
    config: QueueConfig,
    dedup: Arc<RequestDedupCache>,
    seq: AtomicU64,
    waiters: Arc<Mutex<HashMap<Uuid, oneshot::Sender<JobOutcome>>>>,
    fallback: Option<FallbackExec>,
}

impl WorkQueues {
    /// `fallback_env` enables in-process execution when the KV store is
    /// unreachable; without it enqueues fail with `QueueUnavailable`.
    pub fn new(
        kv: Kv,
        config: QueueConfig,
        dedup: Arc<RequestDedupCache>,
        fallback_env: Option<Arc<WorkerEnv>>,
    ) -> Self {
        let fallback = match (config.fallback_enabled, fallback_env) {
            (true, Some(env)) => Some(FallbackExec {
                collection: Semaphore::new(config.fallback_collection_permits),
                matching: Semaphore::new(config.fallback_matching_permits),
                env,
            }),
            _ => None,
        };
        Self {
            kv,
            config,
            dedup,
            seq: AtomicU64::new(0),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            fallback,
        }
    }

    pub fn kv(&self) -> &Kv {
        &self.kv
    }

    pub fn dedup(&self) -> &Arc<RequestDedupCache> {
        &self.dedup
    }

    pub async fn run_cancelled(&self, run_id: Option<Uuid>) -> bool {
        self.kv.run_cancelled(run_id).await
    }

    /// Enqueue a collection request and await its postings. Identical
    /// concurrent requests within the dedup TTL share one execution.
    pub async fn enqueue_collection(
        &self,
        req: CollectionRequest,
        priority: i64,
        ctx: RunContext,
    ) -> Result<Vec<RawPosting>> {
        if req.skip_cache {
            return self.collect_via_queue(req, priority, ctx).await;
        }
        let cache_key = req.cache_key();
        match self.dedup.claim(&cache_key).await {
            Claim::Follower(rx) => RequestDedupCache::await_result(rx).await,
            Claim::Leader(tx) => {
                let outcome = self.collect_via_queue(req, priority, ctx).await;
                self.dedup.publish(&cache_key, tx, &outcome).await;
                outcome
            }
        }
    }

    async fn collect_via_queue(
        &self,
        req: CollectionRequest,
        priority: i64,
        ctx: RunContext,
    ) -> Result<Vec<RawPosting>> {
        match self
            .submit(QueueName::Collection, JobPayload::Collection(req), priority, ctx)
            .await?
        {
            JobOutcome::Collected { postings } => Ok(postings),
            JobOutcome::Cancelled => Err(Error::Cancelled),
            JobOutcome::Failed { code, message } => Err(Error::from_parts(&code, &message)),
            JobOutcome::Matched { .. } => {
                Err(Error::Fatal("matching outcome on collection queue".to_string()))
            }
        }
    }

    /// Enqueue a scoring job and await its verdict.
    pub async fn enqueue_matching(
        &self,
        job: Job,
        resume_text: String,
        resume_hash: String,
        priority: i64,
        ctx: RunContext,
    ) -> Result<MatchedResult> {
        let payload = JobPayload::Matching(MatchingRequest {
            job,
            resume_text,
            resume_hash,
        });
        match self
            .submit(QueueName::Matching, payload, priority, ctx)
            .await?
        {
            JobOutcome::Matched {
                verdict,
                cached,
                job_match_id,
            } => Ok(MatchedResult {
                verdict,
                cached,
                job_match_id,
            }),
            JobOutcome::Cancelled => Err(Error::Cancelled),
            JobOutcome::Failed { code, message } => Err(Error::from_parts(&code, &message)),
            JobOutcome::Collected { .. } => {
                Err(Error::Fatal("collection outcome on matching queue".to_string()))
            }
        }
    }

    async fn submit(
        &self,
        queue: QueueName,
        payload: JobPayload,
        priority: i64,
        ctx: RunContext,
    ) -> Result<JobOutcome> {
        let job = QueuedJob {
            id: Uuid::new_v4(),
            priority,
            attempts: 0,
            max_attempts: self.config.attempts_for(queue),
            timeout_ms: self.config.timeout_for(queue).as_millis() as u64,
            ctx,
            payload,
            enqueued_at: Utc::now(),
        };

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(job.id, tx);

        match self.push(queue, &job).await {
            Ok(()) => self.await_outcome(queue, &job, rx).await,
            Err(e) => {
                self.waiters.lock().await.remove(&job.id);
                match &self.fallback {
                    Some(fallback) => {
                        warn!(
                            queue = queue.as_str(),
                            "KV store unreachable ({e}); using in-process fallback"
                        );
                        self.fallback_execute(fallback, queue, job).await
                    }
                    None => Err(Error::QueueUnavailable(format!(
                        "KV store unreachable and fallback disabled: {e}"
                    ))),
                }
            }
        }
    }

    async fn push(&self, queue: QueueName, job: &QueuedJob) -> redis::RedisResult<()> {
        let payload = serde_json::to_string(job).unwrap_or_default();
        let score = score_for(job.priority, self.seq.fetch_add(1, Ordering::Relaxed));
        let mut conn = self.kv.connection();
        redis::pipe()
            .set(queue.payload_key(job.id), payload)
            .ignore()
            .zadd(queue.waiting_key(), job.id.to_string(), score)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
    }

    async fn fallback_execute(
        &self,
        fallback: &FallbackExec,
        queue: QueueName,
        job: QueuedJob,
    ) -> Result<JobOutcome> {
        let semaphore = match queue {
            QueueName::Collection => &fallback.collection,
            QueueName::Matching => &fallback.matching,
        };
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|_| Error::Fatal("fallback semaphore closed".to_string()))?;
        match tokio::time::timeout(
            Duration::from_millis(job.timeout_ms),
            fallback.env.execute(&job),
        )
        .await
        {
            Err(_) => Err(Error::Transient(format!(
                "in-process {} job timed out after {}ms",
                queue.as_str(),
                job.timeout_ms
            ))),
            Ok(Err(e)) => Err(e),
            Ok(Ok(outcome)) => Ok(outcome),
        }
    }

    async fn await_outcome(
        &self,
        queue: QueueName,
        job: &QueuedJob,
        mut rx: oneshot::Receiver<JobOutcome>,
    ) -> Result<JobOutcome> {
        // Budget covers every attempt plus back-off and queueing slack.
        let budget = Duration::from_millis(
            job.timeout_ms * job.max_attempts as u64 + 30_000,
        );
        let deadline = tokio::time::sleep(budget);
        tokio::pin!(deadline);

        let mut progress = tokio::time::interval(Duration::from_secs(10));
        let mut active_since: Option<tokio::time::Instant> = None;
        let mut warned_unresponsive = false;

        loop {
            tokio::select! {
                outcome = &mut rx => {
                    return outcome.map_err(|_| {
                        Error::Fatal("completion channel closed before outcome".to_string())
                    });
                }
                _ = progress.tick() => {
                    // The publish may have raced our waiter registration;
                    // the mirrored result key catches that.
                    if let Some(outcome) = self.fetch_result(queue, job.id).await {
                        self.waiters.lock().await.remove(&job.id);
                        return Ok(outcome);
                    }
                    let state = self.job_state(queue, job.id).await;
                    if state == "active" {
                        let since = *active_since.get_or_insert_with(tokio::time::Instant::now);
                        if since.elapsed() >= Duration::from_secs(120) && !warned_unresponsive {
                            warn!(
                                job_id = %job.id,
                                queue = queue.as_str(),
                                "job active and unchanged for 2 minutes; worker potentially unresponsive"
                            );
                            warned_unresponsive = true;
                        }
                    } else {
                        active_since = None;
                    }
                    let stats = self.queue_stats(queue).await.unwrap_or_default();
                    info!(
                        job_id = %job.id,
                        queue = queue.as_str(),
                        state,
                        waiting = stats.waiting,
                        active = stats.active,
                        "waiting for queued job"
                    );
                }
                _ = &mut deadline => {
                    self.waiters.lock().await.remove(&job.id);
                    let state = self.job_state(queue, job.id).await;
                    let stats = self.queue_stats(queue).await.unwrap_or_default();
                    return Err(Error::Transient(format!(
                        "timed out after {}s waiting for {} job {} (state={}, waiting={}, active={})",
                        budget.as_secs(),
                        queue.as_str(),
                        job.id,
                        state,
                        stats.waiting,
                        stats.active,
                    )));
                }
            }
        }
    }

    async fn fetch_result(&self, queue: QueueName, id: Uuid) -> Option<JobOutcome> {
        let mut conn = self.kv.connection();
        let value: Option<String> = conn.get(queue.result_key(id)).await.ok()?;
        value.and_then(|v| serde_json::from_str(&v).ok())
    }

    async fn job_state(&self, queue: QueueName, id: Uuid) -> &'static str {
        let mut conn = self.kv.connection();
        let id = id.to_string();
        if let Ok(Some(_)) = conn
            .zscore::<_, _, Option<f64>>(queue.waiting_key(), &id)
            .await
        {
            return "waiting";
        }
        if let Ok(Some(_)) = conn
            .zscore::<_, _, Option<f64>>(queue.delayed_key(), &id)
            .await
        {
            return "delayed";
        }
        if let Ok(true) = conn.hexists::<_, _, bool>(queue.active_key(), &id).await {
            return "active";
        }
        "unknown"
    }

    pub async fn queue_stats(&self, queue: QueueName) -> Result<QueueStats> {
        let mut conn = self.kv.connection();
        let waiting: u64 = conn
            .zcard(queue.waiting_key())
            .await
            .map_err(|e| Error::QueueUnavailable(e.to_string()))?;
        let active: u64 = conn
            .hlen(queue.active_key())
            .await
            .map_err(|e| Error::QueueUnavailable(e.to_string()))?;
        let completed: Option<u64> = conn
            .get(queue.completed_counter_key())
            .await
            .unwrap_or(None);
        let failed: Option<u64> = conn.get(queue.failed_counter_key()).await.unwrap_or(None);
        Ok(QueueStats {
            waiting,
            active,
            completed: completed.unwrap_or(0),
            failed: failed.unwrap_or(0),
        })
    }

    /// Cancel a run: raise the flag, then remove its queued jobs from both
    /// queues' waiting and delayed sets. Active jobs finish their cancel
    /// check worker-side.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<CancelCounts> {
        self.kv
            .set_run_cancelled(run_id, self.config.cancel_flag_ttl_secs)
            .await?;
        let collection_removed = self.remove_run_jobs(QueueName::Collection, run_id).await?;
        let matching_removed = self.remove_run_jobs(QueueName::Matching, run_id).await?;
        info!(
            %run_id,
            collection_removed, matching_removed, "cancelled queued work"
        );
        Ok(CancelCounts {
            collection_removed,
            matching_removed,
        })
    }

    async fn remove_run_jobs(&self, queue: QueueName, run_id: Uuid) -> Result<usize> {
        let mut conn = self.kv.connection();
        let mut ids: Vec<String> = conn
            .zrange(queue.waiting_key(), 0, -1)
            .await
            .map_err(|e| Error::QueueUnavailable(e.to_string()))?;
        let delayed: Vec<String> = conn
            .zrange(queue.delayed_key(), 0, -1)
            .await
            .map_err(|e| Error::QueueUnavailable(e.to_string()))?;
        ids.extend(delayed);

        let mut removed = 0;
        for id_str in ids {
            let Ok(id) = Uuid::parse_str(&id_str) else {
                continue;
            };
            let payload: Option<String> = conn
                .get(queue.payload_key(id))
                .await
                .map_err(|e| Error::QueueUnavailable(e.to_string()))?;
            let Some(job) = payload.and_then(|p| serde_json::from_str::<QueuedJob>(&p).ok())
            else {
                continue;
            };
            if job.ctx.run_id != Some(run_id) {
                continue;
            }
            redis::pipe()
                .zrem(queue.waiting_key(), &id_str)
                .ignore()
                .zrem(queue.delayed_key(), &id_str)
                .ignore()
                .del(queue.payload_key(id))
                .ignore()
                .query_async::<()>(&mut conn)
                .await
                .map_err(|e| Error::QueueUnavailable(e.to_string()))?;
            publish_outcome(&self.kv, queue, id, &JobOutcome::Cancelled, self.config.result_ttl_secs)
                .await;
            if let Some(tx) = self.waiters.lock().await.remove(&id) {
                let _ = tx.send(JobOutcome::Cancelled);
            }
            removed += 1;
        }
        Ok(removed)
    }

    /// Route published completions to local waiters. One listener per
    /// process; reconnects with a short pause after connection loss.
    pub fn spawn_completion_listener(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        use futures::StreamExt;

        let queues = self.clone();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let mut pubsub = match queues.kv.pubsub().await {
                    Ok(pubsub) => pubsub,
                    Err(e) => {
                        warn!("completion listener cannot connect: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                let channels = [
                    QueueName::Collection.done_channel(),
                    QueueName::Matching.done_channel(),
                ];
                if let Err(e) = pubsub.subscribe(&channels[..]).await {
                    warn!("completion listener subscribe failed: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                let mut stream = pubsub.on_message();
                loop {
                    tokio::select! {
                        msg = stream.next() => {
                            let Some(msg) = msg else { break };
                            let Ok(text) = msg.get_payload::<String>() else { continue };
                            let Ok(done) = serde_json::from_str::<DoneMessage>(&text) else {
                                continue;
                            };
                            if let Some(tx) = queues.waiters.lock().await.remove(&done.job_id) {
                                let _ = tx.send(done.outcome);
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        })
    }
}

pub(crate) fn score_for(priority: i64, seq: u64) -> f64 {
    priority as f64 * 1e12 + seq as f64
}

/// Publish a completion: mirror to the result key, bump the per-queue
/// counter, notify subscribers. Best-effort; a failed publish surfaces as
/// the waiter's timeout.
pub(crate) async fn publish_outcome(
    kv: &Kv,
    queue: QueueName,
    job_id: Uuid,
    outcome: &JobOutcome,
    result_ttl_secs: u64,
) {
    let Ok(outcome_json) = serde_json::to_string(outcome) else {
        return;
    };
    let done = DoneMessage {
        job_id,
        outcome: outcome.clone(),
    };
    let Ok(done_json) = serde_json::to_string(&done) else {
        return;
    };
    let counter_key = match outcome {
        JobOutcome::Failed { .. } => queue.failed_counter_key(),
        _ => queue.completed_counter_key(),
    };
    let mut conn = kv.connection();
    let result = redis::pipe()
        .set_ex(queue.result_key(job_id), outcome_json, result_ttl_secs)
        .ignore()
        .incr(counter_key, 1u64)
        .ignore()
        .publish(queue.done_channel(), done_json)
        .ignore()
        .query_async::<()>(&mut conn)
        .await;
    if let Err(e) = result {
        warn!(%job_id, queue = queue.as_str(), "failed to publish outcome: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_priority_value_sorts_first() {
        let api = score_for(PRIORITY_API_REQUEST, 10);
        let scheduled = score_for(PRIORITY_SCHEDULED, 0);
        assert!(api < scheduled);
    }

    #[test]
    fn fifo_within_priority() {
        let first = score_for(PRIORITY_SCHEDULED, 1);
        let second = score_for(PRIORITY_SCHEDULED, 2);
        assert!(first < second);
    }

    #[test]
    fn backoff_grows_exponentially() {
        let config = QueueConfig::default();
        assert_eq!(config.backoff_for(1), Duration::from_secs(2));
        assert_eq!(config.backoff_for(2), Duration::from_secs(4));
        assert_eq!(config.backoff_for(3), Duration::from_secs(8));
    }

    #[test]
    fn queued_job_payload_roundtrip() {
        let job = QueuedJob {
            id: Uuid::nil(),
            priority: PRIORITY_SCHEDULED,
            attempts: 0,
            max_attempts: 2,
            timeout_ms: 180_000,
            ctx: RunContext::for_run(Uuid::nil(), "sub-1"),
            payload: JobPayload::Matching(MatchingRequest {
                job: Job {
                    content_hash: "abc123".to_string(),
                    title: "Backend Engineer".to_string(),
                    company: "Acme".to_string(),
                    description: String::new(),
                    location: None,
                    is_remote: false,
                    salary_min: None,
                    salary_max: None,
                    salary_currency: None,
                    application_url: String::new(),
                    source: jobscout_core::JobSource::Serpapi,
                    source_id: None,
                    posted_date: None,
                },
                resume_text: "resume".to_string(),
                resume_hash: "deadbeefdeadbeef".to_string(),
            }),
            enqueued_at: Utc::now(),
        };
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains(r#""type":"matching""#));
        let parsed: QueuedJob = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.ctx.subscription_id.as_deref(), Some("sub-1"));
        match parsed.payload {
            JobPayload::Matching(req) => assert_eq!(req.job.title, "Backend Engineer"),
            _ => panic!("wrong payload variant"),
        }
    }

    #[test]
    fn outcome_wire_format() {
        let outcome = JobOutcome::Failed {
            code: "rate_limited".to_string(),
            message: "429".to_string(),
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains(r#""result":"failed""#));
        let parsed: JobOutcome = serde_json::from_str(&json).unwrap();
        match parsed {
            JobOutcome::Failed { code, .. } => assert_eq!(code, "rate_limited"),
            _ => panic!("wrong outcome variant"),
        }
    }

    #[test]
    fn queue_keys_are_namespaced() {
        let q = QueueName::Collection;
        assert_eq!(q.waiting_key(), "jobs:collection:waiting");
        assert_eq!(q.done_channel(), "jobs:collection:done");
        let id = Uuid::nil();
        assert!(q.payload_key(id).starts_with("jobs:collection:payload:"));
    }
}
