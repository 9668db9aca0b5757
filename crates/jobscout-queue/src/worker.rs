//! Worker pools draining the collection and matching queues.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use redis::AsyncCommands;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use jobscout_agents::{CollectionRequest, Matcher, ScraperClient};
use jobscout_core::{Error, Result};
use jobscout_store::Store;

use crate::kv::Kv;
use crate::queue::{
    publish_outcome, score_for, JobOutcome, JobPayload, MatchingRequest, QueueConfig, QueueName,
    QueuedJob,
};
use crate::rate_limit::RateLimiter;

/// Limiter source used for LLM scoring calls.
const LLM_SOURCE: &str = "llm";

/// TTL for persisted query-result cache entries.
const QUERY_RESULT_TTL_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub collection_concurrency: usize,
    pub matching_concurrency: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            collection_concurrency: 2,
            matching_concurrency: 5,
        }
    }
}

/// Everything a worker needs to execute one job. Also used directly by the
/// queue layer's in-process fallback.
pub struct WorkerEnv {
    kv: Kv,
    store: Store,
    scraper: Arc<ScraperClient>,
    matcher: Arc<Matcher>,
    limiter: Arc<RateLimiter>,
    collection_min_delay: Duration,
    next_collection_at: Mutex<Option<Instant>>,
}

impl WorkerEnv {
    pub fn new(
        kv: Kv,
        store: Store,
        scraper: Arc<ScraperClient>,
        matcher: Arc<Matcher>,
        limiter: Arc<RateLimiter>,
        collection_min_delay: Duration,
    ) -> Self {
        Self {
            kv,
            store,
            scraper,
            matcher,
            limiter,
            collection_min_delay,
            next_collection_at: Mutex::new(None),
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Execute one job. The cancel flag is re-checked here so both queued
    /// and fallback execution observe cancellation before outbound calls.
    pub async fn execute(&self, job: &QueuedJob) -> Result<JobOutcome> {
        if self.kv.run_cancelled(job.ctx.run_id).await {
            return Ok(JobOutcome::Cancelled);
        }
        match &job.payload {
            JobPayload::Collection(req) => {
                let postings = self.execute_collection(job, req).await?;
                Ok(JobOutcome::Collected { postings })
            }
            JobPayload::Matching(req) => self.execute_matching(req).await,
        }
    }

    async fn execute_collection(
        &self,
        job: &QueuedJob,
        req: &CollectionRequest,
    ) -> Result<Vec<jobscout_core::RawPosting>> {
        let source = req.source.as_str();
        let waited = self.limiter.wait_for_slot(source).await;
        self.enforce_min_delay().await;
        debug!(
            query = %req.query,
            source,
            waited_ms = waited.as_millis() as u64,
            "collecting"
        );

        // The slot wait may have been long; a cancel could have landed.
        if self.kv.run_cancelled(job.ctx.run_id).await {
            return Err(Error::Cancelled);
        }

        if let Ok(Some(previous)) = self.store.query_result_cache_get(&req.cache_key()).await {
            debug!(query = %req.query, previous, "query fetched recently");
        }

        match self.scraper.collect(req).await {
            Ok(postings) => {
                self.limiter.record_success(source).await;
                let cache_put = self
                    .store
                    .query_result_cache_put(
                        &req.cache_key(),
                        &req.query,
                        postings.len() as i32,
                        QUERY_RESULT_TTL_SECS,
                    )
                    .await;
                if let Err(e) = cache_put {
                    warn!(query = %req.query, "query-result cache write failed: {e}");
                }
                Ok(postings)
            }
            Err(Error::RateLimited(message)) => {
                self.limiter.record_429(source).await;
                Err(Error::RateLimited(message))
            }
            Err(e) => {
                self.limiter.record_error(source).await;
                Err(e)
            }
        }
    }

    /// Minimum spacing between collection jobs across the whole pool,
    /// independent of per-source pacing.
    async fn enforce_min_delay(&self) {
        if self.collection_min_delay.is_zero() {
            return;
        }
        let slot = {
            let mut next = self.next_collection_at.lock().await;
            let now = Instant::now();
            let slot = next.filter(|n| *n > now).unwrap_or(now);
            *next = Some(slot + self.collection_min_delay);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }

    async fn execute_matching(&self, req: &MatchingRequest) -> Result<JobOutcome> {
        let verdict = match self.matcher.score(&req.job, &req.resume_text).await {
            Ok(verdict) => {
                self.limiter.record_success(LLM_SOURCE).await;
                verdict
            }
            Err(Error::RateLimited(message)) => {
                self.limiter.record_429(LLM_SOURCE).await;
                return Err(Error::RateLimited(message));
            }
            Err(e) => {
                self.limiter.record_error(LLM_SOURCE).await;
                return Err(e);
            }
        };

        self.store
            .upsert_job(&req.job)
            .await
            .map_err(|e| Error::Fatal(format!("job upsert failed: {e}")))?;
        let job_match_id = self
            .store
            .upsert_match(&req.job.content_hash, &req.resume_hash, &verdict)
            .await
            .map_err(|e| Error::Fatal(format!("match upsert failed: {e}")))?;

        Ok(JobOutcome::Matched {
            verdict,
            cached: false,
            job_match_id: Some(job_match_id),
        })
    }
}

/// Spawn both worker pools. Each worker is an independent task; a panic in
/// one job is caught and charged as a failed attempt, the pool survives.
pub fn spawn_worker_pools(
    env: Arc<WorkerEnv>,
    queue_config: QueueConfig,
    pool: WorkerPoolConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for idx in 0..pool.collection_concurrency {
        handles.push(tokio::spawn(worker_loop(
            env.clone(),
            queue_config.clone(),
            QueueName::Collection,
            shutdown.clone(),
            idx,
        )));
    }
    for idx in 0..pool.matching_concurrency {
        handles.push(tokio::spawn(worker_loop(
            env.clone(),
            queue_config.clone(),
            QueueName::Matching,
            shutdown.clone(),
            idx,
        )));
    }
    info!(
        collection = pool.collection_concurrency,
        matching = pool.matching_concurrency,
        "worker pools started"
    );
    handles
}

async fn worker_loop(
    env: Arc<WorkerEnv>,
    config: QueueConfig,
    queue: QueueName,
    mut shutdown: watch::Receiver<bool>,
    worker_idx: usize,
) {
    debug!(queue = queue.as_str(), worker_idx, "worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        match pop_job(&env.kv, queue).await {
            Ok(Some(job)) => process_job(&env, &config, queue, job).await,
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(e) => {
                warn!(queue = queue.as_str(), "queue pop failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    debug!(queue = queue.as_str(), worker_idx, "worker stopped");
}

async fn pop_job(kv: &Kv, queue: QueueName) -> redis::RedisResult<Option<QueuedJob>> {
    let mut conn = kv.connection();
    let popped: Vec<(String, f64)> = conn.zpopmin(queue.waiting_key(), 1).await?;
    let Some((id_str, _score)) = popped.into_iter().next() else {
        return Ok(None);
    };
    let Ok(id) = Uuid::parse_str(&id_str) else {
        return Ok(None);
    };
    conn.hset::<_, _, _, ()>(queue.active_key(), &id_str, Utc::now().timestamp_millis())
        .await?;
    let payload: Option<String> = conn.get(queue.payload_key(id)).await?;
    match payload.and_then(|p| serde_json::from_str::<QueuedJob>(&p).ok()) {
        Some(job) => Ok(Some(job)),
        None => {
            // Payload gone: the job was cancelled between push and pop.
            conn.hdel::<_, _, ()>(queue.active_key(), &id_str).await?;
            Ok(None)
        }
    }
}

async fn process_job(env: &Arc<WorkerEnv>, config: &QueueConfig, queue: QueueName, job: QueuedJob) {
    let attempt_result = {
        let fut = std::panic::AssertUnwindSafe(env.execute(&job)).catch_unwind();
        match tokio::time::timeout(Duration::from_millis(job.timeout_ms), fut).await {
            Err(_) => Err(Error::Transient(format!(
                "attempt timed out after {}ms",
                job.timeout_ms
            ))),
            Ok(Err(_panic)) => Err(Error::Fatal("worker panicked while processing job".to_string())),
            Ok(Ok(result)) => result,
        }
    };

    match attempt_result {
        Ok(outcome) => {
            finish_job(env, config, queue, &job, &outcome).await;
        }
        Err(Error::Cancelled) => {
            finish_job(env, config, queue, &job, &JobOutcome::Cancelled).await;
        }
        Err(e) => {
            let next_attempt = job.attempts + 1;
            if e.is_retryable() && next_attempt < job.max_attempts {
                requeue_with_backoff(env, config, queue, job, next_attempt, &e).await;
            } else {
                error!(
                    job_id = %job.id,
                    queue = queue.as_str(),
                    attempts = next_attempt,
                    "job failed permanently: {e}"
                );
                let outcome = JobOutcome::Failed {
                    code: e.code().to_string(),
                    message: e.to_string(),
                };
                finish_job(env, config, queue, &job, &outcome).await;
            }
        }
    }
}

async fn finish_job(
    env: &Arc<WorkerEnv>,
    config: &QueueConfig,
    queue: QueueName,
    job: &QueuedJob,
    outcome: &JobOutcome,
) {
    let mut conn = env.kv.connection();
    let cleanup = redis::pipe()
        .hdel(queue.active_key(), job.id.to_string())
        .ignore()
        .del(queue.payload_key(job.id))
        .ignore()
        .query_async::<()>(&mut conn)
        .await;
    if let Err(e) = cleanup {
        warn!(job_id = %job.id, "job cleanup failed: {e}");
    }
    publish_outcome(&env.kv, queue, job.id, outcome, config.result_ttl_secs).await;
}

async fn requeue_with_backoff(
    env: &Arc<WorkerEnv>,
    config: &QueueConfig,
    queue: QueueName,
    mut job: QueuedJob,
    next_attempt: u32,
    cause: &Error,
) {
    job.attempts = next_attempt;
    let backoff = config.backoff_for(next_attempt);
    let ready_at = Utc::now().timestamp_millis() + backoff.as_millis() as i64;
    warn!(
        job_id = %job.id,
        queue = queue.as_str(),
        attempt = next_attempt,
        max_attempts = job.max_attempts,
        backoff_ms = backoff.as_millis() as u64,
        "attempt failed, backing off: {cause}"
    );
    let Ok(payload) = serde_json::to_string(&job) else {
        return;
    };
    let mut conn = env.kv.connection();
    let result = redis::pipe()
        .hdel(queue.active_key(), job.id.to_string())
        .ignore()
        .set(queue.payload_key(job.id), payload)
        .ignore()
        .zadd(queue.delayed_key(), job.id.to_string(), ready_at as f64)
        .ignore()
        .query_async::<()>(&mut conn)
        .await;
    if let Err(e) = result {
        warn!(job_id = %job.id, "requeue failed: {e}");
        publish_outcome(
            &env.kv,
            queue,
            job.id,
            &JobOutcome::Failed {
                code: cause.code().to_string(),
                message: cause.to_string(),
            },
            config.result_ttl_secs,
        )
        .await;
    }
}

/// Move due delayed jobs back to their waiting queue. One promoter task per
/// process is enough; promotion is idempotent across processes.
pub fn spawn_promoter(kv: Kv, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for queue in [QueueName::Collection, QueueName::Matching] {
                        if let Err(e) = promote_due(&kv, queue).await {
                            warn!(queue = queue.as_str(), "promotion sweep failed: {e}");
                            tokio::time::sleep(Duration::from_secs(1)).await;
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

async fn promote_due(kv: &Kv, queue: QueueName) -> redis::RedisResult<usize> {
    let mut conn = kv.connection();
    let now_ms = Utc::now().timestamp_millis();
    let due: Vec<String> = conn
        .zrangebyscore_limit(queue.delayed_key(), 0f64, now_ms as f64, 0, 100)
        .await?;
    let mut promoted = 0;
    for id_str in due {
        let Ok(id) = Uuid::parse_str(&id_str) else {
            let _: () = conn.zrem(queue.delayed_key(), &id_str).await?;
            continue;
        };
        let payload: Option<String> = conn.get(queue.payload_key(id)).await?;
        let Some(job) = payload.and_then(|p| serde_json::from_str::<QueuedJob>(&p).ok()) else {
            let _: () = conn.zrem(queue.delayed_key(), &id_str).await?;
            continue;
        };
        let score = score_for(job.priority, now_ms as u64);
        redis::pipe()
            .zrem(queue.delayed_key(), &id_str)
            .ignore()
            .zadd(queue.waiting_key(), &id_str, score)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        promoted += 1;
    }
    if promoted > 0 {
        debug!(queue = queue.as_str(), promoted, "promoted delayed jobs");
    }
    Ok(promoted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_sizes_match_queue_shape() {
        let pool = WorkerPoolConfig::default();
        assert_eq!(pool.collection_concurrency, 2);
        assert_eq!(pool.matching_concurrency, 5);
    }

    #[test]
    fn attempt_budget_controls_retry() {
        // attempts=0, budget 2: one retry then permanent failure.
        let config = QueueConfig::default();
        assert!(1 < config.collection_attempts);
        assert!(2 >= config.collection_attempts);
    }
}
