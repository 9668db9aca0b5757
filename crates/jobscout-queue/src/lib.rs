//! Work dispatch over the KV store: the two priority queues, the
//! per-subscription lock, the request-dedup cache, the per-source rate
//! limiter, and the worker pools that drain the queues.
//!
//! Everything that must survive a process restart (locks, cancel flags,
//! queue state) lives in the KV store; rate-limiter state and the dedup
//! cache are process-local.

pub mod dedup;
pub mod kv;
pub mod lock;
pub mod queue;
pub mod rate_limit;
pub mod worker;

pub use dedup::RequestDedupCache;
pub use kv::Kv;
pub use lock::SubscriptionLock;
pub use queue::{
    CancelCounts, JobOutcome, JobPayload, MatchedResult, MatchingRequest, QueueConfig, QueueName,
    QueueStats, QueuedJob, RunContext, WorkQueues, PRIORITY_API_REQUEST, PRIORITY_SCHEDULED,
};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use worker::{spawn_promoter, spawn_worker_pools, WorkerEnv, WorkerPoolConfig};
