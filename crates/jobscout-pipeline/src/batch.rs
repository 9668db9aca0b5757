//! Adaptive batch matching: cache lookup, then feedback-driven slices.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use jobscout_core::{Error, Job, MatchVerdict, Result};
use jobscout_queue::{RunContext, WorkQueues};
use jobscout_store::Store;

#[derive(Debug, Clone)]
pub struct AdaptiveBatchConfig {
    pub initial_batch_size: usize,
    pub max_batch_size: usize,
    /// Fixed delay applied after three consecutive error slices.
    pub cooldown_delay: Duration,
}

impl Default for AdaptiveBatchConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: 10,
            max_batch_size: 50,
            cooldown_delay: Duration::from_secs(5),
        }
    }
}

/// Aggregate outcome of one slice, the only feedback adaptation uses.
#[derive(Debug, Clone, Copy, Default)]
pub struct SliceObservation {
    pub total: usize,
    pub rate_limited: usize,
    pub provider_errors: usize,
    pub other_errors: usize,
}

impl SliceObservation {
    pub fn has_errors(&self) -> bool {
        self.rate_limited + self.provider_errors + self.other_errors > 0
    }
}

/// The consecutive-success adaptation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveState {
    pub batch_size: usize,
    pub delay_ms: u64,
    pub consecutive_error_slices: u32,
    pub consecutive_success_slices: u32,
    max_batch_size: usize,
    cooldown_delay_ms: u64,
}

impl AdaptiveState {
    pub fn new(config: &AdaptiveBatchConfig) -> Self {
        Self {
            batch_size: config.initial_batch_size.max(1),
            delay_ms: 0,
            consecutive_error_slices: 0,
            consecutive_success_slices: 0,
            max_batch_size: config.max_batch_size.max(1),
            cooldown_delay_ms: config.cooldown_delay.as_millis() as u64,
        }
    }

    pub fn observe(&mut self, obs: SliceObservation) {
        if obs.has_errors() {
            self.consecutive_error_slices += 1;
            self.consecutive_success_slices = 0;
        } else {
            self.consecutive_success_slices += 1;
            self.consecutive_error_slices = 0;
        }

        if obs.rate_limited > 0 {
            self.batch_size = (self.batch_size / 2).max(1);
            self.delay_ms = self.delay_ms.max(1_000) * 2;
        } else if obs.provider_errors > 0 {
            self.batch_size = ((self.batch_size as f64 * 0.7) as usize).max(1);
            self.delay_ms = (self.delay_ms.max(500) as f64 * 1.5) as u64;
        } else if obs.other_errors > 0 {
            self.batch_size = ((self.batch_size as f64 * 0.9) as usize).max(1);
        } else if self.consecutive_success_slices >= 2 {
            self.batch_size = ((self.batch_size as f64 * 1.5) as usize).min(self.max_batch_size);
            self.delay_ms /= 2;
        }

        if self.consecutive_error_slices >= 3 {
            self.batch_size = (self.batch_size / 2).max(1);
            self.delay_ms = self.cooldown_delay_ms;
        }
    }
}

/// A scored match, from the cache or a fresh LLM call.
#[derive(Debug, Clone)]
pub struct ScoredMatch {
    pub job_match_id: Uuid,
    pub verdict: MatchVerdict,
    pub cached: bool,
}

#[derive(Debug)]
pub struct BatchItemResult {
    pub job: Job,
    pub outcome: Result<ScoredMatch>,
}

impl BatchItemResult {
    pub fn scored(&self) -> Option<&ScoredMatch> {
        self.outcome.as_ref().ok()
    }
}

/// Progress event consumed by the pipeline driver.
#[derive(Debug, Clone, Copy)]
pub struct BatchProgress {
    pub processed: usize,
    pub total: usize,
    pub errors_in_slice: usize,
}

pub struct AdaptiveBatchProcessor {
    store: Store,
    queues: Arc<WorkQueues>,
    config: AdaptiveBatchConfig,
}

impl AdaptiveBatchProcessor {
    pub fn new(store: Store, queues: Arc<WorkQueues>, config: AdaptiveBatchConfig) -> Self {
        Self {
            store,
            queues,
            config,
        }
    }

    /// Match a set of jobs against one resume.
    ///
    /// Phase A answers from the match cache in one query; phase B enqueues
    /// the remainder in adaptive slices. Per-item failures are recorded in
    /// the item's outcome; only cancellation and a dead queue abort.
    pub async fn process(
        &self,
        jobs: Vec<Job>,
        resume_text: &str,
        resume_hash: &str,
        priority: i64,
        ctx: RunContext,
        progress: mpsc::Sender<BatchProgress>,
    ) -> Result<Vec<BatchItemResult>> {
        let total = jobs.len();
        let hashes: Vec<String> = jobs.iter().map(|j| j.content_hash.clone()).collect();
        let cached_rows = self
            .store
            .cached_matches(&hashes, resume_hash)
            .await
            .map_err(|e| Error::Fatal(format!("match cache lookup failed: {e}")))?;
        let mut by_hash: HashMap<String, jobscout_store::CachedMatch> = cached_rows
            .into_iter()
            .map(|row| (row.content_hash.clone(), row))
            .collect();

        let mut results = Vec::with_capacity(total);
        let mut uncached = Vec::new();
        for job in jobs {
            match by_hash.remove(&job.content_hash) {
                Some(row) => {
                    let scored = ScoredMatch {
                        job_match_id: row.id,
                        verdict: row.verdict(),
                        cached: true,
                    };
                    results.push(BatchItemResult {
                        job,
                        outcome: Ok(scored),
                    });
                }
                None => uncached.push(job),
            }
        }
        info!(
            total,
            cached = results.len(),
            uncached = uncached.len(),
            "match cache partition"
        );
        let _ = progress
            .send(BatchProgress {
                processed: results.len(),
                total,
                errors_in_slice: 0,
            })
            .await;

        let mut state = AdaptiveState::new(&self.config);
        let mut index = 0;
        while index < uncached.len() {
            if self.queues.run_cancelled(ctx.run_id).await {
                return Err(Error::Cancelled);
            }

            let end = (index + state.batch_size).min(uncached.len());
            let slice: Vec<Job> = uncached[index..end].to_vec();
            index = end;

            let futures = slice.into_iter().map(|job| {
                let queues = self.queues.clone();
                let resume_text = resume_text.to_string();
                let resume_hash = resume_hash.to_string();
                let ctx = ctx.clone();
                async move {
                    let outcome = queues
                        .enqueue_matching(job.clone(), resume_text, resume_hash, priority, ctx)
                        .await;
                    (job, outcome)
                }
            });
            let slice_results = join_all(futures).await;

            let mut obs = SliceObservation {
                total: slice_results.len(),
                ..SliceObservation::default()
            };
            for (job, outcome) in slice_results {
                let outcome = match outcome {
                    Ok(matched) => match matched.job_match_id {
                        Some(id) => Ok(ScoredMatch {
                            job_match_id: id,
                            verdict: matched.verdict,
                            cached: matched.cached,
                        }),
                        None => Err(Error::Fatal("match outcome missing id".to_string())),
                    },
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(Error::QueueUnavailable(message)) => {
                        return Err(Error::QueueUnavailable(message));
                    }
                    Err(e) => Err(e),
                };
                match &outcome {
                    Err(Error::RateLimited(_)) => obs.rate_limited += 1,
                    Err(Error::Transient(_)) => obs.provider_errors += 1,
                    Err(_) => obs.other_errors += 1,
                    Ok(_) => {}
                }
                results.push(BatchItemResult { job, outcome });
            }

            let before = (state.batch_size, state.delay_ms);
            state.observe(obs);
            if (state.batch_size, state.delay_ms) != before {
                debug!(
                    batch_size = state.batch_size,
                    delay_ms = state.delay_ms,
                    rate_limited = obs.rate_limited,
                    provider_errors = obs.provider_errors,
                    "batch adaptation"
                );
            }
            if obs.has_errors() {
                warn!(
                    rate_limited = obs.rate_limited,
                    provider_errors = obs.provider_errors,
                    other = obs.other_errors,
                    "errors in matching slice"
                );
            }

            let _ = progress
                .send(BatchProgress {
                    processed: results.len(),
                    total,
                    errors_in_slice: obs.rate_limited + obs.provider_errors + obs.other_errors,
                })
                .await;

            if state.delay_ms > 0 && index < uncached.len() {
                tokio::time::sleep(Duration::from_millis(state.delay_ms)).await;
            }
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AdaptiveState {
        AdaptiveState::new(&AdaptiveBatchConfig::default())
    }

    fn clean(total: usize) -> SliceObservation {
        SliceObservation {
            total,
            ..SliceObservation::default()
        }
    }

    #[test]
    fn rate_limit_halves_batch_and_doubles_delay() {
        let mut s = state();
        s.observe(SliceObservation {
            total: 10,
            rate_limited: 1,
            ..SliceObservation::default()
        });
        assert_eq!(s.batch_size, 5);
        assert_eq!(s.delay_ms, 2_000);
        s.observe(SliceObservation {
            total: 5,
            rate_limited: 2,
            ..SliceObservation::default()
        });
        assert_eq!(s.batch_size, 2);
        assert_eq!(s.delay_ms, 4_000);
    }

    #[test]
    fn provider_errors_shrink_more_gently() {
        let mut s = state();
        s.observe(SliceObservation {
            total: 10,
            provider_errors: 1,
            ..SliceObservation::default()
        });
        assert_eq!(s.batch_size, 7);
        assert_eq!(s.delay_ms, 750);
    }

    #[test]
    fn rate_limit_takes_precedence_over_provider_errors() {
        let mut s = state();
        s.observe(SliceObservation {
            total: 10,
            rate_limited: 1,
            provider_errors: 3,
            ..SliceObservation::default()
        });
        assert_eq!(s.batch_size, 5);
        assert_eq!(s.delay_ms, 2_000);
    }

    #[test]
    fn three_error_slices_trigger_cooldown() {
        let mut s = state();
        for _ in 0..3 {
            s.observe(SliceObservation {
                total: 10,
                provider_errors: 1,
                ..SliceObservation::default()
            });
        }
        assert_eq!(s.consecutive_error_slices, 3);
        assert_eq!(s.delay_ms, 5_000);
        assert_eq!(s.batch_size, 1);
    }

    #[test]
    fn unclassified_errors_shave_batch_size() {
        let mut s = state();
        s.observe(SliceObservation {
            total: 10,
            other_errors: 2,
            ..SliceObservation::default()
        });
        assert_eq!(s.batch_size, 9);
        assert_eq!(s.delay_ms, 0);
    }

    #[test]
    fn growth_requires_two_consecutive_clean_slices() {
        let mut s = state();
        s.observe(clean(10));
        assert_eq!(s.batch_size, 10);
        s.observe(clean(10));
        assert_eq!(s.batch_size, 15);
        s.observe(clean(15));
        assert_eq!(s.batch_size, 22);
    }

    #[test]
    fn growth_halves_delay() {
        let mut s = state();
        s.observe(SliceObservation {
            total: 10,
            rate_limited: 1,
            ..SliceObservation::default()
        });
        assert_eq!(s.delay_ms, 2_000);
        s.observe(clean(5));
        s.observe(clean(5));
        assert_eq!(s.delay_ms, 1_000);
    }

    #[test]
    fn error_resets_success_streak() {
        let mut s = state();
        s.observe(clean(10));
        s.observe(SliceObservation {
            total: 10,
            other_errors: 1,
            ..SliceObservation::default()
        });
        s.observe(clean(10));
        // One clean slice after the error: no growth yet.
        assert_eq!(s.consecutive_success_slices, 1);
    }

    #[test]
    fn batch_size_never_reaches_zero() {
        let mut s = state();
        for _ in 0..20 {
            s.observe(SliceObservation {
                total: 1,
                rate_limited: 1,
                ..SliceObservation::default()
            });
        }
        assert_eq!(s.batch_size, 1);
    }

    #[test]
    fn batch_size_is_capped() {
        let mut s = state();
        for _ in 0..50 {
            s.observe(clean(10));
        }
        assert_eq!(s.batch_size, 50);
    }
}
