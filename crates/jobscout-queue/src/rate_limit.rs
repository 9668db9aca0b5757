//! Per-source request pacing with 429 back-off and cooldown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

pub use jobscout_core::error::is_rate_limit_message;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Base delay per source; sources not listed use `default_base_delay`.
    pub base_delays: HashMap<String, Duration>,
    pub default_base_delay: Duration,
    pub max_delay: Duration,
    pub cooldown_window: Duration,
    /// Consecutive successes required before the delay starts decaying.
    pub decay_after_successes: u32,
    /// Consecutive 429s that trigger a full cooldown.
    pub cooldown_after_429s: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut base_delays = HashMap::new();
        base_delays.insert("serpapi".to_string(), Duration::from_millis(1_000));
        base_delays.insert("scraper".to_string(), Duration::from_millis(5_000));
        base_delays.insert("linkedin".to_string(), Duration::from_millis(5_000));
        base_delays.insert("indeed".to_string(), Duration::from_millis(3_000));
        base_delays.insert("llm".to_string(), Duration::from_millis(200));
        Self {
            base_delays,
            default_base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(60),
            cooldown_window: Duration::from_secs(300),
            decay_after_successes: 3,
            cooldown_after_429s: 3,
        }
    }
}

#[derive(Debug)]
struct SourceState {
    base_delay: Duration,
    current_delay: Duration,
    consecutive_429: u32,
    consecutive_successes: u32,
    cooldown_until: Option<Instant>,
    /// The earliest instant the next caller may fire. Advanced under the
    /// lock so concurrent callers reserve disjoint slots.
    next_slot_at: Option<Instant>,
}

impl SourceState {
    fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            current_delay: base_delay,
            consecutive_429: 0,
            consecutive_successes: 0,
            cooldown_until: None,
            next_slot_at: None,
        }
    }
}

/// One mutex per source; `wait_for_slot` serializes callers on the same
/// source without blocking callers on other sources.
pub struct RateLimiter {
    config: RateLimitConfig,
    sources: Mutex<HashMap<String, Arc<Mutex<SourceState>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            sources: Mutex::new(HashMap::new()),
        }
    }

    async fn source(&self, source: &str) -> Arc<Mutex<SourceState>> {
        let mut sources = self.sources.lock().await;
        sources
            .entry(source.to_string())
            .or_insert_with(|| {
                let base = self
                    .config
                    .base_delays
                    .get(source)
                    .copied()
                    .unwrap_or(self.config.default_base_delay);
                Arc::new(Mutex::new(SourceState::new(base)))
            })
            .clone()
    }

    /// Block until this source's next slot and return the elapsed wait.
    /// Must be called before every outbound request for the source.
    pub async fn wait_for_slot(&self, source: &str) -> Duration {
        let state = self.source(source).await;
        let now = Instant::now();
        let slot = {
            let mut s = state.lock().await;
            let mut slot = now;
            if let Some(until) = s.cooldown_until {
                if until > slot {
                    slot = until;
                }
            }
            if let Some(next) = s.next_slot_at {
                if next > slot {
                    slot = next;
                }
            }
            s.next_slot_at = Some(slot + s.current_delay);
            slot
        };
        if slot > now {
            tokio::time::sleep_until(slot).await;
        }
        let waited = slot.saturating_duration_since(now);
        if !waited.is_zero() {
            debug!(source, waited_ms = waited.as_millis() as u64, "rate-limit wait");
        }
        waited
    }

    pub async fn record_success(&self, source: &str) {
        let state = self.source(source).await;
        let mut s = state.lock().await;
        s.consecutive_429 = 0;
        s.consecutive_successes += 1;
        if s.consecutive_successes >= self.config.decay_after_successes
            && s.current_delay > s.base_delay
        {
            let decayed = s.current_delay.mul_f64(0.9);
            s.current_delay = decayed.max(s.base_delay);
        }
    }

    pub async fn record_429(&self, source: &str) {
        let state = self.source(source).await;
        let mut s = state.lock().await;
        s.consecutive_successes = 0;
        s.consecutive_429 += 1;
        s.current_delay = (s.current_delay * 2).min(self.config.max_delay);
        if s.consecutive_429 >= self.config.cooldown_after_429s {
            s.cooldown_until = Some(Instant::now() + self.config.cooldown_window);
            warn!(
                source,
                consecutive = s.consecutive_429,
                cooldown_secs = self.config.cooldown_window.as_secs(),
                "source in cooldown after repeated 429s"
            );
        }
    }

    /// A non-429 failure: breaks the success streak, leaves the delay alone.
    pub async fn record_error(&self, source: &str) {
        let state = self.source(source).await;
        let mut s = state.lock().await;
        s.consecutive_successes = 0;
    }

    /// Current delay for a source, for diagnostics.
    pub async fn current_delay(&self, source: &str) -> Duration {
        let state = self.source(source).await;
        let s = state.lock().await;
        s.current_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_with_base(ms: u64) -> RateLimiter {
        let config = RateLimitConfig {
            base_delays: HashMap::new(),
            default_base_delay: Duration::from_millis(ms),
            ..RateLimitConfig::default()
        };
        RateLimiter::new(config)
    }

    #[tokio::test(start_paused = true)]
    async fn first_slot_is_immediate_then_spaced() {
        let limiter = limiter_with_base(1_000);
        let waited = limiter.wait_for_slot("src").await;
        assert!(waited.is_zero());
        let waited = limiter.wait_for_slot("src").await;
        assert_eq!(waited, Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_get_disjoint_slots() {
        let limiter = Arc::new(limiter_with_base(1_000));
        let a = tokio::spawn({
            let l = limiter.clone();
            async move { l.wait_for_slot("src").await }
        });
        let b = tokio::spawn({
            let l = limiter.clone();
            async move { l.wait_for_slot("src").await }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        // One of the two waited a full delay, the other went first.
        let mut waits = [a, b];
        waits.sort();
        assert!(waits[0].is_zero());
        assert_eq!(waits[1], Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn sources_do_not_interfere() {
        let limiter = limiter_with_base(1_000);
        limiter.wait_for_slot("a").await;
        let waited = limiter.wait_for_slot("b").await;
        assert!(waited.is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_429_doubles_delay_and_cools_down() {
        let limiter = limiter_with_base(1_000);
        limiter.wait_for_slot("src").await;
        limiter.record_429("src").await;
        assert_eq!(
            limiter.current_delay("src").await,
            Duration::from_millis(2_000)
        );
        limiter.record_429("src").await;
        assert_eq!(
            limiter.current_delay("src").await,
            Duration::from_millis(4_000)
        );
        limiter.record_429("src").await;
        // Third consecutive 429 sets a cooldown well beyond the delay.
        let waited = limiter.wait_for_slot("src").await;
        assert!(waited >= Duration::from_secs(300) - Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_is_capped() {
        let config = RateLimitConfig {
            base_delays: HashMap::new(),
            default_base_delay: Duration::from_secs(40),
            max_delay: Duration::from_secs(60),
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(config);
        limiter.record_429("src").await;
        assert_eq!(limiter.current_delay("src").await, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn success_streak_decays_delay_toward_base() {
        let limiter = limiter_with_base(1_000);
        limiter.record_429("src").await;
        assert_eq!(
            limiter.current_delay("src").await,
            Duration::from_millis(2_000)
        );
        for _ in 0..3 {
            limiter.record_success("src").await;
        }
        let delay = limiter.current_delay("src").await;
        assert_eq!(delay, Duration::from_millis(1_800));
        // Decay never undershoots the base.
        for _ in 0..100 {
            limiter.record_success("src").await;
        }
        assert_eq!(
            limiter.current_delay("src").await,
            Duration::from_millis(1_000)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn error_resets_success_streak() {
        let limiter = limiter_with_base(1_000);
        limiter.record_429("src").await;
        limiter.record_success("src").await;
        limiter.record_success("src").await;
        limiter.record_error("src").await;
        limiter.record_success("src").await;
        // Streak restarted, no decay yet.
        assert_eq!(
            limiter.current_delay("src").await,
            Duration::from_millis(2_000)
        );
    }
}
