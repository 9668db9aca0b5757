//! Process-local coalescing of identical in-flight collection requests.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::debug;

use jobscout_core::{Error, RawPosting, Result};

type Outcome = Result<Vec<RawPosting>>;
type Slot = Option<Outcome>;

struct Entry {
    inserted_at: Instant,
    rx: watch::Receiver<Slot>,
}

/// Who is responsible for executing a claimed request.
pub enum Claim {
    /// First caller: execute the request and publish through the sender.
    Leader(watch::Sender<Slot>),
    /// Someone else is already executing; await their result.
    Follower(watch::Receiver<Slot>),
}

/// Mapping `cache_key → pending result`. Entries expire after the TTL and a
/// failed execution evicts its entry so later callers can retry.
pub struct RequestDedupCache {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

impl RequestDedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Claim a cache key. Exactly one concurrent caller becomes the leader.
    pub async fn claim(&self, cache_key: &str) -> Claim {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(cache_key) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Claim::Follower(entry.rx.clone());
            }
        }
        let (tx, rx) = watch::channel(None);
        entries.insert(
            cache_key.to_string(),
            Entry {
                inserted_at: Instant::now(),
                rx,
            },
        );
        Claim::Leader(tx)
    }

    /// Leader-side completion: publish the outcome to all followers. A
    /// failure also evicts the entry so the next caller retries.
    pub async fn publish(&self, cache_key: &str, tx: watch::Sender<Slot>, outcome: &Outcome) {
        if outcome.is_err() {
            self.remove(cache_key).await;
        }
        let _ = tx.send(Some(outcome.clone()));
    }

    pub async fn remove(&self, cache_key: &str) {
        self.entries.lock().await.remove(cache_key);
    }

    /// Follower-side wait. If the leader vanished without publishing the
    /// request is treated as transiently failed.
    pub async fn await_result(mut rx: watch::Receiver<Slot>) -> Outcome {
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                // Each follower gets its own copy of the postings.
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(Error::Transient(
                    "coalesced request abandoned by its leader".to_string(),
                ));
            }
        }
    }

    /// Drop expired entries; returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Periodic sweeper; stops when the shutdown flag flips.
    pub fn spawn_sweeper(
        self: &std::sync::Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let dropped = cache.sweep().await;
                        if dropped > 0 {
                            debug!(dropped, "dedup cache sweep");
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn posting(title: &str) -> RawPosting {
        RawPosting {
            title: title.to_string(),
            company: "Acme".to_string(),
            description: String::new(),
            location: None,
            is_remote: None,
            min_amount: None,
            max_amount: None,
            currency: None,
            job_url: "https://example.com".to_string(),
            id: None,
            date_posted: None,
        }
    }

    #[tokio::test]
    async fn single_leader_many_followers() {
        let cache = Arc::new(RequestDedupCache::new(Duration::from_secs(300)));

        let Claim::Leader(tx) = cache.claim("k").await else {
            panic!("first claim must lead");
        };
        let Claim::Follower(rx1) = cache.claim("k").await else {
            panic!("second claim must follow");
        };
        let Claim::Follower(rx2) = cache.claim("k").await else {
            panic!("third claim must follow");
        };

        let f1 = tokio::spawn(RequestDedupCache::await_result(rx1));
        let f2 = tokio::spawn(RequestDedupCache::await_result(rx2));

        cache
            .publish("k", tx, &Ok(vec![posting("Backend Engineer")]))
            .await;

        let r1 = f1.await.unwrap().unwrap();
        let r2 = f2.await.unwrap().unwrap();
        assert_eq!(r1.len(), 1);
        assert_eq!(r2.len(), 1);
        assert_eq!(r1[0].title, "Backend Engineer");
    }

    #[tokio::test]
    async fn failure_evicts_entry_for_retry() {
        let cache = Arc::new(RequestDedupCache::new(Duration::from_secs(300)));
        let Claim::Leader(tx) = cache.claim("k").await else {
            panic!()
        };
        cache
            .publish("k", tx, &Err(Error::Transient("boom".to_string())))
            .await;
        assert_eq!(cache.len().await, 0);
        assert!(matches!(cache.claim("k").await, Claim::Leader(_)));
    }

    #[tokio::test]
    async fn dropped_leader_fails_followers() {
        let cache = Arc::new(RequestDedupCache::new(Duration::from_secs(300)));
        let Claim::Leader(tx) = cache.claim("k").await else {
            panic!()
        };
        let Claim::Follower(rx) = cache.claim("k").await else {
            panic!()
        };
        drop(tx);
        let result = RequestDedupCache::await_result(rx).await;
        assert!(matches!(result, Err(Error::Transient(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_swept_and_reclaimed() {
        let cache = Arc::new(RequestDedupCache::new(Duration::from_secs(300)));
        let Claim::Leader(_tx) = cache.claim("k").await else {
            panic!()
        };
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(cache.sweep().await, 1);
        assert!(matches!(cache.claim("k").await, Claim::Leader(_)));
    }

    #[tokio::test]
    async fn distinct_keys_lead_independently() {
        let cache = Arc::new(RequestDedupCache::new(Duration::from_secs(300)));
        assert!(matches!(cache.claim("a").await, Claim::Leader(_)));
        assert!(matches!(cache.claim("b").await, Claim::Leader(_)));
        assert_eq!(cache.len().await, 2);
    }
}
