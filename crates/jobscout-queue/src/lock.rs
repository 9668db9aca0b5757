//! Cross-process single-run mutex per subscription, held in the KV store.

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use jobscout_core::{Error, Result};

use crate::kv::Kv;

const LOCK_PREFIX: &str = "lock:subscription:";

fn lock_key(subscription_id: &str) -> String {
    format!("{LOCK_PREFIX}{subscription_id}")
}

/// Value stored under the lock key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub run_id: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub holder: String,
}

/// A run may only proceed while it holds this lock; the pipeline refreshes
/// it on every stage transition and a janitor refreshes it for all runs
/// observed `running`.
#[derive(Clone)]
pub struct SubscriptionLock {
    kv: Kv,
    holder: String,
}

impl SubscriptionLock {
    pub fn new(kv: Kv, holder: impl Into<String>) -> Self {
        Self {
            kv,
            holder: holder.into(),
        }
    }

    /// Atomic set-if-absent. Returns false when another run holds the lock.
    pub async fn try_acquire(
        &self,
        subscription_id: &str,
        run_id: Uuid,
        ttl: Duration,
    ) -> Result<bool> {
        let record = LockRecord {
            run_id,
            acquired_at: Utc::now(),
            holder: self.holder.clone(),
        };
        let value = serde_json::to_string(&record)
            .map_err(|e| Error::Fatal(format!("lock record serialization: {e}")))?;
        let mut conn = self.kv.connection();
        let reply: Option<String> = redis::cmd("SET")
            .arg(lock_key(subscription_id))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::QueueUnavailable(format!("lock acquire failed: {e}")))?;
        Ok(reply.is_some())
    }

    /// Extend the TTL, but only while the stored run id still matches.
    /// Refreshing must never steal a lock that expired and was reacquired.
    pub async fn refresh(
        &self,
        subscription_id: &str,
        run_id: Uuid,
        ttl: Duration,
    ) -> Result<bool> {
        let Some(record) = self.holder_of(subscription_id).await? else {
            return Ok(false);
        };
        if record.run_id != run_id {
            return Ok(false);
        }
        let mut conn = self.kv.connection();
        let extended: bool = conn
            .pexpire(lock_key(subscription_id), ttl.as_millis() as i64)
            .await
            .map_err(|e| Error::QueueUnavailable(format!("lock refresh failed: {e}")))?;
        Ok(extended)
    }

    /// Delete the lock iff the run id matches.
    pub async fn release(&self, subscription_id: &str, run_id: Uuid) -> Result<bool> {
        let Some(record) = self.holder_of(subscription_id).await? else {
            return Ok(false);
        };
        if record.run_id != run_id {
            return Ok(false);
        }
        let mut conn = self.kv.connection();
        let deleted: i64 = conn
            .del(lock_key(subscription_id))
            .await
            .map_err(|e| Error::QueueUnavailable(format!("lock release failed: {e}")))?;
        Ok(deleted > 0)
    }

    pub async fn is_held(&self, subscription_id: &str) -> Result<bool> {
        let mut conn = self.kv.connection();
        conn.exists(lock_key(subscription_id))
            .await
            .map_err(|e| Error::QueueUnavailable(format!("lock check failed: {e}")))
    }

    pub async fn holder_of(&self, subscription_id: &str) -> Result<Option<LockRecord>> {
        let mut conn = self.kv.connection();
        let value: Option<String> = conn
            .get(lock_key(subscription_id))
            .await
            .map_err(|e| Error::QueueUnavailable(format!("lock read failed: {e}")))?;
        Ok(value.and_then(|v| serde_json::from_str(&v).ok()))
    }

    /// Keys of all currently held subscription locks, for diagnostics.
    pub async fn active_lock_keys(&self, limit: usize) -> Result<Vec<String>> {
        self.kv.scan_keys(&format!("{LOCK_PREFIX}*"), limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_includes_subscription() {
        assert_eq!(lock_key("sub-42"), "lock:subscription:sub-42");
    }

    #[test]
    fn lock_record_roundtrip() {
        let record = LockRecord {
            run_id: Uuid::nil(),
            acquired_at: Utc::now(),
            holder: "orchestrator-1".to_string(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: LockRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.run_id, record.run_id);
        assert_eq!(parsed.holder, "orchestrator-1");
    }
}
