//! Redis connection handling and the run-cancel flag.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;
use uuid::Uuid;

use jobscout_core::{Error, Result};

/// Key carrying the run-cancel flag. Existence means workers must skip
/// remaining work for the run.
pub fn cancel_key(run_id: Uuid) -> String {
    format!("run:cancelled:{run_id}")
}

/// Shared handle to the KV store. Cheap to clone; all clones multiplex one
/// connection, with a dedicated connection created per pub/sub subscriber.
#[derive(Clone)]
pub struct Kv {
    client: redis::Client,
    manager: ConnectionManager,
}

impl Kv {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::QueueUnavailable(format!("invalid KV URL: {e}")))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| Error::QueueUnavailable(format!("KV store unreachable: {e}")))?;
        Ok(Self { client, manager })
    }

    /// A multiplexed connection for regular commands.
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// A dedicated pub/sub connection. Must not be shared with regular
    /// commands.
    pub async fn pubsub(&self) -> redis::RedisResult<redis::aio::PubSub> {
        self.client.get_async_pubsub().await
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection();
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| Error::QueueUnavailable(format!("KV ping failed: {e}")))
    }

    /// Raise the cancel flag for a run.
    pub async fn set_run_cancelled(&self, run_id: Uuid, ttl_secs: u64) -> Result<()> {
        let mut conn = self.connection();
        conn.set_ex::<_, _, ()>(cancel_key(run_id), "1", ttl_secs)
            .await
            .map_err(|e| Error::QueueUnavailable(format!("failed to set cancel flag: {e}")))
    }

    /// Check the cancel flag. A KV error is treated as not-cancelled so a
    /// flaky store cannot cancel work on its own.
    pub async fn run_cancelled(&self, run_id: Option<Uuid>) -> bool {
        let Some(run_id) = run_id else {
            return false;
        };
        let mut conn = self.connection();
        match conn.exists::<_, bool>(cancel_key(run_id)).await {
            Ok(set) => set,
            Err(e) => {
                warn!(%run_id, "cancel-flag check failed: {e}");
                false
            }
        }
    }

    /// SCAN for keys matching a pattern. Used by diagnostics only.
    pub async fn scan_keys(&self, pattern: &str, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.connection();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| Error::QueueUnavailable(format!("SCAN failed: {e}")))?;
            keys.extend(batch);
            if next == 0 || keys.len() >= limit {
                keys.truncate(limit);
                return Ok(keys);
            }
            cursor = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_key_format() {
        let id = Uuid::nil();
        assert_eq!(
            cancel_key(id),
            "run:cancelled:00000000-0000-0000-0000-000000000000"
        );
    }
}
