//! Daemon configuration from environment variables.

use anyhow::{Context, Result};
use std::time::Duration;

use jobscout_agents::chat::ParseMode;
use jobscout_core::JobSource;
use jobscout_pipeline::DedupOrder;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub kv_url: String,
    pub admin_api_key: Option<String>,
    pub admin_bind: String,

    pub scraper_url: String,
    pub scraper_api_key: Option<String>,
    pub collection_source: JobSource,

    pub chat_api_url: Option<String>,
    pub chat_parse_mode: ParseMode,

    pub collection_concurrency: usize,
    pub matching_concurrency: usize,
    pub collection_min_delay: Duration,
    pub queue_fallback_enabled: bool,

    pub max_parallel_runs: usize,
    pub stuck_run_threshold_min: i64,
    pub scheduler_tick: Duration,
    pub scan_interval_hours: i64,
    pub notify_dedup_order: DedupOrder,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value.parse().context(format!("invalid {name}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL required")?,
            kv_url: std::env::var("KV_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            admin_api_key: std::env::var("ADMIN_API_KEY").ok().filter(|k| !k.is_empty()),
            admin_bind: std::env::var("ADMIN_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            scraper_url: std::env::var("SCRAPER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8000".to_string()),
            scraper_api_key: std::env::var("SCRAPER_API_KEY").ok().filter(|k| !k.is_empty()),
            collection_source: match std::env::var("COLLECTION_SOURCE").as_deref() {
                Ok("scraper") => JobSource::Scraper,
                _ => JobSource::Serpapi,
            },
            chat_api_url: std::env::var("CHAT_API_URL").ok().filter(|u| !u.is_empty()),
            chat_parse_mode: ParseMode::parse(
                &std::env::var("CHAT_PARSE_MODE").unwrap_or_else(|_| "html".to_string()),
            ),
            collection_concurrency: env_parse("QUEUE_COLLECTION_CONCURRENCY", 2usize)?,
            matching_concurrency: env_parse("QUEUE_MATCHING_CONCURRENCY", 5usize)?,
            collection_min_delay: Duration::from_millis(env_parse(
                "COLLECTION_MIN_DELAY_MS",
                1_000u64,
            )?),
            queue_fallback_enabled: env_parse("QUEUE_FALLBACK_ENABLED", true)?,
            max_parallel_runs: env_parse("MAX_PARALLEL_RUNS", 10usize)?,
            stuck_run_threshold_min: env_parse("STUCK_RUN_THRESHOLD_MIN", 120i64)?,
            scheduler_tick: Duration::from_secs(env_parse("SCHEDULER_TICK_SECS", 60u64)?),
            scan_interval_hours: env_parse("SCAN_INTERVAL_HOURS", 24i64)?,
            notify_dedup_order: DedupOrder::parse(
                &std::env::var("NOTIFY_DEDUP_ORDER").unwrap_or_default(),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_uses_default_when_absent() {
        std::env::remove_var("JOBSCOUT_TEST_ABSENT");
        let parsed: usize = env_parse("JOBSCOUT_TEST_ABSENT", 7).unwrap();
        assert_eq!(parsed, 7);
    }

    #[test]
    fn env_parse_rejects_garbage() {
        std::env::set_var("JOBSCOUT_TEST_GARBAGE", "not-a-number");
        let parsed: Result<usize> = env_parse("JOBSCOUT_TEST_GARBAGE", 7);
        assert!(parsed.is_err());
        std::env::remove_var("JOBSCOUT_TEST_GARBAGE");
    }
}
