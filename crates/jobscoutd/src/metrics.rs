//! Prometheus metrics for the daemon.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Arc;

#[derive(Clone)]
pub struct DaemonMetrics {
    pub active_runs: Gauge,
    pub collection_queue_depth: Gauge,
    pub matching_queue_depth: Gauge,
    pub runs_completed: Counter,
    pub runs_failed: Counter,
    pub runs_cancelled: Counter,
    pub notifications_sent: Counter,
    pub stuck_runs_failed: Counter,
    pub registry: Arc<Registry>,
}

impl DaemonMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let active_runs = Gauge::default();
        registry.register(
            "jobscout_active_runs",
            "Runs currently executing",
            active_runs.clone(),
        );

        let collection_queue_depth = Gauge::default();
        registry.register(
            "jobscout_collection_queue_depth",
            "Waiting collection jobs",
            collection_queue_depth.clone(),
        );

        let matching_queue_depth = Gauge::default();
        registry.register(
            "jobscout_matching_queue_depth",
            "Waiting matching jobs",
            matching_queue_depth.clone(),
        );

        let runs_completed = Counter::default();
        registry.register(
            "jobscout_runs_completed_total",
            "Runs finished with status completed",
            runs_completed.clone(),
        );

        let runs_failed = Counter::default();
        registry.register(
            "jobscout_runs_failed_total",
            "Runs finished with status failed",
            runs_failed.clone(),
        );

        let runs_cancelled = Counter::default();
        registry.register(
            "jobscout_runs_cancelled_total",
            "Runs finished with status cancelled",
            runs_cancelled.clone(),
        );

        let notifications_sent = Counter::default();
        registry.register(
            "jobscout_notifications_sent_total",
            "Match notifications delivered",
            notifications_sent.clone(),
        );

        let stuck_runs_failed = Counter::default();
        registry.register(
            "jobscout_stuck_runs_failed_total",
            "Runs failed by the stuck-run sweep",
            stuck_runs_failed.clone(),
        );

        Self {
            active_runs,
            collection_queue_depth,
            matching_queue_depth,
            runs_completed,
            runs_failed,
            runs_cancelled,
            notifications_sent,
            stuck_runs_failed,
            registry: Arc::new(registry),
        }
    }

    /// Encode all metrics as Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        encode(&mut buf, &self.registry).unwrap_or_default();
        buf
    }
}

impl Default for DaemonMetrics {
    fn default() -> Self {
        Self::new()
    }
}
