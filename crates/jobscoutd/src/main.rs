//! jobscoutd — the jobscout orchestrator daemon.
//!
//! One process owns the scheduler tick; worker pools may also run in other
//! processes and coordinate through the KV store.

mod admin;
mod config;
mod metrics;
mod scheduler;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use jobscout_agents::{HttpChatClient, LlmClient, Matcher, QueryExpander, ScraperClient};
use jobscout_pipeline::{
    AdaptiveBatchConfig, AdaptiveBatchProcessor, NotificationEmitter, PipelineConfig,
    PipelineDriver,
};
use jobscout_queue::{
    spawn_promoter, spawn_worker_pools, Kv, QueueConfig, RateLimitConfig, RateLimiter,
    RequestDedupCache, SubscriptionLock, WorkQueues, WorkerEnv, WorkerPoolConfig,
};
use jobscout_store::{RunTracker, Store};

use admin::{AppState, RateGate};
use config::Config;
use metrics::DaemonMetrics;
use scheduler::{Scheduler, SchedulerConfig};

#[derive(Parser)]
#[command(name = "jobscoutd", about = "jobscout matching daemon")]
struct Cli {
    /// Address for the admin/metrics listener; overrides ADMIN_BIND.
    #[arg(long, env = "ADMIN_BIND")]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let bind = cli.bind.unwrap_or_else(|| config.admin_bind.clone());

    // The relational store is the system of record; refuse to start
    // without it.
    let store = Store::connect(&config.database_url)
        .await
        .context("relational store unreachable at startup")?;
    info!("connected to database");

    let kv = Kv::connect(&config.kv_url)
        .await
        .context("KV store unreachable at startup")?;
    info!("connected to KV store at {}", config.kv_url);

    let tracker = RunTracker::new(store.clone());
    let metrics = DaemonMetrics::new();

    let holder = std::env::var("HOSTNAME")
        .unwrap_or_else(|_| format!("jobscoutd-{}", std::process::id()));
    let lock = Arc::new(SubscriptionLock::new(kv.clone(), holder));

    // Outbound collaborators.
    let scraper = Arc::new(ScraperClient::new(
        config.scraper_url.clone(),
        config.scraper_api_key.clone(),
    ));
    let llm = Arc::new(LlmClient::from_env().context("LLM configuration")?);
    let matcher = Arc::new(Matcher::new(llm.clone()));
    let expander = Arc::new(QueryExpander::new(llm));
    let chat: Option<Arc<dyn jobscout_agents::ChatTransport>> =
        config.chat_api_url.as_ref().map(|url| {
            Arc::new(HttpChatClient::new(url.clone())) as Arc<dyn jobscout_agents::ChatTransport>
        });

    // Dispatch layer.
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()));
    let dedup = Arc::new(RequestDedupCache::new(Duration::from_secs(300)));
    let worker_env = Arc::new(WorkerEnv::new(
        kv.clone(),
        store.clone(),
        scraper.clone(),
        matcher,
        limiter,
        config.collection_min_delay,
    ));
    let queue_config = QueueConfig {
        fallback_enabled: config.queue_fallback_enabled,
        ..QueueConfig::default()
    };
    let queues = Arc::new(WorkQueues::new(
        kv.clone(),
        queue_config.clone(),
        dedup.clone(),
        Some(worker_env.clone()),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut background = Vec::new();
    background.push(queues.spawn_completion_listener(shutdown_rx.clone()));
    background.push(spawn_promoter(kv.clone(), shutdown_rx.clone()));
    background.push(dedup.spawn_sweeper(Duration::from_secs(60), shutdown_rx.clone()));
    background.extend(spawn_worker_pools(
        worker_env,
        queue_config,
        WorkerPoolConfig {
            collection_concurrency: config.collection_concurrency,
            matching_concurrency: config.matching_concurrency,
        },
        shutdown_rx.clone(),
    ));

    // Pipeline.
    let emitter = match &chat {
        Some(chat) => Arc::new(NotificationEmitter::new(
            chat.clone(),
            config.chat_parse_mode,
        )),
        None => {
            warn!("CHAT_API_URL not set; notifications will fail until configured");
            Arc::new(NotificationEmitter::new(
                Arc::new(HttpChatClient::new("http://127.0.0.1:0")),
                config.chat_parse_mode,
            ))
        }
    };
    let batch = AdaptiveBatchProcessor::new(
        store.clone(),
        queues.clone(),
        AdaptiveBatchConfig::default(),
    );
    let pipeline_config = PipelineConfig {
        dedup_order: config.notify_dedup_order,
        source: config.collection_source,
        ..PipelineConfig::default()
    };
    let driver = Arc::new(PipelineDriver::new(
        store.clone(),
        tracker.clone(),
        queues.clone(),
        lock.clone(),
        expander,
        emitter,
        batch,
        pipeline_config.clone(),
    ));

    // Scheduler + sweeps.
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        tracker.clone(),
        lock.clone(),
        queues.clone(),
        driver,
        metrics.clone(),
        SchedulerConfig {
            tick: config.scheduler_tick,
            max_parallel_runs: config.max_parallel_runs,
            scan_interval_hours: config.scan_interval_hours,
            lock_ttl: pipeline_config.lock_ttl,
            ..SchedulerConfig::default()
        },
        config.stuck_run_threshold_min,
    ));
    background.push(scheduler.spawn_stuck_sweeper(shutdown_rx.clone()));
    background.push(scheduler.spawn_lock_janitor(shutdown_rx.clone()));
    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown_rx.clone()));

    // Admin surface.
    if config.admin_api_key.is_none() {
        warn!("ADMIN_API_KEY not set; /api endpoints will return 503");
    }
    let app_state = Arc::new(AppState {
        store,
        tracker,
        queues,
        lock,
        scheduler: scheduler.clone(),
        scraper,
        chat,
        parse_mode: config.chat_parse_mode,
        metrics,
        admin_key: config.admin_api_key.clone(),
        rate: RateGate::new(),
    });
    let app = admin::router(app_state.clone())
        .into_make_service_with_connect_info::<std::net::SocketAddr>();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("cannot bind admin listener on {bind}"))?;
    info!("admin listener on {bind}");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("admin server error: {e}");
        }
    });

    wait_for_signal().await;
    info!("shutdown signal received");

    // Stop the tick, refuse new runs, let in-flight runs reach their next
    // stage boundary, then stop the background tasks.
    scheduler.drain(Duration::from_secs(60)).await;
    match app_state.store.active_runs().await {
        Ok(still_running) => {
            for run in still_running {
                info!(run_id = %run.id, "cancelling run still in flight at shutdown");
                if let Err(e) = app_state.queues.cancel_run(run.id).await {
                    warn!(run_id = %run.id, "shutdown cancel failed: {e}");
                }
            }
        }
        Err(e) => warn!("cannot enumerate in-flight runs at shutdown: {e}"),
    }
    let _ = shutdown_tx.send(true);
    scheduler_task.abort();
    server.abort();
    for handle in background {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!("cannot install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
