//! Admin JSON API: auth, per-IP rate limiting, and the dashboard,
//! diagnostics and control endpoints.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use jobscout_agents::chat::{truncate_message, ChatTransport, ParseMode, MAX_MESSAGE_CHARS};
use jobscout_agents::ScraperClient;
use jobscout_queue::{QueueName, SubscriptionLock, WorkQueues};
use jobscout_store::{Pagination, RunRow, RunTracker, Store};

use crate::metrics::DaemonMetrics;
use crate::scheduler::{Scheduler, TriggerError};

const RATE_CAPACITY: f64 = 30.0;
const RATE_REFILL_PER_SEC: f64 = RATE_CAPACITY / 60.0;

/// Token bucket per client IP: 30 requests per minute.
pub struct RateGate {
    buckets: Mutex<HashMap<IpAddr, (f64, Instant)>>,
}

impl RateGate {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub async fn allow(&self, ip: IpAddr) -> bool {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let (tokens, last) = buckets.entry(ip).or_insert((RATE_CAPACITY, now));
        let refilled = *tokens + last.elapsed().as_secs_f64() * RATE_REFILL_PER_SEC;
        *tokens = refilled.min(RATE_CAPACITY);
        *last = now;
        if *tokens >= 1.0 {
            *tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AppState {
    pub store: Store,
    pub tracker: RunTracker,
    pub queues: Arc<WorkQueues>,
    pub lock: Arc<SubscriptionLock>,
    pub scheduler: Arc<Scheduler>,
    pub scraper: Arc<ScraperClient>,
    pub chat: Option<Arc<dyn ChatTransport>>,
    pub parse_mode: ParseMode,
    pub metrics: DaemonMetrics,
    pub admin_key: Option<String>,
    pub rate: RateGate,
}

type ApiError = (StatusCode, String);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn internal(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = &state.admin_key else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "admin surface disabled: ADMIN_API_KEY not set".to_string(),
        ));
    };
    let provided = request
        .headers()
        .get("X-Admin-Key")
        .and_then(|v| v.to_str().ok());
    if provided != Some(expected.as_str()) {
        return Err((StatusCode::UNAUTHORIZED, "invalid admin key".to_string()));
    }
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]));
    if !state.rate.allow(ip).await {
        return Err((StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded".to_string()));
    }
    Ok(next.run(request).await)
}

/// Build the full router: unauthenticated health/metrics plus the guarded
/// /api surface.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/overview", get(overview))
        .route("/api/users", get(list_users))
        .route("/api/users/:id", get(user_detail))
        .route("/api/subscriptions", get(list_subscriptions))
        .route("/api/subscriptions/:id", get(subscription_detail))
        .route("/api/subscriptions/:id/debug", post(toggle_debug))
        .route("/api/subscriptions/:id/run", post(manual_run))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/active", get(active_runs))
        .route("/api/runs/stream", get(run_stream))
        .route("/api/runs/:id", get(run_detail))
        .route("/api/runs/:id/stop", post(stop_run))
        .route("/api/errors", get(recent_errors))
        .route("/api/diagnostics", get(diagnostics))
        .route("/api/diagnostics/fail-stuck", post(fail_stuck))
        .route("/api/broadcasts", get(list_broadcasts).post(create_broadcast))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics_endpoint))
        .merge(api)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn ready(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    match state.store.ping().await {
        Ok(()) => Ok("OK"),
        Err(_) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> String {
    state.metrics.encode()
}

// === Overview ===

#[derive(Deserialize)]
struct OverviewParams {
    period: Option<String>,
    compare: Option<bool>,
}

fn period_window(period: &str) -> Result<(Option<chrono::Duration>, &'static str), ApiError> {
    match period {
        "24h" => Ok((Some(chrono::Duration::hours(24)), "Last 24 hours")),
        "7d" => Ok((Some(chrono::Duration::days(7)), "Last 7 days")),
        "30d" => Ok((Some(chrono::Duration::days(30)), "Last 30 days")),
        "all" => Ok((None, "All time")),
        other => Err((
            StatusCode::BAD_REQUEST,
            format!("invalid period '{other}', expected 24h|7d|30d|all"),
        )),
    }
}

fn percent_change(current: i64, previous: i64) -> Option<f64> {
    if previous == 0 {
        return None;
    }
    Some(((current - previous) as f64 / previous as f64) * 100.0)
}

async fn overview(
    State(state): State<Arc<AppState>>,
    Query(params): Query<OverviewParams>,
) -> ApiResult<serde_json::Value> {
    let period = params.period.unwrap_or_else(|| "24h".to_string());
    let (window, label) = period_window(&period)?;
    let now = Utc::now();
    let from = window.map(|w| now - w);

    let activity = state
        .store
        .activity_between(from, now)
        .await
        .map_err(internal)?;
    let users = state.store.count_users().await.map_err(internal)?;
    let (total_subs, active_subs) = state.store.count_subscriptions().await.map_err(internal)?;

    let comparison = match (params.compare.unwrap_or(false), window) {
        (true, Some(w)) => {
            let previous = state
                .store
                .activity_between(Some(now - w - w), now - w)
                .await
                .map_err(internal)?;
            Some(json!({
                "jobs_scanned_change": percent_change(activity.jobs_scanned, previous.jobs_scanned),
                "matches_found_change": percent_change(activity.matches_found, previous.matches_found),
                "notifications_sent_change":
                    percent_change(activity.notifications_sent, previous.notifications_sent),
                "total_runs_change": percent_change(activity.total_runs, previous.total_runs),
                "failed_runs_change": percent_change(activity.failed_runs, previous.failed_runs),
            }))
        }
        _ => None,
    };

    Ok(Json(json!({
        "users": users,
        "subscriptions": { "total": total_subs, "active": active_subs },
        "activity": {
            "jobs_scanned": activity.jobs_scanned,
            "matches_found": activity.matches_found,
            "notifications_sent": activity.notifications_sent,
            "total_runs": activity.total_runs,
            "failed_runs": activity.failed_runs,
            "period": period,
            "period_label": label,
        },
        "comparison": comparison,
    })))
}

// === Users ===

#[derive(Deserialize)]
struct PageParams {
    page: Option<i64>,
    limit: Option<i64>,
    status: Option<String>,
}

fn page_and_limit(params: &PageParams, max_limit: i64) -> (i64, i64) {
    let page = params.page.unwrap_or(1).max(1);
    let limit = params.limit.unwrap_or(20).clamp(1, max_limit);
    (page, limit)
}

async fn list_users(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PageParams>,
) -> ApiResult<serde_json::Value> {
    let (page, limit) = page_and_limit(&params, 100);
    let (users, total) = state.store.list_users(page, limit).await.map_err(internal)?;
    Ok(Json(json!({
        "users": users,
        "pagination": Pagination::new(page, limit, total),
    })))
}

async fn user_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let user = state
        .store
        .get_user(&id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "user not found".to_string()))?;
    let subs = state
        .store
        .subscriptions_for_user(&id)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "user": user, "subscriptions": subs })))
}

// === Subscriptions ===

async fn list_subscriptions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PageParams>,
) -> ApiResult<serde_json::Value> {
    let (page, limit) = page_and_limit(&params, 100);
    if let Some(status) = params.status.as_deref() {
        if !matches!(status, "active" | "paused" | "inactive") {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("invalid status '{status}'"),
            ));
        }
    }
    let (subs, total) = state
        .store
        .list_subscriptions(page, limit, params.status.as_deref())
        .await
        .map_err(internal)?;
    Ok(Json(json!({
        "subscriptions": subs,
        "pagination": Pagination::new(page, limit, total),
    })))
}

async fn subscription_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let sub = state
        .store
        .get_subscription(&id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "subscription not found".to_string()))?;
    let runs = state
        .store
        .runs_for_subscription(&id, 20)
        .await
        .map_err(internal)?;
    let skills = state
        .store
        .skill_stats(&sub.resume_hash, 10)
        .await
        .map_err(internal)?;
    Ok(Json(json!({
        "subscription": sub,
        "runs": runs,
        "skill_stats": skills,
    })))
}

async fn toggle_debug(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<serde_json::Value> {
    let Some(enabled) = body.get("enabled").and_then(|v| v.as_bool()) else {
        return Err((
            StatusCode::BAD_REQUEST,
            "body must be {\"enabled\": bool}".to_string(),
        ));
    };
    let found = state
        .store
        .set_debug_mode(&id, enabled)
        .await
        .map_err(internal)?;
    if !found {
        return Err((StatusCode::NOT_FOUND, "subscription not found".to_string()));
    }
    Ok(Json(json!({ "id": id, "debug_mode": enabled })))
}

async fn manual_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    match state.scheduler.trigger_manual(&id).await {
        Ok(run_id) => Ok(Json(json!({ "run_id": run_id, "status": "running" }))),
        Err(TriggerError::NotFound) => {
            Err((StatusCode::NOT_FOUND, "subscription not found".to_string()))
        }
        Err(TriggerError::AlreadyRunning) => Err((
            StatusCode::CONFLICT,
            "a run is already in progress for this subscription".to_string(),
        )),
        Err(TriggerError::ShuttingDown) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "daemon is shutting down".to_string(),
        )),
        Err(TriggerError::Internal(e)) => Err(internal(e)),
    }
}

// === Runs ===

async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PageParams>,
) -> ApiResult<serde_json::Value> {
    let (page, limit) = page_and_limit(&params, 100);
    let (runs, total) = state
        .store
        .list_runs(page, limit, params.status.as_deref())
        .await
        .map_err(internal)?;
    Ok(Json(json!({
        "runs": runs,
        "pagination": Pagination::new(page, limit, total),
    })))
}

async fn run_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<RunRow> {
    state
        .store
        .get_run(id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "run not found".to_string()))
}

async fn active_runs(State(state): State<Arc<AppState>>) -> ApiResult<serde_json::Value> {
    let runs = state.store.active_runs().await.map_err(internal)?;
    Ok(Json(json!({ "runs": runs })))
}

/// Live run events from the tracker, so the dashboard renders in-flight
/// progress without polling.
async fn run_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    use tokio::sync::broadcast::error::RecvError;

    let rx = state.tracker.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    return Some((Ok(SseEvent::default().event("run").data(data)), rx));
                }
                // A slow consumer only loses old events.
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn stop_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    let run = state
        .store
        .get_run(id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "run not found".to_string()))?;

    let counts = state.queues.cancel_run(id).await.map_err(internal)?;
    let cancelled = state
        .tracker
        .cancel(id, &run.subscription_id)
        .await
        .map_err(internal)?;
    if cancelled {
        if let Err(e) = state.lock.release(&run.subscription_id, id).await {
            warn!(run_id = %id, "lock release on stop failed: {e}");
        }
    }
    // Cross-process log correlation; failure tolerated.
    let scraper = state.scraper.clone();
    tokio::spawn(async move { scraper.notify_cancelled(id).await });

    info!(run_id = %id, cancelled, "stop requested");
    Ok(Json(json!({
        "run_id": id,
        "cancelled": cancelled,
        "removed_jobs": counts,
    })))
}

// === Errors & diagnostics ===

#[derive(Deserialize)]
struct LimitParams {
    limit: Option<i64>,
}

async fn recent_errors(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitParams>,
) -> ApiResult<serde_json::Value> {
    let limit = params.limit.unwrap_or(20).clamp(1, 500);
    let errors = state.store.recent_failures(limit).await.map_err(internal)?;
    Ok(Json(json!({ "errors": errors })))
}

fn run_issues(run: &RunRow, duration_minutes: i64, lock_held: bool) -> Vec<String> {
    let mut issues = Vec::new();
    if duration_minutes > 30 {
        issues.push(format!("duration > 30 min ({duration_minutes} min)"));
    }
    if run.checkpoint.is_none() && duration_minutes > 10 {
        issues.push("no checkpoint after 10 min".to_string());
    }
    if !lock_held {
        issues.push("lock missing - potential race".to_string());
    }
    if run.current_stage.as_deref() == Some("collection") && duration_minutes > 15 {
        issues.push("stuck in collection".to_string());
    }
    issues
}

async fn diagnostics(State(state): State<Arc<AppState>>) -> ApiResult<serde_json::Value> {
    let active = state.store.active_runs().await.map_err(internal)?;
    let now = Utc::now();

    let mut running = Vec::with_capacity(active.len());
    for run in &active {
        let lock_held = state
            .lock
            .is_held(&run.subscription_id)
            .await
            .unwrap_or(false);
        let duration_minutes = (now - run.started_at).num_minutes();
        let handle = match state.store.get_subscription(&run.subscription_id).await {
            Ok(Some(sub)) => match state.store.get_user(&sub.user_id).await {
                Ok(Some(user)) => user.handle,
                _ => sub.user_id,
            },
            _ => "unknown".to_string(),
        };
        running.push(json!({
            "short_id": run.id.to_string()[..8].to_string(),
            "run_id": run.id,
            "username": handle,
            "started_at": run.started_at,
            "duration_minutes": duration_minutes,
            "stage": run.current_stage,
            "progress_percent": run.progress_percent,
            "has_checkpoint": run.checkpoint.is_some(),
            "lock_status": if lock_held { "LOCKED" } else { "UNLOCKED" },
            "issues": run_issues(run, duration_minutes, lock_held),
        }));
    }

    let collection = state
        .queues
        .queue_stats(QueueName::Collection)
        .await
        .unwrap_or_default();
    let matching = state
        .queues
        .queue_stats(QueueName::Matching)
        .await
        .unwrap_or_default();
    let lock_keys = state.lock.active_lock_keys(100).await.unwrap_or_default();
    let failures = state.store.recent_failures(5).await.map_err(internal)?;

    Ok(Json(json!({
        "running_runs": running,
        "queues": { "collection": collection, "matching": matching },
        "active_lock_keys": lock_keys,
        "recent_failures": failures,
        "request_cache_size": state.queues.dedup().len().await,
    })))
}

async fn fail_stuck(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<serde_json::Value> {
    let Some(min_age) = body.get("min_age_minutes").and_then(|v| v.as_i64()) else {
        return Err((
            StatusCode::BAD_REQUEST,
            "body must include numeric min_age_minutes".to_string(),
        ));
    };
    if min_age < 1 {
        return Err((
            StatusCode::BAD_REQUEST,
            "min_age_minutes must be positive".to_string(),
        ));
    }
    if body.get("persist").and_then(|v| v.as_bool()).unwrap_or(false) {
        state
            .scheduler
            .stuck_threshold_min
            .store(min_age, Ordering::Relaxed);
    }
    let summary = state
        .scheduler
        .sweep_stuck(min_age)
        .await
        .map_err(internal)?;
    Ok(Json(json!({
        "failed_runs": summary.failed_run_ids,
        "count": summary.failed_run_ids.len(),
    })))
}

// === Broadcasts ===

async fn list_broadcasts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PageParams>,
) -> ApiResult<serde_json::Value> {
    let (page, limit) = page_and_limit(&params, 100);
    let (broadcasts, total) = state
        .store
        .list_broadcasts(page, limit)
        .await
        .map_err(internal)?;
    Ok(Json(json!({
        "broadcasts": broadcasts,
        "pagination": Pagination::new(page, limit, total),
    })))
}

async fn create_broadcast(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<serde_json::Value> {
    let Some(message) = body.get("message").and_then(|v| v.as_str()) else {
        return Err((
            StatusCode::BAD_REQUEST,
            "body must include string message".to_string(),
        ));
    };
    if message.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "message must not be empty".to_string()));
    }
    let Some(chat) = state.chat.clone() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "chat delivery not configured".to_string(),
        ));
    };

    let id = state.store.create_broadcast(message).await.map_err(internal)?;
    let store = state.store.clone();
    let parse_mode = state.parse_mode;
    let message = message.to_string();
    tokio::spawn(async move {
        let targets = match store.all_user_chats().await {
            Ok(targets) => targets,
            Err(e) => {
                warn!(broadcast_id = %id, "broadcast target query failed: {e}");
                return;
            }
        };
        let body = truncate_message(&message, MAX_MESSAGE_CHARS, parse_mode);
        let mut sent = 0;
        let mut failed = 0;
        for (user_id, chat_id) in targets {
            match chat.send_message(&chat_id, &body, parse_mode).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(user_id, "broadcast delivery failed: {e}");
                    failed += 1;
                }
            }
        }
        if let Err(e) = store.finish_broadcast(id, sent, failed).await {
            warn!(broadcast_id = %id, "broadcast bookkeeping failed: {e}");
        }
        info!(broadcast_id = %id, sent, failed, "broadcast delivered");
    });

    Ok(Json(json!({ "id": id, "status": "queued" })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_gate_allows_burst_then_throttles() {
        let gate = RateGate::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        for _ in 0..30 {
            assert!(gate.allow(ip).await);
        }
        assert!(!gate.allow(ip).await);
    }

    #[tokio::test]
    async fn rate_gate_tracks_ips_independently() {
        let gate = RateGate::new();
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        for _ in 0..30 {
            assert!(gate.allow(a).await);
        }
        assert!(!gate.allow(a).await);
        assert!(gate.allow(b).await);
    }

    #[test]
    fn period_windows() {
        assert!(period_window("24h").is_ok());
        assert!(period_window("7d").is_ok());
        assert!(period_window("30d").is_ok());
        let (window, label) = period_window("all").unwrap();
        assert!(window.is_none());
        assert_eq!(label, "All time");
        assert!(period_window("90d").is_err());
    }

    #[test]
    fn percent_change_handles_zero_baseline() {
        assert_eq!(percent_change(10, 0), None);
        assert_eq!(percent_change(150, 100), Some(50.0));
        assert_eq!(percent_change(50, 100), Some(-50.0));
    }

    #[test]
    fn issue_derivation() {
        let run = RunRow {
            id: Uuid::new_v4(),
            subscription_id: "s1".to_string(),
            trigger_type: "scheduled".to_string(),
            status: "running".to_string(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            current_stage: Some("collection".to_string()),
            progress_percent: 10,
            progress_detail: String::new(),
            checkpoint: None,
            jobs_collected: 0,
            jobs_after_dedup: 0,
            jobs_matched: 0,
            notifications_sent: 0,
            failed_stage: None,
            error_message: None,
            error_context: None,
            warnings: vec![],
        };
        let issues = run_issues(&run, 35, false);
        assert!(issues.iter().any(|i| i.contains("duration > 30 min")));
        assert!(issues.iter().any(|i| i.contains("no checkpoint")));
        assert!(issues.iter().any(|i| i.contains("lock missing")));
        assert!(issues.iter().any(|i| i.contains("stuck in collection")));

        let healthy = run_issues(&run, 2, true);
        assert!(healthy.is_empty());
    }

    #[test]
    fn pagination_clamps() {
        let params = PageParams {
            page: Some(0),
            limit: Some(100_000),
            status: None,
        };
        let (page, limit) = page_and_limit(&params, 100);
        assert_eq!(page, 1);
        assert_eq!(limit, 100);
    }
}
