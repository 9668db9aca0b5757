//! Run Tracker — writes run lifecycle and progress to the relational
//! store and fans events out to dashboard subscribers.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use jobscout_core::{RunStatus, Stage, TriggerType};

use crate::store::Store;

/// Counter columns that support atomic increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterField {
    JobsCollected,
    JobsAfterDedup,
    JobsMatched,
    NotificationsSent,
}

impl CounterField {
    fn column(&self) -> &'static str {
        match self {
            CounterField::JobsCollected => "jobs_collected",
            CounterField::JobsAfterDedup => "jobs_after_dedup",
            CounterField::JobsMatched => "jobs_matched",
            CounterField::NotificationsSent => "notifications_sent",
        }
    }
}

/// One event on the live stream. The admin surface renders these without
/// re-polling the database.
#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub run_id: Uuid,
    pub subscription_id: String,
    pub status: RunStatus,
    pub stage: Option<Stage>,
    pub progress_percent: i32,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// Final counters reported on completion.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunCounters {
    pub jobs_collected: i32,
    pub jobs_after_dedup: i32,
    pub jobs_matched: i32,
    pub notifications_sent: i32,
}

#[derive(Clone)]
pub struct RunTracker {
    store: Store,
    events: broadcast::Sender<RunEvent>,
}

impl RunTracker {
    pub fn new(store: Store) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { store, events }
    }

    fn pool(&self) -> &PgPool {
        self.store.pool()
    }

    /// Subscribe to the live stream. Slow consumers lose old events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    fn emit(
        &self,
        run_id: Uuid,
        subscription_id: &str,
        status: RunStatus,
        stage: Option<Stage>,
        percent: i32,
        detail: &str,
    ) {
        // Send failures just mean nobody is watching.
        let _ = self.events.send(RunEvent {
            run_id,
            subscription_id: subscription_id.to_string(),
            status,
            stage,
            progress_percent: percent,
            detail: detail.to_string(),
            at: Utc::now(),
        });
    }

    /// Insert the run row. The caller supplies the run id so the
    /// per-subscription lock can be acquired under it beforehand.
    pub async fn start_run(
        &self,
        run_id: Uuid,
        subscription_id: &str,
        trigger_type: TriggerType,
    ) -> Result<Uuid> {
        sqlx::query(
            "INSERT INTO runs (id, subscription_id, trigger_type, status, started_at)
             VALUES ($1, $2, $3, 'running', now())",
        )
        .bind(run_id)
        .bind(subscription_id)
        .bind(trigger_type.as_str())
        .execute(self.pool())
        .await?;
        self.emit(run_id, subscription_id, RunStatus::Running, None, 0, "started");
        Ok(run_id)
    }

    /// Update stage and progress. The percent is clamped so progress never
    /// regresses, even if updates land out of order.
    pub async fn set_stage(
        &self,
        run_id: Uuid,
        subscription_id: &str,
        stage: Stage,
        percent: i32,
        detail: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE runs SET current_stage = $2,
                             progress_percent = GREATEST(progress_percent, $3),
                             progress_detail = $4
             WHERE id = $1 AND status = 'running'",
        )
        .bind(run_id)
        .bind(stage.as_str())
        .bind(percent.clamp(0, 100))
        .bind(detail)
        .execute(self.pool())
        .await?;
        debug!(%run_id, stage = stage.as_str(), percent, "stage update");
        self.emit(
            run_id,
            subscription_id,
            RunStatus::Running,
            Some(stage),
            percent,
            detail,
        );
        Ok(())
    }

    /// Persist an opaque recoverability blob. Advisory only; its presence is
    /// a liveness signal for the stuck-run sweep.
    pub async fn save_checkpoint(&self, run_id: Uuid, checkpoint: serde_json::Value) -> Result<()> {
        sqlx::query("UPDATE runs SET checkpoint = $2 WHERE id = $1")
            .bind(run_id)
            .bind(checkpoint)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn add_counter(&self, run_id: Uuid, field: CounterField, delta: i32) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE runs SET {col} = {col} + $2 WHERE id = $1",
            col = field.column()
        ))
        .bind(run_id)
        .bind(delta)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn add_warning(&self, run_id: Uuid, text: &str) -> Result<()> {
        sqlx::query("UPDATE runs SET warnings = array_append(warnings, $2) WHERE id = $1")
            .bind(run_id)
            .bind(text)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn complete(
        &self,
        run_id: Uuid,
        subscription_id: &str,
        counters: RunCounters,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE runs SET status = 'completed',
                             completed_at = now(),
                             duration_ms = (extract(epoch FROM now() - started_at) * 1000)::BIGINT,
                             progress_percent = 100,
                             current_stage = NULL,
                             jobs_collected = $2,
                             jobs_after_dedup = $3,
                             jobs_matched = $4,
                             notifications_sent = $5
             WHERE id = $1 AND status = 'running'",
        )
        .bind(run_id)
        .bind(counters.jobs_collected)
        .bind(counters.jobs_after_dedup)
        .bind(counters.jobs_matched)
        .bind(counters.notifications_sent)
        .execute(self.pool())
        .await?;
        self.emit(
            run_id,
            subscription_id,
            RunStatus::Completed,
            None,
            100,
            "completed",
        );
        Ok(())
    }

    pub async fn fail(
        &self,
        run_id: Uuid,
        subscription_id: &str,
        stage: Option<Stage>,
        error_message: &str,
        error_context: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE runs SET status = 'failed',
                             completed_at = now(),
                             duration_ms = (extract(epoch FROM now() - started_at) * 1000)::BIGINT,
                             failed_stage = $2,
                             error_message = $3,
                             error_context = $4
             WHERE id = $1 AND status = 'running'",
        )
        .bind(run_id)
        .bind(stage.map(|s| s.as_str()))
        .bind(error_message)
        .bind(error_context)
        .execute(self.pool())
        .await?;
        self.emit(
            run_id,
            subscription_id,
            RunStatus::Failed,
            stage,
            0,
            error_message,
        );
        Ok(())
    }

    /// Idempotent: only a `running` run can transition to cancelled; a
    /// second cancel (or a cancel after completion) is a no-op.
    pub async fn cancel(&self, run_id: Uuid, subscription_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE runs SET status = 'cancelled',
                             completed_at = now(),
                             duration_ms = (extract(epoch FROM now() - started_at) * 1000)::BIGINT
             WHERE id = $1 AND status = 'running'",
        )
        .bind(run_id)
        .execute(self.pool())
        .await?;
        let cancelled = result.rows_affected() > 0;
        if cancelled {
            self.emit(
                run_id,
                subscription_id,
                RunStatus::Cancelled,
                None,
                0,
                "cancelled",
            );
        }
        Ok(cancelled)
    }
}
