//! Row types and response-shaping structs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use jobscout_core::{
    DatePosted, JobType, MatchVerdict, NormalizedLocation, Subscription, User,
};

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: String,
    pub chat_id: String,
    pub handle: String,
    pub skip_cross_sub_duplicates: bool,
}

impl UserRow {
    pub fn into_domain(self) -> User {
        User {
            id: self.id,
            chat_id: self.chat_id,
            handle: self.handle,
            skip_cross_sub_duplicates: self.skip_cross_sub_duplicates,
        }
    }
}

/// User list entry with subscription counts.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct UserSummary {
    pub id: String,
    pub handle: String,
    pub chat_id: String,
    pub active_subscriptions: i64,
    pub total_subscriptions: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SubscriptionRow {
    pub id: String,
    pub user_id: String,
    pub job_titles: Vec<String>,
    pub locations: serde_json::Value,
    pub job_types: Vec<String>,
    pub min_score: i32,
    pub date_posted: String,
    pub excluded_titles: Vec<String>,
    pub excluded_companies: Vec<String>,
    pub resume_text: String,
    pub resume_hash: String,
    pub is_active: bool,
    pub is_paused: bool,
    pub debug_mode: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_search_at: Option<DateTime<Utc>>,
}

impl SubscriptionRow {
    pub fn into_domain(self) -> Subscription {
        let locations: Vec<NormalizedLocation> =
            serde_json::from_value(self.locations).unwrap_or_default();
        let job_types = self
            .job_types
            .iter()
            .filter_map(|t| serde_json::from_value(serde_json::Value::String(t.clone())).ok())
            .collect::<Vec<JobType>>();
        Subscription {
            id: self.id,
            user_id: self.user_id,
            job_titles: self.job_titles,
            locations,
            job_types,
            min_score: self.min_score,
            date_posted: DatePosted::parse(&self.date_posted).unwrap_or_default(),
            excluded_titles: self.excluded_titles,
            excluded_companies: self.excluded_companies,
            resume_text: self.resume_text,
            resume_hash: self.resume_hash,
            is_active: self.is_active,
            is_paused: self.is_paused,
            debug_mode: self.debug_mode,
            next_run_at: self.next_run_at,
            last_search_at: self.last_search_at,
        }
    }
}

/// Subscription list entry with a last-run snippet.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SubscriptionSummary {
    pub id: String,
    pub user_id: String,
    pub handle: String,
    pub job_titles: Vec<String>,
    pub min_score: i32,
    pub is_active: bool,
    pub is_paused: bool,
    pub debug_mode: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Full run row as persisted. Serialized directly in admin responses.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct RunRow {
    pub id: Uuid,
    pub subscription_id: String,
    pub trigger_type: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub current_stage: Option<String>,
    pub progress_percent: i32,
    pub progress_detail: String,
    pub checkpoint: Option<serde_json::Value>,
    pub jobs_collected: i32,
    pub jobs_after_dedup: i32,
    pub jobs_matched: i32,
    pub notifications_sent: i32,
    pub failed_stage: Option<String>,
    pub error_message: Option<String>,
    pub error_context: Option<serde_json::Value>,
    pub warnings: Vec<String>,
}

/// A previously scored match pulled from the cache in one batch query.
#[derive(Debug, Clone, FromRow)]
pub struct CachedMatch {
    pub id: Uuid,
    pub content_hash: String,
    pub score: i32,
    pub reasoning: String,
    pub matched_skills: Vec<String>,
    pub missing_skills: Vec<String>,
    pub pros: Vec<String>,
    pub cons: Vec<String>,
}

impl CachedMatch {
    pub fn verdict(&self) -> MatchVerdict {
        MatchVerdict {
            score: self.score,
            reasoning: self.reasoning.clone(),
            matched_skills: self.matched_skills.clone(),
            missing_skills: self.missing_skills.clone(),
            pros: self.pros.clone(),
            cons: self.cons.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct BroadcastRow {
    pub id: Uuid,
    pub message: String,
    pub status: String,
    pub sent_count: i32,
    pub failed_count: i32,
    pub created_at: DateTime<Utc>,
}

/// Aggregate activity for the overview endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ActivityCounts {
    pub jobs_scanned: i64,
    pub matches_found: i64,
    pub notifications_sent: i64,
    pub total_runs: i64,
    pub failed_runs: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SkillStat {
    pub skill: String,
    pub count: i64,
}

/// Standard pagination envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub pages: i64,
}

impl Pagination {
    pub fn new(page: i64, limit: i64, total: i64) -> Self {
        let pages = if limit > 0 {
            (total + limit - 1) / limit
        } else {
            0
        };
        Self {
            page,
            limit,
            total,
            pages,
        }
    }
}
