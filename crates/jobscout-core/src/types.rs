//! Entity structs and the closed sum types persisted as short strings.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Status of a subscription run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses are permanent.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// What caused a run to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Scheduled,
    Manual,
    Initial,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Scheduled => "scheduled",
            TriggerType::Manual => "manual",
            TriggerType::Initial => "initial",
        }
    }
}

/// Pipeline stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Expansion,
    Collection,
    Normalization,
    Matching,
    Notification,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Expansion => "expansion",
            Stage::Collection => "collection",
            Stage::Normalization => "normalization",
            Stage::Matching => "matching",
            Stage::Notification => "notification",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "expansion" => Some(Stage::Expansion),
            "collection" => Some(Stage::Collection),
            "normalization" => Some(Stage::Normalization),
            "matching" => Some(Stage::Matching),
            "notification" => Some(Stage::Notification),
            _ => None,
        }
    }
}

/// Posting-age window of a subscription's searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DatePosted {
    #[serde(rename = "today")]
    Today,
    #[serde(rename = "3days")]
    ThreeDays,
    #[serde(rename = "week")]
    Week,
    #[default]
    #[serde(rename = "month")]
    Month,
    #[serde(rename = "all")]
    All,
}

impl DatePosted {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatePosted::Today => "today",
            DatePosted::ThreeDays => "3days",
            DatePosted::Week => "week",
            DatePosted::Month => "month",
            DatePosted::All => "all",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "today" => Some(DatePosted::Today),
            "3days" => Some(DatePosted::ThreeDays),
            "week" => Some(DatePosted::Week),
            "month" => Some(DatePosted::Month),
            "all" => Some(DatePosted::All),
            _ => None,
        }
    }

    /// Scraper-side `hours_old` parameter. `All` omits the field.
    pub fn hours_old(&self) -> Option<u32> {
        match self {
            DatePosted::Today => Some(24),
            DatePosted::ThreeDays => Some(72),
            DatePosted::Week => Some(168),
            DatePosted::Month => Some(720),
            DatePosted::All => None,
        }
    }
}

/// Employment type filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Fulltime,
    Parttime,
    Internship,
    Contract,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Fulltime => "fulltime",
            JobType::Parttime => "parttime",
            JobType::Internship => "internship",
            JobType::Contract => "contract",
        }
    }
}

/// Where a posting was collected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSource {
    Serpapi,
    Scraper,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::Serpapi => "serpapi",
            JobSource::Scraper => "scraper",
        }
    }
}

/// Physical vs. remote location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationKind {
    Physical,
    Remote,
}

/// A location the user searches in, with the variants the scraper accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedLocation {
    pub display: String,
    pub kind: LocationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default)]
    pub search_variants: Vec<String>,
}

/// An end user. Created on first interaction, never destroyed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub chat_id: String,
    pub handle: String,
    pub skip_cross_sub_duplicates: bool,
}

/// One saved search owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    pub job_titles: Vec<String>,
    pub locations: Vec<NormalizedLocation>,
    /// Empty means all job types.
    pub job_types: Vec<JobType>,
    pub min_score: i32,
    pub date_posted: DatePosted,
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

impl Subscription {
    /// Only eligible subscriptions are ever scheduled.
    pub fn is_eligible(&self) -> bool {
        self.is_active && !self.is_paused
    }

    pub fn remote_locations(&self) -> impl Iterator<Item = &NormalizedLocation> {
        self.locations
            .iter()
            .filter(|l| l.kind == LocationKind::Remote)
    }

    pub fn physical_locations(&self) -> impl Iterator<Item = &NormalizedLocation> {
        self.locations
            .iter()
            .filter(|l| l.kind == LocationKind::Physical)
    }
}

/// A raw posting as returned by a scraper, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPosting {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub is_remote: Option<bool>,
    #[serde(default)]
    pub min_amount: Option<f64>,
    #[serde(default)]
    pub max_amount: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub job_url: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub date_posted: Option<NaiveDate>,
}

/// A normalized posting. `content_hash` is its identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub content_hash: String,
    pub title: String,
    pub company: String,
    pub description: String,
    pub location: Option<String>,
    pub is_remote: bool,
    pub salary_min: Option<f64>,
    pub salary_max: Option<f64>,
    pub salary_currency: Option<String>,
    pub application_url: String,
    pub source: JobSource,
    pub source_id: Option<String>,
    pub posted_date: Option<NaiveDate>,
}

/// LLM scoring result for one job against one resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchVerdict {
    /// Integer score in [1, 100]. Fractional model output is rounded.
    pub score: i32,
    pub reasoning: String,
    #[serde(default)]
    pub matched_skills: Vec<String>,
    #[serde(default)]
    pub missing_skills: Vec<String>,
    #[serde(default)]
    pub pros: Vec<String>,
    #[serde(default)]
    pub cons: Vec<String>,
}

/// Query-expansion agent output, already capped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpandedQueries {
    pub expanded_titles: Vec<String>,
    pub resume_suggested_titles: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for s in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn date_posted_serde_uses_short_names() {
        let json = serde_json::to_string(&DatePosted::ThreeDays).unwrap();
        assert_eq!(json, r#""3days""#);
        let parsed: DatePosted = serde_json::from_str(r#""week""#).unwrap();
        assert_eq!(parsed, DatePosted::Week);
    }

    #[test]
    fn hours_old_mapping() {
        assert_eq!(DatePosted::Today.hours_old(), Some(24));
        assert_eq!(DatePosted::ThreeDays.hours_old(), Some(72));
        assert_eq!(DatePosted::Week.hours_old(), Some(168));
        assert_eq!(DatePosted::Month.hours_old(), Some(720));
        assert_eq!(DatePosted::All.hours_old(), None);
    }

    #[test]
    fn eligibility_requires_active_and_unpaused() {
        let mut sub = Subscription {
            id: "s1".to_string(),
            user_id: "u1".to_string(),
            job_titles: vec!["Backend Engineer".to_string()],
            locations: vec![],
            job_types: vec![],
            min_score: 60,
            date_posted: DatePosted::Month,
            excluded_titles: vec![],
            excluded_companies: vec![],
            resume_text: String::new(),
            resume_hash: String::new(),
            is_active: true,
            is_paused: false,
            debug_mode: false,
            next_run_at: None,
            last_search_at: None,
        };
        assert!(sub.is_eligible());
        sub.is_paused = true;
        assert!(!sub.is_eligible());
        sub.is_paused = false;
        sub.is_active = false;
        assert!(!sub.is_eligible());
    }
}
