//! Client for the external scraping service.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use jobscout_core::{hash, DatePosted, Error, JobSource, JobType, RawPosting, Result};

/// One collection request, as carried in queue payloads. The cache key over
/// these fields drives both the in-flight dedup cache and the persisted
/// query-result cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionRequest {
    pub query: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub is_remote: Option<bool>,
    #[serde(default)]
    pub job_type: Option<JobType>,
    pub date_posted: DatePosted,
    pub source: JobSource,
    pub limit: u32,
    #[serde(default)]
    pub skip_cache: bool,
}

impl CollectionRequest {
    pub fn cache_key(&self) -> String {
        hash::collection_cache_key(
            &self.query,
            self.location.as_deref(),
            self.is_remote,
            self.job_type,
            self.date_posted,
            self.source,
            self.limit,
        )
    }
}

#[derive(Serialize)]
struct ScrapeBody<'a> {
    search_term: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    country: Option<&'a str>,
    site_name: &'a [&'a str],
    results_wanted: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_remote: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hours_old: Option<u32>,
}

#[derive(Deserialize)]
struct ScrapeResponse {
    #[serde(default)]
    jobs: Vec<RawPosting>,
}

pub struct ScraperClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ScraperClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }

    fn sites(source: JobSource) -> &'static [&'static str] {
        match source {
            JobSource::Serpapi => &["google"],
            JobSource::Scraper => &["linkedin", "indeed"],
        }
    }

    /// Collect postings for one request.
    ///
    /// The scrape endpoint cannot combine `hours_old` with `job_type` or
    /// `is_remote`, so when both are needed we issue two scrapes and keep
    /// the intersection by job URL.
    pub async fn collect(&self, req: &CollectionRequest) -> Result<Vec<RawPosting>> {
        let hours_old = req.date_posted.hours_old();
        let has_type_filter = req.job_type.is_some() || req.is_remote.is_some();

        if let (Some(hours), true) = (hours_old, has_type_filter) {
            let by_age = self
                .scrape(ScrapeBody {
                    search_term: &req.query,
                    location: req.location.as_deref(),
                    country: req.country.as_deref(),
                    site_name: Self::sites(req.source),
                    results_wanted: req.limit,
                    is_remote: None,
                    job_type: None,
                    hours_old: Some(hours),
                })
                .await?;
            let by_filter = self
                .scrape(ScrapeBody {
                    search_term: &req.query,
                    location: req.location.as_deref(),
                    country: req.country.as_deref(),
                    site_name: Self::sites(req.source),
                    results_wanted: req.limit,
                    is_remote: req.is_remote,
                    job_type: req.job_type.map(|t| t.as_str()),
                    hours_old: None,
                })
                .await?;
            let urls: HashSet<&str> = by_filter.iter().map(|j| j.job_url.as_str()).collect();
            let merged: Vec<RawPosting> = by_age
                .into_iter()
                .filter(|j| urls.contains(j.job_url.as_str()))
                .collect();
            debug!(
                query = %req.query,
                merged = merged.len(),
                "intersected age and filter scrapes"
            );
            return Ok(merged);
        }

        self.scrape(ScrapeBody {
            search_term: &req.query,
            location: req.location.as_deref(),
            country: req.country.as_deref(),
            site_name: Self::sites(req.source),
            results_wanted: req.limit,
            is_remote: req.is_remote,
            job_type: req.job_type.map(|t| t.as_str()),
            hours_old,
        })
        .await
    }

    async fn scrape(&self, body: ScrapeBody<'_>) -> Result<Vec<RawPosting>> {
        let mut request = self
            .http
            .post(format!("{}/scrape", self.base_url))
            .timeout(Duration::from_secs(120))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Transient(format!("scrape request failed: {e}")))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::RateLimited(format!("scraper returned 429: {text}")));
        }
        if status.is_server_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Transient(format!("scraper returned {status}: {text}")));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::InvalidInput(format!(
                "scraper rejected request ({status}): {text}"
            )));
        }

        let parsed: ScrapeResponse = response
            .json()
            .await
            .map_err(|e| Error::Transient(format!("scrape response unreadable: {e}")))?;
        Ok(parsed.jobs)
    }

    /// Best-effort cancellation notice for cross-process log correlation.
    pub async fn notify_cancelled(&self, run_id: Uuid) {
        let result = self
            .http
            .post(format!("{}/notify", self.base_url))
            .timeout(Duration::from_secs(5))
            .json(&serde_json::json!({ "event": "run_cancelled", "run_id": run_id }))
            .send()
            .await;
        if let Err(e) = result {
            warn!(%run_id, "cancel notify failed (ignored): {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CollectionRequest {
        CollectionRequest {
            query: "backend engineer".to_string(),
            location: Some("Toronto".to_string()),
            country: Some("Canada".to_string()),
            is_remote: None,
            job_type: None,
            date_posted: DatePosted::Month,
            source: JobSource::Serpapi,
            limit: 50,
            skip_cache: false,
        }
    }

    #[test]
    fn cache_key_is_stable() {
        assert_eq!(request().cache_key(), request().cache_key());
        assert_eq!(request().cache_key().len(), 16);
    }

    #[test]
    fn cache_key_ignores_skip_cache_flag() {
        let mut skipped = request();
        skipped.skip_cache = true;
        assert_eq!(request().cache_key(), skipped.cache_key());
    }

    #[test]
    fn scrape_body_omits_absent_fields() {
        let body = ScrapeBody {
            search_term: "rust developer",
            location: None,
            country: None,
            site_name: &["linkedin"],
            results_wanted: 20,
            is_remote: None,
            job_type: None,
            hours_old: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["search_term"], "rust developer");
        assert!(json.get("location").is_none());
        assert!(json.get("hours_old").is_none());
        assert!(json.get("job_type").is_none());
    }

    #[test]
    fn scrape_body_carries_hours_old() {
        let body = ScrapeBody {
            search_term: "rust developer",
            location: Some("Berlin"),
            country: Some("Germany"),
            site_name: &["google"],
            results_wanted: 20,
            is_remote: None,
            job_type: None,
            hours_old: DatePosted::ThreeDays.hours_old(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["hours_old"], 72);
        assert_eq!(json["site_name"][0], "google");
    }
}
