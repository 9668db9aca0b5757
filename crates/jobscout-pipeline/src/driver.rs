//! Pipeline driver: executes the four stages for one subscription and
//! records checkpoints, warnings and failure context along the way.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use jobscout_agents::{CollectionRequest, QueryExpander};
use jobscout_core::normalize::{apply_subscription_filters, normalize_postings};
use jobscout_core::{
    hash, Error, ExpandedQueries, JobSource, RawPosting, Result, Stage, Subscription, TriggerType,
};
use jobscout_queue::{
    RunContext, SubscriptionLock, WorkQueues, PRIORITY_API_REQUEST, PRIORITY_SCHEDULED,
};
use jobscout_store::tracker::RunCounters;
use jobscout_store::{CounterField, RunTracker, Store};

use crate::batch::{AdaptiveBatchProcessor, BatchProgress};
use crate::notify::{NotificationEmitter, RetainedMatch};

/// Whether cross-subscription dedup runs before or after the top-N cap.
/// Filtering first guarantees up to the cap of genuinely new notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupOrder {
    #[default]
    FilterThenCap,
    CapThenFilter,
}

impl DedupOrder {
    pub fn parse(s: &str) -> Self {
        match s {
            "cap_then_filter" => DedupOrder::CapThenFilter,
            _ => DedupOrder::FilterThenCap,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub lock_ttl: Duration,
    pub results_per_search: u32,
    pub notify_cap: usize,
    pub dedup_order: DedupOrder,
    pub source: JobSource,
    pub checkpoint_every: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30 * 60),
            results_per_search: 50,
            notify_cap: 10,
            dedup_order: DedupOrder::FilterThenCap,
            source: JobSource::Serpapi,
            checkpoint_every: 50,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub matches_found: usize,
    pub notifications_sent: usize,
    pub jobs_processed: usize,
    pub stats: serde_json::Value,
}

/// Where the run currently is, kept for failure context.
struct StageCursor {
    stage: Stage,
    titles: Vec<String>,
    current_location: Option<String>,
    counters: RunCounters,
    offending_job: Option<serde_json::Value>,
}

pub struct PipelineDriver {
    store: Store,
    tracker: RunTracker,
    queues: Arc<WorkQueues>,
    lock: Arc<SubscriptionLock>,
    expander: Arc<QueryExpander>,
    emitter: Arc<NotificationEmitter>,
    batch: AdaptiveBatchProcessor,
    config: PipelineConfig,
}

impl PipelineDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        tracker: RunTracker,
        queues: Arc<WorkQueues>,
        lock: Arc<SubscriptionLock>,
        expander: Arc<QueryExpander>,
        emitter: Arc<NotificationEmitter>,
        batch: AdaptiveBatchProcessor,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            tracker,
            queues,
            lock,
            expander,
            emitter,
            batch,
            config,
        }
    }

    /// Drive one run to a terminal status. The caller must already hold the
    /// subscription lock under `run_id` and have started the run row.
    ///
    /// Cancellation yields `Ok` with a report of the partial work; any
    /// other error is recorded on the run and rethrown so the scheduler can
    /// log it without stopping other subscriptions.
    pub async fn run(
        &self,
        sub: &Subscription,
        trigger: TriggerType,
        run_id: Uuid,
    ) -> Result<RunReport> {
        let mut cursor = StageCursor {
            stage: Stage::Expansion,
            titles: sub.job_titles.clone(),
            current_location: None,
            counters: RunCounters::default(),
            offending_job: None,
        };

        match self.execute(sub, trigger, run_id, &mut cursor).await {
            Ok(report) => {
                if let Err(e) = self
                    .tracker
                    .complete(run_id, &sub.id, cursor.counters)
                    .await
                {
                    warn!(%run_id, "failed to record completion: {e}");
                }
                Ok(report)
            }
            Err(Error::Cancelled) => {
                info!(%run_id, subscription_id = %sub.id, "run cancelled");
                if let Err(e) = self.tracker.cancel(run_id, &sub.id).await {
                    warn!(%run_id, "failed to record cancellation: {e}");
                }
                if let Err(e) = self.lock.release(&sub.id, run_id).await {
                    warn!(%run_id, "lock release after cancel failed: {e}");
                }
                Ok(RunReport {
                    matches_found: 0,
                    notifications_sent: 0,
                    jobs_processed: cursor.counters.jobs_after_dedup as usize,
                    stats: json!({ "cancelled": true }),
                })
            }
            Err(e) => {
                let context = json!({
                    "stage": cursor.stage.as_str(),
                    "titles": cursor.titles,
                    "location": cursor.current_location,
                    "partial_counters": {
                        "jobs_collected": cursor.counters.jobs_collected,
                        "jobs_after_dedup": cursor.counters.jobs_after_dedup,
                        "jobs_matched": cursor.counters.jobs_matched,
                        "notifications_sent": cursor.counters.notifications_sent,
                    },
                    "offending_job": cursor.offending_job,
                });
                if let Err(te) = self
                    .tracker
                    .fail(run_id, &sub.id, Some(cursor.stage), &e.to_string(), context)
                    .await
                {
                    warn!(%run_id, "failed to record failure: {te}");
                }
                if let Err(le) = self.lock.release(&sub.id, run_id).await {
                    warn!(%run_id, "lock release after failure failed: {le}");
                }
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        sub: &Subscription,
        trigger: TriggerType,
        run_id: Uuid,
        cursor: &mut StageCursor,
    ) -> Result<RunReport> {
        let ctx = RunContext::for_run(run_id, sub.id.clone());
        let priority = match trigger {
            TriggerType::Manual => PRIORITY_API_REQUEST,
            TriggerType::Scheduled | TriggerType::Initial => PRIORITY_SCHEDULED,
        };

        // --- Stage 1: expansion (0-5%) ---
        self.enter_stage(sub, run_id, cursor, Stage::Expansion, 0, "expanding queries")
            .await?;
        let effective_titles = self.expand_titles(sub, run_id).await?;
        cursor.titles = effective_titles.clone();

        // --- Stage 2: collection (5-55%) ---
        self.enter_stage(sub, run_id, cursor, Stage::Collection, 5, "collecting postings")
            .await?;
        let raw = self
            .collect_postings(sub, run_id, cursor, &effective_titles, priority, &ctx)
            .await?;
        let raw_count = raw.len();
        cursor.counters.jobs_collected = raw_count as i32;
        self.tracker
            .add_counter(run_id, CounterField::JobsCollected, raw_count as i32)
            .await
            .ok();

        // --- Stage 3: normalization (55-60%) ---
        self.enter_stage(
            sub,
            run_id,
            cursor,
            Stage::Normalization,
            55,
            "normalizing and filtering",
        )
        .await?;
        let unique = normalize_postings(raw, self.config.source);
        let unique_count = unique.len();
        self.tracker
            .save_checkpoint(
                run_id,
                json!({
                    "stage": "post-collection",
                    "raw_count": raw_count,
                    "unique_count": unique_count,
                }),
            )
            .await
            .ok();
        let (filtered, filter_stats) = apply_subscription_filters(unique, sub);
        cursor.counters.jobs_after_dedup = filtered.len() as i32;
        self.tracker
            .add_counter(run_id, CounterField::JobsAfterDedup, filtered.len() as i32)
            .await
            .ok();
        info!(
            %run_id,
            raw = raw_count,
            unique = unique_count,
            filtered = filtered.len(),
            "normalization done"
        );

        // --- Stage 4: matching (60-90%) ---
        self.enter_stage(sub, run_id, cursor, Stage::Matching, 60, "scoring jobs")
            .await?;
        let jobs_processed = filtered.len();
        let results = {
            let (progress_tx, progress_rx) = mpsc::channel::<BatchProgress>(16);
            let forwarder = self.spawn_progress_forwarder(run_id, sub.id.clone(), progress_rx);
            let outcome = self
                .batch
                .process(
                    filtered,
                    &sub.resume_text,
                    &sub.resume_hash,
                    priority,
                    ctx.clone(),
                    progress_tx,
                )
                .await;
            forwarder.await.ok();
            outcome?
        };
        let scored = results.iter().filter(|r| r.outcome.is_ok()).count();
        cursor.counters.jobs_matched = scored as i32;
        self.tracker
            .add_counter(run_id, CounterField::JobsMatched, scored as i32)
            .await
            .ok();
        if let Some(bad) = results.iter().find(|r| {
            matches!(r.outcome, Err(Error::Fatal(_)))
        }) {
            cursor.offending_job = Some(json!({
                "content_hash": bad.job.content_hash,
                "title": bad.job.title,
                "company": bad.job.company,
            }));
        }

        let mut retained: Vec<RetainedMatch> = results
            .into_iter()
            .filter_map(|r| {
                let scored = r.outcome.ok()?;
                (scored.verdict.score >= sub.min_score).then(|| RetainedMatch {
                    job: r.job,
                    job_match_id: scored.job_match_id,
                    verdict: scored.verdict,
                })
            })
            .collect();
        retained.sort_by(|a, b| b.verdict.score.cmp(&a.verdict.score));
        let matches_found = retained.len();

        // --- Stage 5: notification (90-100%) ---
        // A cancelled run must never partial-commit notifications.
        self.enter_stage(
            sub,
            run_id,
            cursor,
            Stage::Notification,
            90,
            "delivering notifications",
        )
        .await?;
        let notifications_sent = self
            .notify(sub, run_id, cursor, retained)
            .await?;

        Ok(RunReport {
            matches_found,
            notifications_sent,
            jobs_processed,
            stats: json!({
                "raw_count": raw_count,
                "unique_count": unique_count,
                "rejected_by_title": filter_stats.excluded_title,
                "rejected_by_company": filter_stats.excluded_company,
                "rejected_by_location": filter_stats.location,
                "effective_titles": effective_titles.len(),
            }),
        })
    }

    /// Stage transition bookkeeping: cancel check, lock refresh, stage row.
    async fn enter_stage(
        &self,
        sub: &Subscription,
        run_id: Uuid,
        cursor: &mut StageCursor,
        stage: Stage,
        percent: i32,
        detail: &str,
    ) -> Result<()> {
        if self.queues.run_cancelled(Some(run_id)).await {
            return Err(Error::Cancelled);
        }
        cursor.stage = stage;
        match self.lock.refresh(&sub.id, run_id, self.config.lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(%run_id, subscription_id = %sub.id, "lock missing at stage transition");
            }
            Err(e) => warn!(%run_id, "lock refresh failed: {e}"),
        }
        self.tracker
            .set_stage(run_id, &sub.id, stage, percent, detail)
            .await
            .map_err(|e| Error::Fatal(format!("tracker update failed: {e}")))?;
        Ok(())
    }

    async fn expand_titles(&self, sub: &Subscription, run_id: Uuid) -> Result<Vec<String>> {
        // The limited scraper rate-limits easily; stick to the original
        // titles there.
        if self.config.source == JobSource::Scraper {
            return Ok(sub.job_titles.clone());
        }

        let cache_key = hash::expansion_cache_key(&sub.job_titles, &sub.resume_text);
        let expanded = match self
            .store
            .expansion_cache_get(&cache_key)
            .await
            .map_err(|e| Error::Fatal(format!("expansion cache read failed: {e}")))?
        {
            Some(cached) => cached,
            None => match self.expander.expand(&sub.job_titles, &sub.resume_text).await {
                Ok(fresh) => {
                    self.store
                        .expansion_cache_put(&cache_key, &sub.job_titles, &fresh)
                        .await
                        .ok();
                    fresh
                }
                Err(e) => {
                    warn!(%run_id, "query expansion failed, using original titles: {e}");
                    self.tracker
                        .add_warning(run_id, &format!("query expansion failed: {e}"))
                        .await
                        .ok();
                    ExpandedQueries::default()
                }
            },
        };
        Ok(merge_titles(&sub.job_titles, &expanded))
    }

    async fn collect_postings(
        &self,
        sub: &Subscription,
        run_id: Uuid,
        cursor: &mut StageCursor,
        titles: &[String],
        priority: i64,
        ctx: &RunContext,
    ) -> Result<Vec<RawPosting>> {
        let physical: Vec<_> = sub.physical_locations().cloned().collect();
        let has_remote = sub.remote_locations().next().is_some();
        let remote_country = derive_remote_country(sub);
        let job_type = (sub.job_types.len() == 1).then(|| sub.job_types[0]);

        let mut targets: Vec<(Option<String>, Option<String>, Option<bool>)> = physical
            .iter()
            .map(|loc| (Some(loc.display.clone()), loc.country.clone(), None))
            .collect();
        if has_remote {
            targets.push((None, remote_country, Some(true)));
        }
        if targets.is_empty() {
            self.tracker
                .add_warning(run_id, "subscription has no searchable locations")
                .await
                .ok();
            return Ok(Vec::new());
        }

        let total_searches = titles.len() * targets.len();
        let mut raw = Vec::new();
        let mut done = 0usize;
        for title in titles {
            for (location, country, is_remote) in &targets {
                if self.queues.run_cancelled(Some(run_id)).await {
                    return Err(Error::Cancelled);
                }
                cursor.current_location =
                    location.clone().or_else(|| Some("remote".to_string()));
                let request = CollectionRequest {
                    query: title.clone(),
                    location: location.clone(),
                    country: country.clone(),
                    is_remote: *is_remote,
                    job_type,
                    date_posted: sub.date_posted,
                    source: self.config.source,
                    limit: self.config.results_per_search,
                    skip_cache: sub.debug_mode,
                };
                match self
                    .queues
                    .enqueue_collection(request, priority, ctx.clone())
                    .await
                {
                    Ok(mut postings) => raw.append(&mut postings),
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e @ Error::QueueUnavailable(_)) => return Err(e),
                    Err(e) => {
                        warn!(
                            %run_id,
                            title,
                            location = cursor.current_location.as_deref().unwrap_or("remote"),
                            "collection failed: {e}"
                        );
                        self.tracker
                            .add_warning(
                                run_id,
                                &format!(
                                    "collection failed for '{}' ({}): {}",
                                    title,
                                    cursor.current_location.as_deref().unwrap_or("remote"),
                                    e
                                ),
                            )
                            .await
                            .ok();
                    }
                }
                done += 1;
                let percent = 5 + (50 * done / total_searches) as i32;
                self.tracker
                    .set_stage(
                        run_id,
                        &sub.id,
                        Stage::Collection,
                        percent,
                        &format!("{} postings ({done}/{total_searches} searches)", raw.len()),
                    )
                    .await
                    .ok();
            }
        }
        cursor.current_location = None;
        Ok(raw)
    }

    fn spawn_progress_forwarder(
        &self,
        run_id: Uuid,
        subscription_id: String,
        mut rx: mpsc::Receiver<BatchProgress>,
    ) -> tokio::task::JoinHandle<()> {
        let tracker = self.tracker.clone();
        let checkpoint_every = self.config.checkpoint_every;
        tokio::spawn(async move {
            let mut last_checkpoint = 0usize;
            while let Some(p) = rx.recv().await {
                let percent = if p.total > 0 {
                    60 + (30 * p.processed / p.total) as i32
                } else {
                    90
                };
                tracker
                    .set_stage(
                        run_id,
                        &subscription_id,
                        Stage::Matching,
                        percent,
                        &format!("scored {}/{} jobs", p.processed, p.total),
                    )
                    .await
                    .ok();
                if p.processed - last_checkpoint >= checkpoint_every {
                    last_checkpoint = p.processed;
                    tracker
                        .save_checkpoint(
                            run_id,
                            json!({ "stage": "matching", "processed": p.processed }),
                        )
                        .await
                        .ok();
                }
            }
        })
    }

    async fn notify(
        &self,
        sub: &Subscription,
        run_id: Uuid,
        cursor: &mut StageCursor,
        retained: Vec<RetainedMatch>,
    ) -> Result<usize> {
        if retained.is_empty() {
            return Ok(0);
        }
        let user = self
            .store
            .get_user(&sub.user_id)
            .await
            .map_err(|e| Error::Fatal(format!("user lookup failed: {e}")))?
            .ok_or_else(|| Error::Fatal(format!("user {} missing", sub.user_id)))?;

        let candidate_ids: Vec<Uuid> = retained.iter().map(|m| m.job_match_id).collect();
        let already_sub: HashSet<Uuid> = self
            .store
            .sent_for_subscription(&sub.id, &candidate_ids)
            .await
            .map_err(|e| Error::Fatal(format!("sent-ledger lookup failed: {e}")))?
            .into_iter()
            .collect();
        let already_cross: HashSet<Uuid> = if user.skip_cross_sub_duplicates {
            self.store
                .sent_for_user(&user.id, &candidate_ids)
                .await
                .map_err(|e| Error::Fatal(format!("cross-sub ledger lookup failed: {e}")))?
                .into_iter()
                .collect()
        } else {
            HashSet::new()
        };

        let to_send = select_notifications(
            retained,
            &already_sub,
            &already_cross,
            user.skip_cross_sub_duplicates,
            self.config.dedup_order,
            self.config.notify_cap,
        );
        if to_send.is_empty() {
            return Ok(0);
        }

        let reports = self.emitter.deliver(&user.chat_id, &to_send).await;
        let mut sent = 0usize;
        for report in reports {
            if !report.delivered {
                continue;
            }
            match self.store.record_sent(&sub.id, report.job_match_id).await {
                Ok(true) => {
                    sent += 1;
                    self.tracker
                        .add_counter(run_id, CounterField::NotificationsSent, 1)
                        .await
                        .ok();
                }
                Ok(false) => {
                    // Ledger row already existed: a concurrent duplicate
                    // delivered first; do not count it twice.
                    warn!(%run_id, job_match_id = %report.job_match_id, "duplicate send detected");
                }
                Err(e) => {
                    return Err(Error::Fatal(format!("sent-ledger insert failed: {e}")));
                }
            }
        }
        cursor.counters.notifications_sent = sent as i32;
        Ok(sent)
    }
}

/// Deduped union of original, expanded and resume-suggested titles,
/// preserving the original order.
pub fn merge_titles(original: &[String], expanded: &ExpandedQueries) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for title in original
        .iter()
        .chain(expanded.expanded_titles.iter())
        .chain(expanded.resume_suggested_titles.iter())
    {
        let key = title.trim().to_lowercase();
        if key.is_empty() || !seen.insert(key) {
            continue;
        }
        out.push(title.trim().to_string());
    }
    out
}

/// Country for the remote search: only when all remote locations agree.
pub fn derive_remote_country(sub: &Subscription) -> Option<String> {
    let mut countries = sub.remote_locations().map(|l| l.country.as_deref());
    let first = countries.next()??;
    for country in countries {
        if country != Some(first) {
            return None;
        }
    }
    Some(first.to_string())
}

/// Apply the ledger filters and the top-N cap in the configured order. The
/// input must already be sorted by score descending.
pub fn select_notifications(
    retained: Vec<RetainedMatch>,
    already_sub: &HashSet<Uuid>,
    already_cross: &HashSet<Uuid>,
    skip_cross: bool,
    order: DedupOrder,
    cap: usize,
) -> Vec<RetainedMatch> {
    let fresh: Vec<RetainedMatch> = retained
        .into_iter()
        .filter(|m| !already_sub.contains(&m.job_match_id))
        .collect();
    match order {
        DedupOrder::FilterThenCap => {
            let mut out: Vec<RetainedMatch> = fresh
                .into_iter()
                .filter(|m| !skip_cross || !already_cross.contains(&m.job_match_id))
                .collect();
            out.truncate(cap);
            out
        }
        DedupOrder::CapThenFilter => {
            let mut capped = fresh;
            capped.truncate(cap);
            capped
                .into_iter()
                .filter(|m| !skip_cross || !already_cross.contains(&m.job_match_id))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobscout_core::{DatePosted, Job, LocationKind, MatchVerdict, NormalizedLocation};

    fn sub_with_remotes(countries: &[Option<&str>]) -> Subscription {
        Subscription {
            id: "s1".to_string(),
            user_id: "u1".to_string(),
            job_titles: vec!["Backend Engineer".to_string()],
            locations: countries
                .iter()
                .map(|c| NormalizedLocation {
                    display: "Remote".to_string(),
                    kind: LocationKind::Remote,
                    country: c.map(str::to_string),
                    city: None,
                    state: None,
                    search_variants: vec![],
                })
                .collect(),
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
        }
    }

    fn retained(id: u128, score: i32) -> RetainedMatch {
        RetainedMatch {
            job: Job {
                content_hash: format!("h{id}"),
                title: "T".to_string(),
                company: "C".to_string(),
                description: String::new(),
                location: None,
                is_remote: true,
                salary_min: None,
                salary_max: None,
                salary_currency: None,
                application_url: String::new(),
                source: JobSource::Serpapi,
                source_id: None,
                posted_date: None,
            },
            job_match_id: Uuid::from_u128(id),
            verdict: MatchVerdict {
                score,
                reasoning: String::new(),
                matched_skills: vec![],
                missing_skills: vec![],
                pros: vec![],
                cons: vec![],
            },
        }
    }

    #[test]
    fn merge_preserves_original_order_and_dedups() {
        let original = vec!["Backend Engineer".to_string(), "SRE".to_string()];
        let expanded = ExpandedQueries {
            expanded_titles: vec![
                "backend engineer".to_string(),
                "Platform Engineer".to_string(),
            ],
            resume_suggested_titles: vec!["SRE".to_string(), "DevOps Engineer".to_string()],
        };
        let merged = merge_titles(&original, &expanded);
        assert_eq!(
            merged,
            vec!["Backend Engineer", "SRE", "Platform Engineer", "DevOps Engineer"]
        );
    }

    #[test]
    fn remote_country_requires_agreement() {
        assert_eq!(
            derive_remote_country(&sub_with_remotes(&[Some("Canada"), Some("Canada")])),
            Some("Canada".to_string())
        );
        assert_eq!(
            derive_remote_country(&sub_with_remotes(&[Some("Canada"), Some("Germany")])),
            None
        );
        assert_eq!(
            derive_remote_country(&sub_with_remotes(&[Some("Canada"), None])),
            None
        );
        assert_eq!(derive_remote_country(&sub_with_remotes(&[])), None);
    }

    #[test]
    fn per_subscription_ledger_always_filters() {
        let already: HashSet<Uuid> = [Uuid::from_u128(1)].into_iter().collect();
        let out = select_notifications(
            vec![retained(1, 90), retained(2, 80)],
            &already,
            &HashSet::new(),
            false,
            DedupOrder::FilterThenCap,
            10,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].job_match_id, Uuid::from_u128(2));
    }

    #[test]
    fn filter_then_cap_fills_the_cap_with_new_matches() {
        // Twelve candidates, three already sent cross-sub. Filtering first
        // still yields a full cap of ten.
        let matches: Vec<RetainedMatch> = (1..=13).map(|i| retained(i, 100 - i as i32)).collect();
        let cross: HashSet<Uuid> = [1u128, 2, 3].into_iter().map(Uuid::from_u128).collect();
        let out = select_notifications(
            matches,
            &HashSet::new(),
            &cross,
            true,
            DedupOrder::FilterThenCap,
            10,
        );
        assert_eq!(out.len(), 10);
        assert!(out.iter().all(|m| !cross.contains(&m.job_match_id)));
    }

    #[test]
    fn cap_then_filter_may_undershoot() {
        let matches: Vec<RetainedMatch> = (1..=13).map(|i| retained(i, 100 - i as i32)).collect();
        let cross: HashSet<Uuid> = [1u128, 2, 3].into_iter().map(Uuid::from_u128).collect();
        let out = select_notifications(
            matches,
            &HashSet::new(),
            &cross,
            true,
            DedupOrder::CapThenFilter,
            10,
        );
        // The legacy order strips duplicates after capping and shows fewer.
        assert_eq!(out.len(), 7);
    }

    #[test]
    fn cross_filter_ignored_unless_opted_in() {
        let cross: HashSet<Uuid> = [1u128].into_iter().map(Uuid::from_u128).collect();
        let out = select_notifications(
            vec![retained(1, 90)],
            &HashSet::new(),
            &cross,
            false,
            DedupOrder::FilterThenCap,
            10,
        );
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn dedup_order_parsing_defaults_to_filter_then_cap() {
        assert_eq!(DedupOrder::parse("cap_then_filter"), DedupOrder::CapThenFilter);
        assert_eq!(DedupOrder::parse("filter_then_cap"), DedupOrder::FilterThenCap);
        assert_eq!(DedupOrder::parse("bogus"), DedupOrder::FilterThenCap);
    }
}
