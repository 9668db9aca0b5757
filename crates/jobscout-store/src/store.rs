//! Query layer over the PgPool. The relational store is the system of
//! record for runs, matches and the sent-notification ledger.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use jobscout_core::{ExpandedQueries, Job, MatchVerdict, Subscription, User};

use crate::models::{
    ActivityCounts, BroadcastRow, CachedMatch, RunRow, SkillStat, SubscriptionRow,
    SubscriptionSummary, UserRow, UserSummary,
};

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("failed to connect to database")?;
        Ok(Self { pool })
    }

    /// Build a store over a pool that connects on first use. Test-only paths
    /// and tools that never touch the database use this.
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_lazy(database_url)
            .context("invalid database URL")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // === Users ===

    pub async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, chat_id, handle, skip_cross_sub_duplicates FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UserRow::into_domain))
    }

    pub async fn list_users(&self, page: i64, limit: i64) -> Result<(Vec<UserSummary>, i64)> {
        let users: Vec<UserSummary> = sqlx::query_as(
            "SELECT u.id, u.handle, u.chat_id, u.created_at,
                    count(s.id) FILTER (WHERE s.is_active AND NOT s.is_paused) AS active_subscriptions,
                    count(s.id) AS total_subscriptions
             FROM users u
             LEFT JOIN subscriptions s ON s.user_id = u.id
             GROUP BY u.id
             ORDER BY u.created_at DESC
             LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind((page - 1) * limit)
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as("SELECT count(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok((users, total))
    }

    pub async fn count_users(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT count(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn all_user_chats(&self) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT id, chat_id FROM users")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    // === Subscriptions ===

    const SUBSCRIPTION_COLUMNS: &'static str =
        "id, user_id, job_titles, locations, job_types, min_score, date_posted,
         excluded_titles, excluded_companies, resume_text, resume_hash,
         is_active, is_paused, debug_mode, next_run_at, last_search_at";

    pub async fn get_subscription(&self, id: &str) -> Result<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            Self::SUBSCRIPTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SubscriptionRow::into_domain))
    }

    /// Eligible subscriptions whose `next_run_at` has passed, oldest first.
    pub async fn due_subscriptions(&self, limit: i64) -> Result<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions
             WHERE is_active AND NOT is_paused AND next_run_at <= now()
             ORDER BY next_run_at ASC
             LIMIT $1",
            Self::SUBSCRIPTION_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SubscriptionRow::into_domain).collect())
    }

    pub async fn subscriptions_for_user(&self, user_id: &str) -> Result<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 ORDER BY created_at",
            Self::SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SubscriptionRow::into_domain).collect())
    }

    pub async fn list_subscriptions(
        &self,
        page: i64,
        limit: i64,
        status: Option<&str>,
    ) -> Result<(Vec<SubscriptionSummary>, i64)> {
        let filter = match status {
            Some("active") => "WHERE s.is_active AND NOT s.is_paused",
            Some("paused") => "WHERE s.is_active AND s.is_paused",
            Some("inactive") => "WHERE NOT s.is_active",
            _ => "",
        };
        let subs: Vec<SubscriptionSummary> = sqlx::query_as(&format!(
            "SELECT s.id, s.user_id, u.handle, s.job_titles, s.min_score,
                    s.is_active, s.is_paused, s.debug_mode, s.next_run_at,
                    r.status AS last_run_status, r.started_at AS last_run_at
             FROM subscriptions s
             JOIN users u ON u.id = s.user_id
             LEFT JOIN LATERAL (
                 SELECT status, started_at FROM runs
                 WHERE subscription_id = s.id
                 ORDER BY started_at DESC LIMIT 1
             ) r ON TRUE
             {filter}
             ORDER BY s.created_at DESC
             LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind((page - 1) * limit)
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as(&format!(
            "SELECT count(*) FROM subscriptions s {filter}"
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok((subs, total))
    }

    pub async fn count_subscriptions(&self) -> Result<(i64, i64)> {
        let (total, active): (i64, i64) = sqlx::query_as(
            "SELECT count(*),
                    count(*) FILTER (WHERE is_active AND NOT is_paused)
             FROM subscriptions",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((total, active))
    }

    /// Returns false when the subscription does not exist.
    pub async fn set_debug_mode(&self, id: &str, enabled: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE subscriptions SET debug_mode = $2 WHERE id = $1")
            .bind(id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Post-run bookkeeping: schedule the next run and stamp the search time.
    pub async fn finalize_subscription_schedule(
        &self,
        id: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE subscriptions SET next_run_at = $2, last_search_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stuck-sweep recovery schedules a near-immediate retry.
    pub async fn reschedule_soon(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE subscriptions SET next_run_at = now() + interval '1 minute' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // === Jobs and matches ===

    /// Upsert a normalized posting. Preserves `first_seen_at`, refreshes
    /// `last_seen_at` and the mutable fields.
    pub async fn upsert_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs (content_hash, title, company, description, location, is_remote,
                               salary_min, salary_max, salary_currency, application_url,
                               source, source_id, posted_date)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             ON CONFLICT (content_hash) DO UPDATE SET
                 location = EXCLUDED.location,
                 salary_min = EXCLUDED.salary_min,
                 salary_max = EXCLUDED.salary_max,
                 salary_currency = EXCLUDED.salary_currency,
                 application_url = EXCLUDED.application_url,
                 posted_date = EXCLUDED.posted_date,
                 last_seen_at = now()",
        )
        .bind(&job.content_hash)
        .bind(&job.title)
        .bind(&job.company)
        .bind(&job.description)
        .bind(&job.location)
        .bind(job.is_remote)
        .bind(job.salary_min)
        .bind(job.salary_max)
        .bind(&job.salary_currency)
        .bind(&job.application_url)
        .bind(job.source.as_str())
        .bind(&job.source_id)
        .bind(job.posted_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert a match keyed by `(job_id, resume_hash)`, returning its id.
    pub async fn upsert_match(
        &self,
        content_hash: &str,
        resume_hash: &str,
        verdict: &MatchVerdict,
    ) -> Result<Uuid> {
        let score = verdict.score.clamp(1, 100);
        let (id,): (Uuid,) = sqlx::query_as(
            "INSERT INTO job_matches (job_id, resume_hash, score, reasoning,
                                      matched_skills, missing_skills, pros, cons)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (job_id, resume_hash) DO UPDATE SET
                 score = EXCLUDED.score,
                 reasoning = EXCLUDED.reasoning,
                 matched_skills = EXCLUDED.matched_skills,
                 missing_skills = EXCLUDED.missing_skills,
                 pros = EXCLUDED.pros,
                 cons = EXCLUDED.cons,
                 updated_at = now()
             RETURNING id",
        )
        .bind(content_hash)
        .bind(resume_hash)
        .bind(score)
        .bind(&verdict.reasoning)
        .bind(&verdict.matched_skills)
        .bind(&verdict.missing_skills)
        .bind(&verdict.pros)
        .bind(&verdict.cons)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Batch cache lookup: all matches for these jobs against one resume.
    pub async fn cached_matches(
        &self,
        content_hashes: &[String],
        resume_hash: &str,
    ) -> Result<Vec<CachedMatch>> {
        if content_hashes.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<CachedMatch> = sqlx::query_as(
            "SELECT id, job_id AS content_hash, score, reasoning,
                    matched_skills, missing_skills, pros, cons
             FROM job_matches
             WHERE resume_hash = $1 AND job_id = ANY($2)",
        )
        .bind(resume_hash)
        .bind(content_hashes)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn skill_stats(&self, resume_hash: &str, limit: i64) -> Result<Vec<SkillStat>> {
        let rows: Vec<SkillStat> = sqlx::query_as(
            "SELECT skill, count(*) AS count
             FROM job_matches, unnest(matched_skills) AS skill
             WHERE resume_hash = $1
             GROUP BY skill
             ORDER BY count DESC
             LIMIT $2",
        )
        .bind(resume_hash)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // === Sent-notification ledger ===

    /// Which of these match ids were already sent for this subscription.
    pub async fn sent_for_subscription(
        &self,
        subscription_id: &str,
        candidates: &[Uuid],
    ) -> Result<Vec<Uuid>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT job_match_id FROM sent_notifications
             WHERE subscription_id = $1 AND job_match_id = ANY($2)",
        )
        .bind(subscription_id)
        .bind(candidates)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Which of these match ids were already sent for *any* subscription of
    /// the user (cross-subscription dedup).
    pub async fn sent_for_user(&self, user_id: &str, candidates: &[Uuid]) -> Result<Vec<Uuid>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT n.job_match_id
             FROM sent_notifications n
             JOIN subscriptions s ON s.id = n.subscription_id
             WHERE s.user_id = $1 AND n.job_match_id = ANY($2)",
        )
        .bind(user_id)
        .bind(candidates)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Record a delivery. Returns false if a ledger row already existed, in
    /// which case the caller double-sent and must not count it again.
    pub async fn record_sent(&self, subscription_id: &str, job_match_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO sent_notifications (subscription_id, job_match_id)
             VALUES ($1, $2)
             ON CONFLICT (subscription_id, job_match_id) DO NOTHING",
        )
        .bind(subscription_id)
        .bind(job_match_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // === Query caches ===

    pub async fn expansion_cache_get(&self, cache_key: &str) -> Result<Option<ExpandedQueries>> {
        let row: Option<(Vec<String>, Vec<String>)> = sqlx::query_as(
            "SELECT expanded_titles, resume_suggested_titles
             FROM query_expansion_cache WHERE cache_key = $1",
        )
        .bind(cache_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(expanded_titles, resume_suggested_titles)| ExpandedQueries {
            expanded_titles,
            resume_suggested_titles,
        }))
    }

    pub async fn expansion_cache_put(
        &self,
        cache_key: &str,
        original_titles: &[String],
        expanded: &ExpandedQueries,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO query_expansion_cache
                 (cache_key, original_titles, expanded_titles, resume_suggested_titles)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (cache_key) DO UPDATE SET
                 expanded_titles = EXCLUDED.expanded_titles,
                 resume_suggested_titles = EXCLUDED.resume_suggested_titles",
        )
        .bind(cache_key)
        .bind(original_titles)
        .bind(&expanded.expanded_titles)
        .bind(&expanded.resume_suggested_titles)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn query_result_cache_put(
        &self,
        cache_key: &str,
        query: &str,
        job_count: i32,
        ttl_secs: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO query_result_cache (cache_key, query, job_count, expires_at)
             VALUES ($1, $2, $3, now() + ($4 || ' seconds')::interval)
             ON CONFLICT (cache_key) DO UPDATE SET
                 job_count = EXCLUDED.job_count,
                 expires_at = EXCLUDED.expires_at,
                 created_at = now()",
        )
        .bind(cache_key)
        .bind(query)
        .bind(job_count)
        .bind(ttl_secs.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fresh (unexpired) result-cache entry, if any.
    pub async fn query_result_cache_get(&self, cache_key: &str) -> Result<Option<i32>> {
        let row: Option<(i32,)> = sqlx::query_as(
            "SELECT job_count FROM query_result_cache
             WHERE cache_key = $1 AND expires_at > now()",
        )
        .bind(cache_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(n,)| n))
    }

    // === Runs (read side; writes live in the tracker) ===

    const RUN_COLUMNS: &'static str =
        "id, subscription_id, trigger_type, status, started_at, completed_at, duration_ms,
         current_stage, progress_percent, progress_detail, checkpoint,
         jobs_collected, jobs_after_dedup, jobs_matched, notifications_sent,
         failed_stage, error_message, error_context, warnings";

    pub async fn get_run(&self, id: Uuid) -> Result<Option<RunRow>> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            "SELECT {} FROM runs WHERE id = $1",
            Self::RUN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_runs(
        &self,
        page: i64,
        limit: i64,
        status: Option<&str>,
    ) -> Result<(Vec<RunRow>, i64)> {
        let filter = match status {
            Some(_) => "WHERE status = $3",
            None => "",
        };
        let sql = format!(
            "SELECT {} FROM runs {filter} ORDER BY started_at DESC LIMIT $1 OFFSET $2",
            Self::RUN_COLUMNS
        );
        let mut query = sqlx::query_as::<_, RunRow>(&sql)
            .bind(limit)
            .bind((page - 1) * limit);
        if let Some(status) = status {
            query = query.bind(status.to_string());
        }
        let runs = query.fetch_all(&self.pool).await?;

        let total: i64 = match status {
            Some(status) => {
                let (n,): (i64,) = sqlx::query_as("SELECT count(*) FROM runs WHERE status = $1")
                    .bind(status)
                    .fetch_one(&self.pool)
                    .await?;
                n
            }
            None => {
                let (n,): (i64,) = sqlx::query_as("SELECT count(*) FROM runs")
                    .fetch_one(&self.pool)
                    .await?;
                n
            }
        };
        Ok((runs, total))
    }

    pub async fn runs_for_subscription(&self, id: &str, limit: i64) -> Result<Vec<RunRow>> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {} FROM runs WHERE subscription_id = $1
             ORDER BY started_at DESC LIMIT $2",
            Self::RUN_COLUMNS
        ))
        .bind(id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn active_runs(&self) -> Result<Vec<RunRow>> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {} FROM runs WHERE status = 'running' ORDER BY started_at",
            Self::RUN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn recent_failures(&self, limit: i64) -> Result<Vec<RunRow>> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {} FROM runs WHERE status = 'failed'
             ORDER BY started_at DESC LIMIT $1",
            Self::RUN_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Runs that have been `running` since before the cutoff.
    pub async fn runs_running_since_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<RunRow>> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {} FROM runs WHERE status = 'running' AND started_at < $1",
            Self::RUN_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn activity_between(
        &self,
        from: Option<DateTime<Utc>>,
        to: DateTime<Utc>,
    ) -> Result<ActivityCounts> {
        let from = from.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let row: (Option<i64>, Option<i64>, Option<i64>, i64, i64) = sqlx::query_as(
            "SELECT sum(jobs_collected)::BIGINT,
                    sum(jobs_matched)::BIGINT,
                    sum(notifications_sent)::BIGINT,
                    count(*),
                    count(*) FILTER (WHERE status = 'failed')
             FROM runs WHERE started_at >= $1 AND started_at < $2",
        )
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;
        Ok(ActivityCounts {
            jobs_scanned: row.0.unwrap_or(0),
            matches_found: row.1.unwrap_or(0),
            notifications_sent: row.2.unwrap_or(0),
            total_runs: row.3,
            failed_runs: row.4,
        })
    }

    // === Broadcasts ===

    pub async fn create_broadcast(&self, message: &str) -> Result<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            "INSERT INTO broadcasts (message) VALUES ($1) RETURNING id",
        )
        .bind(message)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn list_broadcasts(&self, page: i64, limit: i64) -> Result<(Vec<BroadcastRow>, i64)> {
        let rows: Vec<BroadcastRow> = sqlx::query_as(
            "SELECT id, message, status, sent_count, failed_count, created_at
             FROM broadcasts ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind((page - 1) * limit)
        .fetch_all(&self.pool)
        .await?;
        let (total,): (i64,) = sqlx::query_as("SELECT count(*) FROM broadcasts")
            .fetch_one(&self.pool)
            .await?;
        Ok((rows, total))
    }

    pub async fn finish_broadcast(&self, id: Uuid, sent: i32, failed: i32) -> Result<()> {
        sqlx::query(
            "UPDATE broadcasts SET status = 'sent', sent_count = $2, failed_count = $3
             WHERE id = $1",
        )
        .bind(id)
        .bind(sent)
        .bind(failed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
