//! Posting normalization, deduplication and subscription filters.

use crate::hash::content_hash;
use crate::types::{Job, JobSource, RawPosting, Subscription};

const ZERO_WIDTH: [char; 4] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}'];

/// Collapse whitespace runs to single spaces and strip zero-width chars.
pub fn clean_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_space = false;
    for c in s.chars() {
        if ZERO_WIDTH.contains(&c) {
            continue;
        }
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out.trim().to_string()
}

/// Clean raw postings, compute content hashes, and deduplicate in place
/// preserving first-seen order.
pub fn normalize_postings(postings: Vec<RawPosting>, source: JobSource) -> Vec<Job> {
    let mut seen = std::collections::HashSet::new();
    let mut jobs = Vec::with_capacity(postings.len());
    for raw in postings {
        let title = clean_text(&raw.title);
        let company = clean_text(&raw.company);
        let description = clean_text(&raw.description);
        if title.is_empty() && company.is_empty() {
            continue;
        }
        let hash = content_hash(&title, &company, &description);
        if !seen.insert(hash.clone()) {
            continue;
        }
        jobs.push(Job {
            content_hash: hash,
            title,
            company,
            description,
            location: raw.location.map(|l| clean_text(&l)).filter(|l| !l.is_empty()),
            is_remote: raw.is_remote.unwrap_or(false),
            salary_min: raw.min_amount,
            salary_max: raw.max_amount,
            salary_currency: raw.currency,
            application_url: raw.job_url,
            source,
            source_id: raw.id,
            posted_date: raw.date_posted,
        });
    }
    jobs
}

/// Counts of postings rejected by each subscription filter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FilterStats {
    pub excluded_title: usize,
    pub excluded_company: usize,
    pub location: usize,
}

/// Apply the user's filters in order: excluded titles, excluded companies,
/// then location. Returns the surviving jobs and per-filter reject counts.
pub fn apply_subscription_filters(jobs: Vec<Job>, sub: &Subscription) -> (Vec<Job>, FilterStats) {
    let excluded_titles: Vec<String> =
        sub.excluded_titles.iter().map(|t| t.to_lowercase()).collect();
    let excluded_companies: Vec<String> = sub
        .excluded_companies
        .iter()
        .map(|c| c.to_lowercase())
        .collect();

    let mut stats = FilterStats::default();
    let mut kept = Vec::with_capacity(jobs.len());
    for job in jobs {
        let title = job.title.to_lowercase();
        if excluded_titles.iter().any(|t| title.contains(t.as_str())) {
            stats.excluded_title += 1;
            continue;
        }
        let company = job.company.to_lowercase();
        if excluded_companies
            .iter()
            .any(|c| company.contains(c.as_str()))
        {
            stats.excluded_company += 1;
            continue;
        }
        if !passes_location(&job, sub) {
            stats.location += 1;
            continue;
        }
        kept.push(job);
    }
    (kept, stats)
}

fn passes_location(job: &Job, sub: &Subscription) -> bool {
    let has_remote = sub.remote_locations().next().is_some();
    let has_physical = sub.physical_locations().next().is_some();
    if !has_remote && !has_physical {
        return false;
    }

    if job.is_remote && has_remote {
        return true;
    }

    let Some(location) = job.location.as_deref() else {
        return false;
    };
    let location = location.to_lowercase();

    sub.physical_locations().any(|loc| {
        loc.search_variants
            .iter()
            .map(String::as_str)
            .chain(loc.city.as_deref())
            .chain(loc.state.as_deref())
            .chain(std::iter::once(loc.display.as_str()))
            .any(|needle| {
                let needle = needle.to_lowercase();
                !needle.is_empty() && location.contains(&needle)
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DatePosted, LocationKind, NormalizedLocation};

    fn raw(title: &str, company: &str, description: &str) -> RawPosting {
        RawPosting {
            title: title.to_string(),
            company: company.to_string(),
            description: description.to_string(),
            location: Some("Toronto, ON".to_string()),
            is_remote: Some(false),
            min_amount: None,
            max_amount: None,
            currency: None,
            job_url: "https://example.com/j/1".to_string(),
            id: None,
            date_posted: None,
        }
    }

    fn sub_with_locations(locations: Vec<NormalizedLocation>) -> Subscription {
        Subscription {
            id: "s1".to_string(),
            user_id: "u1".to_string(),
            job_titles: vec!["Backend Engineer".to_string()],
            locations,
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

    fn toronto() -> NormalizedLocation {
        NormalizedLocation {
            display: "Toronto".to_string(),
            kind: LocationKind::Physical,
            country: Some("Canada".to_string()),
            city: Some("Toronto".to_string()),
            state: Some("ON".to_string()),
            search_variants: vec!["toronto, on".to_string(), "gta".to_string()],
        }
    }

    fn remote() -> NormalizedLocation {
        NormalizedLocation {
            display: "Remote".to_string(),
            kind: LocationKind::Remote,
            country: Some("Canada".to_string()),
            city: None,
            state: None,
            search_variants: vec![],
        }
    }

    #[test]
    fn clean_text_collapses_whitespace_and_zero_width() {
        assert_eq!(clean_text("  a\t\tb\n c "), "a b c");
        assert_eq!(clean_text("a\u{200B}b\u{FEFF}c"), "abc");
        assert_eq!(clean_text(""), "");
    }

    #[test]
    fn normalize_dedups_by_content_hash() {
        let postings = vec![
            raw("Backend Engineer", "Acme", "desc"),
            raw("backend  engineer", "ACME", "desc"),
            raw("Frontend Engineer", "Acme", "desc"),
        ];
        let jobs = normalize_postings(postings, JobSource::Serpapi);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].title, "Backend Engineer");
        let hashes: std::collections::HashSet<_> =
            jobs.iter().map(|j| j.content_hash.clone()).collect();
        assert_eq!(hashes.len(), jobs.len());
    }

    #[test]
    fn normalize_skips_empty_postings() {
        let postings = vec![raw("", "", "whatever")];
        assert!(normalize_postings(postings, JobSource::Scraper).is_empty());
    }

    #[test]
    fn excluded_title_filter_is_case_insensitive_substring() {
        let mut sub = sub_with_locations(vec![toronto()]);
        sub.excluded_titles = vec!["Senior".to_string()];
        let jobs = normalize_postings(
            vec![
                raw("SENIOR Backend Engineer", "Acme", "d"),
                raw("Backend Engineer", "Acme", "d2"),
            ],
            JobSource::Serpapi,
        );
        let (kept, stats) = apply_subscription_filters(jobs, &sub);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].title, "Backend Engineer");
        assert_eq!(stats.excluded_title, 1);
    }

    #[test]
    fn excluded_company_filter() {
        let mut sub = sub_with_locations(vec![toronto()]);
        sub.excluded_companies = vec!["acme".to_string()];
        let jobs = normalize_postings(
            vec![
                raw("Backend Engineer", "Acme Corp", "d"),
                raw("Backend Engineer", "Globex", "d2"),
            ],
            JobSource::Serpapi,
        );
        let (kept, stats) = apply_subscription_filters(jobs, &sub);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].company, "Globex");
        assert_eq!(stats.excluded_company, 1);
    }

    #[test]
    fn location_filter_matches_variants() {
        let sub = sub_with_locations(vec![toronto()]);
        let mut in_gta = raw("Backend Engineer", "Acme", "d");
        in_gta.location = Some("Somewhere in the GTA".to_string());
        let mut elsewhere = raw("Backend Engineer", "Globex", "d2");
        elsewhere.location = Some("Vancouver, BC".to_string());
        let jobs = normalize_postings(vec![in_gta, elsewhere], JobSource::Serpapi);
        let (kept, stats) = apply_subscription_filters(jobs, &sub);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].company, "Acme");
        assert_eq!(stats.location, 1);
    }

    #[test]
    fn remote_job_passes_only_with_remote_location() {
        let mut posting = raw("Backend Engineer", "Acme", "d");
        posting.is_remote = Some(true);
        posting.location = None;
        let jobs = normalize_postings(vec![posting], JobSource::Serpapi);

        let with_remote = sub_with_locations(vec![remote()]);
        let (kept, _) = apply_subscription_filters(jobs.clone(), &with_remote);
        assert_eq!(kept.len(), 1);

        let physical_only = sub_with_locations(vec![toronto()]);
        let (kept, _) = apply_subscription_filters(jobs, &physical_only);
        assert!(kept.is_empty());
    }

    #[test]
    fn no_locations_rejects_everything() {
        let sub = sub_with_locations(vec![]);
        let jobs = normalize_postings(
            vec![raw("Backend Engineer", "Acme", "d")],
            JobSource::Serpapi,
        );
        let (kept, stats) = apply_subscription_filters(jobs, &sub);
        assert!(kept.is_empty());
        assert_eq!(stats.location, 1);
    }
}
