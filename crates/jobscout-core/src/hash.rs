//! Stable digests identifying jobs, resumes and cached requests.

use sha2::{Digest, Sha256};

use crate::types::{DatePosted, JobSource, JobType};

fn hex_prefix(input: &str, hex_chars: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(hex_chars);
    for byte in digest.iter() {
        if out.len() >= hex_chars {
            break;
        }
        out.push_str(&format!("{:02x}", byte));
    }
    out.truncate(hex_chars);
    out
}

fn head_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

/// 16-hex digest identifying a normalized posting: lowercased
/// title ‖ company ‖ first 500 chars of description.
pub fn content_hash(title: &str, company: &str, description: &str) -> String {
    let input = format!("{}|{}|{}", title, company, head_chars(description, 500)).to_lowercase();
    hex_prefix(&input, 16)
}

/// 16-hex digest identifying a resume text, used to key match caching.
pub fn resume_hash(resume_text: &str) -> String {
    hex_prefix(resume_text, 16)
}

/// 32-hex key for the query-expansion cache: sorted lowercased titles plus
/// the first 500 lowercased chars of the resume.
pub fn expansion_cache_key(titles: &[String], resume_text: &str) -> String {
    let mut sorted: Vec<String> = titles.iter().map(|t| t.to_lowercase()).collect();
    sorted.sort();
    let input = format!(
        "{}|{}",
        sorted.join(","),
        head_chars(resume_text, 500).to_lowercase()
    );
    hex_prefix(&input, 32)
}

/// 16-hex key identifying a collection request, used for both the in-flight
/// dedup cache and the persisted query-result cache.
#[allow(clippy::too_many_arguments)]
pub fn collection_cache_key(
    query: &str,
    location: Option<&str>,
    is_remote: Option<bool>,
    job_type: Option<JobType>,
    date_posted: DatePosted,
    source: JobSource,
    limit: u32,
) -> String {
    let input = format!(
        "{}|{}|{}|{}|{}|{}|{}",
        query.to_lowercase(),
        location.unwrap_or("").to_lowercase(),
        is_remote.map(|r| r.to_string()).unwrap_or_default(),
        job_type.map(|t| t.as_str()).unwrap_or(""),
        date_posted.as_str(),
        source.as_str(),
        limit,
    );
    hex_prefix(&input, 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_and_short() {
        let a = content_hash("Backend Engineer", "Acme", "Build APIs");
        let b = content_hash("Backend Engineer", "Acme", "Build APIs");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn content_hash_is_case_insensitive() {
        let a = content_hash("Backend Engineer", "Acme", "Build APIs");
        let b = content_hash("backend engineer", "ACME", "build apis");
        assert_eq!(a, b);
    }

    #[test]
    fn content_hash_ignores_description_past_500_chars() {
        let head = "x".repeat(500);
        let a = content_hash("T", "C", &head);
        let b = content_hash("T", "C", &format!("{head}this tail is ignored"));
        assert_eq!(a, b);
    }

    #[test]
    fn content_hash_distinguishes_companies() {
        let a = content_hash("Backend Engineer", "Acme", "d");
        let b = content_hash("Backend Engineer", "Globex", "d");
        assert_ne!(a, b);
    }

    #[test]
    fn content_hash_survives_multibyte_descriptions() {
        // 500-char cut must respect char boundaries.
        let desc = "é".repeat(600);
        let h = content_hash("T", "C", &desc);
        assert_eq!(h.len(), 16);
    }

    #[test]
    fn expansion_key_ignores_title_order() {
        let a = expansion_cache_key(
            &["Backend Engineer".to_string(), "SRE".to_string()],
            "resume",
        );
        let b = expansion_cache_key(
            &["SRE".to_string(), "Backend Engineer".to_string()],
            "resume",
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn collection_key_varies_by_parameter() {
        let base = collection_cache_key(
            "rust developer",
            Some("Toronto"),
            None,
            None,
            DatePosted::Month,
            JobSource::Serpapi,
            50,
        );
        let other_location = collection_cache_key(
            "rust developer",
            Some("Berlin"),
            None,
            None,
            DatePosted::Month,
            JobSource::Serpapi,
            50,
        );
        let other_window = collection_cache_key(
            "rust developer",
            Some("Toronto"),
            None,
            None,
            DatePosted::Week,
            JobSource::Serpapi,
            50,
        );
        assert_ne!(base, other_location);
        assert_ne!(base, other_window);
        assert_eq!(base.len(), 16);
    }
}
