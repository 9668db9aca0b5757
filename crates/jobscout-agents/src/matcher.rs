//! Match-scoring agent: one job against one resume.

use std::sync::Arc;

use jobscout_core::{Error, Job, MatchVerdict, Result};

use crate::llm::LlmClient;

const SYSTEM_PROMPT: &str = "You are a job-match scoring assistant. Compare the job posting to the \
candidate resume and respond with a JSON object: {\"score\": <integer 1-100>, \
\"reasoning\": <string>, \"matched_skills\": [<string>], \"missing_skills\": [<string>], \
\"pros\": [<string>], \"cons\": [<string>]}.";

pub struct Matcher {
    llm: Arc<LlmClient>,
}

impl Matcher {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn score(&self, job: &Job, resume_text: &str) -> Result<MatchVerdict> {
        let user_prompt = format!(
            "JOB POSTING\nTitle: {}\nCompany: {}\nLocation: {}\nDescription:\n{}\n\nRESUME\n{}",
            job.title,
            job.company,
            job.location.as_deref().unwrap_or("unspecified"),
            job.description,
            resume_text,
        );
        let value = self.llm.complete_json(SYSTEM_PROMPT, &user_prompt).await?;
        parse_verdict(&value)
    }
}

/// Validate a scoring response. Some models return fractional scores;
/// those are rounded, then clamped into [1, 100]. Responses without a
/// numeric score are discarded.
pub fn parse_verdict(value: &serde_json::Value) -> Result<MatchVerdict> {
    let score = value
        .get("score")
        .and_then(|s| s.as_f64())
        .ok_or_else(|| Error::InvalidInput("match response missing numeric score".to_string()))?;
    let score = (score.round() as i64).clamp(1, 100) as i32;

    let reasoning = value
        .get("reasoning")
        .and_then(|r| r.as_str())
        .unwrap_or("")
        .to_string();

    Ok(MatchVerdict {
        score,
        reasoning,
        matched_skills: string_array(value, "matched_skills"),
        missing_skills: string_array(value, "missing_skills"),
        pros: string_array(value, "pros"),
        cons: string_array(value, "cons"),
    })
}

fn string_array(value: &serde_json::Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_full_verdict() {
        let value = json!({
            "score": 82,
            "reasoning": "Strong backend overlap",
            "matched_skills": ["rust", "postgres"],
            "missing_skills": ["kubernetes"],
            "pros": ["remote friendly"],
            "cons": ["junior title"]
        });
        let verdict = parse_verdict(&value).unwrap();
        assert_eq!(verdict.score, 82);
        assert_eq!(verdict.matched_skills, vec!["rust", "postgres"]);
        assert_eq!(verdict.missing_skills, vec!["kubernetes"]);
    }

    #[test]
    fn fractional_score_is_rounded() {
        let value = json!({"score": 76.6, "reasoning": ""});
        assert_eq!(parse_verdict(&value).unwrap().score, 77);
    }

    #[test]
    fn out_of_range_scores_are_clamped() {
        let low = json!({"score": 0, "reasoning": ""});
        assert_eq!(parse_verdict(&low).unwrap().score, 1);
        let high = json!({"score": 140, "reasoning": ""});
        assert_eq!(parse_verdict(&high).unwrap().score, 100);
    }

    #[test]
    fn missing_score_is_rejected() {
        let value = json!({"reasoning": "no score here"});
        assert!(matches!(parse_verdict(&value), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn non_numeric_score_is_rejected() {
        let value = json!({"score": "eighty"});
        assert!(matches!(parse_verdict(&value), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn missing_arrays_default_to_empty() {
        let value = json!({"score": 50});
        let verdict = parse_verdict(&value).unwrap();
        assert!(verdict.matched_skills.is_empty());
        assert!(verdict.pros.is_empty());
        assert_eq!(verdict.reasoning, "");
    }

    #[test]
    fn non_string_array_entries_are_dropped() {
        let value = json!({"score": 50, "matched_skills": ["rust", 7, null, "sql"]});
        let verdict = parse_verdict(&value).unwrap();
        assert_eq!(verdict.matched_skills, vec!["rust", "sql"]);
    }
}
