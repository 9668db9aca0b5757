//! Query-expansion agent: broaden a subscription's titles with synonyms
//! and resume-derived suggestions.

use std::sync::Arc;

use tracing::debug;

use jobscout_core::{ExpandedQueries, Result};

use crate::llm::LlmClient;

/// Expanded titles are capped at twice the original count, resume
/// suggestions at five.
pub const MAX_RESUME_SUGGESTIONS: usize = 5;

const SYSTEM_PROMPT: &str = "You expand job-search titles. Given the user's titles and resume, \
respond with a JSON object: {\"expanded_titles\": [<string>], \
\"resume_suggested_titles\": [<string>]}. Expanded titles are close synonyms of the given \
titles; resume-suggested titles are roles the resume qualifies for that the user did not list.";

pub struct QueryExpander {
    llm: Arc<LlmClient>,
}

impl QueryExpander {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn expand(&self, titles: &[String], resume_text: &str) -> Result<ExpandedQueries> {
        let user_prompt = format!(
            "TITLES\n{}\n\nRESUME (first 2000 chars)\n{}",
            titles.join("\n"),
            resume_text.chars().take(2000).collect::<String>(),
        );
        let value = self.llm.complete_json(SYSTEM_PROMPT, &user_prompt).await?;
        let expanded = parse_expansion(&value, titles.len());
        debug!(
            expanded = expanded.expanded_titles.len(),
            suggested = expanded.resume_suggested_titles.len(),
            "query expansion"
        );
        Ok(expanded)
    }
}

/// Validate and cap an expansion response. A malformed response degrades to
/// an empty expansion rather than failing the run.
pub fn parse_expansion(value: &serde_json::Value, original_count: usize) -> ExpandedQueries {
    let mut expanded = string_array(value, "expanded_titles");
    expanded.truncate(original_count * 2);
    let mut suggested = string_array(value, "resume_suggested_titles");
    suggested.truncate(MAX_RESUME_SUGGESTIONS);
    ExpandedQueries {
        expanded_titles: expanded,
        resume_suggested_titles: suggested,
    }
}

fn string_array(value: &serde_json::Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn caps_expanded_to_twice_the_originals() {
        let value = json!({
            "expanded_titles": ["a", "b", "c", "d", "e"],
            "resume_suggested_titles": []
        });
        let expanded = parse_expansion(&value, 2);
        assert_eq!(expanded.expanded_titles, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn caps_resume_suggestions_at_five() {
        let value = json!({
            "expanded_titles": [],
            "resume_suggested_titles": ["a", "b", "c", "d", "e", "f", "g"]
        });
        let expanded = parse_expansion(&value, 1);
        assert_eq!(expanded.resume_suggested_titles.len(), 5);
    }

    #[test]
    fn malformed_response_degrades_to_empty() {
        let value = json!({"unexpected": true});
        let expanded = parse_expansion(&value, 3);
        assert!(expanded.expanded_titles.is_empty());
        assert!(expanded.resume_suggested_titles.is_empty());
    }

    #[test]
    fn blank_entries_are_dropped() {
        let value = json!({
            "expanded_titles": ["  ", "Platform Engineer", ""],
            "resume_suggested_titles": []
        });
        let expanded = parse_expansion(&value, 2);
        assert_eq!(expanded.expanded_titles, vec!["Platform Engineer"]);
    }
}
