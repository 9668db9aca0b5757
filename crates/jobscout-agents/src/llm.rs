//! LLM API client for the expansion and matching agents.

use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use jobscout_core::{Error, Result};

/// Client for an OpenAI-compatible chat-completion endpoint in JSON mode.
#[derive(Debug, Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            model,
            base_url,
        }
    }

    /// Create a client from environment variables.
    pub fn from_env() -> AnyResult<Self> {
        let api_key = std::env::var("LLM_API_KEY").context("LLM_API_KEY required")?;
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let base_url =
            std::env::var("LLM_BASE_URL").unwrap_or_else(|_| "https://api.openai.com".to_string());
        Ok(Self::new(api_key, model, base_url))
    }

    /// One JSON-mode completion. The returned value is the parsed response
    /// object; callers validate its shape and discard malformed output.
    pub async fn complete_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<serde_json::Value> {
        #[derive(Serialize)]
        struct Request<'a> {
            model: &'a str,
            messages: Vec<Message<'a>>,
            temperature: f32,
            response_format: ResponseFormat<'a>,
        }

        #[derive(Serialize)]
        struct Message<'a> {
            role: &'a str,
            content: &'a str,
        }

        #[derive(Serialize)]
        struct ResponseFormat<'a> {
            #[serde(rename = "type")]
            kind: &'a str,
        }

        #[derive(Deserialize)]
        struct Response {
            choices: Vec<Choice>,
        }

        #[derive(Deserialize)]
        struct Choice {
            message: MessageContent,
        }

        #[derive(Deserialize)]
        struct MessageContent {
            content: String,
        }

        let request = Request {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: system_prompt,
                },
                Message {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature: 0.1,
            response_format: ResponseFormat { kind: "json_object" },
        };

        debug!(model = %self.model, "calling LLM");

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .timeout(Duration::from_secs(60))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("LLM request failed: {e}")))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::RateLimited(format!("LLM returned 429: {body}")));
        }
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transient(format!("LLM returned {status}: {body}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::InvalidInput(format!(
                "LLM rejected request ({status}): {body}"
            )));
        }

        let response: Response = response
            .json()
            .await
            .map_err(|e| Error::Transient(format!("LLM response unreadable: {e}")))?;
        let content = response
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| Error::InvalidInput("LLM returned no choices".to_string()))?;

        serde_json::from_str(content)
            .map_err(|e| Error::InvalidInput(format!("LLM returned non-JSON content: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_requires_api_key() {
        std::env::remove_var("LLM_API_KEY");
        let result = LlmClient::from_env();
        match result {
            Err(e) => assert!(e.to_string().contains("LLM_API_KEY")),
            Ok(_) => panic!("expected error without LLM_API_KEY"),
        }
    }

    #[test]
    fn new_keeps_configuration() {
        let client = LlmClient::new(
            "key".to_string(),
            "gpt-4o-mini".to_string(),
            "https://api.openai.com".to_string(),
        );
        assert_eq!(client.model, "gpt-4o-mini");
        assert_eq!(client.base_url, "https://api.openai.com");
    }
}
