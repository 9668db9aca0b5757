//! Chat delivery transport and length-limited rendering.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use jobscout_core::{Error, Result};

/// Hard per-message length limit of the chat service, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Html,
    Markdown,
    Plain,
}

impl ParseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseMode::Html => "HTML",
            ParseMode::Markdown => "MarkdownV2",
            ParseMode::Plain => "",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "html" => ParseMode::Html,
            "markdown" | "markdownv2" => ParseMode::Markdown,
            _ => ParseMode::Plain,
        }
    }
}

/// Seam between the notification emitter and the chat service, mockable in
/// tests.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(&self, chat_id: &str, text: &str, mode: ParseMode) -> Result<()>;
}

pub struct HttpChatClient {
    http: reqwest::Client,
    api_url: String,
}

impl HttpChatClient {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into(),
        }
    }
}

#[async_trait]
impl ChatTransport for HttpChatClient {
    async fn send_message(&self, chat_id: &str, text: &str, mode: ParseMode) -> Result<()> {
        #[derive(Serialize)]
        struct SendBody<'a> {
            chat_id: &'a str,
            text: &'a str,
            #[serde(skip_serializing_if = "str::is_empty")]
            parse_mode: &'a str,
        }

        let response = self
            .http
            .post(format!("{}/sendMessage", self.api_url))
            .timeout(Duration::from_secs(15))
            .json(&SendBody {
                chat_id,
                text,
                parse_mode: mode.as_str(),
            })
            .send()
            .await
            .map_err(|e| Error::Transient(format!("chat send failed: {e}")))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(Error::RateLimited("chat service returned 429".to_string()));
        }
        if status.is_server_error() {
            return Err(Error::Transient(format!("chat service returned {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::InvalidInput(format!(
                "chat service rejected message ({status}): {body}"
            )));
        }
        debug!(chat_id, "message delivered");
        Ok(())
    }
}

/// Truncate a message to `limit` characters for the given parse mode. In
/// HTML mode every tag opened in the kept prefix is closed again, in
/// reverse order, after the ellipsis.
pub fn truncate_message(text: &str, limit: usize, mode: ParseMode) -> String {
    match mode {
        ParseMode::Html => truncate_balanced(text, limit),
        ParseMode::Markdown | ParseMode::Plain => {
            if text.chars().count() <= limit {
                return text.to_string();
            }
            let mut out: String = text.chars().take(limit.saturating_sub(1)).collect();
            out.push('…');
            out
        }
    }
}

fn tag_name(inner: &str) -> String {
    inner
        .trim_start_matches('/')
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

fn is_void_tag(name: &str) -> bool {
    matches!(name, "br" | "hr" | "img")
}

/// HTML-aware truncation. Walks the text token by token (a tag is one
/// token), tracking the stack of open tags, and keeps the longest prefix
/// that still leaves room for an ellipsis plus the closing tags.
pub fn truncate_balanced(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }

    let mut out = String::new();
    let mut out_chars = 0usize;
    let mut stack: Vec<String> = Vec::new();
    // Longest feasible cut: byte length of the prefix and the stack there.
    let mut best: Option<(usize, Vec<String>)> = None;

    let mut i = 0;
    while i < text.len() {
        if text[i..].starts_with('<') {
            if let Some(end) = text[i..].find('>') {
                let tag = &text[i..i + end + 1];
                let inner = &tag[1..tag.len() - 1];
                let name = tag_name(inner);
                if inner.starts_with('/') {
                    if let Some(pos) = stack.iter().rposition(|n| *n == name) {
                        stack.truncate(pos);
                    }
                } else if !name.is_empty() && !inner.ends_with('/') && !is_void_tag(&name) {
                    stack.push(name);
                }
                out.push_str(tag);
                out_chars += tag.chars().count();
                i += end + 1;
            } else {
                out.push('<');
                out_chars += 1;
                i += 1;
            }
        } else {
            let c = text[i..].chars().next().unwrap_or('\u{FFFD}');
            out.push(c);
            out_chars += 1;
            i += c.len_utf8();
        }

        let closers: usize = stack.iter().map(|n| n.chars().count() + 3).sum();
        if out_chars + 1 + closers <= limit {
            best = Some((out.len(), stack.clone()));
        }
    }

    let Some((prefix_len, open)) = best else {
        return "…".to_string();
    };
    let mut result = out[..prefix_len].to_string();
    result.push('…');
    for name in open.iter().rev() {
        result.push_str(&format!("</{name}>"));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(truncate_balanced("<b>hi</b>", 100), "<b>hi</b>");
    }

    #[test]
    fn plain_text_gets_ellipsis() {
        let out = truncate_balanced("abcdefghij", 5);
        assert_eq!(out.chars().count(), 5);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn open_tags_are_closed_in_reverse_order() {
        let text = "<b>bold <i>italic text that goes on and on and on</i></b>";
        let out = truncate_balanced(text, 24);
        assert!(out.chars().count() <= 24, "got {} chars: {out}", out.chars().count());
        assert!(out.ends_with("…</i></b>") || out.ends_with("…</b>"), "got: {out}");
    }

    #[test]
    fn truncation_never_splits_a_tag() {
        let text = format!("{}<a href=\"https://example.com/very/long\">link</a>", "x".repeat(30));
        let out = truncate_balanced(&text, 35);
        // The cut lands before the tag rather than inside it.
        assert!(!out.contains("<a href"), "got: {out}");
        assert!(out.ends_with('…'));
    }

    #[test]
    fn closed_pairs_do_not_generate_extra_closers() {
        let text = format!("<b>done</b>{}", "y".repeat(50));
        let out = truncate_balanced(&text, 20);
        assert!(out.starts_with("<b>done</b>"));
        assert!(out.ends_with('…'));
        assert_eq!(out.matches("</b>").count(), 1);
    }

    #[test]
    fn void_tags_are_not_closed() {
        let text = format!("line one<br>{}", "z".repeat(50));
        let out = truncate_balanced(&text, 20);
        assert!(!out.contains("</br>"));
    }

    #[test]
    fn result_is_balanced() {
        let text = "<b><i><u>deeply nested content that absolutely will not fit</u></i></b>";
        let out = truncate_balanced(text, 30);
        for tag in ["b", "i", "u"] {
            let opens = out.matches(&format!("<{tag}>")).count();
            let closes = out.matches(&format!("</{tag}>")).count();
            assert_eq!(opens, closes, "unbalanced <{tag}> in: {out}");
        }
    }

    #[test]
    fn impossible_limit_degrades_to_ellipsis() {
        assert_eq!(truncate_balanced("<b>abcdef</b>", 2), "…");
    }

    #[test]
    fn markdown_mode_truncates_plainly() {
        let out = truncate_message("*bold* and more text", 10, ParseMode::Markdown);
        assert_eq!(out.chars().count(), 10);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn parse_mode_parsing() {
        assert_eq!(ParseMode::parse("html"), ParseMode::Html);
        assert_eq!(ParseMode::parse("HTML"), ParseMode::Html);
        assert_eq!(ParseMode::parse("markdown"), ParseMode::Markdown);
        assert_eq!(ParseMode::parse("anything"), ParseMode::Plain);
    }
}
