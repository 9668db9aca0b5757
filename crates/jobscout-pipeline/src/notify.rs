//! Match-summary rendering and chat delivery.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use jobscout_agents::chat::{truncate_message, ChatTransport, ParseMode, MAX_MESSAGE_CHARS};
use jobscout_core::{Job, MatchVerdict};

/// A match above the subscription's threshold, ready for delivery.
#[derive(Debug, Clone)]
pub struct RetainedMatch {
    pub job: Job,
    pub job_match_id: Uuid,
    pub verdict: MatchVerdict,
}

/// Per-match delivery result. The ledger write stays with the caller.
#[derive(Debug, Clone)]
pub struct SendReport {
    pub job_match_id: Uuid,
    pub delivered: bool,
    pub error: Option<String>,
}

pub struct NotificationEmitter {
    transport: Arc<dyn ChatTransport>,
    parse_mode: ParseMode,
    max_chars: usize,
}

impl NotificationEmitter {
    pub fn new(transport: Arc<dyn ChatTransport>, parse_mode: ParseMode) -> Self {
        Self {
            transport,
            parse_mode,
            max_chars: MAX_MESSAGE_CHARS,
        }
    }

    /// Send one message per match. A failure on one match does not stop
    /// the rest.
    pub async fn deliver(&self, chat_id: &str, matches: &[RetainedMatch]) -> Vec<SendReport> {
        let mut reports = Vec::with_capacity(matches.len());
        for m in matches {
            let body = render_match(m, self.parse_mode);
            let body = truncate_message(&body, self.max_chars, self.parse_mode);
            match self.transport.send_message(chat_id, &body, self.parse_mode).await {
                Ok(()) => {
                    reports.push(SendReport {
                        job_match_id: m.job_match_id,
                        delivered: true,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(chat_id, job_match_id = %m.job_match_id, "notification failed: {e}");
                    reports.push(SendReport {
                        job_match_id: m.job_match_id,
                        delivered: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        let delivered = reports.iter().filter(|r| r.delivered).count();
        info!(chat_id, delivered, attempted = matches.len(), "notifications delivered");
        reports
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn salary_line(job: &Job) -> Option<String> {
    let currency = job.salary_currency.as_deref().unwrap_or("");
    match (job.salary_min, job.salary_max) {
        (Some(min), Some(max)) => Some(format!("{min:.0}-{max:.0} {currency}").trim().to_string()),
        (Some(min), None) => Some(format!("from {min:.0} {currency}").trim().to_string()),
        (None, Some(max)) => Some(format!("up to {max:.0} {currency}").trim().to_string()),
        (None, None) => None,
    }
}

/// Render one match summary: title, company, score, location, salary range
/// when present, application URL and the top three matched skills.
pub fn render_match(m: &RetainedMatch, mode: ParseMode) -> String {
    let location = if m.job.is_remote {
        "Remote".to_string()
    } else {
        m.job.location.clone().unwrap_or_else(|| "Location not listed".to_string())
    };
    let skills = m
        .verdict
        .matched_skills
        .iter()
        .take(3)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");

    match mode {
        ParseMode::Html => {
            let mut out = format!(
                "<b>{}</b>\n{} | Score: {}/100\n{}",
                escape_html(&m.job.title),
                escape_html(&m.job.company),
                m.verdict.score,
                escape_html(&location),
            );
            if let Some(salary) = salary_line(&m.job) {
                out.push_str(&format!("\nSalary: {}", escape_html(&salary)));
            }
            if !m.job.application_url.is_empty() {
                out.push_str(&format!(
                    "\n<a href=\"{}\">Apply</a>",
                    m.job.application_url
                ));
            }
            if !skills.is_empty() {
                out.push_str(&format!("\nMatched skills: {}", escape_html(&skills)));
            }
            out
        }
        ParseMode::Markdown | ParseMode::Plain => {
            let mut out = format!(
                "{}\n{} | Score: {}/100\n{}",
                m.job.title, m.job.company, m.verdict.score, location,
            );
            if let Some(salary) = salary_line(&m.job) {
                out.push_str(&format!("\nSalary: {salary}"));
            }
            if !m.job.application_url.is_empty() {
                out.push_str(&format!("\nApply: {}", m.job.application_url));
            }
            if !skills.is_empty() {
                out.push_str(&format!("\nMatched skills: {skills}"));
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jobscout_core::{Error, JobSource, Result};
    use std::sync::Mutex;

    fn sample(score: i32) -> RetainedMatch {
        RetainedMatch {
            job: Job {
                content_hash: "abc".to_string(),
                title: "Backend <Engineer>".to_string(),
                company: "Acme & Co".to_string(),
                description: String::new(),
                location: Some("Toronto, ON".to_string()),
                is_remote: false,
                salary_min: Some(90_000.0),
                salary_max: Some(120_000.0),
                salary_currency: Some("CAD".to_string()),
                application_url: "https://example.com/apply".to_string(),
                source: JobSource::Serpapi,
                source_id: None,
                posted_date: None,
            },
            job_match_id: Uuid::new_v4(),
            verdict: MatchVerdict {
                score,
                reasoning: String::new(),
                matched_skills: vec![
                    "rust".to_string(),
                    "postgres".to_string(),
                    "redis".to_string(),
                    "kafka".to_string(),
                ],
                missing_skills: vec![],
                pros: vec![],
                cons: vec![],
            },
        }
    }

    #[test]
    fn html_render_escapes_and_summarizes() {
        let body = render_match(&sample(84), ParseMode::Html);
        assert!(body.contains("<b>Backend &lt;Engineer&gt;</b>"));
        assert!(body.contains("Acme &amp; Co"));
        assert!(body.contains("Score: 84/100"));
        assert!(body.contains("Salary: 90000-120000 CAD"));
        assert!(body.contains("<a href=\"https://example.com/apply\">Apply</a>"));
        // Top three skills only.
        assert!(body.contains("rust, postgres, redis"));
        assert!(!body.contains("kafka"));
    }

    #[test]
    fn plain_render_has_no_markup() {
        let body = render_match(&sample(70), ParseMode::Plain);
        assert!(!body.contains("<b>"));
        assert!(body.contains("Apply: https://example.com/apply"));
    }

    #[test]
    fn remote_jobs_render_remote_location() {
        let mut m = sample(70);
        m.job.is_remote = true;
        m.job.location = None;
        let body = render_match(&m, ParseMode::Plain);
        assert!(body.contains("Remote"));
    }

    #[test]
    fn missing_salary_is_omitted() {
        let mut m = sample(70);
        m.job.salary_min = None;
        m.job.salary_max = None;
        let body = render_match(&m, ParseMode::Html);
        assert!(!body.contains("Salary:"));
    }

    struct FlakyTransport {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl ChatTransport for FlakyTransport {
        async fn send_message(&self, _chat_id: &str, _text: &str, _mode: ParseMode) -> Result<()> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls == 2 {
                Err(Error::Transient("send failed".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_batch() {
        let transport = Arc::new(FlakyTransport {
            calls: Mutex::new(0),
        });
        let emitter = NotificationEmitter::new(transport, ParseMode::Html);
        let matches = vec![sample(90), sample(85), sample(80)];
        let reports = emitter.deliver("chat-1", &matches).await;
        assert_eq!(reports.len(), 3);
        assert!(reports[0].delivered);
        assert!(!reports[1].delivered);
        assert!(reports[1].error.is_some());
        assert!(reports[2].delivered);
    }
}
