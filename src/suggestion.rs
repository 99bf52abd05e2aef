//! Client for the generative-language endpoint that writes reports and tips.
//!
//! The service is optional. Every failure, including a missing API key,
//! resolves to the caller's fallback text so callers never branch on errors.

use crate::aggregate::completed_since;
use crate::context::ScopeTicket;
use crate::errors::{AppError, AppResult};
use crate::models::{AppSettings, Task, Transaction, TransactionType};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const WEEKLY_REPORT_FALLBACK: &str = "Sorry, the weekly report could not be generated. Please try again later.";
pub const NO_COMPLETED_TASKS: &str =
    "You have not completed any tasks in the last seven days. Start this week with fresh energy!";
pub const FINANCE_ANALYSIS_FALLBACK: &str = "Sorry, the spending analysis is unavailable right now.";
pub const NO_EXPENSES: &str = "There are no expenses to analyse yet.";
pub const FOCUS_SUGGESTION_FALLBACK: &str = "Pick the task with the closest deadline and start there.";
pub const NO_ACTIVE_TASKS: &str = "No active tasks. A good moment to plan ahead!";

/// A prompt ready to send, or the answer to give when there is nothing to ask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    Ask { text: String, fallback: &'static str },
    NothingToAsk(&'static str),
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: [RequestContent<'a>; 1],
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    role: &'static str,
    parts: [RequestPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SuggestionClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl SuggestionClient {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> AppResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn from_settings(settings: &AppSettings) -> AppResult<Self> {
        Self::new(
            settings.suggestion_endpoint.clone(),
            settings.suggestion_api_key.clone(),
            Duration::from_millis(settings.suggestion_timeout_ms.max(1)),
        )
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Sends `prompt` and returns the generated text, or `fallback` when the
    /// service cannot produce one.
    pub async fn complete(&self, prompt: &str, fallback: &str) -> String {
        match self.request(prompt).await {
            Ok(text) => text,
            Err(error) => {
                tracing::warn!(error = %error, "suggestion request failed, using fallback");
                fallback.to_string()
            }
        }
    }

    /// Like [`complete`](Self::complete), but drops the answer when the scope
    /// that asked for it has been torn down in the meantime.
    pub async fn complete_scoped(&self, ticket: &ScopeTicket, prompt: &str, fallback: &str) -> Option<String> {
        let text = self.complete(prompt, fallback).await;
        if ticket.is_current() {
            Some(text)
        } else {
            tracing::debug!("discarding suggestion for a stale scope");
            None
        }
    }

    pub async fn answer(&self, prompt: Prompt) -> String {
        match prompt {
            Prompt::Ask { text, fallback } => self.complete(&text, fallback).await,
            Prompt::NothingToAsk(message) => message.to_string(),
        }
    }

    pub async fn answer_scoped(&self, ticket: &ScopeTicket, prompt: Prompt) -> Option<String> {
        match prompt {
            Prompt::Ask { text, fallback } => self.complete_scoped(ticket, &text, fallback).await,
            Prompt::NothingToAsk(message) => ticket.is_current().then(|| message.to_string()),
        }
    }

    async fn request(&self, prompt: &str) -> AppResult<String> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| AppError::Suggestion("no API key configured".to_string()))?;
        let body = GenerateRequest {
            contents: [RequestContent {
                role: "user",
                parts: [RequestPart { text: prompt }],
            }],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", key)])
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_status_error(status, &bytes));
        }
        extract_text(&bytes)
    }
}

fn extract_text(body: &[u8]) -> AppResult<String> {
    let decoded: GenerateResponse = serde_json::from_slice(body)
        .map_err(|error| AppError::Suggestion(format!("invalid response payload: {error}")))?;
    decoded
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .and_then(|content| content.parts.into_iter().next())
        .and_then(|part| part.text)
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| AppError::Suggestion("response carried no candidate text".to_string()))
}

fn map_transport_error(error: reqwest::Error) -> AppError {
    if error.is_timeout() {
        AppError::Suggestion(format!("request timed out: {error}"))
    } else {
        AppError::Suggestion(error.to_string())
    }
}

fn map_status_error(status: StatusCode, body: &[u8]) -> AppError {
    const PREVIEW_CHAR_LIMIT: usize = 160;
    let compact = String::from_utf8_lossy(body)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let preview = compact.chars().take(PREVIEW_CHAR_LIMIT).collect::<String>();
    if preview.is_empty() {
        AppError::Suggestion(format!("status {}", status.as_u16()))
    } else {
        AppError::Suggestion(format!("status {}: {}", status.as_u16(), preview))
    }
}

/// Weekly coaching report over tasks completed in the seven days before `now`.
pub fn weekly_report_prompt(tasks: &[Task], now: DateTime<Utc>) -> Prompt {
    let completed = completed_since(tasks, now - ChronoDuration::days(7));
    if completed.is_empty() {
        return Prompt::NothingToAsk(NO_COMPLETED_TASKS);
    }
    let list = completed
        .iter()
        .map(|task| match task.completed_at {
            Some(at) => format!("- {} (completed {})", task.title, at.format("%Y-%m-%d")),
            None => format!("- {}", task.title),
        })
        .collect::<Vec<_>>()
        .join("\n");
    let text = format!(
        "You are an experienced productivity coach. Review the tasks a student completed over the last week and write a report with:\n\n\
         1. **Achievements**: how many tasks were finished, with recognition for the effort\n\
         2. **Productivity patterns**: the most productive days or times visible in the data\n\
         3. **Insights**: anything notable about how the work was spread\n\
         4. **Recommendations**: concrete steps to be more productive next week\n\
         5. **Encouragement**: a short personal note of motivation\n\n\
         Answer in tidy markdown with a supportive, professional tone.\n\n\
         Completed tasks:\n{list}"
    );
    Prompt::Ask {
        text,
        fallback: WEEKLY_REPORT_FALLBACK,
    }
}

pub fn finance_analysis_prompt(transactions: &[Transaction]) -> Prompt {
    let expenses = transactions
        .iter()
        .filter(|transaction| transaction.kind == TransactionType::Expense)
        .map(|transaction| format!("- {}: {:.2}", transaction.description, transaction.amount))
        .collect::<Vec<_>>();
    if expenses.is_empty() {
        return Prompt::NothingToAsk(NO_EXPENSES);
    }
    let text = format!(
        "You are a friendly financial adviser for students. Here is my list of expenses:\n{}\n\n\
         Give a short analysis of my spending pattern and two or three practical tips for saving money. \
         Answer in tidy markdown.",
        expenses.join("\n")
    );
    Prompt::Ask {
        text,
        fallback: FINANCE_ANALYSIS_FALLBACK,
    }
}

/// One-sentence pick of the most important open task, for a focus session.
pub fn focus_suggestion_prompt(tasks: &[Task]) -> Prompt {
    let open = tasks
        .iter()
        .filter(|task| !task.status.is_done())
        .map(|task| {
            let priority = task.priority.map(|priority| priority.as_str()).unwrap_or("none");
            format!("- {} (priority: {})", task.title, priority)
        })
        .collect::<Vec<_>>();
    if open.is_empty() {
        return Prompt::NothingToAsk(NO_ACTIVE_TASKS);
    }
    let text = format!(
        "Review this student's task list and suggest the ONE most important task to work on now, in a single sentence.\n\
         Tasks:\n{}\n\nYour suggestion:",
        open.join("\n")
    );
    Prompt::Ask {
        text,
        fallback: FOCUS_SUGGESTION_FALLBACK,
    }
}
