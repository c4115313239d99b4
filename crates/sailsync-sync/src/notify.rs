//! Per-scope summaries for operators. Delivery failures never reach the sync.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use sailsync_core::{LockStatus, SyncSummary};
use sailsync_storage::{BackoffPolicy, RetryDisposition};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("notification endpoint answered {status}")]
    HttpStatus { status: u16 },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, summary: &SyncSummary) -> Result<(), NotifyError>;
}

/// Writes the summary to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, summary: &SyncSummary) -> Result<(), NotifyError> {
        info!(
            scope = summary.scope_id,
            status = %summary.status,
            found = summary.files_found,
            processed = summary.files_processed,
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            failed = summary.failed,
            corrupt = summary.corrupt,
            duration_ms = summary.duration_ms,
            "scope sync summary"
        );
        Ok(())
    }
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Posts summaries to a Slack incoming webhook.
#[derive(Debug, Clone)]
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
    backoff: BackoffPolicy,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>, backoff: BackoffPolicy) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building slack client")?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
            backoff,
        })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, summary: &SyncSummary) -> Result<(), NotifyError> {
        let payload = slack_payload(summary);
        let mut attempt = 0;
        loop {
            let result = self.client.post(&self.webhook_url).json(&payload).send().await;
            let retryable = match result {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(NotifyError::HttpStatus {
                            status: status.as_u16(),
                        });
                    }
                    status.to_string()
                }
                Err(err) if attempt >= self.backoff.max_retries => return Err(err.into()),
                Err(err) => err.to_string(),
            };
            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, reason = %retryable, "retrying slack notification");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn status_emoji(status: LockStatus) -> &'static str {
    match status {
        LockStatus::Completed => ":white_check_mark:",
        LockStatus::Failed => ":x:",
        LockStatus::Processing => ":hourglass:",
    }
}

pub fn slack_payload(summary: &SyncSummary) -> JsonValue {
    let headline = format!(
        "Cruise line {} sync {}",
        summary.scope_id, summary.status
    );
    let counts = format!(
        "*Found:* {}  *Processed:* {}\n*Created:* {}  *Updated:* {}  *Skipped:* {}  *Failed:* {} ({} corrupt)\n*Duration:* {:.1}s",
        summary.files_found,
        summary.files_processed,
        summary.created,
        summary.updated,
        summary.skipped,
        summary.failed,
        summary.corrupt,
        summary.duration_ms as f64 / 1000.0
    );

    let mut blocks = vec![
        json!({
            "type": "header",
            "text": {"type": "plain_text", "text": format!("{} {}", status_emoji(summary.status), headline)}
        }),
        json!({"type": "section", "text": {"type": "mrkdwn", "text": counts}}),
    ];
    if !summary.errors.is_empty() {
        blocks.push(json!({"type": "divider"}));
        blocks.push(json!({
            "type": "section",
            "text": {"type": "mrkdwn", "text": format!("```{}```", summary.errors.join("\n"))}
        }));
    }
    blocks.push(json!({
        "type": "context",
        "elements": [{
            "type": "mrkdwn",
            "text": format!("Sent at {}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"))
        }]
    }));

    json!({ "text": headline, "blocks": blocks })
}
