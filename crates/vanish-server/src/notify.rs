use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::render::format_timestamp;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "X-Vanish-Signature";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("notification endpoint returned HTTP {0}")]
    Rejected(u16),
    #[error("encode notification: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid signing secret")]
    SigningKey,
}

/// What a requester is told about a grant. Carries the link, never the
/// credentials.
#[derive(Debug, Clone)]
pub struct CredentialNotice {
    pub requester: String,
    pub database: String,
    pub link: String,
    /// Unix milliseconds.
    pub expires_at: i64,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &CredentialNotice) -> Result<(), NotifyError>;
}

/// Slack Block Kit message for a notice.
pub fn slack_message(notice: &CredentialNotice) -> Value {
    let database = notice.database.to_uppercase();
    let expires = format_timestamp(notice.expires_at);
    json!({
        "text": format!("Database access granted: {}", notice.database),
        "blocks": [
            {
                "type": "header",
                "text": {"type": "plain_text", "text": format!("Secure database access - {database}")}
            },
            {
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": format!(
                        "*Requester:* {}\n*Database:* {}\n*Expires:* {expires}",
                        notice.requester, notice.database
                    )
                }
            },
            {
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": format!("*One-time link:* <{}|Open credentials>", notice.link)
                }
            },
            {
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": "*Security notice:*\n• The link self-destructs after viewing\n• Credentials expire automatically\n• All access is audited"
                }
            }
        ]
    })
}

/// HMAC-SHA256 hex digest of `body`.
pub fn compute_signature(secret: &str, body: &str) -> Result<String, NotifyError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| NotifyError::SigningKey)?;
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Posts notices to a Slack incoming webhook.
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
    signing_secret: Option<String>,
}

impl SlackNotifier {
    pub fn new(
        webhook_url: impl Into<String>,
        signing_secret: Option<String>,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
            signing_secret,
        })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, notice: &CredentialNotice) -> Result<(), NotifyError> {
        let body = serde_json::to_string(&slack_message(notice))?;

        let mut req = self
            .client
            .post(&self.webhook_url)
            .header("Content-Type", "application/json");
        if let Some(secret) = &self.signing_secret {
            let signature = compute_signature(secret, &body)?;
            req = req.header(SIGNATURE_HEADER, format!("sha256={signature}"));
        }

        let resp = req.body(body).send().await?;
        if !resp.status().is_success() {
            warn!(status = %resp.status(), "slack webhook rejected notification");
            return Err(NotifyError::Rejected(resp.status().as_u16()));
        }
        debug!(requester = %notice.requester, "slack notification delivered");
        Ok(())
    }
}

/// Logs notices instead of sending them. The link is left out of the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: &CredentialNotice) -> Result<(), NotifyError> {
        info!(
            requester = %notice.requester,
            database = %notice.database,
            expires = %format_timestamp(notice.expires_at),
            "access granted; no notifier configured, deliver the link manually"
        );
        Ok(())
    }
}
