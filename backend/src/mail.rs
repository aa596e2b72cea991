use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{ProvisioningError, ProvisioningResult};

const RELAY_TIMEOUT: Duration = Duration::from_secs(15);

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Returns `false` when the message could not be handed off.
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> bool;
}

#[derive(Serialize)]
struct RelayMessage<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
}

/// Hands mail to an HTTP relay as `{from, to, subject, html}` JSON.
pub struct HttpMailer {
    client: reqwest::Client,
    relay_url: Option<String>,
    relay_token: Option<String>,
    from: String,
}

impl HttpMailer {
    pub fn new(
        relay_url: Option<String>,
        relay_token: Option<String>,
        from: impl Into<String>,
    ) -> ProvisioningResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(RELAY_TIMEOUT)
            .build()
            .map_err(|err| ProvisioningError::Transport(err.to_string()))?;
        if relay_url.is_none() {
            tracing::warn!("MAIL_RELAY_URL is not set; credential mail will not be delivered");
        }
        Ok(Self {
            client,
            relay_url,
            relay_token,
            from: from.into(),
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> bool {
        if !to.contains('@') {
            tracing::warn!(%to, %subject, "outgoing mail refused");
            return false;
        }
        let Some(relay_url) = self.relay_url.as_deref() else {
            tracing::warn!(%to, %subject, "no mail relay configured");
            return false;
        };

        let mut request = self.client.post(relay_url).json(&RelayMessage {
            from: &self.from,
            to,
            subject,
            html: html_body,
        });
        if let Some(token) = self.relay_token.as_deref() {
            request = request.bearer_auth(token);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!(%to, %subject, "mail handed to relay");
                true
            }
            Ok(response) => {
                tracing::warn!(%to, status = %response.status(), "mail relay rejected message");
                false
            }
            Err(err) => {
                tracing::warn!(?err, %to, "mail relay unreachable");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutgoingMessage {
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub queued_at: DateTime<Utc>,
}

/// Keeps outgoing mail in memory. Used by tests and the route fixtures.
#[derive(Default)]
pub struct OutboxMailer {
    outbox: RwLock<Vec<OutgoingMessage>>,
    rejecting: AtomicBool,
}

impl OutboxMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<OutgoingMessage> {
        self.outbox
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// While set, every `send` is refused.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }
}

#[async_trait]
impl Mailer for OutboxMailer {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> bool {
        if self.rejecting.load(Ordering::SeqCst) || !to.contains('@') {
            tracing::warn!(%to, %subject, "outgoing mail refused");
            return false;
        }
        self.outbox
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(OutgoingMessage {
                to: to.to_string(),
                subject: subject.to_string(),
                html_body: html_body.to_string(),
                queued_at: Utc::now(),
            });
        tracing::info!(%to, %subject, "mail queued");
        true
    }
}
