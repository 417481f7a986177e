//! Outbound notification sink.
//!
//! Every outbound message is a [`Notification`] envelope tagged by `kind`.
//! Delivery is best effort: callers log a [`DeliveryError`] and carry on, a
//! failed send never rolls back a settlement.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::model::{ResourceId, UserId};
use crate::version::user_agent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// Secret code for the buyer of a resource.
    BuyerDelivery {
        user_id: UserId,
        resource_id: ResourceId,
        identifier: String,
        code: String,
        text: String,
        /// Tells the buyer the sale is complete and devices can be managed
        /// until the session is torn down.
        prompt: String,
    },
    /// Raw inbound text for an admin monitoring a session.
    MonitorForward {
        admin_id: UserId,
        resource_id: ResourceId,
        identifier: String,
        text: String,
    },
    /// One-time confirmation that a sale was completed.
    SoldReport {
        resource_id: ResourceId,
        category: String,
        masked_identifier: String,
        price: Option<i64>,
        buyer_id: Option<UserId>,
        buyer_name: Option<String>,
    },
    /// Diagnostics for administrators.
    AdminAlert {
        admin_id: UserId,
        #[serde(skip_serializing_if = "Option::is_none")]
        resource_id: Option<ResourceId>,
        message: String,
    },
}

/// Shown to the buyer next to the delivered code.
pub const DEVICE_PROMPT: &str =
    "Purchase complete. You can manage this account's devices for a few minutes.";

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BuyerDelivery { .. } => "buyer_delivery",
            Self::MonitorForward { .. } => "monitor_forward",
            Self::SoldReport { .. } => "sold_report",
            Self::AdminAlert { .. } => "admin_alert",
        }
    }

    pub fn resource_id(&self) -> Option<ResourceId> {
        match self {
            Self::BuyerDelivery { resource_id, .. }
            | Self::MonitorForward { resource_id, .. }
            | Self::SoldReport { resource_id, .. } => Some(*resource_id),
            Self::AdminAlert { resource_id, .. } => *resource_id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("notification rejected with status {0}")]
    Status(u16),
    #[error("notification transport failed: {0}")]
    Transport(String),
    #[error("notification client setup failed: {0}")]
    Setup(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), DeliveryError>;
}

/// Send an [`Notification::AdminAlert`] to every admin. Failures are logged.
pub async fn alert_admins(
    notifier: &dyn Notifier,
    admins: &[UserId],
    resource_id: Option<ResourceId>,
    message: &str,
) {
    if admins.is_empty() {
        tracing::warn!(resource_id = ?resource_id, message, "Admin alert with no admins configured");
        return;
    }
    for &admin_id in admins {
        let alert = Notification::AdminAlert {
            admin_id,
            resource_id,
            message: message.to_string(),
        };
        if let Err(e) = notifier.notify(alert).await {
            tracing::warn!(admin_id, error = %e, "Failed to deliver admin alert");
        }
    }
}

/// Sink used when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), DeliveryError> {
        // Codes never reach the log, only the envelope kind.
        tracing::info!(
            kind = notification.kind(),
            resource_id = ?notification.resource_id(),
            "Notification (no webhook configured)"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub auth_token: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub retry_status_codes: Vec<u16>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            auth_token: None,
            timeout: Duration::from_secs(30),
            max_retries: 6,
            backoff_base: Duration::from_millis(100),
            retry_status_codes: vec![429, 500, 502, 503, 504],
        }
    }
}

/// Posts notification envelopes to the presentation layer.
pub struct WebhookNotifier {
    url: String,
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String, config: WebhookConfig) -> Result<Self, DeliveryError> {
        let mut headers = reqwest::header::HeaderMap::new();

        if let Some(ref token) = config.auth_token
            && let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
        {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        if let Ok(value) = reqwest::header::HeaderValue::from_str(&user_agent()) {
            headers.insert(reqwest::header::USER_AGENT, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| DeliveryError::Setup(e.to_string()))?;

        Ok(Self {
            url,
            config,
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config.backoff_base * (1 << attempt.min(10))
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    /// Send with exponential backoff on retryable statuses and transport errors.
    async fn notify(&self, notification: Notification) -> Result<(), DeliveryError> {
        let kind = notification.kind();
        let mut attempt = 0;
        loop {
            match self.client.post(&self.url).json(&notification).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        tracing::debug!(kind, status, "Notification delivered");
                        return Ok(());
                    }

                    if !self.config.retry_status_codes.contains(&status) {
                        return Err(DeliveryError::Status(status));
                    }

                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(DeliveryError::Status(status));
                    }
                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        kind,
                        status,
                        attempt,
                        backoff_ms = backoff.as_millis(),
                        "Notification failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(DeliveryError::Transport(e.to_string()));
                    }
                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        kind,
                        error = %e,
                        attempt,
                        backoff_ms = backoff.as_millis(),
                        "Notification request error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
