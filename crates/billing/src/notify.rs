//! Subscriber notifications for metering and billing events
//!
//! Delivery is fire-and-forget: a notifier never fails the operation that
//! triggered it. `HttpNotifier` posts JSON to a configured endpoint (the
//! mailer or alerting service), `LogNotifier` only logs, and
//! `MemoryNotifier` keeps everything in memory for tests and dry runs.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use meterflow_shared::SubscriberId;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    UsageWarning,
    OverageBlocked,
    RateLimited,
    PaymentSucceeded,
    PaymentFailed,
    PaymentActionRequired,
    ServiceSuspended,
    TrialEnding,
    SubscriptionCanceled,
    PlanChanged,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::UsageWarning => "usage_warning",
            Self::OverageBlocked => "overage_blocked",
            Self::RateLimited => "rate_limited",
            Self::PaymentSucceeded => "payment_succeeded",
            Self::PaymentFailed => "payment_failed",
            Self::PaymentActionRequired => "payment_action_required",
            Self::ServiceSuspended => "service_suspended",
            Self::TrialEnding => "trial_ending",
            Self::SubscriptionCanceled => "subscription_canceled",
            Self::PlanChanged => "plan_changed",
        };
        f.write_str(name)
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subscriber: &SubscriberId, kind: NotificationKind, payload: serde_json::Value);
}

/// Notification endpoint configuration
#[derive(Debug, Clone, Default)]
pub struct NotifierConfig {
    /// Endpoint receiving POSTed notifications
    pub endpoint: Option<String>,
    /// Bearer token sent with each notification
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl NotifierConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            endpoint: std::env::var("NOTIFY_ENDPOINT").ok().filter(|v| !v.is_empty()),
            api_key: std::env::var("NOTIFY_API_KEY").ok().filter(|v| !v.is_empty()),
            timeout: Duration::from_secs(
                std::env::var("NOTIFY_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5),
            ),
        }
    }

    /// Check if outbound notifications are enabled
    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }
}

#[derive(Debug, Serialize)]
struct NotificationBody<'a> {
    subscriber_id: &'a SubscriberId,
    kind: NotificationKind,
    #[serde(with = "time::serde::rfc3339")]
    sent_at: OffsetDateTime,
    payload: serde_json::Value,
}

/// Posts notifications to an HTTP endpoint
#[derive(Clone)]
pub struct HttpNotifier {
    config: NotifierConfig,
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(config: NotifierConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::new(NotifierConfig::from_env())
    }

    async fn deliver(
        client: reqwest::Client,
        config: NotifierConfig,
        subscriber: SubscriberId,
        kind: NotificationKind,
        payload: serde_json::Value,
    ) {
        let Some(endpoint) = config.endpoint.as_deref() else {
            tracing::debug!(
                subscriber_id = %subscriber,
                kind = %kind,
                "Notifications not configured, skipping"
            );
            return;
        };

        let body = NotificationBody {
            subscriber_id: &subscriber,
            kind,
            sent_at: OffsetDateTime::now_utc(),
            payload,
        };

        let mut request = client.post(endpoint).json(&body);
        if let Some(key) = config.api_key.as_deref() {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(subscriber_id = %subscriber, kind = %kind, "Notification sent");
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::error!(
                    subscriber_id = %subscriber,
                    kind = %kind,
                    status = %status,
                    body = %body,
                    "Failed to send notification - non-fatal"
                );
            }
            Err(e) => {
                tracing::error!(
                    subscriber_id = %subscriber,
                    kind = %kind,
                    error = %e,
                    "Failed to send notification - non-fatal"
                );
            }
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, subscriber: &SubscriberId, kind: NotificationKind, payload: serde_json::Value) {
        // Delivery runs detached so a slow endpoint never holds up billing work
        tokio::spawn(Self::deliver(
            self.client.clone(),
            self.config.clone(),
            subscriber.clone(),
            kind,
            payload,
        ));
    }
}

/// Logs notifications instead of delivering them
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subscriber: &SubscriberId, kind: NotificationKind, payload: serde_json::Value) {
        tracing::info!(
            subscriber_id = %subscriber,
            kind = %kind,
            payload = %payload,
            "Notification"
        );
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub subscriber_id: SubscriberId,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
}

/// Keeps notifications in memory
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<SentNotification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.sent()
            .iter()
            .filter(|n| n.kind == kind)
            .count()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, subscriber: &SubscriberId, kind: NotificationKind, payload: serde_json::Value) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentNotification {
                subscriber_id: subscriber.clone(),
                kind,
                payload,
            });
        }
    }
}
