//! Billing error types

use meterflow_shared::SharedError;
use thiserror::Error;

/// Metering and billing errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Billing provider error: {0}")]
    Provider(String),

    #[error("Billing provider rejected request: {0}")]
    ProviderRejected(String),

    #[error("Billing provider timed out: {0}")]
    ProviderTimeout(String),

    #[error("Billing provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("Counter store error: {0}")]
    CounterStore(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook payload invalid: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Webhook event is already being processed: {0}")]
    WebhookInFlight(String),

    #[error("Webhook event not found: {0}")]
    WebhookEventNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Shared(#[from] SharedError),
}

impl BillingError {
    /// Transient infrastructure failures that leave state unchanged and are
    /// safe to retry. Everything else is permanent for the given input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::Provider(_)
                | BillingError::ProviderTimeout(_)
                | BillingError::CounterStore(_)
                | BillingError::Database(_)
                | BillingError::WebhookInFlight(_)
                | BillingError::Internal(_)
        )
    }

    /// HTTP status a webhook endpoint should answer with.
    ///
    /// Providers retry on any non-2xx, so permanent rejections use 4xx and
    /// transient failures use 5xx.
    pub fn status_code(&self) -> u16 {
        match self {
            BillingError::WebhookSignatureInvalid => 400,
            BillingError::WebhookPayloadInvalid(_) | BillingError::InvalidInput(_) => 400,
            BillingError::ProviderNotConfigured(_) => 400,
            BillingError::WebhookEventNotFound(_) | BillingError::SubscriptionNotFound(_) => 404,
            BillingError::WebhookInFlight(_) => 409,
            BillingError::ProviderTimeout(_) => 504,
            BillingError::Provider(_) | BillingError::ProviderRejected(_) => 502,
            BillingError::CounterStore(_) | BillingError::Database(_) => 503,
            BillingError::Config(_) | BillingError::Internal(_) | BillingError::Shared(_) => 500,
        }
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match err {
            // Rate limited or server side: worth another attempt
            stripe::StripeError::Stripe(ref request_error)
                if request_error.http_status == 429 || request_error.http_status >= 500 =>
            {
                BillingError::Provider(err.to_string())
            }
            stripe::StripeError::Stripe(ref request_error) => BillingError::ProviderRejected(
                request_error
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("HTTP {}", request_error.http_status)),
            ),
            stripe::StripeError::Timeout => BillingError::ProviderTimeout(err.to_string()),
            other => BillingError::Provider(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<redis::RedisError> for BillingError {
    fn from(err: redis::RedisError) -> Self {
        BillingError::CounterStore(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::WebhookPayloadInvalid(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BillingError::ProviderTimeout(err.to_string())
        } else {
            BillingError::Provider(err.to_string())
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
