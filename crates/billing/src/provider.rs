//! Billing provider seam
//!
//! The sync orchestrator reports usage through [`BillingProvider`] and the
//! webhook handlers use it to look up subscriptions and customers. Stripe
//! implements it in [`crate::client`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use meterflow_shared::{PlanTier, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportMode {
    /// Add the quantity to what the provider already has
    Increment,
    /// Overwrite the provider's quantity
    Set,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecordRequest {
    pub subscription_item: String,
    pub quantity: u64,
    pub timestamp: OffsetDateTime,
    pub mode: ReportMode,
    /// Same key for the same report, so a retried call is applied once
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionItemInfo {
    pub item_id: String,
    pub price_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub items: Vec<SubscriptionItemInfo>,
    pub metadata: HashMap<String, String>,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
}

impl SubscriptionInfo {
    pub fn item_for_price(&self, price_id: &str) -> Option<&SubscriptionItemInfo> {
        self.items
            .iter()
            .find(|item| item.price_id.as_deref() == Some(price_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub id: String,
    pub metadata: HashMap<String, String>,
}

/// Metered price ids the engine reports against
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeteredPrices {
    pub requests: Option<String>,
    pub compute_units: Option<String>,
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn metered_prices(&self) -> MeteredPrices;

    /// Plan tier a subscription price corresponds to
    fn tier_for_price(&self, price_id: &str) -> Option<PlanTier>;

    async fn report_usage(&self, request: &UsageRecordRequest) -> BillingResult<()>;

    /// `None` when the provider has no such subscription
    async fn get_subscription(&self, subscription_id: &str) -> BillingResult<Option<SubscriptionInfo>>;

    async fn get_customer(&self, customer_id: &str) -> BillingResult<Option<CustomerInfo>>;
}

/// Report one usage record with a per-attempt timeout, retrying transient
/// failures with jittered exponential backoff.
pub async fn report_with_retry(
    provider: &dyn BillingProvider,
    request: &UsageRecordRequest,
    timeout: Duration,
    max_retries: usize,
) -> BillingResult<()> {
    use tokio_retry::strategy::{jitter, ExponentialBackoff};
    use tokio_retry::Retry;

    let retry_strategy = ExponentialBackoff::from_millis(100)
        .max_delay(Duration::from_secs(5))
        .take(max_retries)
        .map(jitter);

    Retry::spawn(retry_strategy, || async {
        let result = match tokio::time::timeout(timeout, provider.report_usage(request)).await {
            Ok(result) => result,
            Err(_) => Err(BillingError::ProviderTimeout(format!(
                "report_usage exceeded {}s",
                timeout.as_secs()
            ))),
        };

        match &result {
            Ok(_) => Ok(result),
            Err(e) if e.is_retryable() => {
                tracing::debug!(
                    subscription_item = %request.subscription_item,
                    error = %e,
                    "Transient provider error - will retry"
                );
                Err(result)
            }
            Err(e) => {
                tracing::debug!(
                    subscription_item = %request.subscription_item,
                    error = %e,
                    "Permanent provider error - will not retry"
                );
                Ok(result)
            }
        }
    })
    .await
    .unwrap_or_else(|e| e)
}
