//! Stripe client configuration and the Stripe [`BillingProvider`]

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use meterflow_shared::{PlanTier, SubscriptionStatus};
use stripe::{Client, CreateUsageRecord, SubscriptionItemId, UsageRecord, UsageRecordAction};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::provider::{
    BillingProvider, CustomerInfo, MeteredPrices, ReportMode, SubscriptionInfo,
    SubscriptionItemInfo, UsageRecordRequest,
};

/// Default allowed clock skew for webhook signatures
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Maximum age of a webhook signature timestamp
    pub webhook_tolerance_secs: i64,
    /// Price IDs for each subscription tier
    pub price_ids: PriceIds,
    /// Metered prices usage is reported against
    pub metered: MeteredPrices,
    pub request_timeout: Duration,
}

/// Stripe price IDs for the paid tiers. Free has no price.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceIds {
    pub starter: String,
    pub professional: String,
    pub enterprise: String,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            webhook_tolerance_secs: std::env::var("STRIPE_WEBHOOK_TOLERANCE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_WEBHOOK_TOLERANCE_SECS),
            price_ids: PriceIds {
                starter: std::env::var("STRIPE_PRICE_STARTER")
                    .map_err(|_| BillingError::Config("STRIPE_PRICE_STARTER not set".to_string()))?,
                professional: std::env::var("STRIPE_PRICE_PROFESSIONAL").map_err(|_| {
                    BillingError::Config("STRIPE_PRICE_PROFESSIONAL not set".to_string())
                })?,
                enterprise: std::env::var("STRIPE_PRICE_ENTERPRISE").map_err(|_| {
                    BillingError::Config("STRIPE_PRICE_ENTERPRISE not set".to_string())
                })?,
            },
            metered: MeteredPrices {
                requests: std::env::var("STRIPE_PRICE_METERED_REQUESTS").ok(),
                compute_units: std::env::var("STRIPE_PRICE_METERED_COMPUTE").ok(),
            },
            request_timeout: Duration::from_secs(
                std::env::var("STRIPE_REQUEST_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            ),
        })
    }

    /// Get price ID for a paid tier
    pub fn price_id_for_tier(&self, tier: PlanTier) -> Option<&str> {
        match tier {
            PlanTier::Free => None,
            PlanTier::Starter => Some(&self.price_ids.starter),
            PlanTier::Professional => Some(&self.price_ids.professional),
            PlanTier::Enterprise => Some(&self.price_ids.enterprise),
        }
    }

    /// Get tier from price ID
    pub fn tier_for_price_id(&self, price_id: &str) -> Option<PlanTier> {
        if price_id == self.price_ids.starter {
            Some(PlanTier::Starter)
        } else if price_id == self.price_ids.professional {
            Some(PlanTier::Professional)
        } else if price_id == self.price_ids.enterprise {
            Some(PlanTier::Enterprise)
        } else {
            None
        }
    }

    /// Highest tier any of the subscription's prices maps to
    pub fn tier_for_subscription(&self, info: &SubscriptionInfo) -> Option<PlanTier> {
        info.items
            .iter()
            .filter_map(|item| item.price_id.as_deref())
            .filter_map(|price| self.tier_for_price_id(price))
            .max_by_key(|tier| tier.rank())
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Client that sends `key` as the idempotency key on every request
    fn idempotent_client(&self, key: &str) -> Client {
        self.client
            .clone()
            .with_strategy(stripe::RequestStrategy::Idempotent(key.to_string()))
    }
}

// Debug implementation that doesn't expose the API key
impl std::fmt::Debug for StripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeClient")
            .field("price_ids", &self.config.price_ids)
            .field("metered", &self.config.metered)
            .finish_non_exhaustive()
    }
}

fn is_not_found(err: &stripe::StripeError) -> bool {
    matches!(err, stripe::StripeError::Stripe(request_error) if request_error.http_status == 404)
}

fn map_status(status: stripe::SubscriptionStatus) -> SubscriptionStatus {
    match status {
        stripe::SubscriptionStatus::Active => SubscriptionStatus::Active,
        stripe::SubscriptionStatus::Canceled => SubscriptionStatus::Canceled,
        stripe::SubscriptionStatus::Incomplete => SubscriptionStatus::Unpaid,
        stripe::SubscriptionStatus::IncompleteExpired => SubscriptionStatus::Expired,
        stripe::SubscriptionStatus::PastDue => SubscriptionStatus::PastDue,
        stripe::SubscriptionStatus::Trialing => SubscriptionStatus::Trialing,
        stripe::SubscriptionStatus::Unpaid => SubscriptionStatus::Unpaid,
        stripe::SubscriptionStatus::Paused => SubscriptionStatus::Unpaid,
    }
}

fn timestamp(secs: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(secs).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn map_subscription(sub: stripe::Subscription) -> SubscriptionInfo {
    let customer_id = match &sub.customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(c) => c.id.to_string(),
    };

    let items = sub
        .items
        .data
        .iter()
        .map(|item| SubscriptionItemInfo {
            item_id: item.id.to_string(),
            price_id: item.price.as_ref().map(|p| p.id.to_string()),
        })
        .collect();

    SubscriptionInfo {
        id: sub.id.to_string(),
        customer_id,
        status: map_status(sub.status),
        items,
        metadata: sub.metadata.into_iter().collect(),
        current_period_start: timestamp(sub.current_period_start),
        current_period_end: timestamp(sub.current_period_end),
        cancel_at_period_end: sub.cancel_at_period_end,
    }
}

#[async_trait]
impl BillingProvider for StripeClient {
    fn name(&self) -> &'static str {
        "stripe"
    }

    fn metered_prices(&self) -> MeteredPrices {
        self.config.metered.clone()
    }

    fn tier_for_price(&self, price_id: &str) -> Option<PlanTier> {
        self.config.tier_for_price_id(price_id)
    }

    async fn report_usage(&self, request: &UsageRecordRequest) -> BillingResult<()> {
        let item_id = request
            .subscription_item
            .parse::<SubscriptionItemId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid metered item ID: {}", e)))?;

        let params = CreateUsageRecord {
            quantity: request.quantity,
            action: Some(match request.mode {
                ReportMode::Increment => UsageRecordAction::Increment,
                ReportMode::Set => UsageRecordAction::Set,
            }),
            timestamp: Some(request.timestamp.unix_timestamp()),
        };

        let client = self.idempotent_client(&request.idempotency_key);
        UsageRecord::create(&client, &item_id, params).await?;

        tracing::debug!(
            subscription_item = %request.subscription_item,
            quantity = request.quantity,
            "Reported usage to Stripe"
        );
        Ok(())
    }

    async fn get_subscription(&self, subscription_id: &str) -> BillingResult<Option<SubscriptionInfo>> {
        let sub_id = subscription_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|_| BillingError::InvalidInput(format!("Invalid subscription ID: {}", subscription_id)))?;

        match stripe::Subscription::retrieve(&self.client, &sub_id, &[]).await {
            Ok(sub) => Ok(Some(map_subscription(sub))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_customer(&self, customer_id: &str) -> BillingResult<Option<CustomerInfo>> {
        let id = customer_id
            .parse::<stripe::CustomerId>()
            .map_err(|_| BillingError::InvalidInput(format!("Invalid customer ID: {}", customer_id)))?;

        match stripe::Customer::retrieve(&self.client, &id, &[]).await {
            Ok(customer) => Ok(Some(CustomerInfo {
                id: customer.id.to_string(),
                metadata: customer
                    .metadata
                    .map(|m| m.into_iter().collect::<HashMap<_, _>>())
                    .unwrap_or_default(),
            })),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
