//! Ledger store: the durable, authoritative side of metering
//!
//! Subscriptions, billing-period rollups, payment history, grace periods,
//! overage accrual, service access and the webhook audit log. Postgres in
//! production; an in-memory implementation backs tests and local runs.

mod memory;
mod postgres;

pub use self::memory::MemoryLedgerStore;
pub use self::postgres::PgLedgerStore;

use async_trait::async_trait;
use meterflow_shared::{PeriodKey, PlanTier, SubscriberId, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub subscriber_id: SubscriberId,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub plan_tier: PlanTier,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    /// Provider subscription item that request charges are reported to
    pub metered_request_item: Option<String>,
    /// Provider subscription item that compute-unit charges are reported to
    pub metered_compute_item: Option<String>,
    /// Provider-reported ordering field; newer wins
    #[serde(with = "time::serde::rfc3339")]
    pub provider_updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// A free-tier record for a subscriber the provider has never told us about
    pub fn free(subscriber_id: SubscriberId, at: OffsetDateTime) -> Self {
        Self {
            subscriber_id,
            provider_customer_id: None,
            provider_subscription_id: None,
            plan_tier: PlanTier::Free,
            status: SubscriptionStatus::Active,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            canceled_at: None,
            metered_request_item: None,
            metered_compute_item: None,
            provider_updated_at: at,
        }
    }

    /// Tier whose limits apply right now. Lapsed subscriptions fall back to free.
    pub fn effective_tier(&self) -> PlanTier {
        if self.status.grants_access() {
            self.plan_tier
        } else {
            PlanTier::Free
        }
    }

    pub fn has_metered_items(&self) -> bool {
        self.metered_request_item.is_some() || self.metered_compute_item.is_some()
    }
}

/// Result of a last-write-wins upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Applied,
    /// The stored record carries a newer provider timestamp
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingPeriod {
    pub subscriber_id: SubscriberId,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub requests_used: i64,
    pub compute_units_used: i64,
    pub bandwidth_bytes: i64,
    pub overage_requests: i64,
    pub overage_cost_cents: i64,
    /// Request charges already reported to the provider
    pub request_cost_cents: i64,
    /// Compute-unit charges already reported to the provider
    pub compute_cost_cents: i64,
    pub total_cost_cents: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub synced_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub closed_at: Option<OffsetDateTime>,
}

impl BillingPeriod {
    pub fn open(subscriber_id: SubscriberId, period: &PeriodKey) -> Self {
        Self {
            subscriber_id,
            period_start: period.start,
            period_end: period.end,
            requests_used: 0,
            compute_units_used: 0,
            bandwidth_bytes: 0,
            overage_requests: 0,
            overage_cost_cents: 0,
            request_cost_cents: 0,
            compute_cost_cents: 0,
            total_cost_cents: 0,
            synced_at: None,
            closed_at: None,
        }
    }

    pub fn period(&self) -> PeriodKey {
        PeriodKey::containing(self.period_start)
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub subscriber_id: SubscriberId,
    pub provider: String,
    /// Event that produced the row; unique, so a redelivery inserts nothing
    pub provider_event_id: String,
    /// Invoice or charge id. One invoice can fail and then be paid.
    pub provider_reference: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub failure_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct GracePeriod {
    pub id: Uuid,
    pub subscriber_id: SubscriberId,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ends_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub enforced_at: Option<OffsetDateTime>,
}

impl GracePeriod {
    pub fn new(
        subscriber_id: SubscriberId,
        reason: impl Into<String>,
        started_at: OffsetDateTime,
        length: time::Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscriber_id,
            reason: reason.into(),
            started_at,
            ends_at: started_at + length,
            resolved_at: None,
            enforced_at: None,
        }
    }
}

/// A plan upgrade waiting on its first successful payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PendingPlanChange {
    pub subscriber_id: SubscriberId,
    pub target_tier: PlanTier,
    /// Provider subscription the upgrade belongs to, when known
    pub provider_reference: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverageLedgerEntry {
    pub subscriber_id: SubscriberId,
    pub period: PeriodKey,
    pub accrued_cents: i64,
    pub cap_cents: Option<i64>,
    pub blocked: bool,
}

impl OverageLedgerEntry {
    pub fn new(subscriber_id: SubscriberId, period: PeriodKey, cap_cents: Option<i64>) -> Self {
        Self {
            subscriber_id,
            period,
            accrued_cents: 0,
            cap_cents,
            blocked: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SuspensionReason {
    /// Payment grace period ran out
    PaymentOverdue,
    /// Provider moved the subscription to `unpaid`
    Unpaid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ServiceAccess {
    pub subscriber_id: SubscriberId,
    pub suspended: bool,
    pub reason: Option<SuspensionReason>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ServiceAccess {
    pub fn enabled(subscriber_id: SubscriberId, at: OffsetDateTime) -> Self {
        Self {
            subscriber_id,
            suspended: false,
            reason: None,
            updated_at: at,
        }
    }

    pub fn suspended(subscriber_id: SubscriberId, reason: SuspensionReason, at: OffsetDateTime) -> Self {
        Self {
            subscriber_id,
            suspended: true,
            reason: Some(reason),
            updated_at: at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WebhookOutcome {
    Processing,
    Succeeded,
    /// Acknowledged without effect: unknown type or unresolvable subscriber
    Ignored,
    Failed,
}

impl WebhookOutcome {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Ignored)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub provider: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    pub outcome: WebhookOutcome,
    pub error: Option<String>,
    pub attempts: i32,
}

/// What the audit log says about an incoming delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAdmission {
    /// First time this event id has been seen
    New,
    /// Seen before but never completed; handlers run again
    Retry { attempt: i32 },
    /// Already completed; nothing to do
    AlreadyProcessed,
}

// =============================================================================
// Store
// =============================================================================

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // Subscriptions

    async fn subscription(&self, subscriber: &SubscriberId)
        -> BillingResult<Option<SubscriptionRecord>>;

    /// Insert or replace the record unless the stored one has a newer
    /// `provider_updated_at`.
    async fn upsert_subscription(&self, record: &SubscriptionRecord) -> BillingResult<UpsertOutcome>;

    async fn set_metered_items(
        &self,
        subscriber: &SubscriberId,
        request_item: Option<&str>,
        compute_item: Option<&str>,
    ) -> BillingResult<()>;

    // Customers

    async fn subscriber_for_customer(&self, customer_id: &str)
        -> BillingResult<Option<SubscriberId>>;

    async fn link_customer(&self, customer_id: &str, subscriber: &SubscriberId)
        -> BillingResult<()>;

    // Billing periods

    async fn billing_period(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
    ) -> BillingResult<Option<BillingPeriod>>;

    async fn save_billing_period(&self, period: &BillingPeriod) -> BillingResult<()>;

    async fn close_billing_period(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
        at: OffsetDateTime,
    ) -> BillingResult<()>;

    // Payments

    /// False when a row with the same provider reference already exists
    async fn insert_payment(&self, payment: &PaymentRecord) -> BillingResult<bool>;

    async fn payments(&self, subscriber: &SubscriberId) -> BillingResult<Vec<PaymentRecord>>;

    // Grace periods

    /// Open a grace period, or return the one already open
    async fn open_grace_period(&self, grace: &GracePeriod) -> BillingResult<GracePeriod>;

    async fn active_grace_period(&self, subscriber: &SubscriberId)
        -> BillingResult<Option<GracePeriod>>;

    async fn resolve_grace_periods(
        &self,
        subscriber: &SubscriberId,
        at: OffsetDateTime,
    ) -> BillingResult<u64>;

    /// Unresolved, unenforced grace periods that ended at or before `now`
    async fn expired_grace_periods(&self, now: OffsetDateTime) -> BillingResult<Vec<GracePeriod>>;

    async fn mark_grace_enforced(&self, id: Uuid, at: OffsetDateTime) -> BillingResult<()>;

    // Plan changes

    async fn set_pending_plan_change(&self, change: &PendingPlanChange) -> BillingResult<()>;

    async fn pending_plan_change(&self, subscriber: &SubscriberId)
        -> BillingResult<Option<PendingPlanChange>>;

    async fn clear_pending_plan_change(&self, subscriber: &SubscriberId) -> BillingResult<()>;

    // Overage

    async fn overage_entry(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
    ) -> BillingResult<Option<OverageLedgerEntry>>;

    async fn save_overage_entry(&self, entry: &OverageLedgerEntry) -> BillingResult<()>;

    // Service access

    async fn service_access(&self, subscriber: &SubscriberId) -> BillingResult<ServiceAccess>;

    async fn set_service_access(&self, access: &ServiceAccess) -> BillingResult<()>;

    // Webhook audit log

    /// Durably record a delivery before any side effects
    async fn record_webhook_received(
        &self,
        event_id: &str,
        provider: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<WebhookAdmission>;

    async fn webhook_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>>;

    async fn complete_webhook(
        &self,
        event_id: &str,
        outcome: WebhookOutcome,
        error: Option<&str>,
    ) -> BillingResult<()>;

    async fn failed_webhooks(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>>;

    /// Delete audit rows received before `before`; returns rows removed
    async fn purge_webhook_events(&self, before: OffsetDateTime) -> BillingResult<u64>;
}
