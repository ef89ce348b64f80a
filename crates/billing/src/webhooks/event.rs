//! Provider webhook envelopes, decoded strictly into [`WebhookEventKind`]
//!
//! Only event types the engine acts on are decoded past the envelope; every
//! other type becomes [`WebhookEventKind::Unhandled`] and is acknowledged as
//! a no-op.

use std::collections::HashMap;
use std::str::FromStr;

use meterflow_shared::SubscriptionStatus;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::provider::SubscriptionItemInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Stripe,
    Coinbase,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::Coinbase => "coinbase",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stripe" => Ok(Self::Stripe),
            "coinbase" | "coinbase_commerce" => Ok(Self::Coinbase),
            other => Err(BillingError::ProviderNotConfigured(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEvent {
    pub subscription_id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub items: Vec<SubscriptionItemInfo>,
    pub metadata: HashMap<String, String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentEvent {
    /// Invoice id or charge code
    pub reference: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub failure_reason: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutEvent {
    pub session_id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub client_reference_id: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentMethodEvent {
    pub payment_method_id: String,
    pub customer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventKind {
    SubscriptionCreated(SubscriptionEvent),
    SubscriptionUpdated(SubscriptionEvent),
    SubscriptionCanceled(SubscriptionEvent),
    TrialWillEnd(SubscriptionEvent),
    PaymentSucceeded(PaymentEvent),
    PaymentFailed(PaymentEvent),
    PaymentActionRequired(PaymentEvent),
    CheckoutCompleted(CheckoutEvent),
    PaymentMethodAttached(PaymentMethodEvent),
    PaymentMethodDetached(PaymentMethodEvent),
    Unhandled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub id: String,
    pub provider: ProviderKind,
    pub event_type: String,
    /// Provider-side creation time; orders deliveries for last-write-wins
    pub created: OffsetDateTime,
    pub kind: WebhookEventKind,
}

impl WebhookEvent {
    /// Decode a verified payload
    pub fn decode(provider: ProviderKind, payload: &serde_json::Value) -> BillingResult<Self> {
        match provider {
            ProviderKind::Stripe => decode_stripe(payload),
            ProviderKind::Coinbase => decode_coinbase(payload),
        }
    }

    pub fn is_handled(&self) -> bool {
        !matches!(self.kind, WebhookEventKind::Unhandled)
    }
}

fn invalid(context: &str, err: impl std::fmt::Display) -> BillingError {
    BillingError::WebhookPayloadInvalid(format!("{}: {}", context, err))
}

fn parse_object<T: DeserializeOwned>(event_type: &str, object: serde_json::Value) -> BillingResult<T> {
    serde_json::from_value(object).map_err(|e| invalid(event_type, e))
}

fn from_unix(secs: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs).map_err(|e| invalid("timestamp", e))
}

fn from_unix_opt(secs: Option<i64>) -> BillingResult<Option<OffsetDateTime>> {
    secs.map(from_unix).transpose()
}

// =============================================================================
// Stripe
// =============================================================================

#[derive(Debug, Deserialize)]
struct StripeEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    /// Absent on hand-built payloads; the receive time stands in
    created: Option<i64>,
    data: StripeEnvelopeData,
}

#[derive(Debug, Deserialize)]
struct StripeEnvelopeData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StripeList<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

impl<T> Default for StripeList<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

#[derive(Debug, Deserialize)]
struct StripePrice {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripeItem {
    id: String,
    price: Option<StripePrice>,
}

#[derive(Debug, Deserialize)]
struct StripeSubscriptionObject {
    id: String,
    customer: String,
    status: String,
    #[serde(default)]
    items: StripeList<StripeItem>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
    #[serde(default)]
    cancel_at_period_end: bool,
    canceled_at: Option<i64>,
    trial_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorObject {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeInvoiceObject {
    id: Option<String>,
    customer: Option<String>,
    subscription: Option<String>,
    #[serde(default)]
    amount_paid: i64,
    #[serde(default)]
    amount_due: i64,
    #[serde(default = "default_currency")]
    currency: String,
    last_finalization_error: Option<StripeErrorObject>,
    #[serde(default)]
    attempt_count: u32,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

fn default_currency() -> String {
    "usd".to_string()
}

#[derive(Debug, Deserialize)]
struct StripeCheckoutObject {
    id: String,
    customer: Option<String>,
    subscription: Option<String>,
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct StripePaymentMethodObject {
    id: String,
    customer: Option<String>,
}

impl StripeSubscriptionObject {
    fn into_event(self) -> BillingResult<SubscriptionEvent> {
        Ok(SubscriptionEvent {
            status: SubscriptionStatus::from_provider(&self.status)
                .map_err(|e| invalid("subscription status", e))?,
            items: self
                .items
                .data
                .into_iter()
                .map(|item| SubscriptionItemInfo {
                    item_id: item.id,
                    price_id: item.price.map(|p| p.id),
                })
                .collect(),
            current_period_start: from_unix_opt(self.current_period_start)?,
            current_period_end: from_unix_opt(self.current_period_end)?,
            canceled_at: from_unix_opt(self.canceled_at)?,
            trial_end: from_unix_opt(self.trial_end)?,
            subscription_id: self.id,
            customer_id: self.customer,
            metadata: self.metadata,
            cancel_at_period_end: self.cancel_at_period_end,
        })
    }
}

impl StripeInvoiceObject {
    /// An invoice without an id is referenced by the event that carried it
    fn into_event(self, succeeded: bool, event_id: &str) -> PaymentEvent {
        let failure_reason = if succeeded {
            None
        } else {
            Some(
                self.last_finalization_error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| format!("payment failed after {} attempt(s)", self.attempt_count.max(1))),
            )
        };

        PaymentEvent {
            reference: self.id.unwrap_or_else(|| event_id.to_string()),
            customer_id: self.customer,
            subscription_id: self.subscription,
            amount_cents: if succeeded { self.amount_paid } else { self.amount_due },
            currency: self.currency,
            failure_reason,
            metadata: self.metadata,
        }
    }
}

fn decode_stripe(payload: &serde_json::Value) -> BillingResult<WebhookEvent> {
    let envelope: StripeEnvelope =
        serde_json::from_value(payload.clone()).map_err(|e| invalid("stripe envelope", e))?;
    let event_type = envelope.event_type.as_str();
    let event_id = envelope.id.as_str();
    let object = envelope.data.object;

    let kind = match event_type {
        "customer.subscription.created" => WebhookEventKind::SubscriptionCreated(
            parse_object::<StripeSubscriptionObject>(event_type, object)?.into_event()?,
        ),
        "customer.subscription.updated" => WebhookEventKind::SubscriptionUpdated(
            parse_object::<StripeSubscriptionObject>(event_type, object)?.into_event()?,
        ),
        "customer.subscription.deleted" => WebhookEventKind::SubscriptionCanceled(
            parse_object::<StripeSubscriptionObject>(event_type, object)?.into_event()?,
        ),
        "customer.subscription.trial_will_end" => WebhookEventKind::TrialWillEnd(
            parse_object::<StripeSubscriptionObject>(event_type, object)?.into_event()?,
        ),
        "invoice.paid" | "invoice.payment_succeeded" => WebhookEventKind::PaymentSucceeded(
            parse_object::<StripeInvoiceObject>(event_type, object)?.into_event(true, event_id),
        ),
        "invoice.payment_failed" => WebhookEventKind::PaymentFailed(
            parse_object::<StripeInvoiceObject>(event_type, object)?.into_event(false, event_id),
        ),
        "invoice.payment_action_required" => WebhookEventKind::PaymentActionRequired(
            parse_object::<StripeInvoiceObject>(event_type, object)?.into_event(false, event_id),
        ),
        "checkout.session.completed" => {
            let session: StripeCheckoutObject = parse_object(event_type, object)?;
            WebhookEventKind::CheckoutCompleted(CheckoutEvent {
                session_id: session.id,
                customer_id: session.customer,
                subscription_id: session.subscription,
                client_reference_id: session.client_reference_id,
                metadata: session.metadata,
            })
        }
        "payment_method.attached" | "payment_method.detached" => {
            let method: StripePaymentMethodObject = parse_object(event_type, object)?;
            let event = PaymentMethodEvent {
                payment_method_id: method.id,
                customer_id: method.customer,
            };
            if event_type == "payment_method.attached" {
                WebhookEventKind::PaymentMethodAttached(event)
            } else {
                WebhookEventKind::PaymentMethodDetached(event)
            }
        }
        _ => WebhookEventKind::Unhandled,
    };

    Ok(WebhookEvent {
        created: match envelope.created {
            Some(created) => from_unix(created)?,
            None => OffsetDateTime::now_utc(),
        },
        id: envelope.id,
        provider: ProviderKind::Stripe,
        event_type: envelope.event_type,
        kind,
    })
}

// =============================================================================
// Coinbase Commerce
// =============================================================================

#[derive(Debug, Deserialize)]
struct CoinbaseEnvelope {
    event: CoinbaseEvent,
}

#[derive(Debug, Deserialize)]
struct CoinbaseEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created_at: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CoinbaseMoney {
    amount: String,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct CoinbasePricing {
    local: CoinbaseMoney,
}

#[derive(Debug, Deserialize)]
struct CoinbaseCharge {
    code: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
    pricing: CoinbasePricing,
}

fn amount_to_cents(raw: &str) -> BillingResult<i64> {
    let amount = Decimal::from_str(raw.trim()).map_err(|e| invalid("charge amount", e))?;
    (amount * Decimal::from(100))
        .round()
        .to_i64()
        .ok_or_else(|| invalid("charge amount", raw))
}

impl CoinbaseCharge {
    fn into_event(self, failure_reason: Option<String>) -> BillingResult<PaymentEvent> {
        Ok(PaymentEvent {
            amount_cents: amount_to_cents(&self.pricing.local.amount)?,
            currency: self.pricing.local.currency.to_lowercase(),
            customer_id: self.metadata.get("customer_id").cloned(),
            subscription_id: self.metadata.get("subscription_id").cloned(),
            reference: self.code,
            failure_reason,
            metadata: self.metadata,
        })
    }
}

fn decode_coinbase(payload: &serde_json::Value) -> BillingResult<WebhookEvent> {
    let envelope: CoinbaseEnvelope =
        serde_json::from_value(payload.clone()).map_err(|e| invalid("coinbase envelope", e))?;
    let event = envelope.event;
    let created =
        OffsetDateTime::parse(&event.created_at, &Rfc3339).map_err(|e| invalid("created_at", e))?;

    let kind = match event.event_type.as_str() {
        "charge:confirmed" | "charge:resolved" => WebhookEventKind::PaymentSucceeded(
            parse_object::<CoinbaseCharge>(&event.event_type, event.data)?.into_event(None)?,
        ),
        "charge:failed" => WebhookEventKind::PaymentFailed(
            parse_object::<CoinbaseCharge>(&event.event_type, event.data)?
                .into_event(Some("charge failed or expired".to_string()))?,
        ),
        _ => WebhookEventKind::Unhandled,
    };

    Ok(WebhookEvent {
        id: event.id,
        provider: ProviderKind::Coinbase,
        event_type: event.event_type,
        created,
        kind,
    })
}
