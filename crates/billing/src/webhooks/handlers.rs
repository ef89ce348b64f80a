//! Per-event-type webhook handlers
//!
//! Each handler is idempotent: redelivering an event leaves the ledger as it
//! was after the first delivery. Events for a subscriber that can't be
//! resolved are acknowledged as ignored instead of failing.

use std::collections::HashMap;
use std::sync::Arc;

use meterflow_shared::{PeriodKey, PlanTier, SubscriberId, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use super::event::{
    CheckoutEvent, PaymentEvent, PaymentMethodEvent, SubscriptionEvent, WebhookEvent,
    WebhookEventKind,
};
use crate::cache::SubscriptionCache;
use crate::config::EngineConfig;
use crate::error::BillingResult;
use crate::ledger::{
    GracePeriod, LedgerStore, PaymentRecord, PaymentStatus, PendingPlanChange, ServiceAccess,
    SubscriptionRecord, SuspensionReason, UpsertOutcome, WebhookOutcome,
};
use crate::notify::{NotificationKind, Notifier};
use crate::overage::OverageService;
use crate::provider::BillingProvider;

const SUBSCRIBER_METADATA_KEY: &str = "subscriber_id";
const PLAN_TIER_METADATA_KEY: &str = "plan_tier";

/// What a handler did with one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub outcome: WebhookOutcome,
    pub actions: Vec<String>,
}

impl HandlerOutcome {
    fn ignored(action: impl Into<String>) -> Self {
        Self {
            outcome: WebhookOutcome::Ignored,
            actions: vec![action.into()],
        }
    }

    fn succeeded(actions: Vec<String>) -> Self {
        Self {
            outcome: WebhookOutcome::Succeeded,
            actions,
        }
    }
}

#[derive(Clone)]
pub(crate) struct WebhookHandlers {
    ledger: Arc<dyn LedgerStore>,
    provider: Arc<dyn BillingProvider>,
    notifier: Arc<dyn Notifier>,
    cache: SubscriptionCache,
    overage: OverageService,
    config: Arc<EngineConfig>,
}

impl WebhookHandlers {
    pub(crate) fn new(
        ledger: Arc<dyn LedgerStore>,
        provider: Arc<dyn BillingProvider>,
        notifier: Arc<dyn Notifier>,
        cache: SubscriptionCache,
        overage: OverageService,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            ledger,
            provider,
            notifier,
            cache,
            overage,
            config,
        }
    }

    pub(crate) async fn handle(&self, event: &WebhookEvent) -> BillingResult<HandlerOutcome> {
        match &event.kind {
            WebhookEventKind::SubscriptionCreated(sub) | WebhookEventKind::SubscriptionUpdated(sub) => {
                self.handle_subscription_upsert(event, sub).await
            }
            WebhookEventKind::SubscriptionCanceled(sub) => {
                self.handle_subscription_canceled(event, sub).await
            }
            WebhookEventKind::TrialWillEnd(sub) => self.handle_trial_will_end(event, sub).await,
            WebhookEventKind::PaymentSucceeded(payment) => {
                self.handle_payment_succeeded(event, payment).await
            }
            WebhookEventKind::PaymentFailed(payment) => self.handle_payment_failed(event, payment).await,
            WebhookEventKind::PaymentActionRequired(payment) => {
                self.handle_action_required(event, payment).await
            }
            WebhookEventKind::CheckoutCompleted(checkout) => {
                self.handle_checkout_completed(event, checkout).await
            }
            WebhookEventKind::PaymentMethodAttached(method) => {
                Ok(self.handle_payment_method(event, method, "attached"))
            }
            WebhookEventKind::PaymentMethodDetached(method) => {
                Ok(self.handle_payment_method(event, method, "detached"))
            }
            WebhookEventKind::Unhandled => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    provider = %event.provider,
                    "Unhandled webhook event type"
                );
                Ok(HandlerOutcome::ignored("unhandled_event_type"))
            }
        }
    }

    /// Map a provider customer to a subscriber: ledger link first, then the
    /// subscriber id carried in event metadata, then the customer's metadata.
    /// A newly discovered mapping is persisted.
    async fn resolve_subscriber(
        &self,
        customer_id: Option<&str>,
        metadata: &HashMap<String, String>,
        reference: Option<&str>,
    ) -> BillingResult<Option<SubscriberId>> {
        if let Some(customer_id) = customer_id {
            if let Some(subscriber) = self.ledger.subscriber_for_customer(customer_id).await? {
                return Ok(Some(subscriber));
            }
        }

        let from_event = metadata
            .get(SUBSCRIBER_METADATA_KEY)
            .map(String::as_str)
            .or(reference)
            .and_then(|raw| SubscriberId::parse(raw).ok());

        let resolved = match (from_event, customer_id) {
            (Some(subscriber), _) => Some(subscriber),
            (None, Some(customer_id)) => self
                .provider
                .get_customer(customer_id)
                .await?
                .and_then(|customer| {
                    customer
                        .metadata
                        .get(SUBSCRIBER_METADATA_KEY)
                        .and_then(|raw| SubscriberId::parse(raw).ok())
                }),
            (None, None) => None,
        };

        if let (Some(subscriber), Some(customer_id)) = (&resolved, customer_id) {
            self.ledger.link_customer(customer_id, subscriber).await?;
            tracing::debug!(subscriber_id = %subscriber, customer_id = %customer_id, "Linked provider customer");
        }

        Ok(resolved)
    }

    fn unresolved(&self, event: &WebhookEvent, customer_id: Option<&str>) -> HandlerOutcome {
        tracing::warn!(
            event_id = %event.id,
            event_type = %event.event_type,
            customer_id = ?customer_id,
            "No subscriber for webhook event, acknowledging without effect"
        );
        HandlerOutcome::ignored("subscriber_not_found")
    }

    fn tier_for(&self, sub: &SubscriptionEvent, fallback: PlanTier) -> PlanTier {
        sub.items
            .iter()
            .filter_map(|item| item.price_id.as_deref())
            .find_map(|price| self.provider.tier_for_price(price))
            .or_else(|| {
                sub.metadata
                    .get(PLAN_TIER_METADATA_KEY)
                    .and_then(|raw| raw.parse::<PlanTier>().ok())
            })
            .unwrap_or(fallback)
    }

    /// Re-run overage policy for the current period after a tier change.
    /// Failure here doesn't fail the event; the next usage write re-evaluates.
    async fn reevaluate_overage(&self, subscriber: &SubscriberId, tier: PlanTier, actions: &mut Vec<String>) {
        match self
            .overage
            .reevaluate(subscriber, tier, &PeriodKey::current())
            .await
        {
            Ok(action) => actions.push(format!("overage_reevaluated:{}", action)),
            Err(e) => {
                tracing::warn!(
                    subscriber_id = %subscriber,
                    error = %e,
                    "Overage re-evaluation after plan change failed"
                );
            }
        }
    }

    async fn handle_subscription_upsert(
        &self,
        event: &WebhookEvent,
        sub: &SubscriptionEvent,
    ) -> BillingResult<HandlerOutcome> {
        let Some(subscriber) = self
            .resolve_subscriber(Some(&sub.customer_id), &sub.metadata, None)
            .await?
        else {
            return Ok(self.unresolved(event, Some(&sub.customer_id)));
        };

        let existing = self.ledger.subscription(&subscriber).await?;
        let previous_tier = existing
            .as_ref()
            .map(SubscriptionRecord::effective_tier)
            .unwrap_or(PlanTier::Free);
        let tier = self.tier_for(
            sub,
            existing.as_ref().map(|r| r.plan_tier).unwrap_or(PlanTier::Free),
        );

        let prices = self.provider.metered_prices();
        let item_for = |price: &Option<String>| {
            price.as_deref().and_then(|price| {
                sub.items
                    .iter()
                    .find(|item| item.price_id.as_deref() == Some(price))
                    .map(|item| item.item_id.clone())
            })
        };

        let record = SubscriptionRecord {
            subscriber_id: subscriber.clone(),
            provider_customer_id: Some(sub.customer_id.clone()),
            provider_subscription_id: Some(sub.subscription_id.clone()),
            plan_tier: tier,
            status: sub.status,
            current_period_start: sub.current_period_start,
            current_period_end: sub.current_period_end,
            cancel_at_period_end: sub.cancel_at_period_end,
            canceled_at: sub.canceled_at,
            metered_request_item: item_for(&prices.requests),
            metered_compute_item: item_for(&prices.compute_units),
            provider_updated_at: event.created,
        };

        if self.ledger.upsert_subscription(&record).await? == UpsertOutcome::Stale {
            tracing::info!(
                subscriber_id = %subscriber,
                event_id = %event.id,
                "Ignoring out-of-order subscription update"
            );
            return Ok(HandlerOutcome::succeeded(vec!["stale_update_skipped".into()]));
        }
        self.cache.invalidate(&subscriber).await;

        let mut actions = vec![format!("subscription_upserted:{}:{}", tier, sub.status)];
        let new_tier = record.effective_tier();

        if new_tier != previous_tier {
            tracing::info!(
                subscriber_id = %subscriber,
                from = %previous_tier,
                to = %new_tier,
                "Plan changed"
            );
            actions.push(format!("plan_changed:{}->{}", previous_tier, new_tier));
            self.reevaluate_overage(&subscriber, new_tier, &mut actions).await;
            self.notifier
                .notify(
                    &subscriber,
                    NotificationKind::PlanChanged,
                    serde_json::json!({ "from": previous_tier, "to": new_tier }),
                )
                .await;
        }

        if let Some(pending) = self.ledger.pending_plan_change(&subscriber).await? {
            if sub.status.grants_access() && tier == pending.target_tier {
                self.ledger.clear_pending_plan_change(&subscriber).await?;
                actions.push("pending_plan_change_cleared".into());
            }
        }

        self.sync_access_with_status(&subscriber, sub.status, &mut actions)
            .await?;

        Ok(HandlerOutcome::succeeded(actions))
    }

    /// `unpaid` suspends service; a recovered subscription lifts that suspension
    async fn sync_access_with_status(
        &self,
        subscriber: &SubscriberId,
        status: SubscriptionStatus,
        actions: &mut Vec<String>,
    ) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc();
        let access = self.ledger.service_access(subscriber).await?;

        if status == SubscriptionStatus::Unpaid && !access.suspended {
            self.ledger
                .set_service_access(&ServiceAccess::suspended(
                    subscriber.clone(),
                    SuspensionReason::Unpaid,
                    now,
                ))
                .await?;
            tracing::warn!(subscriber_id = %subscriber, "Service suspended: subscription unpaid");
            actions.push("service_suspended:unpaid".into());
            self.notifier
                .notify(
                    subscriber,
                    NotificationKind::ServiceSuspended,
                    serde_json::json!({ "reason": SuspensionReason::Unpaid }),
                )
                .await;
        } else if status.grants_access()
            && access.suspended
            && access.reason == Some(SuspensionReason::Unpaid)
        {
            self.ledger
                .set_service_access(&ServiceAccess::enabled(subscriber.clone(), now))
                .await?;
            tracing::info!(subscriber_id = %subscriber, "Service re-enabled: subscription recovered");
            actions.push("service_enabled".into());
        }
        Ok(())
    }

    async fn handle_subscription_canceled(
        &self,
        event: &WebhookEvent,
        sub: &SubscriptionEvent,
    ) -> BillingResult<HandlerOutcome> {
        let Some(subscriber) = self
            .resolve_subscriber(Some(&sub.customer_id), &sub.metadata, None)
            .await?
        else {
            return Ok(self.unresolved(event, Some(&sub.customer_id)));
        };

        let existing = self.ledger.subscription(&subscriber).await?;
        if let Some(current) = existing
            .as_ref()
            .and_then(|r| r.provider_subscription_id.as_deref())
        {
            if current != sub.subscription_id {
                tracing::info!(
                    subscriber_id = %subscriber,
                    canceled = %sub.subscription_id,
                    current = %current,
                    "Cancellation for a superseded subscription, ignoring"
                );
                return Ok(HandlerOutcome::ignored("superseded_subscription"));
            }
        }

        let previous_tier = existing
            .as_ref()
            .map(SubscriptionRecord::effective_tier)
            .unwrap_or(PlanTier::Free);
        let mut record = existing.unwrap_or_else(|| SubscriptionRecord::free(subscriber.clone(), event.created));
        record.provider_customer_id = Some(sub.customer_id.clone());
        record.provider_subscription_id = Some(sub.subscription_id.clone());
        record.plan_tier = PlanTier::Free;
        record.status = SubscriptionStatus::Canceled;
        record.canceled_at = Some(sub.canceled_at.unwrap_or(event.created));
        record.cancel_at_period_end = false;
        record.metered_request_item = None;
        record.metered_compute_item = None;
        record.provider_updated_at = event.created;

        if self.ledger.upsert_subscription(&record).await? == UpsertOutcome::Stale {
            tracing::info!(
                subscriber_id = %subscriber,
                event_id = %event.id,
                "Ignoring out-of-order cancellation"
            );
            return Ok(HandlerOutcome::succeeded(vec!["stale_update_skipped".into()]));
        }
        self.cache.invalidate(&subscriber).await;
        self.ledger.clear_pending_plan_change(&subscriber).await?;

        tracing::info!(subscriber_id = %subscriber, from = %previous_tier, "Subscription canceled");
        let mut actions = vec!["subscription_canceled".to_string()];
        if previous_tier != PlanTier::Free {
            actions.push(format!("plan_changed:{}->{}", previous_tier, PlanTier::Free));
            self.reevaluate_overage(&subscriber, PlanTier::Free, &mut actions)
                .await;
        }

        self.notifier
            .notify(
                &subscriber,
                NotificationKind::SubscriptionCanceled,
                serde_json::json!({ "subscription_id": sub.subscription_id }),
            )
            .await;

        Ok(HandlerOutcome::succeeded(actions))
    }

    async fn handle_trial_will_end(
        &self,
        event: &WebhookEvent,
        sub: &SubscriptionEvent,
    ) -> BillingResult<HandlerOutcome> {
        let Some(subscriber) = self
            .resolve_subscriber(Some(&sub.customer_id), &sub.metadata, None)
            .await?
        else {
            return Ok(self.unresolved(event, Some(&sub.customer_id)));
        };

        let trial_end = sub.trial_end.map(|t| t.unix_timestamp());
        self.notifier
            .notify(
                &subscriber,
                NotificationKind::TrialEnding,
                serde_json::json!({ "subscription_id": sub.subscription_id, "trial_end": trial_end }),
            )
            .await;

        Ok(HandlerOutcome::succeeded(vec!["trial_ending_notified".into()]))
    }

    async fn handle_payment_succeeded(
        &self,
        event: &WebhookEvent,
        payment: &PaymentEvent,
    ) -> BillingResult<HandlerOutcome> {
        let Some(subscriber) = self
            .resolve_subscriber(payment.customer_id.as_deref(), &payment.metadata, None)
            .await?
        else {
            return Ok(self.unresolved(event, payment.customer_id.as_deref()));
        };

        let now = OffsetDateTime::now_utc();
        let mut actions = Vec::new();

        let inserted = self
            .ledger
            .insert_payment(&PaymentRecord {
                id: Uuid::new_v4(),
                subscriber_id: subscriber.clone(),
                provider: event.provider.as_str().to_string(),
                provider_event_id: event.id.clone(),
                provider_reference: payment.reference.clone(),
                amount_cents: payment.amount_cents,
                currency: payment.currency.clone(),
                status: PaymentStatus::Succeeded,
                failure_reason: None,
                created_at: now,
            })
            .await?;
        if inserted {
            actions.push("payment_recorded".to_string());
        }

        let resolved = self.ledger.resolve_grace_periods(&subscriber, now).await?;
        if resolved > 0 {
            tracing::info!(subscriber_id = %subscriber, resolved = resolved, "Grace period cleared by payment");
            actions.push("grace_period_cleared".to_string());
        }

        let access = self.ledger.service_access(&subscriber).await?;
        if access.suspended {
            self.ledger
                .set_service_access(&ServiceAccess::enabled(subscriber.clone(), now))
                .await?;
            tracing::info!(subscriber_id = %subscriber, "Service re-enabled after payment");
            actions.push("service_enabled".to_string());
        }

        if let Some(pending) = self.ledger.pending_plan_change(&subscriber).await? {
            let matches = match (&pending.provider_reference, &payment.subscription_id) {
                (Some(expected), Some(paid)) => expected == paid,
                (None, _) => true,
                (Some(_), None) => false,
            };
            if matches {
                self.apply_pending_upgrade(event, &subscriber, &pending, payment, &mut actions)
                    .await?;
            }
        }

        self.cache.invalidate(&subscriber).await;

        if inserted {
            self.notifier
                .notify(
                    &subscriber,
                    NotificationKind::PaymentSucceeded,
                    serde_json::json!({
                        "amount_cents": payment.amount_cents,
                        "currency": payment.currency,
                        "reference": payment.reference,
                    }),
                )
                .await;
        }

        if actions.is_empty() {
            actions.push("payment_already_recorded".to_string());
        }
        Ok(HandlerOutcome::succeeded(actions))
    }

    async fn apply_pending_upgrade(
        &self,
        event: &WebhookEvent,
        subscriber: &SubscriberId,
        pending: &PendingPlanChange,
        payment: &PaymentEvent,
        actions: &mut Vec<String>,
    ) -> BillingResult<()> {
        let existing = self.ledger.subscription(subscriber).await?;
        let previous_tier = existing
            .as_ref()
            .map(SubscriptionRecord::effective_tier)
            .unwrap_or(PlanTier::Free);
        let mut record = existing.unwrap_or_else(|| SubscriptionRecord::free(subscriber.clone(), event.created));

        record.plan_tier = pending.target_tier;
        record.status = SubscriptionStatus::Active;
        record.canceled_at = None;
        if let Some(customer_id) = &payment.customer_id {
            record.provider_customer_id = Some(customer_id.clone());
        }
        if let Some(subscription_id) = &payment.subscription_id {
            record.provider_subscription_id = Some(subscription_id.clone());
        }
        record.provider_updated_at = record.provider_updated_at.max(event.created);

        self.ledger.upsert_subscription(&record).await?;
        self.ledger.clear_pending_plan_change(subscriber).await?;

        tracing::info!(
            subscriber_id = %subscriber,
            from = %previous_tier,
            to = %pending.target_tier,
            "Applied pending plan upgrade"
        );
        actions.push(format!("plan_changed:{}->{}", previous_tier, pending.target_tier));
        self.reevaluate_overage(subscriber, pending.target_tier, actions)
            .await;
        self.notifier
            .notify(
                subscriber,
                NotificationKind::PlanChanged,
                serde_json::json!({ "from": previous_tier, "to": pending.target_tier }),
            )
            .await;
        Ok(())
    }

    async fn handle_payment_failed(
        &self,
        event: &WebhookEvent,
        payment: &PaymentEvent,
    ) -> BillingResult<HandlerOutcome> {
        let Some(subscriber) = self
            .resolve_subscriber(payment.customer_id.as_deref(), &payment.metadata, None)
            .await?
        else {
            return Ok(self.unresolved(event, payment.customer_id.as_deref()));
        };

        let now = OffsetDateTime::now_utc();
        let reason = payment
            .failure_reason
            .clone()
            .unwrap_or_else(|| "payment_failed".to_string());

        let inserted = self
            .ledger
            .insert_payment(&PaymentRecord {
                id: Uuid::new_v4(),
                subscriber_id: subscriber.clone(),
                provider: event.provider.as_str().to_string(),
                provider_event_id: event.id.clone(),
                provider_reference: payment.reference.clone(),
                amount_cents: payment.amount_cents,
                currency: payment.currency.clone(),
                status: PaymentStatus::Failed,
                failure_reason: Some(reason.clone()),
                created_at: now,
            })
            .await?;

        let grace = self
            .ledger
            .open_grace_period(&GracePeriod::new(
                subscriber.clone(),
                reason.clone(),
                now,
                self.config.payment_grace,
            ))
            .await?;

        tracing::warn!(
            subscriber_id = %subscriber,
            reference = %payment.reference,
            amount_cents = payment.amount_cents,
            grace_ends_at = %grace.ends_at,
            "Payment failed, grace period running"
        );

        let mut actions = vec![format!("grace_period_until:{}", grace.ends_at.unix_timestamp())];
        if inserted {
            actions.insert(0, "payment_failure_recorded".to_string());
            self.notifier
                .notify(
                    &subscriber,
                    NotificationKind::PaymentFailed,
                    serde_json::json!({
                        "amount_cents": payment.amount_cents,
                        "currency": payment.currency,
                        "reason": reason,
                        "grace_ends_at": grace.ends_at.unix_timestamp(),
                    }),
                )
                .await;
        }

        Ok(HandlerOutcome::succeeded(actions))
    }

    async fn handle_action_required(
        &self,
        event: &WebhookEvent,
        payment: &PaymentEvent,
    ) -> BillingResult<HandlerOutcome> {
        let Some(subscriber) = self
            .resolve_subscriber(payment.customer_id.as_deref(), &payment.metadata, None)
            .await?
        else {
            return Ok(self.unresolved(event, payment.customer_id.as_deref()));
        };

        self.notifier
            .notify(
                &subscriber,
                NotificationKind::PaymentActionRequired,
                serde_json::json!({ "reference": payment.reference, "amount_cents": payment.amount_cents }),
            )
            .await;

        Ok(HandlerOutcome::succeeded(vec!["action_required_notified".into()]))
    }

    async fn handle_checkout_completed(
        &self,
        event: &WebhookEvent,
        checkout: &CheckoutEvent,
    ) -> BillingResult<HandlerOutcome> {
        let Some(subscriber) = self
            .resolve_subscriber(
                checkout.customer_id.as_deref(),
                &checkout.metadata,
                checkout.client_reference_id.as_deref(),
            )
            .await?
        else {
            return Ok(self.unresolved(event, checkout.customer_id.as_deref()));
        };

        let mut actions = vec!["checkout_linked".to_string()];

        let target = checkout
            .metadata
            .get(PLAN_TIER_METADATA_KEY)
            .and_then(|raw| raw.parse::<PlanTier>().ok());
        if let Some(target) = target {
            let current = self.cache.get(&subscriber).await?.effective_tier();
            if target.is_upgrade_from(current) {
                self.ledger
                    .set_pending_plan_change(&PendingPlanChange {
                        subscriber_id: subscriber.clone(),
                        target_tier: target,
                        provider_reference: checkout.subscription_id.clone(),
                        created_at: OffsetDateTime::now_utc(),
                    })
                    .await?;
                tracing::info!(
                    subscriber_id = %subscriber,
                    session_id = %checkout.session_id,
                    target = %target,
                    "Plan upgrade pending first payment"
                );
                actions.push(format!("pending_plan_change:{}", target));
            }
        }

        self.cache.invalidate(&subscriber).await;
        Ok(HandlerOutcome::succeeded(actions))
    }

    fn handle_payment_method(
        &self,
        event: &WebhookEvent,
        method: &PaymentMethodEvent,
        change: &str,
    ) -> HandlerOutcome {
        tracing::info!(
            event_id = %event.id,
            payment_method_id = %method.payment_method_id,
            customer_id = ?method.customer_id,
            change = change,
            "Payment method changed"
        );
        HandlerOutcome::succeeded(vec![format!("payment_method_{}", change)])
    }
}
