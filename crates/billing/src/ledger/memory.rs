//! In-memory ledger store (for development without Postgres, and tests)

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use meterflow_shared::{PeriodKey, SubscriberId};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    BillingPeriod, GracePeriod, LedgerStore, OverageLedgerEntry, PaymentRecord,
    PendingPlanChange, ServiceAccess, SubscriptionRecord, UpsertOutcome, WebhookAdmission,
    WebhookEventRecord, WebhookOutcome,
};
use crate::error::{BillingError, BillingResult};

type PeriodKeyed = (SubscriberId, OffsetDateTime);

#[derive(Default)]
struct State {
    subscriptions: HashMap<SubscriberId, SubscriptionRecord>,
    customers: HashMap<String, SubscriberId>,
    periods: HashMap<PeriodKeyed, BillingPeriod>,
    payments: Vec<PaymentRecord>,
    grace_periods: Vec<GracePeriod>,
    pending_changes: HashMap<SubscriberId, PendingPlanChange>,
    overage: HashMap<PeriodKeyed, OverageLedgerEntry>,
    access: HashMap<SubscriberId, ServiceAccess>,
    webhooks: HashMap<String, WebhookEventRecord>,
}

/// Ledger held in process memory. Mirrors the Postgres semantics, including
/// the conflict rules the SQL encodes.
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: RwLock<State>,
    offline: AtomicBool,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail as if the database were unreachable
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> BillingResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BillingError::Database("ledger unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn subscription(
        &self,
        subscriber: &SubscriberId,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.check_online()?;
        Ok(self.state.read().await.subscriptions.get(subscriber).cloned())
    }

    async fn upsert_subscription(
        &self,
        record: &SubscriptionRecord,
    ) -> BillingResult<UpsertOutcome> {
        self.check_online()?;
        let mut state = self.state.write().await;
        if let Some(existing) = state.subscriptions.get(&record.subscriber_id) {
            if existing.provider_updated_at > record.provider_updated_at {
                return Ok(UpsertOutcome::Stale);
            }
        }
        state
            .subscriptions
            .insert(record.subscriber_id.clone(), record.clone());
        Ok(UpsertOutcome::Applied)
    }

    async fn set_metered_items(
        &self,
        subscriber: &SubscriberId,
        request_item: Option<&str>,
        compute_item: Option<&str>,
    ) -> BillingResult<()> {
        self.check_online()?;
        let mut state = self.state.write().await;
        if let Some(record) = state.subscriptions.get_mut(subscriber) {
            record.metered_request_item = request_item.map(str::to_string);
            record.metered_compute_item = compute_item.map(str::to_string);
        }
        Ok(())
    }

    async fn subscriber_for_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<SubscriberId>> {
        self.check_online()?;
        let state = self.state.read().await;
        if let Some(subscriber) = state.customers.get(customer_id) {
            return Ok(Some(subscriber.clone()));
        }
        Ok(state
            .subscriptions
            .values()
            .find(|s| s.provider_customer_id.as_deref() == Some(customer_id))
            .map(|s| s.subscriber_id.clone()))
    }

    async fn link_customer(
        &self,
        customer_id: &str,
        subscriber: &SubscriberId,
    ) -> BillingResult<()> {
        self.check_online()?;
        self.state
            .write()
            .await
            .customers
            .insert(customer_id.to_string(), subscriber.clone());
        Ok(())
    }

    async fn billing_period(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
    ) -> BillingResult<Option<BillingPeriod>> {
        self.check_online()?;
        let state = self.state.read().await;
        Ok(state
            .periods
            .get(&(subscriber.clone(), period.start))
            .cloned())
    }

    async fn save_billing_period(&self, period: &BillingPeriod) -> BillingResult<()> {
        self.check_online()?;
        let mut state = self.state.write().await;
        let key = (period.subscriber_id.clone(), period.period_start);
        let mut next = period.clone();
        if let Some(existing) = state.periods.get(&key) {
            next.closed_at = existing.closed_at.or(period.closed_at);
        }
        state.periods.insert(key, next);
        Ok(())
    }

    async fn close_billing_period(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
        at: OffsetDateTime,
    ) -> BillingResult<()> {
        self.check_online()?;
        let mut state = self.state.write().await;
        if let Some(row) = state.periods.get_mut(&(subscriber.clone(), period.start)) {
            if row.closed_at.is_none() {
                row.closed_at = Some(at);
            }
        }
        Ok(())
    }

    async fn insert_payment(&self, payment: &PaymentRecord) -> BillingResult<bool> {
        self.check_online()?;
        let mut state = self.state.write().await;
        if state
            .payments
            .iter()
            .any(|p| p.provider_event_id == payment.provider_event_id)
        {
            return Ok(false);
        }
        state.payments.push(payment.clone());
        Ok(true)
    }

    async fn payments(&self, subscriber: &SubscriberId) -> BillingResult<Vec<PaymentRecord>> {
        self.check_online()?;
        let state = self.state.read().await;
        let mut rows: Vec<PaymentRecord> = state
            .payments
            .iter()
            .filter(|p| &p.subscriber_id == subscriber)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn open_grace_period(&self, grace: &GracePeriod) -> BillingResult<GracePeriod> {
        self.check_online()?;
        let mut state = self.state.write().await;
        if let Some(open) = state
            .grace_periods
            .iter()
            .find(|g| g.subscriber_id == grace.subscriber_id && g.resolved_at.is_none())
        {
            return Ok(open.clone());
        }
        state.grace_periods.push(grace.clone());
        Ok(grace.clone())
    }

    async fn active_grace_period(
        &self,
        subscriber: &SubscriberId,
    ) -> BillingResult<Option<GracePeriod>> {
        self.check_online()?;
        let state = self.state.read().await;
        Ok(state
            .grace_periods
            .iter()
            .find(|g| &g.subscriber_id == subscriber && g.resolved_at.is_none())
            .cloned())
    }

    async fn resolve_grace_periods(
        &self,
        subscriber: &SubscriberId,
        at: OffsetDateTime,
    ) -> BillingResult<u64> {
        self.check_online()?;
        let mut state = self.state.write().await;
        let mut resolved = 0;
        for grace in state
            .grace_periods
            .iter_mut()
            .filter(|g| &g.subscriber_id == subscriber && g.resolved_at.is_none())
        {
            grace.resolved_at = Some(at);
            resolved += 1;
        }
        Ok(resolved)
    }

    async fn expired_grace_periods(&self, now: OffsetDateTime) -> BillingResult<Vec<GracePeriod>> {
        self.check_online()?;
        let state = self.state.read().await;
        let mut rows: Vec<GracePeriod> = state
            .grace_periods
            .iter()
            .filter(|g| g.resolved_at.is_none() && g.enforced_at.is_none() && g.ends_at <= now)
            .cloned()
            .collect();
        rows.sort_by_key(|g| g.ends_at);
        Ok(rows)
    }

    async fn mark_grace_enforced(&self, id: Uuid, at: OffsetDateTime) -> BillingResult<()> {
        self.check_online()?;
        let mut state = self.state.write().await;
        if let Some(grace) = state.grace_periods.iter_mut().find(|g| g.id == id) {
            grace.enforced_at = Some(at);
        }
        Ok(())
    }

    async fn set_pending_plan_change(&self, change: &PendingPlanChange) -> BillingResult<()> {
        self.check_online()?;
        self.state
            .write()
            .await
            .pending_changes
            .insert(change.subscriber_id.clone(), change.clone());
        Ok(())
    }

    async fn pending_plan_change(
        &self,
        subscriber: &SubscriberId,
    ) -> BillingResult<Option<PendingPlanChange>> {
        self.check_online()?;
        Ok(self.state.read().await.pending_changes.get(subscriber).cloned())
    }

    async fn clear_pending_plan_change(&self, subscriber: &SubscriberId) -> BillingResult<()> {
        self.check_online()?;
        self.state.write().await.pending_changes.remove(subscriber);
        Ok(())
    }

    async fn overage_entry(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
    ) -> BillingResult<Option<OverageLedgerEntry>> {
        self.check_online()?;
        let state = self.state.read().await;
        Ok(state
            .overage
            .get(&(subscriber.clone(), period.start))
            .cloned())
    }

    async fn save_overage_entry(&self, entry: &OverageLedgerEntry) -> BillingResult<()> {
        self.check_online()?;
        let mut state = self.state.write().await;
        let key = (entry.subscriber_id.clone(), entry.period.start);
        let mut next = entry.clone();
        if let Some(existing) = state.overage.get(&key) {
            next.accrued_cents = next.accrued_cents.max(existing.accrued_cents);
        }
        state.overage.insert(key, next);
        Ok(())
    }

    async fn service_access(&self, subscriber: &SubscriberId) -> BillingResult<ServiceAccess> {
        self.check_online()?;
        let state = self.state.read().await;
        Ok(state.access.get(subscriber).cloned().unwrap_or_else(|| {
            ServiceAccess::enabled(subscriber.clone(), OffsetDateTime::UNIX_EPOCH)
        }))
    }

    async fn set_service_access(&self, access: &ServiceAccess) -> BillingResult<()> {
        self.check_online()?;
        self.state
            .write()
            .await
            .access
            .insert(access.subscriber_id.clone(), access.clone());
        Ok(())
    }

    async fn record_webhook_received(
        &self,
        event_id: &str,
        provider: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<WebhookAdmission> {
        self.check_online()?;
        let mut state = self.state.write().await;
        match state.webhooks.get_mut(event_id) {
            Some(existing) if existing.outcome.is_final() => Ok(WebhookAdmission::AlreadyProcessed),
            Some(existing) => {
                existing.attempts += 1;
                existing.outcome = WebhookOutcome::Processing;
                existing.error = None;
                Ok(WebhookAdmission::Retry {
                    attempt: existing.attempts,
                })
            }
            None => {
                state.webhooks.insert(
                    event_id.to_string(),
                    WebhookEventRecord {
                        event_id: event_id.to_string(),
                        provider: provider.to_string(),
                        event_type: event_type.to_string(),
                        payload: payload.clone(),
                        received_at: OffsetDateTime::now_utc(),
                        processed_at: None,
                        outcome: WebhookOutcome::Processing,
                        error: None,
                        attempts: 1,
                    },
                );
                Ok(WebhookAdmission::New)
            }
        }
    }

    async fn webhook_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        self.check_online()?;
        Ok(self.state.read().await.webhooks.get(event_id).cloned())
    }

    async fn complete_webhook(
        &self,
        event_id: &str,
        outcome: WebhookOutcome,
        error: Option<&str>,
    ) -> BillingResult<()> {
        self.check_online()?;
        let mut state = self.state.write().await;
        if let Some(record) = state.webhooks.get_mut(event_id) {
            record.outcome = outcome;
            record.error = error.map(str::to_string);
            if outcome.is_final() {
                record.processed_at = Some(OffsetDateTime::now_utc());
            }
        }
        Ok(())
    }

    async fn failed_webhooks(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        self.check_online()?;
        let state = self.state.read().await;
        let mut rows: Vec<WebhookEventRecord> = state
            .webhooks
            .values()
            .filter(|w| w.outcome == WebhookOutcome::Failed)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn purge_webhook_events(&self, before: OffsetDateTime) -> BillingResult<u64> {
        self.check_online()?;
        let mut state = self.state.write().await;
        let count = state.webhooks.len();
        state.webhooks.retain(|_, w| w.received_at >= before);
        Ok((count - state.webhooks.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::PaymentStatus;
    use meterflow_shared::{PlanTier, SubscriptionStatus};

    fn payment(event_id: &str, reference: &str) -> PaymentRecord {
        PaymentRecord {
            id: Uuid::new_v4(),
            subscriber_id: SubscriberId::from("u1"),
            provider: "stripe".to_string(),
            provider_event_id: event_id.to_string(),
            provider_reference: reference.to_string(),
            amount_cents: 4900,
            currency: "usd".to_string(),
            status: PaymentStatus::Failed,
            failure_reason: Some("card_declined".to_string()),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_upsert_rejects_older_timestamp() {
        let store = MemoryLedgerStore::new();
        let sub = SubscriberId::from("u1");
        let now = OffsetDateTime::now_utc();

        let mut canceled = SubscriptionRecord::free(sub.clone(), now);
        canceled.status = SubscriptionStatus::Canceled;
        store.upsert_subscription(&canceled).await.unwrap();

        let mut older = SubscriptionRecord::free(sub.clone(), now - time::Duration::seconds(30));
        older.plan_tier = PlanTier::Professional;
        assert_eq!(
            store.upsert_subscription(&older).await.unwrap(),
            UpsertOutcome::Stale
        );
        let stored = store.subscription(&sub).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    async fn test_redelivered_payment_event_is_ignored() {
        let store = MemoryLedgerStore::new();
        assert!(store.insert_payment(&payment("evt_1", "in_1")).await.unwrap());
        assert!(!store.insert_payment(&payment("evt_1", "in_1")).await.unwrap());
        assert_eq!(store.payments(&SubscriberId::from("u1")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_every_attempt_on_an_invoice_is_kept() {
        let store = MemoryLedgerStore::new();
        assert!(store.insert_payment(&payment("evt_1", "in_1")).await.unwrap());
        assert!(store.insert_payment(&payment("evt_2", "in_1")).await.unwrap());
        assert_eq!(store.payments(&SubscriberId::from("u1")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_only_one_open_grace_period() {
        let store = MemoryLedgerStore::new();
        let sub = SubscriberId::from("u1");
        let now = OffsetDateTime::now_utc();

        let first = store
            .open_grace_period(&GracePeriod::new(sub.clone(), "a", now, time::Duration::days(3)))
            .await
            .unwrap();
        let second = store
            .open_grace_period(&GracePeriod::new(sub.clone(), "b", now, time::Duration::days(3)))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        assert_eq!(store.resolve_grace_periods(&sub, now).await.unwrap(), 1);
        assert!(store.active_grace_period(&sub).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overage_accrual_never_decreases() {
        let store = MemoryLedgerStore::new();
        let period = PeriodKey::current();
        let mut entry = OverageLedgerEntry::new(SubscriberId::from("u1"), period, Some(1000));
        entry.accrued_cents = 500;
        store.save_overage_entry(&entry).await.unwrap();

        entry.accrued_cents = 200;
        store.save_overage_entry(&entry).await.unwrap();

        let stored = store
            .overage_entry(&SubscriberId::from("u1"), &period)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.accrued_cents, 500);
    }

    #[tokio::test]
    async fn test_webhook_admission() {
        let store = MemoryLedgerStore::new();
        let payload = serde_json::json!({});
        assert_eq!(
            store
                .record_webhook_received("evt_1", "stripe", "invoice.paid", &payload)
                .await
                .unwrap(),
            WebhookAdmission::New
        );
        store
            .complete_webhook("evt_1", WebhookOutcome::Failed, Some("db down"))
            .await
            .unwrap();
        assert_eq!(store.failed_webhooks(10).await.unwrap().len(), 1);
        assert_eq!(
            store
                .record_webhook_received("evt_1", "stripe", "invoice.paid", &payload)
                .await
                .unwrap(),
            WebhookAdmission::Retry { attempt: 2 }
        );
        store
            .complete_webhook("evt_1", WebhookOutcome::Succeeded, None)
            .await
            .unwrap();
        assert_eq!(
            store
                .record_webhook_received("evt_1", "stripe", "invoice.paid", &payload)
                .await
                .unwrap(),
            WebhookAdmission::AlreadyProcessed
        );
    }

    #[tokio::test]
    async fn test_purge_removes_old_audit_rows() {
        let store = MemoryLedgerStore::new();
        store
            .record_webhook_received("evt_old", "stripe", "x", &serde_json::json!({}))
            .await
            .unwrap();
        let removed = store
            .purge_webhook_events(OffsetDateTime::now_utc() + time::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.webhook_event("evt_old").await.unwrap().is_none());
    }
}
