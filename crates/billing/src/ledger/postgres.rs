//! Postgres-backed ledger store

use async_trait::async_trait;
use meterflow_shared::{PeriodKey, SubscriberId};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    BillingPeriod, GracePeriod, LedgerStore, OverageLedgerEntry, PaymentRecord,
    PendingPlanChange, ServiceAccess, SubscriptionRecord, UpsertOutcome, WebhookAdmission,
    WebhookEventRecord, WebhookOutcome,
};
use crate::error::BillingResult;

const SUBSCRIPTION_COLUMNS: &str = r#"
    subscriber_id, provider_customer_id, provider_subscription_id, plan_tier, status,
    current_period_start, current_period_end, cancel_at_period_end, canceled_at,
    metered_request_item, metered_compute_item, provider_updated_at
"#;

const BILLING_PERIOD_COLUMNS: &str = r#"
    subscriber_id, period_start, period_end, requests_used, compute_units_used,
    bandwidth_bytes, overage_requests, overage_cost_cents, request_cost_cents,
    compute_cost_cents, total_cost_cents, synced_at, closed_at
"#;

const WEBHOOK_COLUMNS: &str = r#"
    event_id, provider, event_type, payload, received_at, processed_at, outcome, error, attempts
"#;

#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn subscription(
        &self,
        subscriber: &SubscriberId,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as::<_, SubscriptionRecord>(&format!(
            "SELECT {} FROM subscriptions WHERE subscriber_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscriber)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn upsert_subscription(
        &self,
        record: &SubscriptionRecord,
    ) -> BillingResult<UpsertOutcome> {
        // The WHERE on the conflict branch makes this last-write-wins on the
        // provider's timestamp; an older event updates zero rows.
        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions (
                subscriber_id, provider_customer_id, provider_subscription_id, plan_tier,
                status, current_period_start, current_period_end, cancel_at_period_end,
                canceled_at, metered_request_item, metered_compute_item, provider_updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (subscriber_id) DO UPDATE SET
                provider_customer_id = EXCLUDED.provider_customer_id,
                provider_subscription_id = EXCLUDED.provider_subscription_id,
                plan_tier = EXCLUDED.plan_tier,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                canceled_at = EXCLUDED.canceled_at,
                metered_request_item = EXCLUDED.metered_request_item,
                metered_compute_item = EXCLUDED.metered_compute_item,
                provider_updated_at = EXCLUDED.provider_updated_at,
                updated_at = NOW()
            WHERE subscriptions.provider_updated_at <= EXCLUDED.provider_updated_at
            "#,
        )
        .bind(&record.subscriber_id)
        .bind(&record.provider_customer_id)
        .bind(&record.provider_subscription_id)
        .bind(record.plan_tier)
        .bind(record.status)
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.cancel_at_period_end)
        .bind(record.canceled_at)
        .bind(&record.metered_request_item)
        .bind(&record.metered_compute_item)
        .bind(record.provider_updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(UpsertOutcome::Stale)
        } else {
            Ok(UpsertOutcome::Applied)
        }
    }

    async fn set_metered_items(
        &self,
        subscriber: &SubscriberId,
        request_item: Option<&str>,
        compute_item: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET metered_request_item = $2, metered_compute_item = $3, updated_at = NOW()
            WHERE subscriber_id = $1
            "#,
        )
        .bind(subscriber)
        .bind(request_item)
        .bind(compute_item)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn subscriber_for_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<SubscriberId>> {
        let row: Option<(SubscriberId,)> = sqlx::query_as(
            r#"
            SELECT subscriber_id FROM provider_customers WHERE provider_customer_id = $1
            UNION ALL
            SELECT subscriber_id FROM subscriptions WHERE provider_customer_id = $1
            LIMIT 1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn link_customer(
        &self,
        customer_id: &str,
        subscriber: &SubscriberId,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO provider_customers (provider_customer_id, subscriber_id)
            VALUES ($1, $2)
            ON CONFLICT (provider_customer_id) DO UPDATE SET subscriber_id = EXCLUDED.subscriber_id
            "#,
        )
        .bind(customer_id)
        .bind(subscriber)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn billing_period(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
    ) -> BillingResult<Option<BillingPeriod>> {
        let row = sqlx::query_as::<_, BillingPeriod>(&format!(
            "SELECT {} FROM billing_periods WHERE subscriber_id = $1 AND period_start = $2",
            BILLING_PERIOD_COLUMNS
        ))
        .bind(subscriber)
        .bind(period.start)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn save_billing_period(&self, period: &BillingPeriod) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_periods (
                subscriber_id, period_start, period_end, requests_used, compute_units_used,
                bandwidth_bytes, overage_requests, overage_cost_cents, request_cost_cents,
                compute_cost_cents, total_cost_cents, synced_at, closed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (subscriber_id, period_start) DO UPDATE SET
                requests_used = EXCLUDED.requests_used,
                compute_units_used = EXCLUDED.compute_units_used,
                bandwidth_bytes = EXCLUDED.bandwidth_bytes,
                overage_requests = EXCLUDED.overage_requests,
                overage_cost_cents = EXCLUDED.overage_cost_cents,
                request_cost_cents = EXCLUDED.request_cost_cents,
                compute_cost_cents = EXCLUDED.compute_cost_cents,
                total_cost_cents = EXCLUDED.total_cost_cents,
                synced_at = EXCLUDED.synced_at,
                closed_at = COALESCE(billing_periods.closed_at, EXCLUDED.closed_at)
            "#,
        )
        .bind(&period.subscriber_id)
        .bind(period.period_start)
        .bind(period.period_end)
        .bind(period.requests_used)
        .bind(period.compute_units_used)
        .bind(period.bandwidth_bytes)
        .bind(period.overage_requests)
        .bind(period.overage_cost_cents)
        .bind(period.request_cost_cents)
        .bind(period.compute_cost_cents)
        .bind(period.total_cost_cents)
        .bind(period.synced_at)
        .bind(period.closed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close_billing_period(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
        at: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_periods SET closed_at = $3
            WHERE subscriber_id = $1 AND period_start = $2 AND closed_at IS NULL
            "#,
        )
        .bind(subscriber)
        .bind(period.start)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_payment(&self, payment: &PaymentRecord) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO payment_history (
                id, subscriber_id, provider, provider_event_id, provider_reference,
                amount_cents, currency, status, failure_reason, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (provider_event_id) DO NOTHING
            "#,
        )
        .bind(payment.id)
        .bind(&payment.subscriber_id)
        .bind(&payment.provider)
        .bind(&payment.provider_event_id)
        .bind(&payment.provider_reference)
        .bind(payment.amount_cents)
        .bind(&payment.currency)
        .bind(payment.status)
        .bind(&payment.failure_reason)
        .bind(payment.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn payments(&self, subscriber: &SubscriberId) -> BillingResult<Vec<PaymentRecord>> {
        let rows = sqlx::query_as::<_, PaymentRecord>(
            r#"
            SELECT id, subscriber_id, provider, provider_event_id, provider_reference, amount_cents,
                   currency, status, failure_reason, created_at
            FROM payment_history
            WHERE subscriber_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(subscriber)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn open_grace_period(&self, grace: &GracePeriod) -> BillingResult<GracePeriod> {
        // The partial unique index allows one open grace period per subscriber
        sqlx::query(
            r#"
            INSERT INTO grace_periods (id, subscriber_id, reason, started_at, ends_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (subscriber_id) WHERE resolved_at IS NULL DO NOTHING
            "#,
        )
        .bind(grace.id)
        .bind(&grace.subscriber_id)
        .bind(&grace.reason)
        .bind(grace.started_at)
        .bind(grace.ends_at)
        .execute(&self.pool)
        .await?;

        let open = self.active_grace_period(&grace.subscriber_id).await?;
        Ok(open.unwrap_or_else(|| grace.clone()))
    }

    async fn active_grace_period(
        &self,
        subscriber: &SubscriberId,
    ) -> BillingResult<Option<GracePeriod>> {
        let row = sqlx::query_as::<_, GracePeriod>(
            r#"
            SELECT id, subscriber_id, reason, started_at, ends_at, resolved_at, enforced_at
            FROM grace_periods
            WHERE subscriber_id = $1 AND resolved_at IS NULL
            "#,
        )
        .bind(subscriber)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn resolve_grace_periods(
        &self,
        subscriber: &SubscriberId,
        at: OffsetDateTime,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            "UPDATE grace_periods SET resolved_at = $2 WHERE subscriber_id = $1 AND resolved_at IS NULL",
        )
        .bind(subscriber)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn expired_grace_periods(&self, now: OffsetDateTime) -> BillingResult<Vec<GracePeriod>> {
        let rows = sqlx::query_as::<_, GracePeriod>(
            r#"
            SELECT id, subscriber_id, reason, started_at, ends_at, resolved_at, enforced_at
            FROM grace_periods
            WHERE resolved_at IS NULL AND enforced_at IS NULL AND ends_at <= $1
            ORDER BY ends_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn mark_grace_enforced(&self, id: Uuid, at: OffsetDateTime) -> BillingResult<()> {
        sqlx::query("UPDATE grace_periods SET enforced_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_pending_plan_change(&self, change: &PendingPlanChange) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_plan_changes (subscriber_id, target_tier, provider_reference, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (subscriber_id) DO UPDATE SET
                target_tier = EXCLUDED.target_tier,
                provider_reference = EXCLUDED.provider_reference,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(&change.subscriber_id)
        .bind(change.target_tier)
        .bind(&change.provider_reference)
        .bind(change.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_plan_change(
        &self,
        subscriber: &SubscriberId,
    ) -> BillingResult<Option<PendingPlanChange>> {
        let row = sqlx::query_as::<_, PendingPlanChange>(
            r#"
            SELECT subscriber_id, target_tier, provider_reference, created_at
            FROM pending_plan_changes WHERE subscriber_id = $1
            "#,
        )
        .bind(subscriber)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn clear_pending_plan_change(&self, subscriber: &SubscriberId) -> BillingResult<()> {
        sqlx::query("DELETE FROM pending_plan_changes WHERE subscriber_id = $1")
            .bind(subscriber)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn overage_entry(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
    ) -> BillingResult<Option<OverageLedgerEntry>> {
        let row: Option<(i64, Option<i64>, bool)> = sqlx::query_as(
            r#"
            SELECT accrued_cents, cap_cents, blocked
            FROM overage_ledger WHERE subscriber_id = $1 AND period_start = $2
            "#,
        )
        .bind(subscriber)
        .bind(period.start)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(accrued_cents, cap_cents, blocked)| OverageLedgerEntry {
            subscriber_id: subscriber.clone(),
            period: *period,
            accrued_cents,
            cap_cents,
            blocked,
        }))
    }

    async fn save_overage_entry(&self, entry: &OverageLedgerEntry) -> BillingResult<()> {
        // GREATEST keeps accrual monotonic if two evaluations race
        sqlx::query(
            r#"
            INSERT INTO overage_ledger (subscriber_id, period_start, accrued_cents, cap_cents, blocked)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (subscriber_id, period_start) DO UPDATE SET
                accrued_cents = GREATEST(overage_ledger.accrued_cents, EXCLUDED.accrued_cents),
                cap_cents = EXCLUDED.cap_cents,
                blocked = EXCLUDED.blocked,
                updated_at = NOW()
            "#,
        )
        .bind(&entry.subscriber_id)
        .bind(entry.period.start)
        .bind(entry.accrued_cents)
        .bind(entry.cap_cents)
        .bind(entry.blocked)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn service_access(&self, subscriber: &SubscriberId) -> BillingResult<ServiceAccess> {
        let row = sqlx::query_as::<_, ServiceAccess>(
            "SELECT subscriber_id, suspended, reason, updated_at FROM service_access WHERE subscriber_id = $1",
        )
        .bind(subscriber)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.unwrap_or_else(|| {
            ServiceAccess::enabled(subscriber.clone(), OffsetDateTime::UNIX_EPOCH)
        }))
    }

    async fn set_service_access(&self, access: &ServiceAccess) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO service_access (subscriber_id, suspended, reason, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (subscriber_id) DO UPDATE SET
                suspended = EXCLUDED.suspended,
                reason = EXCLUDED.reason,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&access.subscriber_id)
        .bind(access.suspended)
        .bind(access.reason)
        .bind(access.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_webhook_received(
        &self,
        event_id: &str,
        provider: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<WebhookAdmission> {
        // Atomic claim: a completed event updates nothing and returns no row,
        // an unfinished one is reopened with its attempt count bumped.
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events (event_id, provider, event_type, payload, outcome)
            VALUES ($1, $2, $3, $4, 'processing')
            ON CONFLICT (event_id) DO UPDATE SET
                attempts = webhook_events.attempts + 1,
                outcome = 'processing',
                error = NULL
            WHERE webhook_events.outcome IN ('processing', 'failed')
            RETURNING attempts
            "#,
        )
        .bind(event_id)
        .bind(provider)
        .bind(event_type)
        .bind(payload)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            None => WebhookAdmission::AlreadyProcessed,
            Some((1,)) => WebhookAdmission::New,
            Some((attempt,)) => WebhookAdmission::Retry { attempt },
        })
    }

    async fn webhook_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        let row = sqlx::query_as::<_, WebhookEventRecord>(&format!(
            "SELECT {} FROM webhook_events WHERE event_id = $1",
            WEBHOOK_COLUMNS
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn complete_webhook(
        &self,
        event_id: &str,
        outcome: WebhookOutcome,
        error: Option<&str>,
    ) -> BillingResult<()> {
        let processed_at = outcome.is_final().then(OffsetDateTime::now_utc);
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET outcome = $2, error = $3, processed_at = COALESCE($4, processed_at)
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(outcome)
        .bind(error)
        .bind(processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn failed_webhooks(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        let rows = sqlx::query_as::<_, WebhookEventRecord>(&format!(
            "SELECT {} FROM webhook_events WHERE outcome = 'failed' ORDER BY received_at DESC LIMIT $1",
            WEBHOOK_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn purge_webhook_events(&self, before: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM webhook_events WHERE received_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
