//! Usage sync to the billing provider
//!
//! Each run walks the subscribers active in the current period, plus the
//! previous period until it has been closed. Per subscriber, under a
//! TTL-bound lock:
//!
//! 1. Snapshot the counters; no activity means nothing to report
//! 2. Price the snapshot and roll it up into the period's `BillingPeriod`
//! 3. Resolve the metered subscription items, skipping subscribers without one
//! 4. Report the difference between the priced total and what was already
//!    reported, then advance the watermark
//! 5. Close the period once it has ended and its final report went through
//!
//! A failure is confined to its subscriber and retried on the next run.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use meterflow_shared::{PeriodKey, PlanTier, SubscriberId};
use serde::Serialize;
use time::OffsetDateTime;

use crate::config::EngineConfig;
use crate::counter::{keys, CounterStore, UsageSnapshot};
use crate::error::BillingResult;
use crate::ledger::{BillingPeriod, LedgerStore, SubscriptionRecord};
use crate::lock::DistributedLock;
use crate::pricing::{PricedUsage, PricingTable};
use crate::provider::{report_with_retry, BillingProvider, ReportMode, UsageRecordRequest};

/// Result of syncing one subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Reported { records: usize, cents: i64 },
    NothingToReport,
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriberSync {
    pub subscriber_id: SubscriberId,
    pub period: PeriodKey,
    pub outcome: SyncOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRunSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub results: Vec<SubscriberSync>,
}

impl SyncRunSummary {
    fn count(&self, pred: impl Fn(&SyncOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn reported(&self) -> usize {
        self.count(|o| matches!(o, SyncOutcome::Reported { .. }))
    }

    pub fn nothing_to_report(&self) -> usize {
        self.count(|o| matches!(o, SyncOutcome::NothingToReport))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, SyncOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, SyncOutcome::Failed { .. }))
    }

    pub fn outcome_for(&self, subscriber: &SubscriberId) -> Option<&SyncOutcome> {
        self.results
            .iter()
            .find(|r| &r.subscriber_id == subscriber)
            .map(|r| &r.outcome)
    }
}

/// Usage records must carry a timestamp inside the period they bill
fn report_timestamp(period: &PeriodKey, now: OffsetDateTime) -> OffsetDateTime {
    now.min(period.end - time::Duration::SECOND)
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    counter: Arc<dyn CounterStore>,
    ledger: Arc<dyn LedgerStore>,
    provider: Arc<dyn BillingProvider>,
    pricing: Arc<PricingTable>,
    config: Arc<EngineConfig>,
}

impl SyncOrchestrator {
    pub fn new(
        counter: Arc<dyn CounterStore>,
        ledger: Arc<dyn LedgerStore>,
        provider: Arc<dyn BillingProvider>,
        pricing: Arc<PricingTable>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            counter,
            ledger,
            provider,
            pricing,
            config,
        }
    }

    /// Sync every active subscriber once
    pub async fn run_once(&self, now: OffsetDateTime) -> SyncRunSummary {
        let current = PeriodKey::containing(now);
        let mut work = Vec::new();

        for period in [current.previous(), current] {
            match self.counter.active_subscribers(&period).await {
                Ok(subscribers) => work.extend(subscribers.into_iter().map(|s| (s, period))),
                Err(e) => {
                    tracing::error!(period = %period.key(), error = %e, "Failed to list active subscribers");
                }
            }
        }

        tracing::info!(count = work.len(), "Starting usage sync");

        let results: Vec<SubscriberSync> = stream::iter(work)
            .map(|(subscriber, period)| async move {
                let outcome = self.sync_subscriber(&subscriber, &period, now).await;
                SubscriberSync {
                    subscriber_id: subscriber,
                    period,
                    outcome,
                }
            })
            .buffer_unordered(self.config.sync_concurrency.max(1))
            .collect()
            .await;

        let summary = SyncRunSummary {
            started_at: now,
            results,
        };

        tracing::info!(
            reported = summary.reported(),
            nothing_to_report = summary.nothing_to_report(),
            skipped = summary.skipped(),
            errors = summary.failed(),
            "Completed usage sync cycle"
        );

        summary
    }

    /// Sync one subscriber's period. Never returns an error; failures become
    /// [`SyncOutcome::Failed`].
    pub async fn sync_subscriber(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
        now: OffsetDateTime,
    ) -> SyncOutcome {
        let lock = match DistributedLock::acquire(
            self.counter.clone(),
            keys::sync_lock(subscriber),
            self.config.sync_lock_ttl,
        )
        .await
        {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                tracing::debug!(subscriber_id = %subscriber, "Sync already in flight, skipping");
                return SyncOutcome::Skipped {
                    reason: "sync in progress".to_string(),
                };
            }
            Err(e) => {
                tracing::error!(subscriber_id = %subscriber, error = %e, "Failed to take sync lock");
                return SyncOutcome::Failed { error: e.to_string() };
            }
        };

        let outcome = match self.sync_locked(subscriber, period, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    subscriber_id = %subscriber,
                    period = %period.key(),
                    error = %e,
                    "Failed to sync usage"
                );
                SyncOutcome::Failed { error: e.to_string() }
            }
        };

        if let Err(e) = lock.release().await {
            tracing::warn!(subscriber_id = %subscriber, error = %e, "Failed to release sync lock");
        }

        outcome
    }

    async fn sync_locked(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
        now: OffsetDateTime,
    ) -> BillingResult<SyncOutcome> {
        let snapshot = self.counter.snapshot(subscriber, period).await?;
        if !snapshot.has_activity() {
            self.close_if_ended(subscriber, period, now).await?;
            return Ok(SyncOutcome::NothingToReport);
        }

        let record = self.ledger.subscription(subscriber).await?;
        let priced = self.pricing.price(&snapshot);
        let mut rollup = self
            .rollup(subscriber, period, &snapshot, &priced, record.as_ref())
            .await?;

        let record = match self.metered_record(subscriber, record).await? {
            Ok(record) => record,
            Err(reason) => {
                self.ledger.save_billing_period(&rollup).await?;
                self.close_if_ended(subscriber, period, now).await?;
                tracing::debug!(subscriber_id = %subscriber, reason = %reason, "Not reporting usage");
                return Ok(SyncOutcome::Skipped { reason });
            }
        };

        let mut records = 0usize;
        let mut cents = 0i64;
        let lines = [
            (record.metered_request_item.as_deref(), priced.request_cents, false),
            (record.metered_compute_item.as_deref(), priced.compute_cents, true),
        ];

        for (item, cumulative, is_compute) in lines {
            let Some(item) = item else { continue };
            let watermark = if is_compute {
                rollup.compute_cost_cents
            } else {
                rollup.request_cost_cents
            };
            let delta = cumulative - watermark;
            if delta <= 0 {
                continue;
            }

            let request = UsageRecordRequest {
                subscription_item: item.to_string(),
                quantity: delta.unsigned_abs(),
                timestamp: report_timestamp(period, now),
                mode: ReportMode::Increment,
                idempotency_key: format!("{}:{}:{}:{}", subscriber, period.key(), item, cumulative),
            };

            if let Err(e) = report_with_retry(
                self.provider.as_ref(),
                &request,
                self.config.provider_timeout,
                self.config.provider_max_retries,
            )
            .await
            {
                // Keep the watermark of any line that did go through
                self.ledger.save_billing_period(&rollup).await?;
                return Err(e);
            }

            if is_compute {
                rollup.compute_cost_cents = cumulative;
            } else {
                rollup.request_cost_cents = cumulative;
            }
            records += 1;
            cents += delta;
        }

        rollup.synced_at = Some(now);
        self.ledger.save_billing_period(&rollup).await?;
        self.close_if_ended(subscriber, period, now).await?;

        if records == 0 {
            return Ok(SyncOutcome::NothingToReport);
        }

        tracing::info!(
            subscriber_id = %subscriber,
            period = %period.key(),
            records = records,
            cents = cents,
            requests = snapshot.requests_used(),
            "Reported usage to billing provider"
        );
        Ok(SyncOutcome::Reported { records, cents })
    }

    /// Bring the period's rollup up to date with the snapshot
    async fn rollup(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
        snapshot: &UsageSnapshot,
        priced: &PricedUsage,
        record: Option<&SubscriptionRecord>,
    ) -> BillingResult<BillingPeriod> {
        let mut rollup = self
            .ledger
            .billing_period(subscriber, period)
            .await?
            .unwrap_or_else(|| BillingPeriod::open(subscriber.clone(), period));

        let requests = snapshot.requests_used();
        let tier = record
            .map(SubscriptionRecord::effective_tier)
            .unwrap_or(PlanTier::Free);
        let overage_requests = self
            .config
            .monthly_limit(tier)
            .map(|limit| requests.saturating_sub(limit))
            .unwrap_or(0);
        let overage_cost_cents = self
            .ledger
            .overage_entry(subscriber, period)
            .await?
            .map(|entry| entry.accrued_cents)
            .unwrap_or(0);

        rollup.requests_used = clamp_i64(requests);
        rollup.compute_units_used = clamp_i64(snapshot.compute_units_consumed);
        rollup.bandwidth_bytes = clamp_i64(snapshot.bandwidth_bytes);
        rollup.overage_requests = clamp_i64(overage_requests);
        rollup.overage_cost_cents = overage_cost_cents;
        rollup.total_cost_cents = priced.total_cents();
        Ok(rollup)
    }

    /// The subscription record with its metered items filled in, or why
    /// usage can't be reported for it.
    async fn metered_record(
        &self,
        subscriber: &SubscriberId,
        record: Option<SubscriptionRecord>,
    ) -> BillingResult<Result<SubscriptionRecord, String>> {
        let Some(mut record) = record else {
            return Ok(Err("no subscription".to_string()));
        };
        if record.has_metered_items() {
            return Ok(Ok(record));
        }
        let Some(subscription_id) = record.provider_subscription_id.clone() else {
            return Ok(Err("no provider subscription".to_string()));
        };

        let Some(info) = self.provider.get_subscription(&subscription_id).await? else {
            return Ok(Err("subscription not found at provider".to_string()));
        };

        let prices = self.provider.metered_prices();
        let item_for = |price: &Option<String>| {
            price
                .as_deref()
                .and_then(|price| info.item_for_price(price))
                .map(|item| item.item_id.clone())
        };
        record.metered_request_item = item_for(&prices.requests);
        record.metered_compute_item = item_for(&prices.compute_units);

        if !record.has_metered_items() {
            return Ok(Err("no metered subscription items".to_string()));
        }

        self.ledger
            .set_metered_items(
                subscriber,
                record.metered_request_item.as_deref(),
                record.metered_compute_item.as_deref(),
            )
            .await?;
        Ok(Ok(record))
    }

    async fn close_if_ended(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        if !period.has_ended(now) {
            return Ok(());
        }
        self.ledger.close_billing_period(subscriber, period, now).await?;
        self.counter.retire_subscriber(subscriber, period).await?;
        tracing::info!(subscriber_id = %subscriber, period = %period.key(), "Closed billing period");
        Ok(())
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
