//! Metering engine facade
//!
//! Wires the counter and ledger stores, the billing provider and the
//! notifier into the ingest, overage, rate-limit, sync and webhook services,
//! and exposes the operations the request layer and the worker call.

use std::collections::HashMap;
use std::sync::Arc;

use meterflow_shared::{PeriodKey, PlanTier, SubscriberId};
use serde::Serialize;
use time::OffsetDateTime;

use crate::cache::SubscriptionCache;
use crate::config::EngineConfig;
use crate::counter::{CounterStore, TimelineEntry};
use crate::error::BillingResult;
use crate::ledger::{LedgerStore, ServiceAccess, SuspensionReason, WebhookEventRecord};
use crate::notify::{LogNotifier, NotificationKind, Notifier};
use crate::overage::{OverageAction, OverageService, OverageType};
use crate::pricing::PricingTable;
use crate::provider::BillingProvider;
use crate::rate_limit::{RateLimitResult, RateLimiter};
use crate::sync::{SyncOrchestrator, SyncRunSummary};
use crate::usage::UsageIngest;
use crate::webhooks::{
    ProcessingResult, ProviderKind, WebhookEngine, WebhookHandlers, WebhookVerifier,
};

/// Usage for the current period
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentUsage {
    pub requests_used: u64,
    /// `None` for unlimited plans
    pub limit: Option<u64>,
    pub bandwidth_used: u64,
    pub compute_units_used: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
}

pub struct MeteringEngineBuilder {
    counter: Arc<dyn CounterStore>,
    ledger: Arc<dyn LedgerStore>,
    provider: Arc<dyn BillingProvider>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
    pricing: PricingTable,
    verifiers: HashMap<ProviderKind, Arc<dyn WebhookVerifier>>,
}

impl MeteringEngineBuilder {
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    /// Accept webhooks from `provider`, authenticated by `verifier`.
    /// Deliveries from providers without a verifier are rejected.
    pub fn verifier(mut self, provider: ProviderKind, verifier: Arc<dyn WebhookVerifier>) -> Self {
        self.verifiers.insert(provider, verifier);
        self
    }

    /// Build the engine and start the ingest worker. Must be called inside
    /// a Tokio runtime.
    pub fn build(self) -> MeteringEngine {
        let config = Arc::new(self.config);
        let cache = SubscriptionCache::new(
            self.counter.clone(),
            self.ledger.clone(),
            config.subscription_cache_ttl,
        );
        let overage = OverageService::new(
            self.counter.clone(),
            self.ledger.clone(),
            self.notifier.clone(),
            cache.clone(),
            config.clone(),
        );
        let rate_limiter = RateLimiter::new(
            self.counter.clone(),
            cache.clone(),
            config.rate_limits.clone(),
        );
        let ingest = UsageIngest::start(
            self.counter.clone(),
            overage.clone(),
            config.timeline_max_len,
            config.ingest_queue_capacity,
        );
        let sync = SyncOrchestrator::new(
            self.counter.clone(),
            self.ledger.clone(),
            self.provider.clone(),
            Arc::new(self.pricing),
            config.clone(),
        );
        let handlers = WebhookHandlers::new(
            self.ledger.clone(),
            self.provider,
            self.notifier.clone(),
            cache.clone(),
            overage.clone(),
            config.clone(),
        );
        let webhooks = WebhookEngine::new(
            self.counter.clone(),
            self.ledger.clone(),
            self.verifiers,
            handlers,
            config.clone(),
        );

        MeteringEngine {
            config,
            counter: self.counter,
            ledger: self.ledger,
            notifier: self.notifier,
            cache,
            overage,
            rate_limiter,
            ingest,
            sync,
            webhooks,
        }
    }
}

pub struct MeteringEngine {
    config: Arc<EngineConfig>,
    counter: Arc<dyn CounterStore>,
    ledger: Arc<dyn LedgerStore>,
    notifier: Arc<dyn Notifier>,
    cache: SubscriptionCache,
    overage: OverageService,
    rate_limiter: RateLimiter,
    ingest: UsageIngest,
    sync: SyncOrchestrator,
    webhooks: WebhookEngine,
}

impl MeteringEngine {
    pub fn builder(
        counter: Arc<dyn CounterStore>,
        ledger: Arc<dyn LedgerStore>,
        provider: Arc<dyn BillingProvider>,
    ) -> MeteringEngineBuilder {
        MeteringEngineBuilder {
            counter,
            ledger,
            provider,
            notifier: Arc::new(LogNotifier),
            config: EngineConfig::default(),
            pricing: PricingTable::default(),
            verifiers: HashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // =========================================================================
    // Usage
    // =========================================================================

    /// Meter one request. Never fails; see [`UsageIngest::record_usage`].
    pub async fn record_usage(
        &self,
        subscriber: &SubscriberId,
        endpoint: &str,
        compute_units: u64,
        request_bytes: u64,
        response_bytes: u64,
    ) -> Option<u64> {
        self.ingest
            .record_usage(subscriber, endpoint, compute_units, request_bytes, response_bytes)
            .await
    }

    /// Wait for queued post-ingest work (threshold checks, timeline) to drain
    pub async fn wait_idle(&self) {
        self.ingest.wait_idle().await;
    }

    pub async fn get_current_usage(&self, subscriber: &SubscriberId) -> BillingResult<CurrentUsage> {
        let period = PeriodKey::current();
        let snapshot = self.counter.snapshot(subscriber, &period).await?;
        let tier = self.cache.get(subscriber).await?.effective_tier();

        Ok(CurrentUsage {
            requests_used: snapshot.requests_used(),
            limit: self.config.monthly_limit(tier),
            bandwidth_used: snapshot.bandwidth_bytes,
            compute_units_used: snapshot.compute_units_consumed,
            period_start: period.start,
            period_end: period.end,
        })
    }

    pub async fn usage_timeline(
        &self,
        subscriber: &SubscriberId,
        limit: usize,
    ) -> BillingResult<Vec<TimelineEntry>> {
        self.counter.timeline(subscriber, limit).await
    }

    // =========================================================================
    // Limits
    // =========================================================================

    pub async fn handle_overage(
        &self,
        subscriber: &SubscriberId,
        overage_type: OverageType,
        amount: u64,
    ) -> BillingResult<OverageAction> {
        self.overage
            .handle_overage(subscriber, overage_type, amount, &PeriodKey::current())
            .await
    }

    /// Per-minute rate limit check. Fails open when the counter store is
    /// unavailable; a denial is recorded as a rate-limit overage.
    pub async fn check_rate_limit(&self, subscriber: &SubscriberId) -> RateLimitResult {
        let now = OffsetDateTime::now_utc();

        match self.rate_limiter.check_rate_limit(subscriber, now).await {
            Ok(result) => {
                if !result.allowed {
                    if let Err(e) = self.handle_overage(subscriber, OverageType::RateLimit, 1).await {
                        tracing::warn!(subscriber_id = %subscriber, error = %e, "Failed to record rate limit hit");
                    }
                }
                result
            }
            Err(e) => {
                tracing::warn!(
                    subscriber_id = %subscriber,
                    error = %e,
                    "Rate limit check failed, allowing request"
                );
                let limit = match self.rate_limiter.limit_for(subscriber).await {
                    Ok(limit) => limit,
                    Err(_) => self.config.rate_limits.per_minute(PlanTier::Free),
                };
                RateLimitResult::fail_open(limit, now)
            }
        }
    }

    pub async fn is_service_enabled(&self, subscriber: &SubscriberId) -> BillingResult<bool> {
        self.overage
            .is_service_enabled(subscriber, &PeriodKey::current())
            .await
    }

    // =========================================================================
    // Webhooks
    // =========================================================================

    pub async fn process_webhook(
        &self,
        raw_payload: &[u8],
        signature_header: &str,
        declared_provider: &str,
    ) -> BillingResult<ProcessingResult> {
        self.webhooks
            .process(raw_payload, signature_header, declared_provider)
            .await
    }

    pub async fn replay_webhook(&self, event_id: &str) -> BillingResult<ProcessingResult> {
        self.webhooks.replay(event_id).await
    }

    pub async fn list_failed_webhooks(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        self.webhooks.list_failed(limit).await
    }

    pub async fn purge_webhook_audit(&self, now: OffsetDateTime) -> BillingResult<u64> {
        self.webhooks.purge_audit(now).await
    }

    // =========================================================================
    // Scheduled work
    // =========================================================================

    pub async fn run_sync(&self, now: OffsetDateTime) -> SyncRunSummary {
        self.sync.run_once(now).await
    }

    /// Suspend subscribers whose payment grace period ran out. Returns the
    /// number suspended.
    pub async fn enforce_grace_periods(&self, now: OffsetDateTime) -> BillingResult<usize> {
        let expired = self.ledger.expired_grace_periods(now).await?;
        let mut suspended = 0;

        for grace in expired {
            let subscriber = &grace.subscriber_id;
            let result = async {
                self.ledger
                    .set_service_access(&ServiceAccess::suspended(
                        subscriber.clone(),
                        SuspensionReason::PaymentOverdue,
                        now,
                    ))
                    .await?;
                self.ledger.mark_grace_enforced(grace.id, now).await
            }
            .await;

            match result {
                Ok(()) => {
                    suspended += 1;
                    self.cache.invalidate(subscriber).await;
                    tracing::warn!(
                        subscriber_id = %subscriber,
                        grace_started_at = %grace.started_at,
                        reason = %grace.reason,
                        "Service suspended: payment grace period expired"
                    );
                    self.notifier
                        .notify(
                            subscriber,
                            NotificationKind::ServiceSuspended,
                            serde_json::json!({
                                "reason": SuspensionReason::PaymentOverdue,
                                "grace_ended_at": grace.ends_at.unix_timestamp(),
                            }),
                        )
                        .await;
                }
                Err(e) => {
                    tracing::error!(
                        subscriber_id = %subscriber,
                        error = %e,
                        "Failed to enforce expired grace period"
                    );
                }
            }
        }

        Ok(suspended)
    }
}
