//! Overage policy
//!
//! [`OverageEvaluator`] is a pure decision over (tier, usage, limit, ledger
//! entry). [`OverageService`] wires it to the stores: it reads usage, keeps
//! the per-period [`OverageLedgerEntry`] current and sends the resulting
//! notifications.
//!
//! | Tier | Over the included limit |
//! |---|---|
//! | Free | Block once past the grace allowance |
//! | Starter | Accrue up to the cap, then block |
//! | Professional / Enterprise | Accrue without bound |
//!
//! Usage warnings (75/90/100% by default) are independent of the action and
//! go out at most once per threshold per subscriber per day.

use std::sync::Arc;
use std::time::Duration;

use meterflow_shared::{PeriodKey, PlanTier, SubscriberId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::cache::SubscriptionCache;
use crate::config::{env_or, EngineConfig};
use crate::counter::{keys, CounterStore};
use crate::error::BillingResult;
use crate::ledger::{LedgerStore, OverageLedgerEntry};
use crate::notify::{NotificationKind, Notifier};

/// Warning markers live past their day so the date in the key does the dedup
const WARNING_MARKER_TTL: Duration = Duration::from_secs(48 * 60 * 60);

/// Flat overage price for one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCard {
    /// Cents charged per started batch of requests
    pub per_batch_cents: i64,
    pub batch_size: i64,
}

impl RateCard {
    pub fn per_thousand(cents: i64) -> Self {
        Self {
            per_batch_cents: cents,
            batch_size: 1_000,
        }
    }

    /// Cost of `overage` requests, rounded up to whole batches.
    /// Saturates instead of overflowing.
    pub fn cost_cents(&self, overage: u64) -> i64 {
        if overage == 0 || self.batch_size <= 0 {
            return 0;
        }
        let overage = i64::try_from(overage).unwrap_or(i64::MAX);
        let batches = overage / self.batch_size + i64::from(overage % self.batch_size != 0);
        batches.saturating_mul(self.per_batch_cents)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverageConfig {
    /// Most a Starter subscriber can accrue in a period before being blocked
    pub starter_cap_cents: i64,
    /// Requests a Free subscriber may go past the limit before being blocked
    pub free_grace_requests: u64,
    pub starter: RateCard,
    pub professional: RateCard,
    pub enterprise: RateCard,
}

impl Default for OverageConfig {
    fn default() -> Self {
        Self {
            starter_cap_cents: 1_000,
            free_grace_requests: 0,
            starter: RateCard::per_thousand(50),
            professional: RateCard::per_thousand(40),
            enterprise: RateCard::per_thousand(25),
        }
    }
}

impl OverageConfig {
    /// Load rates from environment or use defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            starter_cap_cents: env_or("STARTER_OVERAGE_CAP_CENTS", defaults.starter_cap_cents),
            free_grace_requests: env_or("FREE_GRACE_REQUESTS", defaults.free_grace_requests),
            starter: RateCard::per_thousand(env_or(
                "OVERAGE_RATE_STARTER_CENTS",
                defaults.starter.per_batch_cents,
            )),
            professional: RateCard::per_thousand(env_or(
                "OVERAGE_RATE_PROFESSIONAL_CENTS",
                defaults.professional.per_batch_cents,
            )),
            enterprise: RateCard::per_thousand(env_or(
                "OVERAGE_RATE_ENTERPRISE_CENTS",
                defaults.enterprise.per_batch_cents,
            )),
        }
    }

    /// Returns None for Free, which never accrues
    pub fn rate_for(&self, tier: PlanTier) -> Option<RateCard> {
        match tier {
            PlanTier::Free => None,
            PlanTier::Starter => Some(self.starter),
            PlanTier::Professional => Some(self.professional),
            PlanTier::Enterprise => Some(self.enterprise),
        }
    }

    pub fn cap_for(&self, tier: PlanTier) -> Option<i64> {
        match tier {
            PlanTier::Starter => Some(self.starter_cap_cents),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverageAction {
    Allow,
    /// Over the limit but still inside the Free grace allowance
    Warn,
    Block,
    AccrueBillable,
}

impl std::fmt::Display for OverageAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "ALLOW"),
            Self::Warn => write!(f, "WARN"),
            Self::Block => write!(f, "BLOCK"),
            Self::AccrueBillable => write!(f, "ACCRUE_BILLABLE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverageDecision {
    pub action: OverageAction,
    pub entry: OverageLedgerEntry,
    /// Warning thresholds (percent of limit) the usage has reached
    pub thresholds_reached: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct OverageEvaluator {
    config: OverageConfig,
    thresholds: Vec<u8>,
}

impl OverageEvaluator {
    pub fn new(config: OverageConfig, thresholds: Vec<u8>) -> Self {
        Self { config, thresholds }
    }

    pub fn config(&self) -> &OverageConfig {
        &self.config
    }

    pub fn thresholds_reached(&self, usage: u64, limit: Option<u64>) -> Vec<u8> {
        let Some(limit) = limit else {
            return Vec::new();
        };
        if limit == 0 {
            return if usage > 0 { self.thresholds.clone() } else { Vec::new() };
        }
        self.thresholds
            .iter()
            .copied()
            .filter(|t| u128::from(usage) * 100 >= u128::from(limit) * u128::from(*t))
            .collect()
    }

    /// Decide what to do with `usage` requests against `limit`.
    ///
    /// Accrual never decreases. `blocked` reflects this evaluation only, so
    /// an upgrade can lift a block.
    pub fn evaluate(
        &self,
        tier: PlanTier,
        usage: u64,
        limit: Option<u64>,
        existing: &OverageLedgerEntry,
    ) -> OverageDecision {
        let thresholds_reached = self.thresholds_reached(usage, limit);
        let mut entry = existing.clone();
        entry.cap_cents = self.config.cap_for(tier);
        entry.blocked = false;

        let over = match limit {
            Some(limit) if usage > limit => usage - limit,
            _ => {
                return OverageDecision {
                    action: OverageAction::Allow,
                    entry,
                    thresholds_reached,
                };
            }
        };

        let action = match self.config.rate_for(tier) {
            None => {
                if over > self.config.free_grace_requests {
                    entry.blocked = true;
                    OverageAction::Block
                } else {
                    OverageAction::Warn
                }
            }
            Some(rate) => {
                let cost = rate.cost_cents(over);
                match entry.cap_cents {
                    Some(cap) if cost > cap => {
                        entry.accrued_cents = entry.accrued_cents.max(cap);
                        entry.blocked = true;
                        OverageAction::Block
                    }
                    _ => {
                        entry.accrued_cents = entry.accrued_cents.max(cost);
                        OverageAction::AccrueBillable
                    }
                }
            }
        };

        OverageDecision {
            action,
            entry,
            thresholds_reached,
        }
    }
}

/// What kind of limit a request ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverageType {
    /// Monthly included requests
    ApiLimit,
    /// Per-minute request rate
    RateLimit,
}

impl std::str::FromStr for OverageType {
    type Err = crate::error::BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api_limit" => Ok(Self::ApiLimit),
            "rate_limit" => Ok(Self::RateLimit),
            other => Err(crate::error::BillingError::InvalidInput(format!(
                "Unknown overage type: {}",
                other
            ))),
        }
    }
}

/// Applies overage policy against the stores
#[derive(Clone)]
pub struct OverageService {
    counter: Arc<dyn CounterStore>,
    ledger: Arc<dyn LedgerStore>,
    notifier: Arc<dyn Notifier>,
    cache: SubscriptionCache,
    config: Arc<EngineConfig>,
    evaluator: OverageEvaluator,
}

impl OverageService {
    pub fn new(
        counter: Arc<dyn CounterStore>,
        ledger: Arc<dyn LedgerStore>,
        notifier: Arc<dyn Notifier>,
        cache: SubscriptionCache,
        config: Arc<EngineConfig>,
    ) -> Self {
        let evaluator =
            OverageEvaluator::new(config.overage.clone(), config.warning_thresholds.clone());
        Self {
            counter,
            ledger,
            notifier,
            cache,
            config,
            evaluator,
        }
    }

    pub fn evaluator(&self) -> &OverageEvaluator {
        &self.evaluator
    }

    /// Handle a request that ran into a limit
    pub async fn handle_overage(
        &self,
        subscriber: &SubscriberId,
        overage_type: OverageType,
        amount: u64,
        period: &PeriodKey,
    ) -> BillingResult<OverageAction> {
        match overage_type {
            OverageType::ApiLimit => {
                let tier = self.cache.get(subscriber).await?.effective_tier();
                let limit = self.config.monthly_limit(tier);
                let counted = match self.counter.snapshot(subscriber, period).await {
                    Ok(snapshot) => snapshot.requests_used(),
                    Err(e) => {
                        tracing::warn!(
                            subscriber_id = %subscriber,
                            error = %e,
                            "Counter store unavailable, judging overage from reported amount"
                        );
                        0
                    }
                };
                let usage = match limit {
                    Some(limit) => counted.max(limit.saturating_add(amount)),
                    None => counted,
                };
                self.apply(subscriber, tier, usage, limit, period).await
            }
            OverageType::RateLimit => {
                self.counter.record_rate_limit_hit(subscriber, period).await?;
                let today = OffsetDateTime::now_utc().date();
                let first_today = self
                    .counter
                    .set_if_absent(&keys::rate_limit_notice(subscriber, today), WARNING_MARKER_TTL)
                    .await
                    .unwrap_or(false);
                if first_today {
                    self.notifier
                        .notify(
                            subscriber,
                            NotificationKind::RateLimited,
                            serde_json::json!({ "period": period.key() }),
                        )
                        .await;
                }
                tracing::info!(subscriber_id = %subscriber, "Rate limit exceeded");
                Ok(OverageAction::Block)
            }
        }
    }

    /// Post-write check from usage ingest with the freshly incremented total
    pub async fn on_usage(
        &self,
        subscriber: &SubscriberId,
        usage: u64,
        period: &PeriodKey,
    ) -> BillingResult<OverageAction> {
        let tier = self.cache.get(subscriber).await?.effective_tier();
        let limit = self.config.monthly_limit(tier);

        match limit {
            Some(l) if usage > l => self.apply(subscriber, tier, usage, limit, period).await,
            _ => {
                let reached = self.evaluator.thresholds_reached(usage, limit);
                self.send_warnings(subscriber, &reached, usage, limit).await;
                Ok(OverageAction::Allow)
            }
        }
    }

    /// Re-run the policy after a plan change so limits follow the new tier
    pub async fn reevaluate(
        &self,
        subscriber: &SubscriberId,
        tier: PlanTier,
        period: &PeriodKey,
    ) -> BillingResult<OverageAction> {
        let usage = self.counter.snapshot(subscriber, period).await?.requests_used();
        let limit = self.config.monthly_limit(tier);
        let existing = self.ledger.overage_entry(subscriber, period).await?;

        let Some(existing) = existing else {
            // Nothing accrued or blocked; a fresh entry is only needed once over the limit
            return match limit {
                Some(l) if usage > l => self.apply(subscriber, tier, usage, limit, period).await,
                _ => Ok(OverageAction::Allow),
            };
        };

        let decision = self.evaluator.evaluate(tier, usage, limit, &existing);
        if decision.entry != existing {
            self.ledger.save_overage_entry(&decision.entry).await?;
        }
        if existing.blocked && !decision.entry.blocked {
            tracing::info!(subscriber_id = %subscriber, tier = %tier, "Overage block lifted by plan change");
        }
        Ok(decision.action)
    }

    /// False when the subscriber is suspended or blocked for overage this period
    pub async fn is_service_enabled(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
    ) -> BillingResult<bool> {
        if self.ledger.service_access(subscriber).await?.suspended {
            return Ok(false);
        }
        let blocked = self
            .ledger
            .overage_entry(subscriber, period)
            .await?
            .map(|entry| entry.blocked)
            .unwrap_or(false);
        Ok(!blocked)
    }

    async fn apply(
        &self,
        subscriber: &SubscriberId,
        tier: PlanTier,
        usage: u64,
        limit: Option<u64>,
        period: &PeriodKey,
    ) -> BillingResult<OverageAction> {
        let existing = self
            .ledger
            .overage_entry(subscriber, period)
            .await?
            .unwrap_or_else(|| {
                OverageLedgerEntry::new(subscriber.clone(), *period, self.evaluator.config.cap_for(tier))
            });

        let decision = self.evaluator.evaluate(tier, usage, limit, &existing);
        if decision.entry != existing {
            self.ledger.save_overage_entry(&decision.entry).await?;
        }

        if decision.entry.blocked && !existing.blocked {
            tracing::info!(
                subscriber_id = %subscriber,
                tier = %tier,
                usage = usage,
                accrued_cents = decision.entry.accrued_cents,
                "Subscriber blocked for overage"
            );
            self.notifier
                .notify(
                    subscriber,
                    NotificationKind::OverageBlocked,
                    serde_json::json!({
                        "tier": tier,
                        "requests_used": usage,
                        "limit": limit,
                        "accrued_cents": decision.entry.accrued_cents,
                        "period": period.key(),
                    }),
                )
                .await;
        }

        self.send_warnings(subscriber, &decision.thresholds_reached, usage, limit)
            .await;
        Ok(decision.action)
    }

    async fn send_warnings(
        &self,
        subscriber: &SubscriberId,
        thresholds: &[u8],
        usage: u64,
        limit: Option<u64>,
    ) {
        if thresholds.is_empty() {
            return;
        }
        let today = OffsetDateTime::now_utc().date();

        for threshold in thresholds {
            let key = keys::warning(subscriber, today, *threshold);
            match self.counter.set_if_absent(&key, WARNING_MARKER_TTL).await {
                Ok(true) => {
                    tracing::info!(
                        subscriber_id = %subscriber,
                        threshold = threshold,
                        usage = usage,
                        "Usage warning threshold reached"
                    );
                    self.notifier
                        .notify(
                            subscriber,
                            NotificationKind::UsageWarning,
                            serde_json::json!({
                                "threshold": threshold,
                                "requests_used": usage,
                                "limit": limit,
                            }),
                        )
                        .await;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        subscriber_id = %subscriber,
                        threshold = threshold,
                        error = %e,
                        "Could not record usage warning, skipping"
                    );
                }
            }
        }
    }
}
