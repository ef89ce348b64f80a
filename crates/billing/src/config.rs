//! Engine configuration
//!
//! All settings are read from the environment with defaults:
//! - `FREE_MONTHLY_REQUESTS` (default: 1000)
//! - `STARTER_MONTHLY_REQUESTS` (default: 10000)
//! - `PROFESSIONAL_MONTHLY_REQUESTS` (default: 100000)
//! - `ENTERPRISE_MONTHLY_REQUESTS` (default: unlimited)
//! - `RATE_LIMIT_{FREE,STARTER,PROFESSIONAL,ENTERPRISE}_PER_MINUTE`
//! - `USAGE_WARNING_THRESHOLDS` (default: "75,90,100")
//! - `PAYMENT_GRACE_DAYS` (default: 3)
//! - `SYNC_LOCK_TTL_SECS`, `SYNC_CONCURRENCY`, `PROVIDER_TIMEOUT_SECS`
//! - `WEBHOOK_LOCK_TTL_SECS`, `WEBHOOK_DEDUP_TTL_SECS`, `WEBHOOK_RETENTION_DAYS`
//! - `INGEST_QUEUE_CAPACITY`
//!
//! Overage rates and caps live in [`crate::overage::OverageConfig`] and
//! endpoint pricing in [`crate::pricing::PricingTable`].

use std::str::FromStr;
use std::time::Duration;

use meterflow_shared::PlanTier;

use crate::overage::OverageConfig;

const DEFAULT_WARNING_THRESHOLDS: [u8; 3] = [75, 90, 100];

pub(crate) fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Parse a comma-separated threshold list such as `"75,90,100"`.
///
/// Values outside 1..=100 are dropped; the result is sorted and deduplicated.
pub fn parse_thresholds(raw: &str) -> Vec<u8> {
    let mut thresholds: Vec<u8> = raw
        .split(',')
        .filter_map(|v| v.trim().parse::<u8>().ok())
        .filter(|t| (1..=100).contains(t))
        .collect();
    thresholds.sort_unstable();
    thresholds.dedup();
    thresholds
}

/// Included monthly requests per tier. `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanLimits {
    pub free: u64,
    pub starter: u64,
    pub professional: u64,
    pub enterprise: Option<u64>,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            free: 1_000,
            starter: 10_000,
            professional: 100_000,
            enterprise: None,
        }
    }
}

impl PlanLimits {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            free: env_or("FREE_MONTHLY_REQUESTS", defaults.free),
            starter: env_or("STARTER_MONTHLY_REQUESTS", defaults.starter),
            professional: env_or("PROFESSIONAL_MONTHLY_REQUESTS", defaults.professional),
            enterprise: std::env::var("ENTERPRISE_MONTHLY_REQUESTS")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
        }
    }

    pub fn monthly_requests(&self, tier: PlanTier) -> Option<u64> {
        match tier {
            PlanTier::Free => Some(self.free),
            PlanTier::Starter => Some(self.starter),
            PlanTier::Professional => Some(self.professional),
            PlanTier::Enterprise => self.enterprise,
        }
    }
}

/// Requests per minute allowed per tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimits {
    pub free: u32,
    pub starter: u32,
    pub professional: u32,
    pub enterprise: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            free: 60,
            starter: 300,
            professional: 1_200,
            enterprise: 6_000,
        }
    }
}

impl RateLimits {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            free: env_or("RATE_LIMIT_FREE_PER_MINUTE", defaults.free),
            starter: env_or("RATE_LIMIT_STARTER_PER_MINUTE", defaults.starter),
            professional: env_or("RATE_LIMIT_PROFESSIONAL_PER_MINUTE", defaults.professional),
            enterprise: env_or("RATE_LIMIT_ENTERPRISE_PER_MINUTE", defaults.enterprise),
        }
    }

    pub fn per_minute(&self, tier: PlanTier) -> u32 {
        match tier {
            PlanTier::Free => self.free,
            PlanTier::Starter => self.starter,
            PlanTier::Professional => self.professional,
            PlanTier::Enterprise => self.enterprise,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub limits: PlanLimits,
    pub rate_limits: RateLimits,
    pub overage: OverageConfig,
    /// Percentages of the included limit that trigger a usage warning
    pub warning_thresholds: Vec<u8>,
    /// How long a subscriber keeps service after a failed payment
    pub payment_grace: time::Duration,
    /// Upper bound on how long a crashed sync can hold a subscriber's lock
    pub sync_lock_ttl: Duration,
    /// Subscribers synced in parallel per run
    pub sync_concurrency: usize,
    /// Per-request timeout for billing provider calls
    pub provider_timeout: Duration,
    pub provider_max_retries: usize,
    pub webhook_lock_ttl: Duration,
    /// Hot dedup window in the counter store
    pub webhook_dedup_ttl: Duration,
    /// Cold audit retention in the ledger
    pub webhook_retention: time::Duration,
    pub subscription_cache_ttl: Duration,
    pub ingest_queue_capacity: usize,
    pub timeline_max_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: PlanLimits::default(),
            rate_limits: RateLimits::default(),
            overage: OverageConfig::default(),
            warning_thresholds: DEFAULT_WARNING_THRESHOLDS.to_vec(),
            payment_grace: time::Duration::days(3),
            sync_lock_ttl: Duration::from_secs(120),
            sync_concurrency: 8,
            provider_timeout: Duration::from_secs(10),
            provider_max_retries: 3,
            webhook_lock_ttl: Duration::from_secs(30),
            webhook_dedup_ttl: Duration::from_secs(24 * 60 * 60),
            webhook_retention: time::Duration::days(90),
            subscription_cache_ttl: Duration::from_secs(60),
            ingest_queue_capacity: 10_000,
            timeline_max_len: 1_000,
        }
    }
}

impl EngineConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let warning_thresholds = std::env::var("USAGE_WARNING_THRESHOLDS")
            .ok()
            .map(|raw| parse_thresholds(&raw))
            .filter(|parsed| !parsed.is_empty())
            .unwrap_or(defaults.warning_thresholds);

        Self {
            limits: PlanLimits::from_env(),
            rate_limits: RateLimits::from_env(),
            overage: OverageConfig::from_env(),
            warning_thresholds,
            payment_grace: time::Duration::days(env_or("PAYMENT_GRACE_DAYS", 3)),
            sync_lock_ttl: Duration::from_secs(env_or("SYNC_LOCK_TTL_SECS", 120)),
            sync_concurrency: env_or("SYNC_CONCURRENCY", defaults.sync_concurrency).max(1),
            provider_timeout: Duration::from_secs(env_or("PROVIDER_TIMEOUT_SECS", 10)),
            provider_max_retries: env_or("PROVIDER_MAX_RETRIES", defaults.provider_max_retries),
            webhook_lock_ttl: Duration::from_secs(env_or("WEBHOOK_LOCK_TTL_SECS", 30)),
            webhook_dedup_ttl: Duration::from_secs(env_or("WEBHOOK_DEDUP_TTL_SECS", 24 * 60 * 60)),
            webhook_retention: time::Duration::days(env_or("WEBHOOK_RETENTION_DAYS", 90)),
            subscription_cache_ttl: Duration::from_secs(env_or("SUBSCRIPTION_CACHE_TTL_SECS", 60)),
            ingest_queue_capacity: env_or("INGEST_QUEUE_CAPACITY", defaults.ingest_queue_capacity)
                .max(1),
            timeline_max_len: env_or("USAGE_TIMELINE_MAX_LEN", defaults.timeline_max_len),
        }
    }

    pub fn monthly_limit(&self, tier: PlanTier) -> Option<u64> {
        self.limits.monthly_requests(tier)
    }
}
