//! Meterflow Billing
//!
//! Usage metering and billing reconciliation: per-request usage counters,
//! overage policy, per-minute rate limits, periodic usage sync to the
//! billing provider, and webhook-driven subscription and payment state.

pub mod cache;
pub mod client;
pub mod config;
pub mod counter;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod notify;
pub mod overage;
pub mod pricing;
pub mod provider;
pub mod rate_limit;
pub mod sync;
pub mod usage;
pub mod webhooks;

pub use client::{PriceIds, StripeClient, StripeConfig};
pub use config::{EngineConfig, PlanLimits, RateLimits};
pub use counter::{CounterStore, MemoryCounterStore, RedisCounterStore, UsageSnapshot};
pub use engine::{CurrentUsage, MeteringEngine, MeteringEngineBuilder};
pub use error::{BillingError, BillingResult};
pub use ledger::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
pub use notify::{HttpNotifier, LogNotifier, MemoryNotifier, NotificationKind, Notifier, NotifierConfig};
pub use overage::{OverageAction, OverageConfig, OverageEvaluator, OverageType};
pub use pricing::PricingTable;
pub use provider::{BillingProvider, MeteredPrices};
pub use rate_limit::RateLimitResult;
pub use sync::{SyncOrchestrator, SyncOutcome, SyncRunSummary};
pub use webhooks::{
    CoinbaseConfig, CoinbaseVerifier, ProcessingResult, ProviderKind, StripeVerifier, WebhookEngine,
};
