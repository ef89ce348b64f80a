//! Counter store: fast, TTL-capable per-subscriber usage counters
//!
//! Holds the hot-path state the ledger is reconciled from: per-period usage
//! hashes, per-minute rate buckets, usage timelines, and the short-lived
//! keys used for locks, dedup markers and caches. Redis in production,
//! an in-memory map for development and tests.

mod memory;
mod redis;

pub use self::memory::MemoryCounterStore;
pub use self::redis::RedisCounterStore;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use meterflow_shared::{PeriodKey, SubscriberId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::BillingResult;

/// Rate buckets outlive their minute so a late read still sees them
pub const RATE_BUCKET_TTL: Duration = Duration::from_secs(120);

/// Extra lifetime for usage counters past the end of their period, so the
/// closing sync can still read them.
const COUNTER_TTL_SLACK: time::Duration = time::Duration::days(7);

/// Key layout shared by every backend
pub mod keys {
    use meterflow_shared::{PeriodKey, SubscriberId};

    pub fn usage(subscriber: &SubscriberId, period: &PeriodKey) -> String {
        format!("usage:{}:{}", period.key(), subscriber)
    }

    pub fn usage_endpoints(subscriber: &SubscriberId, period: &PeriodKey) -> String {
        format!("usage:{}:{}:endpoints", period.key(), subscriber)
    }

    pub fn active_set(period: &PeriodKey) -> String {
        format!("usage:{}:active", period.key())
    }

    pub fn rate_bucket(subscriber: &SubscriberId, minute: i64) -> String {
        format!("ratelimit:{}:{}", subscriber, minute)
    }

    pub fn timeline(subscriber: &SubscriberId) -> String {
        format!("timeline:{}", subscriber)
    }

    pub fn sync_lock(subscriber: &SubscriberId) -> String {
        format!("lock:sync:{}", subscriber)
    }

    pub fn webhook_lock(event_id: &str) -> String {
        format!("lock:webhook:{}", event_id)
    }

    pub fn webhook_done(event_id: &str) -> String {
        format!("webhook:done:{}", event_id)
    }

    pub fn warning(subscriber: &SubscriberId, day: time::Date, threshold: u8) -> String {
        format!("warn:{}:{}:{}", subscriber, day, threshold)
    }

    pub fn rate_limit_notice(subscriber: &SubscriberId, day: time::Date) -> String {
        format!("warn:{}:{}:ratelimit", subscriber, day)
    }

    pub fn subscription_cache(subscriber: &SubscriberId) -> String {
        format!("cache:subscription:{}", subscriber)
    }
}

/// Hash fields of the per-period usage totals
pub(crate) mod fields {
    pub const REQUESTS: &str = "requests";
    pub const COMPUTE_UNITS: &str = "compute_units";
    pub const BANDWIDTH: &str = "bandwidth";
    pub const RATE_LIMIT_HITS: &str = "rate_limit_hits";
}

/// TTL for a period's usage counters
pub fn counter_ttl(period: &PeriodKey) -> Duration {
    let ttl = period.length() + COUNTER_TTL_SLACK;
    Duration::from_secs(ttl.whole_seconds().max(0) as u64)
}

/// The minute bucket a timestamp falls in
pub fn minute_bucket(at: OffsetDateTime) -> i64 {
    at.unix_timestamp().div_euclid(60)
}

/// One metered request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageIncrement {
    pub endpoint: String,
    pub compute_units: u64,
    pub bandwidth_bytes: u64,
}

/// Point-in-time view of a subscriber's counters for one period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub subscriber_id: SubscriberId,
    pub period: PeriodKey,
    pub per_endpoint_counts: BTreeMap<String, u64>,
    pub total_requests: u64,
    pub compute_units_consumed: u64,
    pub bandwidth_bytes: u64,
    pub rate_limit_hit_count: u64,
}

impl UsageSnapshot {
    pub fn empty(subscriber_id: SubscriberId, period: PeriodKey) -> Self {
        Self {
            subscriber_id,
            period,
            per_endpoint_counts: BTreeMap::new(),
            total_requests: 0,
            compute_units_consumed: 0,
            bandwidth_bytes: 0,
            rate_limit_hit_count: 0,
        }
    }

    /// Requests as the sum of per-endpoint counts
    pub fn requests_used(&self) -> u64 {
        self.per_endpoint_counts
            .values()
            .fold(0u64, |acc, n| acc.saturating_add(*n))
    }

    pub fn has_activity(&self) -> bool {
        self.requests_used() > 0 || self.compute_units_consumed > 0 || self.bandwidth_bytes > 0
    }
}

/// Best-effort per-request history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub endpoint: String,
    pub compute_units: u64,
    pub bandwidth_bytes: u64,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add one request to the period's counters and mark the
    /// subscriber active. Returns the new request total.
    async fn increment_usage(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
        increment: &UsageIncrement,
        ttl: Duration,
    ) -> BillingResult<u64>;

    /// Increment the subscriber's bucket for `minute`; returns the new count
    async fn increment_rate_bucket(&self, subscriber: &SubscriberId, minute: i64)
        -> BillingResult<u64>;

    async fn rate_bucket(&self, subscriber: &SubscriberId, minute: i64) -> BillingResult<u64>;

    async fn record_rate_limit_hit(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
    ) -> BillingResult<()>;

    /// Prepend to the subscriber's timeline, keeping at most `max_len` entries
    async fn append_timeline(
        &self,
        subscriber: &SubscriberId,
        entry: &TimelineEntry,
        max_len: usize,
    ) -> BillingResult<()>;

    /// Most recent entries first
    async fn timeline(
        &self,
        subscriber: &SubscriberId,
        limit: usize,
    ) -> BillingResult<Vec<TimelineEntry>>;

    async fn snapshot(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
    ) -> BillingResult<UsageSnapshot>;

    /// Subscribers with any usage recorded in `period`
    async fn active_subscribers(&self, period: &PeriodKey) -> BillingResult<Vec<SubscriberId>>;

    /// Drop a subscriber from the period's active set once it is closed
    async fn retire_subscriber(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
    ) -> BillingResult<()>;

    /// Set `key` to `token` only if absent. True when the lock was taken.
    async fn try_acquire_lock(&self, key: &str, token: &str, ttl: Duration)
        -> BillingResult<bool>;

    /// Delete `key` only if it still holds `token`
    async fn release_lock(&self, key: &str, token: &str) -> BillingResult<bool>;

    /// Create a marker key if absent. True when this call created it.
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> BillingResult<bool>;

    async fn exists(&self, key: &str) -> BillingResult<bool>;

    async fn get_cached(&self, key: &str) -> BillingResult<Option<String>>;

    async fn put_cached(&self, key: &str, value: &str, ttl: Duration) -> BillingResult<()>;

    async fn invalidate(&self, key: &str) -> BillingResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_keys_embed_period_and_subscriber() {
        let period = PeriodKey::parse("2026-10").unwrap();
        let sub = SubscriberId::from("u1");
        assert_eq!(keys::usage(&sub, &period), "usage:2026-10:u1");
        assert_eq!(keys::active_set(&period), "usage:2026-10:active");
        assert_eq!(keys::sync_lock(&sub), "lock:sync:u1");
    }

    #[test]
    fn test_counter_ttl_outlives_period() {
        let period = PeriodKey::parse("2026-02").unwrap();
        let ttl = counter_ttl(&period);
        assert_eq!(ttl, Duration::from_secs((28 + 7) * 86_400));
    }

    #[test]
    fn test_minute_bucket() {
        let a = minute_bucket(datetime!(2026-10-19 10:00:00 UTC));
        let b = minute_bucket(datetime!(2026-10-19 10:00:59 UTC));
        let c = minute_bucket(datetime!(2026-10-19 10:01:00 UTC));
        assert_eq!(a, b);
        assert_eq!(a + 1, c);
    }

    #[test]
    fn test_snapshot_requests_sum_endpoints() {
        let mut snapshot =
            UsageSnapshot::empty(SubscriberId::from("u1"), PeriodKey::parse("2026-10").unwrap());
        assert!(!snapshot.has_activity());
        snapshot.per_endpoint_counts.insert("getBalance".into(), 3);
        snapshot.per_endpoint_counts.insert("sendTransaction".into(), 2);
        assert_eq!(snapshot.requests_used(), 5);
        assert!(snapshot.has_activity());
    }
}
