//! Per-minute rate limiting on top of the counter store
//!
//! Usage ingest bumps the subscriber's bucket for the current minute on
//! every metered request. Checking reads that bucket against the tier's
//! per-minute allowance (`RATE_LIMIT_*_PER_MINUTE`).

use std::sync::Arc;

use meterflow_shared::SubscriberId;
use time::OffsetDateTime;

use crate::cache::SubscriptionCache;
use crate::config::RateLimits;
use crate::counter::{minute_bucket, CounterStore};
use crate::error::BillingResult;

/// Rate limit check result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining_minute: u32,
    pub reset_at: OffsetDateTime,
    pub retry_after_seconds: Option<u32>,
}

impl RateLimitResult {
    /// Result used when the counter store can't be read
    pub fn fail_open(limit: u32, now: OffsetDateTime) -> Self {
        let (reset_at, _) = window_bounds(now);
        Self {
            allowed: true,
            limit,
            remaining_minute: limit,
            reset_at,
            retry_after_seconds: None,
        }
    }
}

fn window_bounds(now: OffsetDateTime) -> (OffsetDateTime, u32) {
    let now_ts = now.unix_timestamp();
    let window_end = (minute_bucket(now) + 1) * 60;
    let reset_at = OffsetDateTime::from_unix_timestamp(window_end).unwrap_or(now);
    let retry_after = u32::try_from(window_end - now_ts).unwrap_or(60);
    (reset_at, retry_after)
}

/// Rate limiter service
#[derive(Clone)]
pub struct RateLimiter {
    counter: Arc<dyn CounterStore>,
    cache: SubscriptionCache,
    limits: RateLimits,
}

impl RateLimiter {
    pub fn new(counter: Arc<dyn CounterStore>, cache: SubscriptionCache, limits: RateLimits) -> Self {
        Self {
            counter,
            cache,
            limits,
        }
    }

    pub async fn limit_for(&self, subscriber: &SubscriberId) -> BillingResult<u32> {
        let tier = self.cache.get(subscriber).await?.effective_tier();
        Ok(self.limits.per_minute(tier))
    }

    /// Check the subscriber's bucket for the minute containing `now`
    pub async fn check_rate_limit(
        &self,
        subscriber: &SubscriberId,
        now: OffsetDateTime,
    ) -> BillingResult<RateLimitResult> {
        let limit = self.limit_for(subscriber).await?;
        let count = self.counter.rate_bucket(subscriber, minute_bucket(now)).await?;
        Ok(Self::evaluate(limit, count, now))
    }

    /// A bucket already at the limit means the next request is over it
    pub fn evaluate(limit: u32, count: u64, now: OffsetDateTime) -> RateLimitResult {
        let (reset_at, retry_after) = window_bounds(now);
        let allowed = count < u64::from(limit);
        let remaining = u64::from(limit).saturating_sub(count);

        RateLimitResult {
            allowed,
            limit,
            remaining_minute: u32::try_from(remaining).unwrap_or(u32::MAX),
            reset_at,
            retry_after_seconds: if allowed { None } else { Some(retry_after) },
        }
    }
}
