//! Redis-backed counter store

use std::collections::HashMap;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{Client, Script};
use async_trait::async_trait;
use meterflow_shared::{PeriodKey, SubscriberId};

use super::{
    fields, keys, CounterStore, TimelineEntry, UsageIncrement, UsageSnapshot, RATE_BUCKET_TTL,
};
use crate::error::BillingResult;

/// Deletes the lock only when the caller still owns it, so a holder whose
/// TTL lapsed cannot release a lock someone else has since taken.
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisCounterStore {
    manager: ConnectionManager,
    release_script: Script,
}

impl RedisCounterStore {
    pub async fn connect(url: &str) -> BillingResult<Self> {
        tracing::info!("Connecting to Redis counter store");
        let client = Client::open(url)?;
        // ConnectionManager reconnects on its own after transient failures
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to get Redis connection manager");
            e
        })?;
        tracing::info!("Connected to Redis counter store");
        Ok(Self::new(manager))
    }

    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            release_script: Script::new(RELEASE_LOCK_SCRIPT),
        }
    }

    pub async fn health_check(&self) -> BillingResult<()> {
        let mut conn = self.manager.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_usage(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
        increment: &UsageIncrement,
        ttl: Duration,
    ) -> BillingResult<u64> {
        let mut conn = self.manager.clone();
        let usage_key = keys::usage(subscriber, period);
        let endpoints_key = keys::usage_endpoints(subscriber, period);
        let active_key = keys::active_set(period);
        let ttl_secs = ttl.as_secs().max(1);

        // MULTI/EXEC so a snapshot never sees the endpoint count without the total
        let (total,): (u64,) = ::redis::pipe()
            .atomic()
            .cmd("HINCRBY")
            .arg(&endpoints_key)
            .arg(&increment.endpoint)
            .arg(1)
            .ignore()
            .cmd("HINCRBY")
            .arg(&usage_key)
            .arg(fields::REQUESTS)
            .arg(1)
            .cmd("HINCRBY")
            .arg(&usage_key)
            .arg(fields::COMPUTE_UNITS)
            .arg(increment.compute_units)
            .ignore()
            .cmd("HINCRBY")
            .arg(&usage_key)
            .arg(fields::BANDWIDTH)
            .arg(increment.bandwidth_bytes)
            .ignore()
            .cmd("EXPIRE")
            .arg(&usage_key)
            .arg(ttl_secs)
            .ignore()
            .cmd("EXPIRE")
            .arg(&endpoints_key)
            .arg(ttl_secs)
            .ignore()
            .cmd("SADD")
            .arg(&active_key)
            .arg(subscriber.as_str())
            .ignore()
            .cmd("EXPIRE")
            .arg(&active_key)
            .arg(ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(total)
    }

    async fn increment_rate_bucket(
        &self,
        subscriber: &SubscriberId,
        minute: i64,
    ) -> BillingResult<u64> {
        let mut conn = self.manager.clone();
        let key = keys::rate_bucket(subscriber, minute);

        let (count,): (u64,) = ::redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(&key)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(RATE_BUCKET_TTL.as_secs())
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(count)
    }

    async fn rate_bucket(&self, subscriber: &SubscriberId, minute: i64) -> BillingResult<u64> {
        let mut conn = self.manager.clone();
        let count: Option<u64> = ::redis::cmd("GET")
            .arg(keys::rate_bucket(subscriber, minute))
            .query_async(&mut conn)
            .await?;
        Ok(count.unwrap_or(0))
    }

    async fn record_rate_limit_hit(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
    ) -> BillingResult<()> {
        let mut conn = self.manager.clone();
        let _: i64 = ::redis::cmd("HINCRBY")
            .arg(keys::usage(subscriber, period))
            .arg(fields::RATE_LIMIT_HITS)
            .arg(1)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn append_timeline(
        &self,
        subscriber: &SubscriberId,
        entry: &TimelineEntry,
        max_len: usize,
    ) -> BillingResult<()> {
        let mut conn = self.manager.clone();
        let key = keys::timeline(subscriber);
        let payload = serde_json::to_string(entry)?;
        let stop = max_len.max(1) as i64 - 1;

        let _: () = ::redis::pipe()
            .cmd("LPUSH")
            .arg(&key)
            .arg(payload)
            .ignore()
            .cmd("LTRIM")
            .arg(&key)
            .arg(0)
            .arg(stop)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn timeline(
        &self,
        subscriber: &SubscriberId,
        limit: usize,
    ) -> BillingResult<Vec<TimelineEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        let raw: Vec<String> = ::redis::cmd("LRANGE")
            .arg(keys::timeline(subscriber))
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut conn)
            .await?;

        Ok(raw
            .iter()
            .filter_map(|item| serde_json::from_str(item).ok())
            .collect())
    }

    async fn snapshot(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
    ) -> BillingResult<UsageSnapshot> {
        let mut conn = self.manager.clone();
        let (totals, endpoints): (HashMap<String, u64>, HashMap<String, u64>) = ::redis::pipe()
            .atomic()
            .cmd("HGETALL")
            .arg(keys::usage(subscriber, period))
            .cmd("HGETALL")
            .arg(keys::usage_endpoints(subscriber, period))
            .query_async(&mut conn)
            .await?;

        let field = |name: &str| totals.get(name).copied().unwrap_or(0);
        let mut snapshot = UsageSnapshot::empty(subscriber.clone(), *period);
        snapshot.total_requests = field(fields::REQUESTS);
        snapshot.compute_units_consumed = field(fields::COMPUTE_UNITS);
        snapshot.bandwidth_bytes = field(fields::BANDWIDTH);
        snapshot.rate_limit_hit_count = field(fields::RATE_LIMIT_HITS);
        snapshot.per_endpoint_counts = endpoints.into_iter().collect();
        Ok(snapshot)
    }

    async fn active_subscribers(&self, period: &PeriodKey) -> BillingResult<Vec<SubscriberId>> {
        let mut conn = self.manager.clone();
        let members: Vec<String> = ::redis::cmd("SMEMBERS")
            .arg(keys::active_set(period))
            .query_async(&mut conn)
            .await?;
        let mut subscribers: Vec<SubscriberId> =
            members.into_iter().map(SubscriberId::from).collect();
        subscribers.sort();
        Ok(subscribers)
    }

    async fn retire_subscriber(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
    ) -> BillingResult<()> {
        let mut conn = self.manager.clone();
        let _: i64 = ::redis::cmd("SREM")
            .arg(keys::active_set(period))
            .arg(subscriber.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> BillingResult<bool> {
        let mut conn = self.manager.clone();
        let result: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn release_lock(&self, key: &str, token: &str) -> BillingResult<bool> {
        let mut conn = self.manager.clone();
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn set_if_absent(&self, key: &str, ttl: Duration) -> BillingResult<bool> {
        let mut conn = self.manager.clone();
        let result: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn exists(&self, key: &str) -> BillingResult<bool> {
        let mut conn = self.manager.clone();
        let exists: bool = ::redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    async fn get_cached(&self, key: &str) -> BillingResult<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn put_cached(&self, key: &str, value: &str, ttl: Duration) -> BillingResult<()> {
        let mut conn = self.manager.clone();
        let _: () = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> BillingResult<()> {
        let mut conn = self.manager.clone();
        let _: i64 = ::redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}
