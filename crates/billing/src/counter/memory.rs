//! In-memory counter store (for development without Redis, and tests)

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use meterflow_shared::{PeriodKey, SubscriberId};
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{
    keys, CounterStore, TimelineEntry, UsageIncrement, UsageSnapshot, RATE_BUCKET_TTL,
};
use crate::error::{BillingError, BillingResult};

#[derive(Default)]
struct Totals {
    requests: u64,
    compute_units: u64,
    bandwidth: u64,
    rate_limit_hits: u64,
    endpoints: BTreeMap<String, u64>,
}

#[derive(Default)]
struct State {
    usage: HashMap<String, Totals>,
    active: HashMap<String, BTreeSet<SubscriberId>>,
    rate_buckets: HashMap<String, (u64, Instant)>,
    timelines: HashMap<String, VecDeque<TimelineEntry>>,
    /// Locks, markers and cache entries: key -> (value, expiry)
    values: HashMap<String, (String, Instant)>,
}

impl State {
    fn live_value(&mut self, key: &str) -> Option<&String> {
        let now = Instant::now();
        if self.values.get(key).is_some_and(|(_, expiry)| *expiry <= now) {
            self.values.remove(key);
        }
        self.values.get(key).map(|(value, _)| value)
    }
}

/// Counter store held in process memory.
///
/// Usage counters never expire here; key TTLs are honoured for locks,
/// markers, caches and rate buckets using tokio's clock.
#[derive(Default)]
pub struct MemoryCounterStore {
    state: RwLock<State>,
    offline: AtomicBool,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail as if the backing store were unreachable
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> BillingResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BillingError::CounterStore(
                "counter store unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_usage(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
        increment: &UsageIncrement,
        _ttl: Duration,
    ) -> BillingResult<u64> {
        self.check_online()?;
        let mut state = self.state.write().await;

        let totals = state.usage.entry(keys::usage(subscriber, period)).or_default();
        totals.requests = totals.requests.saturating_add(1);
        totals.compute_units = totals.compute_units.saturating_add(increment.compute_units);
        totals.bandwidth = totals.bandwidth.saturating_add(increment.bandwidth_bytes);
        *totals.endpoints.entry(increment.endpoint.clone()).or_insert(0) += 1;
        let total = totals.requests;

        state
            .active
            .entry(keys::active_set(period))
            .or_default()
            .insert(subscriber.clone());

        Ok(total)
    }

    async fn increment_rate_bucket(
        &self,
        subscriber: &SubscriberId,
        minute: i64,
    ) -> BillingResult<u64> {
        self.check_online()?;
        let mut state = self.state.write().await;
        let now = Instant::now();
        state.rate_buckets.retain(|_, (_, expiry)| *expiry > now);

        let entry = state
            .rate_buckets
            .entry(keys::rate_bucket(subscriber, minute))
            .or_insert((0, now + RATE_BUCKET_TTL));
        entry.0 += 1;
        Ok(entry.0)
    }

    async fn rate_bucket(&self, subscriber: &SubscriberId, minute: i64) -> BillingResult<u64> {
        self.check_online()?;
        let state = self.state.read().await;
        let now = Instant::now();
        Ok(state
            .rate_buckets
            .get(&keys::rate_bucket(subscriber, minute))
            .filter(|(_, expiry)| *expiry > now)
            .map(|(count, _)| *count)
            .unwrap_or(0))
    }

    async fn record_rate_limit_hit(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
    ) -> BillingResult<()> {
        self.check_online()?;
        let mut state = self.state.write().await;
        let totals = state.usage.entry(keys::usage(subscriber, period)).or_default();
        totals.rate_limit_hits += 1;
        Ok(())
    }

    async fn append_timeline(
        &self,
        subscriber: &SubscriberId,
        entry: &TimelineEntry,
        max_len: usize,
    ) -> BillingResult<()> {
        self.check_online()?;
        let mut state = self.state.write().await;
        let timeline = state.timelines.entry(keys::timeline(subscriber)).or_default();
        timeline.push_front(entry.clone());
        timeline.truncate(max_len.max(1));
        Ok(())
    }

    async fn timeline(
        &self,
        subscriber: &SubscriberId,
        limit: usize,
    ) -> BillingResult<Vec<TimelineEntry>> {
        self.check_online()?;
        let state = self.state.read().await;
        Ok(state
            .timelines
            .get(&keys::timeline(subscriber))
            .map(|timeline| timeline.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn snapshot(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
    ) -> BillingResult<UsageSnapshot> {
        self.check_online()?;
        let state = self.state.read().await;
        let mut snapshot = UsageSnapshot::empty(subscriber.clone(), *period);
        if let Some(totals) = state.usage.get(&keys::usage(subscriber, period)) {
            snapshot.total_requests = totals.requests;
            snapshot.compute_units_consumed = totals.compute_units;
            snapshot.bandwidth_bytes = totals.bandwidth;
            snapshot.rate_limit_hit_count = totals.rate_limit_hits;
            snapshot.per_endpoint_counts = totals.endpoints.clone();
        }
        Ok(snapshot)
    }

    async fn active_subscribers(&self, period: &PeriodKey) -> BillingResult<Vec<SubscriberId>> {
        self.check_online()?;
        let state = self.state.read().await;
        Ok(state
            .active
            .get(&keys::active_set(period))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn retire_subscriber(
        &self,
        subscriber: &SubscriberId,
        period: &PeriodKey,
    ) -> BillingResult<()> {
        self.check_online()?;
        let mut state = self.state.write().await;
        if let Some(set) = state.active.get_mut(&keys::active_set(period)) {
            set.remove(subscriber);
        }
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> BillingResult<bool> {
        self.check_online()?;
        let mut state = self.state.write().await;
        if state.live_value(key).is_some() {
            return Ok(false);
        }
        state
            .values
            .insert(key.to_string(), (token.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn release_lock(&self, key: &str, token: &str) -> BillingResult<bool> {
        self.check_online()?;
        let mut state = self.state.write().await;
        if state.live_value(key).map(String::as_str) == Some(token) {
            state.values.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn set_if_absent(&self, key: &str, ttl: Duration) -> BillingResult<bool> {
        self.try_acquire_lock(key, "1", ttl).await
    }

    async fn exists(&self, key: &str) -> BillingResult<bool> {
        self.check_online()?;
        let mut state = self.state.write().await;
        Ok(state.live_value(key).is_some())
    }

    async fn get_cached(&self, key: &str) -> BillingResult<Option<String>> {
        self.check_online()?;
        let mut state = self.state.write().await;
        Ok(state.live_value(key).cloned())
    }

    async fn put_cached(&self, key: &str, value: &str, ttl: Duration) -> BillingResult<()> {
        self.check_online()?;
        let mut state = self.state.write().await;
        state
            .values
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> BillingResult<()> {
        self.check_online()?;
        let mut state = self.state.write().await;
        state.values.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn increment(endpoint: &str) -> UsageIncrement {
        UsageIncrement {
            endpoint: endpoint.to_string(),
            compute_units: 2,
            bandwidth_bytes: 100,
        }
    }

    #[tokio::test]
    async fn test_increment_returns_running_total() {
        let store = MemoryCounterStore::new();
        let sub = SubscriberId::from("u1");
        let period = PeriodKey::current();
        let ttl = Duration::from_secs(60);

        assert_eq!(
            store.increment_usage(&sub, &period, &increment("a"), ttl).await.unwrap(),
            1
        );
        assert_eq!(
            store.increment_usage(&sub, &period, &increment("b"), ttl).await.unwrap(),
            2
        );

        let snapshot = store.snapshot(&sub, &period).await.unwrap();
        assert_eq!(snapshot.requests_used(), 2);
        assert_eq!(snapshot.compute_units_consumed, 4);
        assert_eq!(snapshot.bandwidth_bytes, 200);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryCounterStore::new());
        let sub = SubscriberId::from("u1");
        let period = PeriodKey::current();

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = Arc::clone(&store);
                let sub = sub.clone();
                tokio::spawn(async move {
                    store
                        .increment_usage(&sub, &period, &increment("a"), Duration::from_secs(60))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = store.snapshot(&sub, &period).await.unwrap();
        assert_eq!(snapshot.total_requests, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expires_after_ttl() {
        let store = MemoryCounterStore::new();
        let ttl = Duration::from_secs(5);

        assert!(store.try_acquire_lock("lock:x", "a", ttl).await.unwrap());
        assert!(!store.try_acquire_lock("lock:x", "b", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.try_acquire_lock("lock:x", "b", ttl).await.unwrap());
        // The original holder no longer owns it
        assert!(!store.release_lock("lock:x", "a").await.unwrap());
        assert!(store.release_lock("lock:x", "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_offline_store_fails() {
        let store = MemoryCounterStore::new();
        store.set_offline(true);
        let result = store
            .increment_usage(
                &SubscriberId::from("u1"),
                &PeriodKey::current(),
                &increment("a"),
                Duration::from_secs(60),
            )
            .await;
        assert!(matches!(result, Err(BillingError::CounterStore(_))));
    }

    #[tokio::test]
    async fn test_retire_removes_from_active_set() {
        let store = MemoryCounterStore::new();
        let sub = SubscriberId::from("u1");
        let period = PeriodKey::current();
        store
            .increment_usage(&sub, &period, &increment("a"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.active_subscribers(&period).await.unwrap(), vec![sub.clone()]);

        store.retire_subscriber(&sub, &period).await.unwrap();
        assert!(store.active_subscribers(&period).await.unwrap().is_empty());
    }
}
