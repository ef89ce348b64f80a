//! Short-lived subscription cache for the hot path
//!
//! Records are cached as JSON in the counter store. Any cache failure falls
//! through to the ledger, which stays authoritative.

use std::sync::Arc;
use std::time::Duration;

use meterflow_shared::SubscriberId;
use time::OffsetDateTime;

use crate::counter::{keys, CounterStore};
use crate::error::BillingResult;
use crate::ledger::{LedgerStore, SubscriptionRecord};

#[derive(Clone)]
pub struct SubscriptionCache {
    counter: Arc<dyn CounterStore>,
    ledger: Arc<dyn LedgerStore>,
    ttl: Duration,
}

impl SubscriptionCache {
    pub fn new(counter: Arc<dyn CounterStore>, ledger: Arc<dyn LedgerStore>, ttl: Duration) -> Self {
        Self { counter, ledger, ttl }
    }

    /// Subscription for `subscriber`; a subscriber with no record is on the free tier
    pub async fn get(&self, subscriber: &SubscriberId) -> BillingResult<SubscriptionRecord> {
        let key = keys::subscription_cache(subscriber);

        match self.counter.get_cached(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<SubscriptionRecord>(&raw) {
                Ok(record) => return Ok(record),
                Err(e) => {
                    tracing::warn!(subscriber_id = %subscriber, error = %e, "Discarding unreadable cached subscription");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(subscriber_id = %subscriber, error = %e, "Subscription cache read failed");
            }
        }

        let record = self
            .ledger
            .subscription(subscriber)
            .await?
            .unwrap_or_else(|| SubscriptionRecord::free(subscriber.clone(), OffsetDateTime::UNIX_EPOCH));

        match serde_json::to_string(&record) {
            Ok(raw) => {
                if let Err(e) = self.counter.put_cached(&key, &raw, self.ttl).await {
                    tracing::debug!(subscriber_id = %subscriber, error = %e, "Subscription cache write failed");
                }
            }
            Err(e) => {
                tracing::warn!(subscriber_id = %subscriber, error = %e, "Failed to encode subscription for cache");
            }
        }

        Ok(record)
    }

    pub async fn invalidate(&self, subscriber: &SubscriberId) {
        if let Err(e) = self
            .counter
            .invalidate(&keys::subscription_cache(subscriber))
            .await
        {
            tracing::warn!(subscriber_id = %subscriber, error = %e, "Failed to invalidate cached subscription");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::MemoryCounterStore;
    use crate::ledger::MemoryLedgerStore;
    use meterflow_shared::PlanTier;

    fn setup() -> (Arc<MemoryCounterStore>, Arc<MemoryLedgerStore>, SubscriptionCache) {
        let counter = Arc::new(MemoryCounterStore::new());
        let ledger = Arc::new(MemoryLedgerStore::new());
        let cache = SubscriptionCache::new(counter.clone(), ledger.clone(), Duration::from_secs(60));
        (counter, ledger, cache)
    }

    #[tokio::test]
    async fn test_unknown_subscriber_is_free() {
        let (_, _, cache) = setup();
        let record = cache.get(&SubscriberId::from("nobody")).await.unwrap();
        assert_eq!(record.plan_tier, PlanTier::Free);
    }

    #[tokio::test]
    async fn test_cached_until_invalidated() {
        let (_, ledger, cache) = setup();
        let sub = SubscriberId::from("u1");
        let now = OffsetDateTime::now_utc();

        let mut record = SubscriptionRecord::free(sub.clone(), now);
        record.plan_tier = PlanTier::Starter;
        ledger.upsert_subscription(&record).await.unwrap();
        assert_eq!(cache.get(&sub).await.unwrap().plan_tier, PlanTier::Starter);

        record.plan_tier = PlanTier::Professional;
        record.provider_updated_at = now + time::Duration::seconds(1);
        ledger.upsert_subscription(&record).await.unwrap();
        assert_eq!(cache.get(&sub).await.unwrap().plan_tier, PlanTier::Starter);

        cache.invalidate(&sub).await;
        assert_eq!(cache.get(&sub).await.unwrap().plan_tier, PlanTier::Professional);
    }

    #[tokio::test]
    async fn test_counter_outage_falls_through_to_ledger() {
        let (counter, ledger, cache) = setup();
        let sub = SubscriberId::from("u1");
        let mut record = SubscriptionRecord::free(sub.clone(), OffsetDateTime::now_utc());
        record.plan_tier = PlanTier::Enterprise;
        ledger.upsert_subscription(&record).await.unwrap();

        counter.set_offline(true);
        assert_eq!(cache.get(&sub).await.unwrap().plan_tier, PlanTier::Enterprise);
    }
}
