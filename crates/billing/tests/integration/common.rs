//! Shared fixtures: in-memory stores, a recording provider and signed
//! Stripe deliveries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use meterflow_billing::ledger::SubscriptionRecord;
use meterflow_billing::provider::{
    CustomerInfo, SubscriptionInfo, SubscriptionItemInfo, UsageRecordRequest,
};
use meterflow_billing::webhooks::sign_stripe_payload;
use meterflow_billing::{
    BillingError, BillingProvider, BillingResult, EngineConfig, LedgerStore, MemoryCounterStore,
    MemoryLedgerStore, MemoryNotifier, MeteredPrices, MeteringEngine, ProcessingResult,
    ProviderKind, StripeVerifier,
};
use meterflow_shared::{PlanTier, SubscriberId, SubscriptionStatus};
use time::OffsetDateTime;

pub const WEBHOOK_SECRET: &str = "whsec_integration_test";
pub const PRICE_STARTER: &str = "price_starter";
pub const PRICE_PRO: &str = "price_pro";
pub const PRICE_METERED_REQUESTS: &str = "price_metered_requests";
pub const PRICE_METERED_COMPUTE: &str = "price_metered_compute";

/// Billing provider that records every usage report
#[derive(Default)]
pub struct RecordingProvider {
    reports: Mutex<Vec<UsageRecordRequest>>,
    subscriptions: Mutex<HashMap<String, SubscriptionInfo>>,
    customers: Mutex<HashMap<String, CustomerInfo>>,
    report_delay: Mutex<Option<Duration>>,
    reject_reports: AtomicBool,
    fail_lookups: AtomicBool,
}

impl RecordingProvider {
    pub fn reports(&self) -> Vec<UsageRecordRequest> {
        self.reports.lock().unwrap().clone()
    }

    pub fn add_subscription(&self, id: &str, customer_id: &str, metered_item: &str) {
        let now = OffsetDateTime::now_utc();
        self.subscriptions.lock().unwrap().insert(
            id.to_string(),
            SubscriptionInfo {
                id: id.to_string(),
                customer_id: customer_id.to_string(),
                status: SubscriptionStatus::Active,
                items: vec![
                    SubscriptionItemInfo {
                        item_id: "si_base".to_string(),
                        price_id: Some(PRICE_PRO.to_string()),
                    },
                    SubscriptionItemInfo {
                        item_id: metered_item.to_string(),
                        price_id: Some(PRICE_METERED_REQUESTS.to_string()),
                    },
                ],
                metadata: HashMap::new(),
                current_period_start: now,
                current_period_end: now + time::Duration::days(30),
                cancel_at_period_end: false,
            },
        );
    }

    pub fn add_customer(&self, customer_id: &str, subscriber: &str) {
        self.customers.lock().unwrap().insert(
            customer_id.to_string(),
            CustomerInfo {
                id: customer_id.to_string(),
                metadata: HashMap::from([("subscriber_id".to_string(), subscriber.to_string())]),
            },
        );
    }

    pub fn set_report_delay(&self, delay: Duration) {
        *self.report_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_reject_reports(&self, reject: bool) {
        self.reject_reports.store(reject, Ordering::SeqCst);
    }

    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BillingProvider for RecordingProvider {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn metered_prices(&self) -> MeteredPrices {
        MeteredPrices {
            requests: Some(PRICE_METERED_REQUESTS.to_string()),
            compute_units: Some(PRICE_METERED_COMPUTE.to_string()),
        }
    }

    fn tier_for_price(&self, price_id: &str) -> Option<PlanTier> {
        match price_id {
            PRICE_STARTER => Some(PlanTier::Starter),
            PRICE_PRO => Some(PlanTier::Professional),
            _ => None,
        }
    }

    async fn report_usage(&self, request: &UsageRecordRequest) -> BillingResult<()> {
        let delay = *self.report_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.reject_reports.load(Ordering::SeqCst) {
            return Err(BillingError::ProviderRejected("No such subscription item".into()));
        }
        self.reports.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn get_subscription(&self, subscription_id: &str) -> BillingResult<Option<SubscriptionInfo>> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(BillingError::Provider("503 Service Unavailable".into()));
        }
        Ok(self.subscriptions.lock().unwrap().get(subscription_id).cloned())
    }

    async fn get_customer(&self, customer_id: &str) -> BillingResult<Option<CustomerInfo>> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(BillingError::Provider("503 Service Unavailable".into()));
        }
        Ok(self.customers.lock().unwrap().get(customer_id).cloned())
    }
}

pub struct TestEngine {
    pub engine: Arc<MeteringEngine>,
    pub counter: Arc<MemoryCounterStore>,
    pub ledger: Arc<MemoryLedgerStore>,
    pub provider: Arc<RecordingProvider>,
    pub notifier: Arc<MemoryNotifier>,
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        provider_max_retries: 0,
        provider_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    }
}

pub fn setup() -> TestEngine {
    setup_with(test_config())
}

pub fn setup_with(config: EngineConfig) -> TestEngine {
    let counter = Arc::new(MemoryCounterStore::new());
    let ledger = Arc::new(MemoryLedgerStore::new());
    let provider = Arc::new(RecordingProvider::default());
    let notifier = Arc::new(MemoryNotifier::new());

    let engine = MeteringEngine::builder(counter.clone(), ledger.clone(), provider.clone())
        .config(config)
        .notifier(notifier.clone())
        .verifier(
            ProviderKind::Stripe,
            Arc::new(StripeVerifier::new(WEBHOOK_SECRET, 300)),
        )
        .build();

    TestEngine {
        engine: Arc::new(engine),
        counter,
        ledger,
        provider,
        notifier,
    }
}

impl TestEngine {
    /// Put a subscriber on a plan, as a subscription webhook would
    pub async fn subscribe(&self, subscriber: &str, tier: PlanTier, subscription_id: Option<&str>) {
        let record = SubscriptionRecord {
            plan_tier: tier,
            provider_subscription_id: subscription_id.map(str::to_string),
            ..SubscriptionRecord::free(SubscriberId::from(subscriber), OffsetDateTime::now_utc())
        };
        self.ledger.upsert_subscription(&record).await.unwrap();
    }

    pub async fn record_calls(&self, subscriber: &str, endpoint: &str, calls: usize) {
        let sub = SubscriberId::from(subscriber);
        for _ in 0..calls {
            self.engine.record_usage(&sub, endpoint, 0, 0, 0).await;
        }
        self.engine.wait_idle().await;
    }

    /// Sign and deliver a Stripe payload
    pub async fn deliver(&self, payload: &serde_json::Value) -> BillingResult<ProcessingResult> {
        let raw = serde_json::to_vec(payload).unwrap();
        let signature =
            sign_stripe_payload(WEBHOOK_SECRET, &raw, OffsetDateTime::now_utc().unix_timestamp());
        self.engine.process_webhook(&raw, &signature, "stripe").await
    }
}

pub fn stripe_event(id: &str, event_type: &str, created: i64, object: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "object": "event",
        "type": event_type,
        "created": created,
        "livemode": false,
        "data": { "object": object }
    })
}

pub fn subscription_object(
    id: &str,
    customer: &str,
    status: &str,
    price: &str,
    subscriber: Option<&str>,
) -> serde_json::Value {
    let metadata = match subscriber {
        Some(s) => serde_json::json!({ "subscriber_id": s }),
        None => serde_json::json!({}),
    };
    serde_json::json!({
        "id": id,
        "object": "subscription",
        "customer": customer,
        "status": status,
        "items": { "object": "list", "data": [
            { "id": "si_base", "price": { "id": price } },
            { "id": "si_requests", "price": { "id": PRICE_METERED_REQUESTS } }
        ]},
        "metadata": metadata,
        "current_period_start": 1_759_276_800,
        "current_period_end": 1_761_955_200,
        "cancel_at_period_end": false
    })
}

pub fn invoice_object(id: &str, customer: &str, subscription: Option<&str>, amount: i64) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "object": "invoice",
        "customer": customer,
        "subscription": subscription,
        "amount_due": amount,
        "amount_paid": amount,
        "currency": "usd",
        "attempt_count": 1
    })
}
