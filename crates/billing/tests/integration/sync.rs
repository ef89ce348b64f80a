use std::time::Duration;

use meterflow_billing::ledger::LedgerStore;
use meterflow_billing::provider::ReportMode;
use meterflow_billing::{CounterStore, SyncOutcome};
use meterflow_shared::{PeriodKey, PlanTier, SubscriberId};
use time::OffsetDateTime;

use crate::common::{setup, TestEngine};

/// A professional subscriber whose provider subscription has a metered item
async fn metered_subscriber(t: &TestEngine, subscriber: &str) {
    t.provider.add_subscription("sub_1", "cus_1", "si_requests");
    t.subscribe(subscriber, PlanTier::Professional, Some("sub_1"))
        .await;
}

#[tokio::test]
async fn idle_subscriber_is_never_reported() {
    let t = setup();
    metered_subscriber(&t, "u2").await;

    let outcome = t
        .engine
        .run_sync(OffsetDateTime::now_utc())
        .await;
    assert!(outcome.results.is_empty());

    // Even when asked directly, zero activity means no provider call
    let sync = meterflow_billing::SyncOrchestrator::new(
        t.counter.clone(),
        t.ledger.clone(),
        t.provider.clone(),
        std::sync::Arc::new(meterflow_billing::PricingTable::default()),
        std::sync::Arc::new(t.engine.config().clone()),
    );
    let result = sync
        .sync_subscriber(&SubscriberId::from("u2"), &PeriodKey::current(), OffsetDateTime::now_utc())
        .await;
    assert_eq!(result, SyncOutcome::NothingToReport);
    assert!(t.provider.reports().is_empty());
}

#[tokio::test]
async fn reports_priced_usage_and_only_the_difference_afterwards() {
    let t = setup();
    metered_subscriber(&t, "u1").await;
    let u1 = SubscriberId::from("u1");

    // 500 x $0.0001 = 5 cents
    t.record_calls("u1", "sendTransaction", 500).await;
    let summary = t.engine.run_sync(OffsetDateTime::now_utc()).await;
    assert_eq!(summary.reported(), 1);
    assert_eq!(
        summary.outcome_for(&u1),
        Some(&SyncOutcome::Reported { records: 1, cents: 5 })
    );

    let reports = t.provider.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].subscription_item, "si_requests");
    assert_eq!(reports[0].quantity, 5);
    assert_eq!(reports[0].mode, ReportMode::Increment);

    // Nothing new: nothing reported
    let summary = t.engine.run_sync(OffsetDateTime::now_utc()).await;
    assert_eq!(summary.outcome_for(&u1), Some(&SyncOutcome::NothingToReport));
    assert_eq!(t.provider.reports().len(), 1);

    // 100 more calls add one cent
    t.record_calls("u1", "sendTransaction", 100).await;
    t.engine.run_sync(OffsetDateTime::now_utc()).await;
    let reports = t.provider.reports();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[1].quantity, 1);
    assert_ne!(reports[0].idempotency_key, reports[1].idempotency_key);

    let period = t
        .ledger
        .billing_period(&u1, &PeriodKey::current())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(period.requests_used, 600);
    assert_eq!(period.request_cost_cents, 6);
    assert!(period.synced_at.is_some());
    assert!(!period.is_closed());
}

#[tokio::test]
async fn concurrent_syncs_report_once() {
    let t = setup();
    metered_subscriber(&t, "u1").await;
    t.record_calls("u1", "sendTransaction", 300).await;
    t.provider.set_report_delay(Duration::from_millis(100));

    let now = OffsetDateTime::now_utc();
    let (a, b) = tokio::join!(t.engine.run_sync(now), t.engine.run_sync(now));

    assert_eq!(a.reported() + b.reported(), 1);
    assert_eq!(t.provider.reports().len(), 1);
}

#[tokio::test]
async fn provider_failure_keeps_usage_for_next_run() {
    let t = setup();
    metered_subscriber(&t, "u1").await;
    t.record_calls("u1", "sendTransaction", 200).await;

    t.provider.set_reject_reports(true);
    let summary = t.engine.run_sync(OffsetDateTime::now_utc()).await;
    assert_eq!(summary.failed(), 1);
    assert!(t.provider.reports().is_empty());

    t.provider.set_reject_reports(false);
    let summary = t.engine.run_sync(OffsetDateTime::now_utc()).await;
    assert_eq!(summary.reported(), 1);
    assert_eq!(t.provider.reports()[0].quantity, 2);
}

#[tokio::test]
async fn free_subscriber_is_rolled_up_but_not_reported() {
    let t = setup();
    t.record_calls("free-1", "getBalance", 3).await;

    let summary = t.engine.run_sync(OffsetDateTime::now_utc()).await;
    assert!(matches!(
        summary.outcome_for(&SubscriberId::from("free-1")),
        Some(SyncOutcome::Skipped { .. })
    ));
    assert!(t.provider.reports().is_empty());

    let period = t
        .ledger
        .billing_period(&SubscriberId::from("free-1"), &PeriodKey::current())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(period.requests_used, 3);
}

#[tokio::test]
async fn ended_period_gets_a_final_sync_and_is_closed() {
    let t = setup();
    metered_subscriber(&t, "u1").await;
    let u1 = SubscriberId::from("u1");
    let period = PeriodKey::current();
    t.record_calls("u1", "sendTransaction", 400).await;

    let after_period = period.end + time::Duration::minutes(5);
    let summary = t.engine.run_sync(after_period).await;
    assert_eq!(summary.reported(), 1);

    let report = &t.provider.reports()[0];
    assert!(report.timestamp < period.end);

    let rollup = t.ledger.billing_period(&u1, &period).await.unwrap().unwrap();
    assert!(rollup.is_closed());
    assert!(t.counter.active_subscribers(&period).await.unwrap().is_empty());

    // Closed and retired: the next run has nothing to do
    let summary = t.engine.run_sync(after_period).await;
    assert!(summary.results.is_empty());
}
