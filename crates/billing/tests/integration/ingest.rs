use meterflow_billing::CounterStore;
use meterflow_shared::{PeriodKey, SubscriberId};

use crate::common::setup;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_record_usage_counts_every_call() {
    let t = setup();
    let sub = SubscriberId::from("u1");

    let mut tasks = Vec::new();
    for i in 0..200 {
        let engine = t.engine.clone();
        let sub = sub.clone();
        tasks.push(tokio::spawn(async move {
            let endpoint = if i % 2 == 0 { "getBalance" } else { "sendTransaction" };
            engine.record_usage(&sub, endpoint, 1, 10, 20).await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_some());
    }
    t.engine.wait_idle().await;

    let snapshot = t.counter.snapshot(&sub, &PeriodKey::current()).await.unwrap();
    assert_eq!(snapshot.requests_used(), 200);
    assert_eq!(snapshot.per_endpoint_counts["getBalance"], 100);
    assert_eq!(snapshot.per_endpoint_counts["sendTransaction"], 100);
    assert_eq!(snapshot.compute_units_consumed, 200);
    assert_eq!(snapshot.bandwidth_bytes, 200 * 30);
}

#[tokio::test]
async fn current_usage_reports_limit_and_period() {
    let t = setup();
    t.record_calls("u1", "getBalance", 3).await;

    let usage = t
        .engine
        .get_current_usage(&SubscriberId::from("u1"))
        .await
        .unwrap();
    let period = PeriodKey::current();
    assert_eq!(usage.requests_used, 3);
    assert_eq!(usage.limit, Some(1_000));
    assert_eq!(usage.period_start, period.start);
    assert_eq!(usage.period_end, period.end);
}

#[tokio::test]
async fn counter_outage_never_fails_the_caller() {
    let t = setup();
    t.counter.set_offline(true);

    let recorded = t
        .engine
        .record_usage(&SubscriberId::from("u1"), "getBalance", 1, 0, 0)
        .await;
    assert_eq!(recorded, None);

    t.counter.set_offline(false);
    let usage = t
        .engine
        .get_current_usage(&SubscriberId::from("u1"))
        .await
        .unwrap();
    assert_eq!(usage.requests_used, 0);
}

#[tokio::test]
async fn timeline_keeps_most_recent_first() {
    let t = setup();
    let sub = SubscriberId::from("u1");
    t.engine.record_usage(&sub, "getBalance", 0, 0, 0).await;
    t.engine.record_usage(&sub, "sendTransaction", 0, 0, 0).await;
    t.engine.wait_idle().await;

    let timeline = t.engine.usage_timeline(&sub, 10).await.unwrap();
    assert_eq!(timeline.len(), 2);
    assert_eq!(timeline[0].endpoint, "sendTransaction");
}
