use meterflow_billing::ledger::LedgerStore;
use meterflow_billing::{CounterStore, EngineConfig, NotificationKind, OverageAction, OverageType};
use meterflow_shared::{PeriodKey, PlanTier, SubscriberId};

use crate::common::{setup, setup_with, test_config};

fn config_with_free_limit(limit: u64) -> EngineConfig {
    let mut config = test_config();
    config.limits.free = limit;
    config
}

#[tokio::test]
async fn free_subscriber_blocked_one_past_the_limit() {
    let t = setup_with(config_with_free_limit(100));
    let u1 = SubscriberId::from("u1");

    t.record_calls("u1", "getBalance", 100).await;

    let usage = t.engine.get_current_usage(&u1).await.unwrap();
    assert_eq!(usage.requests_used, 100);
    assert_eq!(usage.limit, Some(100));
    // Exactly at the limit is still allowed
    assert!(t.engine.is_service_enabled(&u1).await.unwrap());

    let action = t
        .engine
        .handle_overage(&u1, "api_limit".parse::<OverageType>().unwrap(), 1)
        .await
        .unwrap();
    assert_eq!(action, OverageAction::Block);
    assert!(!t.engine.is_service_enabled(&u1).await.unwrap());
    assert_eq!(t.notifier.count(NotificationKind::OverageBlocked), 1);
}

#[tokio::test]
async fn free_subscriber_blocked_by_ingest_past_the_limit() {
    let t = setup_with(config_with_free_limit(10));
    let u1 = SubscriberId::from("u1");

    t.record_calls("u1", "getBalance", 10).await;
    assert!(t.engine.is_service_enabled(&u1).await.unwrap());

    t.record_calls("u1", "getBalance", 1).await;
    assert!(!t.engine.is_service_enabled(&u1).await.unwrap());
}

#[tokio::test]
async fn starter_accrues_to_the_cap_then_blocks() {
    let t = setup();
    let sub = SubscriberId::from("starter-1");
    t.subscribe("starter-1", PlanTier::Starter, None).await;

    // 20,000 over at 50c per 1k is exactly the 1000c cap
    let action = t
        .engine
        .handle_overage(&sub, OverageType::ApiLimit, 20_000)
        .await
        .unwrap();
    assert_eq!(action, OverageAction::AccrueBillable);
    assert!(t.engine.is_service_enabled(&sub).await.unwrap());

    let action = t
        .engine
        .handle_overage(&sub, OverageType::ApiLimit, 20_001)
        .await
        .unwrap();
    assert_eq!(action, OverageAction::Block);
    assert!(!t.engine.is_service_enabled(&sub).await.unwrap());

    let entry = t
        .ledger
        .overage_entry(&sub, &PeriodKey::current())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.accrued_cents, 1_000);
    assert_eq!(entry.cap_cents, Some(1_000));
    assert!(entry.blocked);
}

#[tokio::test]
async fn professional_accrues_without_a_cap() {
    let t = setup();
    let sub = SubscriberId::from("pro-1");
    t.subscribe("pro-1", PlanTier::Professional, None).await;

    let action = t
        .engine
        .handle_overage(&sub, OverageType::ApiLimit, 5_000_000)
        .await
        .unwrap();
    assert_eq!(action, OverageAction::AccrueBillable);
    assert!(t.engine.is_service_enabled(&sub).await.unwrap());

    let entry = t
        .ledger
        .overage_entry(&sub, &PeriodKey::current())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.accrued_cents, 5_000 * 40);
    assert_eq!(entry.cap_cents, None);
}

#[tokio::test]
async fn rate_limit_denial_is_recorded_and_notified_once() {
    let mut config = test_config();
    config.rate_limits.free = 2;
    let t = setup_with(config);
    let sub = SubscriberId::from("u1");

    assert!(t.engine.check_rate_limit(&sub).await.allowed);
    t.record_calls("u1", "getBalance", 2).await;

    let denied = t.engine.check_rate_limit(&sub).await;
    assert!(!denied.allowed);
    assert_eq!(denied.remaining_minute, 0);
    assert!(denied.retry_after_seconds.is_some());

    t.engine.check_rate_limit(&sub).await;

    let snapshot = t.counter.snapshot(&sub, &PeriodKey::current()).await.unwrap();
    assert_eq!(snapshot.rate_limit_hit_count, 2);
    assert_eq!(t.notifier.count(NotificationKind::RateLimited), 1);
}

#[tokio::test]
async fn rate_limit_fails_open_when_counters_are_down() {
    let t = setup();
    t.counter.set_offline(true);

    let result = t.engine.check_rate_limit(&SubscriberId::from("u1")).await;
    assert!(result.allowed);
}

#[tokio::test]
async fn unknown_overage_type_is_rejected() {
    assert!("bandwidth".parse::<OverageType>().is_err());
}
