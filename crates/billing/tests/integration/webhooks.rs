use meterflow_billing::counter::keys;
use meterflow_billing::ledger::{LedgerStore, PaymentStatus, WebhookOutcome};
use meterflow_billing::{BillingError, CounterStore, NotificationKind};
use meterflow_shared::{PlanTier, SubscriberId, SubscriptionStatus};
use std::time::Duration;
use time::OffsetDateTime;

use crate::common::{
    invoice_object, setup, stripe_event, subscription_object, PRICE_PRO,
};

fn payment_failed_evt_1() -> serde_json::Value {
    stripe_event(
        "evt_1",
        "invoice.payment_failed",
        1_760_000_000,
        invoice_object("in_1", "cus_1", Some("sub_1"), 4900),
    )
}

#[tokio::test]
async fn payment_failed_records_history_and_grace_period_once() {
    let t = setup();
    let u1 = SubscriberId::from("u1");
    t.ledger.link_customer("cus_1", &u1).await.unwrap();

    let result = t.deliver(&payment_failed_evt_1()).await.unwrap();
    assert!(result.success);
    assert!(!result.duplicate);
    assert!(result
        .actions_taken
        .contains(&"payment_failure_recorded".to_string()));

    let payments = t.ledger.payments(&u1).await.unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Failed);
    assert_eq!(payments[0].amount_cents, 4900);
    assert!(payments[0].failure_reason.is_some());

    let grace = t.ledger.active_grace_period(&u1).await.unwrap().unwrap();
    assert_eq!(grace.ends_at - grace.started_at, time::Duration::days(3));

    // Redelivery is a duplicate and changes nothing
    let again = t.deliver(&payment_failed_evt_1()).await.unwrap();
    assert!(again.success);
    assert!(again.duplicate);
    assert_eq!(t.ledger.payments(&u1).await.unwrap(), payments);
    assert_eq!(
        t.ledger.active_grace_period(&u1).await.unwrap().unwrap().id,
        grace.id
    );
    assert_eq!(t.notifier.count(NotificationKind::PaymentFailed), 1);
}

#[tokio::test]
async fn minimal_payment_failed_payload_is_accepted() {
    let t = setup();
    let u1 = SubscriberId::from("u1");
    t.ledger.link_customer("cus_1", &u1).await.unwrap();

    let payload = serde_json::json!({
        "id": "evt_1",
        "type": "invoice.payment_failed",
        "data": { "object": { "customer": "cus_1", "amount_due": 4900 } }
    });
    let result = t.deliver(&payload).await.unwrap();
    assert!(result.success);
    assert!(result
        .actions_taken
        .contains(&"payment_failure_recorded".to_string()));

    let payments = t.ledger.payments(&u1).await.unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Failed);
    assert_eq!(payments[0].amount_cents, 4900);
    assert_eq!(payments[0].provider_reference, "evt_1");

    let grace = t.ledger.active_grace_period(&u1).await.unwrap().unwrap();
    assert_eq!(grace.ends_at - grace.started_at, time::Duration::days(3));
}

#[tokio::test]
async fn failed_then_paid_invoice_keeps_both_history_rows() {
    let t = setup();
    let u1 = SubscriberId::from("u1");
    t.ledger.link_customer("cus_1", &u1).await.unwrap();

    t.deliver(&payment_failed_evt_1()).await.unwrap();
    let retry_failed = stripe_event(
        "evt_2",
        "invoice.payment_failed",
        1_760_000_100,
        invoice_object("in_1", "cus_1", Some("sub_1"), 4900),
    );
    t.deliver(&retry_failed).await.unwrap();

    let paid = stripe_event(
        "evt_3",
        "invoice.paid",
        1_760_000_200,
        invoice_object("in_1", "cus_1", Some("sub_1"), 4900),
    );
    let result = t.deliver(&paid).await.unwrap();
    assert!(result.actions_taken.contains(&"payment_recorded".to_string()));
    assert!(result
        .actions_taken
        .contains(&"grace_period_cleared".to_string()));

    let payments = t.ledger.payments(&u1).await.unwrap();
    assert_eq!(payments.len(), 3);
    assert!(payments.iter().all(|p| p.provider_reference == "in_1"));
    let failed = payments
        .iter()
        .filter(|p| p.status == PaymentStatus::Failed)
        .count();
    assert_eq!(failed, 2);
    assert!(payments.iter().any(|p| p.status == PaymentStatus::Succeeded));
    assert!(t.ledger.active_grace_period(&u1).await.unwrap().is_none());
}

#[tokio::test]
async fn ledger_dedup_holds_without_the_hot_marker() {
    let t = setup();
    let u1 = SubscriberId::from("u1");
    t.ledger.link_customer("cus_1", &u1).await.unwrap();

    t.deliver(&payment_failed_evt_1()).await.unwrap();
    t.counter.invalidate(&keys::webhook_done("evt_1")).await.unwrap();

    let again = t.deliver(&payment_failed_evt_1()).await.unwrap();
    assert!(again.duplicate);
    assert_eq!(t.ledger.payments(&u1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn forged_signature_is_rejected_before_anything_is_recorded() {
    let t = setup();
    let raw = serde_json::to_vec(&payment_failed_evt_1()).unwrap();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let forged = meterflow_billing::webhooks::sign_stripe_payload("whsec_wrong", &raw, now);

    let err = t
        .engine
        .process_webhook(&raw, &forged, "stripe")
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    assert_eq!(err.status_code(), 400);
    assert!(t.ledger.webhook_event("evt_1").await.unwrap().is_none());
}

#[tokio::test]
async fn unconfigured_provider_is_rejected() {
    let t = setup();
    let err = t
        .engine
        .process_webhook(b"{}", "deadbeef", "coinbase")
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::ProviderNotConfigured(_)));

    let err = t
        .engine
        .process_webhook(b"{}", "deadbeef", "paypal")
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::ProviderNotConfigured(_)));
}

#[tokio::test]
async fn unknown_event_type_is_acknowledged() {
    let t = setup();
    let event = stripe_event(
        "evt_unknown",
        "customer.tax_id.created",
        1_760_000_000,
        serde_json::json!({ "id": "txi_1" }),
    );

    let result = t.deliver(&event).await.unwrap();
    assert!(result.success);
    assert_eq!(result.actions_taken, vec!["unhandled_event_type".to_string()]);

    let record = t.ledger.webhook_event("evt_unknown").await.unwrap().unwrap();
    assert_eq!(record.outcome, WebhookOutcome::Ignored);
}

#[tokio::test]
async fn payment_for_unknown_subscriber_is_ignored() {
    let t = setup();
    let event = stripe_event(
        "evt_orphan",
        "invoice.paid",
        1_760_000_000,
        invoice_object("in_9", "cus_nobody", None, 1000),
    );

    let result = t.deliver(&event).await.unwrap();
    assert!(result.success);
    assert_eq!(result.actions_taken, vec!["subscriber_not_found".to_string()]);
    let record = t.ledger.webhook_event("evt_orphan").await.unwrap().unwrap();
    assert_eq!(record.outcome, WebhookOutcome::Ignored);
}

#[tokio::test]
async fn subscription_update_sets_tier_and_links_customer() {
    let t = setup();
    let event = stripe_event(
        "evt_sub",
        "customer.subscription.created",
        1_760_000_000,
        subscription_object("sub_1", "cus_1", "active", PRICE_PRO, Some("u1")),
    );

    t.deliver(&event).await.unwrap();

    let u1 = SubscriberId::from("u1");
    let record = t.ledger.subscription(&u1).await.unwrap().unwrap();
    assert_eq!(record.plan_tier, PlanTier::Professional);
    assert_eq!(record.status, SubscriptionStatus::Active);
    assert_eq!(record.metered_request_item.as_deref(), Some("si_requests"));
    assert_eq!(
        t.ledger.subscriber_for_customer("cus_1").await.unwrap(),
        Some(u1.clone())
    );

    let usage = t.engine.get_current_usage(&u1).await.unwrap();
    assert_eq!(usage.limit, Some(100_000));
    assert_eq!(t.notifier.count(NotificationKind::PlanChanged), 1);
}

#[tokio::test]
async fn late_update_does_not_undo_newer_cancellation() {
    let t = setup();
    let u1 = SubscriberId::from("u1");

    let canceled = stripe_event(
        "evt_cancel",
        "customer.subscription.deleted",
        2_000,
        subscription_object("sub_1", "cus_1", "canceled", PRICE_PRO, Some("u1")),
    );
    let updated = stripe_event(
        "evt_update",
        "customer.subscription.updated",
        1_000,
        subscription_object("sub_1", "cus_1", "active", PRICE_PRO, Some("u1")),
    );

    t.deliver(&canceled).await.unwrap();
    let result = t.deliver(&updated).await.unwrap();
    assert!(result.success);
    assert_eq!(result.actions_taken, vec!["stale_update_skipped".to_string()]);

    let record = t.ledger.subscription(&u1).await.unwrap().unwrap();
    assert_eq!(record.status, SubscriptionStatus::Canceled);
    assert_eq!(record.effective_tier(), PlanTier::Free);
}

#[tokio::test]
async fn newer_update_wins_over_earlier_cancellation() {
    let t = setup();
    let u1 = SubscriberId::from("u1");

    let canceled = stripe_event(
        "evt_cancel",
        "customer.subscription.deleted",
        1_000,
        subscription_object("sub_1", "cus_1", "canceled", PRICE_PRO, Some("u1")),
    );
    let updated = stripe_event(
        "evt_update",
        "customer.subscription.updated",
        2_000,
        subscription_object("sub_1", "cus_1", "active", PRICE_PRO, Some("u1")),
    );

    t.deliver(&canceled).await.unwrap();
    t.deliver(&updated).await.unwrap();

    let record = t.ledger.subscription(&u1).await.unwrap().unwrap();
    assert_eq!(record.status, SubscriptionStatus::Active);
    assert_eq!(record.plan_tier, PlanTier::Professional);
}

#[tokio::test]
async fn unpaid_subscription_suspends_service() {
    let t = setup();
    let u1 = SubscriberId::from("u1");

    let unpaid = stripe_event(
        "evt_unpaid",
        "customer.subscription.updated",
        1_000,
        subscription_object("sub_1", "cus_1", "unpaid", PRICE_PRO, Some("u1")),
    );
    t.deliver(&unpaid).await.unwrap();
    assert!(!t.engine.is_service_enabled(&u1).await.unwrap());

    let recovered = stripe_event(
        "evt_recovered",
        "customer.subscription.updated",
        2_000,
        subscription_object("sub_1", "cus_1", "active", PRICE_PRO, Some("u1")),
    );
    t.deliver(&recovered).await.unwrap();
    assert!(t.engine.is_service_enabled(&u1).await.unwrap());
}

#[tokio::test]
async fn expired_grace_suspends_until_payment_succeeds() {
    let t = setup();
    let u1 = SubscriberId::from("u1");
    t.ledger.link_customer("cus_1", &u1).await.unwrap();
    t.deliver(&payment_failed_evt_1()).await.unwrap();

    // Still inside the grace period
    let suspended = t
        .engine
        .enforce_grace_periods(OffsetDateTime::now_utc())
        .await
        .unwrap();
    assert_eq!(suspended, 0);
    assert!(t.engine.is_service_enabled(&u1).await.unwrap());

    let later = OffsetDateTime::now_utc() + time::Duration::days(4);
    assert_eq!(t.engine.enforce_grace_periods(later).await.unwrap(), 1);
    assert!(!t.engine.is_service_enabled(&u1).await.unwrap());
    assert_eq!(t.notifier.count(NotificationKind::ServiceSuspended), 1);

    // Enforced once only
    assert_eq!(t.engine.enforce_grace_periods(later).await.unwrap(), 0);

    let paid = stripe_event(
        "evt_paid",
        "invoice.paid",
        1_760_000_100,
        invoice_object("in_2", "cus_1", Some("sub_1"), 4900),
    );
    let result = t.deliver(&paid).await.unwrap();
    assert!(result.actions_taken.contains(&"service_enabled".to_string()));
    assert!(t.engine.is_service_enabled(&u1).await.unwrap());
    assert!(t.ledger.active_grace_period(&u1).await.unwrap().is_none());
}

#[tokio::test]
async fn checkout_upgrade_applies_on_first_payment() {
    let t = setup();
    let u1 = SubscriberId::from("u1");

    let checkout = stripe_event(
        "evt_checkout",
        "checkout.session.completed",
        1_000,
        serde_json::json!({
            "id": "cs_1",
            "object": "checkout.session",
            "customer": "cus_1",
            "subscription": "sub_9",
            "client_reference_id": "u1",
            "metadata": { "plan_tier": "starter" }
        }),
    );
    let result = t.deliver(&checkout).await.unwrap();
    assert!(result
        .actions_taken
        .contains(&"pending_plan_change:starter".to_string()));
    assert!(t.ledger.pending_plan_change(&u1).await.unwrap().is_some());

    let paid = stripe_event(
        "evt_first_invoice",
        "invoice.paid",
        1_100,
        invoice_object("in_first", "cus_1", Some("sub_9"), 2900),
    );
    t.deliver(&paid).await.unwrap();

    let record = t.ledger.subscription(&u1).await.unwrap().unwrap();
    assert_eq!(record.plan_tier, PlanTier::Starter);
    assert_eq!(record.provider_subscription_id.as_deref(), Some("sub_9"));
    assert!(t.ledger.pending_plan_change(&u1).await.unwrap().is_none());

    let usage = t.engine.get_current_usage(&u1).await.unwrap();
    assert_eq!(usage.limit, Some(10_000));
}

#[tokio::test]
async fn failed_handler_is_recorded_and_replayable() {
    let t = setup();
    let event = stripe_event(
        "evt_retry",
        "invoice.paid",
        1_000,
        invoice_object("in_retry", "cus_7", None, 1500),
    );

    // Customer lookup at the provider fails
    t.provider.set_fail_lookups(true);
    let err = t.deliver(&event).await.unwrap_err();
    assert!(err.is_retryable());

    let failed = t.engine.list_failed_webhooks(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].event_id, "evt_retry");
    assert!(failed[0].error.is_some());

    t.provider.set_fail_lookups(false);
    t.provider.add_customer("cus_7", "u7");
    let result = t.engine.replay_webhook("evt_retry").await.unwrap();
    assert!(result.success);
    assert!(!result.duplicate);

    let payments = t.ledger.payments(&SubscriberId::from("u7")).await.unwrap();
    assert_eq!(payments.len(), 1);
    assert!(t.engine.list_failed_webhooks(10).await.unwrap().is_empty());

    let replay_again = t.engine.replay_webhook("evt_retry").await.unwrap();
    assert!(replay_again.duplicate);
}

#[tokio::test]
async fn replay_of_unknown_event_is_not_found() {
    let t = setup();
    let err = t.engine.replay_webhook("evt_missing").await.unwrap_err();
    assert!(matches!(err, BillingError::WebhookEventNotFound(_)));
}

#[tokio::test]
async fn event_locked_elsewhere_is_in_flight() {
    let t = setup();
    let taken = t
        .counter
        .try_acquire_lock(&keys::webhook_lock("evt_1"), "other-worker", Duration::from_secs(30))
        .await
        .unwrap();
    assert!(taken);

    let err = t.deliver(&payment_failed_evt_1()).await.unwrap_err();
    assert!(matches!(err, BillingError::WebhookInFlight(_)));
    assert_eq!(err.status_code(), 409);
}

#[tokio::test]
async fn audit_rows_are_purged_after_retention() {
    let t = setup();
    t.ledger
        .link_customer("cus_1", &SubscriberId::from("u1"))
        .await
        .unwrap();
    t.deliver(&payment_failed_evt_1()).await.unwrap();

    let now = OffsetDateTime::now_utc();
    assert_eq!(t.engine.purge_webhook_audit(now).await.unwrap(), 0);

    let later = now + time::Duration::days(91);
    assert_eq!(t.engine.purge_webhook_audit(later).await.unwrap(), 1);
    assert!(t.ledger.webhook_event("evt_1").await.unwrap().is_none());
}
