//! Scheduled maintenance jobs
//!
//! Each job logs its own failures and never panics, so a bad run leaves the
//! scheduler running and the next tick tries again.

use meterflow_billing::MeteringEngine;
use time::OffsetDateTime;
use tracing::{error, info, warn};

/// Report accrued usage to the billing provider
pub async fn sync_usage(engine: &MeteringEngine) {
    let summary = engine.run_sync(OffsetDateTime::now_utc()).await;
    if summary.failed() > 0 {
        warn!(
            failed = summary.failed(),
            reported = summary.reported(),
            "Usage sync finished with failures"
        );
    }
}

/// Suspend subscribers whose payment grace period ran out
pub async fn enforce_grace_periods(engine: &MeteringEngine) {
    match engine.enforce_grace_periods(OffsetDateTime::now_utc()).await {
        Ok(0) => {}
        Ok(suspended) => info!(suspended, "Suspended subscribers with expired grace periods"),
        Err(e) => error!(error = %e, "Failed to enforce grace periods"),
    }
}

/// Drop webhook audit rows past the retention window
pub async fn purge_webhook_audit(engine: &MeteringEngine) {
    if let Err(e) = engine.purge_webhook_audit(OffsetDateTime::now_utc()).await {
        error!(error = %e, "Failed to cleanup old webhook audit rows");
    }
}

/// Re-run failed webhook events from their stored payloads
pub async fn replay_failed_webhooks(engine: &MeteringEngine, batch_size: i64, max_attempts: i32) {
    let failed = match engine.list_failed_webhooks(batch_size).await {
        Ok(rows) => rows,
        Err(e) => {
            error!(error = %e, "Failed to fetch failed webhooks");
            return;
        }
    };

    if failed.is_empty() {
        return;
    }

    info!(count = failed.len(), "Replaying failed webhooks");

    for record in failed {
        if record.attempts >= max_attempts {
            warn!(
                event_id = %record.event_id,
                attempts = record.attempts,
                "Webhook permanently failed after max retries"
            );
            continue;
        }

        match engine.replay_webhook(&record.event_id).await {
            Ok(result) => info!(
                event_id = %record.event_id,
                event_type = %result.event_type,
                "Webhook replayed successfully"
            ),
            Err(e) if e.is_retryable() => warn!(
                event_id = %record.event_id,
                error = %e,
                "Webhook replay failed, will retry"
            ),
            Err(e) => error!(
                event_id = %record.event_id,
                error = %e,
                "Webhook replay failed permanently"
            ),
        }
    }
}
