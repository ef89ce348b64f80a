//! Webhook intake
//!
//! Each delivery moves through
//! `Received -> SignatureVerified -> DedupChecked -> Locked -> Handled -> Complete`,
//! with `Failed` reachable from any step. Signatures are checked before the
//! payload is parsed, duplicates short-circuit with success, and the audit
//! row is written before any handler side effect. A handler failure is
//! recorded and surfaced so the provider redelivers.

mod event;
mod handlers;
mod verify;

pub use event::{
    CheckoutEvent, PaymentEvent, PaymentMethodEvent, ProviderKind, SubscriptionEvent, WebhookEvent,
    WebhookEventKind,
};
pub use handlers::HandlerOutcome;
pub(crate) use handlers::WebhookHandlers;
pub use verify::{
    sign_stripe_payload, CoinbaseConfig, CoinbaseVerifier, StripeVerifier, WebhookVerifier,
};

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::config::EngineConfig;
use crate::counter::{keys, CounterStore};
use crate::error::{BillingError, BillingResult};
use crate::ledger::{LedgerStore, WebhookAdmission, WebhookEventRecord, WebhookOutcome};
use crate::lock::DistributedLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    Received,
    SignatureVerified,
    DedupChecked,
    Locked,
    Handled,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessingResult {
    pub success: bool,
    /// The event had already been processed; nothing was done
    pub duplicate: bool,
    pub event_id: String,
    pub event_type: String,
    pub actions_taken: Vec<String>,
    pub state: ProcessingState,
}

impl ProcessingResult {
    fn duplicate(event: &WebhookEvent) -> Self {
        Self {
            success: true,
            duplicate: true,
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            actions_taken: vec!["duplicate".to_string()],
            state: ProcessingState::Complete,
        }
    }
}

fn trace_state(event_id: &str, state: ProcessingState) {
    tracing::trace!(event_id = %event_id, state = ?state, "Webhook state");
}

pub struct WebhookEngine {
    counter: Arc<dyn CounterStore>,
    ledger: Arc<dyn LedgerStore>,
    verifiers: HashMap<ProviderKind, Arc<dyn WebhookVerifier>>,
    handlers: WebhookHandlers,
    config: Arc<EngineConfig>,
}

impl WebhookEngine {
    pub(crate) fn new(
        counter: Arc<dyn CounterStore>,
        ledger: Arc<dyn LedgerStore>,
        verifiers: HashMap<ProviderKind, Arc<dyn WebhookVerifier>>,
        handlers: WebhookHandlers,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            counter,
            ledger,
            verifiers,
            handlers,
            config,
        }
    }

    /// Verify, decode and apply one delivery
    pub async fn process(
        &self,
        raw_payload: &[u8],
        signature_header: &str,
        declared_provider: &str,
    ) -> BillingResult<ProcessingResult> {
        let provider: ProviderKind = declared_provider.parse().map_err(|e| {
            tracing::warn!(
                target: "meterflow::security",
                declared_provider = %declared_provider,
                "Webhook from unknown provider rejected"
            );
            e
        })?;

        let Some(verifier) = self.verifiers.get(&provider) else {
            tracing::warn!(
                target: "meterflow::security",
                provider = %provider,
                "Webhook for unconfigured provider rejected"
            );
            return Err(BillingError::ProviderNotConfigured(provider.to_string()));
        };

        verifier.verify(raw_payload, signature_header, OffsetDateTime::now_utc())?;

        let payload: serde_json::Value = serde_json::from_slice(raw_payload)
            .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;
        let event = WebhookEvent::decode(provider, &payload)?;
        trace_state(&event.id, ProcessingState::SignatureVerified);

        self.run(event, &payload).await
    }

    /// Re-run a stored event from its audit payload. The payload was verified
    /// when it was first received.
    pub async fn replay(&self, event_id: &str) -> BillingResult<ProcessingResult> {
        let record = self
            .ledger
            .webhook_event(event_id)
            .await?
            .ok_or_else(|| BillingError::WebhookEventNotFound(event_id.to_string()))?;

        let provider: ProviderKind = record.provider.parse()?;
        let event = WebhookEvent::decode(provider, &record.payload)?;

        tracing::info!(event_id = %event_id, attempts = record.attempts, "Replaying webhook event");
        self.run(event, &record.payload).await
    }

    pub async fn list_failed(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        self.ledger.failed_webhooks(limit).await
    }

    /// Delete audit rows older than the retention window
    pub async fn purge_audit(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let before = now - self.config.webhook_retention;
        let deleted = self.ledger.purge_webhook_events(before).await?;
        tracing::info!(
            deleted = deleted,
            retention_days = self.config.webhook_retention.whole_days(),
            "Cleaned up old webhook audit rows"
        );
        Ok(deleted)
    }

    async fn already_processed(&self, event_id: &str) -> BillingResult<bool> {
        match self.counter.exists(&keys::webhook_done(event_id)).await {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(event_id = %event_id, error = %e, "Hot dedup check failed, falling back to ledger");
            }
        }

        Ok(self
            .ledger
            .webhook_event(event_id)
            .await?
            .map(|record| record.outcome.is_final())
            .unwrap_or(false))
    }

    async fn run(&self, event: WebhookEvent, payload: &serde_json::Value) -> BillingResult<ProcessingResult> {
        if self.already_processed(&event.id).await? {
            tracing::info!(event_id = %event.id, event_type = %event.event_type, "Duplicate webhook event");
            return Ok(ProcessingResult::duplicate(&event));
        }
        trace_state(&event.id, ProcessingState::DedupChecked);

        let Some(lock) = DistributedLock::acquire(
            self.counter.clone(),
            keys::webhook_lock(&event.id),
            self.config.webhook_lock_ttl,
        )
        .await?
        else {
            tracing::info!(event_id = %event.id, "Webhook event already being processed");
            return Err(BillingError::WebhookInFlight(event.id));
        };
        trace_state(&event.id, ProcessingState::Locked);

        let admission = match self
            .ledger
            .record_webhook_received(&event.id, event.provider.as_str(), &event.event_type, payload)
            .await
        {
            Ok(admission) => admission,
            Err(e) => {
                lock.release().await?;
                return Err(e);
            }
        };

        match admission {
            WebhookAdmission::AlreadyProcessed => {
                lock.release().await?;
                tracing::info!(event_id = %event.id, "Webhook event completed concurrently");
                return Ok(ProcessingResult::duplicate(&event));
            }
            WebhookAdmission::Retry { attempt } => {
                tracing::info!(event_id = %event.id, attempt = attempt, "Retrying webhook event");
            }
            WebhookAdmission::New => {}
        }

        match self.handlers.handle(&event).await {
            Ok(outcome) => {
                trace_state(&event.id, ProcessingState::Handled);
                let completed = self
                    .ledger
                    .complete_webhook(&event.id, outcome.outcome, None)
                    .await;
                if let Err(e) = completed {
                    lock.release().await?;
                    return Err(e);
                }

                if let Err(e) = self
                    .counter
                    .set_if_absent(&keys::webhook_done(&event.id), self.config.webhook_dedup_ttl)
                    .await
                {
                    tracing::warn!(event_id = %event.id, error = %e, "Failed to set webhook dedup marker");
                }
                lock.release().await?;

                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    outcome = ?outcome.outcome,
                    actions = ?outcome.actions,
                    "Webhook processed"
                );
                trace_state(&event.id, ProcessingState::Complete);

                Ok(ProcessingResult {
                    success: true,
                    duplicate: false,
                    event_id: event.id,
                    event_type: event.event_type,
                    actions_taken: outcome.actions,
                    state: ProcessingState::Complete,
                })
            }
            Err(e) => {
                trace_state(&event.id, ProcessingState::Failed);
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook handler failed"
                );
                if let Err(record_err) = self
                    .ledger
                    .complete_webhook(&event.id, WebhookOutcome::Failed, Some(&e.to_string()))
                    .await
                {
                    tracing::error!(
                        event_id = %event.id,
                        error = %record_err,
                        "Failed to record webhook failure"
                    );
                }
                if let Err(release_err) = lock.release().await {
                    tracing::warn!(event_id = %event.id, error = %release_err, "Failed to release webhook lock");
                }
                Err(e)
            }
        }
    }
}
