//! Usage ingest
//!
//! The hot path: one atomic counter write per metered request. Everything
//! that can wait (timeline entries, threshold checks, warnings) goes onto a
//! bounded queue drained by a background task. Ingest never fails the
//! request it meters; counter errors are logged and swallowed, and a full
//! queue drops the follow-up work.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use meterflow_shared::{PeriodKey, SubscriberId};
use time::OffsetDateTime;
use tokio::sync::{mpsc, Notify};

use crate::counter::{counter_ttl, minute_bucket, CounterStore, TimelineEntry, UsageIncrement};
use crate::overage::OverageService;

const UNKNOWN_ENDPOINT: &str = "unknown";

/// Follow-up work for one recorded request
#[derive(Debug)]
struct IngestJob {
    subscriber: SubscriberId,
    period: PeriodKey,
    requests_used: u64,
    entry: TimelineEntry,
}

#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

impl Pending {
    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Records usage into the counter store
#[derive(Clone)]
pub struct UsageIngest {
    counter: Arc<dyn CounterStore>,
    queue: mpsc::Sender<IngestJob>,
    pending: Arc<Pending>,
}

impl UsageIngest {
    /// Start the ingest service and its background worker. Must be called
    /// inside a Tokio runtime.
    pub fn start(
        counter: Arc<dyn CounterStore>,
        overage: OverageService,
        timeline_max_len: usize,
        queue_capacity: usize,
    ) -> Self {
        let (queue, rx) = mpsc::channel(queue_capacity.max(1));
        let pending = Arc::new(Pending::default());

        tokio::spawn(run_worker(
            rx,
            counter.clone(),
            overage,
            timeline_max_len,
            pending.clone(),
        ));

        Self {
            counter,
            queue,
            pending,
        }
    }

    /// Record one metered request. Returns the subscriber's new request
    /// total for the period, or `None` when the counter store was unavailable.
    pub async fn record_usage(
        &self,
        subscriber: &SubscriberId,
        endpoint: &str,
        compute_units: u64,
        request_bytes: u64,
        response_bytes: u64,
    ) -> Option<u64> {
        let now = OffsetDateTime::now_utc();
        let period = PeriodKey::containing(now);
        let endpoint = match endpoint.trim() {
            "" => UNKNOWN_ENDPOINT,
            trimmed => trimmed,
        };
        let increment = UsageIncrement {
            endpoint: endpoint.to_string(),
            compute_units,
            bandwidth_bytes: request_bytes.saturating_add(response_bytes),
        };

        let requests_used = match self
            .counter
            .increment_usage(subscriber, &period, &increment, counter_ttl(&period))
            .await
        {
            Ok(total) => total,
            Err(e) => {
                tracing::warn!(
                    subscriber_id = %subscriber,
                    endpoint = %endpoint,
                    error = %e,
                    "Failed to record usage - non-fatal"
                );
                return None;
            }
        };

        if let Err(e) = self
            .counter
            .increment_rate_bucket(subscriber, minute_bucket(now))
            .await
        {
            tracing::debug!(subscriber_id = %subscriber, error = %e, "Failed to bump rate bucket");
        }

        self.enqueue(IngestJob {
            subscriber: subscriber.clone(),
            period,
            requests_used,
            entry: TimelineEntry {
                at: now,
                endpoint: increment.endpoint,
                compute_units,
                bandwidth_bytes: increment.bandwidth_bytes,
            },
        });

        Some(requests_used)
    }

    fn enqueue(&self, job: IngestJob) {
        self.pending.count.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.queue.try_send(job) {
            let subscriber = match &e {
                mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => {
                    job.subscriber.clone()
                }
            };
            tracing::warn!(
                subscriber_id = %subscriber,
                error = %e,
                "Usage follow-up queue unavailable, dropping threshold check"
            );
            self.pending.finish();
        }
    }

    /// Wait until every queued follow-up job has been processed
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.pending.idle.notified();
            if self.pending.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<IngestJob>,
    counter: Arc<dyn CounterStore>,
    overage: OverageService,
    timeline_max_len: usize,
    pending: Arc<Pending>,
) {
    while let Some(job) = rx.recv().await {
        if timeline_max_len > 0 {
            if let Err(e) = counter
                .append_timeline(&job.subscriber, &job.entry, timeline_max_len)
                .await
            {
                tracing::debug!(subscriber_id = %job.subscriber, error = %e, "Failed to append usage timeline");
            }
        }

        if let Err(e) = overage
            .on_usage(&job.subscriber, job.requests_used, &job.period)
            .await
        {
            tracing::warn!(
                subscriber_id = %job.subscriber,
                error = %e,
                "Usage threshold check failed"
            );
        }

        pending.finish();
    }

    tracing::debug!("Usage ingest worker stopped");
}
