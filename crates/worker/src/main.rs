//! Meterflow worker
//!
//! Wires the Redis counter store, the Postgres ledger and the Stripe client
//! into a metering engine, then runs the periodic billing jobs.

mod config;
mod jobs;

use std::sync::Arc;

use anyhow::Context;
use meterflow_billing::notify::{HttpNotifier, LogNotifier, Notifier, NotifierConfig};
use meterflow_billing::{
    CoinbaseConfig, CoinbaseVerifier, EngineConfig, MeteringEngine, PgLedgerStore, PricingTable,
    ProviderKind, RedisCounterStore, StripeClient, StripeVerifier,
};
use meterflow_shared::{create_pool, run_migrations, PoolSettings};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env()?;
    init_tracing(config.json_logs);

    let pool = create_pool(&config.database_url, &PoolSettings::from_env())
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool).await.context("Failed to run migrations")?;

    let counter = RedisCounterStore::connect(&config.redis_url).await?;
    let ledger = PgLedgerStore::new(pool);
    let stripe = StripeClient::from_env()?;

    let notifier_config = NotifierConfig::from_env();
    let notifier: Arc<dyn Notifier> = if notifier_config.is_enabled() {
        Arc::new(HttpNotifier::new(notifier_config))
    } else {
        tracing::info!("Notification endpoint not configured, logging notifications only");
        Arc::new(LogNotifier)
    };

    let stripe_config = stripe.config().clone();
    let mut builder = MeteringEngine::builder(Arc::new(counter), Arc::new(ledger), Arc::new(stripe))
        .notifier(notifier)
        .config(EngineConfig::from_env())
        .pricing(PricingTable::from_env()?)
        .verifier(
            ProviderKind::Stripe,
            Arc::new(StripeVerifier::new(
                stripe_config.webhook_secret,
                stripe_config.webhook_tolerance_secs,
            )),
        );
    if let Some(coinbase) = CoinbaseConfig::from_env() {
        builder = builder.verifier(ProviderKind::Coinbase, Arc::new(CoinbaseVerifier::new(coinbase)));
    }
    let engine = Arc::new(builder.build());

    let mut scheduler = JobScheduler::new().await?;

    let sync_engine = engine.clone();
    scheduler
        .add(Job::new_async(config.sync_schedule.as_str(), move |_id, _lock| {
            let engine = sync_engine.clone();
            Box::pin(async move { jobs::sync_usage(&engine).await })
        })?)
        .await?;

    let grace_engine = engine.clone();
    scheduler
        .add(Job::new_async(config.grace_schedule.as_str(), move |_id, _lock| {
            let engine = grace_engine.clone();
            Box::pin(async move { jobs::enforce_grace_periods(&engine).await })
        })?)
        .await?;

    let purge_engine = engine.clone();
    scheduler
        .add(Job::new_async(config.audit_purge_schedule.as_str(), move |_id, _lock| {
            let engine = purge_engine.clone();
            Box::pin(async move { jobs::purge_webhook_audit(&engine).await })
        })?)
        .await?;

    let replay_engine = engine.clone();
    let (batch_size, max_attempts) = (config.replay_batch_size, config.replay_max_attempts);
    scheduler
        .add(Job::new_async(config.replay_schedule.as_str(), move |_id, _lock| {
            let engine = replay_engine.clone();
            Box::pin(async move {
                jobs::replay_failed_webhooks(&engine, batch_size, max_attempts).await
            })
        })?)
        .await?;

    scheduler.start().await?;
    tracing::info!(
        sync = %config.sync_schedule,
        grace = %config.grace_schedule,
        purge = %config.audit_purge_schedule,
        replay = %config.replay_schedule,
        "Meterflow worker started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;
    engine.wait_idle().await;

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,meterflow=debug"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
