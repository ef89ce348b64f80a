//! Worker configuration

use anyhow::Context;

/// Connection strings and job schedules for the worker binary.
///
/// Schedules use the six-field cron syntax (seconds first).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub redis_url: String,
    pub sync_schedule: String,
    pub grace_schedule: String,
    pub audit_purge_schedule: String,
    pub replay_schedule: String,
    /// Failed webhooks retried per replay run
    pub replay_batch_size: i64,
    /// Deliveries at or past this many attempts are left for manual replay
    pub replay_max_attempts: i32,
    /// Emit JSON log lines instead of the human-readable format
    pub json_logs: bool,
}

impl WorkerConfig {
    /// Create config from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL not set")?,
            redis_url: std::env::var("REDIS_URL").context("REDIS_URL not set")?,
            sync_schedule: schedule("SYNC_SCHEDULE", "0 */5 * * * *"),
            grace_schedule: schedule("GRACE_ENFORCEMENT_SCHEDULE", "0 0 * * * *"),
            audit_purge_schedule: schedule("WEBHOOK_PURGE_SCHEDULE", "0 30 3 * * *"),
            replay_schedule: schedule("WEBHOOK_REPLAY_SCHEDULE", "0 */15 * * * *"),
            replay_batch_size: std::env::var("WEBHOOK_REPLAY_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            replay_max_attempts: std::env::var("WEBHOOK_REPLAY_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            json_logs: std::env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }
}

fn schedule(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}
