//! Database utilities and connection management

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::{str::FromStr, time::Duration};

/// Pool sizing for the ledger database
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolSettings {
    /// Read `DATABASE_MAX_CONNECTIONS` and `DATABASE_ACQUIRE_TIMEOUT_SECS`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            acquire_timeout: std::env::var("DATABASE_ACQUIRE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.acquire_timeout),
        }
    }
}

/// Create a database connection pool
/// Note: Disables statement cache for PgBouncer compatibility
pub async fn create_pool(database_url: &str, settings: &PoolSettings) -> Result<PgPool, sqlx::Error> {
    // PgBouncer in transaction mode doesn't support prepared statements
    let options = PgConnectOptions::from_str(database_url)?.statement_cache_capacity(0);

    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(0)
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(Duration::from_secs(60))
        .max_lifetime(Duration::from_secs(300))
        .connect_with(options)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_settings_default() {
        let settings = PoolSettings::default();
        assert_eq!(settings.max_connections, 5);
        assert_eq!(settings.acquire_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_create_pool() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = create_pool(&url, &PoolSettings::default())
            .await
            .expect("Failed to create pool");
        run_migrations(&pool).await.expect("Failed to run migrations");
    }
}
