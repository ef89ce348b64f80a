//! Error types shared across Meterflow crates

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SharedError {
    #[error("Invalid period key: {0}")]
    InvalidPeriodKey(String),

    #[error("Invalid plan tier: {0}")]
    InvalidTier(String),

    #[error("Invalid subscription status: {0}")]
    InvalidStatus(String),

    #[error("Invalid subscriber id: {0}")]
    InvalidSubscriberId(String),
}
