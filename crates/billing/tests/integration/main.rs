//! Integration tests for the metering engine
//!
//! Run against the in-memory counter and ledger stores and a recording
//! billing provider, so they need no external services.
//!
//! ## Running Tests
//! ```bash
//! cargo test -p meterflow-billing --test integration
//! ```

#![allow(clippy::unwrap_used)]

mod common;
mod ingest;
mod limits;
mod sync;
mod webhooks;
