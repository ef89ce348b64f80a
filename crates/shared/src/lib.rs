//! Meterflow Shared Types and Utilities
//!
//! Types, errors, and database helpers shared between the metering engine
//! and the worker binary.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
