//! Per-client daily traffic accounting.

pub mod client;
pub mod tracker;

pub use client::{client_identifier, UNKNOWN_CLIENT};
pub use tracker::{utc_day, QuotaRejection, UsageTracker};
