//! Inactivity sweep run by the scheduler

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{error, info, warn};

use crate::storage::{StorageProvider, SweepReport};

/// Read on every run so the threshold can be changed without a restart.
pub const INACTIVITY_ENV_VAR: &str = "FILE_CLEANUP_INACTIVITY_MINUTES";

#[derive(Clone)]
pub struct CleanupJob {
    storage: Arc<dyn StorageProvider>,
    default_minutes: u64,
}

impl CleanupJob {
    pub fn new(storage: Arc<dyn StorageProvider>, default_minutes: u64) -> Self {
        Self {
            storage,
            default_minutes,
        }
    }

    pub fn inactivity_threshold(&self) -> Duration {
        let minutes = resolve_minutes(std::env::var(INACTIVITY_ENV_VAR).ok(), self.default_minutes);
        Duration::milliseconds(minutes.saturating_mul(60_000).min(i64::MAX as u64) as i64)
    }

    /// One sweep pass. Failures are logged and never propagate to the scheduler.
    pub async fn run(&self) -> Option<SweepReport> {
        let threshold = self.inactivity_threshold();
        info!(
            backend = self.storage.name(),
            threshold_minutes = threshold.num_minutes(),
            "Running scheduled cleanup"
        );

        match self.storage.sweep(threshold, Utc::now()).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!("Scheduled cleanup failed: {}", e);
                None
            }
        }
    }
}

fn resolve_minutes(raw: Option<String>, default_minutes: u64) -> u64 {
    match raw {
        None => default_minutes,
        Some(value) => match value.trim().parse::<u64>() {
            Ok(minutes) => minutes,
            Err(_) => {
                warn!(value = %value, "Ignoring invalid {}", INACTIVITY_ENV_VAR);
                default_minutes
            }
        },
    }
}
