use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use super::cleanup::CleanupJob;
use crate::error::{AppError, Result};

/// Cron-driven runner for [`CleanupJob`]. Nothing runs until [`start`] and
/// the owner is expected to call [`shutdown`] when the server stops.
///
/// [`start`]: CleanupScheduler::start
/// [`shutdown`]: CleanupScheduler::shutdown
pub struct CleanupScheduler {
    scheduler: JobScheduler,
    job_id: Uuid,
    expression: String,
}

impl CleanupScheduler {
    pub async fn new(cron: &str, job: CleanupJob) -> Result<Self> {
        let expression = normalize_cron(cron)?;

        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| AppError::Configuration(format!("Failed to create scheduler: {}", e)))?;

        let cron_job = Job::new_async(expression.as_str(), move |_id, _scheduler| {
            let job = job.clone();
            Box::pin(async move {
                job.run().await;
            })
        })
        .map_err(|e| AppError::Configuration(format!("Invalid cleanup cron '{}': {}", cron, e)))?;

        let job_id = scheduler
            .add(cron_job)
            .await
            .map_err(|e| AppError::Configuration(format!("Failed to register cleanup job: {}", e)))?;

        Ok(Self {
            scheduler,
            job_id,
            expression,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler
            .start()
            .await
            .map_err(|e| AppError::Other(anyhow::anyhow!("Failed to start scheduler: {}", e)))?;
        info!(cron = %self.expression, job = %self.job_id, "Cleanup scheduler started");
        Ok(())
    }

    pub async fn shutdown(mut self) {
        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Cleanup scheduler did not shut down cleanly: {}", e);
        } else {
            info!("Cleanup scheduler stopped");
        }
    }
}

/// Accepts classic five-field cron (minute first) by pinning seconds to 0.
/// Six and seven field expressions pass through unchanged.
pub fn normalize_cron(expression: &str) -> Result<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 | 7 => Ok(fields.join(" ")),
        _ => Err(AppError::Configuration(format!(
            "Invalid cleanup cron '{}': expected 5 to 7 fields",
            expression
        ))),
    }
}
