pub mod cleanup;
pub mod scheduler;

pub use cleanup::{CleanupJob, INACTIVITY_ENV_VAR};
pub use scheduler::{normalize_cron, CleanupScheduler};
