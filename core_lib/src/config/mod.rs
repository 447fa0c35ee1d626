pub mod settings;

pub use settings::{AppConfig, CleanupConfig, LimitsConfig, ServerConfig, StorageConfig, StorageProviderKind};
