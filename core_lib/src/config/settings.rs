use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variables honoured for compatibility with existing deployments,
/// mapped onto their config keys. They take precedence over `APP_*` variables.
const LEGACY_ENV_KEYS: &[(&str, &str)] = &[
    ("PORT", "server.port"),
    ("ROOT_FOLDER", "storage.root_folder"),
    ("PROVIDER", "storage.provider"),
    ("CONFIG", "storage.cloud_config_path"),
    ("DAILY_UPLOAD_LIMIT_BYTES", "limits.daily_upload_bytes"),
    ("DAILY_DOWNLOAD_LIMIT_BYTES", "limits.daily_download_bytes"),
    ("FILE_CLEANUP_CRON", "cleanup.cron"),
    ("FILE_CLEANUP_INACTIVITY_MINUTES", "cleanup.inactivity_minutes"),
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub limits: LimitsConfig,
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_seconds: u64,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProviderKind {
    Local,
    Google,
}

impl std::fmt::Display for StorageProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageProviderKind::Local => write!(f, "local"),
            StorageProviderKind::Google => write!(f, "google"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub provider: StorageProviderKind,
    pub root_folder: PathBuf,
    /// JSON file with `bucket_name` and `gcp_key_file_path`, required for `google`.
    pub cloud_config_path: Option<PathBuf>,
    /// Where multipart uploads are spooled before being handed to the provider.
    pub staging_dir: PathBuf,
    pub operation_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub daily_upload_bytes: u64,
    pub daily_download_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    pub cron: String,
    pub inactivity_minutes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            shutdown_timeout_seconds: 10,
            max_upload_bytes: 100 * 1024 * 1024,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: StorageProviderKind::Local,
            root_folder: PathBuf::from("./uploads"),
            cloud_config_path: None,
            staging_dir: PathBuf::from("./temp"),
            operation_timeout_seconds: 30,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            daily_upload_bytes: 2_081_228,
            daily_download_bytes: 2_081_052,
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            cron: "* * * * *".to_string(),
            inactivity_minutes: 2,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?);

        if std::path::Path::new("config.toml").exists() {
            builder = builder.add_source(File::with_name("config"));
        }

        builder = builder.add_source(
            Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        for (key, value) in legacy_overrides(|name| std::env::var(name).ok()) {
            builder = builder.set_override(key, value)?;
        }

        let config = builder.build()?;
        let app_config: AppConfig = config.try_deserialize()?;

        app_config.validate()?;

        Ok(app_config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Message("Server port cannot be 0".to_string()));
        }

        if self.server.max_upload_bytes == 0 {
            return Err(ConfigError::Message(
                "Max upload size must be greater than 0".to_string(),
            ));
        }

        if self.storage.root_folder.as_os_str().is_empty() {
            return Err(ConfigError::Message(
                "Storage root folder cannot be empty".to_string(),
            ));
        }

        if self.storage.provider == StorageProviderKind::Google
            && self.storage.cloud_config_path.is_none()
        {
            return Err(ConfigError::Message(
                "CONFIG path is required for the google storage provider".to_string(),
            ));
        }

        if self.storage.operation_timeout_seconds == 0 {
            return Err(ConfigError::Message(
                "Storage operation timeout must be greater than 0".to_string(),
            ));
        }

        if self.limits.daily_upload_bytes == 0 || self.limits.daily_download_bytes == 0 {
            return Err(ConfigError::Message(
                "Daily traffic limits must be greater than 0".to_string(),
            ));
        }

        if self.cleanup.cron.trim().is_empty() {
            return Err(ConfigError::Message(
                "Cleanup cron expression cannot be empty".to_string(),
            ));
        }

        if self.cleanup.inactivity_minutes == 0 {
            return Err(ConfigError::Message(
                "Cleanup inactivity period must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn create_directories(&self) -> Result<(), std::io::Error> {
        if self.storage.provider == StorageProviderKind::Local {
            std::fs::create_dir_all(&self.storage.root_folder)?;
        }
        std::fs::create_dir_all(&self.storage.staging_dir)?;
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn legacy_overrides<F>(lookup: F) -> Vec<(&'static str, String)>
where
    F: Fn(&str) -> Option<String>,
{
    LEGACY_ENV_KEYS
        .iter()
        .filter_map(|(name, key)| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .map(|value| (*key, value))
        })
        .collect()
}
