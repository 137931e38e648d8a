//! Configuration management for cloudstripe

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{BackendId, MemoryBackend, ProviderBackend, StorageBackend};
use crate::erasure::ErasureConfig;
use crate::error::{Error, Result};
use crate::health::{DEFAULT_FAILURE_THRESHOLD, DEFAULT_OPEN_COOLDOWN};
use crate::policy::{PolicyConfig, PolicyEngine};

/// Default number of successful replica writes an upload needs
pub const DEFAULT_MIN_REPLICAS: usize = 2;

/// Default number of concurrent backend calls
pub const DEFAULT_WORKER_POOL: usize = 16;

/// Default number of files handled at once by batch operations
pub const DEFAULT_MAX_CONCURRENT_FILES: usize = 4;

/// Default interval between scrub passes (seconds)
pub const DEFAULT_SCRUB_INTERVAL: u64 = 3600;

/// Provider-specific settings of one backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendSettings {
    /// S3 or S3-compatible store
    S3 {
        bucket: String,
        #[serde(default = "default_region")]
        region: String,
        #[serde(default = "default_root")]
        root: String,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        access_key_id: Option<String>,
        #[serde(default)]
        secret_access_key: Option<String>,
    },
    /// Google Cloud Storage
    Gcs {
        bucket: String,
        #[serde(default = "default_root")]
        root: String,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        credential_path: Option<String>,
    },
    /// Azure Blob Storage
    Azure {
        container: String,
        #[serde(default = "default_root")]
        root: String,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        account_name: Option<String>,
        #[serde(default)]
        account_key: Option<String>,
    },
    /// Local directory
    Fs { root: PathBuf },
    /// In-process store, lost on exit
    Memory,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_root() -> String {
    "/".to_string()
}

/// One configured backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendConfig {
    /// Name used in the policy table
    pub id: BackendId,

    #[serde(flatten)]
    pub settings: BackendSettings,
}

impl BackendConfig {
    /// Construct the backend handle
    pub fn build(&self) -> Result<Arc<dyn StorageBackend>> {
        let id = self.id.clone();
        let backend: Arc<dyn StorageBackend> = match &self.settings {
            BackendSettings::S3 {
                bucket,
                region,
                root,
                endpoint,
                access_key_id,
                secret_access_key,
            } => Arc::new(ProviderBackend::s3(
                id,
                bucket,
                region,
                root,
                endpoint.as_deref(),
                access_key_id.as_deref(),
                secret_access_key.as_deref(),
            )?),
            BackendSettings::Gcs {
                bucket,
                root,
                endpoint,
                credential_path,
            } => Arc::new(ProviderBackend::gcs(
                id,
                bucket,
                root,
                endpoint.as_deref(),
                credential_path.as_deref(),
            )?),
            BackendSettings::Azure {
                container,
                root,
                endpoint,
                account_name,
                account_key,
            } => {
                let endpoint = match (endpoint, account_name) {
                    (Some(ep), _) => ep.clone(),
                    (None, Some(account)) => format!("https://{}.blob.core.windows.net", account),
                    (None, None) => {
                        return Err(Error::InvalidConfig(format!(
                            "azure backend {} needs an endpoint or account name",
                            self.id
                        )))
                    }
                };
                Arc::new(ProviderBackend::azure(
                    id,
                    container,
                    root,
                    &endpoint,
                    account_name.as_deref(),
                    account_key.as_deref(),
                )?)
            }
            BackendSettings::Fs { root } => {
                std::fs::create_dir_all(root)?;
                Arc::new(ProviderBackend::fs(id, &root.to_string_lossy())?)
            }
            BackendSettings::Memory => Arc::new(MemoryBackend::new(id)),
        };
        Ok(backend)
    }
}

/// Retry settings for transient backend errors
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry (milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Largest delay between retries (milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Upload/download settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
    /// Successful replica writes required for a replicated upload
    #[serde(default = "default_min_replicas")]
    pub min_replicas: usize,

    /// Concurrent backend calls
    #[serde(default = "default_worker_pool")]
    pub worker_pool: usize,

    /// Files handled at once by batch upload/download
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Per-file deadline for CLI-triggered operations (seconds)
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

fn default_min_replicas() -> usize {
    DEFAULT_MIN_REPLICAS
}

fn default_worker_pool() -> usize {
    DEFAULT_WORKER_POOL
}

fn default_max_concurrent_files() -> usize {
    DEFAULT_MAX_CONCURRENT_FILES
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            min_replicas: default_min_replicas(),
            worker_pool: default_worker_pool(),
            max_concurrent_files: default_max_concurrent_files(),
            retry: RetryConfig::default(),
            deadline_secs: None,
        }
    }
}

impl SyncConfig {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthConfig {
    /// Consecutive failures that open a backend's circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open circuit waits before a probe
    #[serde(default = "default_open_cooldown_secs")]
    pub open_cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_open_cooldown_secs() -> u64 {
    DEFAULT_OPEN_COOLDOWN.as_secs()
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            failure_threshold: default_failure_threshold(),
            open_cooldown_secs: default_open_cooldown_secs(),
        }
    }
}

impl HealthConfig {
    pub fn open_cooldown(&self) -> Duration {
        Duration::from_secs(self.open_cooldown_secs)
    }
}

/// Index database location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexConfig {
    #[serde(default = "default_index_path")]
    pub path: PathBuf,
}

fn default_index_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cloudstripe")
        .join("index")
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            path: default_index_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub erasure: ErasureConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Seconds between scrub passes
    #[serde(default = "default_scrub_interval")]
    pub scrub_interval_secs: u64,
}

fn default_scrub_interval() -> u64 {
    DEFAULT_SCRUB_INTERVAL
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backends: Vec::new(),
            policy: PolicyConfig::default(),
            erasure: ErasureConfig::default(),
            sync: SyncConfig::default(),
            health: HealthConfig::default(),
            index: IndexConfig::default(),
            logging: LoggingConfig::default(),
            scrub_interval_secs: default_scrub_interval(),
        }
    }
}

impl Config {
    /// Default location of the config file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cloudstripe")
            .join("config.json")
    }

    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        // Override with environment variables if set
        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Credentials only fill fields the file leaves empty.
    pub fn apply_env_overrides(&mut self) {
        let env = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        for backend in &mut self.backends {
            match &mut backend.settings {
                BackendSettings::S3 {
                    access_key_id,
                    secret_access_key,
                    ..
                } => {
                    if access_key_id.is_none() {
                        *access_key_id = env("AWS_ACCESS_KEY_ID");
                    }
                    if secret_access_key.is_none() {
                        *secret_access_key = env("AWS_SECRET_ACCESS_KEY");
                    }
                }
                BackendSettings::Gcs {
                    credential_path, ..
                } => {
                    if credential_path.is_none() {
                        *credential_path = env("GOOGLE_APPLICATION_CREDENTIALS");
                    }
                }
                BackendSettings::Azure {
                    account_name,
                    account_key,
                    ..
                } => {
                    if account_name.is_none() {
                        *account_name = env("AZURE_STORAGE_ACCOUNT");
                    }
                    if account_key.is_none() {
                        *account_key = env("AZURE_STORAGE_KEY");
                    }
                }
                BackendSettings::Fs { .. } | BackendSettings::Memory => {}
            }
        }

        if let Some(pool) = env("CLOUDSTRIPE_WORKER_POOL") {
            if let Ok(size) = pool.parse::<usize>() {
                self.sync.worker_pool = size;
            }
        }

        if let Some(path) = env("CLOUDSTRIPE_INDEX_PATH") {
            self.index.path = PathBuf::from(path);
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Identifiers of the configured backends, in order
    pub fn backend_ids(&self) -> Vec<BackendId> {
        self.backends.iter().map(|b| b.id.clone()).collect()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one backend is required".to_string(),
            ));
        }

        let ids = self.backend_ids();
        for (i, id) in ids.iter().enumerate() {
            if id.as_str().is_empty() {
                return Err(Error::InvalidConfig("Backend id must not be empty".to_string()));
            }
            if ids[..i].contains(id) {
                return Err(Error::InvalidConfig(format!("Duplicate backend id: {}", id)));
            }
        }

        PolicyEngine::new(&self.policy, &ids)?;
        self.erasure.validate()?;

        if self.sync.min_replicas < 1 {
            return Err(Error::InvalidConfig(
                "min_replicas must be at least 1".to_string(),
            ));
        }

        if self.sync.worker_pool == 0 {
            return Err(Error::InvalidConfig(
                "worker_pool must be greater than 0".to_string(),
            ));
        }

        if self.sync.max_concurrent_files == 0 {
            return Err(Error::InvalidConfig(
                "max_concurrent_files must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Build every configured backend
    pub fn build_backends(&self) -> Result<Vec<Arc<dyn StorageBackend>>> {
        self.backends.iter().map(BackendConfig::build).collect()
    }
}
