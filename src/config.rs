//! Configuration management with validation and defaults
//!
//! Values come from built-in defaults, an optional TOML file and `CRASHLINE_*`
//! environment overrides, in that order. Polling interval and tracked-id
//! capacity have floors; values below them fall back to the defaults.

use crate::errors::{ConfigurationError, CrashlineResult};
use serde::{Deserialize, Serialize};
use std::{env, path::Path, time::Duration};

pub const MIN_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 20_000;
pub const MIN_TRACKED_TRANSACTIONS: usize = 100;
pub const DEFAULT_TRACKED_TRANSACTIONS: usize = 1_000;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashlineConfig {
    pub storage: StorageConfig,
    pub chain: ChainConfig,
    pub depositor: DepositorConfig,
    pub provider: ProviderConfig,
    pub withdrawal: WithdrawalConfig,
    pub api: ApiConfig,
    pub monitoring: MonitoringConfig,
}

/// RocksDB settings for the ledger store
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_directory: String,
    pub write_buffer_size_mb: usize,
    pub max_write_buffer_number: i32,
    pub compression_type: CompressionType,
    /// How long a transaction waits for a row lock before failing
    pub lock_timeout_ms: i64,
    /// Whether to clear database on startup (testing only!)
    pub clear_on_start: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Snappy,
    Lz4,
    Zstd,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: "./DB/crashline".to_string(),
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            compression_type: CompressionType::Lz4,
            lock_timeout_ms: 2_000,
            clear_on_start: false,
        }
    }
}

/// Hash chain generation settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Hashes persisted per storage transaction
    pub batch_size: usize,
    /// One in this many rounds busts at 1.00x
    pub instant_bust_modulus: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            instant_bust_modulus: 101,
        }
    }
}

/// Deposit watcher settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DepositorConfig {
    pub poll_interval_ms: u64,
    pub max_tracked_transactions: usize,
    /// Concurrent credits per poll cycle
    pub concurrency: usize,
    /// Page size requested from the provider
    pub page_limit: u32,
    pub currency: String,
}

impl Default for DepositorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_tracked_transactions: DEFAULT_TRACKED_TRANSACTIONS,
            concurrency: 3,
            page_limit: 100,
            currency: "BTC".to_string(),
        }
    }
}

/// Payment provider credentials and limits
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub api_key: String,
    pub api_secret: String,
    pub account_id: String,
    pub api_version: String,
    pub api_base: String,
    pub timeout_ms: u64,
    pub max_pages: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            account_id: String::new(),
            api_version: "2023-10-01".to_string(),
            api_base: "https://api.coinbase.com".to_string(),
            timeout_ms: 30_000,
            max_pages: 5,
        }
    }
}

impl ProviderConfig {
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty() && !self.account_id.is_empty()
    }
}

/// Withdrawal pipeline settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WithdrawalConfig {
    /// Network fee withheld from every withdrawal, in minor units
    pub network_fee: u64,
    /// Smallest gross withdrawal accepted; must exceed the fee
    pub min_withdrawal: u64,
    pub currency: String,
    pub link_retry_attempts: usize,
    pub link_retry_base_delay_ms: u64,
}

impl Default for WithdrawalConfig {
    fn default() -> Self {
        Self {
            network_fee: 10_000,
            min_withdrawal: 10_100,
            currency: "BTC".to_string(),
            link_retry_attempts: 5,
            link_retry_base_delay_ms: 250,
        }
    }
}

/// HTTP read API settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origins: vec!["*".to_string()],
            request_timeout_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_filter: "crashline=info,tower_http=info".to_string(),
        }
    }
}

impl CrashlineConfig {
    /// Configuration for production deployment with persistence
    pub fn production() -> Self {
        Self {
            storage: StorageConfig {
                write_buffer_size_mb: 128,
                clear_on_start: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Small, fast settings for tests against a scratch directory
    pub fn testing<P: AsRef<Path>>(data_directory: P) -> Self {
        Self {
            storage: StorageConfig {
                data_directory: data_directory.as_ref().to_string_lossy().to_string(),
                write_buffer_size_mb: 4,
                compression_type: CompressionType::None,
                clear_on_start: true,
                ..Default::default()
            },
            chain: ChainConfig {
                batch_size: 4,
                ..Default::default()
            },
            withdrawal: WithdrawalConfig {
                link_retry_base_delay_ms: 1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Replace sub-floor values with their defaults.
    pub fn apply_floors(&mut self) {
        if self.depositor.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            tracing::warn!(
                configured = self.depositor.poll_interval_ms,
                fallback = DEFAULT_POLL_INTERVAL_MS,
                "poll interval below floor, using default"
            );
            self.depositor.poll_interval_ms = DEFAULT_POLL_INTERVAL_MS;
        }
        if self.depositor.max_tracked_transactions < MIN_TRACKED_TRANSACTIONS {
            tracing::warn!(
                configured = self.depositor.max_tracked_transactions,
                fallback = DEFAULT_TRACKED_TRANSACTIONS,
                "tracked transaction capacity below floor, using default"
            );
            self.depositor.max_tracked_transactions = DEFAULT_TRACKED_TRANSACTIONS;
        }
        if self.provider.max_pages == 0 {
            self.provider.max_pages = ProviderConfig::default().max_pages;
        }
    }

    /// Validate configuration for logical consistency
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.storage.data_directory.is_empty() {
            return Err(ConfigurationError::MissingRequired("storage.data_directory".to_string()));
        }

        if self.chain.batch_size == 0 {
            return Err(invalid("chain.batch_size", "0", "Batch size cannot be zero"));
        }

        if self.chain.instant_bust_modulus < 2 {
            return Err(invalid(
                "chain.instant_bust_modulus",
                &self.chain.instant_bust_modulus.to_string(),
                "Modulus must be at least 2",
            ));
        }

        if self.depositor.concurrency == 0 {
            return Err(invalid("depositor.concurrency", "0", "Concurrency cannot be zero"));
        }

        if self.withdrawal.min_withdrawal <= self.withdrawal.network_fee {
            return Err(invalid(
                "withdrawal.min_withdrawal",
                &self.withdrawal.min_withdrawal.to_string(),
                "Minimum withdrawal must exceed the network fee",
            ));
        }

        if self.withdrawal.link_retry_attempts == 0 {
            return Err(invalid("withdrawal.link_retry_attempts", "0", "At least one attempt is required"));
        }

        if self.api.port == 0 {
            return Err(invalid("api.port", "0", "Port cannot be zero"));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.depositor.poll_interval_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider.timeout_ms)
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Configuration loader with environment variable support
#[derive(Default)]
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> CrashlineResult<CrashlineConfig> {
        let mut config = match self.config_path {
            Some(ref path) => self.load_from_file(path)?,
            None => CrashlineConfig::default(),
        };

        self.apply_env_overrides(&mut config)?;
        config.apply_floors();
        config.validate()?;

        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> CrashlineResult<CrashlineConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e)))?;

        toml::from_str(&content)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into())
    }

    fn apply_env_overrides(&self, config: &mut CrashlineConfig) -> CrashlineResult<()> {
        if let Ok(dir) = env::var("CRASHLINE_DATA_DIR") {
            config.storage.data_directory = dir;
        }
        if let Some(v) = parse_env("CRASHLINE_POLL_INTERVAL_MS")? {
            config.depositor.poll_interval_ms = v;
        }
        if let Some(v) = parse_env("CRASHLINE_MAX_TRACKED")? {
            config.depositor.max_tracked_transactions = v;
        }
        if let Ok(key) = env::var("CRASHLINE_PROVIDER_API_KEY") {
            config.provider.api_key = key;
        }
        if let Ok(secret) = env::var("CRASHLINE_PROVIDER_API_SECRET") {
            config.provider.api_secret = secret;
        }
        if let Ok(account) = env::var("CRASHLINE_PROVIDER_ACCOUNT_ID") {
            config.provider.account_id = account;
        }
        if let Some(v) = parse_env("CRASHLINE_PROVIDER_MAX_PAGES")? {
            config.provider.max_pages = v;
        }
        if let Some(v) = parse_env("CRASHLINE_NETWORK_FEE")? {
            config.withdrawal.network_fee = v;
        }
        if let Some(v) = parse_env("CRASHLINE_MIN_WITHDRAWAL")? {
            config.withdrawal.min_withdrawal = v;
        }
        if let Some(v) = parse_env("CRASHLINE_API_PORT")? {
            config.api.port = v;
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self, config: &CrashlineConfig, path: &str) -> CrashlineResult<()> {
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, toml_string)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to write to {}: {}", path, e)).into())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigurationError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| invalid(name, &raw, "Not a valid number")),
        Err(_) => Ok(None),
    }
}
