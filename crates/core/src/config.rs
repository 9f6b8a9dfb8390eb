//! Configuration management for b2pilot

use crate::error::{Error, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration directory name
const CONFIG_DIR: &str = "b2pilot";

/// Configuration file name
const CONFIG_FILE: &str = "config.toml";

/// Smallest part the large-file API accepts (5 MB)
pub const ABSOLUTE_MINIMUM_PART_SIZE: u64 = 5_000_000;

/// Largest number of parts in one large file
pub const MAX_PART_COUNT: u64 = 10_000;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub account: AccountConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub advanced: Option<AdvancedConfig>,
    pub logging: Option<LoggingConfig>,
}

/// Account credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub application_key_id: String,
    pub application_key: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

/// Chunked transfer thresholds and connection pools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Payloads up to this size are uploaded in one request
    #[serde(default = "default_cutoff_size")]
    pub upload_cutoff_size: u64,
    #[serde(default = "default_part_size")]
    pub upload_part_size: u64,
    /// Floor for `upload_part_size`
    #[serde(default = "default_minimum_part_size")]
    pub minimum_part_size: u64,
    #[serde(default = "default_cutoff_size")]
    pub download_cutoff_size: u64,
    #[serde(default = "default_part_size")]
    pub download_part_size: u64,
    #[serde(default = "default_upload_connections")]
    pub upload_connections: usize,
    #[serde(default = "default_download_connections")]
    pub download_connections: usize,
    #[serde(default = "default_generic_connections")]
    pub generic_connections: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            upload_cutoff_size: default_cutoff_size(),
            upload_part_size: default_part_size(),
            minimum_part_size: default_minimum_part_size(),
            download_cutoff_size: default_cutoff_size(),
            download_part_size: default_part_size(),
            upload_connections: default_upload_connections(),
            download_connections: default_download_connections(),
            generic_connections: default_generic_connections(),
        }
    }
}

/// Retry and backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Max attempts per error class
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_jitter_min_ms")]
    pub jitter_min_ms: u64,
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
    /// Upper bound on the best-effort large file cancel call
    #[serde(default = "default_cancel_timeout")]
    pub cancel_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_count: default_retry_count(),
            backoff_base_ms: default_backoff_base_ms(),
            jitter_min_ms: default_jitter_min_ms(),
            jitter_max_ms: default_jitter_max_ms(),
            cancel_timeout_secs: default_cancel_timeout(),
        }
    }
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_secs(self.cancel_timeout_secs)
    }
}

/// Time-to-live defaults for the ephemeral caches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_upload_url_ttl")]
    pub upload_url_ttl_secs: u64,
    /// 0 disables list page caching
    #[serde(default)]
    pub list_page_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            upload_url_ttl_secs: default_upload_url_ttl(),
            list_page_ttl_secs: 0,
        }
    }
}

impl CacheConfig {
    pub fn upload_url_ttl(&self) -> Duration {
        Duration::from_secs(self.upload_url_ttl_secs)
    }

    pub fn list_page_ttl(&self) -> Option<Duration> {
        (self.list_page_ttl_secs > 0).then(|| Duration::from_secs(self.list_page_ttl_secs))
    }
}

/// Advanced configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedConfig {
    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

// Default values
fn default_api_url() -> String {
    "https://api.backblazeb2.com".to_string()
}

fn default_cutoff_size() -> u64 {
    100 * 1024 * 1024 // 100 MiB
}

fn default_part_size() -> u64 {
    100 * 1024 * 1024
}

fn default_minimum_part_size() -> u64 {
    ABSOLUTE_MINIMUM_PART_SIZE
}

fn default_upload_connections() -> usize {
    3
}

fn default_download_connections() -> usize {
    5
}

fn default_generic_connections() -> usize {
    5
}

fn default_retry_count() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1000 // 1 second, doubled per attempt
}

fn default_jitter_min_ms() -> u64 {
    10
}

fn default_jitter_max_ms() -> u64 {
    1000
}

fn default_cancel_timeout() -> u64 {
    30
}

fn default_upload_url_ttl() -> u64 {
    300 // 5 minutes
}

fn default_timeout() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let home = home_dir()
        .ok_or_else(|| Error::Config("Cannot determine home directory".to_string()))?;
    let config_dir = home.join(".config").join(CONFIG_DIR);

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)
            .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
    }

    Ok(config_dir)
}

/// Get the configuration file path
pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(CONFIG_FILE))
}

/// Load configuration from the default location
pub fn load_config() -> Result<ConfigFile> {
    load_config_from(&get_config_path()?)
}

/// Load configuration from an explicit path
pub fn load_config_from(config_path: &std::path::Path) -> Result<ConfigFile> {
    if !config_path.exists() {
        return Err(Error::ConfigNotFound(config_path.to_path_buf()));
    }

    let content = fs::read_to_string(config_path)
        .map_err(|e| Error::InvalidConfig(format!("Failed to read config file: {}", e)))?;

    let config: ConfigFile = toml::from_str(&content)
        .map_err(|e| Error::InvalidConfig(format!("Failed to parse config file: {}", e)))?;

    Ok(config)
}

/// Save configuration to the default location
pub fn save_config(config: &ConfigFile) -> Result<()> {
    save_config_to(config, &get_config_path()?)
}

/// Save configuration to an explicit path
pub fn save_config_to(config: &ConfigFile, config_path: &std::path::Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::InvalidConfig(format!("Failed to serialize config: {}", e)))?;

    fs::write(config_path, content)
        .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

    // The file holds the application key
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(config_path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(config_path, perms)?;
    }

    Ok(())
}

/// Validate configuration
pub fn validate_config(config: &ConfigFile) -> Result<()> {
    if config.account.application_key_id.is_empty() || config.account.application_key.is_empty() {
        return Err(Error::Config(
            "No credentials configured. Both application_key_id and application_key must be set"
                .to_string(),
        ));
    }

    validate_transfer(&config.transfer)?;
    validate_retry(&config.retry)?;

    Ok(())
}

/// Validate transfer thresholds and pool sizes
pub fn validate_transfer(transfer: &TransferConfig) -> Result<()> {
    if transfer.upload_part_size < transfer.minimum_part_size {
        return Err(Error::InvalidInput(format!(
            "upload_part_size {} is below the minimum part size {}",
            transfer.upload_part_size, transfer.minimum_part_size
        )));
    }

    if transfer.minimum_part_size == 0 || transfer.download_part_size == 0 {
        return Err(Error::InvalidInput("Part sizes must be greater than zero".to_string()));
    }

    if transfer.upload_cutoff_size == 0 || transfer.download_cutoff_size == 0 {
        return Err(Error::InvalidInput("Cutoff sizes must be greater than zero".to_string()));
    }

    if transfer.upload_connections == 0
        || transfer.download_connections == 0
        || transfer.generic_connections == 0
    {
        return Err(Error::InvalidInput(
            "Connection pool sizes must be at least 1".to_string(),
        ));
    }

    Ok(())
}

/// Validate retry settings
pub fn validate_retry(retry: &RetryConfig) -> Result<()> {
    if retry.retry_count == 0 {
        return Err(Error::InvalidInput("retry_count must be at least 1".to_string()));
    }

    if retry.jitter_min_ms > retry.jitter_max_ms {
        return Err(Error::InvalidInput(format!(
            "jitter_min_ms ({}) cannot exceed jitter_max_ms ({})",
            retry.jitter_min_ms, retry.jitter_max_ms
        )));
    }

    Ok(())
}

/// Check if configuration exists
pub fn config_exists() -> bool {
    get_config_path().map(|p| p.exists()).unwrap_or(false)
}

/// Public alias for ConfigFile (used by lib.rs)
pub use ConfigFile as Config;
