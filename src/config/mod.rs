//! Configuration module for Mizuchi Transfr
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
fn expand_env_vars(s: &str) -> String {
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]+))?\}").unwrap();
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let full_match = cap.get(0).unwrap();
        let var_name = cap.get(1).unwrap().as_str();

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name) {
            Ok(val) => val,
            Err(_) => {
                if let Some(default) = cap.get(2) {
                    default.as_str().to_string()
                } else {
                    // No env var and no default. Keep the original placeholder.
                    full_match.as_str().to_string()
                }
            }
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

/// Custom deserializer for strings with environment variable expansion
fn deserialize_with_env<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(expand_env_vars(&s))
}

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_http_url(&self.service.endpoint) {
            return Err(ConfigError::ValidationError(
                "Invalid service endpoint: must start with http:// or https://".into(),
            ));
        }

        if self.transfer.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "chunk_size must be greater than zero".into(),
            ));
        }

        if self.transfer.concurrent_parts == 0 {
            return Err(ConfigError::ValidationError(
                "concurrent_parts must be greater than zero".into(),
            ));
        }

        if self.transfer.max_file_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_file_size must be greater than zero".into(),
            ));
        }

        if self.transfer.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

/// Remote upload service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Base endpoint of the upload session service. Supports ${VAR} and
    /// ${VAR:-default} expansion.
    #[serde(deserialize_with = "deserialize_with_env")]
    pub endpoint: String,

    /// Per-request timeout in seconds. A stalled call fails as a
    /// retryable transport error rather than hanging. Default: 30
    #[serde(default = "default_request_timeout")]
    pub timeout_seconds: u64,
}

fn default_request_timeout() -> u64 {
    30
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Bytes per part, fixed at session creation. Default: 5MB
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Bounded worker pool size. Default: 3
    #[serde(default = "default_concurrent_parts")]
    pub concurrent_parts: usize,

    /// Files larger than this are rejected before contacting the remote
    /// service. Default: 500MB
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            concurrent_parts: default_concurrent_parts(),
            max_file_size: default_max_file_size(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_chunk_size() -> u64 {
    crate::plan::DEFAULT_CHUNK_SIZE
}

fn default_concurrent_parts() -> usize {
    3
}

fn default_max_file_size() -> u64 {
    524288000 // 500MB
}

/// Per-part retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per part before escalating the failure. Default: 3
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff in milliseconds, doubled per attempt. Default: 500
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

/// Session store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding persisted session records. Supports ${VAR}
    /// expansion. Default: ".mizuchi-transfr/sessions"
    #[serde(
        default = "default_store_path",
        deserialize_with = "deserialize_with_env"
    )]
    pub path: String,

    /// Sessions untouched for longer than this are eligible for
    /// pruning. Default: 7
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            retention_days: default_retention_days(),
        }
    }
}

impl StoreConfig {
    pub fn path_buf(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }
}

fn default_store_path() -> String {
    ".mizuchi-transfr/sessions".to_string()
}

fn default_retention_days() -> i64 {
    7
}
