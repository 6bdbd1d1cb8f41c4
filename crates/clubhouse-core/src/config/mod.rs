//! Configuration parsing and management.
//!
//! This module handles parsing of `clubhouse.toml`, which names the
//! authorization contract, where to start scanning the ledger, how to reach
//! it, and where the counter store lives.
//!
//! # Provider Endpoint Resolution
//!
//! The endpoint is chosen in this order:
//!
//! 1. `--provider` on the daemon command line
//! 2. the [`PROVIDER_ENV_VAR`] environment variable
//! 3. `ledger.provider_endpoint` in the config file
//! 4. [`DEFAULT_PROVIDER_ENDPOINT`]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding the configured provider endpoint.
pub const PROVIDER_ENV_VAR: &str = "CLUBHOUSE_WEB3_PROVIDER";

/// Endpoint used when nothing else is configured (a local node).
pub const DEFAULT_PROVIDER_ENDPOINT: &str = "http://127.0.0.1:8545";

/// `keccak256("GrantAdmission(string)")`, the authorization event topic.
pub const GRANT_ADMISSION_TOPIC: &str =
    "0xa7a185385c503e9ada3e526a11ca7fb6c7cdb34ebe2f6fc67f0582e34ab6ea67";

/// Minimum head poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Maximum head poll interval.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ClubhouseConfig {
    /// Ledger connection and contract settings.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Counter store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Status API settings.
    #[serde(default)]
    pub api: ApiConfig,
}

impl ClubhouseConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// Parsing does not validate; call [`validate`](Self::validate) once CLI
    /// overrides have been applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks that the configuration can drive the daemon.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ledger.validate()
    }
}

/// Ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    /// Address of the authorization contract (`0x` + 40 hex digits).
    #[serde(default)]
    pub contract_address: String,

    /// First block scanned for historical authorization events.
    #[serde(default)]
    pub deploy_block: u64,

    /// Ledger RPC endpoint (`http://` or `https://`).
    #[serde(default)]
    pub provider_endpoint: Option<String>,

    /// Head poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on any single ledger request, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Topic of the authorization event.
    #[serde(default = "default_grant_event_topic")]
    pub grant_event_topic: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            contract_address: String::new(),
            deploy_block: 0,
            provider_endpoint: None,
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            grant_event_topic: default_grant_event_topic(),
        }
    }
}

impl LedgerConfig {
    /// Returns the head poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the per-request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Resolves the provider endpoint.
    ///
    /// `cli` and `env` are the command-line and environment overrides; empty
    /// strings count as unset.
    #[must_use]
    pub fn resolve_provider_endpoint(&self, cli: Option<&str>, env: Option<&str>) -> String {
        [cli, env, self.provider_endpoint.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
            .unwrap_or(DEFAULT_PROVIDER_ENDPOINT)
            .to_string()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.contract_address.is_empty() {
            return Err(ConfigError::Validation(
                "ledger.contract_address is required".to_string(),
            ));
        }
        if !is_hex_with_len(&self.contract_address, 20) {
            return Err(ConfigError::Validation(format!(
                "ledger.contract_address must be 0x followed by 40 hex digits, got {:?}",
                self.contract_address
            )));
        }
        if !is_hex_with_len(&self.grant_event_topic, 32) {
            return Err(ConfigError::Validation(format!(
                "ledger.grant_event_topic must be 0x followed by 64 hex digits, got {:?}",
                self.grant_event_topic
            )));
        }
        let interval = self.poll_interval();
        if !(MIN_POLL_INTERVAL..=MAX_POLL_INTERVAL).contains(&interval) {
            return Err(ConfigError::Validation(format!(
                "ledger.poll_interval_ms must be between {} and {}, got {}",
                MIN_POLL_INTERVAL.as_millis(),
                MAX_POLL_INTERVAL.as_millis(),
                self.poll_interval_ms
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "ledger.request_timeout_ms must be non-zero".to_string(),
            ));
        }
        if let Some(endpoint) = &self.provider_endpoint {
            validate_endpoint(endpoint)?;
        }
        Ok(())
    }
}

/// Checks that `endpoint` is an HTTP(S) URL.
///
/// Websocket providers are not supported; the daemon polls over HTTP.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] for any other scheme.
pub fn validate_endpoint(endpoint: &str) -> Result<(), ConfigError> {
    let endpoint = endpoint.trim();
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        return Err(ConfigError::Validation(format!(
            "websocket provider {endpoint:?} is not supported; use an http(s) endpoint"
        )));
    }
    if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
        return Err(ConfigError::Validation(format!(
            "provider endpoint {endpoint:?} must start with http:// or https://"
        )));
    }
    Ok(())
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Path of the `SQLite` counter database.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Status API configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    /// Whether to serve the status API.
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,

    /// Listen address. Defaults to localhost.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen_addr: default_listen_addr(),
        }
    }
}

fn is_hex_with_len(value: &str, bytes: usize) -> bool {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .is_some_and(|digits| {
            digits.len() == bytes * 2 && digits.bytes().all(|b| b.is_ascii_hexdigit())
        })
}

const fn default_poll_interval_ms() -> u64 {
    500
}

const fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_grant_event_topic() -> String {
    GRANT_ADMISSION_TOPIC.to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("clubhouse.db")
}

const fn default_api_enabled() -> bool {
    true
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8645))
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
