//! Configuration management for WScp.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/wscp/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::crypto::MAX_KEY_BITS;
use protocol::{SessionConfig, DEFAULT_KEY_BITS, MAX_STRIDE, MIN_KEY_BITS};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Default address the server listens on.
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:8989";

/// Default WebSocket endpoint path.
pub const DEFAULT_ENDPOINT_PATH: &str = "/api";

/// Default directory for received files.
pub const DEFAULT_OUTPUT_DIR: &str = "received";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("stride must be between 1 and {max} bytes, got {0}", max = MAX_STRIDE)]
    InvalidStride(usize),

    #[error(
        "key_bits must be between {min} and {max}, got {0}",
        min = MIN_KEY_BITS,
        max = MAX_KEY_BITS
    )]
    InvalidKeyBits(usize),

    #[error("listen must be a host:port address, got {0}")]
    InvalidListenAddress(String),

    #[error("path must start with '/', got {0}")]
    InvalidEndpointPath(String),

    #[error("proxy must be an http:// URL, got {0}")]
    InvalidProxy(String),

    #[error("password is set without a username")]
    IncompleteCredentials,

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for WScp.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Transfer tunables shared by both roles.
    pub transfer: TransferConfig,

    /// Sending side settings.
    pub client: ClientConfig,

    /// Receiving side settings.
    pub server: ServerConfig,

    /// Logging settings.
    pub log: LogConfig,
}

/// Transfer tunables.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Content bytes per chunk.
    pub stride: usize,

    /// RSA modulus size for the handshake.
    pub key_bits: usize,

    /// Unflushed bytes that force a disk sync on the receiver.
    pub flush_threshold: u64,

    /// Seconds the sender waits for each response (0 = wait forever).
    pub ack_timeout: u64,

    /// Re-check every chunk's checksum on the receiver.
    pub verify_chunks: bool,

    /// Consecutive replays tolerated for one chunk.
    pub max_replays: u32,
}

/// Sending side settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ClientConfig {
    /// HTTP proxy, `http://[user[:password]@]host[:port]`.
    pub proxy: Option<String>,

    /// Draw the progress bar with ASCII characters only.
    pub ascii: bool,
}

/// Receiving side settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen: String,

    /// Path of the WebSocket endpoint.
    pub path: String,

    /// Directory received files are written to.
    pub output_dir: PathBuf,

    /// Replace files that already exist in the output directory.
    pub overwrite: bool,

    /// Username required in the Basic credentials, if any.
    pub username: Option<String>,

    /// Password required in the Basic credentials.
    pub password: Option<String>,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            stride: session.stride,
            key_bits: DEFAULT_KEY_BITS,
            flush_threshold: session.flush_threshold,
            ack_timeout: 0,
            verify_chunks: session.verify_chunks,
            max_replays: session.max_replays,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN_ADDRESS.to_string(),
            path: DEFAULT_ENDPOINT_PATH.to_string(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            overwrite: false,
            username: None,
            password: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Returns the expected `user:password` pair, if credentials are required.
    pub fn credentials(&self) -> Option<String> {
        self.username.as_ref().map(|user| {
            format!("{}:{}", user, self.password.as_deref().unwrap_or_default())
        })
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wscp")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - WSCP_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - WSCP_PROXY: Override the client proxy URL
    /// - WSCP_OUTPUT_DIR: Override the server output directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("WSCP_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.log.level = level;
            }
        }

        if let Ok(proxy) = std::env::var("WSCP_PROXY") {
            if !proxy.is_empty() {
                tracing::info!("Overriding proxy from environment");
                self.client.proxy = Some(proxy);
            }
        }

        if let Ok(dir) = std::env::var("WSCP_OUTPUT_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding output_dir from environment: {}", dir);
                self.server.output_dir = PathBuf::from(dir);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer.stride == 0 || self.transfer.stride > MAX_STRIDE {
            return Err(ConfigError::InvalidStride(self.transfer.stride));
        }

        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&self.transfer.key_bits) {
            return Err(ConfigError::InvalidKeyBits(self.transfer.key_bits));
        }

        let listen = &self.server.listen;
        let valid_listen = listen
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
            .unwrap_or(false);
        if !valid_listen {
            return Err(ConfigError::InvalidListenAddress(listen.clone()));
        }

        if !self.server.path.starts_with('/') {
            return Err(ConfigError::InvalidEndpointPath(self.server.path.clone()));
        }

        if self.server.password.is_some() && self.server.username.is_none() {
            return Err(ConfigError::IncompleteCredentials);
        }

        if let Some(proxy) = self.client.proxy.as_deref().filter(|p| !p.is_empty()) {
            let valid = Url::parse(proxy)
                .map(|url| url.scheme() == "http" && url.host_str().is_some())
                .unwrap_or(false);
            if !valid {
                return Err(ConfigError::InvalidProxy(proxy.to_string()));
            }
        }

        let level = self.log.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }

        Ok(())
    }

    /// Builds the session tunables from this configuration.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            stride: self.transfer.stride,
            key_bits: self.transfer.key_bits,
            flush_threshold: self.transfer.flush_threshold,
            ack_timeout: (self.transfer.ack_timeout > 0)
                .then(|| Duration::from_secs(self.transfer.ack_timeout)),
            verify_chunks: self.transfer.verify_chunks,
            max_replays: self.transfer.max_replays,
            overwrite: self.server.overwrite,
        }
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
