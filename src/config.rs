//! # Configuration Management
//!
//! Centralized configuration for secure channels.
//!
//! This module provides structured configuration for servers and clients,
//! including listen/connect addresses, handshake and idle timeouts, frame limits
//! and the handshake key size.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - TOML strings via `from_toml()`
//! - Environment variables via `from_env()` (`SECURE_CHANNEL_*`)
//! - Direct instantiation with defaults
//!
//! ## Security Considerations
//! - The 20 KiB default frame limit bounds per-connection buffering
//! - Handshake timeouts stop peers from holding a half-open channel forever
//! - RSA keys below 1024 bits are rejected

use crate::core::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::core::serialization::SerializationFormat;
use crate::error::{ProtocolError, Result};
use crate::protocol::message::{major_version, PROTOCOL_VERSION};
use crate::utils::crypto::DEFAULT_RSA_BITS;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Smallest frame limit accepted by validation.
pub const MIN_FRAME_SIZE: usize = 1024;

/// Largest frame limit accepted by validation (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// RSA modulus sizes accepted for the handshake keypair.
pub const SUPPORTED_RSA_BITS: [usize; 4] = [1024, 2048, 3072, 4096];

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    ///
    /// Unset variables keep their defaults; set but unparsable values are an error.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = env_var("SECURE_CHANNEL_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Some(addr) = env_var("SECURE_CHANNEL_CLIENT_ADDRESS") {
            config.client.address = addr;
        }

        if let Some(max) = env_parse::<usize>("SECURE_CHANNEL_MAX_CONNECTIONS")? {
            config.server.max_connections = max;
        }

        if let Some(ms) = env_parse::<u64>("SECURE_CHANNEL_CONNECTION_TIMEOUT_MS")? {
            config.client.connection_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse::<u64>("SECURE_CHANNEL_HANDSHAKE_TIMEOUT_MS")? {
            config.server.handshake_timeout = Duration::from_millis(ms);
            config.client.handshake_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse::<u64>("SECURE_CHANNEL_IDLE_TIMEOUT_MS")? {
            config.server.idle_timeout = Some(Duration::from_millis(ms));
        }

        if let Some(size) = env_parse::<usize>("SECURE_CHANNEL_MAX_FRAME_SIZE")? {
            config.transport.max_frame_size = size;
        }

        if let Some(bits) = env_parse::<usize>("SECURE_CHANNEL_RSA_KEY_BITS")? {
            config.transport.rsa_key_bits = bits;
        }

        if let Some(format) = env_var("SECURE_CHANNEL_SERIALIZATION") {
            config.transport.serialization_format =
                toml::Value::String(format.to_lowercase())
                    .try_into()
                    .map_err(|e| {
                        ProtocolError::ConfigError(format!(
                            "Invalid SECURE_CHANNEL_SERIALIZATION: {e}"
                        ))
                    })?;
        }

        if let Some(level) = env_var("SECURE_CHANNEL_LOG_LEVEL") {
            config.logging.log_level = level.parse::<Level>().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid SECURE_CHANNEL_LOG_LEVEL: {level}"))
            })?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env_var(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ProtocolError::ConfigError(format!("Invalid {name}: '{raw}'"))),
    }
}

fn check_timeout(errors: &mut Vec<String>, label: &str, value: Duration, max_secs: u64) {
    if value.as_millis() < 100 {
        errors.push(format!("{label} too short (minimum: 100ms)"));
    } else if value.as_secs() > max_secs {
        errors.push(format!("{label} too long (maximum: {max_secs}s)"));
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server listen address (e.g., "127.0.0.1:9000")
    pub address: String,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Close a channel that receives nothing for this long
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "option_duration_serde"
    )]
    pub idle_timeout: Option<Duration>,

    /// Bound on the whole key exchange
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            max_connections: 1000,
            idle_timeout: None,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:8080')",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if let Some(idle) = self.idle_timeout {
            check_timeout(&mut errors, "Idle timeout", idle, 24 * 3600);
        }
        check_timeout(&mut errors, "Handshake timeout", self.handshake_timeout, 300);

        if self.shutdown_timeout.as_millis() < 100 {
            errors.push("Shutdown timeout too short (minimum: 100ms)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Default target server address
    pub address: String,

    /// Timeout for the TCP connect
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Bound on the whole key exchange
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Close the channel when the server is silent for this long
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "option_duration_serde"
    )]
    pub idle_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            idle_timeout: None,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if !self.address.contains(':') {
            errors.push(format!(
                "Invalid client address format: '{}' (expected format: 'example.com:8080')",
                self.address
            ));
        }

        check_timeout(&mut errors, "Connection timeout", self.connection_timeout, 300);
        check_timeout(&mut errors, "Handshake timeout", self.handshake_timeout, 300);
        if let Some(idle) = self.idle_timeout {
            check_timeout(&mut errors, "Idle timeout", idle, 24 * 3600);
        }

        errors
    }
}

/// Transport configuration, shared by both peers
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Largest encrypted frame accepted or produced, in bytes
    pub max_frame_size: usize,

    /// Payload encoding; both peers must agree
    #[serde(default)]
    pub serialization_format: SerializationFormat,

    /// RSA modulus size for the server's handshake keypair
    pub rsa_key_bits: usize,

    /// Version advertised during the handshake
    pub protocol_version: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            serialization_format: SerializationFormat::default(),
            rsa_key_bits: DEFAULT_RSA_BITS,
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_frame_size < MIN_FRAME_SIZE {
            errors.push(format!(
                "Max frame size too small: {} bytes (minimum: 1 KiB)",
                self.max_frame_size
            ));
        } else if self.max_frame_size > MAX_FRAME_SIZE {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum: 16 MiB)",
                self.max_frame_size
            ));
        }

        if !SUPPORTED_RSA_BITS.contains(&self.rsa_key_bits) {
            errors.push(format!(
                "Unsupported RSA key size: {} (valid: 1024, 2048, 3072, 4096)",
                self.rsa_key_bits
            ));
        }

        if major_version(&self.protocol_version).is_none() {
            errors.push(format!(
                "Invalid protocol version: '{}' (expected format: '1.0.0')",
                self.protocol_version
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("secure-channel"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Optional durations, in milliseconds
mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|value| value.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
