//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via BURROW_CONFIG)
//! 3. Environment variables

use burrow_protocol::{
    FramerLimits, LengthCheckOrder, DEFAULT_PORT, LISTEN_BACKLOG, MAX_HEAD_SIZE,
    MAX_REQUEST_SIZE, MAX_RESPONSE_SIZE, MIN_CONTENT_LENGTH, RECEIVE_BUFFER_SIZE,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Request size and batch limits.
    pub limits: LimitsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("BURROW_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.limits.apply_env_overrides();
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network.validate()?;
        self.limits.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Listen backlog for the accepting socket.
    pub listen_backlog: u32,
    /// Idle connection timeout in seconds (0 = never).
    pub idle_timeout_secs: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            listen_backlog: LISTEN_BACKLOG,
            idle_timeout_secs: 300,
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("BURROW_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(backlog) = std::env::var("BURROW_LISTEN_BACKLOG") {
            if let Ok(n) = backlog.parse() {
                self.listen_backlog = n;
            }
        }

        if let Ok(timeout) = std::env::var("BURROW_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.idle_timeout_secs = secs;
            }
        }

        if let Ok(max) = std::env::var("BURROW_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }

    /// Returns idle timeout as Duration, or `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_backlog == 0 {
            return Err(ConfigError::ValidationError(
                "listen_backlog must be positive".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Request size and batch limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Bytes requested per socket read.
    pub receive_buffer_size: usize,
    /// Largest accepted request body.
    pub max_request_size: usize,
    /// Largest response body the server will send.
    pub max_response_size: usize,
    /// Smallest request body worth parsing. Shorter requests are dropped
    /// without a response.
    pub min_content_length: usize,
    /// Largest request head accepted before the end-of-head marker.
    pub max_head_size: usize,
    /// Which content-length bound is checked first.
    pub length_check_order: LengthCheckOrder,
    /// Maximum commands in one request (0 = unlimited).
    pub max_batch_commands: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            receive_buffer_size: RECEIVE_BUFFER_SIZE,
            max_request_size: MAX_REQUEST_SIZE,
            max_response_size: MAX_RESPONSE_SIZE,
            min_content_length: MIN_CONTENT_LENGTH,
            max_head_size: MAX_HEAD_SIZE,
            length_check_order: LengthCheckOrder::MinimumFirst,
            max_batch_commands: 1024,
        }
    }
}

impl LimitsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("BURROW_RECEIVE_BUFFER_SIZE") {
            if let Ok(n) = size.parse() {
                self.receive_buffer_size = n;
            }
        }

        if let Ok(size) = std::env::var("BURROW_MAX_REQUEST_SIZE") {
            if let Ok(n) = size.parse() {
                self.max_request_size = n;
            }
        }

        if let Ok(size) = std::env::var("BURROW_MAX_RESPONSE_SIZE") {
            if let Ok(n) = size.parse() {
                self.max_response_size = n;
            }
        }

        if let Ok(size) = std::env::var("BURROW_MIN_CONTENT_LENGTH") {
            if let Ok(n) = size.parse() {
                self.min_content_length = n;
            }
        }

        if let Ok(size) = std::env::var("BURROW_MAX_HEAD_SIZE") {
            if let Ok(n) = size.parse() {
                self.max_head_size = n;
            }
        }

        if let Ok(order) = std::env::var("BURROW_LENGTH_CHECK_ORDER") {
            self.length_check_order = match order.to_lowercase().as_str() {
                "maximum_first" | "max_first" => LengthCheckOrder::MaximumFirst,
                _ => LengthCheckOrder::MinimumFirst,
            };
        }

        if let Ok(max) = std::env::var("BURROW_MAX_BATCH_COMMANDS") {
            if let Ok(n) = max.parse() {
                self.max_batch_commands = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.receive_buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "receive_buffer_size must be positive".to_string(),
            ));
        }
        if self.max_head_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_head_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the framer limits for incoming requests.
    pub fn framer_limits(&self) -> FramerLimits {
        FramerLimits {
            min_content_length: self.min_content_length,
            max_content_length: self.max_request_size,
            max_head_size: self.max_head_size,
            check_order: self.length_check_order,
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
