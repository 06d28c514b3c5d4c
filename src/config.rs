//! # Configuration Management
//!
//! Centralized configuration for servers, worker pools, framing and bridge nodes.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`FRAME_BRIDGE_*` variables)
//!
//! ## Sections
//! - `server`: listen address, backlog, connection limit, shutdown budget
//! - `pool`: worker strategy, worker / unit-of-order counts, poll cadence
//! - `framing`: header layout and maximum message size
//! - `bridge`: endpoints, transport, request timeout and sweep interval
//! - `logging`: level, outputs and format
//!
//! Durations are written as integer milliseconds.

use crate::core::frame::{HeaderLayout, DEFAULT_MAX_MESSAGE_SIZE};
use crate::error::{ProtocolError, Result};
use crate::pool::WorkerStrategy;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Largest UDP payload that fits an IPv4 datagram
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Smallest scratch buffer used for a socket read
pub const MIN_READ_CHUNK_SIZE: usize = 64;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub pool: PoolConfig,

    /// Frame codec configuration
    #[serde(default)]
    pub framing: FramingConfig,

    /// Bridge node configuration
    #[serde(default)]
    pub bridge: BridgeConfig,

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
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("FRAME_BRIDGE_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(backlog) = std::env::var("FRAME_BRIDGE_BACKLOG") {
            if let Ok(val) = backlog.parse::<u32>() {
                config.server.backlog = val;
            }
        }

        if let Ok(workers) = std::env::var("FRAME_BRIDGE_WORKER_COUNT") {
            if let Ok(val) = workers.parse::<usize>() {
                config.pool.worker_count = val;
            }
        }

        if let Ok(units) = std::env::var("FRAME_BRIDGE_MAX_UNIT_OF_ORDER") {
            if let Ok(val) = units.parse::<usize>() {
                config.pool.max_unit_of_order = val;
            }
        }

        if let Ok(poll) = std::env::var("FRAME_BRIDGE_POLL_TIMEOUT_MS") {
            if let Ok(val) = poll.parse::<u64>() {
                config.pool.poll_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(size) = std::env::var("FRAME_BRIDGE_MAX_MESSAGE_SIZE") {
            if let Ok(val) = size.parse::<usize>() {
                config.framing.max_message_size = val;
            }
        }

        if let Ok(endpoint) = std::env::var("FRAME_BRIDGE_LISTEN_ENDPOINT") {
            config.bridge.listen_endpoint = endpoint;
        }

        if let Ok(timeout) = std::env::var("FRAME_BRIDGE_REQUEST_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.bridge.request_timeout = Duration::from_millis(val);
            }
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
        errors.extend(self.pool.validate());
        errors.extend(self.framing.validate());
        errors.extend(self.bridge.validate(&self.framing));
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

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server listen address (e.g., "127.0.0.1:9000")
    pub address: String,

    /// Pending-connection backlog handed to `listen()`
    pub backlog: u32,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Size of the scratch buffer used for each socket read
    pub read_chunk_size: usize,

    /// Timeout for graceful shutdown, including worker joins
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            backlog: 128,
            max_connections: 1000,
            read_chunk_size: 8 * 1024,
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
        } else if self.address.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:8080')",
                self.address
            ));
        }

        if self.backlog == 0 {
            errors.push("Backlog must be greater than 0".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.read_chunk_size < MIN_READ_CHUNK_SIZE {
            errors.push(format!(
                "Read chunk size too small (minimum: {MIN_READ_CHUNK_SIZE} bytes)"
            ));
        }

        if self.shutdown_timeout.as_millis() < 10 {
            errors.push("Shutdown timeout too short (minimum: 10ms)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Which concurrency strategy services connections
    pub strategy: WorkerStrategy,

    /// Number of polling workers (polling strategy)
    pub worker_count: usize,

    /// Number of ordered buckets, each with one dedicated worker (ordered strategy)
    pub max_unit_of_order: usize,

    /// How long a polling worker waits for a claimed socket to become readable
    #[serde(with = "duration_serde")]
    pub poll_timeout: Duration,

    /// Pause between two full registry scans of a polling worker
    #[serde(with = "duration_serde")]
    pub scan_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            strategy: WorkerStrategy::Polling,
            worker_count: 4,
            max_unit_of_order: 8,
            poll_timeout: timeout::POLL_TIMEOUT,
            scan_interval: timeout::SCAN_INTERVAL,
        }
    }
}

impl PoolConfig {
    /// Validate pool configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.worker_count == 0 {
            errors.push("Worker count must be greater than 0".to_string());
        } else if self.worker_count > 1024 {
            errors.push(format!(
                "Worker count too large: {} (maximum: 1024)",
                self.worker_count
            ));
        }

        if self.max_unit_of_order == 0 {
            errors.push("Max unit of order must be greater than 0".to_string());
        } else if self.max_unit_of_order > 1024 {
            errors.push(format!(
                "Max unit of order too large: {} (maximum: 1024)",
                self.max_unit_of_order
            ));
        }

        if self.poll_timeout.is_zero() {
            errors.push("Poll timeout must be greater than 0".to_string());
        } else if self.poll_timeout.as_secs() > 10 {
            errors.push("Poll timeout too long (maximum: 10s)".to_string());
        }

        if self.scan_interval.as_secs() > 1 {
            errors.push("Scan interval too long (maximum: 1s)".to_string());
        }

        errors
    }
}

/// Frame codec configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FramingConfig {
    /// Header shape used on the wire; fixed for a given service
    pub layout: HeaderLayout,

    /// Largest accepted `totalLength`, header included
    pub max_message_size: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            layout: HeaderLayout::Minimal,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl FramingConfig {
    /// Validate framing configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_message_size <= self.layout.header_size() {
            errors.push(format!(
                "Max message size must exceed the {}-byte header",
                self.layout.header_size()
            ));
        } else if self.max_message_size > i32::MAX as usize {
            errors.push(format!(
                "Max message size too large: {} bytes (length field is a signed 32-bit integer)",
                self.max_message_size
            ));
        }

        errors
    }
}

/// Transport carrying bridge traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeTransportKind {
    /// One frame per datagram
    Udp,
    /// Persistent outbound stream per peer
    Tcp,
}

/// Bridge node configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Local address the node binds to
    pub listen_endpoint: String,

    /// Address peers use to reach this node; defaults to the listen endpoint
    #[serde(default)]
    pub public_endpoint: Option<String>,

    /// Peers this node accepts bridge traffic from
    #[serde(default)]
    pub allowed_peer_endpoints: Vec<String>,

    /// Transport used between nodes
    pub transport: BridgeTransportKind,

    /// Default deadline for a request
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,

    /// How often pending requests are checked against their deadline
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,

    /// Largest datagram the UDP transport will send or accept
    pub max_datagram_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_endpoint: String::from("127.0.0.1:9100"),
            public_endpoint: None,
            allowed_peer_endpoints: Vec::new(),
            transport: BridgeTransportKind::Udp,
            request_timeout: timeout::REQUEST_TIMEOUT,
            sweep_interval: timeout::SWEEP_INTERVAL,
            max_datagram_size: 8 * 1024,
        }
    }
}

impl BridgeConfig {
    /// Validate bridge configuration
    pub fn validate(&self, framing: &FramingConfig) -> Vec<String> {
        let mut errors = Vec::new();

        if self.listen_endpoint.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid bridge listen endpoint: '{}'",
                self.listen_endpoint
            ));
        }

        if let Some(public) = &self.public_endpoint {
            if public.parse::<SocketAddr>().is_err() {
                errors.push(format!("Invalid bridge public endpoint: '{public}'"));
            }
        }

        for peer in &self.allowed_peer_endpoints {
            if peer.parse::<SocketAddr>().is_err() {
                errors.push(format!("Invalid allowed peer endpoint: '{peer}'"));
            }
        }

        if self.request_timeout.as_millis() < 10 {
            errors.push("Request timeout too short (minimum: 10ms)".to_string());
        }

        if self.sweep_interval.is_zero() {
            errors.push("Sweep interval must be greater than 0".to_string());
        } else if self.sweep_interval > self.request_timeout {
            errors.push("Sweep interval cannot be longer than the request timeout".to_string());
        }

        if self.max_datagram_size <= framing.layout.header_size() {
            errors.push("Max datagram size must exceed the frame header".to_string());
        } else if self.max_datagram_size > MAX_UDP_PAYLOAD {
            errors.push(format!(
                "Max datagram size too large: {} bytes (maximum: {MAX_UDP_PAYLOAD})",
                self.max_datagram_size
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
            app_name: String::from("frame-bridge"),
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
                if let Some(parent) = Path::new(path).parent() {
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
