//! Configuration module for the ping/pong harness.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Socket family used between clients and pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// IPv4 loopback stream sockets on an ephemeral port.
    Tcp,
    /// Unnamed local-domain stream sockets.
    Unix,
}

/// Where the protocol tick runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Pollers forward ready connections through exchange queues to workers.
    Queued,
    /// Each poller serves its own connections inline.
    Direct,
}

/// Command-line arguments for the harness
#[derive(Parser, Debug, Default)]
#[command(name = "pingpong-lb")]
#[command(version = "0.1.0")]
#[command(about = "Ping/pong poller vs. worker-pool harness", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Socket family (tcp or unix)
    #[arg(short, long, value_enum)]
    pub transport: Option<TransportKind>,

    /// Dispatch mode (queued or direct)
    #[arg(short, long, value_enum)]
    pub mode: Option<Mode>,

    /// Number of poller threads
    #[arg(short, long)]
    pub pollers: Option<usize>,

    /// Number of worker threads (queued mode only)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Number of load generator threads
    #[arg(long)]
    pub clients: Option<usize>,

    /// Connections opened by each load generator
    #[arg(short = 'n', long)]
    pub connections: Option<usize>,

    /// Requests sent over each connection
    #[arg(short = 'r', long)]
    pub messages: Option<usize>,

    /// Exchange queue capacity (power of two)
    #[arg(short = 'q', long)]
    pub queue_capacity: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub harness: HarnessConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Thread topology
#[derive(Debug, Deserialize)]
pub struct HarnessConfig {
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default = "default_pollers")]
    pub pollers: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            mode: default_mode(),
            pollers: default_pollers(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Readiness wait settings
#[derive(Debug, Deserialize)]
pub struct PollerConfig {
    /// Maximum events returned by one wait
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Wait timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Load generator settings
#[derive(Debug, Deserialize)]
pub struct LoadConfig {
    #[serde(default = "default_clients")]
    pub clients: usize,
    #[serde(default = "default_connections")]
    pub connections: usize,
    #[serde(default = "default_messages")]
    pub messages: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            clients: default_clients(),
            connections: default_connections(),
            messages: default_messages(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_transport() -> TransportKind {
    TransportKind::Tcp
}

fn default_mode() -> Mode {
    Mode::Queued
}

fn default_pollers() -> usize {
    1
}

fn default_workers() -> usize {
    3
}

fn default_queue_capacity() -> usize {
    1 << 13
}

fn default_max_events() -> usize {
    128
}

fn default_timeout_ms() -> u64 {
    1
}

fn default_clients() -> usize {
    4
}

fn default_connections() -> usize {
    100
}

fn default_messages() -> usize {
    25_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub transport: TransportKind,
    pub mode: Mode,
    pub pollers: usize,
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_events: usize,
    pub poll_timeout: Duration,
    pub clients: usize,
    pub connections: usize,
    pub messages: usize,
    pub client_timeout: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already-parsed CLI args against the optional TOML file.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            harness,
            poller,
            load,
            logging,
        } = toml_config;

        let config = Config {
            transport: cli.transport.unwrap_or(harness.transport),
            mode: cli.mode.unwrap_or(harness.mode),
            pollers: cli.pollers.unwrap_or(harness.pollers),
            workers: cli.workers.unwrap_or(harness.workers),
            queue_capacity: cli.queue_capacity.unwrap_or(harness.queue_capacity),
            max_events: poller.max_events,
            poll_timeout: Duration::from_millis(poller.timeout_ms),
            clients: cli.clients.unwrap_or(load.clients),
            connections: cli.connections.unwrap_or(load.connections),
            messages: cli.messages.unwrap_or(load.messages),
            client_timeout: Duration::from_millis(load.timeout_ms),
            log_level: cli.log_level.unwrap_or(logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject topologies the runtime cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 || !self.queue_capacity.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "queue capacity {} is not a power of two",
                self.queue_capacity
            )));
        }
        if self.pollers == 0 {
            return Err(ConfigError::Invalid("at least one poller is required".into()));
        }
        if self.clients == 0 {
            return Err(ConfigError::Invalid("at least one client is required".into()));
        }
        if self.max_events == 0 {
            return Err(ConfigError::Invalid("max_events must be non-zero".into()));
        }
        // Every queue needs a consumer or its producers spin forever.
        if self.mode == Mode::Queued && self.workers < self.pollers {
            return Err(ConfigError::Invalid(format!(
                "{} workers cannot cover {} poller queues",
                self.workers, self.pollers
            )));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}
