//! Configuration module for the broadcast server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the broadcast server
#[derive(Parser, Debug)]
#[command(name = "tcp-broadcast")]
#[command(author = "tcp-broadcast authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-protocol broadcast server", long_about = None)]
pub struct CliArgs {
    /// TCP port (1-65535) or Unix domain socket path to listen on
    #[arg(value_name = "PORT|PATH")]
    pub listen: Option<String>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind TCP listeners to
    #[arg(long)]
    pub host: Option<String>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Maximum number of simultaneous clients
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Inbound line buffer size in bytes (longest line is one less)
    #[arg(long)]
    pub max_line_bytes: Option<usize>,

    /// Seconds of silence before a client is probed with `ping`
    #[arg(long)]
    pub ping_after: Option<u64>,

    /// Seconds a probed client has to answer before it is dropped
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Poll granularity in milliseconds
    #[arg(long)]
    pub tick_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Port or socket path
    pub listen: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: None,
            host: default_host(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            tick_ms: default_tick_ms(),
        }
    }
}

/// Line protocol configuration
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

/// Keepalive supervision configuration
#[derive(Debug, Deserialize)]
pub struct KeepaliveConfig {
    /// Idle seconds before probing
    #[serde(default = "default_ping_after")]
    pub ping_after: u64,
    /// Seconds allowed for the probe answer
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_after: default_ping_after(),
            timeout: default_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_backlog() -> i32 {
    16
}

fn default_max_connections() -> usize {
    1024
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_max_line_bytes() -> usize {
    4096
}

fn default_ping_after() -> u64 {
    5
}

fn default_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenTarget {
    /// TCP port, bound on the configured host.
    Tcp(u16),
    /// Unix domain stream socket path.
    Unix(PathBuf),
}

impl ListenTarget {
    /// Anything that is not a port in `1..=65535` is taken as a socket path.
    pub fn parse(value: &str) -> Self {
        match value.parse::<u32>() {
            Ok(port @ 1..=65535) => ListenTarget::Tcp(port as u16),
            _ => ListenTarget::Unix(PathBuf::from(value)),
        }
    }
}

impl fmt::Display for ListenTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenTarget::Tcp(port) => write!(f, "tcp port {port}"),
            ListenTarget::Unix(path) => write!(f, "unix socket {}", path.display()),
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: ListenTarget,
    pub host: String,
    pub backlog: i32,
    pub max_connections: usize,
    pub max_line_bytes: usize,
    pub ping_after: Duration,
    pub timeout: Duration,
    pub tick: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
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
        let listen = cli
            .listen
            .or(toml_config.server.listen)
            .ok_or(ConfigError::MissingListen)?;

        let config = Config {
            listen: ListenTarget::parse(&listen),
            host: cli.host.unwrap_or(toml_config.server.host),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            max_line_bytes: cli
                .max_line_bytes
                .unwrap_or(toml_config.protocol.max_line_bytes),
            ping_after: Duration::from_secs(
                cli.ping_after.unwrap_or(toml_config.keepalive.ping_after),
            ),
            timeout: Duration::from_secs(cli.timeout.unwrap_or(toml_config.keepalive.timeout)),
            tick: Duration::from_millis(cli.tick_ms.unwrap_or(toml_config.server.tick_ms)),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        if self.max_line_bytes < 2 {
            return Err(ConfigError::Invalid("max_line_bytes must be at least 2"));
        }
        if self.ping_after.is_zero() || self.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "ping_after and timeout must be at least 1 second",
            ));
        }
        if self.tick.is_zero() || self.tick > Duration::from_secs(1) {
            return Err(ConfigError::Invalid("tick_ms must be within 1..=1000"));
        }
        if self.backlog < 1 {
            return Err(ConfigError::Invalid("backlog must be at least 1"));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {err}", path = .0.display(), err = .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {err}", path = .0.display(), err = .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("No port or socket path given (usage: tcp-broadcast <port>/<unix-domain-socket>)")]
    MissingListen,
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
