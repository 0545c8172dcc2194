//! Configuration module for the ev-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "ev-echo")]
#[command(author = "ev-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded TCP echo server", long_about = None)]
pub struct CliArgs {
    /// TCP port to listen on (default 1025)
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<IpAddr>,

    /// Maximum number of pending connections
    #[arg(short = 'b', long)]
    pub backlog: Option<u32>,

    /// Per-connection buffer size in bytes
    #[arg(short = 's', long)]
    pub buffer_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Readiness events handled per poll
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Fixed capacity of each connection's echo buffer
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Disable Nagle's algorithm
    #[serde(default = "default_true")]
    pub nodelay: bool,
    /// Request immediate ACKs (Linux only)
    #[serde(default = "default_true")]
    pub quickack: bool,
    /// Buffer-sized read/echo rounds per readiness event before yielding
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            nodelay: true,
            quickack: true,
            max_rounds: default_max_rounds(),
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

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    1025
}

fn default_backlog() -> u32 {
    64
}

fn default_events_capacity() -> usize {
    1024
}

fn default_buffer_size() -> usize {
    256
}

fn default_max_rounds() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub backlog: u32,
    pub events_capacity: usize,
    pub buffer_size: usize,
    pub nodelay: bool,
    pub quickack: bool,
    pub max_rounds: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            events_capacity: default_events_capacity(),
            buffer_size: default_buffer_size(),
            nodelay: true,
            quickack: true,
            max_rounds: default_max_rounds(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve already-parsed CLI arguments against the TOML file they name.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        // Merge CLI args with TOML config (CLI takes precedence)
        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            events_capacity: toml_config.server.events_capacity,
            buffer_size: cli
                .buffer_size
                .unwrap_or(toml_config.connection.buffer_size),
            nodelay: toml_config.connection.nodelay,
            quickack: toml_config.connection.quickack,
            max_rounds: toml_config.connection.max_rounds,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot start with.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port", "must be between 1 and 65535"));
        }
        if self.backlog == 0 {
            return Err(ConfigError::Invalid("backlog", "must be greater than 0"));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size", "must be greater than 0"));
        }
        if self.max_rounds == 0 {
            return Err(ConfigError::Invalid("max_rounds", "must be greater than 0"));
        }
        if self.events_capacity == 0 {
            return Err(ConfigError::Invalid("events_capacity", "must be greater than 0"));
        }
        Ok(())
    }

    /// Socket address the listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str, &'static str),
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
            ConfigError::Invalid(field, reason) => {
                write!(f, "Invalid configuration value '{}': {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
