//! Configuration module for the chat-room server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::codec::Codec;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Payload encoding selectable from the CLI or config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CodecType {
    /// Fixed-layout binary records
    #[default]
    Raw,
    /// JSON objects
    Json,
}

impl From<CodecType> for Codec {
    fn from(codec: CodecType) -> Self {
        match codec {
            CodecType::Raw => Codec::Raw,
            CodecType::Json => Codec::Json,
        }
    }
}

/// Command-line arguments for the chat server
#[derive(Parser, Debug, Default)]
#[command(name = "chat-room")]
#[command(author = "chat-room authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP broadcast chat server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (repeat for several ports)
    #[arg(short, long = "port")]
    pub ports: Vec<u16>,

    /// Listening sockets per port
    #[arg(short = 'n', long = "listeners")]
    pub listeners_per_port: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrent connections (unbounded if unset)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Payload codec
    #[arg(long, value_enum)]
    pub codec: Option<CodecType>,

    /// Rebroadcast frames of unknown type instead of ignoring them
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub relay_unknown: Option<bool>,

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
    pub room: RoomConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Ports to listen on
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
    /// Listening sockets per port
    #[serde(default = "default_listeners_per_port")]
    pub listeners_per_port: usize,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum number of concurrent connections
    pub max_connections: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            ports: default_ports(),
            listeners_per_port: default_listeners_per_port(),
            workers: None,
            max_connections: None,
        }
    }
}

/// Room-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct RoomConfig {
    /// Payload codec
    #[serde(default)]
    pub codec: CodecType,
    /// Rebroadcast frames of unknown type
    #[serde(default)]
    pub relay_unknown: bool,
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_ports() -> Vec<u16> {
    vec![8000]
}

fn default_listeners_per_port() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub ports: Vec<u16>,
    pub listeners_per_port: usize,
    pub workers: Option<usize>,
    pub max_connections: Option<usize>,
    pub codec: CodecType,
    pub relay_unknown: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args over TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            ports: if cli.ports.is_empty() {
                toml_config.server.ports
            } else {
                cli.ports
            },
            listeners_per_port: cli
                .listeners_per_port
                .unwrap_or(toml_config.server.listeners_per_port)
                .max(1),
            workers: cli.workers.or(toml_config.server.workers),
            max_connections: cli.max_connections.or(toml_config.server.max_connections),
            codec: cli.codec.unwrap_or(toml_config.room.codec),
            relay_unknown: cli.relay_unknown.unwrap_or(toml_config.room.relay_unknown),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
}
