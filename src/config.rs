//! Configuration module for the policy server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocol::MAX_REQUEST_LEN;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the policy server
#[derive(Parser, Debug, Default)]
#[command(name = "policyd")]
#[command(author = "policyd authors")]
#[command(version = "0.1.0")]
#[command(about = "A cross-domain socket policy server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:843)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Read and write timeout per connection, in seconds
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    /// Maximum number of connections handled at once
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Request buffer size in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Maximum number of idle buffers kept for reuse
    #[arg(long)]
    pub pool_size: Option<usize>,

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
    pub pool: PoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Per-phase I/O timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            timeout: default_timeout(),
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            workers: None,
        }
    }
}

/// Buffer pool configuration
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    /// Size of each request buffer
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Maximum idle buffers retained (0 disables reuse)
    #[serde(default = "default_pool_capacity")]
    pub capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            capacity: default_pool_capacity(),
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

fn default_listen() -> String {
    "0.0.0.0:843".to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_max_connections() -> usize {
    10000
}

fn default_backlog() -> i32 {
    1024
}

fn default_buffer_size() -> usize {
    32 // fits the policy file request with room to spare
}

fn default_pool_capacity() -> usize {
    16384 // 512 KiB of idle buffers at the default buffer size
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub timeout: Duration,
    pub max_connections: usize,
    pub backlog: i32,
    pub workers: Option<usize>,
    pub buffer_size: usize,
    pub pool_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::merge(CliArgs::default(), TomlConfig::default())
    }
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

        let config = Config::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args over TOML values (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            timeout: Duration::from_secs(cli.timeout.unwrap_or(toml_config.server.timeout)),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            backlog: toml_config.server.backlog,
            workers: cli.workers.or(toml_config.server.workers),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.pool.buffer_size),
            pool_size: cli.pool_size.unwrap_or(toml_config.pool.capacity),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size < MAX_REQUEST_LEN {
            return Err(ConfigError::Invalid(format!(
                "buffer size {} is smaller than the longest request ({} bytes)",
                self.buffer_size, MAX_REQUEST_LEN
            )));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid("timeout must be non-zero".to_string()));
        }
        if self.max_connections == 0 || self.max_connections > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max connections must be between 1 and {}",
                u32::MAX
            )));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be non-zero".to_string()));
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
