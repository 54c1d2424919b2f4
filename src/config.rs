//! Configuration module for the hashjam server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "hashjam")]
#[command(author = "hashjam authors")]
#[command(version = "0.1.0")]
#[command(about = "A reactor-style TCP server for iterated hash requests", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8888)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of acceptor threads sharing the listen port
    #[arg(short = 'a', long)]
    pub acceptors: Option<usize>,

    /// Number of worker event loops (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrently open connections
    #[arg(short = 'c', long)]
    pub max_connections: Option<usize>,

    /// Number of business threads (defaults to number of CPU cores)
    #[arg(short = 'b', long)]
    pub business_threads: Option<usize>,

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
    pub business: BusinessConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of acceptor threads
    #[serde(default = "default_acceptors")]
    pub acceptors: usize,
    /// Number of worker event loops
    pub workers: Option<usize>,
    /// Connection admission ceiling
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            acceptors: default_acceptors(),
            workers: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Business executor configuration
#[derive(Debug, Deserialize)]
pub struct BusinessConfig {
    /// Number of business threads
    pub threads: Option<usize>,
    /// Bounded work-queue depth
    #[serde(default = "default_business_queue")]
    pub queue_depth: usize,
}

impl Default for BusinessConfig {
    fn default() -> Self {
        Self {
            threads: None,
            queue_depth: default_business_queue(),
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
    "127.0.0.1:8888".to_string()
}

fn default_acceptors() -> usize {
    2
}

fn default_max_connections() -> usize {
    30000
}

fn default_business_queue() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub acceptors: usize,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub business_threads: Option<usize>,
    pub business_queue: usize,
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

    /// Merge CLI args with TOML config (CLI takes precedence).
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Config {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            acceptors: cli.acceptors.unwrap_or(toml_config.server.acceptors),
            workers: cli.workers.or(toml_config.server.workers),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            business_threads: cli.business_threads.or(toml_config.business.threads),
            business_queue: toml_config.business.queue_depth,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}
