//! Configuration for the echo benchmark server.
//!
//! Supports command-line arguments and an optional TOML configuration
//! file. CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

/// I/O engine selected with `-m`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Edge-triggered readiness notification via epoll.
    Epoll,
    /// Single-shot io_uring submissions.
    Uring,
    /// Multishot io_uring with a provided buffer ring.
    Multishot,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Epoll => "epoll",
            Mode::Uring => "uring",
            Mode::Multishot => "multishot",
        };
        f.write_str(name)
    }
}

/// Command-line arguments for the benchmark server
#[derive(Parser, Debug)]
#[command(name = "echo-bench")]
#[command(version = "0.1.0")]
#[command(about = "TCP echo benchmark server with selectable I/O engines", long_about = None)]
pub struct CliArgs {
    /// I/O engine to benchmark
    #[arg(short = 'm', long = "mode", value_enum)]
    pub mode: Option<Mode>,

    /// TCP port to listen on
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

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
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// TCP port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// I/O engine
    pub mode: Option<Mode>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            mode: None,
        }
    }
}

/// Engine tuning knobs
#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// Submission/completion queue depth
    #[serde(default = "default_ring_size")]
    pub ring_size: u32,
    /// Size of each receive buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Provided-buffer pool size (multishot engine); must be a power of two
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ring_size: default_ring_size(),
            buffer_size: default_buffer_size(),
            buffer_count: default_buffer_count(),
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

fn default_port() -> u16 {
    9999
}

fn default_ring_size() -> u32 {
    256
}

fn default_buffer_size() -> usize {
    4096
}

fn default_buffer_count() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub port: u16,
    pub ring_size: u32,
    pub buffer_size: usize,
    pub buffer_count: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            mode: cli
                .mode
                .or(toml_config.server.mode)
                .unwrap_or(Mode::Epoll),
            port: cli.port.unwrap_or(toml_config.server.port),
            ring_size: toml_config.engine.ring_size,
            buffer_size: toml_config.engine.buffer_size,
            buffer_count: toml_config.engine.buffer_count,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        if !config.buffer_count.is_power_of_two() {
            return Err(ConfigError::BufferCount(config.buffer_count));
        }

        Ok(config)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    BufferCount(usize),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::BufferCount(n) => {
                write!(f, "buffer_count must be a power of two, got {n}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(args: &[&str]) -> Result<Config, ConfigError> {
        Config::resolve(CliArgs::try_parse_from(args).unwrap())
    }

    #[test]
    fn default_config() {
        let config = resolve(&["echo-bench"]).unwrap();
        assert_eq!(config.mode, Mode::Epoll);
        assert_eq!(config.port, 9999);
        assert_eq!(config.ring_size, 256);
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.buffer_count, 256);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn cli_selects_engine_and_port() {
        let config = resolve(&["echo-bench", "-m", "multishot", "-p", "19993"]).unwrap();
        assert_eq!(config.mode, Mode::Multishot);
        assert_eq!(config.port, 19993);
    }

    #[test]
    fn unknown_engine_is_rejected() {
        assert!(CliArgs::try_parse_from(["echo-bench", "-m", "kqueue"]).is_err());
    }

    #[test]
    fn toml_parsing() {
        let toml_str = r#"
            [server]
            port = 7777
            mode = "uring"

            [engine]
            ring_size = 512
            buffer_size = 8192
            buffer_count = 128

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 7777);
        assert_eq!(config.server.mode, Some(Mode::Uring));
        assert_eq!(config.engine.ring_size, 512);
        assert_eq!(config.engine.buffer_size, 8192);
        assert_eq!(config.engine.buffer_count, 128);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn buffer_count_must_be_power_of_two() {
        let path = std::env::temp_dir().join("echo-bench-test-config.toml");
        std::fs::write(&path, "[engine]\nbuffer_count = 300\n").unwrap();
        let cli = CliArgs::try_parse_from(["echo-bench", "-c", path.to_str().unwrap()]).unwrap();
        let err = Config::resolve(cli).unwrap_err();
        assert!(matches!(err, ConfigError::BufferCount(300)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn mode_names_round_trip() {
        assert_eq!(Mode::Epoll.to_string(), "epoll");
        assert_eq!(Mode::Uring.to_string(), "uring");
        assert_eq!(Mode::Multishot.to_string(), "multishot");
    }
}
