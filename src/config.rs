//! Configuration module for the recast server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocol::Framing;
use crate::transform::{OptionsError, TransformOptions};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// What to do with a connection that arrives while every slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Stop accepting until a slot frees up.
    #[default]
    Wait,
    /// Accept, answer `SERVER_ERROR overloaded` and close.
    Reject,
}

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "recast")]
#[command(version)]
#[command(about = "A small concurrent text transformation server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7878)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of connections handled at once
    #[arg(short = 'n', long)]
    pub max_connections: Option<usize>,

    /// Behaviour when all connection slots are taken
    #[arg(long, value_enum)]
    pub admission: Option<AdmissionPolicy>,

    /// Request read budget in milliseconds (0 = no timeout)
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    /// Response write budget in milliseconds (0 = no timeout)
    #[arg(long)]
    pub write_timeout_ms: Option<u64>,

    /// Request framing on the wire
    #[arg(long, value_enum)]
    pub framing: Option<Framing>,

    /// Transformers to apply, in order (repeatable)
    #[arg(short = 't', long = "transformer")]
    pub transformers: Vec<String>,

    /// Prefix every response with a style annotation
    #[arg(long)]
    pub annotate: bool,

    /// Label used by --annotate
    #[arg(long)]
    pub style_hint: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and dispatcher configuration
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub admission: AdmissionPolicy,
    /// Pending connection queue length passed to listen(2)
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Grace period for in-flight handlers at shutdown
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            admission: AdmissionPolicy::default(),
            backlog: default_backlog(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            workers: None,
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    #[serde(default = "default_io_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    #[serde(default)]
    pub framing: Framing,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_io_timeout_ms(),
            write_timeout_ms: default_io_timeout_ms(),
            max_request_size: default_max_request_size(),
            framing: Framing::default(),
        }
    }
}

/// Transformer selection and options
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformConfig {
    #[serde(default = "default_pipeline")]
    pub pipeline: Vec<String>,
    #[serde(default)]
    pub annotate: bool,
    pub style_hint: Option<String>,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            pipeline: default_pipeline(),
            annotate: false,
            style_hint: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
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
    "127.0.0.1:7878".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_backlog() -> i32 {
    1024
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_io_timeout_ms() -> u64 {
    5_000
}

fn default_max_request_size() -> usize {
    1024 * 1024 // 1 MB
}

fn default_pipeline() -> Vec<String> {
    vec!["identity".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub max_connections: usize,
    pub admission: AdmissionPolicy,
    pub backlog: i32,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub max_request_size: usize,
    pub framing: Framing,
    pub transformers: Vec<String>,
    pub transform_options: TransformOptions,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            admission: AdmissionPolicy::default(),
            backlog: default_backlog(),
            read_timeout_ms: default_io_timeout_ms(),
            write_timeout_ms: default_io_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            max_request_size: default_max_request_size(),
            framing: Framing::default(),
            transformers: default_pipeline(),
            transform_options: TransformOptions::default(),
            workers: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
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
        let transformers = if cli.transformers.is_empty() {
            toml_config.transform.pipeline
        } else {
            cli.transformers
        };

        let transform_options = TransformOptions::new(
            cli.annotate || toml_config.transform.annotate,
            cli.style_hint.or(toml_config.transform.style_hint),
        )?;

        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            admission: cli.admission.unwrap_or(toml_config.server.admission),
            backlog: toml_config.server.backlog,
            read_timeout_ms: cli
                .read_timeout_ms
                .unwrap_or(toml_config.connection.read_timeout_ms),
            write_timeout_ms: cli
                .write_timeout_ms
                .unwrap_or(toml_config.connection.write_timeout_ms),
            shutdown_timeout_ms: toml_config.server.shutdown_timeout_ms,
            max_request_size: toml_config.connection.max_request_size,
            framing: cli.framing.unwrap_or(toml_config.connection.framing),
            transformers,
            transform_options,
            workers: cli.workers.or(toml_config.server.workers),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be positive".into()));
        }
        if self.max_request_size == 0 {
            return Err(ConfigError::Invalid("max_request_size must be positive".into()));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be positive".into()));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be positive".into()));
        }
        if self.transformers.is_empty() {
            return Err(ConfigError::Invalid("at least one transformer is required".into()));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid transform options: {0}")]
    Options(#[from] OptionsError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:7878");
        assert_eq!(config.server.max_connections, 1024);
        assert_eq!(config.server.admission, AdmissionPolicy::Wait);
        assert_eq!(config.connection.read_timeout_ms, 5_000);
        assert_eq!(config.connection.framing, Framing::Length);
        assert_eq!(config.transform.pipeline, vec!["identity"]);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            max_connections = 8
            admission = "reject"
            shutdown_timeout_ms = 250
            workers = 4

            [connection]
            read_timeout_ms = 0
            write_timeout_ms = 1500
            max_request_size = 4096
            framing = "line"

            [transform]
            pipeline = ["trim", "uppercase"]
            annotate = true
            style_hint = "loud"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.max_connections, 8);
        assert_eq!(config.server.admission, AdmissionPolicy::Reject);
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.connection.read_timeout_ms, 0);
        assert_eq!(config.connection.framing, Framing::Line);
        assert_eq!(config.transform.pipeline, vec!["trim", "uppercase"]);
        assert_eq!(config.logging.level, "debug");

        let config = Config::merge(CliArgs::default(), config).unwrap();
        assert_eq!(config.shutdown_timeout_ms, 250);
        assert_eq!(config.max_request_size, 4096);
        assert!(config.transform_options.annotate());
        assert_eq!(config.transform_options.style_hint(), Some("loud"));
    }

    #[test]
    fn test_unknown_option_rejected() {
        let toml_str = r#"
            [transform]
            colour = "blue"
        "#;
        assert!(toml::from_str::<TomlConfig>(toml_str).is_err());
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        let merged = Config::merge(CliArgs::default(), TomlConfig::default()).unwrap();
        assert_eq!(merged.listen, config.listen);
        assert_eq!(merged.transformers, config.transformers);
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"
            max_connections = 8

            [transform]
            pipeline = ["uppercase"]
            "#,
        )
        .unwrap();

        let cli = CliArgs {
            listen: Some("127.0.0.1:1".to_string()),
            transformers: vec!["lowercase".to_string()],
            read_timeout_ms: Some(10),
            ..CliArgs::default()
        };

        let config = Config::merge(cli, file).unwrap();
        assert_eq!(config.listen, "127.0.0.1:1");
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.transformers, vec!["lowercase"]);
        assert_eq!(config.read_timeout_ms, 10);
    }

    #[test]
    fn test_validation() {
        let cli = CliArgs {
            max_connections: Some(0),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::merge(cli, TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));

        let cli = CliArgs {
            style_hint: Some("no spaces".to_string()),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::merge(cli, TomlConfig::default()),
            Err(ConfigError::Options(OptionsError::InvalidStyleHint(' ')))
        ));
    }

    #[test]
    fn test_missing_file() {
        let cli = CliArgs {
            config: Some(PathBuf::from("/nonexistent/recast.toml")),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::FileRead(_, _))
        ));
    }

    #[test]
    fn test_cli_parsing() {
        let cli = CliArgs::try_parse_from([
            "recast",
            "-l",
            "127.0.0.1:0",
            "--admission",
            "reject",
            "--framing",
            "line",
            "-t",
            "trim",
            "-t",
            "uppercase",
            "--annotate",
        ])
        .unwrap();
        assert_eq!(cli.admission, Some(AdmissionPolicy::Reject));
        assert_eq!(cli.framing, Some(Framing::Line));
        assert_eq!(cli.transformers, vec!["trim", "uppercase"]);
        assert!(cli.annotate);
    }
}
