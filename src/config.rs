//! Configuration module for the echo harness.
//!
//! The program under test and the memcheck/injection switches come from
//! positional command-line arguments. Defaults for the memcheck wrapper,
//! the injected library's controls and logging can be kept in a TOML file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// Highest level `MOCKEAGAIN_VERBOSE` understands (a single digit).
pub const MAX_VERBOSE_LEVEL: u8 = 9;

/// Command-line arguments for the harness
#[derive(Parser, Debug)]
#[command(name = "echo-harness")]
#[command(author = "echo-harness authors")]
#[command(version = "0.1.0")]
#[command(
    about = "Run a client program against a loopback TCP echo server",
    long_about = None
)]
pub struct CliArgs {
    /// Program to launch; it receives `<host> <port>` as its arguments
    pub program: PathBuf,

    /// "1" runs the program under the memcheck tool, anything else runs it directly
    pub use_memcheck: String,

    /// Shared library to preload into the program (fault injection)
    pub inject_library: Option<PathBuf>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Memory checker executable used when USE_MEMCHECK is "1"
    #[arg(long)]
    pub memcheck_tool: Option<String>,

    /// Verbosity of the injected library (0-9)
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=9))]
    pub verbose: Option<u8>,

    /// Which operations the injected library should mock
    #[arg(short, long, value_enum)]
    pub mock: Option<MockMode>,

    /// Write timeout pattern handed to the injected library
    #[arg(long)]
    pub write_timeout_pattern: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Operations the injected library turns into `EAGAIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MockMode {
    Reads,
    Writes,
    Both,
}

impl MockMode {
    /// Value of the `MOCKEAGAIN` variable for this mode.
    pub fn env_value(self) -> &'static str {
        match self {
            MockMode::Reads => "r",
            MockMode::Writes => "w",
            MockMode::Both => "rw",
        }
    }
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub memcheck: MemcheckConfig,
    #[serde(default)]
    pub injection: InjectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Memory checker configuration
#[derive(Debug, Deserialize)]
pub struct MemcheckConfig {
    /// Executable that wraps the program
    #[serde(default = "default_memcheck_tool")]
    pub tool: String,
    /// Arguments placed between the tool and the program
    #[serde(default = "default_memcheck_args")]
    pub args: Vec<String>,
}

impl Default for MemcheckConfig {
    fn default() -> Self {
        Self {
            tool: default_memcheck_tool(),
            args: default_memcheck_args(),
        }
    }
}

/// Defaults for the injected library's controls
#[derive(Debug, Deserialize)]
pub struct InjectionConfig {
    #[serde(default = "default_verbose")]
    pub verbose: u8,
    pub mock: Option<MockMode>,
    pub write_timeout_pattern: Option<String>,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            verbose: default_verbose(),
            mock: None,
            write_timeout_pattern: None,
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

fn default_memcheck_tool() -> String {
    "valgrind".to_string()
}

fn default_memcheck_args() -> Vec<String> {
    vec!["--leak-check=full".to_string()]
}

fn default_verbose() -> u8 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Memory checker the program is launched under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memcheck {
    pub tool: String,
    pub args: Vec<String>,
}

/// Library injected into the program and the controls it reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Injection {
    pub library: PathBuf,
    pub verbose: u8,
    pub mock: Option<MockMode>,
    pub write_timeout_pattern: Option<String>,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub program: PathBuf,
    pub memcheck: Option<Memcheck>,
    pub injection: Option<Injection>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve parsed CLI arguments against the optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        if toml_config.injection.verbose > MAX_VERBOSE_LEVEL {
            return Err(ConfigError::Invalid(format!(
                "injection.verbose must be between 0 and {MAX_VERBOSE_LEVEL}, got {}",
                toml_config.injection.verbose
            )));
        }

        // Library controls given on the command line are useless without a library
        if cli.inject_library.is_none() {
            let stray = [
                ("--verbose", cli.verbose.is_some()),
                ("--mock", cli.mock.is_some()),
                ("--write-timeout-pattern", cli.write_timeout_pattern.is_some()),
            ]
            .into_iter()
            .find(|(_, given)| *given);
            if let Some((flag, _)) = stray {
                return Err(ConfigError::Invalid(format!(
                    "{flag} requires an injection library"
                )));
            }
        }

        let memcheck = if cli.use_memcheck == "1" {
            let tool = cli.memcheck_tool.unwrap_or(toml_config.memcheck.tool);
            if tool.is_empty() {
                return Err(ConfigError::Invalid(
                    "memcheck tool must not be empty".to_string(),
                ));
            }
            Some(Memcheck {
                tool,
                args: toml_config.memcheck.args,
            })
        } else {
            None
        };

        let injection = cli.inject_library.map(|library| Injection {
            library,
            verbose: cli.verbose.unwrap_or(toml_config.injection.verbose),
            mock: cli.mock.or(toml_config.injection.mock),
            write_timeout_pattern: cli
                .write_timeout_pattern
                .or(toml_config.injection.write_timeout_pattern)
                .filter(|pattern| !pattern.is_empty()),
        });

        Ok(Config {
            program: cli.program,
            memcheck,
            injection,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
