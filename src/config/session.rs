//! Session configuration
//!
//! Describes which command the bridge runs and where the transport listens.
//! Can be built in code or loaded from a TOML file.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default command spawned on the first connect
pub const DEFAULT_COMMAND: &str = "bash";

/// Default bind host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Errors that can occur while building or loading a session config
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid command arguments: {0}")]
    InvalidArgs(String),
}

/// Configuration for a bridge and the child process it owns
///
/// Immutable once handed to a [`crate::bridge::SessionBridge`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Program name, resolved through `PATH`
    pub command: String,
    /// Arguments passed to `command`
    pub args: Vec<String>,
    /// Host the transport binds to
    pub host: String,
    /// Port the transport binds to (0 = OS-assigned)
    pub port: u16,
    /// Working directory for the child, inherited when unset
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables for the child
    pub env: HashMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_COMMAND.to_string(),
            args: Vec::new(),
            host: DEFAULT_HOST.to_string(),
            port: 0,
            working_dir: None,
            env: HashMap::new(),
        }
    }
}

impl SessionConfig {
    /// Create a config running `command` with defaults for everything else
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Set the arguments from an already split list
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set the arguments by shell-splitting a single raw string
    ///
    /// Quotes and backslash escapes follow POSIX shell rules. An unmatched
    /// quote is rejected.
    pub fn with_args_str(mut self, raw: &str) -> Result<Self, ConfigError> {
        self.args = split_args(raw)?;
        Ok(self)
    }

    /// Set the bind host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the bind port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the child's working directory
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable for the child
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Load a config from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        file.into_config()
    }
}

/// On-disk form of [`SessionConfig`]; `args` is kept as the raw string
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    command: Option<String>,
    args: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    working_dir: Option<PathBuf>,
    env: HashMap<String, String>,
}

impl ConfigFile {
    fn into_config(self) -> Result<SessionConfig, ConfigError> {
        let defaults = SessionConfig::default();
        let args = match self.args {
            Some(raw) => split_args(&raw)?,
            None => Vec::new(),
        };

        Ok(SessionConfig {
            command: self.command.unwrap_or(defaults.command),
            args,
            host: self.host.unwrap_or(defaults.host),
            port: self.port.unwrap_or(defaults.port),
            working_dir: self.working_dir,
            env: self.env,
        })
    }
}

/// Split a raw argument string the way a POSIX shell would
pub fn split_args(raw: &str) -> Result<Vec<String>, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    shell_words::split(raw).map_err(|e| ConfigError::InvalidArgs(format!("{e} in {raw:?}")))
}
