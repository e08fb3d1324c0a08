//! Recorder configuration
//!
//! Loaded from a JSON file. Only `criteria` and `target` are required.

use crate::device::CriteriaSet;
use crate::port::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "practice-recorder.json";
pub const DEFAULT_SESSION_FILE: &str = "practice_sessions.json";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// An external program and its arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// The capture command: `<program> <extra_args..> <port_flag> <port> <output>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureCommandSpec {
    pub program: String,
    pub port_flag: String,
    pub extra_args: Vec<String>,
}

impl Default for CaptureCommandSpec {
    fn default() -> Self {
        Self {
            program: "arecordmidi".to_string(),
            port_flag: "-p".to_string(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 2000,
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        RetryPolicy {
            attempts: config.attempts,
            delay: Duration::from_millis(config.delay_ms),
        }
    }
}

fn default_session_file() -> PathBuf {
    PathBuf::from(DEFAULT_SESSION_FILE)
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_enumerate_command() -> CommandSpec {
    CommandSpec::new("arecordmidi", ["-l"])
}

fn default_startup_grace_ms() -> u64 {
    500
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// udev property sets identifying the instrument
    pub criteria: CriteriaSet,

    /// Port name to look for in the port listing
    pub target: String,

    #[serde(default = "default_session_file")]
    pub session_file: PathBuf,

    /// Directory where captured MIDI files are written
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_enumerate_command")]
    pub enumerate_command: CommandSpec,

    #[serde(default)]
    pub capture_command: CaptureCommandSpec,

    #[serde(default)]
    pub retry: RetryConfig,

    /// How long a fresh capture process must survive to count as started
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
}

impl Config {
    pub fn new(criteria: CriteriaSet, target: impl Into<String>) -> Self {
        Self {
            criteria,
            target: target.into(),
            session_file: default_session_file(),
            output_dir: default_output_dir(),
            enumerate_command: default_enumerate_command(),
            capture_command: CaptureCommandSpec::default(),
            retry: RetryConfig::default(),
            startup_grace_ms: default_startup_grace_ms(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.criteria.is_empty() {
            return Err(ConfigError::Invalid("'criteria' must list at least one device".to_string()));
        }
        if self.criteria.iter().any(|c| c.is_empty()) {
            return Err(ConfigError::Invalid("a criterion must name at least one attribute".to_string()));
        }
        if self.target.trim().is_empty() {
            return Err(ConfigError::Invalid("'target' must not be empty".to_string()));
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::Invalid("'retry.attempts' must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.into()
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}
