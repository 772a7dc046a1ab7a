//! Configuration of the handle subsystem, parsed from YAML with [serde].
//!
//! This code only checks that the format is correct. Interpreting the values (for example
//! clamping a descriptor limit of zero) is left to the code that consumes them.

use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOptions {
    pub general: GeneralOptions,
    pub descriptors: DescriptorOptions,
}

impl ConfigOptions {
    pub fn from_yaml_str(s: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(s).context("Failed to parse configuration")
    }

    /// Read and parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        Self::from_yaml_str(&contents)
            .with_context(|| format!("Invalid configuration file {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneralOptions {
    /// Log level of output written on stdout
    pub log_level: LogLevel,

    /// Also write error-level log lines to stderr
    pub log_errors_to_stderr: bool,
}

impl Default for GeneralOptions {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_errors_to_stderr: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DescriptorOptions {
    /// Number of descriptor slots a new table starts with
    pub initial_size: u32,

    /// Descriptors at or above this limit are never handed out
    pub max_fds: u32,
}

impl Default for DescriptorOptions {
    fn default() -> Self {
        Self {
            initial_size: 32,
            max_fds: 1024,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = serde_yaml::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(s)
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        log::Level::from(level).to_level_filter()
    }
}
