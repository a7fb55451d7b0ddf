//! Configuration parsing and management.
//!
//! Parses the TOML configuration file that defines the supervised programs
//! and the supervisor's tuning knobs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Two programs share the same id.
    #[error("duplicate program id {0}")]
    DuplicateId(u32),
}

/// Top-level configuration: program identities plus supervisor tuning.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ManagerConfig {
    /// Supervisor tuning knobs.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Program definitions.
    #[serde(default)]
    pub programs: Vec<Program>,
}

impl ManagerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if two
    /// programs share an id.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a program id is repeated.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::BTreeSet::new();
        for program in &self.programs {
            if !seen.insert(program.id) {
                return Err(ConfigError::DuplicateId(program.id));
            }
        }
        Ok(())
    }

    /// Programs keyed by id, in id order.
    #[must_use]
    pub fn program_map(&self) -> BTreeMap<u32, Program> {
        self.programs.iter().map(|p| (p.id, p.clone())).collect()
    }
}

/// A supervisable program: identity and launch contract.
///
/// Created once at supervisor construction and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    /// Integer id callers use to address this program.
    pub id: u32,

    /// Display name.
    pub name: String,

    /// Working directory the program is launched in.
    pub dir: PathBuf,

    /// Executable entry point; resolved relative to `dir` when relative.
    pub command: PathBuf,

    /// Arguments passed to the entry point.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Program {
    /// The on-disk path of the entry point.
    #[must_use]
    pub fn entry_point(&self) -> PathBuf {
        if self.command.is_absolute() {
            self.command.clone()
        } else {
            self.dir.join(&self.command)
        }
    }
}

/// Supervisor tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Maximum number of buffered log lines per program.
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// How long a graceful stop waits before escalating to a kill.
    #[serde(default = "default_stop_grace")]
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,

    /// Health monitor pass interval.
    #[serde(default = "default_monitor_interval")]
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,

    /// Sleep after a failed health monitor pass.
    #[serde(default = "default_monitor_backoff")]
    #[serde(with = "humantime_serde")]
    pub monitor_backoff: Duration,

    /// Poll interval for attached log streams.
    #[serde(default = "default_stream_poll")]
    #[serde(with = "humantime_serde")]
    pub stream_poll: Duration,

    /// Number of buffered lines replayed when a stream attaches.
    #[serde(default = "default_stream_backlog")]
    pub stream_backlog: usize,
}

const fn default_log_capacity() -> usize {
    1000
}

const fn default_stop_grace() -> Duration {
    Duration::from_secs(5)
}

const fn default_monitor_interval() -> Duration {
    Duration::from_secs(2)
}

const fn default_monitor_backoff() -> Duration {
    Duration::from_secs(5)
}

const fn default_stream_poll() -> Duration {
    Duration::from_millis(500)
}

const fn default_stream_backlog() -> usize {
    50
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            log_capacity: default_log_capacity(),
            stop_grace: default_stop_grace(),
            monitor_interval: default_monitor_interval(),
            monitor_backoff: default_monitor_backoff(),
            stream_poll: default_stream_poll(),
            stream_backlog: default_stream_backlog(),
        }
    }
}
