//! Configuration loading and typed config structures for Driftline.
//!
//! The canonical configuration lives in `driftline-config.yaml` next to the
//! server binary. This module defines strongly-typed structs that mirror the
//! YAML structure, and provides a loader that reads and validates the file.
//! Every field has a default, so an empty file (or no file) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level Driftline configuration.
///
/// Mirrors the structure of `driftline-config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DriftlineConfig {
    /// Stepping engine policy (timeouts, aggregation block).
    #[serde(default)]
    pub engine: EngineConfig,

    /// Where session artifacts and scratch output live.
    #[serde(default)]
    pub storage: StorageConfig,

    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerSettings,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Parameters of the built-in stub model served to new sessions.
    #[serde(default)]
    pub stub_model: StubModelConfig,
}

impl DriftlineConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override YAML values:
    /// - `DRIFTLINE_SESSION_ROOT` overrides `storage.session_root`
    /// - `DRIFTLINE_PORT` overrides `server.port`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Override selected values with environment variables when set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("DRIFTLINE_SESSION_ROOT") {
            self.storage.session_root = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("DRIFTLINE_PORT") {
            match val.parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(e) => tracing::warn!(value = %val, error = %e, "ignoring invalid DRIFTLINE_PORT"),
            }
        }
    }
}

/// Stepping engine policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// How long a prepared run waits for the client's first acknowledgement.
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,

    /// How long a run may sit idle between steps before it is cancelled.
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,

    /// Pause at the end of every step iteration, giving other sessions a turn.
    #[serde(default = "default_yield_interval_ms")]
    pub yield_interval_ms: u64,

    /// Name of the output block that carries uncertainty bounds.
    #[serde(default = "default_uncertainty_block")]
    pub uncertainty_block: String,

    /// Append the full error source chain to `runtimeError` messages.
    #[serde(default)]
    pub develop_mode: bool,
}

impl EngineConfig {
    /// Start barrier timeout as a [`Duration`].
    pub const fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    /// Per-step idle ceiling as a [`Duration`].
    pub const fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    /// End-of-iteration yield as a [`Duration`].
    pub const fn yield_interval(&self) -> Duration {
        Duration::from_millis(self.yield_interval_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: default_start_timeout_ms(),
            step_timeout_ms: default_step_timeout_ms(),
            yield_interval_ms: default_yield_interval_ms(),
            uncertainty_block: default_uncertainty_block(),
            develop_mode: false,
        }
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageConfig {
    /// Root under which each session gets its persistent directory.
    #[serde(default = "default_session_root")]
    pub session_root: PathBuf,

    /// Where export scratch directories are created (system temp dir if unset).
    #[serde(default)]
    pub scratch_root: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            session_root: default_session_root(),
            scratch_root: None,
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerSettings {
    /// The host address to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// The TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Parameters of the built-in stub model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StubModelConfig {
    /// Number of steps before the model is exhausted.
    #[serde(default = "default_stub_steps")]
    pub steps: u32,

    /// Floating mass at time zero.
    #[serde(default = "default_initial_mass")]
    pub initial_mass: f64,

    /// Fraction of floating mass lost per step.
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,

    /// Seconds of model time covered by one step.
    #[serde(default = "default_time_step_secs")]
    pub time_step_secs: u32,

    /// Number of uncertainty workers (0 disables uncertainty).
    #[serde(default)]
    pub uncertainty_workers: u32,

    /// Relative perturbation of the decay rate between workers.
    #[serde(default = "default_uncertainty_spread")]
    pub uncertainty_spread: f64,
}

impl Default for StubModelConfig {
    fn default() -> Self {
        Self {
            steps: default_stub_steps(),
            initial_mass: default_initial_mass(),
            decay_rate: default_decay_rate(),
            time_step_secs: default_time_step_secs(),
            uncertainty_workers: 0,
            uncertainty_spread: default_uncertainty_spread(),
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

const fn default_start_timeout_ms() -> u64 {
    16_000
}

const fn default_step_timeout_ms() -> u64 {
    6_000_000
}

const fn default_yield_interval_ms() -> u64 {
    1
}

fn default_uncertainty_block() -> String {
    String::from("WeatheringOutput")
}

fn default_session_root() -> PathBuf {
    PathBuf::from("./sessions")
}

fn default_host() -> String {
    String::from("0.0.0.0")
}

const fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    String::from("info")
}

const fn default_stub_steps() -> u32 {
    96
}

const fn default_initial_mass() -> f64 {
    1000.0
}

const fn default_decay_rate() -> f64 {
    0.02
}

const fn default_time_step_secs() -> u32 {
    900
}

const fn default_uncertainty_spread() -> f64 {
    0.25
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_reference_policy() {
        let config = DriftlineConfig::default();
        assert_eq!(config.engine.start_timeout(), Duration::from_secs(16));
        assert_eq!(config.engine.step_timeout(), Duration::from_secs(6000));
        assert_eq!(config.engine.uncertainty_block, "WeatheringOutput");
        assert!(!config.engine.develop_mode);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.stub_model.uncertainty_workers, 0);
    }

    #[test]
    fn empty_yaml_is_default() {
        let config = DriftlineConfig::parse("").ok();
        assert_eq!(config.map(|c| c.engine), Some(EngineConfig::default()));
    }

    #[test]
    fn parse_partial_yaml() {
        let yaml = r"
engine:
  start_timeout_ms: 250
  develop_mode: true
storage:
  scratch_root: /tmp/driftline-scratch
stub_model:
  steps: 4
  uncertainty_workers: 3
";
        let config = DriftlineConfig::parse(yaml).unwrap();
        assert_eq!(config.engine.start_timeout_ms, 250);
        assert!(config.engine.develop_mode);
        assert_eq!(config.engine.step_timeout_ms, 6_000_000);
        assert_eq!(
            config.storage.scratch_root,
            Some(PathBuf::from("/tmp/driftline-scratch"))
        );
        assert_eq!(config.stub_model.steps, 4);
        assert_eq!(config.stub_model.uncertainty_workers, 3);
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let result = DriftlineConfig::parse("engine: [unclosed");
        assert!(matches!(result, Err(ConfigError::Yaml { .. })));
    }
}
