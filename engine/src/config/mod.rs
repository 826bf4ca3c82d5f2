//! Configuration management
//!
//! This module handles loading and validation of the Taskmesh runtime
//! configuration. Configuration is stored in TOML format; every field
//! has a default matching the runtime's built-in constants, so an empty
//! file (or no file at all) yields a working configuration.
//!
//! # Configuration Sections
//!
//! - **coordinator**: polling cadence, staleness and error thresholds,
//!   task timeout, retention cap, and the task routing table
//! - **buffer**: experience buffer capacity and reward defaults
//! - **training**: cycle interval, minimum buffer size, batch size
//! - **telemetry**: log level and output format
//!
//! # Examples
//!
//! ```no_run
//! use taskmesh_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load("taskmesh.toml")?;
//! println!("poll every {:?}", config.coordinator.poll_interval());
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use sdk::errors::{MeshError, MeshResult};
use sdk::types::{AgentId, TaskKind};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Task coordinator settings
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Experience buffer settings
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Training cycle settings
    #[serde(default)]
    pub training: TrainingConfig,

    /// Logging settings
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Settings for the task coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Seconds between health-poll / queue-sweep iterations
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Seconds without a worker update before it is considered stale
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Error count above which a worker is Unhealthy
    #[serde(default = "default_max_worker_errors")]
    pub max_worker_errors: usize,

    /// Seconds an InProgress task may run before the sweep delegates it
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Maximum number of tasks retained before pruning
    #[serde(default = "default_task_retention")]
    pub task_retention: usize,

    /// Fixed routing table: task kind to responsible worker
    #[serde(default = "default_routing")]
    pub routing: HashMap<TaskKind, AgentId>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            max_worker_errors: default_max_worker_errors(),
            task_timeout_secs: default_task_timeout_secs(),
            task_retention: default_task_retention(),
            routing: default_routing(),
        }
    }
}

impl CoordinatorConfig {
    /// Poll cadence as a std Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Staleness threshold as a chrono Duration
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }

    /// Task timeout as a chrono Duration
    pub fn task_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.task_timeout_secs as i64)
    }
}

/// Settings for the experience buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Maximum number of retained experience entries
    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,

    /// Priority assigned when an entry does not specify one
    #[serde(default = "default_experience_priority")]
    pub default_priority: f64,

    /// Reward recorded for a failed task
    #[serde(default = "default_failure_reward")]
    pub failure_reward: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_buffer_capacity(),
            default_priority: default_experience_priority(),
            failure_reward: default_failure_reward(),
        }
    }
}

/// Settings for the training cycle controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Seconds between automated training cycles
    #[serde(default = "default_training_interval_secs")]
    pub interval_secs: u64,

    /// Minimum buffer size before a cycle will run
    #[serde(default = "default_min_buffer_size")]
    pub min_buffer_size: usize,

    /// Number of experiences sampled per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of cycle results retained for inspection
    #[serde(default = "default_result_history")]
    pub result_history: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_training_interval_secs(),
            min_buffer_size: default_min_buffer_size(),
            batch_size: default_batch_size(),
            result_history: default_result_history(),
        }
    }
}

impl TrainingConfig {
    /// Cycle cadence as a std Duration
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Settings for logging output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Base log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Subscriber output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable terminal output
    #[default]
    Pretty,
    /// Structured JSON with span context, for log shipping
    Json,
}

/// Levels `tracing-subscriber` accepts as a base directive
const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

fn default_poll_interval_secs() -> u64 {
    5
}
fn default_stale_after_secs() -> u64 {
    60
}
fn default_max_worker_errors() -> usize {
    5
}
fn default_task_timeout_secs() -> u64 {
    30
}
fn default_task_retention() -> usize {
    100
}
fn default_routing() -> HashMap<TaskKind, AgentId> {
    HashMap::from([
        (TaskKind::Validation, "validator".to_string()),
        (TaskKind::Analysis, "analyst".to_string()),
        (TaskKind::Estimation, "estimator".to_string()),
    ])
}
fn default_buffer_capacity() -> usize {
    1000
}
fn default_experience_priority() -> f64 {
    0.5
}
fn default_failure_reward() -> f64 {
    -0.5
}
fn default_training_interval_secs() -> u64 {
    3600
}
fn default_min_buffer_size() -> usize {
    100
}
fn default_batch_size() -> usize {
    32
}
fn default_result_history() -> usize {
    20
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> MeshResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| MeshError::Config(format!("failed to read config file: {}", e)))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| MeshError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file if it exists, otherwise defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> MeshResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Check the configuration for values the runtime cannot work with
    pub fn validate(&self) -> MeshResult<()> {
        if self.coordinator.poll_interval_secs == 0 {
            return Err(MeshError::Config(
                "coordinator.poll_interval_secs must be positive".into(),
            ));
        }
        if self.coordinator.task_retention == 0 {
            return Err(MeshError::Config(
                "coordinator.task_retention must be positive".into(),
            ));
        }
        if self.buffer.capacity == 0 {
            return Err(MeshError::Config("buffer.capacity must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.buffer.default_priority) {
            return Err(MeshError::Config(
                "buffer.default_priority must lie in [0, 1]".into(),
            ));
        }
        if self.training.batch_size == 0 {
            return Err(MeshError::Config(
                "training.batch_size must be positive".into(),
            ));
        }
        if !LOG_LEVELS.contains(&self.telemetry.level.as_str()) {
            return Err(MeshError::Config(format!(
                "telemetry.level must be one of error|warn|info|debug|trace, got {}",
                self.telemetry.level
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_runtime_constants() {
        let config = Config::default();
        assert_eq!(config.coordinator.poll_interval_secs, 5);
        assert_eq!(config.coordinator.stale_after_secs, 60);
        assert_eq!(config.coordinator.max_worker_errors, 5);
        assert_eq!(config.coordinator.task_timeout_secs, 30);
        assert_eq!(config.coordinator.task_retention, 100);
        assert_eq!(config.buffer.capacity, 1000);
        assert_eq!(config.buffer.default_priority, 0.5);
        assert_eq!(config.training.interval_secs, 3600);
        assert_eq!(config.training.min_buffer_size, 100);
        assert_eq!(config.training.result_history, 20);
        assert_eq!(config.telemetry.level, "info");
        assert_eq!(config.telemetry.format, LogFormat::Pretty);
    }

    #[test]
    fn test_telemetry_section_parses() {
        let config: Config = toml::from_str(
            r#"
[telemetry]
level = "debug"
format = "json"
"#,
        )
        .expect("parse");

        assert_eq!(config.telemetry.level, "debug");
        assert_eq!(config.telemetry.format, LogFormat::Json);
    }

    #[test]
    fn test_validation_rejects_unknown_log_level() {
        let mut config = Config::default();
        config.telemetry.level = "verbose".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
[coordinator]
poll_interval_secs = 1

[coordinator.routing]
validation = "w1"
"#,
        )
        .expect("parse");

        assert_eq!(config.coordinator.poll_interval_secs, 1);
        assert_eq!(config.coordinator.task_timeout_secs, 30);
        assert_eq!(
            config.coordinator.routing.get(&TaskKind::Validation),
            Some(&"w1".to_string())
        );
        assert_eq!(config.buffer.capacity, 1000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "[buffer]\ncapacity = 10").expect("write");

        let config = Config::load(file.path()).expect("load");
        assert_eq!(config.buffer.capacity, 10);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("/nonexistent/taskmesh.toml").expect("defaults");
        assert_eq!(config.buffer.capacity, 1000);
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let mut config = Config::default();
        config.buffer.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_out_of_range_priority() {
        let mut config = Config::default();
        config.buffer.default_priority = 1.5;
        assert!(config.validate().is_err());
    }
}
