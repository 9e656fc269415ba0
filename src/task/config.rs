//! Engine configuration
//!
//! Loaded from YAML, every field optional:
//!
//! ```yaml
//! failure_probability: 0.1
//! failure_mode:
//!   mode: seeded
//!   seed: 42
//! time_scale: 1.0
//! startup_delay_ms: 2000
//!
//! delegate:
//!   base_url: "http://localhost:8000"
//!   poll_interval_ms: 2000
//!   max_run_duration_ms: 600000
//!   push_events: true
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error in {file}: {error}")]
    Yaml {
        file: String,
        error: serde_yaml::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How simulated step failures are drawn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum FailureMode {
    /// Independent trials from the thread RNG
    #[default]
    Random,
    /// Trials derived from (seed, run id, step index); reproducible per run
    Seeded { seed: u64 },
    /// No simulated failures
    Disabled,
}

/// Delegate executor connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateConfig {
    /// Base URL of the delegate service (e.g., "http://localhost:8000")
    pub base_url: String,

    /// Request timeout in milliseconds
    #[serde(default = "default_delegate_timeout")]
    pub timeout_ms: u64,

    /// Interval between status polls in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Upper bound on a delegated run's wall-clock time (unbounded if unset)
    #[serde(default)]
    pub max_run_duration_ms: Option<u64>,

    /// Whether to also listen for pushed status events over WebSocket
    #[serde(default)]
    pub push_events: bool,
}

fn default_delegate_timeout() -> u64 {
    30000
}

fn default_poll_interval() -> u64 {
    2000
}

impl DelegateConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            timeout_ms: default_delegate_timeout(),
            poll_interval_ms: default_poll_interval(),
            max_run_duration_ms: None,
            push_events: false,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_run_duration(&self) -> Option<Duration> {
        self.max_run_duration_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Chance that a fallible step fails
    #[serde(default = "default_failure_probability")]
    pub failure_probability: f64,

    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Multiplier on every simulated duration (0 = instantaneous)
    #[serde(default = "default_time_scale")]
    pub time_scale: f64,

    /// Pause between the start transition and the first step
    #[serde(default = "default_startup_delay")]
    pub startup_delay_ms: u64,

    /// Capacity of the UI event stream buffer
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    #[serde(default)]
    pub delegate: Option<DelegateConfig>,
}

/// Largest accepted `time_scale`
pub const MAX_TIME_SCALE: f64 = 1000.0;

fn default_failure_probability() -> f64 {
    0.1
}

fn default_time_scale() -> f64 {
    1.0
}

fn default_startup_delay() -> u64 {
    2000
}

fn default_event_buffer() -> usize {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            failure_probability: default_failure_probability(),
            failure_mode: FailureMode::default(),
            time_scale: default_time_scale(),
            startup_delay_ms: default_startup_delay(),
            event_buffer: default_event_buffer(),
            delegate: None,
        }
    }
}

impl EngineConfig {
    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| ConfigError::Yaml {
            file: path.display().to_string(),
            error: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Yaml {
            file: "<inline>".to_string(),
            error: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Config for tests and demos: no waiting, no random failures
    pub fn instant() -> Self {
        Self {
            failure_mode: FailureMode::Disabled,
            time_scale: 0.0,
            startup_delay_ms: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.failure_probability) {
            return Err(ConfigError::Invalid(format!(
                "failure_probability must be within [0, 1], got {}",
                self.failure_probability
            )));
        }
        if !(0.0..=MAX_TIME_SCALE).contains(&self.time_scale) {
            return Err(ConfigError::Invalid(format!(
                "time_scale must be within [0, {}], got {}",
                MAX_TIME_SCALE, self.time_scale
            )));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid(
                "event_buffer must be at least 1".to_string(),
            ));
        }
        if let Some(delegate) = &self.delegate {
            if delegate.poll_interval_ms == 0 {
                return Err(ConfigError::Invalid(
                    "delegate.poll_interval_ms must be greater than 0".to_string(),
                ));
            }
            if delegate.base_url.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "delegate.base_url must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Apply `time_scale` to a simulated duration, saturating at
    /// `Duration::MAX`
    pub fn scaled(&self, duration: Duration) -> Duration {
        Duration::try_from_secs_f64(duration.as_secs_f64() * self.time_scale.max(0.0))
            .unwrap_or(Duration::MAX)
    }

    pub fn startup_delay(&self) -> Duration {
        self.scaled(Duration::from_millis(self.startup_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.failure_probability, 0.1);
        assert_eq!(config.failure_mode, FailureMode::Random);
        assert_eq!(config.startup_delay(), Duration::from_secs(2));
        assert!(config.delegate.is_none());
    }

    #[test]
    fn test_from_yaml() {
        let config = EngineConfig::from_yaml(
            r#"
failure_probability: 0.08
failure_mode:
  mode: seeded
  seed: 7
time_scale: 0.5
delegate:
  base_url: "http://localhost:8000"
  max_run_duration_ms: 60000
"#,
        )
        .unwrap();

        assert_eq!(config.failure_probability, 0.08);
        assert_eq!(config.failure_mode, FailureMode::Seeded { seed: 7 });
        assert_eq!(config.scaled(Duration::from_millis(1000)), Duration::from_millis(500));

        let delegate = config.delegate.unwrap();
        assert_eq!(delegate.poll_interval(), Duration::from_secs(2));
        assert_eq!(delegate.max_run_duration(), Some(Duration::from_secs(60)));
        assert!(!delegate.push_events);
    }

    #[test]
    fn test_validation() {
        assert!(EngineConfig::from_yaml("failure_probability: 1.5").is_err());
        assert!(EngineConfig::from_yaml("time_scale: -1").is_err());
        assert!(EngineConfig::from_yaml("time_scale: 1e20").is_err());
        assert!(EngineConfig::from_yaml("time_scale: .nan").is_err());
        assert!(EngineConfig::from_yaml("time_scale: 1000").is_ok());
        assert!(EngineConfig::from_yaml(
            "delegate:\n  base_url: http://x\n  poll_interval_ms: 0"
        )
        .is_err());
    }

    #[test]
    fn test_scaled_saturates_instead_of_overflowing() {
        let config = EngineConfig {
            time_scale: 1e20,
            ..EngineConfig::default()
        };
        assert_eq!(config.scaled(Duration::from_secs(10)), Duration::MAX);
        assert_eq!(config.scaled(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_instant_scales_to_zero() {
        let config = EngineConfig::instant();
        assert_eq!(config.scaled(Duration::from_secs(3)), Duration::ZERO);
        assert_eq!(config.startup_delay(), Duration::ZERO);
    }
}
