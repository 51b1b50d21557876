use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("config validation error: {0}")]
    Validation(String),
}

/// Engine tunables with the deployed defaults. Durations are stored in
/// milliseconds so the file format stays flat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum classifier confidence for a frame to produce a candidate.
    pub confidence_threshold: f32,
    /// Consecutive matching candidates required for a stable emotion.
    pub stability_frames: u32,
    /// Floor on the classifier invocation rate.
    pub detection_interval_ms: u64,
    /// Window after a stable emotion during which no further stable
    /// events may be produced, regardless of label.
    pub detection_cooldown_ms: u64,
    /// Per-learner spacing between interventions across all labels.
    pub intervention_cooldown_ms: u64,
    pub backoff: BackoffConfig,
    /// Per-connection fan-out channel capacity.
    pub hub_channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            stability_frames: 3,
            detection_interval_ms: 300,
            detection_cooldown_ms: 5_000,
            intervention_cooldown_ms: 30_000,
            backoff: BackoffConfig::default(),
            hub_channel_capacity: 100,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Validation(format!(
                "confidence_threshold must be in [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if self.stability_frames == 0 {
            return Err(ConfigError::Validation(
                "stability_frames must be at least 1".into(),
            ));
        }
        if self.detection_interval_ms < 300 {
            return Err(ConfigError::Validation(
                "detection_interval_ms must be at least 300".into(),
            ));
        }
        if self.backoff.base_delay_ms == 0 {
            return Err(ConfigError::Validation(
                "backoff.base_delay_ms must be nonzero".into(),
            ));
        }
        if self.backoff.max_delay_ms < self.backoff.base_delay_ms {
            return Err(ConfigError::Validation(
                "backoff.max_delay_ms must be >= backoff.base_delay_ms".into(),
            ));
        }
        if self.hub_channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "hub_channel_capacity must be nonzero".into(),
            ));
        }
        Ok(())
    }

    pub fn detection_cooldown(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.detection_cooldown_ms as i64)
    }

    pub fn intervention_cooldown(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.intervention_cooldown_ms as i64)
    }
}

impl BackoffConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}
