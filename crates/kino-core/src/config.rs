//! Pipeline configuration
//!
//! Every section has defaults, so a TOML file only needs the values it
//! changes.
//!
//! ```toml
//! progress_capacity = 256
//!
//! [confidence]
//! auto_apply = 0.9
//!
//! [generation]
//! timeout_ms = 60000
//! max_concurrent = 4
//! ```

use crate::retry::RetryPolicy;
use kino_feedback::{ConfidencePolicy, EvolutionPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How generation calls are bounded
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationPolicy {
    /// Per-call timeout
    pub timeout_ms: u64,
    /// Generations running at once across all projects
    pub max_concurrent: usize,
    /// Times a superseded result is regenerated before giving up
    pub max_requeue_rounds: usize,
    /// Retries for timeouts and generation failures
    pub retry: RetryPolicy,
}

impl Default for GenerationPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            max_concurrent: 4,
            max_requeue_rounds: 3,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 500,
                max_delay_ms: 10_000,
            },
        }
    }
}

impl GenerationPolicy {
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KinoConfig {
    /// Buffered progress events per subscriber
    pub progress_capacity: usize,
    pub confidence: ConfidencePolicy,
    pub evolution: EvolutionPolicy,
    pub generation: GenerationPolicy,
    /// Backoff for transient storage failures
    pub storage: RetryPolicy,
}

impl Default for KinoConfig {
    fn default() -> Self {
        Self {
            progress_capacity: 128,
            confidence: ConfidencePolicy::default(),
            evolution: EvolutionPolicy::default(),
            generation: GenerationPolicy::default(),
            storage: RetryPolicy::default(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl KinoConfig {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: ConfidencePolicy) -> Self {
        self.confidence = confidence;
        self
    }

    #[must_use]
    pub fn with_evolution(mut self, evolution: EvolutionPolicy) -> Self {
        self.evolution = evolution;
        self
    }

    #[must_use]
    pub fn with_generation(mut self, generation: GenerationPolicy) -> Self {
        self.generation = generation;
        self
    }

    #[must_use]
    pub fn with_storage_retry(mut self, storage: RetryPolicy) -> Self {
        self.storage = storage;
        self
    }

    #[must_use]
    pub fn with_progress_capacity(mut self, capacity: usize) -> Self {
        self.progress_capacity = capacity;
        self
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    /// Returns error on malformed TOML or inconsistent values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or does not validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Render as TOML
    ///
    /// # Errors
    /// Returns error if a value cannot be represented in TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Reject inconsistent thresholds and limits.
    ///
    /// # Errors
    /// Returns the first violated rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |e: kino_feedback::ValidationError| ConfigError::Invalid(e.to_string());
        self.confidence.validate().map_err(invalid)?;
        self.evolution.validate().map_err(invalid)?;
        if self.generation.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "generation.max_concurrent must be at least 1".into(),
            ));
        }
        if self.generation.timeout_ms == 0 {
            return Err(ConfigError::Invalid("generation.timeout_ms must be positive".into()));
        }
        if self.progress_capacity == 0 {
            return Err(ConfigError::Invalid("progress_capacity must be at least 1".into()));
        }
        for (name, retry) in [("generation.retry", &self.generation.retry), ("storage", &self.storage)] {
            if retry.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!("{name}.max_attempts must be at least 1")));
            }
            if retry.base_delay_ms > retry.max_delay_ms {
                return Err(ConfigError::Invalid(format!(
                    "{name}.base_delay_ms exceeds max_delay_ms"
                )));
            }
        }
        Ok(())
    }
}
