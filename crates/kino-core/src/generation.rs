//! Generation collaborator interface
//!
//! Script, image, voice and video synthesis live behind [`Generator`]. The
//! orchestrator hands it one unit at a time along with the unit's inputs,
//! the personalized prompt, and the preferences that shaped it.

use async_trait::async_trait;
use kino_artifact::{ContentHash, InputSet, PreferenceId, ProjectId, Section};
use kino_kernel::{Stage, Unit};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One unit to synthesize
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub project: ProjectId,
    pub unit: Unit,
    pub stage: Stage,
    pub inputs: InputSet,
    /// Preferences folded into `prompt`
    pub applied_preferences: Vec<PreferenceId>,
    pub prompt: String,
    /// Section snapshot for per-section units
    #[serde(default)]
    pub section: Option<Section>,
}

/// What a generator produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    /// Blob storage handle
    pub location: String,
    /// Hash of the produced bytes
    pub content_hash: ContentHash,
    /// Script document, for script units
    #[serde(default)]
    pub document: Option<Value>,
    /// Measured duration, for narration and composition
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

impl GeneratedArtifact {
    #[must_use]
    pub fn new(location: impl Into<String>, content_hash: ContentHash) -> Self {
        Self {
            location: location.into(),
            content_hash,
            document: None,
            duration_secs: None,
        }
    }

    #[must_use]
    pub fn with_document(mut self, document: Value) -> Self {
        self.document = Some(document);
        self
    }

    #[must_use]
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = Some(secs);
        self
    }
}

/// Generation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// Model or service rejected the request
    #[error("{unit}: {reason}")]
    Failed { unit: Unit, reason: String },

    /// Service unreachable
    #[error("{unit}: service unavailable: {reason}")]
    Unavailable { unit: Unit, reason: String },
}

impl GenerationError {
    /// Display name of the unit that failed
    #[must_use]
    pub fn target(&self) -> String {
        match self {
            Self::Failed { unit, .. } | Self::Unavailable { unit, .. } => unit.to_string(),
        }
    }
}

/// Produces artifacts for pipeline units
#[async_trait]
pub trait Generator: Send + Sync {
    /// Synthesize one unit
    async fn generate(&self, request: GenerationRequest) -> Result<GeneratedArtifact, GenerationError>;

    /// Whether video composition tooling is installed
    async fn ffmpeg_available(&self) -> bool;
}
