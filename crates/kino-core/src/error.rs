//! Pipeline error taxonomy
//!
//! Every crate-level error folds into [`PipelineError`]. Validation errors
//! are raised before any mutation; storage and generation errors are the
//! retryable ones.

use crate::generation::GenerationError;
use crate::repository::StorageError;
use kino_artifact::{EditError, ModelError, ProjectId, SectionId};
use kino_feedback::{FeedbackError, ValidationError};
use kino_kernel::{DagError, LogError, Stage, TransitionError, Unit};

/// Main pipeline error type
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    /// Rejected input; nothing was mutated
    #[error("validation failed: {0}")]
    Validation(String),

    /// A required upstream artifact is absent or stale
    #[error("{stage} requires fresh {}", unit_list(.missing))]
    PrecursorMissing { stage: Stage, missing: Vec<Unit> },

    /// Transient storage failure
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Generation collaborator failed
    #[error("generation failed for {target}: {reason}")]
    GenerationFailure { target: String, reason: String },

    /// Result belongs to a superseded epoch or input set
    #[error("stale result for {unit} discarded")]
    StaleOverwrite { unit: Unit },

    /// Another evolution run holds the same project
    #[error("evolution already running for {}", scope_label(.project))]
    EvolutionInFlight { project: Option<ProjectId> },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Unit is not declared for the project
    #[error("invalid unit {unit}: {reason}")]
    InvalidUnit { unit: Unit, reason: &'static str },

    /// Generation did not answer in time
    #[error("{target} timed out after {after_ms}ms")]
    Timeout { target: String, after_ms: u64 },

    /// Persisted correction log does not verify
    #[error("correction log integrity: {0}")]
    Integrity(#[from] LogError),
}

fn scope_label(project: &Option<ProjectId>) -> String {
    project.map_or_else(|| "all projects".to_string(), |p| format!("project {p}"))
}

fn unit_list(units: &[Unit]) -> String {
    units
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl PipelineError {
    /// Whether a caller may retry the operation unchanged
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable(_)
                | Self::GenerationFailure { .. }
                | Self::Timeout { .. }
                | Self::StaleOverwrite { .. }
                | Self::EvolutionInFlight { .. }
        )
    }

    pub(crate) fn project_not_found(id: ProjectId) -> Self {
        Self::NotFound {
            kind: "project",
            id: id.to_string(),
        }
    }

    pub(crate) fn section_not_found(id: SectionId) -> Self {
        Self::NotFound {
            kind: "section",
            id: id.to_string(),
        }
    }
}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(reason) => Self::StorageUnavailable(reason),
            StorageError::Conflict(reason) => Self::Validation(reason),
        }
    }
}

impl From<GenerationError> for PipelineError {
    fn from(err: GenerationError) -> Self {
        let target = err.target();
        let reason = match err {
            GenerationError::Failed { reason, .. } => reason,
            GenerationError::Unavailable { reason, .. } => format!("service unavailable: {reason}"),
        };
        Self::GenerationFailure { target, reason }
    }
}

impl From<ModelError> for PipelineError {
    fn from(err: ModelError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<EditError> for PipelineError {
    fn from(err: EditError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<ValidationError> for PipelineError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<TransitionError> for PipelineError {
    fn from(err: TransitionError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<DagError> for PipelineError {
    fn from(err: DagError) -> Self {
        match err {
            DagError::InvalidUnit { unit, reason, .. } => Self::InvalidUnit { unit, reason },
            DagError::Superseded { unit, .. } => Self::StaleOverwrite { unit },
        }
    }
}

impl From<FeedbackError> for PipelineError {
    fn from(err: FeedbackError) -> Self {
        match err {
            FeedbackError::Validation(e) => e.into(),
            FeedbackError::NotFound(id) => Self::NotFound {
                kind: "preference",
                id: id.to_string(),
            },
            FeedbackError::EvolutionInFlight(project) => Self::EvolutionInFlight { project },
            e @ FeedbackError::NotASuggestion { .. } => Self::Validation(e.to_string()),
            FeedbackError::Analyzer(reason) => Self::GenerationFailure {
                target: "visual diff".to_string(),
                reason,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(PipelineError::StorageUnavailable("down".into()).is_retryable());
        assert!(PipelineError::Timeout {
            target: "script".into(),
            after_ms: 10
        }
        .is_retryable());
        assert!(!PipelineError::Validation("bad".into()).is_retryable());
        assert!(!PipelineError::PrecursorMissing {
            stage: Stage::Composition,
            missing: vec![Unit::Script]
        }
        .is_retryable());
    }

    #[test]
    fn superseded_maps_to_stale_overwrite() {
        let err: PipelineError = DagError::Superseded {
            unit: Unit::Script,
            expected: 1,
            current: 2,
        }
        .into();
        assert_eq!(err, PipelineError::StaleOverwrite { unit: Unit::Script });
    }

    #[test]
    fn precursor_message_lists_units() {
        let err = PipelineError::PrecursorMissing {
            stage: Stage::Image,
            missing: vec![Unit::Script],
        };
        assert_eq!(err.to_string(), "image requires fresh script");
    }
}
