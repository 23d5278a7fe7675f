//! Error types for preference handling

use crate::preference::ScopeKind;
use kino_artifact::{PreferenceId, ProjectId};

/// Rejected input; nothing was mutated
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// Scope qualifiers do not match the scope
    #[error("{scope} scope {detail}")]
    ScopeQualifier {
        scope: ScopeKind,
        detail: &'static str,
    },

    /// Confidence outside `[0, 1]`
    #[error("confidence {0} outside 0..=1")]
    ConfidenceOutOfRange(f64),

    /// Empty description
    #[error("preference description must not be empty")]
    EmptyDescription,

    /// Policy thresholds are inconsistent
    #[error("invalid policy: {0}")]
    Policy(String),
}

/// Feedback errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FeedbackError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("preference not found: {0}")]
    NotFound(PreferenceId),

    /// Another evolution run holds the same project
    #[error("evolution already running for {}", scope_label(.0))]
    EvolutionInFlight(Option<ProjectId>),

    /// Only suggestion-tier preferences can be accepted
    #[error("preference {id} is not a suggestion (confidence {confidence})")]
    NotASuggestion { id: PreferenceId, confidence: f64 },

    /// Visual diff collaborator failed
    #[error("visual diff analysis failed: {0}")]
    Analyzer(String),
}

fn scope_label(project: &Option<ProjectId>) -> String {
    project.map_or_else(|| "all projects".to_string(), |p| format!("project {p}"))
}
