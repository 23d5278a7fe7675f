//! Kernel error types

use crate::dag::Unit;
use crate::log::Sequence;
use kino_artifact::{ProjectId, ProjectState};

/// Dependency tracker errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DagError {
    /// Unit is not part of the project's declared stage map
    #[error("unit {unit} is not declared for project {project}: {reason}")]
    InvalidUnit {
        project: ProjectId,
        unit: Unit,
        reason: &'static str,
    },

    /// Result was produced under an epoch that has since been bumped
    #[error("result for {unit} superseded: produced at epoch {expected}, unit is at {current}")]
    Superseded {
        unit: Unit,
        expected: u64,
        current: u64,
    },
}

/// Correction log errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    /// Chained hash does not match the recomputed value
    #[error("hash chain broken at sequence {sequence}")]
    IntegrityViolation { sequence: Sequence },

    /// Restored events do not form a gap-free sequence
    #[error("sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: Sequence, found: Sequence },
}

/// Project state machine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// Completion would skip an intermediate state
    #[error("cannot move from {from} to {to}")]
    Illegal { from: ProjectState, to: ProjectState },
}
