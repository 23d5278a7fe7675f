use crate::error::TransitionError;
use kino_artifact::ProjectState;

/// States reachable by completing a stage from `from`.
///
/// A completed stage may be the next state, or any state already reached
/// (regeneration revisits it without moving the project backwards).
pub fn allowed_transitions(from: ProjectState) -> Vec<ProjectState> {
    use ProjectState::*;
    match from {
        Init => vec![Init, ScriptDone],
        ScriptDone => vec![Init, ScriptDone, VisualsDone],
        VisualsDone => vec![Init, ScriptDone, VisualsDone, NarrationDone],
        NarrationDone => vec![Init, ScriptDone, VisualsDone, NarrationDone, Composed],
        Composed => vec![Init, ScriptDone, VisualsDone, NarrationDone, Composed],
    }
}

/// Validates a stage completion against the current state.
///
/// # Errors
/// Returns [`TransitionError::Illegal`] when the completion would skip a
/// state.
pub fn validate_transition(from: ProjectState, to: ProjectState) -> Result<(), TransitionError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError::Illegal { from, to })
    }
}

/// State after completing `completed` while in `current`: advances when
/// `completed` is the next state, otherwise stays put.
///
/// # Errors
/// Returns [`TransitionError::Illegal`] when the completion would skip a
/// state.
pub fn advance(
    current: ProjectState,
    completed: ProjectState,
) -> Result<ProjectState, TransitionError> {
    validate_transition(current, completed)?;
    Ok(current.max(completed))
}
