//! Progress notifications
//!
//! A broadcast channel fans pipeline progress out to every subscriber.
//! Slow subscribers lag and lose the oldest events; publishing never blocks.

use kino_artifact::{PreferenceId, ProjectId, ProjectState};
use kino_kernel::{CorrectionId, Stage, Unit};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// One progress notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    CorrectionRecorded {
        project: ProjectId,
        correction: CorrectionId,
        stage: Stage,
    },
    UnitsInvalidated {
        project: ProjectId,
        units: Vec<Unit>,
    },
    UnitStarted {
        project: ProjectId,
        unit: Unit,
    },
    UnitCompleted {
        project: ProjectId,
        unit: Unit,
    },
    UnitFailed {
        project: ProjectId,
        unit: Unit,
        reason: String,
    },
    /// A result arrived for a superseded epoch and was thrown away
    UnitDiscarded {
        project: ProjectId,
        unit: Unit,
    },
    StateChanged {
        project: ProjectId,
        from: ProjectState,
        to: ProjectState,
    },
    /// Composition finished without a playable artifact
    Degraded {
        project: ProjectId,
        reason: String,
    },
    PreferencesEvolved {
        project: Option<ProjectId>,
        created: Vec<PreferenceId>,
        reinforced: Vec<PreferenceId>,
        weakened: Vec<PreferenceId>,
    },
}

impl PipelineEvent {
    /// Project the event concerns, if any
    #[must_use]
    pub fn project(&self) -> Option<ProjectId> {
        match self {
            Self::CorrectionRecorded { project, .. }
            | Self::UnitsInvalidated { project, .. }
            | Self::UnitStarted { project, .. }
            | Self::UnitCompleted { project, .. }
            | Self::UnitFailed { project, .. }
            | Self::UnitDiscarded { project, .. }
            | Self::StateChanged { project, .. }
            | Self::Degraded { project, .. } => Some(*project),
            Self::PreferencesEvolved { project, .. } => *project,
        }
    }
}

/// Broadcast sender for pipeline events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers; dropped when nobody listens
    pub fn publish(&self, event: PipelineEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("progress event dropped, no subscribers");
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let project = ProjectId::new();
        bus.publish(PipelineEvent::UnitStarted {
            project,
            unit: Unit::Script,
        });
        bus.publish(PipelineEvent::UnitCompleted {
            project,
            unit: Unit::Script,
        });

        assert!(matches!(rx.recv().await, Ok(PipelineEvent::UnitStarted { .. })));
        let done = rx.recv().await.unwrap();
        assert_eq!(done.project(), Some(project));
        assert!(matches!(done, PipelineEvent::UnitCompleted { .. }));
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::new(1);
        bus.publish(PipelineEvent::Degraded {
            project: ProjectId::new(),
            reason: "no ffmpeg".into(),
        });
    }
}
