//! Stage dependency tracking
//!
//! The stage map is fixed: `script → {narration, images, animations} →
//! composition`. Per-section stages are expanded over the sections
//! registered for a project, and animations exist only for animated section
//! types. Each project keeps its unit records behind its own lock.

use crate::correction::Stage;
use crate::error::DagError;
use dashmap::DashMap;
use kino_artifact::{ContentHash, InputSet, ProjectId, Section, SectionId, SectionType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Stage kinds of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Script,
    Narration,
    Images,
    Animations,
    Composition,
}

/// Direct dependents of each stage kind, in topological order
pub const STAGE_EDGES: [(StageKind, &[StageKind]); 5] = [
    (
        StageKind::Script,
        &[StageKind::Narration, StageKind::Images, StageKind::Animations],
    ),
    (StageKind::Narration, &[StageKind::Composition]),
    (StageKind::Images, &[StageKind::Composition]),
    (StageKind::Animations, &[StageKind::Composition]),
    (StageKind::Composition, &[]),
];

impl StageKind {
    /// Direct dependents from the stage table
    #[must_use]
    pub fn dependents(self) -> &'static [StageKind] {
        STAGE_EDGES
            .iter()
            .find(|(kind, _)| *kind == self)
            .map_or(&[], |(_, deps)| *deps)
    }

    /// Whether units of this kind belong to one section
    #[must_use]
    pub fn is_per_section(self) -> bool {
        matches!(
            self,
            StageKind::Narration | StageKind::Images | StageKind::Animations
        )
    }
}

/// One tracked artifact of a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "stage", content = "section", rename_all = "snake_case")]
pub enum Unit {
    Script,
    Narration(SectionId),
    Images(SectionId),
    Animations(SectionId),
    Composition,
}

impl Unit {
    #[must_use]
    pub fn kind(self) -> StageKind {
        match self {
            Unit::Script => StageKind::Script,
            Unit::Narration(_) => StageKind::Narration,
            Unit::Images(_) => StageKind::Images,
            Unit::Animations(_) => StageKind::Animations,
            Unit::Composition => StageKind::Composition,
        }
    }

    #[must_use]
    pub fn section(self) -> Option<SectionId> {
        match self {
            Unit::Narration(s) | Unit::Images(s) | Unit::Animations(s) => Some(s),
            Unit::Script | Unit::Composition => None,
        }
    }

    /// Unit of `kind` for `section`; `section` is ignored for project-level kinds
    #[must_use]
    pub fn of(kind: StageKind, section: SectionId) -> Unit {
        match kind {
            StageKind::Script => Unit::Script,
            StageKind::Narration => Unit::Narration(section),
            StageKind::Images => Unit::Images(section),
            StageKind::Animations => Unit::Animations(section),
            StageKind::Composition => Unit::Composition,
        }
    }

    /// Pipeline stage that produces this unit
    #[must_use]
    pub fn stage(self) -> Stage {
        match self {
            Unit::Script => Stage::Script,
            Unit::Narration(_) => Stage::Narration,
            Unit::Images(_) => Stage::Image,
            Unit::Animations(_) => Stage::Animation,
            Unit::Composition => Stage::Composition,
        }
    }

    /// Units declared for one section
    #[must_use]
    pub fn section_units(section: SectionId, section_type: SectionType) -> Vec<Unit> {
        let mut units = vec![Unit::Narration(section), Unit::Images(section)];
        if section_type.is_animated() {
            units.push(Unit::Animations(section));
        }
        units
    }

    /// Unit touched by a correction at `stage`. Section-level stages need a
    /// section.
    #[must_use]
    pub fn for_correction(stage: Stage, section: Option<SectionId>) -> Option<Unit> {
        match (stage, section) {
            (Stage::Script, _) => Some(Unit::Script),
            (Stage::Composition, _) => Some(Unit::Composition),
            (Stage::Narration, Some(s)) => Some(Unit::Narration(s)),
            (Stage::Image, Some(s)) => Some(Unit::Images(s)),
            (Stage::Animation, Some(s)) => Some(Unit::Animations(s)),
            (Stage::Narration | Stage::Image | Stage::Animation, None) => None,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Script => f.write_str("script"),
            Unit::Narration(s) => write!(f, "narration[{s}]"),
            Unit::Images(s) => write!(f, "images[{s}]"),
            Unit::Animations(s) => write!(f, "animations[{s}]"),
            Unit::Composition => f.write_str("composition"),
        }
    }
}

/// Inputs and output of a unit's last build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub inputs: InputSet,
    pub input_digest: ContentHash,
    pub produced: ContentHash,
}

/// Observable state of one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitState {
    pub unit: Unit,
    pub record: Option<UnitRecord>,
    pub epoch: u64,
    /// Marked stale by an invalidation since the last record
    pub invalidated: bool,
}

#[derive(Debug, Default)]
struct ProjectGraph {
    /// Registered sections in playback order
    sections: Vec<(SectionId, SectionType)>,
    records: HashMap<Unit, UnitRecord>,
    epochs: HashMap<Unit, u64>,
    invalidated: HashSet<Unit>,
}

impl ProjectGraph {
    fn section_type(&self, id: SectionId) -> Option<SectionType> {
        self.sections
            .iter()
            .find(|(s, _)| *s == id)
            .map(|(_, t)| *t)
    }

    fn check(&self, project: ProjectId, unit: Unit) -> Result<(), DagError> {
        let Some(section) = unit.section() else {
            return Ok(());
        };
        let invalid = |reason| DagError::InvalidUnit {
            project,
            unit,
            reason,
        };
        match self.section_type(section) {
            None => Err(invalid("section is not registered")),
            Some(t) if unit.kind() == StageKind::Animations && !t.is_animated() => {
                Err(invalid("section type has no animation"))
            }
            Some(_) => Ok(()),
        }
    }

    /// Every declared unit in topological order
    fn units(&self) -> Vec<Unit> {
        let mut units = vec![Unit::Script];
        for kind in [StageKind::Narration, StageKind::Images, StageKind::Animations] {
            for (id, t) in &self.sections {
                if kind == StageKind::Animations && !t.is_animated() {
                    continue;
                }
                units.push(Unit::of(kind, *id));
            }
        }
        units.push(Unit::Composition);
        units
    }

    fn direct_dependents(&self, unit: Unit) -> Vec<Unit> {
        let mut out = Vec::new();
        for kind in unit.kind().dependents() {
            match kind {
                StageKind::Script => out.push(Unit::Script),
                StageKind::Composition => out.push(Unit::Composition),
                _ => {
                    for (id, t) in &self.sections {
                        if *kind == StageKind::Animations && !t.is_animated() {
                            continue;
                        }
                        out.push(Unit::of(*kind, *id));
                    }
                }
            }
        }
        // Composition sits downstream of the script even when there are no
        // sections to route through.
        if unit == Unit::Script {
            out.push(Unit::Composition);
        }
        out
    }

    fn frontier(&self, project: ProjectId, changed: &[Unit]) -> Result<Vec<Unit>, DagError> {
        let mut reached: HashSet<Unit> = HashSet::new();
        let mut pending: Vec<Unit> = Vec::new();
        for unit in changed {
            self.check(project, *unit)?;
            if reached.insert(*unit) {
                pending.push(*unit);
            }
        }
        while let Some(unit) = pending.pop() {
            for dep in self.direct_dependents(unit) {
                if reached.insert(dep) {
                    pending.push(dep);
                }
            }
        }
        Ok(self
            .units()
            .into_iter()
            .filter(|u| reached.contains(u))
            .collect())
    }

    fn epoch(&self, unit: Unit) -> u64 {
        self.epochs.get(&unit).copied().unwrap_or(0)
    }

    fn mark(&mut self, unit: Unit) {
        self.invalidated.insert(unit);
        *self.epochs.entry(unit).or_insert(0) += 1;
    }
}

/// Per-project stage dependency tracker
#[derive(Debug, Default)]
pub struct DagTracker {
    projects: DashMap<ProjectId, Arc<Mutex<ProjectGraph>>>,
}

impl DagTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn graph(&self, project: ProjectId) -> Arc<Mutex<ProjectGraph>> {
        self.projects.entry(project).or_default().value().clone()
    }

    /// Register the inputs and output of a unit's build.
    ///
    /// # Errors
    /// Returns [`DagError::InvalidUnit`] when the unit is not declared for
    /// the project.
    pub fn record_produced(
        &self,
        project: ProjectId,
        unit: Unit,
        inputs: InputSet,
        produced: ContentHash,
    ) -> Result<(), DagError> {
        let graph = self.graph(project);
        let mut g = graph.lock();
        g.check(project, unit)?;
        store(&mut g, unit, inputs, produced);
        tracing::debug!(project = %project, unit = %unit, "unit recorded");
        Ok(())
    }

    /// Like [`Self::record_produced`] but only if the unit is still at
    /// `epoch`.
    ///
    /// # Errors
    /// Returns [`DagError::Superseded`] when the unit was invalidated after
    /// the build started.
    pub fn commit_produced(
        &self,
        project: ProjectId,
        unit: Unit,
        epoch: u64,
        inputs: InputSet,
        produced: ContentHash,
    ) -> Result<(), DagError> {
        let graph = self.graph(project);
        let mut g = graph.lock();
        g.check(project, unit)?;
        let current = g.epoch(unit);
        if current != epoch {
            return Err(DagError::Superseded {
                unit,
                expected: epoch,
                current,
            });
        }
        store(&mut g, unit, inputs, produced);
        tracing::debug!(project = %project, unit = %unit, epoch, "unit committed");
        Ok(())
    }

    /// Stale when never recorded, invalidated since, or any input differs.
    ///
    /// # Errors
    /// Returns [`DagError::InvalidUnit`] for undeclared units.
    pub fn is_stale(
        &self,
        project: ProjectId,
        unit: Unit,
        current: &InputSet,
    ) -> Result<bool, DagError> {
        let graph = self.graph(project);
        let g = graph.lock();
        g.check(project, unit)?;
        Ok(match g.records.get(&unit) {
            None => true,
            Some(_) if g.invalidated.contains(&unit) => true,
            Some(record) => record.input_digest != current.digest(),
        })
    }

    fn existing(&self, project: ProjectId) -> Option<Arc<Mutex<ProjectGraph>>> {
        self.projects.get(&project).map(|g| g.value().clone())
    }

    /// Last recorded build of a unit
    #[must_use]
    pub fn record(&self, project: ProjectId, unit: Unit) -> Option<UnitRecord> {
        let graph = self.existing(project)?;
        let record = graph.lock().records.get(&unit).cloned();
        record
    }

    /// Current epoch of a unit
    #[must_use]
    pub fn epoch(&self, project: ProjectId, unit: Unit) -> u64 {
        let Some(graph) = self.existing(project) else {
            return 0;
        };
        let epoch = graph.lock().epoch(unit);
        epoch
    }

    /// Changed units plus everything downstream, in topological order.
    ///
    /// # Errors
    /// Returns [`DagError::InvalidUnit`] if any changed unit is undeclared.
    pub fn stale_frontier(
        &self,
        project: ProjectId,
        changed: &[Unit],
    ) -> Result<Vec<Unit>, DagError> {
        let graph = self.graph(project);
        let g = graph.lock();
        g.frontier(project, changed)
    }

    /// Mark the frontier of `units` stale and bump each unit's epoch.
    ///
    /// # Errors
    /// Returns [`DagError::InvalidUnit`] if any unit is undeclared; nothing
    /// is marked in that case.
    pub fn invalidate(&self, project: ProjectId, units: &[Unit]) -> Result<Vec<Unit>, DagError> {
        let graph = self.graph(project);
        let mut g = graph.lock();
        let frontier = g.frontier(project, units)?;
        for unit in &frontier {
            g.mark(*unit);
        }
        tracing::debug!(project = %project, units = frontier.len(), "units invalidated");
        Ok(frontier)
    }

    /// Register the project's current ordered sections.
    ///
    /// Records of removed sections, and animation records of sections that
    /// are no longer animated, are dropped. A changed section order or set
    /// invalidates composition. Returns the dropped units.
    pub fn sync_sections(&self, project: ProjectId, sections: &[Section]) -> Vec<Unit> {
        let graph = self.graph(project);
        let mut g = graph.lock();
        let next: Vec<(SectionId, SectionType)> =
            sections.iter().map(|s| (s.id, s.section_type)).collect();
        if g.sections == next {
            return Vec::new();
        }
        let order_changed = g.sections.iter().map(|(id, _)| id).ne(next.iter().map(|(id, _)| id));
        g.sections = next;

        let declared: HashSet<Unit> = g.units().into_iter().collect();
        let mut dropped: Vec<Unit> = g
            .records
            .keys()
            .chain(g.epochs.keys())
            .filter(|u| !declared.contains(u))
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        dropped.sort();
        for unit in &dropped {
            g.records.remove(unit);
            g.epochs.remove(unit);
            g.invalidated.remove(unit);
        }
        if order_changed || !dropped.is_empty() {
            g.mark(Unit::Composition);
        }
        tracing::debug!(
            project = %project,
            sections = sections.len(),
            dropped = dropped.len(),
            "sections synced"
        );
        dropped
    }

    /// Every declared unit of the project in topological order
    #[must_use]
    pub fn units(&self, project: ProjectId) -> Vec<Unit> {
        self.graph(project).lock().units()
    }

    /// State of every declared unit
    #[must_use]
    pub fn snapshot(&self, project: ProjectId) -> BTreeMap<Unit, UnitState> {
        let graph = self.graph(project);
        let g = graph.lock();
        g.units()
            .into_iter()
            .map(|unit| {
                let state = UnitState {
                    unit,
                    record: g.records.get(&unit).cloned(),
                    epoch: g.epoch(unit),
                    invalidated: g.invalidated.contains(&unit),
                };
                (unit, state)
            })
            .collect()
    }

    /// Forget everything about a project
    pub fn remove_project(&self, project: ProjectId) {
        self.projects.remove(&project);
    }
}

fn store(g: &mut ProjectGraph, unit: Unit, inputs: InputSet, produced: ContentHash) {
    let input_digest = inputs.digest();
    g.records.insert(
        unit,
        UnitRecord {
            inputs,
            input_digest,
            produced,
        },
    );
    g.invalidated.remove(&unit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kino_artifact::SectionDraft;

    fn sections(project: ProjectId, types: &[SectionType]) -> Vec<Section> {
        types
            .iter()
            .enumerate()
            .map(|(i, t)| Section::from_draft(project, i, SectionDraft::new(*t), Utc::now()))
            .collect()
    }

    #[test]
    fn stage_table_is_acyclic_and_ends_in_composition() {
        for (kind, deps) in STAGE_EDGES {
            for dep in deps {
                assert!(dep > &kind);
            }
        }
        assert!(StageKind::Composition.dependents().is_empty());
    }

    #[test]
    fn animations_only_for_animated_sections() {
        let dag = DagTracker::new();
        let p = ProjectId::new();
        let list = sections(p, &[SectionType::Slide, SectionType::Diagram]);
        dag.sync_sections(p, &list);

        let err = dag
            .record_produced(
                p,
                Unit::Animations(list[0].id),
                InputSet::new(),
                ContentHash::of_str("a"),
            )
            .unwrap_err();
        assert!(matches!(err, DagError::InvalidUnit { .. }));
        assert!(dag
            .record_produced(
                p,
                Unit::Animations(list[1].id),
                InputSet::new(),
                ContentHash::of_str("a"),
            )
            .is_ok());
        assert_eq!(dag.units(p).len(), 1 + 2 + 2 + 1 + 1);
    }

    #[test]
    fn unregistered_section_is_invalid() {
        let dag = DagTracker::new();
        let p = ProjectId::new();
        let err = dag
            .is_stale(p, Unit::Images(SectionId::new()), &InputSet::new())
            .unwrap_err();
        assert!(matches!(err, DagError::InvalidUnit { .. }));
    }

    #[test]
    fn commit_rejects_superseded_epoch() {
        let dag = DagTracker::new();
        let p = ProjectId::new();
        let list = sections(p, &[SectionType::Code]);
        dag.sync_sections(p, &list);
        let unit = Unit::Images(list[0].id);

        let epoch = dag.epoch(p, unit);
        dag.invalidate(p, &[unit]).unwrap();
        let err = dag
            .commit_produced(p, unit, epoch, InputSet::new(), ContentHash::of_str("x"))
            .unwrap_err();
        assert_eq!(
            err,
            DagError::Superseded {
                unit,
                expected: epoch,
                current: epoch + 1
            }
        );
        assert!(dag
            .commit_produced(p, unit, epoch + 1, InputSet::new(), ContentHash::of_str("x"))
            .is_ok());
        assert!(!dag.is_stale(p, unit, &InputSet::new()).unwrap());
    }

    #[test]
    fn sync_drops_removed_sections_and_marks_composition() {
        let dag = DagTracker::new();
        let p = ProjectId::new();
        let list = sections(p, &[SectionType::Slide, SectionType::Slide]);
        dag.sync_sections(p, &list);
        dag.record_produced(p, Unit::Images(list[1].id), InputSet::new(), ContentHash::of_str("i"))
            .unwrap();
        dag.record_produced(p, Unit::Composition, InputSet::new(), ContentHash::of_str("c"))
            .unwrap();

        let dropped = dag.sync_sections(p, &list[..1]);
        assert_eq!(dropped, vec![Unit::Images(list[1].id)]);
        assert!(dag.record(p, Unit::Images(list[1].id)).is_none());
        assert!(dag.is_stale(p, Unit::Composition, &InputSet::new()).unwrap());
    }

    #[test]
    fn correction_stage_maps_to_unit() {
        let s = SectionId::new();
        assert_eq!(Unit::for_correction(Stage::Image, Some(s)), Some(Unit::Images(s)));
        assert_eq!(Unit::for_correction(Stage::Script, Some(s)), Some(Unit::Script));
        assert_eq!(Unit::for_correction(Stage::Narration, None), None);
    }

    #[test]
    fn section_units_follow_animation_rule() {
        let s = SectionId::new();
        assert_eq!(
            Unit::section_units(s, SectionType::Code),
            vec![Unit::Narration(s), Unit::Images(s)]
        );
        let animated = Unit::section_units(s, SectionType::CodeTyping);
        assert_eq!(animated.len(), 3);
        assert!(animated.iter().all(|u| u.stage().is_section_level()));
    }
}
