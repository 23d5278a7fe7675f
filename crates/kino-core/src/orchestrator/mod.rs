//! Pipeline orchestrator
//!
//! Drives each project through `init → script_done → visuals_done →
//! narration_done → composed`, turns every edit into a correction, and
//! keeps the dependency tracker in step with stored sections.
//!
//! Mutations of one project serialize on that project's async mutex. The
//! mutex is released while generation runs, so a correction can land
//! mid-flight; the affected task is aborted and its unit requeued.

mod inputs;
mod stages;

pub use stages::{ComposeOutcome, ComposeReport, StageReport, UnitFailure};

use stages::InFlight;

use crate::config::KinoConfig;
use crate::error::PipelineError;
use crate::events::{EventBus, PipelineEvent};
use crate::generation::Generator;
use crate::repository::Repository;
use crate::retry::retry_with_backoff;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::try_join_all;
use inputs::{find, sections_from_script, unit_inputs};
use kino_artifact::{
    apply_edit, ArtifactRef, ContentHash, EditOutcome, PreferenceId, Project, ProjectId,
    ProjectState, ScriptDocument, Section, SectionEdit, SectionId,
};
use kino_feedback::{
    analyze_edit, BuiltPrompt, EvolutionEngine, EvolutionReport, EvolutionRequest, Preference,
    PreferenceDraft, PreferenceFilter, PreferenceProfile, PreferenceResolver, PreferenceStore,
    PreferenceUpdate, PromptBuilder, PromptKind, Resolution, ResolveContext, Suggestion,
    VisualDiffAnalyzer,
};
use kino_kernel::{
    state_machine, Category, CorrectionDraft, CorrectionEvent, CorrectionLog, CorrectionStats,
    DagTracker, LogFilter, Stage, Unit, UnitState,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify, OwnedMutexGuard, Semaphore};

/// Rough output size used by [`ComposeStatus`]
const ESTIMATED_BYTES_PER_MINUTE: f64 = 5.0 * 1024.0 * 1024.0;

/// Result of a section edit
#[derive(Debug, Clone, PartialEq)]
pub struct EditReport {
    pub outcome: EditOutcome,
    /// `None` when the edit changed nothing
    pub correction: Option<CorrectionEvent>,
    /// Units marked stale by the edit
    pub invalidated: Vec<Unit>,
    /// Units of removed sections
    pub dropped: Vec<Unit>,
    pub sections: Vec<Section>,
}

/// Result of replacing a project's script
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptUpdate {
    /// `None` when the document was unchanged
    pub correction: Option<CorrectionEvent>,
    pub invalidated: Vec<Unit>,
    pub dropped: Vec<Unit>,
    pub sections: Vec<Section>,
}

/// Composition readiness of a project
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComposeStatus {
    pub state: ProjectState,
    /// Every section unit is fresh and there is something to compose
    pub ready: bool,
    /// Stale or absent units blocking composition
    pub missing: Vec<Unit>,
    pub sections_count: usize,
    /// Seconds, with the default applied to sections without a duration
    pub total_duration: f64,
    pub estimated_size_bytes: u64,
    pub ffmpeg_available: bool,
    /// Last playable output
    pub video: Option<ArtifactRef>,
}

/// Coordinates storage, generation, the correction log and preferences
pub struct Orchestrator {
    config: KinoConfig,
    repo: Arc<dyn Repository>,
    generator: Arc<dyn Generator>,
    log: Arc<CorrectionLog>,
    dag: DagTracker,
    store: Arc<PreferenceStore>,
    resolver: PreferenceResolver,
    prompts: PromptBuilder,
    evolution: EvolutionEngine,
    events: EventBus,
    locks: DashMap<ProjectId, Arc<Mutex<()>>>,
    /// Keeps stored and in-memory correction sequences aligned
    append_lock: Mutex<()>,
    semaphore: Arc<Semaphore>,
    /// Units claimed by a stage run, keyed to that run
    in_flight: DashMap<(ProjectId, Unit), InFlight>,
    /// Signalled whenever an in-flight entry goes away
    settled: Notify,
    runs: AtomicU64,
    compositions: DashMap<ProjectId, ArtifactRef>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("corrections", &self.log.len())
            .field("preferences", &self.store.len())
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Load persisted state and rebuild the correction log, the preference
    /// projection and the dependency tracker.
    ///
    /// Section artifacts whose recorded input digest still matches count as
    /// fresh. Compositions are not persisted and start stale.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid, storage stays
    /// unavailable, or the stored correction log does not verify.
    pub async fn open(
        config: KinoConfig,
        repo: Arc<dyn Repository>,
        generator: Arc<dyn Generator>,
    ) -> Result<Self, PipelineError> {
        config
            .validate()
            .map_err(|e| PipelineError::Validation(e.to_string()))?;
        let policy = config.storage;
        let storage = &repo;
        let corrections = retry_with_backoff("load corrections", &policy, || async move {
            storage.corrections().await.map_err(PipelineError::from)
        })
        .await?;
        let processed = retry_with_backoff("load processed markers", &policy, || async move {
            storage.processed_corrections().await.map_err(PipelineError::from)
        })
        .await?;
        let preferences = retry_with_backoff("load preferences", &policy, || async move {
            storage.preferences().await.map_err(PipelineError::from)
        })
        .await?;
        let projects = retry_with_backoff("load projects", &policy, || async move {
            storage.projects().await.map_err(PipelineError::from)
        })
        .await?;

        let log = Arc::new(CorrectionLog::new());
        log.restore(corrections, processed)?;
        let store = Arc::new(PreferenceStore::new());
        store.restore(preferences);
        let resolver = PreferenceResolver::new(Arc::clone(&store), config.confidence);

        let orchestrator = Self {
            prompts: PromptBuilder::new(resolver.clone()),
            evolution: EvolutionEngine::new(
                Arc::clone(&log),
                Arc::clone(&store),
                config.evolution,
                config.confidence,
            ),
            events: EventBus::new(config.progress_capacity),
            semaphore: Arc::new(Semaphore::new(config.generation.max_concurrent)),
            dag: DagTracker::new(),
            locks: DashMap::new(),
            append_lock: Mutex::new(()),
            in_flight: DashMap::new(),
            settled: Notify::new(),
            runs: AtomicU64::new(0),
            compositions: DashMap::new(),
            resolver,
            log,
            store,
            repo,
            generator,
            config,
        };

        for project in &projects {
            let sections = orchestrator.load_sections(project.id).await?;
            orchestrator.hydrate(project, &sections);
        }
        tracing::info!(
            projects = projects.len(),
            corrections = orchestrator.log.len(),
            preferences = orchestrator.store.len(),
            "orchestrator opened"
        );
        Ok(orchestrator)
    }

    fn hydrate(&self, project: &Project, sections: &[Section]) {
        self.dag.sync_sections(project.id, sections);
        if let Some(script) = &project.script {
            if project.state >= ProjectState::ScriptDone {
                self.restore_record(project.id, Unit::Script, project.script_inputs(), script.hash());
            }
        }
        for section in sections {
            for unit in Unit::section_units(section.id, section.section_type) {
                let Some(inputs) = unit_inputs(&self.dag, project, sections, unit) else {
                    continue;
                };
                let digest = inputs.digest();
                let stored = match unit {
                    Unit::Images(_) => section.artifacts.slide_image.as_ref(),
                    Unit::Animations(_) => section.artifacts.animation_video.as_ref(),
                    _ => section.artifacts.narration_audio.as_ref(),
                };
                let produced = match stored {
                    Some(artifact) if artifact.input_digest == digest => Some(artifact.content_hash),
                    None if matches!(unit, Unit::Narration(_))
                        && section.narration_text().trim().is_empty()
                        && project.state >= ProjectState::NarrationDone =>
                    {
                        Some(ContentHash::of_str(""))
                    }
                    _ => None,
                };
                if let Some(produced) = produced {
                    self.restore_record(project.id, unit, inputs, produced);
                }
            }
        }
    }

    fn restore_record(
        &self,
        project: ProjectId,
        unit: Unit,
        inputs: kino_artifact::InputSet,
        produced: ContentHash,
    ) {
        if let Err(err) = self.dag.record_produced(project, unit, inputs, produced) {
            tracing::warn!(project = %project, unit = %unit, error = %err, "stored artifact ignored");
        }
    }

    async fn lock(&self, project: ProjectId) -> OwnedMutexGuard<()> {
        let mutex = Arc::clone(self.locks.entry(project).or_default().value());
        mutex.lock_owned().await
    }

    async fn load_project(&self, id: ProjectId) -> Result<Project, PipelineError> {
        let repo = &self.repo;
        retry_with_backoff("load project", &self.config.storage, || async move {
            repo.project(id).await.map_err(PipelineError::from)
        })
        .await?
        .ok_or_else(|| PipelineError::project_not_found(id))
    }

    async fn load_sections(&self, id: ProjectId) -> Result<Vec<Section>, PipelineError> {
        let repo = &self.repo;
        retry_with_backoff("load sections", &self.config.storage, || async move {
            repo.sections(id).await.map_err(PipelineError::from)
        })
        .await
    }

    async fn save_project(&self, project: &Project) -> Result<(), PipelineError> {
        let repo = &self.repo;
        retry_with_backoff("save project", &self.config.storage, || async move {
            repo.save_project(project).await.map_err(PipelineError::from)
        })
        .await
    }

    async fn save_sections(&self, id: ProjectId, sections: &[Section]) -> Result<(), PipelineError> {
        let repo = &self.repo;
        retry_with_backoff("save sections", &self.config.storage, || async move {
            repo.save_sections(id, sections).await.map_err(PipelineError::from)
        })
        .await
    }

    async fn persist_preference(&self, preference: &Preference) -> Result<(), PipelineError> {
        let repo = &self.repo;
        retry_with_backoff("save preference", &self.config.storage, || async move {
            repo.save_preference(preference).await.map_err(PipelineError::from)
        })
        .await
    }

    /// Persist, then seal into the in-memory log. The caller holds the
    /// project lock.
    async fn append_correction(&self, draft: CorrectionDraft) -> Result<CorrectionEvent, PipelineError> {
        let _append = self.append_lock.lock().await;
        let event = self.log.seal(draft, Utc::now());
        let repo = &self.repo;
        let sealed = &event;
        retry_with_backoff("append correction", &self.config.storage, || async move {
            repo.append_correction(sealed).await.map_err(PipelineError::from)
        })
        .await?;
        self.log.commit(event.clone())?;
        tracing::info!(
            project = %event.project_id(),
            correction = %event.id,
            sequence = event.sequence,
            stage = %event.draft.stage,
            category = %event.draft.category,
            field = %event.draft.field_path,
            "correction recorded"
        );
        self.events.publish(PipelineEvent::CorrectionRecorded {
            project: event.project_id(),
            correction: event.id,
            stage: event.draft.stage,
        });
        Ok(event)
    }

    /// Mark `units` and their dependents stale and abort in-flight work on
    /// them. The caller holds the project lock.
    fn invalidate(&self, project: ProjectId, units: &[Unit]) -> Result<Vec<Unit>, PipelineError> {
        if units.is_empty() {
            return Ok(Vec::new());
        }
        let frontier = self.dag.invalidate(project, units)?;
        let mut aborted = false;
        for unit in &frontier {
            if let Some((_, entry)) = self.in_flight.remove(&(project, *unit)) {
                entry.abort();
                aborted = true;
                tracing::debug!(project = %project, unit = %unit, "in-flight generation aborted");
            }
        }
        if aborted {
            self.settled.notify_waiters();
        }
        if !frontier.is_empty() {
            self.events.publish(PipelineEvent::UnitsInvalidated {
                project,
                units: frontier.clone(),
            });
        }
        Ok(frontier)
    }

    fn publish_state(&self, project: ProjectId, from: ProjectState, to: ProjectState) {
        if from != to {
            tracing::info!(project = %project, from = %from, to = %to, "project state changed");
            self.events.publish(PipelineEvent::StateChanged { project, from, to });
        }
    }

    /// # Errors
    /// Returns error on an invalid theme or duration, or storage failure.
    pub async fn create_project(
        &self,
        theme: &str,
        duration_target: Option<f64>,
    ) -> Result<Project, PipelineError> {
        let project = Project::new(theme, duration_target, Utc::now())?;
        self.save_project(&project).await?;
        self.dag.sync_sections(project.id, &[]);
        tracing::info!(project = %project.id, "project created");
        Ok(project)
    }

    /// # Errors
    /// Returns [`PipelineError::NotFound`] for unknown projects.
    pub async fn project(&self, id: ProjectId) -> Result<Project, PipelineError> {
        self.load_project(id).await
    }

    /// # Errors
    /// Returns error if storage stays unavailable.
    pub async fn projects(&self) -> Result<Vec<Project>, PipelineError> {
        let repo = &self.repo;
        retry_with_backoff("load projects", &self.config.storage, || async move {
            repo.projects().await.map_err(PipelineError::from)
        })
        .await
    }

    /// Sections in playback order
    ///
    /// # Errors
    /// Returns [`PipelineError::NotFound`] for unknown projects.
    pub async fn sections(&self, id: ProjectId) -> Result<Vec<Section>, PipelineError> {
        self.load_project(id).await?;
        self.load_sections(id).await
    }

    /// Delete a project and its sections. Its corrections stay in the log.
    ///
    /// # Errors
    /// Returns [`PipelineError::NotFound`] for unknown projects.
    pub async fn delete_project(&self, id: ProjectId) -> Result<(), PipelineError> {
        let guard = self.lock(id).await;
        let repo = &self.repo;
        let removed = retry_with_backoff("delete project", &self.config.storage, || async move {
            repo.delete_project(id).await.map_err(PipelineError::from)
        })
        .await?;
        if !removed {
            return Err(PipelineError::project_not_found(id));
        }
        self.in_flight.retain(|(project, _), entry| {
            if *project == id {
                entry.abort();
                false
            } else {
                true
            }
        });
        self.settled.notify_waiters();
        self.dag.remove_project(id);
        self.compositions.remove(&id);
        self.locks.remove(&id);
        drop(guard);
        tracing::info!(project = %id, "project deleted");
        Ok(())
    }

    /// Replace the script document. Sections are rebuilt from it, reusing
    /// section ids by position. The change is recorded as a correction and
    /// everything downstream of the script goes stale.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] if the document is not a JSON
    /// object.
    pub async fn update_script(
        &self,
        project_id: ProjectId,
        document: Value,
    ) -> Result<ScriptUpdate, PipelineError> {
        if !document.is_object() {
            return Err(PipelineError::Validation(
                "script document must be a JSON object".into(),
            ));
        }
        let script = ScriptDocument::new(document);

        let _guard = self.lock(project_id).await;
        let mut project = self.load_project(project_id).await?;
        let sections = self.load_sections(project_id).await?;
        if project.script.as_ref().is_some_and(|s| s.hash() == script.hash()) {
            return Ok(ScriptUpdate {
                correction: None,
                invalidated: Vec::new(),
                dropped: Vec::new(),
                sections,
            });
        }

        let now = Utc::now();
        let prior = project.script.as_ref().map(|s| s.0.to_string());
        let next = sections_from_script(project_id, &sections, &script, now);
        let structural = sections
            .iter()
            .map(|s| s.section_type)
            .ne(next.iter().map(|s| s.section_type));

        let from = project.state;
        project.state = state_machine::advance(project.state, ProjectState::ScriptDone)?;
        project.script = Some(script.clone());
        project.updated_at = now;

        // A stored script always has its correction in the log.
        let category = if structural {
            Category::Structural
        } else {
            Category::Content
        };
        let draft = CorrectionDraft::new(project_id, Stage::Script, category, "script")
            .with_values(prior, Some(script.0.to_string()));
        let correction = self.append_correction(draft).await?;

        self.save_project(&project).await?;
        self.save_sections(project_id, &next).await?;
        self.publish_state(project_id, from, project.state);

        let dropped = self.dag.sync_sections(project_id, &next);
        let invalidated = self.invalidate(project_id, &[Unit::Script])?;
        self.dag
            .record_produced(project_id, Unit::Script, project.script_inputs(), script.hash())?;

        Ok(ScriptUpdate {
            correction: Some(correction),
            invalidated,
            dropped,
            sections: next,
        })
    }

    /// Apply a section edit, record it as a correction and invalidate the
    /// units it touched.
    ///
    /// Narration edits are content corrections at the narration stage,
    /// visual spec edits are style corrections at the image stage, and
    /// type changes and structural edits are structural corrections at the
    /// script stage.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] for edits that do not fit the
    /// current sections and [`PipelineError::StorageUnavailable`] if the
    /// correction cannot be appended; nothing is stored in either case.
    pub async fn apply_section_edit(
        &self,
        project_id: ProjectId,
        edit: SectionEdit,
    ) -> Result<EditReport, PipelineError> {
        let _guard = self.lock(project_id).await;
        let project = self.load_project(project_id).await?;
        let mut sections = self.load_sections(project_id).await?;
        let outcome = apply_edit(project_id, &mut sections, edit.clone(), Utc::now())?;

        let unchanged = outcome.changed.is_empty()
            && outcome.created.is_empty()
            && outcome.removed.is_empty()
            && !outcome.order_changed;
        if unchanged {
            return Ok(EditReport {
                outcome,
                correction: None,
                invalidated: Vec::new(),
                dropped: Vec::new(),
                sections,
            });
        }

        let (stage, category) = match &edit {
            SectionEdit::SetNarration { .. } => (Stage::Narration, Category::Content),
            SectionEdit::SetVisualSpec { .. } => (Stage::Image, Category::Style),
            _ => (Stage::Script, Category::Structural),
        };
        let mut draft = CorrectionDraft::new(project_id, stage, category, edit.field_path())
            .with_values(outcome.prior_value.clone(), outcome.new_value.clone());
        draft.section_id = outcome.section_id;
        draft.section_type = outcome.section_type;
        let correction = self.append_correction(draft).await?;

        self.save_sections(project_id, &sections).await?;
        let dropped = self.dag.sync_sections(project_id, &sections);
        let mut touched = Vec::new();
        for unit in outcome
            .changed
            .iter()
            .chain(&outcome.created)
            .filter_map(|id| find(&sections, *id))
            .flat_map(|s| Unit::section_units(s.id, s.section_type))
        {
            let Some(inputs) = unit_inputs(&self.dag, &project, &sections, unit) else {
                continue;
            };
            if self.dag.is_stale(project_id, unit, &inputs)? {
                touched.push(unit);
            }
        }
        let mut invalidated = self.invalidate(project_id, &touched)?;
        if outcome.order_changed && !invalidated.contains(&Unit::Composition) {
            invalidated.push(Unit::Composition);
        }

        tracing::info!(
            project = %project_id,
            edit = edit.field_path(),
            invalidated = invalidated.len(),
            dropped = dropped.len(),
            "section edit applied"
        );
        Ok(EditReport {
            outcome,
            correction: Some(correction),
            invalidated,
            dropped,
            sections,
        })
    }

    /// Append a correction and invalidate the unit it concerns plus
    /// everything downstream.
    ///
    /// A missing section type snapshot is filled from the stored section.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] for an empty field path or a
    /// section-level stage without a section, [`PipelineError::NotFound`]
    /// for unknown projects or sections, and
    /// [`PipelineError::StorageUnavailable`] once retries run out.
    pub async fn record_correction(
        &self,
        mut draft: CorrectionDraft,
    ) -> Result<CorrectionEvent, PipelineError> {
        if draft.field_path.trim().is_empty() {
            return Err(PipelineError::Validation(
                "correction field path must not be empty".into(),
            ));
        }
        let project_id = draft.project_id;
        let unit = Unit::for_correction(draft.stage, draft.section_id).ok_or_else(|| {
            PipelineError::Validation(format!("{} corrections need a section", draft.stage))
        })?;

        let _guard = self.lock(project_id).await;
        self.load_project(project_id).await?;
        if let Some(section_id) = draft.section_id {
            let sections = self.load_sections(project_id).await?;
            let section = find(&sections, section_id)
                .ok_or_else(|| PipelineError::section_not_found(section_id))?;
            draft.section_type.get_or_insert(section.section_type);
        }
        self.dag.stale_frontier(project_id, &[unit])?;

        let event = self.append_correction(draft).await?;
        self.invalidate(project_id, &[unit])?;
        Ok(event)
    }

    /// Analyze an edited slide image and record one style correction per
    /// detected change.
    ///
    /// # Errors
    /// Returns [`PipelineError::GenerationFailure`] if the analyzer fails;
    /// nothing is recorded in that case.
    pub async fn record_visual_diff(
        &self,
        project_id: ProjectId,
        section_id: SectionId,
        analyzer: &dyn VisualDiffAnalyzer,
        original: &str,
        edited: &str,
    ) -> Result<Vec<CorrectionEvent>, PipelineError> {
        let sections = self.sections(project_id).await?;
        let section = find(&sections, section_id)
            .ok_or_else(|| PipelineError::section_not_found(section_id))?;
        let drafts = analyze_edit(
            analyzer,
            project_id,
            Some((section.id, section.section_type)),
            original,
            edited,
        )
        .await?;

        let mut recorded = Vec::with_capacity(drafts.len());
        for draft in drafts {
            recorded.push(self.record_correction(draft).await?);
        }
        Ok(recorded)
    }

    /// Newest first
    #[must_use]
    pub fn corrections(&self, filter: &LogFilter) -> Vec<CorrectionEvent> {
        self.log.query(filter)
    }

    #[must_use]
    pub fn correction_stats(&self, project: Option<ProjectId>) -> CorrectionStats {
        self.log.stats(project)
    }

    /// Declared units whose recorded inputs no longer match, in
    /// topological order.
    ///
    /// # Errors
    /// Returns [`PipelineError::NotFound`] for unknown projects.
    pub async fn stale_units(&self, project_id: ProjectId) -> Result<Vec<Unit>, PipelineError> {
        let project = self.load_project(project_id).await?;
        let sections = self.load_sections(project_id).await?;
        let units = self.dag.units(project_id);
        self.stale_among(&project, &sections, &units)
    }

    fn stale_among(
        &self,
        project: &Project,
        sections: &[Section],
        units: &[Unit],
    ) -> Result<Vec<Unit>, PipelineError> {
        let mut stale = Vec::new();
        for unit in units {
            let fresh = match unit_inputs(&self.dag, project, sections, *unit) {
                Some(inputs) => !self.dag.is_stale(project.id, *unit, &inputs)?,
                None => false,
            };
            if !fresh {
                stale.push(*unit);
            }
        }
        Ok(stale)
    }

    /// Per-unit tracker state
    #[must_use]
    pub fn unit_states(&self, project: ProjectId) -> BTreeMap<Unit, UnitState> {
        self.dag.snapshot(project)
    }

    /// # Errors
    /// Returns [`PipelineError::NotFound`] for unknown projects.
    pub async fn compose_status(&self, project_id: ProjectId) -> Result<ComposeStatus, PipelineError> {
        let project = self.load_project(project_id).await?;
        let sections = self.load_sections(project_id).await?;
        let required = section_units(&sections);
        let missing = self.stale_among(&project, &sections, &required)?;
        let total_duration: f64 = sections.iter().map(Section::effective_duration).sum();
        Ok(ComposeStatus {
            state: project.state,
            ready: !sections.is_empty() && missing.is_empty(),
            missing,
            sections_count: sections.len(),
            total_duration,
            estimated_size_bytes: estimated_size(total_duration),
            ffmpeg_available: self.generator.ffmpeg_available().await,
            video: self.compositions.get(&project_id).map(|v| v.value().clone()),
        })
    }

    /// Learn preferences from unprocessed corrections and persist what
    /// changed.
    ///
    /// # Errors
    /// Returns [`PipelineError::EvolutionInFlight`] if a run for the same
    /// project, or a whole-log run, is active.
    pub async fn evolve_preferences(
        &self,
        request: EvolutionRequest,
    ) -> Result<EvolutionReport, PipelineError> {
        let report = self.evolution.evolve(request)?;
        let touched: Vec<Preference> = report
            .touched()
            .into_iter()
            .filter_map(|id| self.store.get(id))
            .collect();
        try_join_all(touched.iter().map(|p| self.persist_preference(p))).await?;
        if !report.processed.is_empty() {
            let repo = &self.repo;
            let processed = report.processed.as_slice();
            retry_with_backoff("mark corrections processed", &self.config.storage, || async move {
                repo.mark_processed(processed).await.map_err(PipelineError::from)
            })
            .await?;
        }
        tracing::info!(
            project = ?request.project,
            analyzed = report.analyzed,
            created = report.created.len(),
            reinforced = report.reinforced.len(),
            weakened = report.weakened.len(),
            deferred = report.deferred.len(),
            "preferences evolved"
        );
        self.events.publish(PipelineEvent::PreferencesEvolved {
            project: request.project,
            created: report.created.clone(),
            reinforced: report.reinforced.clone(),
            weakened: report.weakened.clone(),
        });
        Ok(report)
    }

    #[must_use]
    pub fn resolve_preferences(&self, ctx: &ResolveContext) -> Resolution {
        self.resolver.resolve(ctx)
    }

    #[must_use]
    pub fn suggestions(&self, ctx: &ResolveContext) -> Vec<Suggestion> {
        self.resolver.suggestions(ctx)
    }

    #[must_use]
    pub fn build_prompt(&self, kind: PromptKind, base: &str, ctx: &ResolveContext) -> BuiltPrompt {
        self.prompts.build(kind, base, ctx)
    }

    #[must_use]
    pub fn personalized_system_prompt(&self, base: &str) -> String {
        self.prompts.personalized_system_prompt(base)
    }

    /// Declare a preference directly
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] if the draft is invalid.
    pub async fn create_preference(&self, draft: PreferenceDraft) -> Result<Preference, PipelineError> {
        let preference = draft.into_preference(Utc::now())?;
        self.persist_preference(&preference).await?;
        let preference = self.store.insert(preference)?;
        tracing::info!(preference = %preference.id, scope = %preference.scope, "preference created");
        Ok(preference)
    }

    /// # Errors
    /// Returns error for unknown preferences or invalid updates.
    pub async fn update_preference(
        &self,
        id: PreferenceId,
        update: PreferenceUpdate,
    ) -> Result<Preference, PipelineError> {
        let updated = self
            .store
            .update(id, update, self.resolver.policy(), Utc::now())?;
        self.persist_preference(&updated).await?;
        Ok(updated)
    }

    /// Soft delete; the record stays available to audits
    ///
    /// # Errors
    /// Returns error for unknown preferences.
    pub async fn deactivate_preference(&self, id: PreferenceId) -> Result<Preference, PipelineError> {
        let preference = self.store.deactivate(id, Utc::now())?;
        self.persist_preference(&preference).await?;
        Ok(preference)
    }

    /// Promote a suggestion to the auto-apply tier
    ///
    /// # Errors
    /// Returns error unless the preference is an active suggestion.
    pub async fn accept_suggestion(&self, id: PreferenceId) -> Result<Preference, PipelineError> {
        let preference = self.resolver.accept_suggestion(id)?;
        self.persist_preference(&preference).await?;
        Ok(preference)
    }

    /// Every stored preference matching `filter`, inactive ones included
    #[must_use]
    pub fn preferences(&self, filter: &PreferenceFilter) -> Vec<Preference> {
        self.resolver.audit(filter)
    }

    #[must_use]
    pub fn preference_profile(&self) -> PreferenceProfile {
        self.resolver.profile()
    }

    /// Progress notifications from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn config(&self) -> &KinoConfig {
        &self.config
    }

    /// Evolution engine, for run-slot inspection
    #[must_use]
    pub fn evolution(&self) -> &EvolutionEngine {
        &self.evolution
    }

    /// # Errors
    /// Returns error if the in-memory hash chain does not verify.
    pub fn verify_log(&self) -> Result<(), PipelineError> {
        Ok(self.log.verify_integrity()?)
    }
}

/// Narration, image and animation units of every section
fn section_units(sections: &[Section]) -> Vec<Unit> {
    sections
        .iter()
        .flat_map(|s| Unit::section_units(s.id, s.section_type))
        .collect()
}

fn visual_units(sections: &[Section]) -> Vec<Unit> {
    section_units(sections)
        .into_iter()
        .filter(|u| matches!(u, Unit::Images(_) | Unit::Animations(_)))
        .collect()
}

fn narration_units(sections: &[Section]) -> Vec<Unit> {
    sections.iter().map(|s| Unit::Narration(s.id)).collect()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn estimated_size(total_secs: f64) -> u64 {
    (total_secs / 60.0 * ESTIMATED_BYTES_PER_MINUTE).round().max(0.0) as u64
}

/// Category a prompt-change correction is filed under
fn regenerate_category(unit: Unit) -> Category {
    match unit {
        Unit::Images(_) | Unit::Animations(_) => Category::Style,
        Unit::Composition => Category::Technical,
        Unit::Narration(_) | Unit::Script => Category::Content,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_estimate_is_five_mib_per_minute() {
        assert_eq!(estimated_size(60.0), 5 * 1024 * 1024);
        assert_eq!(estimated_size(0.0), 0);
        assert_eq!(estimated_size(15.0), 5 * 1024 * 1024 / 4);
    }

    #[test]
    fn prompt_changes_are_filed_by_unit() {
        let s = SectionId::new();
        assert_eq!(regenerate_category(Unit::Images(s)), Category::Style);
        assert_eq!(regenerate_category(Unit::Narration(s)), Category::Content);
        assert_eq!(regenerate_category(Unit::Composition), Category::Technical);
    }
}
