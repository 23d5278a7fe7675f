//! Stage runs
//!
//! A run takes the stale units of a stage, generates them concurrently
//! under the shared semaphore, and commits each result only if the unit's
//! epoch and inputs are unchanged. Superseded or aborted units go back on
//! the queue for a bounded number of rounds.
//!
//! A unit is claimed in the in-flight registry while its request is built.
//! Another run that finds it claimed waits for it to settle and then looks
//! at it again, so overlapping runs never generate the same unit twice.

use super::inputs::{base_prompt, find, prompt_kind, sections_from_script, unit_inputs};
use super::{narration_units, regenerate_category, section_units, visual_units, Orchestrator};
use crate::config::GenerationPolicy;
use crate::error::PipelineError;
use crate::events::PipelineEvent;
use crate::generation::{GeneratedArtifact, GenerationRequest, Generator};
use crate::retry::retry_with_backoff;
use chrono::Utc;
use kino_artifact::{ArtifactRef, ContentHash, ProjectId, ProjectState, ScriptDocument};
use kino_feedback::ResolveContext;
use kino_kernel::{state_machine, CorrectionDraft, DagError, Stage, Unit};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinSet};

/// A unit that could not be generated
#[derive(Debug, Clone, PartialEq)]
pub struct UnitFailure {
    pub unit: Unit,
    pub error: PipelineError,
}

/// Outcome of one stage run
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub stage: Stage,
    /// Generated and committed by this run
    pub completed: Vec<Unit>,
    /// Already fresh, nothing generated
    pub skipped: Vec<Unit>,
    /// Gave up after retries; the rest of the stage still ran
    pub failed: Vec<UnitFailure>,
    /// Kept being superseded until the requeue rounds ran out
    pub discarded: Vec<Unit>,
    /// Project state after the run
    pub state: ProjectState,
}

impl StageReport {
    fn new(stage: Stage, state: ProjectState) -> Self {
        Self {
            stage,
            completed: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            discarded: Vec::new(),
            state,
        }
    }

    /// No failed or discarded units
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.discarded.is_empty()
    }
}

/// What composition produced
#[derive(Debug, Clone, PartialEq)]
pub enum ComposeOutcome {
    Playable(ArtifactRef),
    /// Completion recorded without a playable video
    Degraded { reason: String },
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComposeReport {
    pub outcome: ComposeOutcome,
    pub stage: StageReport,
}

/// Claim on a unit held by one stage run. The abort handle is filled in
/// once the generation task is spawned.
#[derive(Debug)]
pub(super) struct InFlight {
    run: u64,
    task: Option<AbortHandle>,
}

impl InFlight {
    pub(super) fn abort(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// Drops every claim a run still holds, however the run ends
struct Claims<'a> {
    orchestrator: &'a Orchestrator,
    project: ProjectId,
    run: u64,
}

impl Drop for Claims<'_> {
    fn drop(&mut self) {
        let (project, run) = (self.project, self.run);
        let before = self.orchestrator.in_flight.len();
        self.orchestrator.in_flight.retain(|(p, _), entry| {
            if *p == project && entry.run == run {
                entry.abort();
                false
            } else {
                true
            }
        });
        if self.orchestrator.in_flight.len() != before {
            self.orchestrator.settled.notify_waiters();
        }
    }
}

#[derive(Debug)]
struct Job {
    unit: Unit,
    epoch: u64,
    request: GenerationRequest,
}

enum Commit {
    Applied,
    Superseded,
}

impl Orchestrator {
    /// Generate the script and rebuild sections from it.
    ///
    /// A fresh script is not regenerated; record a prompt change with
    /// [`Orchestrator::regenerate_unit`] to force one.
    ///
    /// # Errors
    /// Returns [`PipelineError::NotFound`] for unknown projects. Generation
    /// failures are reported in the [`StageReport`].
    pub async fn generate_script(&self, project_id: ProjectId) -> Result<StageReport, PipelineError> {
        self.load_project(project_id).await?;
        let mut report = self.run_stage(project_id, Stage::Script, vec![Unit::Script]).await?;
        self.finish_stage(project_id, ProjectState::ScriptDone, &mut report)
            .await?;
        Ok(report)
    }

    /// Generate every stale slide image and animation.
    ///
    /// # Errors
    /// Returns [`PipelineError::PrecursorMissing`] when the script is absent
    /// or stale; the project state is unchanged.
    pub async fn generate_visuals(&self, project_id: ProjectId) -> Result<StageReport, PipelineError> {
        let units = {
            let _guard = self.lock(project_id).await;
            let project = self.load_project(project_id).await?;
            let sections = self.load_sections(project_id).await?;
            state_machine::validate_transition(project.state, ProjectState::VisualsDone)
                .map_err(|_| missing_script(Stage::Image))?;
            let missing = self.stale_among(&project, &sections, &[Unit::Script])?;
            if project.script.is_none() || !missing.is_empty() {
                return Err(missing_script(Stage::Image));
            }
            visual_units(&sections)
        };
        let mut report = self.run_stage(project_id, Stage::Image, units).await?;
        self.finish_stage(project_id, ProjectState::VisualsDone, &mut report)
            .await?;
        Ok(report)
    }

    /// Generate every stale narration track. Sections without narration
    /// text are recorded as produced with no audio.
    ///
    /// # Errors
    /// Returns [`PipelineError::PrecursorMissing`] unless the script and
    /// every visual unit are fresh.
    pub async fn generate_narration(
        &self,
        project_id: ProjectId,
    ) -> Result<StageReport, PipelineError> {
        let units = {
            let _guard = self.lock(project_id).await;
            let project = self.load_project(project_id).await?;
            let sections = self.load_sections(project_id).await?;
            let mut required = vec![Unit::Script];
            required.extend(visual_units(&sections));
            let missing = self.stale_among(&project, &sections, &required)?;
            if !missing.is_empty() {
                return Err(PipelineError::PrecursorMissing {
                    stage: Stage::Narration,
                    missing,
                });
            }
            state_machine::validate_transition(project.state, ProjectState::NarrationDone)?;
            narration_units(&sections)
        };
        let mut report = self.run_stage(project_id, Stage::Narration, units).await?;
        self.finish_stage(project_id, ProjectState::NarrationDone, &mut report)
            .await?;
        Ok(report)
    }

    /// Compose the final video.
    ///
    /// Without ffmpeg the project still reaches `composed`, but the outcome
    /// is [`ComposeOutcome::Degraded`] and a degraded event is published.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] for a project without sections
    /// and [`PipelineError::PrecursorMissing`] when any section unit is
    /// stale or absent.
    pub async fn compose(&self, project_id: ProjectId) -> Result<ComposeReport, PipelineError> {
        {
            let _guard = self.lock(project_id).await;
            let mut project = self.load_project(project_id).await?;
            let sections = self.load_sections(project_id).await?;
            if sections.is_empty() {
                return Err(PipelineError::Validation(
                    "project has no sections to compose".into(),
                ));
            }
            let mut required = vec![Unit::Script];
            required.extend(section_units(&sections));
            let missing = self.stale_among(&project, &sections, &required)?;
            if !missing.is_empty() {
                return Err(PipelineError::PrecursorMissing {
                    stage: Stage::Composition,
                    missing,
                });
            }
            state_machine::validate_transition(project.state, ProjectState::Composed)?;

            if !self.generator.ffmpeg_available().await {
                let reason = "ffmpeg unavailable, no playable video produced".to_string();
                let from = project.state;
                project.state = state_machine::advance(project.state, ProjectState::Composed)?;
                project.updated_at = Utc::now();
                self.save_project(&project).await?;
                self.publish_state(project_id, from, project.state);
                tracing::warn!(project = %project_id, "composition degraded: {reason}");
                self.events.publish(PipelineEvent::Degraded {
                    project: project_id,
                    reason: reason.clone(),
                });
                return Ok(ComposeReport {
                    outcome: ComposeOutcome::Degraded { reason },
                    stage: StageReport::new(Stage::Composition, project.state),
                });
            }
        }

        let mut report = self
            .run_stage(project_id, Stage::Composition, vec![Unit::Composition])
            .await?;
        self.finish_stage(project_id, ProjectState::Composed, &mut report)
            .await?;
        let video = self.compositions.get(&project_id).map(|v| v.value().clone());
        let outcome = match video {
            Some(video) if report.is_complete() => ComposeOutcome::Playable(video),
            _ => ComposeOutcome::Failed,
        };
        Ok(ComposeReport {
            outcome,
            stage: report,
        })
    }

    /// Regenerate one unit with a different prompt.
    ///
    /// The prompt change is recorded as a correction, which invalidates the
    /// unit and everything downstream. Visual units keep the prompt on
    /// their section for later runs.
    ///
    /// # Errors
    /// Returns [`PipelineError::InvalidUnit`] for units not declared for the
    /// project.
    pub async fn regenerate_unit(
        &self,
        project_id: ProjectId,
        unit: Unit,
        prompt: &str,
        feedback: Option<&str>,
    ) -> Result<StageReport, PipelineError> {
        if prompt.trim().is_empty() {
            return Err(PipelineError::Validation("prompt must not be empty".into()));
        }
        {
            let _guard = self.lock(project_id).await;
            self.load_project(project_id).await?;
            let mut sections = self.load_sections(project_id).await?;
            self.dag.stale_frontier(project_id, &[unit])?;

            let stage = unit.stage();
            let mut draft = CorrectionDraft::new(
                project_id,
                stage,
                regenerate_category(unit),
                format!("{stage}.prompt"),
            );
            if let Some(text) = feedback {
                draft = draft.with_feedback(text);
            }
            let mut prior = None;
            if let Some(section_id) = unit.section() {
                let section = sections
                    .iter_mut()
                    .find(|s| s.id == section_id)
                    .ok_or_else(|| PipelineError::section_not_found(section_id))?;
                draft = draft.with_section(section.id, section.section_type);
                if matches!(unit, Unit::Images(_) | Unit::Animations(_)) {
                    prior = section.generation_prompt.replace(prompt.to_string());
                    section.updated_at = Utc::now();
                    self.save_sections(project_id, &sections).await?;
                }
            }
            let draft = draft.with_prompts(prior, Some(prompt.to_string()));
            self.append_correction(draft).await?;
            self.invalidate(project_id, &[unit])?;
        }

        let mut report = self.run_stage(project_id, unit.stage(), vec![unit]).await?;
        self.finish_stage(project_id, completed_state(unit), &mut report)
            .await?;
        Ok(report)
    }

    /// Generate `units` until each is committed, failed, or out of
    /// requeue rounds.
    async fn run_stage(
        &self,
        project_id: ProjectId,
        stage: Stage,
        units: Vec<Unit>,
    ) -> Result<StageReport, PipelineError> {
        let run = self.runs.fetch_add(1, Ordering::Relaxed);
        let _claims = Claims {
            orchestrator: self,
            project: project_id,
            run,
        };
        let mut report = StageReport::new(stage, ProjectState::Init);
        let mut queue = units;
        let mut round = 0;
        while !queue.is_empty() {
            if round > self.config.generation.max_requeue_rounds {
                tracing::warn!(
                    project = %project_id,
                    stage = %stage,
                    units = queue.len(),
                    "requeue rounds exhausted, superseded results dropped"
                );
                report.discarded.append(&mut queue);
                break;
            }
            let mut elsewhere = Vec::new();
            let jobs = self
                .prepare(project_id, run, &queue, &mut report, &mut elsewhere)
                .await?;
            queue = self.execute(project_id, run, jobs, &mut report).await;
            if !elsewhere.is_empty() {
                self.wait_settled(project_id, &elsewhere).await;
                queue.extend(elsewhere);
                queue.sort();
                queue.dedup();
            }
            round += 1;
        }
        Ok(report)
    }

    /// Wait until none of `units` is claimed by any run
    async fn wait_settled(&self, project_id: ProjectId, units: &[Unit]) {
        loop {
            let settled = self.settled.notified();
            if units
                .iter()
                .all(|unit| !self.in_flight.contains_key(&(project_id, *unit)))
            {
                return;
            }
            tracing::debug!(project = %project_id, units = units.len(), "waiting on another run");
            settled.await;
        }
    }

    /// Build requests for the units that are still stale and claim them.
    /// Units another run has claimed go to `elsewhere`.
    async fn prepare(
        &self,
        project_id: ProjectId,
        run: u64,
        queue: &[Unit],
        report: &mut StageReport,
        elsewhere: &mut Vec<Unit>,
    ) -> Result<Vec<Job>, PipelineError> {
        let _guard = self.lock(project_id).await;
        let project = self.load_project(project_id).await?;
        let mut sections = self.load_sections(project_id).await?;
        let mut sections_dirty = false;
        let mut jobs = Vec::new();

        for &unit in queue {
            let Some(inputs) = unit_inputs(&self.dag, &project, &sections, unit) else {
                tracing::debug!(project = %project_id, unit = %unit, "section removed, unit dropped");
                continue;
            };
            match self.dag.is_stale(project_id, unit, &inputs) {
                Ok(true) => {}
                Ok(false) => {
                    report.skipped.push(unit);
                    continue;
                }
                Err(DagError::InvalidUnit { reason, .. }) => {
                    tracing::debug!(project = %project_id, unit = %unit, reason, "unit no longer declared");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
            if self.in_flight.contains_key(&(project_id, unit)) {
                elsewhere.push(unit);
                continue;
            }
            let epoch = self.dag.epoch(project_id, unit);

            if let Unit::Narration(section_id) = unit {
                let silent = find(&sections, section_id)
                    .is_some_and(|s| s.narration_text().trim().is_empty());
                if silent {
                    self.dag
                        .commit_produced(project_id, unit, epoch, inputs, ContentHash::of_str(""))?;
                    if let Some(section) = sections.iter_mut().find(|s| s.id == section_id) {
                        section.artifacts.narration_audio = None;
                    }
                    sections_dirty = true;
                    tracing::debug!(project = %project_id, unit = %unit, "no narration text, recorded without audio");
                    report.completed.push(unit);
                    continue;
                }
            }

            let section = unit.section().and_then(|id| find(&sections, id)).cloned();
            let base = base_prompt(&project, &sections, unit);
            let (prompt, applied) = match prompt_kind(unit) {
                Some(kind) => {
                    let mut ctx = ResolveContext::new(project_id);
                    if let Some(s) = &section {
                        ctx = ctx.section_type(s.section_type);
                    }
                    let built = self.prompts.build(kind, &base, &ctx);
                    (built.prompt, built.applied)
                }
                None => (base, Vec::new()),
            };
            self.in_flight
                .insert((project_id, unit), InFlight { run, task: None });
            jobs.push(Job {
                unit,
                epoch,
                request: GenerationRequest {
                    project: project_id,
                    unit,
                    stage: unit.stage(),
                    inputs,
                    applied_preferences: applied,
                    prompt,
                    section,
                },
            });
        }

        if sections_dirty {
            self.save_sections(project_id, &sections).await?;
        }
        Ok(jobs)
    }

    /// Run `jobs` concurrently and commit what comes back. Returns the
    /// units to try again.
    async fn execute(
        &self,
        project_id: ProjectId,
        run: u64,
        jobs: Vec<Job>,
        report: &mut StageReport,
    ) -> Vec<Unit> {
        let mut set = JoinSet::new();
        let mut pending: HashSet<Unit> = HashSet::new();
        for job in jobs {
            let unit = job.unit;
            let generator = Arc::clone(&self.generator);
            let semaphore = Arc::clone(&self.semaphore);
            let policy = self.config.generation;
            self.events.publish(PipelineEvent::UnitStarted {
                project: project_id,
                unit,
            });
            let handle = set.spawn(async move {
                let result = generate(generator.as_ref(), semaphore, &policy, &job.request).await;
                (job, result)
            });
            match self
                .in_flight
                .get_mut(&(project_id, unit))
                .filter(|entry| entry.run == run)
            {
                Some(mut entry) => entry.task = Some(handle),
                // invalidated since the claim; comes back as a requeue
                None => handle.abort(),
            }
            pending.insert(unit);
        }

        let mut requeue = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (job, result) = match joined {
                Ok(done) => done,
                Err(err) if err.is_cancelled() => continue,
                Err(err) => {
                    tracing::error!(project = %project_id, error = %err, "generation task failed");
                    continue;
                }
            };
            let unit = job.unit;
            pending.remove(&unit);

            let outcome = match result {
                Ok(artifact) => self.commit(project_id, &job, artifact).await,
                Err(err) => Err(err),
            };
            self.release(project_id, run, unit);
            match outcome {
                Ok(Commit::Applied) => {
                    report.completed.push(unit);
                    self.events.publish(PipelineEvent::UnitCompleted {
                        project: project_id,
                        unit,
                    });
                }
                Ok(Commit::Superseded) => {
                    tracing::warn!(
                        project = %project_id,
                        unit = %unit,
                        epoch = job.epoch,
                        "stale result discarded, unit requeued"
                    );
                    self.events.publish(PipelineEvent::UnitDiscarded {
                        project: project_id,
                        unit,
                    });
                    requeue.push(unit);
                }
                Err(error) => {
                    tracing::warn!(project = %project_id, unit = %unit, error = %error, "unit generation failed");
                    self.events.publish(PipelineEvent::UnitFailed {
                        project: project_id,
                        unit,
                        reason: error.to_string(),
                    });
                    report.failed.push(UnitFailure { unit, error });
                }
            }
        }

        for unit in pending {
            tracing::debug!(project = %project_id, unit = %unit, "generation aborted by a newer change, unit requeued");
            self.release(project_id, run, unit);
            requeue.push(unit);
        }
        requeue.sort();
        requeue
    }

    fn release(&self, project_id: ProjectId, run: u64, unit: Unit) {
        if self
            .in_flight
            .remove_if(&(project_id, unit), |_, entry| entry.run == run)
            .is_some()
        {
            self.settled.notify_waiters();
        }
    }

    /// Store a result if its unit was not superseded while it ran
    async fn commit(
        &self,
        project_id: ProjectId,
        job: &Job,
        artifact: GeneratedArtifact,
    ) -> Result<Commit, PipelineError> {
        let _guard = self.lock(project_id).await;
        let mut project = self.load_project(project_id).await?;
        let mut sections = self.load_sections(project_id).await?;
        let unit = job.unit;

        let Some(current) = unit_inputs(&self.dag, &project, &sections, unit) else {
            return Ok(Commit::Superseded);
        };
        let digest = current.digest();
        if digest != job.request.inputs.digest() || self.dag.epoch(project_id, unit) != job.epoch {
            return Ok(Commit::Superseded);
        }
        let stored = ArtifactRef {
            location: artifact.location.clone(),
            content_hash: artifact.content_hash,
            input_digest: digest,
        };
        let now = Utc::now();

        match unit {
            Unit::Script => {
                let document = artifact.document.ok_or_else(|| PipelineError::GenerationFailure {
                    target: unit.to_string(),
                    reason: "generator returned no script document".into(),
                })?;
                let script = ScriptDocument::new(document);
                let next = sections_from_script(project_id, &sections, &script, now);
                let produced = script.hash();
                project.script = Some(script);
                project.updated_at = now;
                self.save_project(&project).await?;
                self.save_sections(project_id, &next).await?;
                self.dag
                    .commit_produced(project_id, unit, job.epoch, current, produced)?;
                self.dag.sync_sections(project_id, &next);
            }
            Unit::Composition => {
                self.dag
                    .commit_produced(project_id, unit, job.epoch, current, artifact.content_hash)?;
                self.compositions.insert(project_id, stored);
            }
            Unit::Narration(id) | Unit::Images(id) | Unit::Animations(id) => {
                let section = sections
                    .iter_mut()
                    .find(|s| s.id == id)
                    .ok_or_else(|| PipelineError::section_not_found(id))?;
                match unit {
                    Unit::Narration(_) => {
                        section.artifacts.narration_audio = Some(stored);
                        if let Some(secs) = artifact.duration_secs {
                            section.duration = Some(secs);
                        }
                    }
                    Unit::Images(_) => section.artifacts.slide_image = Some(stored),
                    _ => section.artifacts.animation_video = Some(stored),
                }
                section.updated_at = now;
                self.save_sections(project_id, &sections).await?;
                self.dag
                    .commit_produced(project_id, unit, job.epoch, current, artifact.content_hash)?;
            }
        }
        tracing::debug!(project = %project_id, unit = %unit, "unit committed");
        Ok(Commit::Applied)
    }

    /// Advance the project when every unit of the stage is fresh
    async fn finish_stage(
        &self,
        project_id: ProjectId,
        completed: ProjectState,
        report: &mut StageReport,
    ) -> Result<(), PipelineError> {
        let _guard = self.lock(project_id).await;
        let mut project = self.load_project(project_id).await?;
        let sections = self.load_sections(project_id).await?;
        let units = match completed {
            ProjectState::Init | ProjectState::ScriptDone => vec![Unit::Script],
            ProjectState::VisualsDone => visual_units(&sections),
            ProjectState::NarrationDone => narration_units(&sections),
            ProjectState::Composed => vec![Unit::Composition],
        };
        let stale = self.stale_among(&project, &sections, &units)?;
        if stale.is_empty() {
            if let Ok(next) = state_machine::advance(project.state, completed) {
                let from = project.state;
                if next != from {
                    project.state = next;
                    project.updated_at = Utc::now();
                    self.save_project(&project).await?;
                    self.publish_state(project_id, from, next);
                }
            }
        } else {
            tracing::info!(
                project = %project_id,
                stage = %report.stage,
                stale = stale.len(),
                "stage incomplete, state unchanged"
            );
        }
        report.state = project.state;
        Ok(())
    }
}

fn missing_script(stage: Stage) -> PipelineError {
    PipelineError::PrecursorMissing {
        stage,
        missing: vec![Unit::Script],
    }
}

fn completed_state(unit: Unit) -> ProjectState {
    match unit {
        Unit::Script => ProjectState::ScriptDone,
        Unit::Images(_) | Unit::Animations(_) => ProjectState::VisualsDone,
        Unit::Narration(_) => ProjectState::NarrationDone,
        Unit::Composition => ProjectState::Composed,
    }
}

/// One generation call under the semaphore, with timeout and retries
async fn generate(
    generator: &dyn Generator,
    semaphore: Arc<Semaphore>,
    policy: &GenerationPolicy,
    request: &GenerationRequest,
) -> Result<GeneratedArtifact, PipelineError> {
    let target = request.unit.to_string();
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|_| PipelineError::GenerationFailure {
            target: target.clone(),
            reason: "generation pool closed".into(),
        })?;
    let timeout = policy.timeout();
    let after_ms = policy.timeout_ms;
    let label = format!("generate {target}");
    let target = target.as_str();
    retry_with_backoff(&label, &policy.retry, || async move {
        match tokio::time::timeout(timeout, generator.generate(request.clone())).await {
            Ok(result) => result.map_err(PipelineError::from),
            Err(_) => Err(PipelineError::Timeout {
                target: target.to_string(),
                after_ms,
            }),
        }
    })
    .await
}
