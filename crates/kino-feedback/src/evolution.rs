//! Preference evolution
//!
//! Mines unprocessed corrections into preferences. Evidence is grouped by
//! `(category, concern, scope)`; the modal direction of a group corroborates
//! and every other direction contradicts. Confidence moves only along the
//! curves of [`EvolutionPolicy`].
//!
//! Runs are reproducible: preference ids are derived from the group key and
//! every timestamp comes from the evidence itself.

use crate::error::{FeedbackError, ValidationError};
use crate::preference::{ConfidencePolicy, Origin, Preference, PreferenceScope};
use crate::store::PreferenceStore;
use chrono::Utc;
use kino_artifact::{PreferenceId, ProjectId, SectionType};
use kino_kernel::{Category, CorrectionEvent, CorrectionId, CorrectionLog};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// Confidence curves and batching limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionPolicy {
    /// Ceiling for a freshly inferred preference
    pub first_inference_cap: f64,
    /// Base of the first-inference curve `1 - base^n`
    pub first_inference_base: f64,
    /// Asymptote of the reinforcement step
    pub growth_ceiling: f64,
    /// Reinforcement step for a single corroborating event
    pub growth_first_step: f64,
    /// Upper bound for any inferred confidence
    pub max_confidence: f64,
    /// Largest fraction a contradiction batch can remove
    pub decay: f64,
    /// Base of the contradiction curve `1 - base^k`
    pub decay_base: f64,
    /// Corroborating events required before a content preference forms
    pub content_min_corroboration: usize,
    /// Events claimed per run when the request sets no limit
    pub default_limit: usize,
}

impl Default for EvolutionPolicy {
    fn default() -> Self {
        Self {
            first_inference_cap: 0.8,
            first_inference_base: 0.65,
            growth_ceiling: 0.75,
            growth_first_step: 0.55,
            max_confidence: 0.99,
            decay: 0.5,
            decay_base: 0.5,
            content_min_corroboration: 2,
            default_limit: 50,
        }
    }
}

impl EvolutionPolicy {
    /// `min(cap, consistency * (1 - base^n))`
    #[must_use]
    pub fn initial_confidence(&self, corroborating: usize, consistency: f64) -> f64 {
        let n = i32::try_from(corroborating).unwrap_or(i32::MAX);
        (consistency * (1.0 - self.first_inference_base.powi(n))).min(self.first_inference_cap)
    }

    /// Reinforcement step for `k` corroborating events
    #[must_use]
    pub fn step(&self, k: usize) -> f64 {
        let k = i32::try_from(k).unwrap_or(i32::MAX);
        let ratio = 1.0 - self.growth_first_step / self.growth_ceiling;
        self.growth_ceiling * (1.0 - ratio.powi(k))
    }

    /// `c + (1 - c) * consistency * step(k)`, capped
    #[must_use]
    pub fn reinforce(&self, confidence: f64, k: usize, consistency: f64) -> f64 {
        (confidence + (1.0 - confidence) * consistency * self.step(k)).min(self.max_confidence)
    }

    /// `c * (1 - decay * (1 - decay_base^k))`
    #[must_use]
    pub fn weaken(&self, confidence: f64, k: usize) -> f64 {
        let k = i32::try_from(k).unwrap_or(i32::MAX);
        confidence * (1.0 - self.decay * (1.0 - self.decay_base.powi(k)))
    }

    /// # Errors
    /// Returns error when a constant leaves its meaningful range.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let unit = 0.0..=1.0;
        let checks = [
            (unit.contains(&self.first_inference_cap), "first_inference_cap in 0..=1"),
            (
                self.first_inference_base > 0.0 && self.first_inference_base < 1.0,
                "first_inference_base in 0..1",
            ),
            (
                self.growth_first_step > 0.0 && self.growth_first_step <= self.growth_ceiling,
                "0 < growth_first_step <= growth_ceiling",
            ),
            (unit.contains(&self.growth_ceiling), "growth_ceiling in 0..=1"),
            (unit.contains(&self.max_confidence), "max_confidence in 0..=1"),
            (unit.contains(&self.decay), "decay in 0..=1"),
            (unit.contains(&self.decay_base), "decay_base in 0..=1"),
            (self.default_limit > 0, "default_limit > 0"),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, rule)) => Err(ValidationError::Policy(format!("evolution policy: {rule}"))),
            None => Ok(()),
        }
    }
}

/// Evolution run parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvolutionRequest {
    /// Restrict to one project's corrections
    #[serde(default)]
    pub project: Option<ProjectId>,
    /// Maximum events to claim
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Outcome of one evolution run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvolutionReport {
    pub analyzed: usize,
    pub created: Vec<PreferenceId>,
    pub reinforced: Vec<PreferenceId>,
    pub weakened: Vec<PreferenceId>,
    /// Left unprocessed for a later run
    pub deferred: Vec<CorrectionId>,
    /// Consumed without effect; they name no direction
    #[serde(default)]
    pub ignored: Vec<CorrectionId>,
    /// Consumed by this run
    pub processed: Vec<CorrectionId>,
}

impl EvolutionReport {
    /// Preferences touched by the run, deduplicated
    #[must_use]
    pub fn touched(&self) -> BTreeSet<PreferenceId> {
        self.created
            .iter()
            .chain(&self.reinforced)
            .chain(&self.weakened)
            .copied()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct GroupKey {
    category: Category,
    concern: String,
    section_type: Option<SectionType>,
}

/// Held for the duration of a run
#[derive(Debug)]
pub struct RunGuard<'a> {
    in_flight: &'a Mutex<HashSet<Option<ProjectId>>>,
    key: Option<ProjectId>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}

/// Turns the correction log into preferences
#[derive(Debug)]
pub struct EvolutionEngine {
    log: Arc<CorrectionLog>,
    store: Arc<PreferenceStore>,
    policy: EvolutionPolicy,
    confidence: ConfidencePolicy,
    in_flight: Mutex<HashSet<Option<ProjectId>>>,
    /// Serializes preference updates across concurrent runs
    apply: Mutex<()>,
}

impl EvolutionEngine {
    #[must_use]
    pub fn new(
        log: Arc<CorrectionLog>,
        store: Arc<PreferenceStore>,
        policy: EvolutionPolicy,
        confidence: ConfidencePolicy,
    ) -> Self {
        Self {
            log,
            store,
            policy,
            confidence,
            in_flight: Mutex::new(HashSet::new()),
            apply: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &EvolutionPolicy {
        &self.policy
    }

    /// Claim the run slot for `project` (`None` covers the whole log).
    ///
    /// A whole-log run conflicts with every other run; project runs
    /// conflict with runs for the same project.
    ///
    /// # Errors
    /// Returns [`FeedbackError::EvolutionInFlight`] if a conflicting run is
    /// active.
    pub fn try_begin(&self, project: Option<ProjectId>) -> Result<RunGuard<'_>, FeedbackError> {
        let mut in_flight = self.in_flight.lock();
        let conflict = match project {
            None => !in_flight.is_empty(),
            Some(_) => in_flight.contains(&None) || in_flight.contains(&project),
        };
        if conflict {
            return Err(FeedbackError::EvolutionInFlight(project));
        }
        in_flight.insert(project);
        drop(in_flight);
        Ok(RunGuard {
            in_flight: &self.in_flight,
            key: project,
        })
    }

    /// Run one evolution pass.
    ///
    /// # Errors
    /// Returns [`FeedbackError::EvolutionInFlight`] if a conflicting run is
    /// active. Ambiguous evidence is deferred, never an error.
    pub fn evolve(&self, request: EvolutionRequest) -> Result<EvolutionReport, FeedbackError> {
        let _guard = self.try_begin(request.project)?;
        let _apply = self.apply.lock();
        let limit = request.limit.unwrap_or(self.policy.default_limit);
        let claimed = self.log.claim_unprocessed(request.project, limit);

        let mut report = EvolutionReport {
            analyzed: claimed.len(),
            ..EvolutionReport::default()
        };

        let mut groups: BTreeMap<GroupKey, Vec<&CorrectionEvent>> = BTreeMap::new();
        for event in &claimed {
            if event.direction().is_none() {
                report.ignored.push(event.id);
                continue;
            }
            let key = GroupKey {
                category: event.draft.category,
                concern: event.draft.field_path.clone(),
                section_type: event.draft.section_type,
            };
            groups.entry(key).or_default().push(event);
        }

        for (key, events) in &groups {
            self.apply_group(key, events, &mut report);
        }

        self.log.release(&report.deferred);
        let deferred: HashSet<CorrectionId> = report.deferred.iter().copied().collect();
        report.processed = claimed
            .iter()
            .map(|e| e.id)
            .filter(|id| !deferred.contains(id))
            .collect();

        tracing::info!(
            project = ?request.project,
            analyzed = report.analyzed,
            created = report.created.len(),
            reinforced = report.reinforced.len(),
            weakened = report.weakened.len(),
            deferred = report.deferred.len(),
            ignored = report.ignored.len(),
            "preference evolution finished"
        );
        Ok(report)
    }

    fn apply_group(&self, key: &GroupKey, events: &[&CorrectionEvent], report: &mut EvolutionReport) {
        let scope = infer_scope(key, events);
        let at = events
            .iter()
            .map(|e| e.created_at)
            .max()
            .unwrap_or_else(Utc::now);

        let existing = self
            .store
            .find_active(key.category, &scope, Some(&key.concern))
            .or_else(|| match scope {
                PreferenceScope::Project { .. } => {
                    self.store
                        .find_active(key.category, &PreferenceScope::Global, Some(&key.concern))
                }
                _ => None,
            });

        let direction = existing
            .as_ref()
            .and_then(|p| p.direction.clone())
            .unwrap_or_else(|| modal_direction(events));
        let (corroborating, contradicting): (Vec<&CorrectionEvent>, Vec<&CorrectionEvent>) = events
            .iter()
            .copied()
            .partition(|e| same_direction(e.direction(), &direction));

        if existing.is_none()
            && key.category == Category::Content
            && corroborating.len() < self.policy.content_min_corroboration
        {
            tracing::debug!(
                concern = %key.concern,
                corroborating = corroborating.len(),
                "content evidence deferred"
            );
            report.deferred.extend(events.iter().map(|e| e.id));
            return;
        }

        #[allow(clippy::cast_precision_loss)]
        let consistency = corroborating.len() as f64 / events.len() as f64;

        match existing {
            Some(mut pref) => {
                let mut confidence = pref.confidence;
                if !corroborating.is_empty() {
                    confidence = self
                        .policy
                        .reinforce(confidence, corroborating.len(), consistency);
                    report.reinforced.push(pref.id);
                }
                if !contradicting.is_empty() {
                    confidence = self.policy.weaken(confidence, contradicting.len());
                    report.weakened.push(pref.id);
                }
                extend_unique(&mut pref.source_corrections, &corroborating);
                extend_unique(&mut pref.contradicting_corrections, &contradicting);
                pref.set_confidence(confidence, &self.confidence, at.max(pref.updated_at));
                tracing::info!(
                    preference = %pref.id,
                    confidence = pref.confidence,
                    "preference updated from evidence"
                );
                self.store.upsert(pref);
            }
            None => {
                let confidence = self
                    .policy
                    .initial_confidence(corroborating.len(), consistency);
                let id = self.derive_id(key, &scope);
                let pref = Preference {
                    id,
                    description: format!("Prefer \"{direction}\" for {} in {scope}", key.concern),
                    category: key.category,
                    scope,
                    concern: Some(key.concern.clone()),
                    direction: Some(direction),
                    confidence,
                    source_corrections: corroborating.iter().map(|e| e.id).collect(),
                    contradicting_corrections: contradicting.iter().map(|e| e.id).collect(),
                    is_active: true,
                    prompt_version: 1,
                    origin: Origin::Inferred,
                    created_at: at,
                    updated_at: at,
                };
                tracing::info!(
                    preference = %pref.id,
                    scope = %pref.scope.kind(),
                    confidence = pref.confidence,
                    "preference inferred"
                );
                report.created.push(pref.id);
                self.store.upsert(pref);
            }
        }
    }

    /// Name-based id; a deactivated predecessor with the same key pushes
    /// the new preference to the next generation.
    fn derive_id(&self, key: &GroupKey, scope: &PreferenceScope) -> PreferenceId {
        let base = format!("{}|{}|{}", key.category, scope.key(), key.concern);
        let mut generation = 0u32;
        loop {
            let id = if generation == 0 {
                PreferenceId::derived(&base)
            } else {
                PreferenceId::derived(&format!("{base}#{generation}"))
            };
            if self.store.get(id).is_none() {
                return id;
            }
            generation += 1;
        }
    }
}

fn infer_scope(key: &GroupKey, events: &[&CorrectionEvent]) -> PreferenceScope {
    if let Some(section_type) = key.section_type {
        return PreferenceScope::SectionType { section_type };
    }
    let projects: BTreeSet<ProjectId> = events.iter().map(|e| e.project_id()).collect();
    match projects.iter().next() {
        Some(project) if projects.len() == 1 => PreferenceScope::Project { project: *project },
        _ => PreferenceScope::Global,
    }
}

/// Most frequent direction; ties go to the one seen first
fn modal_direction(events: &[&CorrectionEvent]) -> String {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for direction in events.iter().filter_map(|e| e.direction()) {
        match counts.iter_mut().find(|(d, _)| same_direction(Some(d.as_str()), direction)) {
            Some((_, n)) => *n += 1,
            None => counts.push((direction.to_string(), 1)),
        }
    }
    let mut best: Option<(String, usize)> = None;
    for (direction, n) in counts {
        if best.as_ref().map_or(true, |(_, m)| n > *m) {
            best = Some((direction, n));
        }
    }
    best.map(|(d, _)| d).unwrap_or_default()
}

fn same_direction(candidate: Option<&str>, direction: &str) -> bool {
    candidate.is_some_and(|c| c.trim().eq_ignore_ascii_case(direction.trim()))
}

fn extend_unique(ids: &mut Vec<CorrectionId>, events: &[&CorrectionEvent]) {
    for event in events {
        if !ids.contains(&event.id) {
            ids.push(event.id);
        }
    }
}
