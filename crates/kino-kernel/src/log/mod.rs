//! Append-only correction log
//!
//! Events live in a single arena guarded by a mutex that is held only long
//! enough to assign the sequence number and chain hash. Processed markers
//! for preference evolution are kept beside the arena and never touch the
//! events themselves.

use crate::correction::{Category, CorrectionDraft, CorrectionEvent, CorrectionId, Stage};
use crate::error::LogError;
use chrono::{DateTime, Utc};
use kino_artifact::{ContentHash, ProjectId, SectionId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Position of an event in the log, starting at 1
pub type Sequence = u64;

/// Query filter; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub project: Option<ProjectId>,
    pub section: Option<SectionId>,
    pub stage: Option<Stage>,
    pub category: Option<Category>,
    pub limit: Option<usize>,
}

impl LogFilter {
    #[must_use]
    pub fn project(mut self, project: ProjectId) -> Self {
        self.project = Some(project);
        self
    }

    #[must_use]
    pub fn section(mut self, section: SectionId) -> Self {
        self.section = Some(section);
        self
    }

    #[must_use]
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    #[must_use]
    pub fn category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, event: &CorrectionEvent) -> bool {
        let d = &event.draft;
        self.project.map_or(true, |p| d.project_id == p)
            && self.section.map_or(true, |s| d.section_id == Some(s))
            && self.stage.map_or(true, |s| d.stage == s)
            && self.category.map_or(true, |c| d.category == c)
    }
}

/// Totals by stage and category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionStats {
    pub total: usize,
    pub by_stage: BTreeMap<Stage, usize>,
    pub by_category: BTreeMap<Category, usize>,
}

#[derive(Debug, Default)]
struct Arena {
    events: Vec<CorrectionEvent>,
    /// Claimed by an evolution run and not released
    processed: HashSet<CorrectionId>,
}

/// The correction log
#[derive(Debug, Default)]
pub struct CorrectionLog {
    inner: Mutex<Arena>,
}

impl CorrectionLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seal and append a draft
    pub fn append(&self, draft: CorrectionDraft, at: DateTime<Utc>) -> CorrectionEvent {
        self.append_with_id(CorrectionId::new(), draft, at)
    }

    /// Seal and append a draft under a caller-chosen id
    pub fn append_with_id(
        &self,
        id: CorrectionId,
        draft: CorrectionDraft,
        at: DateTime<Utc>,
    ) -> CorrectionEvent {
        let mut guard = self.inner.lock();
        let event = next_event(&guard.events, id, draft, at);
        guard.events.push(event.clone());
        drop(guard);
        log_appended(&event);
        event
    }

    /// Seal a draft against the current tail without appending it.
    ///
    /// The event only joins the log through [`Self::commit`], which lets a
    /// caller persist it first. Callers serialize seal/commit pairs.
    #[must_use]
    pub fn seal(&self, draft: CorrectionDraft, at: DateTime<Utc>) -> CorrectionEvent {
        next_event(&self.inner.lock().events, CorrectionId::new(), draft, at)
    }

    /// Append an event produced by [`Self::seal`].
    ///
    /// # Errors
    /// Returns error if another append moved the tail since sealing, or the
    /// event hash does not verify.
    pub fn commit(&self, event: CorrectionEvent) -> Result<(), LogError> {
        let mut guard = self.inner.lock();
        let expected = guard.events.len() as Sequence + 1;
        if event.sequence != expected {
            return Err(LogError::SequenceGap {
                expected,
                found: event.sequence,
            });
        }
        if event.prev_hash != tail_hash(&guard.events) || event.hash != event.compute_hash() {
            return Err(LogError::IntegrityViolation {
                sequence: event.sequence,
            });
        }
        guard.events.push(event.clone());
        drop(guard);
        log_appended(&event);
        Ok(())
    }

    /// Matching events, newest first
    #[must_use]
    pub fn query(&self, filter: &LogFilter) -> Vec<CorrectionEvent> {
        let guard = self.inner.lock();
        let matching = guard.events.iter().rev().filter(|e| filter.matches(e));
        match filter.limit {
            Some(n) => matching.take(n).cloned().collect(),
            None => matching.cloned().collect(),
        }
    }

    /// Totals for one project, or for the whole log
    #[must_use]
    pub fn stats(&self, project: Option<ProjectId>) -> CorrectionStats {
        let guard = self.inner.lock();
        let mut stats = CorrectionStats::default();
        for event in guard
            .events
            .iter()
            .filter(|e| project.map_or(true, |p| e.draft.project_id == p))
        {
            stats.total += 1;
            *stats.by_stage.entry(event.draft.stage).or_default() += 1;
            *stats.by_category.entry(event.draft.category).or_default() += 1;
        }
        stats
    }

    /// All events in sequence order
    #[must_use]
    pub fn events(&self) -> Vec<CorrectionEvent> {
        self.inner.lock().events.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }

    /// Events not yet processed, in sequence order
    #[must_use]
    pub fn unprocessed(&self, project: Option<ProjectId>) -> Vec<CorrectionEvent> {
        let guard = self.inner.lock();
        guard
            .events
            .iter()
            .filter(|e| !guard.processed.contains(&e.id))
            .filter(|e| project.map_or(true, |p| e.draft.project_id == p))
            .cloned()
            .collect()
    }

    /// Atomically mark up to `limit` of the most recent unprocessed events
    /// as processed and return them in sequence order.
    ///
    /// Events the caller cannot use yet go back through [`Self::release`].
    pub fn claim_unprocessed(
        &self,
        project: Option<ProjectId>,
        limit: usize,
    ) -> Vec<CorrectionEvent> {
        let mut guard = self.inner.lock();
        let Arena { events, processed } = &mut *guard;
        let mut claimed: Vec<CorrectionEvent> = events
            .iter()
            .rev()
            .filter(|e| !processed.contains(&e.id))
            .filter(|e| project.map_or(true, |p| e.draft.project_id == p))
            .take(limit)
            .cloned()
            .collect();
        for event in &claimed {
            processed.insert(event.id);
        }
        claimed.reverse();
        claimed
    }

    /// Return claimed events to the unprocessed pool
    pub fn release(&self, ids: &[CorrectionId]) {
        let mut guard = self.inner.lock();
        for id in ids {
            guard.processed.remove(id);
        }
    }

    /// Whether an event has been claimed by an evolution run
    #[must_use]
    pub fn is_processed(&self, id: CorrectionId) -> bool {
        self.inner.lock().processed.contains(&id)
    }

    /// Ids of processed events, for persistence
    #[must_use]
    pub fn processed_ids(&self) -> Vec<CorrectionId> {
        let guard = self.inner.lock();
        guard
            .events
            .iter()
            .filter(|e| guard.processed.contains(&e.id))
            .map(|e| e.id)
            .collect()
    }

    /// Recompute the hash chain.
    ///
    /// # Errors
    /// Returns the first event whose link or hash does not match.
    pub fn verify_integrity(&self) -> Result<(), LogError> {
        verify_chain(&self.inner.lock().events)
    }

    /// Rebuild the arena from persisted events and processed markers.
    ///
    /// # Errors
    /// Returns error, leaving the current arena untouched, if the events do
    /// not form a gap-free, correctly chained sequence.
    pub fn restore(
        &self,
        mut events: Vec<CorrectionEvent>,
        processed: impl IntoIterator<Item = CorrectionId>,
    ) -> Result<(), LogError> {
        events.sort_by_key(|e| e.sequence);
        for (i, event) in events.iter().enumerate() {
            let expected = i as Sequence + 1;
            if event.sequence != expected {
                return Err(LogError::SequenceGap {
                    expected,
                    found: event.sequence,
                });
            }
        }
        verify_chain(&events)?;

        let known: HashSet<CorrectionId> = events.iter().map(|e| e.id).collect();
        let processed = processed.into_iter().filter(|id| known.contains(id)).collect();
        let count = events.len();
        *self.inner.lock() = Arena { events, processed };
        tracing::info!(events = count, "correction log restored");
        Ok(())
    }
}

fn verify_chain(events: &[CorrectionEvent]) -> Result<(), LogError> {
    let mut prev = ContentHash::new([0u8; 32]);
    for e in events {
        if e.prev_hash != prev || e.hash != e.compute_hash() {
            return Err(LogError::IntegrityViolation {
                sequence: e.sequence,
            });
        }
        prev = e.hash;
    }
    Ok(())
}

fn tail_hash(events: &[CorrectionEvent]) -> ContentHash {
    events
        .last()
        .map_or(ContentHash::new([0u8; 32]), |e| e.hash)
}

fn next_event(
    events: &[CorrectionEvent],
    id: CorrectionId,
    draft: CorrectionDraft,
    at: DateTime<Utc>,
) -> CorrectionEvent {
    let mut event = CorrectionEvent {
        id,
        sequence: events.len() as Sequence + 1,
        created_at: at,
        draft,
        prev_hash: tail_hash(events),
        hash: ContentHash::new([0u8; 32]),
    };
    event.hash = event.compute_hash();
    event
}

fn log_appended(event: &CorrectionEvent) {
    tracing::debug!(
        correction = %event.id,
        sequence = event.sequence,
        project = %event.draft.project_id,
        stage = %event.draft.stage,
        "correction appended"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(project: ProjectId, stage: Stage, category: Category) -> CorrectionDraft {
        CorrectionDraft::new(project, stage, category, "narration")
            .with_values(Some("a".into()), Some("b".into()))
    }

    #[test]
    fn append_assigns_sequence_and_chain() {
        let log = CorrectionLog::new();
        let p = ProjectId::new();
        let first = log.append(draft(p, Stage::Script, Category::Content), Utc::now());
        let second = log.append(draft(p, Stage::Image, Category::Style), Utc::now());
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.prev_hash, first.hash);
        assert!(log.verify_integrity().is_ok());
    }

    #[test]
    fn sealed_events_commit_only_against_their_tail() {
        let log = CorrectionLog::new();
        let p = ProjectId::new();
        let sealed = log.seal(draft(p, Stage::Script, Category::Content), Utc::now());
        assert!(log.is_empty());

        let racing = log.seal(draft(p, Stage::Image, Category::Style), Utc::now());
        log.commit(sealed).unwrap();
        assert_eq!(log.len(), 1);
        assert!(matches!(
            log.commit(racing),
            Err(LogError::SequenceGap { expected: 2, found: 1 })
        ));
        assert!(log.verify_integrity().is_ok());
    }

    #[test]
    fn query_is_newest_first_and_filtered() {
        let log = CorrectionLog::new();
        let (p, q) = (ProjectId::new(), ProjectId::new());
        log.append(draft(p, Stage::Script, Category::Content), Utc::now());
        log.append(draft(q, Stage::Image, Category::Style), Utc::now());
        log.append(draft(p, Stage::Image, Category::Style), Utc::now());

        let all = log.query(&LogFilter::default());
        assert_eq!(
            all.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![3, 2, 1]
        );
        let styled = log.query(&LogFilter::default().project(p).category(Category::Style));
        assert_eq!(styled.len(), 1);
        assert_eq!(styled[0].sequence, 3);
        assert_eq!(log.query(&LogFilter::default().limit(1)).len(), 1);
    }

    #[test]
    fn stats_count_by_stage_and_category() {
        let log = CorrectionLog::new();
        let p = ProjectId::new();
        log.append(draft(p, Stage::Image, Category::Style), Utc::now());
        log.append(draft(p, Stage::Image, Category::Content), Utc::now());
        log.append(draft(ProjectId::new(), Stage::Script, Category::Style), Utc::now());

        let stats = log.stats(Some(p));
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_stage.get(&Stage::Image), Some(&2));
        assert_eq!(stats.by_category.get(&Category::Style), Some(&1));
        assert_eq!(log.stats(None).total, 3);
    }

    #[test]
    fn claim_takes_most_recent_and_release_returns_them() {
        let log = CorrectionLog::new();
        let p = ProjectId::new();
        for _ in 0..4 {
            log.append(draft(p, Stage::Image, Category::Style), Utc::now());
        }
        let claimed = log.claim_unprocessed(Some(p), 2);
        assert_eq!(
            claimed.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![3, 4]
        );
        assert_eq!(log.unprocessed(Some(p)).len(), 2);

        log.release(&[claimed[0].id]);
        assert_eq!(log.unprocessed(Some(p)).len(), 3);
        assert!(log.is_processed(claimed[1].id));
    }

    #[test]
    fn restore_rejects_gaps_and_tampering() {
        let log = CorrectionLog::new();
        let p = ProjectId::new();
        for _ in 0..3 {
            log.append(draft(p, Stage::Narration, Category::Content), Utc::now());
        }
        let events = log.events();

        let fresh = CorrectionLog::new();
        let mut shuffled = events.clone();
        shuffled.reverse();
        fresh.restore(shuffled, [events[0].id]).unwrap();
        assert_eq!(fresh.events(), events);
        assert!(fresh.is_processed(events[0].id));

        let mut gap = events.clone();
        gap.remove(1);
        assert_eq!(
            fresh.restore(gap, Vec::new()),
            Err(LogError::SequenceGap {
                expected: 2,
                found: 3
            })
        );

        let mut tampered = events;
        tampered[1].draft.new_value = Some("forged".into());
        assert_eq!(
            fresh.restore(tampered, Vec::new()),
            Err(LogError::IntegrityViolation { sequence: 2 })
        );
        assert_eq!(fresh.len(), 3);
    }
}
