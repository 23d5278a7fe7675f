//! Entity store interface
//!
//! The persistence technology is pluggable. [`InMemoryRepository`] keeps
//! everything in concurrent maps and can be told to fail, which is how the
//! retry paths are exercised.

use async_trait::async_trait;
use dashmap::DashMap;
use kino_artifact::{PreferenceId, Project, ProjectId, Section};
use kino_feedback::Preference;
use kino_kernel::{CorrectionEvent, CorrectionId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Storage failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Transient; the caller retries with backoff
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Write contradicts stored state
    #[error("storage conflict: {0}")]
    Conflict(String),
}

/// Durable storage for pipeline entities
#[async_trait]
pub trait Repository: Send + Sync {
    async fn save_project(&self, project: &Project) -> Result<(), StorageError>;

    async fn project(&self, id: ProjectId) -> Result<Option<Project>, StorageError>;

    async fn projects(&self) -> Result<Vec<Project>, StorageError>;

    /// Remove a project and its sections. Corrections stay in the log.
    async fn delete_project(&self, id: ProjectId) -> Result<bool, StorageError>;

    /// Replace the project's sections wholesale
    async fn save_sections(&self, project: ProjectId, sections: &[Section]) -> Result<(), StorageError>;

    /// Sections in playback order
    async fn sections(&self, project: ProjectId) -> Result<Vec<Section>, StorageError>;

    /// Persist a sealed correction. Sequences must arrive in order.
    async fn append_correction(&self, event: &CorrectionEvent) -> Result<(), StorageError>;

    /// Every correction in sequence order
    async fn corrections(&self) -> Result<Vec<CorrectionEvent>, StorageError>;

    async fn mark_processed(&self, ids: &[CorrectionId]) -> Result<(), StorageError>;

    async fn processed_corrections(&self) -> Result<Vec<CorrectionId>, StorageError>;

    async fn save_preference(&self, preference: &Preference) -> Result<(), StorageError>;

    async fn preferences(&self) -> Result<Vec<Preference>, StorageError>;
}

/// DashMap-backed repository
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    projects: DashMap<ProjectId, Project>,
    sections: DashMap<ProjectId, Vec<Section>>,
    corrections: Mutex<Vec<CorrectionEvent>>,
    processed: Mutex<HashSet<CorrectionId>>,
    preferences: DashMap<PreferenceId, Preference>,
    fail_next: AtomicUsize,
    fail_appends: AtomicUsize,
    offline: AtomicBool,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` operations with [`StorageError::Unavailable`]
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` correction appends, leaving other operations alone
    pub fn fail_appends(&self, n: usize) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    /// Fail every operation until switched back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self, op: &str) -> Result<(), StorageError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("{op}: offline")));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Unavailable(format!("{op}: injected failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn save_project(&self, project: &Project) -> Result<(), StorageError> {
        self.check("save_project")?;
        self.projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn project(&self, id: ProjectId) -> Result<Option<Project>, StorageError> {
        self.check("project")?;
        Ok(self.projects.get(&id).map(|p| p.value().clone()))
    }

    async fn projects(&self) -> Result<Vec<Project>, StorageError> {
        self.check("projects")?;
        let mut all: Vec<Project> = self.projects.iter().map(|p| p.value().clone()).collect();
        all.sort_by_key(|p| (p.created_at, p.id));
        Ok(all)
    }

    async fn delete_project(&self, id: ProjectId) -> Result<bool, StorageError> {
        self.check("delete_project")?;
        self.sections.remove(&id);
        Ok(self.projects.remove(&id).is_some())
    }

    async fn save_sections(&self, project: ProjectId, sections: &[Section]) -> Result<(), StorageError> {
        self.check("save_sections")?;
        if !self.projects.contains_key(&project) {
            return Err(StorageError::Conflict(format!("project {project} does not exist")));
        }
        let mut ordered = sections.to_vec();
        ordered.sort_by_key(|s| s.section_index);
        self.sections.insert(project, ordered);
        Ok(())
    }

    async fn sections(&self, project: ProjectId) -> Result<Vec<Section>, StorageError> {
        self.check("sections")?;
        Ok(self
            .sections
            .get(&project)
            .map(|s| s.value().clone())
            .unwrap_or_default())
    }

    async fn append_correction(&self, event: &CorrectionEvent) -> Result<(), StorageError> {
        self.check("append_correction")?;
        let injected = self
            .fail_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Unavailable("append_correction: injected failure".into()));
        }
        let mut log = self.corrections.lock();
        let expected = log.len() as u64 + 1;
        if event.sequence != expected {
            return Err(StorageError::Conflict(format!(
                "correction sequence {} out of order, expected {expected}",
                event.sequence
            )));
        }
        log.push(event.clone());
        Ok(())
    }

    async fn corrections(&self) -> Result<Vec<CorrectionEvent>, StorageError> {
        self.check("corrections")?;
        Ok(self.corrections.lock().clone())
    }

    async fn mark_processed(&self, ids: &[CorrectionId]) -> Result<(), StorageError> {
        self.check("mark_processed")?;
        self.processed.lock().extend(ids.iter().copied());
        Ok(())
    }

    async fn processed_corrections(&self) -> Result<Vec<CorrectionId>, StorageError> {
        self.check("processed_corrections")?;
        Ok(self.processed.lock().iter().copied().collect())
    }

    async fn save_preference(&self, preference: &Preference) -> Result<(), StorageError> {
        self.check("save_preference")?;
        self.preferences.insert(preference.id, preference.clone());
        Ok(())
    }

    async fn preferences(&self) -> Result<Vec<Preference>, StorageError> {
        self.check("preferences")?;
        Ok(self.preferences.iter().map(|p| p.value().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kino_artifact::SectionDraft;
    use kino_artifact::SectionType;

    #[tokio::test]
    async fn delete_cascades_to_sections() {
        let repo = InMemoryRepository::new();
        let project = Project::new("Graphs", None, Utc::now()).unwrap();
        repo.save_project(&project).await.unwrap();
        let section = Section::from_draft(project.id, 0, SectionDraft::new(SectionType::Slide), Utc::now());
        repo.save_sections(project.id, &[section]).await.unwrap();

        assert!(repo.delete_project(project.id).await.unwrap());
        assert!(repo.sections(project.id).await.unwrap().is_empty());
        assert!(repo.project(project.id).await.unwrap().is_none());
        assert!(!repo.delete_project(project.id).await.unwrap());
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let repo = InMemoryRepository::new();
        repo.fail_next(2);
        assert!(matches!(repo.projects().await, Err(StorageError::Unavailable(_))));
        assert!(repo.projects().await.is_err());
        assert!(repo.projects().await.is_ok());

        repo.set_offline(true);
        assert!(repo.preferences().await.is_err());
        repo.set_offline(false);
        assert!(repo.preferences().await.is_ok());
    }

    #[tokio::test]
    async fn sections_need_a_project() {
        let repo = InMemoryRepository::new();
        let err = repo.save_sections(ProjectId::new(), &[]).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }
}
