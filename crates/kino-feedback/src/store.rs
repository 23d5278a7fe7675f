//! Preference projection
//!
//! The mutable view over preferences. Evolution writes through
//! [`PreferenceStore::upsert`]; user edits go through
//! [`PreferenceStore::update`] and [`PreferenceStore::deactivate`].
//! Preferences are never removed.

use crate::error::FeedbackError;
use crate::preference::{ConfidencePolicy, Preference, PreferenceScope, PreferenceUpdate};
use chrono::{DateTime, Utc};
use kino_artifact::PreferenceId;
use kino_kernel::Category;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Audit filter; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreferenceFilter {
    pub category: Option<Category>,
    pub active_only: bool,
    pub min_confidence: Option<f64>,
}

impl PreferenceFilter {
    fn matches(&self, p: &Preference) -> bool {
        self.category.map_or(true, |c| p.category == c)
            && (!self.active_only || p.is_active)
            && self.min_confidence.map_or(true, |m| p.confidence >= m)
    }
}

/// In-memory preference projection
#[derive(Debug, Default)]
pub struct PreferenceStore {
    inner: RwLock<BTreeMap<PreferenceId, Preference>>,
}

impl PreferenceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new preference.
    ///
    /// # Errors
    /// Returns error if the preference is invalid.
    pub fn insert(&self, preference: Preference) -> Result<Preference, FeedbackError> {
        preference.validate()?;
        self.inner.write().insert(preference.id, preference.clone());
        Ok(preference)
    }

    /// Insert or replace without validation; evolution output is always
    /// in range.
    pub(crate) fn upsert(&self, preference: Preference) {
        self.inner.write().insert(preference.id, preference);
    }

    #[must_use]
    pub fn get(&self, id: PreferenceId) -> Option<Preference> {
        self.inner.read().get(&id).cloned()
    }

    /// Apply an explicit user edit. `prompt_version` moves once if the
    /// edit changes what prompts render.
    ///
    /// # Errors
    /// Returns error if the edit is invalid or the preference is unknown.
    pub fn update(
        &self,
        id: PreferenceId,
        update: PreferenceUpdate,
        policy: &ConfidencePolicy,
        at: DateTime<Utc>,
    ) -> Result<Preference, FeedbackError> {
        update.validate()?;
        let mut guard = self.inner.write();
        let pref = guard.get_mut(&id).ok_or(FeedbackError::NotFound(id))?;
        let version = pref.prompt_version;
        let mut rendered_changed = false;
        if let Some(description) = update.description {
            rendered_changed |= pref.description != description;
            pref.description = description;
        }
        if let Some(direction) = update.direction {
            rendered_changed |= pref.direction.as_deref() != Some(direction.as_str());
            pref.direction = Some(direction);
        }
        if let Some(active) = update.is_active {
            rendered_changed |= pref.is_active != active;
            pref.is_active = active;
        }
        match update.confidence {
            Some(c) => pref.set_confidence(c, policy, at),
            None => pref.updated_at = at,
        }
        if rendered_changed && pref.prompt_version == version {
            pref.prompt_version += 1;
        }
        Ok(pref.clone())
    }

    /// Soft-delete a preference.
    ///
    /// # Errors
    /// Returns error if the preference is unknown.
    pub fn deactivate(&self, id: PreferenceId, at: DateTime<Utc>) -> Result<Preference, FeedbackError> {
        let mut guard = self.inner.write();
        let pref = guard.get_mut(&id).ok_or(FeedbackError::NotFound(id))?;
        if pref.is_active {
            pref.is_active = false;
            pref.prompt_version += 1;
        }
        pref.updated_at = at;
        tracing::info!(preference = %id, "preference deactivated");
        Ok(pref.clone())
    }

    /// Active preference for a category, scope and concern
    #[must_use]
    pub fn find_active(
        &self,
        category: Category,
        scope: &PreferenceScope,
        concern: Option<&str>,
    ) -> Option<Preference> {
        self.inner
            .read()
            .values()
            .find(|p| {
                p.is_active
                    && p.category == category
                    && &p.scope == scope
                    && p.concern.as_deref() == concern
            })
            .cloned()
    }

    /// Every preference matching `filter`, in id order
    #[must_use]
    pub fn audit(&self, filter: &PreferenceFilter) -> Vec<Preference> {
        self.inner
            .read()
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect()
    }

    /// Active preferences, in id order
    #[must_use]
    pub fn active(&self) -> Vec<Preference> {
        self.audit(&PreferenceFilter {
            active_only: true,
            ..PreferenceFilter::default()
        })
    }

    /// Replace the projection wholesale, e.g. at startup
    pub fn restore(&self, preferences: impl IntoIterator<Item = Preference>) {
        let map = preferences.into_iter().map(|p| (p.id, p)).collect();
        *self.inner.write() = map;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
