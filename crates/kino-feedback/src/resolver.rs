//! Preference resolution
//!
//! Collects the active preferences that cover a generation context and
//! orders them by specificity, confidence, recency and id. Audit-tier
//! preferences are never part of a resolution.

use crate::error::FeedbackError;
use crate::preference::{ConfidencePolicy, ConfidenceTier, Preference, ScopeKind};
use crate::store::{PreferenceFilter, PreferenceStore};
use chrono::Utc;
use kino_artifact::{PreferenceId, ProjectId, SectionType};
use kino_kernel::Category;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What is about to be generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveContext {
    pub project: ProjectId,
    #[serde(default)]
    pub section_type: Option<SectionType>,
    #[serde(default)]
    pub category: Option<Category>,
}

impl ResolveContext {
    #[must_use]
    pub fn new(project: ProjectId) -> Self {
        Self {
            project,
            section_type: None,
            category: None,
        }
    }

    #[must_use]
    pub fn section_type(mut self, section_type: SectionType) -> Self {
        self.section_type = Some(section_type);
        self
    }

    #[must_use]
    pub fn category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }
}

/// A preference with its tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolved {
    pub preference: Preference,
    pub tier: ConfidenceTier,
}

/// Ordered resolution result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub entries: Vec<Resolved>,
}

impl Resolution {
    /// Entries applied without asking
    pub fn auto_applied(&self) -> impl Iterator<Item = &Preference> {
        self.entries
            .iter()
            .filter(|r| r.tier == ConfidenceTier::AutoApply)
            .map(|r| &r.preference)
    }

    /// Entries awaiting user acceptance
    pub fn suggested(&self) -> impl Iterator<Item = &Preference> {
        self.entries
            .iter()
            .filter(|r| r.tier == ConfidenceTier::Suggest)
            .map(|r| &r.preference)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Suggestion offered to the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub preference_id: PreferenceId,
    pub description: String,
    pub confidence: f64,
    pub category: Category,
    pub action: String,
}

/// Short profile entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub id: PreferenceId,
    pub description: String,
    pub confidence: f64,
}

/// Summary of active, non-audit preferences
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreferenceProfile {
    pub total_preferences: usize,
    pub by_category: BTreeMap<Category, usize>,
    pub by_scope: BTreeMap<ScopeKind, usize>,
    pub high_confidence: Vec<ProfileEntry>,
    pub suggestions: Vec<ProfileEntry>,
}

/// Resolution order: more specific, more confident, more recent, lower id
pub fn priority(a: &Preference, b: &Preference) -> Ordering {
    b.scope
        .specificity()
        .cmp(&a.scope.specificity())
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| b.updated_at.cmp(&a.updated_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Resolves preferences from a store
#[derive(Debug, Clone)]
pub struct PreferenceResolver {
    store: Arc<PreferenceStore>,
    policy: ConfidencePolicy,
}

impl PreferenceResolver {
    #[must_use]
    pub fn new(store: Arc<PreferenceStore>, policy: ConfidencePolicy) -> Self {
        Self { store, policy }
    }

    #[must_use]
    pub fn policy(&self) -> &ConfidencePolicy {
        &self.policy
    }

    #[must_use]
    pub fn store(&self) -> &Arc<PreferenceStore> {
        &self.store
    }

    /// Active preferences covering `ctx` at or above the suggestion cutoff
    #[must_use]
    pub fn resolve(&self, ctx: &ResolveContext) -> Resolution {
        let mut matching: Vec<Preference> = self
            .store
            .active()
            .into_iter()
            .filter(|p| ctx.category.map_or(true, |c| p.category == c))
            .filter(|p| p.scope.applies_to(ctx.project, ctx.section_type))
            .filter(|p| p.tier(&self.policy) != ConfidenceTier::AuditOnly)
            .collect();
        matching.sort_by(priority);

        let entries = matching
            .into_iter()
            .map(|preference| Resolved {
                tier: preference.tier(&self.policy),
                preference,
            })
            .collect();
        Resolution { entries }
    }

    /// Suggestion-tier preferences for `ctx`
    #[must_use]
    pub fn suggestions(&self, ctx: &ResolveContext) -> Vec<Suggestion> {
        self.resolve(ctx)
            .suggested()
            .map(|p| Suggestion {
                preference_id: p.id,
                description: p.description.clone(),
                confidence: p.confidence,
                category: p.category,
                action: format!("Add to prompt: {}", p.description),
            })
            .collect()
    }

    /// Promote a suggestion to the auto-apply tier.
    ///
    /// # Errors
    /// Returns error if the preference is unknown, inactive or not in the
    /// suggestion tier.
    pub fn accept_suggestion(&self, id: PreferenceId) -> Result<Preference, FeedbackError> {
        let pref = self.store.get(id).ok_or(FeedbackError::NotFound(id))?;
        if !pref.is_active || pref.tier(&self.policy) != ConfidenceTier::Suggest {
            return Err(FeedbackError::NotASuggestion {
                id,
                confidence: pref.confidence,
            });
        }
        let accepted = self.store.update(
            id,
            crate::preference::PreferenceUpdate {
                confidence: Some(self.policy.auto_apply),
                ..Default::default()
            },
            &self.policy,
            Utc::now(),
        )?;
        tracing::info!(preference = %id, confidence = accepted.confidence, "suggestion accepted");
        Ok(accepted)
    }

    /// Counts and tier lists over active preferences
    #[must_use]
    pub fn profile(&self) -> PreferenceProfile {
        let mut prefs = self.store.audit(&PreferenceFilter {
            active_only: true,
            min_confidence: Some(self.policy.suggest),
            ..PreferenceFilter::default()
        });
        prefs.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut profile = PreferenceProfile {
            total_preferences: prefs.len(),
            ..PreferenceProfile::default()
        };
        for p in prefs {
            *profile.by_category.entry(p.category).or_default() += 1;
            *profile.by_scope.entry(p.scope.kind()).or_default() += 1;
            let entry = ProfileEntry {
                id: p.id,
                description: p.description.clone(),
                confidence: p.confidence,
            };
            match p.tier(&self.policy) {
                ConfidenceTier::AutoApply => profile.high_confidence.push(entry),
                ConfidenceTier::Suggest => profile.suggestions.push(entry),
                ConfidenceTier::AuditOnly => {}
            }
        }
        profile
    }

    /// Every preference, including inactive and audit-tier ones
    #[must_use]
    pub fn audit(&self, filter: &PreferenceFilter) -> Vec<Preference> {
        self.store.audit(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preference::{PreferenceDraft, PreferenceScope};

    fn add(
        store: &PreferenceStore,
        scope: PreferenceScope,
        confidence: f64,
        description: &str,
    ) -> Preference {
        store
            .insert(
                PreferenceDraft {
                    description: description.into(),
                    category: Category::Style,
                    scope,
                    concern: Some("visual_spec.background".into()),
                    direction: None,
                    confidence,
                }
                .into_preference(Utc::now())
                .unwrap(),
            )
            .unwrap()
    }

    #[test]
    fn specific_outranks_confident_global() {
        let store = Arc::new(PreferenceStore::new());
        let project = ProjectId::new();
        let global = add(&store, PreferenceScope::Global, 0.95, "light");
        let specific = add(
            &store,
            PreferenceScope::Specific {
                project,
                section_type: SectionType::Code,
            },
            0.6,
            "dark",
        );
        let resolver = PreferenceResolver::new(store, ConfidencePolicy::default());
        let ctx = ResolveContext::new(project).section_type(SectionType::Code);
        let ids: Vec<_> = resolver
            .resolve(&ctx)
            .entries
            .iter()
            .map(|r| r.preference.id)
            .collect();
        assert_eq!(ids, vec![specific.id, global.id]);
    }

    #[test]
    fn tiers_split_applied_suggested_and_audit() {
        let store = Arc::new(PreferenceStore::new());
        let project = ProjectId::new();
        let high = add(&store, PreferenceScope::Global, 0.9, "a");
        let mid = add(&store, PreferenceScope::Global, 0.7, "b");
        let low = add(&store, PreferenceScope::Global, 0.3, "c");
        let resolver = PreferenceResolver::new(store, ConfidencePolicy::default());
        let resolution = resolver.resolve(&ResolveContext::new(project));

        assert_eq!(
            resolution.auto_applied().map(|p| p.id).collect::<Vec<_>>(),
            vec![high.id]
        );
        assert_eq!(
            resolution.suggested().map(|p| p.id).collect::<Vec<_>>(),
            vec![mid.id]
        );
        assert!(resolution.entries.iter().all(|r| r.preference.id != low.id));
        assert!(resolver
            .audit(&PreferenceFilter::default())
            .iter()
            .any(|p| p.id == low.id));
    }

    #[test]
    fn accepting_a_suggestion_promotes_it() {
        let store = Arc::new(PreferenceStore::new());
        let project = ProjectId::new();
        let mid = add(&store, PreferenceScope::Project { project }, 0.7, "b");
        let high = add(&store, PreferenceScope::Global, 0.9, "a");
        let resolver = PreferenceResolver::new(store, ConfidencePolicy::default());

        assert_eq!(resolver.suggestions(&ResolveContext::new(project)).len(), 1);
        let accepted = resolver.accept_suggestion(mid.id).unwrap();
        assert_eq!(accepted.confidence, 0.85);
        assert!(resolver.suggestions(&ResolveContext::new(project)).is_empty());
        assert!(matches!(
            resolver.accept_suggestion(high.id),
            Err(FeedbackError::NotASuggestion { .. })
        ));
    }

    #[test]
    fn profile_counts_active_entries() {
        let store = Arc::new(PreferenceStore::new());
        add(&store, PreferenceScope::Global, 0.9, "a");
        add(&store, PreferenceScope::Global, 0.6, "b");
        add(&store, PreferenceScope::Global, 0.2, "c");
        let resolver = PreferenceResolver::new(store, ConfidencePolicy::default());
        let profile = resolver.profile();
        assert_eq!(profile.total_preferences, 2);
        assert_eq!(profile.high_confidence.len(), 1);
        assert_eq!(profile.suggestions.len(), 1);
        assert_eq!(profile.by_scope.get(&ScopeKind::Global), Some(&2));
    }
}
