//! Prompt personalization
//!
//! Applies the highest-priority auto-tier preference for each concern to a
//! base prompt. Lower-priority preferences for the same concern are
//! shadowed and logged, never merged.

use crate::resolver::{PreferenceResolver, ResolveContext};
use kino_artifact::PreferenceId;
use kino_kernel::Category;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write as _;

/// Largest number of profile entries added to a system prompt
pub const SYSTEM_PROMPT_PROFILE_LIMIT: usize = 10;

/// Which generator the prompt is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Script,
    Visual,
    Narration,
}

impl PromptKind {
    /// Categories that can influence this kind of prompt
    #[must_use]
    pub fn categories(self) -> &'static [Category] {
        match self {
            PromptKind::Script => &Category::ALL,
            PromptKind::Visual => &[Category::Style],
            PromptKind::Narration => &[Category::Content, Category::Style],
        }
    }

    fn heading(self) -> &'static str {
        match self {
            PromptKind::Script => "## User preferences (applied automatically)",
            PromptKind::Visual => "Style preferences:",
            PromptKind::Narration => "Tone and style preferences:",
        }
    }
}

/// A prompt with the preferences it carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltPrompt {
    pub prompt: String,
    pub applied: Vec<PreferenceId>,
    pub shadowed: Vec<PreferenceId>,
}

/// Builds personalized prompts
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    resolver: PreferenceResolver,
}

impl PromptBuilder {
    #[must_use]
    pub fn new(resolver: PreferenceResolver) -> Self {
        Self { resolver }
    }

    /// Append the applicable preference directives to `base`
    #[must_use]
    pub fn build(&self, kind: PromptKind, base: &str, ctx: &ResolveContext) -> BuiltPrompt {
        let resolution = self.resolver.resolve(&ResolveContext {
            category: None,
            ..*ctx
        });

        let mut seen: HashSet<String> = HashSet::new();
        let mut applied = Vec::new();
        let mut shadowed = Vec::new();
        let mut lines = String::new();
        for pref in resolution
            .auto_applied()
            .filter(|p| kind.categories().contains(&p.category))
            .filter(|p| ctx.category.map_or(true, |c| p.category == c))
        {
            let concern = pref
                .concern
                .clone()
                .unwrap_or_else(|| format!("preference:{}", pref.id));
            if !seen.insert(concern.clone()) {
                tracing::info!(
                    preference = %pref.id,
                    concern = %concern,
                    "preference shadowed by a higher-priority entry"
                );
                shadowed.push(pref.id);
                continue;
            }
            let pct = (pref.confidence * 100.0).round();
            let _ = match pref.scope.section_type() {
                Some(t) => writeln!(lines, "- [{t}] {} (confidence {pct}%)", pref.description),
                None => writeln!(lines, "- {} (confidence {pct}%)", pref.description),
            };
            applied.push(pref.id);
        }

        let prompt = if applied.is_empty() {
            base.to_string()
        } else {
            format!("{base}\n\n{}\n{}", kind.heading(), lines.trim_end())
        };
        BuiltPrompt {
            prompt,
            applied,
            shadowed,
        }
    }

    /// System prompt extended with the user's high-confidence profile
    #[must_use]
    pub fn personalized_system_prompt(&self, base: &str) -> String {
        let profile = self.resolver.profile();
        if profile.high_confidence.is_empty() {
            return base.to_string();
        }
        let mut section =
            String::from("## User profile\nThis user has the following preferences:\n");
        for entry in profile
            .high_confidence
            .iter()
            .take(SYSTEM_PROMPT_PROFILE_LIMIT)
        {
            let _ = writeln!(section, "- {}", entry.description);
        }
        format!("{base}\n\n{}", section.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preference::{ConfidencePolicy, Preference, PreferenceDraft, PreferenceScope};
    use crate::store::PreferenceStore;
    use chrono::Utc;
    use kino_artifact::{ProjectId, SectionType};
    use std::sync::Arc;

    fn add(
        store: &PreferenceStore,
        scope: PreferenceScope,
        category: Category,
        concern: &str,
        confidence: f64,
        description: &str,
    ) -> Preference {
        store
            .insert(
                PreferenceDraft {
                    description: description.into(),
                    category,
                    scope,
                    concern: Some(concern.into()),
                    direction: None,
                    confidence,
                }
                .into_preference(Utc::now())
                .unwrap(),
            )
            .unwrap()
    }

    fn builder(store: Arc<PreferenceStore>) -> PromptBuilder {
        PromptBuilder::new(PreferenceResolver::new(store, ConfidencePolicy::default()))
    }

    #[test]
    fn top_entry_per_concern_wins() {
        let store = Arc::new(PreferenceStore::new());
        let project = ProjectId::new();
        let code = add(
            &store,
            PreferenceScope::SectionType {
                section_type: SectionType::Code,
            },
            Category::Style,
            "visual_spec.background",
            0.9,
            "Dark background",
        );
        let global = add(
            &store,
            PreferenceScope::Global,
            Category::Style,
            "visual_spec.background",
            0.95,
            "Light background",
        );

        let built = builder(store).build(
            PromptKind::Visual,
            "Render the slide.",
            &ResolveContext::new(project).section_type(SectionType::Code),
        );
        assert_eq!(built.applied, vec![code.id]);
        assert_eq!(built.shadowed, vec![global.id]);
        assert!(built.prompt.contains("[code] Dark background (confidence 90%)"));
        assert!(!built.prompt.contains("Light background"));
    }

    #[test]
    fn visual_prompts_ignore_content_preferences() {
        let store = Arc::new(PreferenceStore::new());
        add(
            &store,
            PreferenceScope::Global,
            Category::Content,
            "narration",
            0.9,
            "Short sentences",
        );
        let b = builder(store);
        let ctx = ResolveContext::new(ProjectId::new());
        let visual = b.build(PromptKind::Visual, "base", &ctx);
        assert_eq!(visual.prompt, "base");
        let narration = b.build(PromptKind::Narration, "base", &ctx);
        assert!(narration.prompt.contains("Short sentences"));
    }

    #[test]
    fn suggestions_are_not_applied() {
        let store = Arc::new(PreferenceStore::new());
        add(
            &store,
            PreferenceScope::Global,
            Category::Style,
            "tone",
            0.7,
            "Casual tone",
        );
        let built = builder(store).build(
            PromptKind::Script,
            "base",
            &ResolveContext::new(ProjectId::new()),
        );
        assert!(built.applied.is_empty());
        assert_eq!(built.prompt, "base");
    }

    #[test]
    fn system_prompt_lists_profile() {
        let store = Arc::new(PreferenceStore::new());
        add(
            &store,
            PreferenceScope::Global,
            Category::Style,
            "tone",
            0.9,
            "Casual tone",
        );
        let prompt = builder(store).personalized_system_prompt("You write scripts.");
        assert!(prompt.starts_with("You write scripts.\n\n## User profile"));
        assert!(prompt.ends_with("- Casual tone"));
    }
}
