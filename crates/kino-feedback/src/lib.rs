//! Kino Feedback
//!
//! Learns user preferences from the correction log and applies them to
//! generation prompts.
//!
//! - [`EvolutionEngine`]: groups unprocessed corrections into preferences
//! - [`PreferenceResolver`]: orders applicable preferences by specificity
//! - [`PromptBuilder`]: adds auto-applied preferences to a base prompt
//! - [`VisualDiffAnalyzer`]: turns image edits into style corrections
//!
//! # Example
//!
//! ```rust
//! use kino_feedback::{ConfidencePolicy, ConfidenceTier};
//!
//! let policy = ConfidencePolicy::default();
//! assert_eq!(policy.tier(0.9), ConfidenceTier::AutoApply);
//! assert_eq!(policy.tier(0.6), ConfidenceTier::Suggest);
//! assert_eq!(policy.tier(0.2), ConfidenceTier::AuditOnly);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod error;
mod evolution;
mod preference;
mod prompt;
mod resolver;
mod store;
mod visual_diff;

pub use error::{FeedbackError, ValidationError};
pub use evolution::{EvolutionEngine, EvolutionPolicy, EvolutionReport, EvolutionRequest, RunGuard};
pub use preference::{
    ConfidencePolicy, ConfidenceTier, Origin, Preference, PreferenceDraft, PreferenceScope,
    PreferenceUpdate, ScopeKind, ScopeRecord,
};
pub use prompt::{BuiltPrompt, PromptBuilder, PromptKind, SYSTEM_PROMPT_PROFILE_LIMIT};
pub use resolver::{
    priority, PreferenceProfile, PreferenceResolver, ProfileEntry, Resolution, ResolveContext,
    Resolved, Suggestion,
};
pub use store::{PreferenceFilter, PreferenceStore};
pub use visual_diff::{analyze_edit, VisualChange, VisualDiff, VisualDiffAnalyzer};
