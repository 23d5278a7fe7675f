//! Correction records
//!
//! A correction is the structured trace of one manual change. Drafts are
//! built by callers and sealed into [`CorrectionEvent`]s by the log, which
//! assigns the id, sequence number and chained hash.

use crate::log::Sequence;
use chrono::{DateTime, Utc};
use kino_artifact::{ContentHash, ProjectId, SectionId, SectionType};
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Pipeline stage a correction applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Script,
    Narration,
    Image,
    Animation,
    Composition,
}

impl Stage {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Script => "script",
            Stage::Narration => "narration",
            Stage::Image => "image",
            Stage::Animation => "animation",
            Stage::Composition => "composition",
        }
    }

    /// Whether corrections at this stage refer to a single section
    #[must_use]
    pub fn is_section_level(self) -> bool {
        matches!(self, Stage::Narration | Stage::Image | Stage::Animation)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of change a correction represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Style,
    Structural,
    Content,
    Technical,
}

impl Category {
    /// All categories in declaration order
    pub const ALL: [Category; 4] = [
        Category::Style,
        Category::Structural,
        Category::Content,
        Category::Technical,
    ];

    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Style => "style",
            Category::Structural => "structural",
            Category::Content => "content",
            Category::Technical => "technical",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correction identifier (ULID, sortable by creation time)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrectionId(pub Ulid);

impl CorrectionId {
    /// Generate a new identifier
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CorrectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correction content before it is sealed by the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionDraft {
    pub project_id: ProjectId,
    #[serde(default)]
    pub section_id: Option<SectionId>,
    /// Section type at the time of the correction
    #[serde(default)]
    pub section_type: Option<SectionType>,
    pub stage: Stage,
    pub category: Category,
    pub field_path: String,
    #[serde(default)]
    pub prior_value: Option<String>,
    #[serde(default)]
    pub new_value: Option<String>,
    #[serde(default)]
    pub prompt_before: Option<String>,
    #[serde(default)]
    pub prompt_after: Option<String>,
    #[serde(default)]
    pub user_feedback: Option<String>,
    #[serde(default)]
    pub image_before: Option<String>,
    #[serde(default)]
    pub image_after: Option<String>,
    #[serde(default)]
    pub visual_diff: Option<String>,
    #[serde(default = "default_author")]
    pub author: String,
}

fn default_author() -> String {
    "user".to_string()
}

impl CorrectionDraft {
    /// Start a draft for a field of a project
    #[must_use]
    pub fn new(
        project_id: ProjectId,
        stage: Stage,
        category: Category,
        field_path: impl Into<String>,
    ) -> Self {
        Self {
            project_id,
            section_id: None,
            section_type: None,
            stage,
            category,
            field_path: field_path.into(),
            prior_value: None,
            new_value: None,
            prompt_before: None,
            prompt_after: None,
            user_feedback: None,
            image_before: None,
            image_after: None,
            visual_diff: None,
            author: default_author(),
        }
    }

    /// Attach the section and its type snapshot
    #[must_use]
    pub fn with_section(mut self, section_id: SectionId, section_type: SectionType) -> Self {
        self.section_id = Some(section_id);
        self.section_type = Some(section_type);
        self
    }

    /// Record the value change
    #[must_use]
    pub fn with_values(mut self, prior: Option<String>, new: Option<String>) -> Self {
        self.prior_value = prior;
        self.new_value = new;
        self
    }

    /// Record the prompt change
    #[must_use]
    pub fn with_prompts(mut self, before: Option<String>, after: Option<String>) -> Self {
        self.prompt_before = before;
        self.prompt_after = after;
        self
    }

    #[must_use]
    pub fn with_feedback(mut self, text: impl Into<String>) -> Self {
        self.user_feedback = Some(text.into());
        self
    }

    #[must_use]
    pub fn with_images(mut self, before: Option<String>, after: Option<String>) -> Self {
        self.image_before = before;
        self.image_after = after;
        self
    }

    #[must_use]
    pub fn with_visual_diff(mut self, description: impl Into<String>) -> Self {
        self.visual_diff = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Direction of the change: the new value, else the new prompt, else
    /// the visual-diff description. Blank strings carry no direction.
    #[must_use]
    pub fn direction(&self) -> Option<&str> {
        [&self.new_value, &self.prompt_after, &self.visual_diff]
            .into_iter()
            .filter_map(|v| v.as_deref())
            .map(str::trim)
            .find(|v| !v.is_empty())
    }
}

/// Immutable, sealed correction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionEvent {
    pub id: CorrectionId,
    pub sequence: Sequence,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub draft: CorrectionDraft,
    pub prev_hash: ContentHash,
    pub hash: ContentHash,
}

impl CorrectionEvent {
    /// Hash over everything except `hash` itself
    #[must_use]
    pub fn compute_hash(&self) -> ContentHash {
        let body = serde_json::to_value(&self.draft).unwrap_or_default();
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.id.0.to_string().as_bytes());
        hasher.update(&self.sequence.to_le_bytes());
        hasher.update(self.created_at.to_rfc3339().as_bytes());
        hasher.update(&[0]);
        hasher.update(ContentHash::of_json(&body).as_bytes());
        hasher.update(self.prev_hash.as_bytes());
        ContentHash::new(*hasher.finalize().as_bytes())
    }

    #[inline]
    #[must_use]
    pub fn project_id(&self) -> ProjectId {
        self.draft.project_id
    }

    #[inline]
    #[must_use]
    pub fn direction(&self) -> Option<&str> {
        self.draft.direction()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_prefers_new_value() {
        let d = CorrectionDraft::new(ProjectId::new(), Stage::Image, Category::Style, "visual_spec")
            .with_values(Some("light".into()), Some("dark".into()))
            .with_prompts(None, Some("use a dark theme".into()));
        assert_eq!(d.direction(), Some("dark"));
    }

    #[test]
    fn direction_falls_back_to_prompt_then_diff() {
        let d = CorrectionDraft::new(ProjectId::new(), Stage::Image, Category::Style, "prompt")
            .with_prompts(Some("a".into()), Some("  ".into()))
            .with_visual_diff("darker background");
        assert_eq!(d.direction(), Some("darker background"));

        let none = CorrectionDraft::new(ProjectId::new(), Stage::Script, Category::Content, "x");
        assert_eq!(none.direction(), None);
    }

    #[test]
    fn draft_decodes_with_defaults() {
        let project = ProjectId::new();
        let json = format!(
            r#"{{"project_id":"{project}","stage":"image","category":"style","field_path":"visual_spec.background"}}"#
        );
        let d: CorrectionDraft = serde_json::from_str(&json).unwrap();
        assert_eq!(d.author, "user");
        assert_eq!(d.stage, Stage::Image);
        assert!(d.section_id.is_none());
    }
}
