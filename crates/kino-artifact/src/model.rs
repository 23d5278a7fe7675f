//! Project and section records
//!
//! These are the storage-agnostic entities the pipeline reads and writes.
//! Sections carry the hashes of their authoritative inputs so staleness can
//! be decided without looking at generated media.

use crate::hash::{ContentHash, InputSet};
use crate::ids::{ProjectId, SectionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Maximum theme length in characters
pub const MAX_THEME_CHARS: usize = 500;

/// Accepted target duration range in seconds
pub const DURATION_TARGET_RANGE: std::ops::RangeInclusive<f64> = 30.0..=3600.0;

/// Playback duration assumed for sections without an explicit one
pub const DEFAULT_SECTION_SECS: f64 = 5.0;

/// Kind of section, fixed enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionType {
    Title,
    Slide,
    Code,
    CodeTyping,
    Diagram,
    Summary,
}

impl SectionType {
    /// All section types in declaration order
    pub const ALL: [SectionType; 6] = [
        SectionType::Title,
        SectionType::Slide,
        SectionType::Code,
        SectionType::CodeTyping,
        SectionType::Diagram,
        SectionType::Summary,
    ];

    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SectionType::Title => "title",
            SectionType::Slide => "slide",
            SectionType::Code => "code",
            SectionType::CodeTyping => "code_typing",
            SectionType::Diagram => "diagram",
            SectionType::Summary => "summary",
        }
    }

    /// Whether sections of this type get an animation clip
    #[must_use]
    pub fn is_animated(self) -> bool {
        matches!(self, SectionType::CodeTyping | SectionType::Diagram)
    }

    /// Lenient parse used for generated scripts: unknown kinds become slides.
    #[must_use]
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or(SectionType::Slide)
    }
}

impl fmt::Display for SectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SectionType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ModelError::UnknownSectionType(s.to_string()))
    }
}

/// Project lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    Init,
    ScriptDone,
    VisualsDone,
    NarrationDone,
    Composed,
}

impl ProjectState {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectState::Init => "init",
            ProjectState::ScriptDone => "script_done",
            ProjectState::VisualsDone => "visuals_done",
            ProjectState::NarrationDone => "narration_done",
            ProjectState::Composed => "composed",
        }
    }
}

impl fmt::Display for ProjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured script document as produced by the script generator
///
/// The document is kept verbatim; [`ScriptDocument::section_drafts`] reads
/// the `sections` array out of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptDocument(pub Value);

impl ScriptDocument {
    /// Wrap a JSON document
    #[inline]
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Canonical hash of the document
    #[inline]
    #[must_use]
    pub fn hash(&self) -> ContentHash {
        ContentHash::of_json(&self.0)
    }

    /// Section drafts in document order. Entries that are not objects are
    /// skipped; unknown section kinds fall back to `slide`.
    #[must_use]
    pub fn section_drafts(&self) -> Vec<SectionDraft> {
        let Some(items) = self.0.get("sections").and_then(Value::as_array) else {
            return Vec::new();
        };
        items
            .iter()
            .filter(|item| item.is_object())
            .map(|item| SectionDraft {
                section_type: item
                    .get("type")
                    .and_then(Value::as_str)
                    .map_or(SectionType::Slide, SectionType::parse_lenient),
                duration: item.get("duration").and_then(Value::as_f64),
                narration: item
                    .get("narration")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                visual_spec: item.get("visual_spec").filter(|v| !v.is_null()).cloned(),
            })
            .collect()
    }
}

/// Section content before it is placed in a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionDraft {
    #[serde(rename = "type")]
    pub section_type: SectionType,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub narration: Option<String>,
    #[serde(default)]
    pub visual_spec: Option<Value>,
}

impl SectionDraft {
    /// Draft with only a type
    #[inline]
    #[must_use]
    pub fn new(section_type: SectionType) -> Self {
        Self {
            section_type,
            duration: None,
            narration: None,
            visual_spec: None,
        }
    }

    /// With narration text
    #[inline]
    #[must_use]
    pub fn with_narration(mut self, text: impl Into<String>) -> Self {
        self.narration = Some(text.into());
        self
    }

    /// With visual spec
    #[inline]
    #[must_use]
    pub fn with_visual_spec(mut self, spec: Value) -> Self {
        self.visual_spec = Some(spec);
        self
    }
}

/// Reference to a generated artifact in blob storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Blob storage handle
    pub location: String,
    /// Hash of the artifact bytes
    pub content_hash: ContentHash,
    /// Digest of the inputs that produced it
    pub input_digest: ContentHash,
}

/// Derived artifacts of a section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionArtifacts {
    pub slide_image: Option<ArtifactRef>,
    pub narration_audio: Option<ArtifactRef>,
    pub animation_video: Option<ArtifactRef>,
}

/// One ordered section of a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub id: SectionId,
    pub project_id: ProjectId,
    pub section_index: usize,
    #[serde(rename = "type")]
    pub section_type: SectionType,
    pub duration: Option<f64>,
    pub narration: Option<String>,
    pub visual_spec: Option<Value>,
    #[serde(default)]
    pub artifacts: SectionArtifacts,
    pub generation_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Section {
    /// Place a draft in a project at `section_index`
    #[must_use]
    pub fn from_draft(
        project_id: ProjectId,
        section_index: usize,
        draft: SectionDraft,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SectionId::new(),
            project_id,
            section_index,
            section_type: draft.section_type,
            duration: draft.duration,
            narration: draft.narration,
            visual_spec: draft.visual_spec,
            artifacts: SectionArtifacts::default(),
            generation_prompt: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Narration text, empty when unset
    #[inline]
    #[must_use]
    pub fn narration_text(&self) -> &str {
        self.narration.as_deref().unwrap_or_default()
    }

    /// Hash of the narration text alone
    #[inline]
    #[must_use]
    pub fn narration_hash(&self) -> ContentHash {
        ContentHash::of_str(self.narration_text())
    }

    /// Hash of the visual spec serialization (`null` when unset)
    #[inline]
    #[must_use]
    pub fn visual_spec_hash(&self) -> ContentHash {
        ContentHash::of_json(self.visual_spec.as_ref().unwrap_or(&Value::Null))
    }

    /// The authoritative inputs of this section
    #[must_use]
    pub fn authoritative_inputs(&self) -> InputSet {
        InputSet::new()
            .with("narration", self.narration_hash())
            .with("visual_spec", self.visual_spec_hash())
            .with("type", ContentHash::of_str(self.section_type.as_str()))
    }

    /// Content hash over narration text, visual spec and type
    #[inline]
    #[must_use]
    pub fn content_hash(&self) -> ContentHash {
        self.authoritative_inputs().digest()
    }

    /// Duration used for composition
    #[inline]
    #[must_use]
    pub fn effective_duration(&self) -> f64 {
        self.duration.unwrap_or(DEFAULT_SECTION_SECS)
    }

    /// Draft carrying this section's content
    #[must_use]
    pub fn to_draft(&self) -> SectionDraft {
        SectionDraft {
            section_type: self.section_type,
            duration: self.duration,
            narration: self.narration.clone(),
            visual_spec: self.visual_spec.clone(),
        }
    }
}

/// Top-level project record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub theme: String,
    pub state: ProjectState,
    pub script: Option<ScriptDocument>,
    pub duration_target: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Create a project in `init` state
    ///
    /// # Errors
    /// Returns error if the theme is empty or too long, or the duration
    /// target is outside the accepted range.
    pub fn new(
        theme: impl Into<String>,
        duration_target: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Self, ModelError> {
        let theme = theme.into();
        validate_theme(&theme)?;
        if let Some(secs) = duration_target {
            validate_duration_target(secs)?;
        }
        Ok(Self {
            id: ProjectId::new(),
            theme,
            state: ProjectState::Init,
            script: None,
            duration_target,
            created_at: now,
            updated_at: now,
        })
    }

    /// Hash of the inputs the script is generated from
    #[must_use]
    pub fn script_inputs(&self) -> InputSet {
        let duration = self
            .duration_target
            .map_or_else(String::new, |secs| format!("{secs}"));
        InputSet::new()
            .with("theme", ContentHash::of_str(&self.theme))
            .with("duration_target", ContentHash::of_str(&duration))
    }
}

/// Check the theme length rule
///
/// # Errors
/// Returns error if the theme is empty or longer than [`MAX_THEME_CHARS`].
pub fn validate_theme(theme: &str) -> Result<(), ModelError> {
    let chars = theme.chars().count();
    if chars == 0 || chars > MAX_THEME_CHARS {
        return Err(ModelError::InvalidTheme { chars });
    }
    Ok(())
}

/// Check the duration target rule
///
/// # Errors
/// Returns error if `secs` lies outside [`DURATION_TARGET_RANGE`].
pub fn validate_duration_target(secs: f64) -> Result<(), ModelError> {
    if !DURATION_TARGET_RANGE.contains(&secs) {
        return Err(ModelError::InvalidDurationTarget(secs));
    }
    Ok(())
}

/// Model validation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("theme must be 1..=500 characters, got {chars}")]
    InvalidTheme { chars: usize },

    #[error("duration target {0}s outside 30..=3600")]
    InvalidDurationTarget(f64),

    #[error("unknown section type: {0}")]
    UnknownSectionType(String),
}
