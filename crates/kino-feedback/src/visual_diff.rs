//! Visual diff corrections
//!
//! An analyzer compares an original and an edited image and describes what
//! changed. Each described change becomes a style correction on the image
//! stage, so visual edits feed the same evolution path as text edits.

use crate::error::FeedbackError;
use async_trait::async_trait;
use kino_artifact::{ProjectId, SectionId, SectionType};
use kino_kernel::{Category, CorrectionDraft, Stage};
use serde::{Deserialize, Serialize};

/// One described visual change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualChange {
    /// e.g. `background`, `font_size`, `layout`
    pub aspect: String,
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
    /// Preference the change expresses, in plain words
    pub preference: String,
}

/// Analyzer output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualDiff {
    #[serde(default)]
    pub changes: Vec<VisualChange>,
    #[serde(default)]
    pub overall_preference: Option<String>,
}

/// Compares two images. Implementations call out to a vision model.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VisualDiffAnalyzer: Send + Sync {
    /// Describe how `edited` differs from `original`
    async fn analyze(&self, original: &str, edited: &str) -> Result<VisualDiff, FeedbackError>;
}

impl VisualDiff {
    /// Corrections describing this diff.
    ///
    /// Each change with a non-blank preference gives one draft. A diff with
    /// no usable changes falls back to the overall preference.
    #[must_use]
    pub fn to_drafts(
        &self,
        project: ProjectId,
        section: Option<(SectionId, SectionType)>,
        image_before: Option<&str>,
        image_after: Option<&str>,
    ) -> Vec<CorrectionDraft> {
        let base = |field: String| {
            let draft = CorrectionDraft::new(project, Stage::Image, Category::Style, field)
                .with_images(image_before.map(str::to_string), image_after.map(str::to_string));
            match section {
                Some((id, section_type)) => draft.with_section(id, section_type),
                None => draft,
            }
        };

        let drafts: Vec<CorrectionDraft> = self
            .changes
            .iter()
            .filter(|c| !c.preference.trim().is_empty())
            .map(|c| {
                base(format!("visual.{}", c.aspect.trim()))
                    .with_values(c.before.clone(), c.after.clone())
                    .with_visual_diff(c.preference.trim())
            })
            .collect();
        if !drafts.is_empty() {
            return drafts;
        }

        self.overall_preference
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| vec![base("visual".to_string()).with_visual_diff(p)])
            .unwrap_or_default()
    }
}

/// Run `analyzer` and turn its answer into correction drafts.
///
/// # Errors
/// Returns error if the analyzer fails.
pub async fn analyze_edit(
    analyzer: &dyn VisualDiffAnalyzer,
    project: ProjectId,
    section: Option<(SectionId, SectionType)>,
    original: &str,
    edited: &str,
) -> Result<Vec<CorrectionDraft>, FeedbackError> {
    let diff = analyzer.analyze(original, edited).await?;
    let drafts = diff.to_drafts(project, section, Some(original), Some(edited));
    tracing::debug!(
        project = %project,
        changes = diff.changes.len(),
        drafts = drafts.len(),
        "visual diff analyzed"
    );
    Ok(drafts)
}
