//! Preference model
//!
//! A preference is a scoped, confidence-weighted rule inferred from
//! corrections or declared by a user. Scope qualifiers are carried by the
//! [`PreferenceScope`] variants; flat `(scope, project_id, section_type)`
//! records decode through [`ScopeRecord`] validation.

use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use kino_artifact::{PreferenceId, ProjectId, SectionType};
use kino_kernel::{Category, CorrectionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scope discriminant, least to most specific
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Global,
    Project,
    SectionType,
    Specific,
}

impl ScopeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ScopeKind::Global => "global",
            ScopeKind::Project => "project",
            ScopeKind::SectionType => "section_type",
            ScopeKind::Specific => "specific",
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a preference applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ScopeRecord", into = "ScopeRecord")]
pub enum PreferenceScope {
    Global,
    Project {
        project: ProjectId,
    },
    SectionType {
        section_type: SectionType,
    },
    Specific {
        project: ProjectId,
        section_type: SectionType,
    },
}

impl PreferenceScope {
    #[must_use]
    pub fn kind(&self) -> ScopeKind {
        match self {
            PreferenceScope::Global => ScopeKind::Global,
            PreferenceScope::Project { .. } => ScopeKind::Project,
            PreferenceScope::SectionType { .. } => ScopeKind::SectionType,
            PreferenceScope::Specific { .. } => ScopeKind::Specific,
        }
    }

    /// Rank used for ordering; higher is more specific
    #[must_use]
    pub fn specificity(&self) -> u8 {
        match self.kind() {
            ScopeKind::Global => 0,
            ScopeKind::Project => 1,
            ScopeKind::SectionType => 2,
            ScopeKind::Specific => 3,
        }
    }

    /// Whether the scope covers a generation for `project` and `section_type`
    #[must_use]
    pub fn applies_to(&self, project: ProjectId, section_type: Option<SectionType>) -> bool {
        match *self {
            PreferenceScope::Global => true,
            PreferenceScope::Project { project: p } => p == project,
            PreferenceScope::SectionType { section_type: t } => section_type == Some(t),
            PreferenceScope::Specific {
                project: p,
                section_type: t,
            } => p == project && section_type == Some(t),
        }
    }

    #[must_use]
    pub fn project(&self) -> Option<ProjectId> {
        match *self {
            PreferenceScope::Project { project } | PreferenceScope::Specific { project, .. } => {
                Some(project)
            }
            PreferenceScope::Global | PreferenceScope::SectionType { .. } => None,
        }
    }

    #[must_use]
    pub fn section_type(&self) -> Option<SectionType> {
        match *self {
            PreferenceScope::SectionType { section_type }
            | PreferenceScope::Specific { section_type, .. } => Some(section_type),
            PreferenceScope::Global | PreferenceScope::Project { .. } => None,
        }
    }

    /// Stable textual key, used to derive inferred preference ids
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            PreferenceScope::Global => "global".to_string(),
            PreferenceScope::Project { project } => format!("project:{project}"),
            PreferenceScope::SectionType { section_type } => format!("section_type:{section_type}"),
            PreferenceScope::Specific {
                project,
                section_type,
            } => format!("specific:{project}:{section_type}"),
        }
    }
}

impl fmt::Display for PreferenceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreferenceScope::Global => f.write_str("all projects"),
            PreferenceScope::Project { .. } => f.write_str("this project"),
            PreferenceScope::SectionType { section_type } => write!(f, "{section_type} sections"),
            PreferenceScope::Specific { section_type, .. } => {
                write!(f, "{section_type} sections of this project")
            }
        }
    }
}

/// Flat wire form of a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRecord {
    pub scope: ScopeKind,
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    #[serde(default)]
    pub section_type: Option<SectionType>,
}

impl TryFrom<ScopeRecord> for PreferenceScope {
    type Error = ValidationError;

    fn try_from(record: ScopeRecord) -> Result<Self, Self::Error> {
        let mismatch = |detail| ValidationError::ScopeQualifier {
            scope: record.scope,
            detail,
        };
        match (record.scope, record.project_id, record.section_type) {
            (ScopeKind::Global, None, None) => Ok(PreferenceScope::Global),
            (ScopeKind::Global, _, _) => Err(mismatch("must not carry qualifiers")),
            (ScopeKind::Project, Some(project), None) => Ok(PreferenceScope::Project { project }),
            (ScopeKind::Project, None, _) => Err(mismatch("requires a project_id")),
            (ScopeKind::Project, Some(_), Some(_)) => Err(mismatch("must not carry a section_type")),
            (ScopeKind::SectionType, None, Some(section_type)) => {
                Ok(PreferenceScope::SectionType { section_type })
            }
            (ScopeKind::SectionType, _, None) => Err(mismatch("requires a section_type")),
            (ScopeKind::SectionType, Some(_), Some(_)) => {
                Err(mismatch("must not carry a project_id"))
            }
            (ScopeKind::Specific, Some(project), Some(section_type)) => {
                Ok(PreferenceScope::Specific {
                    project,
                    section_type,
                })
            }
            (ScopeKind::Specific, _, _) => {
                Err(mismatch("requires both project_id and section_type"))
            }
        }
    }
}

impl From<PreferenceScope> for ScopeRecord {
    fn from(scope: PreferenceScope) -> Self {
        Self {
            scope: scope.kind(),
            project_id: scope.project(),
            section_type: scope.section_type(),
        }
    }
}

/// Confidence banding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    /// Recorded only
    AuditOnly,
    /// Offered to the user, applied after acceptance
    Suggest,
    /// Applied silently
    AutoApply,
}

/// Tier thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidencePolicy {
    pub auto_apply: f64,
    pub suggest: f64,
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self {
            auto_apply: 0.85,
            suggest: 0.5,
        }
    }
}

impl ConfidencePolicy {
    #[must_use]
    pub fn tier(&self, confidence: f64) -> ConfidenceTier {
        if confidence >= self.auto_apply {
            ConfidenceTier::AutoApply
        } else if confidence >= self.suggest {
            ConfidenceTier::Suggest
        } else {
            ConfidenceTier::AuditOnly
        }
    }

    /// # Errors
    /// Returns error unless `0 <= suggest <= auto_apply <= 1`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(0.0..=1.0).contains(&self.suggest)
            || !(0.0..=1.0).contains(&self.auto_apply)
            || self.suggest > self.auto_apply
        {
            return Err(ValidationError::Policy(format!(
                "confidence thresholds suggest={} auto_apply={} must satisfy 0 <= suggest <= auto_apply <= 1",
                self.suggest, self.auto_apply
            )));
        }
        Ok(())
    }
}

/// How a preference came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Inferred,
    User,
}

/// A scoped, confidence-weighted generation rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preference {
    pub id: PreferenceId,
    pub description: String,
    pub category: Category,
    #[serde(flatten)]
    pub scope: PreferenceScope,
    /// Field path the rule is about
    #[serde(default)]
    pub concern: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub source_corrections: Vec<CorrectionId>,
    #[serde(default)]
    pub contradicting_corrections: Vec<CorrectionId>,
    pub is_active: bool,
    pub prompt_version: u32,
    pub origin: Origin,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Preference {
    /// # Errors
    /// Returns error on an empty description or out-of-range confidence.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.description.trim().is_empty() {
            return Err(ValidationError::EmptyDescription);
        }
        check_confidence(self.confidence)
    }

    /// Move to a new confidence, bumping `prompt_version` when the tier
    /// changes.
    pub fn set_confidence(&mut self, confidence: f64, policy: &ConfidencePolicy, at: DateTime<Utc>) {
        if policy.tier(confidence) != policy.tier(self.confidence) {
            self.prompt_version += 1;
        }
        self.confidence = confidence;
        self.updated_at = at;
    }

    #[inline]
    #[must_use]
    pub fn tier(&self, policy: &ConfidencePolicy) -> ConfidenceTier {
        policy.tier(self.confidence)
    }
}

pub(crate) fn check_confidence(confidence: f64) -> Result<(), ValidationError> {
    if !(0.0..=1.0).contains(&confidence) {
        return Err(ValidationError::ConfidenceOutOfRange(confidence));
    }
    Ok(())
}

/// A user-declared preference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceDraft {
    pub description: String,
    pub category: Category,
    #[serde(flatten)]
    pub scope: PreferenceScope,
    #[serde(default)]
    pub concern: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    pub confidence: f64,
}

impl PreferenceDraft {
    /// Seal into a user-origin preference.
    ///
    /// # Errors
    /// Returns error when the draft fails validation.
    pub fn into_preference(self, at: DateTime<Utc>) -> Result<Preference, ValidationError> {
        let preference = Preference {
            id: PreferenceId::new(),
            description: self.description,
            category: self.category,
            scope: self.scope,
            concern: self.concern,
            direction: self.direction,
            confidence: self.confidence,
            source_corrections: Vec::new(),
            contradicting_corrections: Vec::new(),
            is_active: true,
            prompt_version: 1,
            origin: Origin::User,
            created_at: at,
            updated_at: at,
        };
        preference.validate()?;
        Ok(preference)
    }
}

/// Explicit user edit; unset fields are left alone
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferenceUpdate {
    pub description: Option<String>,
    pub direction: Option<String>,
    pub confidence: Option<f64>,
    pub is_active: Option<bool>,
}

impl PreferenceUpdate {
    /// # Errors
    /// Returns error on an empty description or out-of-range confidence.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(description) = &self.description {
            if description.trim().is_empty() {
                return Err(ValidationError::EmptyDescription);
            }
        }
        if let Some(c) = self.confidence {
            check_confidence(c)?;
        }
        Ok(())
    }
}
