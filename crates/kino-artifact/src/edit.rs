//! Structural edits on a project's ordered sections
//!
//! Every [`SectionEdit`] is validated against the current section list
//! before anything is mutated, so a rejected edit leaves the list untouched.
//! After a successful edit `section_index` values are exactly `0..len`.

use crate::ids::{ProjectId, SectionId};
use crate::model::{Section, SectionDraft, SectionType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A first-class mutation of the section list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SectionEdit {
    /// Insert a new section before position `at` (`at == len` appends)
    Insert { at: usize, draft: SectionDraft },
    /// Remove the section at `index`
    Delete { index: usize },
    /// Split the narration of `index` at character `at_char`
    Split { index: usize, at_char: usize },
    /// Merge `index + 1` into `index`
    Merge { index: usize },
    /// Move the section at `from` to position `to`
    Reorder { from: usize, to: usize },
    /// Replace narration text
    SetNarration { index: usize, text: String },
    /// Replace the visual spec
    SetVisualSpec { index: usize, spec: Value },
    /// Change the section type
    SetType { index: usize, section_type: SectionType },
}

impl SectionEdit {
    /// Field path recorded in the correction log for this edit
    #[must_use]
    pub fn field_path(&self) -> &'static str {
        match self {
            SectionEdit::Insert { .. } => "sections.insert",
            SectionEdit::Delete { .. } => "sections.delete",
            SectionEdit::Split { .. } => "sections.split",
            SectionEdit::Merge { .. } => "sections.merge",
            SectionEdit::Reorder { .. } => "sections.order",
            SectionEdit::SetNarration { .. } => "narration",
            SectionEdit::SetVisualSpec { .. } => "visual_spec",
            SectionEdit::SetType { .. } => "type",
        }
    }

    /// True for edits that change the shape or order of the list
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            SectionEdit::Insert { .. }
                | SectionEdit::Delete { .. }
                | SectionEdit::Split { .. }
                | SectionEdit::Merge { .. }
                | SectionEdit::Reorder { .. }
        )
    }

    /// Index of the section the edit is anchored on
    #[must_use]
    pub fn anchor(&self) -> usize {
        match self {
            SectionEdit::Insert { at, .. } => *at,
            SectionEdit::Reorder { from, .. } => *from,
            SectionEdit::Delete { index }
            | SectionEdit::Split { index, .. }
            | SectionEdit::Merge { index }
            | SectionEdit::SetNarration { index, .. }
            | SectionEdit::SetVisualSpec { index, .. }
            | SectionEdit::SetType { index, .. } => *index,
        }
    }
}

/// What an applied edit touched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EditOutcome {
    /// Sections whose content changed
    pub changed: Vec<SectionId>,
    /// Sections created by the edit
    pub created: Vec<SectionId>,
    /// Sections removed by the edit
    pub removed: Vec<SectionId>,
    /// Whether playback order changed
    pub order_changed: bool,
    /// Value before the edit, for the correction log
    pub prior_value: Option<String>,
    /// Value after the edit, for the correction log
    pub new_value: Option<String>,
    /// Type of the anchored section before the edit
    pub section_type: Option<SectionType>,
    /// Anchored section, if it still exists
    pub section_id: Option<SectionId>,
}

/// Errors from section edits
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    #[error("section index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("cannot split section {index} at char {at_char}: narration has {chars} chars")]
    InvalidSplit {
        index: usize,
        at_char: usize,
        chars: usize,
    },

    #[error("section {index} has no successor to merge")]
    NothingToMerge { index: usize },

    #[error("cannot merge a {first} section with a {second} section")]
    MergeTypeMismatch {
        first: SectionType,
        second: SectionType,
    },

    #[error("section ordering has a gap or duplicate: expected index {expected}, found {found}")]
    NonContiguous { expected: usize, found: usize },

    #[error("section {section} belongs to another project")]
    ForeignSection { section: SectionId },
}

/// Verify `sections` is sorted with indices exactly `0..len` and a single owner.
///
/// # Errors
/// Returns the first violation found.
pub fn check_ordering(project_id: ProjectId, sections: &[Section]) -> Result<(), EditError> {
    for (expected, section) in sections.iter().enumerate() {
        if section.project_id != project_id {
            return Err(EditError::ForeignSection {
                section: section.id,
            });
        }
        if section.section_index != expected {
            return Err(EditError::NonContiguous {
                expected,
                found: section.section_index,
            });
        }
    }
    Ok(())
}

/// Rewrite indices to match vector positions
pub fn reindex(sections: &mut [Section]) {
    for (i, section) in sections.iter_mut().enumerate() {
        section.section_index = i;
    }
}

fn bounds(index: usize, len: usize) -> Result<(), EditError> {
    if index >= len {
        return Err(EditError::IndexOutOfRange { index, len });
    }
    Ok(())
}

fn validate(edit: &SectionEdit, sections: &[Section]) -> Result<(), EditError> {
    let len = sections.len();
    match edit {
        SectionEdit::Insert { at, .. } => {
            if *at > len {
                return Err(EditError::IndexOutOfRange { index: *at, len });
            }
        }
        SectionEdit::Delete { index }
        | SectionEdit::SetNarration { index, .. }
        | SectionEdit::SetVisualSpec { index, .. }
        | SectionEdit::SetType { index, .. } => bounds(*index, len)?,
        SectionEdit::Split { index, at_char } => {
            bounds(*index, len)?;
            let chars = sections[*index].narration_text().chars().count();
            if *at_char == 0 || *at_char >= chars {
                return Err(EditError::InvalidSplit {
                    index: *index,
                    at_char: *at_char,
                    chars,
                });
            }
        }
        SectionEdit::Merge { index } => {
            bounds(*index, len)?;
            if index + 1 >= len {
                return Err(EditError::NothingToMerge { index: *index });
            }
            let (first, second) = (
                sections[*index].section_type,
                sections[index + 1].section_type,
            );
            if first != second {
                return Err(EditError::MergeTypeMismatch { first, second });
            }
        }
        SectionEdit::Reorder { from, to } => {
            bounds(*from, len)?;
            bounds(*to, len)?;
        }
    }
    Ok(())
}

fn narration_value(section: &Section) -> Option<String> {
    section.narration.clone()
}

/// Apply `edit` to `sections` in place.
///
/// # Errors
/// Returns error without mutating anything if the edit is invalid for the
/// current list.
pub fn apply_edit(
    project_id: ProjectId,
    sections: &mut Vec<Section>,
    edit: SectionEdit,
    now: DateTime<Utc>,
) -> Result<EditOutcome, EditError> {
    check_ordering(project_id, sections)?;
    validate(&edit, sections)?;

    let mut outcome = EditOutcome::default();
    if let Some(anchor) = sections.get(edit.anchor()) {
        outcome.section_type = Some(anchor.section_type);
        outcome.section_id = Some(anchor.id);
    }

    match edit {
        SectionEdit::Insert { at, draft } => {
            let section = Section::from_draft(project_id, at, draft, now);
            outcome.created.push(section.id);
            outcome.section_id = Some(section.id);
            outcome.section_type = Some(section.section_type);
            outcome.new_value = section.narration.clone();
            sections.insert(at, section);
            outcome.order_changed = true;
        }
        SectionEdit::Delete { index } => {
            let removed = sections.remove(index);
            outcome.prior_value = narration_value(&removed);
            outcome.removed.push(removed.id);
            outcome.section_id = None;
            outcome.order_changed = true;
        }
        SectionEdit::Split { index, at_char } => {
            let original = &mut sections[index];
            let text = original.narration_text().to_string();
            let split_at = text
                .char_indices()
                .nth(at_char)
                .map_or(text.len(), |(byte, _)| byte);
            let (head, tail) = text.split_at(split_at);
            outcome.prior_value = Some(text.clone());
            original.narration = Some(head.trim_end().to_string());
            original.updated_at = now;
            outcome.changed.push(original.id);

            let mut draft = original.to_draft();
            draft.narration = Some(tail.trim_start().to_string());
            draft.duration = None;
            let second = Section::from_draft(project_id, index + 1, draft, now);
            outcome.created.push(second.id);
            outcome.new_value = Some(format!("{}|{}", head.trim_end(), tail.trim_start()));
            sections.insert(index + 1, second);
            outcome.order_changed = true;
        }
        SectionEdit::Merge { index } => {
            let absorbed = sections.remove(index + 1);
            let target = &mut sections[index];
            outcome.prior_value = Some(format!(
                "{}|{}",
                target.narration_text(),
                absorbed.narration_text()
            ));
            let merged = [target.narration_text(), absorbed.narration_text()]
                .into_iter()
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            target.narration = Some(merged.clone());
            target.duration = match (target.duration, absorbed.duration) {
                (Some(a), Some(b)) => Some(a + b),
                _ => None,
            };
            target.updated_at = now;
            outcome.new_value = Some(merged);
            outcome.changed.push(target.id);
            outcome.removed.push(absorbed.id);
            outcome.order_changed = true;
        }
        SectionEdit::Reorder { from, to } => {
            outcome.prior_value = Some(from.to_string());
            outcome.new_value = Some(to.to_string());
            if from != to {
                let moved = sections.remove(from);
                sections.insert(to, moved);
                outcome.order_changed = true;
            }
        }
        SectionEdit::SetNarration { index, text } => {
            let target = &mut sections[index];
            outcome.prior_value = narration_value(target);
            outcome.new_value = Some(text.clone());
            if target.narration.as_deref() != Some(text.as_str()) {
                target.narration = Some(text);
                target.updated_at = now;
                outcome.changed.push(target.id);
            }
        }
        SectionEdit::SetVisualSpec { index, spec } => {
            let target = &mut sections[index];
            outcome.prior_value = target.visual_spec.as_ref().map(Value::to_string);
            outcome.new_value = Some(spec.to_string());
            if target.visual_spec.as_ref() != Some(&spec) {
                target.visual_spec = Some(spec);
                target.updated_at = now;
                outcome.changed.push(target.id);
            }
        }
        SectionEdit::SetType {
            index,
            section_type,
        } => {
            let target = &mut sections[index];
            outcome.prior_value = Some(target.section_type.to_string());
            outcome.new_value = Some(section_type.to_string());
            if target.section_type != section_type {
                target.section_type = section_type;
                target.updated_at = now;
                outcome.changed.push(target.id);
            }
        }
    }

    reindex(sections);
    Ok(outcome)
}
