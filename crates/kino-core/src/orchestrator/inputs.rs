//! Declared inputs and base prompts per unit

use chrono::{DateTime, Utc};
use kino_artifact::{
    ContentHash, InputSet, Project, ProjectId, ScriptDocument, Section, SectionDraft, SectionId,
};
use kino_feedback::PromptKind;
use kino_kernel::{DagTracker, Unit};
use serde_json::Value;

pub(crate) fn script_hash(project: &Project) -> ContentHash {
    project
        .script
        .as_ref()
        .map_or_else(|| ContentHash::of_str(""), ScriptDocument::hash)
}

/// Hash of the playback order
pub(crate) fn order_hash(sections: &[Section]) -> ContentHash {
    let ids: Vec<String> = sections.iter().map(|s| s.id.to_string()).collect();
    ContentHash::of_str(&ids.join(","))
}

pub(crate) fn find(sections: &[Section], id: SectionId) -> Option<&Section> {
    sections.iter().find(|s| s.id == id)
}

/// Current inputs of `unit`; `None` once its section is gone.
///
/// Composition folds in the recorded output of every section unit, so a
/// regenerated image makes the composition stale even when no section
/// text changed.
pub(crate) fn unit_inputs(
    dag: &DagTracker,
    project: &Project,
    sections: &[Section],
    unit: Unit,
) -> Option<InputSet> {
    match unit {
        Unit::Script => Some(project.script_inputs()),
        Unit::Narration(id) => {
            let section = find(sections, id)?;
            Some(
                InputSet::new()
                    .with("script", script_hash(project))
                    .with("narration", section.narration_hash()),
            )
        }
        Unit::Images(id) | Unit::Animations(id) => {
            let section = find(sections, id)?;
            let mut inputs = section.authoritative_inputs();
            inputs.insert("script", script_hash(project));
            Some(inputs)
        }
        Unit::Composition => {
            let mut inputs = InputSet::new()
                .with("script", script_hash(project))
                .with("order", order_hash(sections));
            for section in sections {
                for part in Unit::section_units(section.id, section.section_type) {
                    let produced = dag
                        .record(project.id, part)
                        .map_or_else(|| ContentHash::of_str(""), |r| r.produced);
                    inputs.insert(part.to_string(), produced);
                }
            }
            Some(inputs)
        }
    }
}

/// Prompt family used to personalize a unit, if any
pub(crate) fn prompt_kind(unit: Unit) -> Option<PromptKind> {
    match unit {
        Unit::Script => Some(PromptKind::Script),
        Unit::Narration(_) => Some(PromptKind::Narration),
        Unit::Images(_) | Unit::Animations(_) => Some(PromptKind::Visual),
        Unit::Composition => None,
    }
}

fn spec_text(section: &Section) -> String {
    section
        .visual_spec
        .as_ref()
        .map_or_else(|| "{}".to_string(), Value::to_string)
}

/// Prompt before preferences are applied. A user prompt stored on the
/// section replaces the default for visual units.
pub(crate) fn base_prompt(project: &Project, sections: &[Section], unit: Unit) -> String {
    let section = unit.section().and_then(|id| find(sections, id));
    match (unit, section) {
        (Unit::Script, _) => match project.duration_target {
            Some(secs) => format!(
                "Write an educational video script about \"{}\" lasting about {secs} seconds.",
                project.theme
            ),
            None => format!("Write an educational video script about \"{}\".", project.theme),
        },
        (Unit::Images(_) | Unit::Animations(_), Some(s)) if s.generation_prompt.is_some() => {
            s.generation_prompt.clone().unwrap_or_default()
        }
        (Unit::Images(_), Some(s)) => format!(
            "Render a {} slide for \"{}\" from this visual spec:\n{}",
            s.section_type,
            project.theme,
            spec_text(s)
        ),
        (Unit::Animations(_), Some(s)) => format!(
            "Animate the {} section from this visual spec:\n{}",
            s.section_type,
            spec_text(s)
        ),
        (Unit::Narration(_), Some(s)) => format!(
            "Narrate this section in a clear, friendly voice:\n{}",
            s.narration_text()
        ),
        (Unit::Composition, _) => format!(
            "Compose {} sections of \"{}\" into the final video.",
            sections.len(),
            project.theme
        ),
        (_, None) => String::new(),
    }
}

/// Sections for a new script document, reusing ids by position
pub(crate) fn sections_from_script(
    project_id: ProjectId,
    existing: &[Section],
    script: &ScriptDocument,
    now: DateTime<Utc>,
) -> Vec<Section> {
    script
        .section_drafts()
        .into_iter()
        .enumerate()
        .map(|(index, draft)| match existing.get(index) {
            Some(old) => refill(old, index, draft, now),
            None => Section::from_draft(project_id, index, draft, now),
        })
        .collect()
}

fn refill(old: &Section, index: usize, draft: SectionDraft, now: DateTime<Utc>) -> Section {
    Section {
        section_index: index,
        section_type: draft.section_type,
        duration: draft.duration,
        narration: draft.narration,
        visual_spec: draft.visual_spec,
        updated_at: now,
        ..old.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kino_artifact::SectionType;
    use serde_json::json;

    fn project_with_script(doc: Value) -> Project {
        let mut project = Project::new("Ownership", Some(90.0), Utc::now()).unwrap();
        project.script = Some(ScriptDocument::new(doc));
        project
    }

    #[test]
    fn positional_reuse_keeps_ids() {
        let now = Utc::now();
        let first = project_with_script(json!({"sections": [
            {"type": "title", "narration": "Hi"},
            {"type": "code", "narration": "print hello"}
        ]}));
        let before = sections_from_script(first.id, &[], first.script.as_ref().unwrap(), now);

        let next = ScriptDocument::new(json!({"sections": [
            {"type": "title", "narration": "Hello"},
            {"type": "slide", "narration": "Borrowing"},
            {"type": "summary", "narration": "Bye"}
        ]}));
        let after = sections_from_script(first.id, &before, &next, now);

        assert_eq!(after.len(), 3);
        assert_eq!(after[0].id, before[0].id);
        assert_eq!(after[1].id, before[1].id);
        assert_eq!(after[1].section_type, SectionType::Slide);
        assert_eq!(after[1].narration.as_deref(), Some("Borrowing"));
        assert!(before.iter().all(|s| s.id != after[2].id));
    }

    #[test]
    fn script_change_reaches_every_section_input() {
        let project = project_with_script(json!({"sections": [{"type": "code", "narration": "x"}]}));
        let sections =
            sections_from_script(project.id, &[], project.script.as_ref().unwrap(), Utc::now());
        let dag = DagTracker::new();
        let unit = Unit::Images(sections[0].id);
        let before = unit_inputs(&dag, &project, &sections, unit).unwrap();

        let mut changed = project.clone();
        changed.script = Some(ScriptDocument::new(json!({"sections": [], "title": "new"})));
        let after = unit_inputs(&dag, &changed, &sections, unit).unwrap();
        assert_eq!(before.differing(&after), vec!["script".to_string()]);
    }

    #[test]
    fn stored_prompt_overrides_visual_default() {
        let project = project_with_script(json!({"sections": [{"type": "slide"}]}));
        let mut sections =
            sections_from_script(project.id, &[], project.script.as_ref().unwrap(), Utc::now());
        let unit = Unit::Images(sections[0].id);
        assert!(base_prompt(&project, &sections, unit).starts_with("Render a slide slide"));

        sections[0].generation_prompt = Some("Flat pastel illustration".into());
        assert_eq!(base_prompt(&project, &sections, unit), "Flat pastel illustration");
    }
}
