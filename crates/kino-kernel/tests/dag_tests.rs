use chrono::Utc;
use kino_artifact::{
    ContentHash, InputSet, ProjectId, Section, SectionDraft, SectionType,
};
use kino_kernel::dag::{DagTracker, Unit};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn section_type() -> impl Strategy<Value = SectionType> {
    prop::sample::select(SectionType::ALL.to_vec())
}

fn project_with(types: &[SectionType]) -> (DagTracker, ProjectId, Vec<Section>) {
    let dag = DagTracker::new();
    let project = ProjectId::new();
    let sections: Vec<Section> = types
        .iter()
        .enumerate()
        .map(|(i, t)| Section::from_draft(project, i, SectionDraft::new(*t), Utc::now()))
        .collect();
    dag.sync_sections(project, &sections);
    (dag, project, sections)
}

fn inputs(values: &[(String, String)]) -> InputSet {
    values
        .iter()
        .fold(InputSet::new(), |set, (k, v)| set.with(k.clone(), ContentHash::of_str(v)))
}

proptest! {
    #[test]
    fn prop_fresh_after_record_stale_iff_input_changes(
        values in proptest::collection::btree_map("[a-z]{1,6}", "[a-z]{0,6}", 1..6),
        victim in 0..6usize,
        replacement in "[A-Z]{1,6}",
    ) {
        let (dag, project, _) = project_with(&[]);
        let pairs: Vec<(String, String)> = values.into_iter().collect();
        let recorded = inputs(&pairs);
        dag.record_produced(project, Unit::Script, recorded.clone(), ContentHash::of_str("out"))
            .unwrap();
        prop_assert!(!dag.is_stale(project, Unit::Script, &recorded).unwrap());

        // Same inputs inserted in reverse order are still fresh
        let mut reversed = pairs.clone();
        reversed.reverse();
        prop_assert!(!dag.is_stale(project, Unit::Script, &inputs(&reversed)).unwrap());

        let mut changed = pairs.clone();
        let idx = victim % changed.len();
        changed[idx].1 = replacement;
        prop_assert!(dag.is_stale(project, Unit::Script, &inputs(&changed)).unwrap());
    }

    #[test]
    fn prop_script_frontier_covers_every_section_unit(
        types in proptest::collection::vec(section_type(), 1..8),
    ) {
        let (dag, project, sections) = project_with(&types);
        let frontier = dag.stale_frontier(project, &[Unit::Script]).unwrap();

        prop_assert_eq!(frontier.first(), Some(&Unit::Script));
        prop_assert_eq!(frontier.last(), Some(&Unit::Composition));
        for s in &sections {
            prop_assert!(frontier.contains(&Unit::Narration(s.id)));
            prop_assert!(frontier.contains(&Unit::Images(s.id)));
            prop_assert_eq!(
                frontier.contains(&Unit::Animations(s.id)),
                s.section_type.is_animated()
            );
        }
    }

    #[test]
    fn prop_narration_frontier_never_reaches_script(
        types in proptest::collection::vec(section_type(), 1..8),
        pick in 0..8usize,
    ) {
        let (dag, project, sections) = project_with(&types);
        let s = &sections[pick % sections.len()];
        let frontier = dag.stale_frontier(project, &[Unit::Narration(s.id)]).unwrap();
        prop_assert!(frontier.contains(&Unit::Composition));
        prop_assert!(!frontier.contains(&Unit::Script));
        prop_assert_eq!(frontier, vec![Unit::Narration(s.id), Unit::Composition]);
    }
}

#[test]
fn edited_code_section_makes_images_stale() {
    let (dag, project, mut sections) = project_with(&[SectionType::Code]);
    sections[0].narration = Some("print hello".to_string());
    let unit = Unit::Images(sections[0].id);
    let h1 = sections[0].authoritative_inputs();
    dag.record_produced(project, unit, h1.clone(), ContentHash::of_str("png-1"))
        .unwrap();
    assert!(!dag.is_stale(project, unit, &h1).unwrap());

    sections[0].narration = Some("print hello world".to_string());
    let h2 = sections[0].authoritative_inputs();
    assert_eq!(h1.differing(&h2), vec!["narration".to_string()]);
    assert!(dag.is_stale(project, unit, &h2).unwrap());

    let frontier = dag.stale_frontier(project, &[unit]).unwrap();
    assert_eq!(frontier, vec![unit, Unit::Composition]);
}

#[test]
fn invalidate_marks_dependents_and_bumps_epochs() {
    let (dag, project, sections) = project_with(&[SectionType::Slide, SectionType::Diagram]);
    for unit in dag.units(project) {
        dag.record_produced(project, unit, InputSet::new(), ContentHash::of_str("x"))
            .unwrap();
    }
    let touched = dag
        .invalidate(project, &[Unit::Narration(sections[1].id)])
        .unwrap();
    assert_eq!(
        touched,
        vec![Unit::Narration(sections[1].id), Unit::Composition]
    );

    let snapshot = dag.snapshot(project);
    assert!(snapshot[&Unit::Composition].invalidated);
    assert_eq!(snapshot[&Unit::Composition].epoch, 1);
    assert!(!snapshot[&Unit::Images(sections[1].id)].invalidated);
    assert!(dag
        .is_stale(project, Unit::Narration(sections[1].id), &InputSet::new())
        .unwrap());
    assert!(!dag
        .is_stale(project, Unit::Narration(sections[0].id), &InputSet::new())
        .unwrap());
}

#[test]
fn projects_are_independent() {
    let (dag, a, _) = project_with(&[]);
    let b = ProjectId::new();
    dag.record_produced(a, Unit::Script, InputSet::new(), ContentHash::of_str("a"))
        .unwrap();
    dag.invalidate(b, &[Unit::Script]).unwrap();
    assert!(!dag.is_stale(a, Unit::Script, &InputSet::new()).unwrap());
    assert_eq!(dag.epoch(a, Unit::Script), 0);
    assert_eq!(dag.epoch(b, Unit::Script), 1);
}
