use kino_artifact::{ProjectState, SectionEdit, SectionId};
use kino_core::{
    ComposeOutcome, KinoConfig, PipelineError, PipelineEvent, Repository, RetryPolicy,
};
use kino_feedback::{EvolutionRequest, PromptKind, ResolveContext};
use kino_kernel::{Category, CorrectionDraft, LogFilter, Stage, StageKind, Unit};
use kino_test_utils::{fast_config, wait_for_calls, Harness, NARRATION_SECS};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn section_ids(h: &Harness, id: kino_artifact::ProjectId) -> Vec<SectionId> {
    h.orchestrator
        .sections(id)
        .await
        .unwrap()
        .iter()
        .map(|s| s.id)
        .collect()
}

#[tokio::test]
async fn project_runs_to_composed() {
    let h = Harness::new().await;
    let kino = &h.orchestrator;
    let id = h.scripted_project().await;
    assert_eq!(kino.project(id).await.unwrap().state, ProjectState::ScriptDone);
    assert_eq!(kino.sections(id).await.unwrap().len(), 3);

    let visuals = kino.generate_visuals(id).await.unwrap();
    assert_eq!(visuals.completed.len(), 4, "three slides and one diagram animation");
    assert_eq!(visuals.state, ProjectState::VisualsDone);

    let narration = kino.generate_narration(id).await.unwrap();
    assert_eq!(narration.completed.len(), 3);
    assert_eq!(narration.state, ProjectState::NarrationDone);

    let status = kino.compose_status(id).await.unwrap();
    assert!(status.ready);
    assert!(status.missing.is_empty());
    assert_eq!(status.total_duration, 3.0 * NARRATION_SECS);

    let composed = kino.compose(id).await.unwrap();
    match composed.outcome {
        ComposeOutcome::Playable(video) => {
            assert_eq!(video.location, format!("mem://{id}/composition"));
        }
        other => panic!("expected a playable video, got {other:?}"),
    }
    assert_eq!(kino.project(id).await.unwrap().state, ProjectState::Composed);
    assert!(kino.stale_units(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn narration_edit_invalidates_only_what_depends_on_it() {
    let h = Harness::new().await;
    let kino = &h.orchestrator;
    let id = h.composed_project().await;
    let ids = section_ids(&h, id).await;

    let report = kino
        .apply_section_edit(
            id,
            SectionEdit::SetNarration {
                index: 1,
                text: "Each value has exactly one owner.".into(),
            },
        )
        .await
        .unwrap();
    let correction = report.correction.expect("edit is recorded");
    assert_eq!(correction.draft.stage, Stage::Narration);
    assert_eq!(correction.draft.category, Category::Content);
    assert_eq!(correction.draft.section_id, Some(ids[1]));

    let stale = kino.stale_units(id).await.unwrap();
    assert!(stale.contains(&Unit::Narration(ids[1])));
    assert!(stale.contains(&Unit::Images(ids[1])));
    assert!(stale.contains(&Unit::Composition));
    assert!(!stale.contains(&Unit::Script));
    assert!(!stale.contains(&Unit::Images(ids[0])));
    assert!(!stale.contains(&Unit::Narration(ids[2])));

    let err = kino.generate_narration(id).await.unwrap_err();
    assert_eq!(
        err,
        PipelineError::PrecursorMissing {
            stage: Stage::Narration,
            missing: vec![Unit::Images(ids[1])],
        }
    );

    let visuals = kino.generate_visuals(id).await.unwrap();
    assert_eq!(visuals.completed, vec![Unit::Images(ids[1])]);
    assert_eq!(visuals.skipped.len(), 3);
    assert_eq!(visuals.state, ProjectState::Composed);
    let narration = kino.generate_narration(id).await.unwrap();
    assert_eq!(narration.completed, vec![Unit::Narration(ids[1])]);
    assert!(matches!(
        kino.compose(id).await.unwrap().outcome,
        ComposeOutcome::Playable(_)
    ));
    assert_eq!(h.generator.calls_for(StageKind::Images), 4);

    let restyled = kino
        .apply_section_edit(
            id,
            SectionEdit::SetVisualSpec {
                index: 0,
                spec: json!({"text": "Ownership", "palette": "pastel"}),
            },
        )
        .await
        .unwrap();
    assert_eq!(restyled.correction.unwrap().draft.category, Category::Style);
    assert!(restyled.invalidated.contains(&Unit::Images(ids[0])));
    assert!(!restyled.invalidated.contains(&Unit::Narration(ids[0])));
}

#[tokio::test]
async fn visuals_need_a_script() {
    let h = Harness::new().await;
    let kino = &h.orchestrator;
    let project = kino.create_project("Lifetimes", None).await.unwrap();

    let err = kino.generate_visuals(project.id).await.unwrap_err();
    assert_eq!(
        err,
        PipelineError::PrecursorMissing {
            stage: Stage::Image,
            missing: vec![Unit::Script],
        }
    );
    assert_eq!(kino.project(project.id).await.unwrap().state, ProjectState::Init);
    assert!(h.generator.calls().is_empty());
}

#[tokio::test]
async fn compose_without_ffmpeg_is_degraded() {
    let h = Harness::new().await;
    let kino = &h.orchestrator;
    h.generator.set_ffmpeg(false);
    let id = h.scripted_project().await;
    kino.generate_visuals(id).await.unwrap();
    kino.generate_narration(id).await.unwrap();
    let mut events = kino.subscribe();

    let report = kino.compose(id).await.unwrap();
    assert!(matches!(report.outcome, ComposeOutcome::Degraded { .. }));
    assert_eq!(report.stage.state, ProjectState::Composed);
    assert_eq!(h.generator.calls_for(StageKind::Composition), 0);

    let status = kino.compose_status(id).await.unwrap();
    assert!(!status.ffmpeg_available);
    assert!(status.video.is_none());

    let mut degraded = false;
    while let Ok(event) = events.try_recv() {
        degraded |= matches!(event, PipelineEvent::Degraded { project, .. } if project == id);
    }
    assert!(degraded);
}

#[tokio::test]
async fn compose_needs_sections() {
    let h = Harness::new().await;
    h.generator.set_script(json!({"title": "Empty", "sections": []}));
    let id = h.scripted_project().await;

    let err = h.orchestrator.compose(id).await.unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
}

#[tokio::test]
async fn edit_during_generation_requeues_the_unit() {
    let h = Harness::new().await;
    let kino = Arc::clone(&h.orchestrator);
    let id = h.scripted_project().await;
    let first = section_ids(&h, id).await[0];

    h.generator.hold(StageKind::Images);
    let running = {
        let kino = Arc::clone(&kino);
        tokio::spawn(async move { kino.generate_visuals(id).await })
    };
    assert!(wait_for_calls(&h.generator, StageKind::Images, 3).await);

    let spec = json!({"text": "Ownership", "background": "dark"});
    kino.apply_section_edit(
        id,
        SectionEdit::SetVisualSpec {
            index: 0,
            spec: spec.clone(),
        },
    )
    .await
    .unwrap();
    h.generator.release(StageKind::Images);

    let report = running.await.unwrap().unwrap();
    assert!(report.is_complete(), "{report:?}");
    assert!(report.completed.contains(&Unit::Images(first)));
    assert_eq!(h.generator.calls_for(StageKind::Images), 4);

    let retried = h
        .generator
        .calls()
        .into_iter()
        .rev()
        .find(|r| r.unit == Unit::Images(first))
        .unwrap();
    assert_eq!(retried.section.unwrap().visual_spec, Some(spec));
    let stale = kino.stale_units(id).await.unwrap();
    assert!(!stale.contains(&Unit::Images(first)));
}

#[tokio::test]
async fn overlapping_stage_runs_generate_each_unit_once() {
    let h = Harness::new().await;
    let kino = Arc::clone(&h.orchestrator);
    let id = h.scripted_project().await;

    h.generator.hold(StageKind::Images);
    let first = {
        let kino = Arc::clone(&kino);
        tokio::spawn(async move { kino.generate_visuals(id).await })
    };
    assert!(wait_for_calls(&h.generator, StageKind::Images, 3).await);
    let second = {
        let kino = Arc::clone(&kino);
        tokio::spawn(async move { kino.generate_visuals(id).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!second.is_finished(), "second run waits for the first");
    assert_eq!(h.generator.calls_for(StageKind::Images), 3);
    h.generator.release(StageKind::Images);

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert!(first.is_complete(), "{first:?}");
    assert!(second.is_complete(), "{second:?}");
    assert_eq!(first.completed.len(), 4);
    assert!(second.completed.is_empty());
    assert_eq!(second.skipped.len(), 4);
    assert_eq!(second.state, ProjectState::VisualsDone);
    assert_eq!(h.generator.calls_for(StageKind::Images), 3);
    assert_eq!(h.generator.calls_for(StageKind::Animations), 1);
}

#[tokio::test]
async fn transient_storage_failures_are_retried() {
    let h = Harness::new().await;
    h.repo.fail_next(2);
    let project = h.orchestrator.create_project("Traits", None).await.unwrap();
    assert_eq!(h.orchestrator.project(project.id).await.unwrap(), project);

    h.repo.set_offline(true);
    let err = h.orchestrator.create_project("Generics", None).await.unwrap_err();
    assert!(matches!(err, PipelineError::StorageUnavailable(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn failed_correction_append_leaves_the_edit_unapplied() {
    let h = Harness::new().await;
    let kino = &h.orchestrator;
    let id = h.scripted_project().await;
    let edit = || SectionEdit::SetNarration {
        index: 0,
        text: "Welcome back to ownership.".into(),
    };

    h.repo.fail_appends(3);
    let err = kino.apply_section_edit(id, edit()).await.unwrap_err();
    assert!(matches!(err, PipelineError::StorageUnavailable(_)));
    let sections = kino.sections(id).await.unwrap();
    assert_eq!(sections[0].narration.as_deref(), Some("Welcome to ownership."));
    assert!(kino.corrections(&LogFilter::default()).is_empty());

    let retried = kino.apply_section_edit(id, edit()).await.unwrap();
    assert!(retried.correction.is_some());
    assert_eq!(kino.corrections(&LogFilter::default()).len(), 1);
    assert_eq!(h.repo.corrections().await.unwrap().len(), 1);
    assert!(kino.verify_log().is_ok());
}

#[tokio::test]
async fn failed_script_append_keeps_the_old_script() {
    let h = Harness::new().await;
    let kino = &h.orchestrator;
    let id = h.scripted_project().await;
    let mut script = kino_test_utils::sample_script();
    script["title"] = json!("Borrowing in Rust");

    h.repo.fail_appends(3);
    let err = kino.update_script(id, script.clone()).await.unwrap_err();
    assert!(matches!(err, PipelineError::StorageUnavailable(_)));
    let stored = kino.project(id).await.unwrap().script.unwrap();
    assert_eq!(stored.0["title"], json!("Ownership in Rust"));

    let retried = kino.update_script(id, script).await.unwrap();
    assert!(retried.correction.is_some());
    assert_eq!(kino.corrections(&LogFilter::default()).len(), 1);
}

#[tokio::test]
async fn failed_units_are_reported_and_block_the_state() {
    let h = Harness::new().await;
    let id = h.scripted_project().await;
    h.generator.fail_next(StageKind::Images, 6);

    let report = h.orchestrator.generate_visuals(id).await.unwrap();
    assert_eq!(report.failed.len(), 3);
    assert_eq!(report.completed.len(), 1, "the animation still ran");
    assert!(report
        .failed
        .iter()
        .all(|f| matches!(f.error, PipelineError::GenerationFailure { .. })));
    assert_eq!(report.state, ProjectState::ScriptDone);
    assert_eq!(h.generator.calls_for(StageKind::Images), 6, "two attempts each");

    let retry = h.orchestrator.generate_visuals(id).await.unwrap();
    assert!(retry.is_complete());
    assert_eq!(retry.skipped.len(), 1);
    assert_eq!(retry.state, ProjectState::VisualsDone);
}

#[tokio::test]
async fn slow_generation_times_out() {
    let mut config = fast_config();
    config.generation.timeout_ms = 50;
    config.generation.retry = RetryPolicy::none();
    let h = Harness::with_config(config).await;
    h.generator.delay(StageKind::Script, Duration::from_millis(500));
    let project = h.orchestrator.create_project("Closures", None).await.unwrap();

    let report = h.orchestrator.generate_script(project.id).await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(
        report.failed[0].error,
        PipelineError::Timeout {
            target: "script".into(),
            after_ms: 50,
        }
    );
    assert_eq!(report.state, ProjectState::Init);
}

#[tokio::test]
async fn sections_without_narration_get_no_audio() {
    let h = Harness::new().await;
    h.generator.set_script(json!({"sections": [
        {"type": "slide", "visual_spec": {"text": "Silent slide"}},
        {"type": "summary", "narration": "That is ownership."}
    ]}));
    let id = h.scripted_project().await;
    let kino = &h.orchestrator;
    kino.generate_visuals(id).await.unwrap();

    let report = kino.generate_narration(id).await.unwrap();
    assert_eq!(report.completed.len(), 2);
    assert_eq!(h.generator.calls_for(StageKind::Narration), 1);
    let sections = kino.sections(id).await.unwrap();
    assert!(sections[0].artifacts.narration_audio.is_none());
    assert!(sections[1].artifacts.narration_audio.is_some());
    assert!(kino.compose_status(id).await.unwrap().ready);
}

#[tokio::test]
async fn regenerating_with_a_new_prompt_records_a_correction() {
    let h = Harness::new().await;
    let kino = &h.orchestrator;
    let id = h.composed_project().await;
    let first = section_ids(&h, id).await[0];

    let report = kino
        .regenerate_unit(id, Unit::Images(first), "Flat pastel title card", Some("too busy"))
        .await
        .unwrap();
    assert_eq!(report.completed, vec![Unit::Images(first)]);
    assert_eq!(report.state, ProjectState::Composed);

    let logged = kino.corrections(&LogFilter::default().project(id));
    let correction = &logged[0];
    assert_eq!(correction.draft.stage, Stage::Image);
    assert_eq!(correction.draft.category, Category::Style);
    assert_eq!(correction.draft.field_path, "image.prompt");
    assert_eq!(correction.draft.prompt_after.as_deref(), Some("Flat pastel title card"));
    assert_eq!(correction.draft.user_feedback.as_deref(), Some("too busy"));

    let sections = kino.sections(id).await.unwrap();
    assert_eq!(sections[0].generation_prompt.as_deref(), Some("Flat pastel title card"));
    let last = h.generator.calls().pop().unwrap();
    assert!(last.prompt.starts_with("Flat pastel title card"));
    assert_eq!(kino.stale_units(id).await.unwrap(), vec![Unit::Composition]);
}

#[tokio::test]
async fn learned_preferences_reach_generation_prompts() {
    let h = Harness::new().await;
    let kino = &h.orchestrator;
    let id = h.scripted_project().await;
    let code = section_ids(&h, id).await[1];
    let dark = || {
        CorrectionDraft::new(id, Stage::Image, Category::Style, "visual_spec.background")
            .with_values(Some("white".into()), Some("dark".into()))
            .with_section(code, kino_artifact::SectionType::Code)
    };

    for _ in 0..3 {
        kino.record_correction(dark()).await.unwrap();
    }
    let first = kino.evolve_preferences(EvolutionRequest::default()).await.unwrap();
    assert_eq!(first.created.len(), 1);
    let ctx = ResolveContext::new(id).section_type(kino_artifact::SectionType::Code);
    assert_eq!(kino.suggestions(&ctx).len(), 1);

    kino.record_correction(dark()).await.unwrap();
    let second = kino.evolve_preferences(EvolutionRequest::default()).await.unwrap();
    assert_eq!(second.reinforced, first.created);
    assert!(kino.resolve_preferences(&ctx).auto_applied().count() == 1);

    kino.generate_visuals(id).await.unwrap();
    let request = h
        .generator
        .calls()
        .into_iter()
        .find(|r| r.unit == Unit::Images(code))
        .unwrap();
    assert_eq!(request.applied_preferences, first.created);
    assert!(request.prompt.contains("[code]"));

    let built = kino.build_prompt(PromptKind::Visual, "Draw.", &ctx);
    assert_eq!(built.applied, first.created);
    assert!(h.repo.preferences().await.unwrap().len() == 1);
}

#[tokio::test]
async fn contradicting_content_corrections_weaken_a_learned_preference() {
    let h = Harness::new().await;
    let kino = &h.orchestrator;
    let id = h.scripted_project().await;
    let tone = |value: &str| {
        CorrectionDraft::new(id, Stage::Script, Category::Content, "script.tone")
            .with_values(None, Some(value.to_string()))
    };

    for _ in 0..3 {
        kino.record_correction(tone("formal")).await.unwrap();
    }
    let learned = kino.evolve_preferences(EvolutionRequest::default()).await.unwrap();
    assert_eq!(learned.created.len(), 1);
    let pref = learned.created[0];
    let before = h.repo.preferences().await.unwrap()[0].confidence;

    kino.record_correction(tone("casual")).await.unwrap();
    let report = kino.evolve_preferences(EvolutionRequest::default()).await.unwrap();
    assert_eq!(report.weakened, vec![pref]);
    assert!(report.deferred.is_empty());

    let stored = h.repo.preferences().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].confidence < before);
    assert_eq!(h.repo.processed_corrections().await.unwrap().len(), 4);
}

#[tokio::test]
async fn project_evolution_is_rejected_during_a_whole_log_run() {
    let h = Harness::new().await;
    let id = h.scripted_project().await;
    let held = h.orchestrator.evolution().try_begin(None).unwrap();

    let err = h
        .orchestrator
        .evolve_preferences(EvolutionRequest {
            project: Some(id),
            limit: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err, PipelineError::EvolutionInFlight { project: Some(id) });
    drop(held);
}

#[tokio::test]
async fn evolution_is_single_flight() {
    let h = Harness::new().await;
    let held = h.orchestrator.evolution().try_begin(None).unwrap();

    let err = h
        .orchestrator
        .evolve_preferences(EvolutionRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err, PipelineError::EvolutionInFlight { project: None });
    assert!(err.is_retryable());

    drop(held);
    assert!(h
        .orchestrator
        .evolve_preferences(EvolutionRequest::default())
        .await
        .is_ok());
}

#[tokio::test]
async fn reopening_restores_state() {
    let h = Harness::new().await;
    let id = h.composed_project().await;
    h.orchestrator
        .apply_section_edit(
            id,
            SectionEdit::SetNarration {
                index: 2,
                text: "A move transfers ownership.".into(),
            },
        )
        .await
        .unwrap();
    let ids = section_ids(&h, id).await;

    let restarted = h.reopen().await;
    let kino = &restarted.orchestrator;
    assert_eq!(kino.project(id).await.unwrap().state, ProjectState::Composed);
    assert_eq!(kino.corrections(&LogFilter::default()).len(), 1);
    assert!(kino.verify_log().is_ok());

    let stale = kino.stale_units(id).await.unwrap();
    assert!(stale.contains(&Unit::Narration(ids[2])));
    assert!(stale.contains(&Unit::Images(ids[2])));
    assert!(stale.contains(&Unit::Composition));
    assert!(!stale.contains(&Unit::Script));
    assert!(!stale.contains(&Unit::Images(ids[0])));
    assert!(stale.contains(&Unit::Animations(ids[2])));
    assert!(!stale.contains(&Unit::Narration(ids[0])));
}

#[tokio::test]
async fn invalid_configuration_is_rejected_on_open() {
    let mut config = KinoConfig::default();
    config.generation.max_concurrent = 0;
    let repo = Arc::new(kino_core::InMemoryRepository::new());
    let generator = Arc::new(kino_test_utils::ScriptedGenerator::new());

    let err = kino_core::Orchestrator::open(config, repo, generator)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
}
