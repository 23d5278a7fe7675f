use chrono::{TimeZone, Utc};
use kino_artifact::{ProjectId, SectionId, SectionType};
use kino_kernel::correction::{Category, CorrectionDraft, Stage};
use kino_kernel::log::{CorrectionLog, LogFilter};
use std::sync::Arc;
use std::thread;

#[test]
fn concurrent_appends_keep_the_chain() {
    let log = Arc::new(CorrectionLog::new());
    let project = ProjectId::new();

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let log = Arc::clone(&log);
            thread::spawn(move || {
                for i in 0..25 {
                    let draft = CorrectionDraft::new(
                        project,
                        Stage::Narration,
                        Category::Content,
                        "narration",
                    )
                    .with_values(None, Some(format!("{worker}-{i}")));
                    log.append(draft, Utc::now());
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(log.len(), 200);
    assert!(log.verify_integrity().is_ok());
    let sequences: Vec<u64> = log.events().iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (1..=200).collect::<Vec<_>>());
}

#[test]
fn persisted_events_round_trip_through_json() {
    let log = CorrectionLog::new();
    let project = ProjectId::new();
    let at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
    log.append(
        CorrectionDraft::new(project, Stage::Image, Category::Style, "visual_spec.background")
            .with_section(SectionId::new(), SectionType::Code)
            .with_values(Some("light".into()), Some("dark".into()))
            .with_author("alex"),
        at,
    );
    log.append(
        CorrectionDraft::new(project, Stage::Script, Category::Structural, "sections.order"),
        at,
    );

    let json = serde_json::to_string(&log.events()).unwrap();
    let restored = CorrectionLog::new();
    restored
        .restore(serde_json::from_str(&json).unwrap(), Vec::new())
        .unwrap();
    assert_eq!(restored.events(), log.events());
    assert!(restored.verify_integrity().is_ok());

    let styled = restored.query(&LogFilter::default().stage(Stage::Image));
    assert_eq!(styled.len(), 1);
    assert_eq!(styled[0].draft.author, "alex");
    assert_eq!(styled[0].draft.section_type, Some(SectionType::Code));
}
