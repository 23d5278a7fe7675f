//! Testing utilities for the Kino workspace
//!
//! A scripted generator, fixtures and an orchestrator harness.

#![allow(missing_docs)]

use async_trait::async_trait;
use kino_artifact::ProjectId;
use kino_core::{
    GeneratedArtifact, GenerationError, GenerationPolicy, GenerationRequest, Generator,
    InMemoryRepository, KinoConfig, Orchestrator, RetryPolicy,
};
use kino_kernel::StageKind;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Narration length reported for every generated track
pub const NARRATION_SECS: f64 = 4.0;

/// Script with a title, a code and an animated diagram section
#[must_use]
pub fn sample_script() -> Value {
    json!({
        "title": "Ownership in Rust",
        "sections": [
            {"type": "title", "narration": "Welcome to ownership.", "visual_spec": {"text": "Ownership"}},
            {"type": "code", "narration": "Every value has one owner.", "visual_spec": {"code": "let s = String::new();"}},
            {"type": "diagram", "narration": "Moves transfer ownership.", "visual_spec": {"nodes": ["a", "b"]}}
        ]
    })
}

/// Defaults with short timeouts and near-instant backoff
#[must_use]
pub fn fast_config() -> KinoConfig {
    KinoConfig::default()
        .with_generation(GenerationPolicy {
            timeout_ms: 2_000,
            max_concurrent: 4,
            max_requeue_rounds: 3,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
        })
        .with_storage_retry(RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        })
}

/// Generator whose behavior tests script per stage kind.
///
/// Every request is recorded before any gate, delay or injected failure
/// applies. Content hashes are the input digest, so equal inputs produce
/// equal artifacts.
#[derive(Debug)]
pub struct ScriptedGenerator {
    calls: Mutex<Vec<GenerationRequest>>,
    failures: Mutex<HashMap<StageKind, usize>>,
    delays: Mutex<HashMap<StageKind, Duration>>,
    gates: Mutex<HashMap<StageKind, Arc<Semaphore>>>,
    ffmpeg: AtomicBool,
    script: Mutex<Value>,
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            ffmpeg: AtomicBool::new(true),
            script: Mutex::new(sample_script()),
        }
    }

    /// Document returned for script units
    pub fn set_script(&self, script: Value) {
        *self.script.lock() = script;
    }

    pub fn set_ffmpeg(&self, available: bool) {
        self.ffmpeg.store(available, Ordering::SeqCst);
    }

    /// Fail the next `n` calls of `kind`
    pub fn fail_next(&self, kind: StageKind, n: usize) {
        self.failures.lock().insert(kind, n);
    }

    pub fn delay(&self, kind: StageKind, delay: Duration) {
        self.delays.lock().insert(kind, delay);
    }

    /// Block calls of `kind` until [`Self::release`]
    pub fn hold(&self, kind: StageKind) {
        self.gates.lock().insert(kind, Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, kind: StageKind) {
        if let Some(gate) = self.gates.lock().remove(&kind) {
            gate.close();
        }
    }

    #[must_use]
    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().clone()
    }

    #[must_use]
    pub fn calls_for(&self, kind: StageKind) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|r| r.unit.kind() == kind)
            .count()
    }

    fn take_failure(&self, kind: StageKind) -> bool {
        let mut failures = self.failures.lock();
        match failures.get_mut(&kind) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<GeneratedArtifact, GenerationError> {
        let kind = request.unit.kind();
        self.calls.lock().push(request.clone());

        let gate = self.gates.lock().get(&kind).cloned();
        if let Some(gate) = gate {
            // closed on release
            let _ = gate.acquire().await;
        }
        let delay = self.delays.lock().get(&kind).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.take_failure(kind) {
            return Err(GenerationError::Failed {
                unit: request.unit,
                reason: "scripted failure".into(),
            });
        }

        let artifact = GeneratedArtifact::new(
            format!("mem://{}/{}", request.project, request.unit),
            request.inputs.digest(),
        );
        Ok(match kind {
            StageKind::Script => artifact.with_document(self.script.lock().clone()),
            StageKind::Narration => artifact.with_duration(NARRATION_SECS),
            _ => artifact,
        })
    }

    async fn ffmpeg_available(&self) -> bool {
        self.ffmpeg.load(Ordering::SeqCst)
    }
}

/// Poll until `generator` has seen `n` calls of `kind`. Returns false
/// after about two seconds.
pub async fn wait_for_calls(generator: &ScriptedGenerator, kind: StageKind, n: usize) -> bool {
    for _ in 0..400 {
        if generator.calls_for(kind) >= n {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Orchestrator wired to in-memory storage and a scripted generator
#[derive(Debug, Clone)]
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub repo: Arc<InMemoryRepository>,
    pub generator: Arc<ScriptedGenerator>,
}

impl Harness {
    /// New harness over fresh storage with [`fast_config`]
    pub async fn new() -> Self {
        Self::with_config(fast_config()).await
    }

    pub async fn with_config(config: KinoConfig) -> Self {
        let repo = Arc::new(InMemoryRepository::new());
        let generator = Arc::new(ScriptedGenerator::new());
        Self::open(config, repo, generator).await
    }

    async fn open(
        config: KinoConfig,
        repo: Arc<InMemoryRepository>,
        generator: Arc<ScriptedGenerator>,
    ) -> Self {
        let orchestrator = Orchestrator::open(config, repo.clone(), generator.clone())
            .await
            .expect("orchestrator opens over in-memory storage");
        Self {
            orchestrator: Arc::new(orchestrator),
            repo,
            generator,
        }
    }

    /// A second orchestrator over the same storage, as after a restart
    pub async fn reopen(&self) -> Self {
        Self::open(
            self.orchestrator.config().clone(),
            Arc::clone(&self.repo),
            Arc::clone(&self.generator),
        )
        .await
    }

    /// Project with a generated script
    pub async fn scripted_project(&self) -> ProjectId {
        let project = self
            .orchestrator
            .create_project("Ownership in Rust", Some(60.0))
            .await
            .expect("project is valid");
        let report = self
            .orchestrator
            .generate_script(project.id)
            .await
            .expect("script stage runs");
        assert!(report.is_complete(), "script stage failed: {report:?}");
        project.id
    }

    /// Project taken through every stage
    pub async fn composed_project(&self) -> ProjectId {
        let id = self.scripted_project().await;
        let kino = &self.orchestrator;
        assert!(kino.generate_visuals(id).await.expect("visuals run").is_complete());
        assert!(kino.generate_narration(id).await.expect("narration runs").is_complete());
        kino.compose(id).await.expect("compose runs");
        id
    }
}
