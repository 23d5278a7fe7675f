//! Kino Core - pipeline orchestration
//!
//! Ties the correction log, the dependency tracker and the preference
//! engine to storage and generation:
//! - Every user edit becomes a correction and invalidates what it touched
//! - Stage runs regenerate only stale units, in parallel, and drop results
//!   that were superseded while they ran
//! - Learned preferences personalize every generation prompt
//!
//! # Example
//!
//! ```rust,ignore
//! use kino_core::{InMemoryRepository, KinoConfig, Orchestrator};
//! use std::sync::Arc;
//!
//! # async fn example(generator: Arc<dyn kino_core::Generator>) -> Result<(), kino_core::PipelineError> {
//! let repo = Arc::new(InMemoryRepository::new());
//! let kino = Orchestrator::open(KinoConfig::default(), repo, generator).await?;
//!
//! let project = kino.create_project("Rust ownership in five minutes", Some(300.0)).await?;
//! kino.generate_script(project.id).await?;
//! kino.generate_visuals(project.id).await?;
//! kino.generate_narration(project.id).await?;
//! let report = kino.compose(project.id).await?;
//! println!("{:?}", report.outcome);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod config;
pub mod error;
pub mod events;
pub mod generation;
pub mod orchestrator;
pub mod repository;
pub mod retry;

pub use config::{ConfigError, GenerationPolicy, KinoConfig};
pub use error::PipelineError;
pub use events::{EventBus, PipelineEvent};
pub use generation::{GeneratedArtifact, GenerationError, GenerationRequest, Generator};
pub use orchestrator::{
    ComposeOutcome, ComposeReport, ComposeStatus, EditReport, Orchestrator, ScriptUpdate,
    StageReport, UnitFailure,
};
pub use repository::{InMemoryRepository, Repository, StorageError};
pub use retry::{retry_with_backoff, RetryPolicy};

/// Common imports for driving a pipeline
pub mod prelude {
    pub use crate::{
        ComposeOutcome, GeneratedArtifact, GenerationRequest, Generator, InMemoryRepository,
        KinoConfig, Orchestrator, PipelineError, PipelineEvent, Repository,
    };
    pub use kino_artifact::{ProjectId, ProjectState, SectionEdit, SectionId, SectionType};
    pub use kino_kernel::{Category, CorrectionDraft, Stage, Unit};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
