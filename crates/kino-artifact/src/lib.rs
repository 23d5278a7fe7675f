//! Kino Artifact Model
//!
//! Content-addressed records for generated video projects.
//!
//! # Core Concepts
//!
//! - [`ContentHash`]: 32-byte Blake3 hash for content addressing
//! - [`InputSet`]: Order-independent set of named input hashes
//! - [`Project`] / [`Section`]: Storage-agnostic pipeline entities
//! - [`SectionEdit`]: Structural edits that keep section ordering contiguous
//!
//! # Example
//!
//! ```rust
//! use kino_artifact::{ContentHash, Project};
//!
//! let project = Project::new("Rust ownership", Some(120.0), chrono::Utc::now()).unwrap();
//! let inputs = project.script_inputs();
//! assert_eq!(inputs.get("theme"), Some(&ContentHash::of_str("Rust ownership")));
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod edit;
mod hash;
mod ids;
mod model;

pub use edit::{apply_edit, check_ordering, reindex, EditError, EditOutcome, SectionEdit};
pub use hash::{ContentHash, HashError, InputSet};
pub use ids::{PreferenceId, ProjectId, SectionId};
pub use model::{
    validate_duration_target, validate_theme, ArtifactRef, ModelError, Project, ProjectState,
    ScriptDocument, Section, SectionArtifacts, SectionDraft, SectionType, DEFAULT_SECTION_SECS,
    DURATION_TARGET_RANGE, MAX_THEME_CHARS,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
