//! Kino Kernel
//!
//! Bookkeeping shared by every pipeline operation:
//!
//! - [`dag`]: which generated units are stale after an upstream change
//! - [`state_machine`]: project lifecycle transitions
//! - [`log`]: the append-only, hash-chained correction log
//! - [`correction`]: correction drafts and sealed events

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod correction;
pub mod dag;
pub mod error;
pub mod log;
pub mod state_machine;

pub use correction::{Category, CorrectionDraft, CorrectionEvent, CorrectionId, Stage};
pub use dag::{DagTracker, StageKind, Unit, UnitRecord, UnitState, STAGE_EDGES};
pub use error::{DagError, LogError, TransitionError};
pub use log::{CorrectionLog, CorrectionStats, LogFilter, Sequence};
