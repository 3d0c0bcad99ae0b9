//! mend-core - patch model and session bookkeeping for mend
//!
//! Synchronous building blocks shared by the `mend` binary: line-range
//! patches, isolated workspaces, configuration, prompts and reports.

pub mod artifacts;
pub mod bug_report;
pub mod config;
pub mod patch;
pub mod prompt;
pub mod report;
pub mod scratch;
pub mod types;

pub use config::Config;
pub use patch::{apply, PatchError, PatchSpec, SourceFile};
pub use report::{RepairReport, ReportRow, ReportWriter};
pub use scratch::{InPlaceStage, ScratchWorkspace};
pub use types::*;
