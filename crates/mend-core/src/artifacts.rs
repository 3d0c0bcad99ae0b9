//! Session artifact files.
//!
//! Layout: `<log_dir>/session-<id>/`
//! - `attempt-NN.patch.txt`: range, rationale, and replacement text
//! - `attempt-NN.log`: combined test output
//! - `proposed-<file name>`: full patched file of the winning attempt
//! - `report.tsv`, `report.json`

use crate::patch::{digest, write_atomic, PatchSpec};
use crate::types::Id;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

/// A written artifact file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: String,
    pub path: PathBuf,
    /// SHA-256 of the file content.
    pub checksum: String,
}

/// Directory holding one session's artifacts.
pub fn session_dir(log_dir: &Path, session_id: &Id) -> PathBuf {
    log_dir.join(format!("session-{session_id}"))
}

pub fn attempt_patch_path(session_dir: &Path, attempt: u32) -> PathBuf {
    session_dir.join(format!("attempt-{attempt:02}.patch.txt"))
}

pub fn attempt_log_path(session_dir: &Path, attempt: u32) -> PathBuf {
    session_dir.join(format!("attempt-{attempt:02}.log"))
}

pub fn proposed_file_path(session_dir: &Path, original_path: &Path) -> PathBuf {
    let name = original_path
        .file_name()
        .map_or_else(|| "file".to_string(), |n| n.to_string_lossy().to_string());
    session_dir.join(format!("proposed-{name}"))
}

/// Write an artifact file, creating the session directory as needed.
pub fn write_artifact(kind: &str, path: &Path, content: &[u8]) -> Result<Artifact> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    write_atomic(path, content)?;
    Ok(Artifact {
        kind: kind.to_string(),
        path: path.to_path_buf(),
        checksum: digest(content),
    })
}

/// Human-readable description of a patch.
pub fn format_patch(spec: &PatchSpec) -> String {
    let (first, last) = spec.one_based_range();
    format!(
        "start line: {first}\nend line: {last}\nwhy: {}\n--- replacement ---\n{}",
        spec.rationale().trim(),
        spec.replacement_text()
    )
}
