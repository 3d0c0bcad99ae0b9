//! Core types for repair sessions.
//!
//! Verdicts, session statuses, and the append-only attempt ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::patch::PatchSpec;

/// Unique identifier for repair sessions.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Classified outcome of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Test process exited 0.
    Pass,
    /// Test process exited nonzero and produced a report.
    Fail,
    /// Malformed patch, launch failure, crash, or timeout.
    Error,
    /// Patch emitted but tests never ran (skip mode).
    Unverified,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
            Self::Unverified => "UNVERIFIED",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of a repair session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// An attempt passed verification.
    Passed,
    /// Every attempt in the budget failed or errored.
    Exhausted,
    /// Skip mode: a patch was produced but never tested.
    Unverified,
    /// Cancelled between attempts by the caller.
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "PASSED",
            Self::Exhausted => "EXHAUSTED",
            Self::Unverified => "UNVERIFIED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Whether the session produced a patch the caller may use.
    pub fn has_patch(&self) -> bool {
        matches!(self, Self::Passed | Self::Unverified)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How patched content is exposed to the test runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageMode {
    /// Tests read the patched copy from a unique temporary path.
    #[default]
    Scratch,
    /// The canonical path is overwritten for the duration of the test run
    /// and restored afterward.
    InPlace,
}

impl StageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scratch => "scratch",
            Self::InPlace => "in_place",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scratch" => Some(Self::Scratch),
            "in_place" | "in-place" => Some(Self::InPlace),
            _ => None,
        }
    }
}

// --- Records ---

/// One entry in a session's append-only attempt ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// The patch tried, absent when the proposal was malformed.
    pub patch: Option<PatchSpec>,
    pub verdict: Verdict,
    /// Combined test output, empty when tests did not run.
    pub raw_test_output: String,
    /// Test process exit code, when it exited normally.
    pub exit_code: Option<i32>,
    /// Why an `Error` verdict was recorded.
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl AttemptRecord {
    /// Record an attempt whose proposal never became a valid patch.
    pub fn malformed(
        attempt_number: u32,
        detail: impl Into<String>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        Self {
            attempt_number,
            patch: None,
            verdict: Verdict::Error,
            raw_test_output: String::new(),
            exit_code: None,
            detail: Some(detail.into()),
            started_at,
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_time_ordered() {
        let first = Id::new();
        let second = Id::new();
        assert_ne!(first, second);
        assert!(first.0 < second.0);
    }

    #[test]
    fn verdict_serializes_screaming_case() {
        let json = serde_json::to_string(&Verdict::Unverified).unwrap();
        assert_eq!(json, "\"UNVERIFIED\"");
        assert_eq!(Verdict::Fail.to_string(), "FAIL");
    }

    #[test]
    fn only_passed_and_unverified_carry_a_patch() {
        assert!(SessionStatus::Passed.has_patch());
        assert!(SessionStatus::Unverified.has_patch());
        assert!(!SessionStatus::Exhausted.has_patch());
        assert!(!SessionStatus::Cancelled.has_patch());
    }

    #[test]
    fn stage_mode_parse_accepts_both_spellings() {
        assert_eq!(StageMode::parse("scratch"), Some(StageMode::Scratch));
        assert_eq!(StageMode::parse("in_place"), Some(StageMode::InPlace));
        assert_eq!(StageMode::parse("in-place"), Some(StageMode::InPlace));
        assert_eq!(StageMode::parse("elsewhere"), None);
    }

    #[test]
    fn malformed_record_has_error_verdict_and_no_patch() {
        let record = AttemptRecord::malformed(2, "invalid range", Utc::now(), 5);
        assert_eq!(record.verdict, Verdict::Error);
        assert!(record.patch.is_none());
        assert_eq!(record.detail.as_deref(), Some("invalid range"));
    }
}
