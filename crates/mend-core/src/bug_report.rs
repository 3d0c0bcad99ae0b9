//! Bug report ingestion from issue-form JSON.
//!
//! Issue bodies are split on `### ` headings. The heading is normalized
//! (lower case, spaces to underscores) and the known sections are pulled out.
//! Values that start with `#` are form placeholders and count as absent.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BugReportError {
    #[error("invalid issue json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("issue has no code path section")]
    MissingCodePath,
}

pub type Result<T> = std::result::Result<T, BugReportError>;

#[derive(Debug, Deserialize)]
struct Issue {
    #[serde(default)]
    body: String,
}

/// Fields of a bug report that drive a repair session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BugReport {
    pub description: String,
    pub code_path: PathBuf,
    /// Empty means patch-only mode.
    pub test_targets: Vec<PathBuf>,
    pub context_files: Vec<PathBuf>,
}

impl BugReport {
    /// Parse an issue JSON document (`{"body": "..."}`).
    pub fn from_issue_json(json: &str) -> Result<Self> {
        let issue: Issue = serde_json::from_str(json)?;
        Self::from_body(&issue.body)
    }

    /// Parse a markdown issue body.
    pub fn from_body(body: &str) -> Result<Self> {
        let sections = split_sections(body);
        let field = |key: &str| {
            sections
                .get(key)
                .map(|s| s.trim())
                .filter(|s| !s.is_empty() && !s.starts_with('#'))
        };
        let list = |key: &str| -> Vec<PathBuf> {
            field(key)
                .map(|s| {
                    s.lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty() && !l.starts_with('#'))
                        .map(PathBuf::from)
                        .collect()
                })
                .unwrap_or_default()
        };

        let code_path = field("code_with_error_path")
            .and_then(|s| s.lines().next())
            .map(|s| PathBuf::from(s.trim()))
            .ok_or(BugReportError::MissingCodePath)?;

        Ok(Self {
            description: field("description_of_the_bug")
                .unwrap_or("No description provided.")
                .to_string(),
            code_path,
            test_targets: list("test_cases"),
            context_files: list("context_files"),
        })
    }
}

/// Split a body on `### ` headings into normalized-heading -> content.
fn split_sections(body: &str) -> HashMap<String, String> {
    let mut sections = HashMap::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in body.lines() {
        if let Some(heading) = line.strip_prefix("### ") {
            if let Some((key, lines)) = current.take() {
                sections.insert(key, lines.join("\n"));
            }
            let key = heading.trim().to_lowercase().replace(' ', "_");
            current = Some((key, Vec::new()));
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }
    if let Some((key, lines)) = current {
        sections.insert(key, lines.join("\n"));
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "### Description of the bug\n\
        median returns the wrong value for even-length lists\n\
        \n\
        ### Test cases\n\
        tests/test_stats.py\n\
        tests/test_more.py\n\
        \n\
        ### Code with error path\n\
        testing_chat/stats.py\n\
        \n\
        ### Context files\n\
        # No context files listed\n";

    #[test]
    fn extracts_known_sections() {
        let report = BugReport::from_body(BODY).unwrap();
        assert_eq!(
            report.description,
            "median returns the wrong value for even-length lists"
        );
        assert_eq!(report.code_path, PathBuf::from("testing_chat/stats.py"));
        assert_eq!(
            report.test_targets,
            vec![PathBuf::from("tests/test_stats.py"), PathBuf::from("tests/test_more.py")]
        );
        assert!(report.context_files.is_empty());
    }

    #[test]
    fn placeholder_tests_mean_skip_mode() {
        let body = "### Test cases\n# No tests provided\n### Code with error path\na.py\n";
        let report = BugReport::from_body(body).unwrap();
        assert!(report.test_targets.is_empty());
        assert_eq!(report.description, "No description provided.");
    }

    #[test]
    fn missing_code_path_is_an_error() {
        let err = BugReport::from_body("### Description of the bug\nbroken\n").unwrap_err();
        assert!(matches!(err, BugReportError::MissingCodePath));
    }

    #[test]
    fn parses_issue_json() {
        let json = serde_json::json!({ "title": "bug", "body": BODY }).to_string();
        let report = BugReport::from_issue_json(&json).unwrap();
        assert_eq!(report.test_targets.len(), 2);
    }
}
