//! Generation context and prompt assembly.
//!
//! The retry loop builds a [`RepairContext`] per attempt and hands it to the
//! generation collaborator. Prior test output is condensed to its tail so
//! the feedback stays small.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A repository file shown to the generator for context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFile {
    pub path: PathBuf,
    pub content: String,
}

impl ContextFile {
    /// Read a context file; unreadable files are included with empty content.
    pub fn load(path: &Path) -> Self {
        let content = std::fs::read_to_string(path).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "context file unreadable");
            String::new()
        });
        Self {
            path: path.to_path_buf(),
            content,
        }
    }
}

/// Everything the generator sees for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairContext {
    /// 1-based attempt this context is for.
    pub attempt: u32,
    pub original_code: String,
    pub description: String,
    /// Condensed output of the previous failed attempt, if any.
    pub prior_test_output: Option<String>,
    pub test_targets: Vec<PathBuf>,
    pub context_files: Vec<ContextFile>,
}

/// Keep the last `tail_lines` lines of test output.
pub fn condense_output(text: &str, tail_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= tail_lines {
        return text.to_string();
    }
    lines[lines.len() - tail_lines..].join("\n")
}

/// Prefix each line with its 1-based number.
pub fn number_lines(code: &str) -> String {
    let mut out = String::with_capacity(code.len() + code.len() / 4);
    for (idx, line) in code.lines().enumerate() {
        let _ = writeln!(out, "{:>4} | {line}", idx + 1);
    }
    out
}

/// Render the instruction prompt for a generation request.
pub fn render_prompt(ctx: &RepairContext) -> String {
    let mut prompt = String::new();

    prompt.push_str(
        "You are repairing one source file so that its test suite passes.\n\
         Reply with JSON only, using exactly these keys:\n\
         - \"replacement_code\": the new text for the edited lines\n\
         - \"rationale\": what was wrong and why the change fixes it\n\
         - \"line_range\": {\"start\": <int>, \"end\": <int>}, the lines of the \
         ORIGINAL file being replaced, 1-based and inclusive\n\n",
    );

    prompt.push_str("[SOURCE]\n");
    prompt.push_str(&number_lines(&ctx.original_code));
    prompt.push_str("[/SOURCE]\n\n");

    prompt.push_str("[TEST_TARGETS]\n");
    if ctx.test_targets.is_empty() {
        prompt.push_str("<none: patch will not be tested>\n");
    } else {
        for target in &ctx.test_targets {
            let _ = writeln!(prompt, "{}", target.display());
        }
    }
    prompt.push_str("[/TEST_TARGETS]\n\n");

    if let Some(output) = &ctx.prior_test_output {
        let _ = write!(
            prompt,
            "[PREVIOUS_ATTEMPT_FAILURE]\nAttempt {} failed verification:\n{}\n[/PREVIOUS_ATTEMPT_FAILURE]\n\n",
            ctx.attempt.saturating_sub(1),
            output.trim_end()
        );
    }

    prompt.push_str("[DESCRIPTION]\n");
    prompt.push_str(ctx.description.trim());
    prompt.push_str("\n[/DESCRIPTION]\n");

    if !ctx.context_files.is_empty() {
        prompt.push_str("\n[REPO_FILES]\n");
        for file in &ctx.context_files {
            let _ = write!(
                prompt,
                "- PATH: {}\n<FILE>\n{}\n</FILE>\n",
                file.path.display(),
                file.content.trim_end()
            );
        }
        prompt.push_str("[/REPO_FILES]\n");
    }

    prompt
}
