//! Patch proposal collaborators.
//!
//! The retry loop asks a [`PatchProposer`] for one candidate fix per attempt.
//! [`CommandProposer`] talks to an external generator process: the request is
//! written to its stdin as JSON and the reply is read back from stdout.

use crate::process::{run_shell, ProcessOutcome, ShellCommand};
use async_trait::async_trait;
use mend_core::prompt::{render_prompt, RepairContext};
use mend_core::Config;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

/// Env var carrying the configured model name to the generator.
pub const ENV_MODEL: &str = "MEND_MODEL";

#[derive(Debug, Error)]
pub enum ProposalError {
    #[error("no generator command configured")]
    NotConfigured,
    #[error("failed to launch generator: {0}")]
    Launch(#[from] std::io::Error),
    #[error("generator timed out after {0} seconds")]
    Timeout(u32),
    #[error("generator exited with {exit_code:?}: {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("malformed generator reply: {0}")]
    Malformed(String),
    #[error("generator reply is missing {0}")]
    MissingField(&'static str),
    #[error("failed to encode generation request: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProposalError>;

/// 1-based inclusive line range of the original file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: i64,
    pub end: i64,
}

/// A candidate fix as returned by a generator, not yet validated against
/// the source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub replacement_code: String,
    pub rationale: String,
    pub line_range: LineRange,
}

#[async_trait]
pub trait PatchProposer: Send + Sync {
    /// Produce one candidate fix for the given context.
    async fn propose(&self, ctx: &RepairContext) -> Result<Proposal>;
}

#[async_trait]
impl<T: PatchProposer + ?Sized> PatchProposer for Box<T> {
    async fn propose(&self, ctx: &RepairContext) -> Result<Proposal> {
        (**self).propose(ctx).await
    }
}

/// Accepted shapes of the `line_range` field.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRange {
    Object(LineRange),
    Pair([i64; 2]),
    List(Vec<LineRange>),
}

#[derive(Debug, Deserialize)]
struct RawProposal {
    // `SuggestedFixedCode` is not an alias: legacy generators put
    // the whole fixed file there, not the replacement for the range.
    #[serde(default)]
    replacement_code: Option<String>,
    #[serde(default, alias = "ExplanationOfFix")]
    rationale: Option<String>,
    #[serde(default, alias = "LineNumberRangesToEdit")]
    line_range: Option<RawRange>,
}

/// Locate the JSON object in a generator reply.
///
/// Tries the whole text, then a fenced ```json block, then the span between
/// the first `{` and the last `}`.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(start) = trimmed.find("```json") {
        let body = &trimmed[start + "```json".len()..];
        if let Some(end) = body.find("```") {
            if let Ok(value) = serde_json::from_str(body[..end].trim()) {
                return Some(value);
            }
        }
    }

    let open = trimmed.find('{')?;
    let close = trimmed.rfind('}')?;
    if close <= open {
        return None;
    }
    serde_json::from_str(&trimmed[open..=close]).ok()
}

/// Parse and validate a generator reply.
pub fn parse_reply(text: &str) -> Result<Proposal> {
    let value = extract_json(text).ok_or_else(|| {
        let preview: String = text.chars().take(200).collect();
        ProposalError::Malformed(preview)
    })?;
    let raw: RawProposal =
        serde_json::from_value(value).map_err(|err| ProposalError::Malformed(err.to_string()))?;

    let replacement_code = raw
        .replacement_code
        .ok_or(ProposalError::MissingField("replacement_code"))?;
    let rationale = raw
        .rationale
        .filter(|r| !r.trim().is_empty())
        .ok_or(ProposalError::MissingField("rationale"))?;
    let line_range = match raw.line_range {
        Some(RawRange::Object(range)) => range,
        Some(RawRange::Pair([start, end])) => LineRange { start, end },
        Some(RawRange::List(ranges)) => match ranges.as_slice() {
            [] => return Err(ProposalError::MissingField("line_range")),
            [range] => *range,
            _ => {
                return Err(ProposalError::Malformed(format!(
                    "expected one line range, got {}",
                    ranges.len()
                )))
            }
        },
        None => return Err(ProposalError::MissingField("line_range")),
    };

    Ok(Proposal {
        replacement_code,
        rationale,
        line_range,
    })
}

/// Generator command configuration.
#[derive(Debug, Clone, Default)]
pub struct ProposerConfig {
    pub command: Option<String>,
    /// Timeout in seconds (0 = no timeout).
    pub timeout_sec: u32,
    pub model: String,
    pub working_dir: Option<PathBuf>,
}

impl ProposerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            command: config.generator_cmd.clone(),
            timeout_sec: config.generator_timeout_sec,
            model: config.model.clone(),
            working_dir: config.working_dir.clone(),
        }
    }
}

/// Request document written to the generator's stdin.
#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    #[serde(flatten)]
    context: &'a RepairContext,
    model: &'a str,
    prompt: String,
}

/// Proposer backed by an external generator process.
#[derive(Debug)]
pub struct CommandProposer {
    config: ProposerConfig,
}

impl CommandProposer {
    pub fn new(config: ProposerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PatchProposer for CommandProposer {
    async fn propose(&self, ctx: &RepairContext) -> Result<Proposal> {
        let command = self
            .config
            .command
            .as_deref()
            .ok_or(ProposalError::NotConfigured)?;

        let request = GenerationRequest {
            context: ctx,
            model: &self.config.model,
            prompt: render_prompt(ctx),
        };
        let input = serde_json::to_vec(&request)?;

        info!(attempt = ctx.attempt, model = %self.config.model, "requesting patch");
        let captured = run_shell(ShellCommand {
            script: command,
            working_dir: self.config.working_dir.as_deref(),
            envs: vec![(ENV_MODEL, self.config.model.clone())],
            stdin: Some(input),
            timeout_sec: self.config.timeout_sec,
        })
        .await?;

        match captured.outcome {
            ProcessOutcome::TimedOut => return Err(ProposalError::Timeout(self.config.timeout_sec)),
            ProcessOutcome::Exited(status) if !status.success() => {
                return Err(ProposalError::Failed {
                    exit_code: status.code(),
                    stderr: String::from_utf8_lossy(&captured.stderr).trim().to_string(),
                });
            }
            ProcessOutcome::Exited(_) => {}
        }

        let reply = String::from_utf8_lossy(&captured.stdout);
        debug!(attempt = ctx.attempt, reply_bytes = reply.len(), "generator replied");
        parse_reply(&reply)
    }
}
