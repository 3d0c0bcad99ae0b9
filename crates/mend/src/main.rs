//! mend - repair a source file until its tests pass
//!
//! Main entry point for the `mend` binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Args, Parser, Subcommand};
use eyre::{bail, eyre, WrapErr};
use mend::{CommandProposer, ProposerConfig, RepairRequest, RepairSession, SessionOutcome};
use mend_core::artifacts::format_patch;
use mend_core::bug_report::BugReport;
use mend_core::prompt::condense_output;
use mend_core::{Config, SessionStatus, StageMode};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Exit code for a passing or unverified patch.
const EXIT_PATCHED: i32 = 0;
/// Exit code when the budget ran out or the session was cancelled.
const EXIT_NO_FIX: i32 = 1;
/// Exit code for fatal errors.
const EXIT_FATAL: i32 = 2;

#[derive(Parser)]
#[command(name = "mend")]
#[command(about = "Propose, apply and test patches until a source file passes its tests")]
#[command(version)]
struct Cli {
    /// Workspace root (default: current directory)
    #[arg(long, global = true, env = "MEND_WORKDIR")]
    workdir: Option<PathBuf>,

    /// Config file path (overrides .mend/config)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a repair session for one file
    Run(RunArgs),

    /// Print the effective configuration as JSON
    Config,
}

#[derive(Args)]
struct RunArgs {
    /// File to repair
    #[arg(long)]
    file: Option<PathBuf>,

    /// Bug description
    #[arg(long, conflicts_with = "description_file")]
    description: Option<String>,

    /// Read the bug description from a file
    #[arg(long)]
    description_file: Option<PathBuf>,

    /// Test targets (none = patch-only mode)
    #[arg(long, num_args = 1..)]
    tests: Vec<PathBuf>,

    /// Issue JSON with `### ` sections for description, tests and file
    #[arg(long)]
    issue: Option<PathBuf>,

    /// Maximum number of attempts
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Where tests see the patch: scratch or in_place
    #[arg(long, value_parser = parse_stage_mode)]
    stage_mode: Option<StageMode>,

    /// Generator command (JSON request on stdin, JSON reply on stdout)
    #[arg(long, env = "MEND_GENERATOR")]
    generator: Option<String>,

    /// Model name passed to the generator
    #[arg(long)]
    model: Option<String>,

    /// Write a passing patch into the original file
    #[arg(long)]
    commit: bool,
}

fn parse_stage_mode(value: &str) -> Result<StageMode, String> {
    StageMode::parse(value).ok_or_else(|| format!("invalid stage mode: {value} (scratch, in_place)"))
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing. Results go to stdout, logs to stderr.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let code = runtime.block_on(async {
        match execute(cli).await {
            Ok(code) => code,
            Err(err) => {
                error!("{err:#}");
                eprintln!("error: {err:?}");
                EXIT_FATAL
            }
        }
    });
    std::process::exit(code);
}

async fn execute(cli: Cli) -> eyre::Result<i32> {
    let root = match &cli.workdir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().wrap_err("cannot determine current directory")?,
    };
    let mut config = load_config(&root, cli.config.as_deref())?;

    match cli.command {
        Command::Config => {
            config.resolve_paths(&root);
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(EXIT_PATCHED)
        }
        Command::Run(args) => run(&root, config, args).await,
    }
}

/// Defaults, then `.mend/config`, then `--config`.
fn load_config(root: &Path, explicit: Option<&Path>) -> eyre::Result<Config> {
    let mut config = Config::default();
    if config
        .load_workspace_default(root)
        .wrap_err("failed to load workspace config")?
    {
        info!(root = %root.display(), "loaded workspace config");
    }
    if let Some(path) = explicit {
        config
            .load_file(path)
            .wrap_err_with(|| format!("failed to load config {}", path.display()))?;
    }
    Ok(config)
}

async fn run(root: &Path, mut config: Config, args: RunArgs) -> eyre::Result<i32> {
    let issue = match &args.issue {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("failed to read issue {}", path.display()))?;
            Some(BugReport::from_issue_json(&json).wrap_err("failed to parse issue")?)
        }
        None => None,
    };

    let file = args
        .file
        .clone()
        .or_else(|| issue.as_ref().map(|i| i.code_path.clone()))
        .ok_or_else(|| eyre!("a file to repair is required (--file or --issue)"))?;

    let description = if let Some(text) = args.description {
        text
    } else if let Some(path) = &args.description_file {
        std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read description {}", path.display()))?
    } else if let Some(issue) = &issue {
        issue.description.clone()
    } else {
        bail!("a bug description is required (--description, --description-file or --issue)");
    };

    if !args.tests.is_empty() {
        config.test_targets = args.tests;
    } else if let Some(issue) = &issue {
        if config.test_targets.is_empty() {
            config.test_targets.clone_from(&issue.test_targets);
        }
    }
    if let Some(issue) = &issue {
        config.context_files.extend(issue.context_files.iter().cloned());
    }
    if let Some(max_attempts) = args.max_attempts {
        config.max_attempts = max_attempts;
    }
    if let Some(stage_mode) = args.stage_mode {
        config.stage_mode = stage_mode;
    }
    if let Some(generator) = args.generator {
        config.generator_cmd = Some(generator);
    }
    if let Some(model) = args.model {
        config.model = model;
    }
    config.resolve_paths(root);

    if config.generator_cmd.is_none() {
        bail!("no generator configured (--generator, MEND_GENERATOR or generator_cmd)");
    }

    let original_path = if file.is_relative() {
        root.join(file)
    } else {
        file
    };

    let proposer = CommandProposer::new(ProposerConfig::from_config(&config));
    let session = RepairSession::new(config, proposer);

    let cancel = session.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, cancelling session");
            cancel.cancel();
        }
    });

    let outcome = session
        .run(&RepairRequest {
            original_path,
            description,
        })
        .await
        .wrap_err("repair session failed")?;

    print_outcome(&outcome);

    if args.commit {
        if outcome.status == SessionStatus::Passed {
            outcome.commit().wrap_err("failed to commit patch")?;
            println!("committed patch to {}", outcome.original_path.display());
        } else {
            warn!(status = %outcome.status, "--commit ignored: session did not pass");
        }
    }

    Ok(match outcome.status {
        SessionStatus::Passed | SessionStatus::Unverified => EXIT_PATCHED,
        SessionStatus::Exhausted | SessionStatus::Cancelled => EXIT_NO_FIX,
    })
}

fn print_outcome(outcome: &SessionOutcome) {
    println!(
        "status: {} after {} attempt(s)",
        outcome.status,
        outcome.attempts.len()
    );
    println!("session: {}", outcome.session_dir.display());

    let patch = outcome
        .winning_patch()
        .or_else(|| outcome.attempts.iter().rev().find_map(|r| r.patch.as_ref()));
    if let Some(patch) = patch {
        let label = if outcome.status.has_patch() {
            "patch"
        } else {
            "last patch tried"
        };
        println!("\n{label}:\n{}", format_patch(patch));
    }

    if outcome.status == SessionStatus::Exhausted && !outcome.report.last_test_output.is_empty() {
        println!(
            "\nlast test output:\n{}",
            condense_output(&outcome.report.last_test_output, 20)
        );
    }
}
