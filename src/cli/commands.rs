//! CLI command definitions for longsurf.
//!
//! - `run`: one orchestration pass over a dataset
//! - `repair`: rebuild the `.long` link layout of an output root
//! - `status`: completion overview without dispatching
//! - `errors`: summarise the shared error log

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use crate::config::{OrchestratorConfig, DEFAULT_MARKER_FILE};
use crate::dataset::SubjectDiscoverer;
use crate::dispatch::{ExecutionMode, ProcessRunner};
use crate::errlog::{failed_subjects, read_records};
use crate::layout::{CompletionChecker, OutputLayout};
use crate::linker::{repair, LinkOptions, LinkStatus, RepairSummary};
use crate::orchestrator::{Orchestrator, PassOptions, PassSummary, Selection, SubjectState};
use crate::scheduler::BatchState;

/// Longitudinal FastSurfer orchestration.
#[derive(Parser)]
#[command(name = "longsurf")]
#[command(about = "Dispatch and repair longitudinal FastSurfer processing over a BIDS dataset")]
#[command(version)]
#[command(
    long_about = "longsurf finds subjects with two or more sessions, skips those already processed, runs the longitudinal pipeline for the rest under a concurrency cap, and maintains the <timepoint>.long.<template> link layout.\n\nExample usage:\n  longsurf run --dataset /data/bids --output /data/derivatives/fastsurfer --config longsurf.yaml --detach --batch-size 4\n  longsurf repair /data/derivatives/fastsurfer"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run one orchestration pass.
    Run(RunArgs),

    /// Re-create missing `.long` links in an output root.
    ///
    /// Needs only the output root. Safe to run repeatedly, including while
    /// or after detached jobs finish.
    Repair(RepairArgs),

    /// Show which eligible subjects are complete.
    Status(StatusArgs),

    /// Summarise the shared error log.
    Errors(ErrorsArgs),
}

/// Arguments for `longsurf run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// BIDS dataset root containing `sub-*/ses-*` directories.
    #[arg(short, long)]
    pub dataset: PathBuf,

    /// Output root (FastSurfer subjects directory).
    #[arg(short, long)]
    pub output: PathBuf,

    /// Configuration file (.json, .yaml or .yml).
    #[arg(short, long, env = "LONGSURF_CONFIG")]
    pub config: PathBuf,

    /// Process only these subjects (comma-separated).
    #[arg(long, value_delimiter = ',', conflicts_with_all = ["pilot", "rerun_from"])]
    pub subjects: Vec<String>,

    /// Process a single random incomplete subject.
    #[arg(long, conflicts_with = "rerun_from")]
    pub pilot: bool,

    /// Seed for pilot selection.
    #[arg(long, requires = "pilot")]
    pub seed: Option<u64>,

    /// Re-run subjects listed in a file (ids or error-log lines).
    #[arg(long)]
    pub rerun_from: Option<PathBuf>,

    /// Subjects to leave out of automatic or pilot selection (comma-separated).
    #[arg(long, value_delimiter = ',')]
    pub skip: Vec<String>,

    /// Maximum number of jobs running at once.
    #[arg(short = 'j', long, default_value = "1")]
    pub batch_size: usize,

    /// Run jobs in the background with per-subject logs.
    #[arg(long)]
    pub detach: bool,

    /// Print planned commands without running anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Stop waiting for detached jobs after this many seconds.
    #[arg(long)]
    pub drain_timeout: Option<u64>,

    /// Print the pass summary as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `longsurf repair`.
#[derive(Parser, Debug)]
pub struct RepairArgs {
    /// Output root to scan.
    pub output_root: PathBuf,

    /// Replace symlinks that point elsewhere (real directories are never touched).
    #[arg(long)]
    pub force: bool,

    /// Show what would change without touching anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Print the summary as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `longsurf status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// BIDS dataset root.
    #[arg(short, long)]
    pub dataset: PathBuf,

    /// Output root.
    #[arg(short, long)]
    pub output: PathBuf,

    /// Configuration file; only the marker file name is used.
    #[arg(short, long, env = "LONGSURF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print the status as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `longsurf errors`.
#[derive(Parser, Debug)]
pub struct ErrorsArgs {
    /// Error log file (JSON lines).
    #[arg(long)]
    pub log: PathBuf,

    /// Print only unique failed subject ids, one per line.
    #[arg(long, conflicts_with = "json")]
    pub subjects_only: bool,

    /// Print records as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_pass_command(args).await,
        Commands::Repair(args) => run_repair_command(args),
        Commands::Status(args) => run_status_command(args),
        Commands::Errors(args) => run_errors_command(args),
    }
}

impl RunArgs {
    fn selection(&self) -> Selection {
        if !self.subjects.is_empty() {
            Selection::Manual(self.subjects.clone())
        } else if let Some(path) = &self.rerun_from {
            Selection::RerunFrom(path.clone())
        } else if self.pilot {
            Selection::Pilot {
                seed: self.seed,
                skip: self.skip.clone(),
            }
        } else {
            Selection::Automatic {
                skip: self.skip.clone(),
            }
        }
    }

    fn mode(&self) -> ExecutionMode {
        if self.detach {
            ExecutionMode::Detached
        } else {
            ExecutionMode::Foreground
        }
    }
}

async fn run_pass_command(args: RunArgs) -> anyhow::Result<()> {
    let config = OrchestratorConfig::load(&args.config)
        .and_then(OrchestratorConfig::with_env_overrides)
        .map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", args.config.display(), e))?;
    config.validate()?;

    if !args.dataset.is_dir() {
        anyhow::bail!("Dataset root does not exist: {}", args.dataset.display());
    }
    if !args.dry_run {
        std::fs::create_dir_all(&args.output).map_err(|e| {
            anyhow::anyhow!(
                "Failed to create output root {}: {}",
                args.output.display(),
                e
            )
        })?;
    }

    let mode = args.mode();
    let cap = if mode == ExecutionMode::Foreground && args.batch_size > 1 {
        warn!(
            batch_size = args.batch_size,
            "--batch-size has no effect without --detach; running one job at a time"
        );
        1
    } else {
        args.batch_size
    };
    let state = BatchState::new(cap)?;

    let interrupt = state.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupt received; finishing running jobs, starting no new ones. Press Ctrl-C again to stop waiting");
        interrupt.shutdown();

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second interrupt; no longer waiting for running jobs");
            interrupt.abandon_drain();
        }
    });

    let options = PassOptions {
        selection: args.selection(),
        mode,
        dry_run: args.dry_run,
        drain_timeout: args.drain_timeout.map(Duration::from_secs),
    };
    let orchestrator = Orchestrator::new(
        Arc::new(config),
        &args.dataset,
        &args.output,
        Arc::new(ProcessRunner::new()),
    );

    let summary = orchestrator.run(&options, &state).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_pass_summary(&summary, &args.output);
    }
    Ok(())
}

fn print_pass_summary(summary: &PassSummary, output_root: &Path) {
    if summary.dry_run {
        println!("Dry run: {} job(s) planned", summary.planned.len());
        for job in &summary.planned {
            println!("\n# {}", job.subject);
            if let Some(log) = &job.log_path {
                println!("# log: {}", log.display());
            }
            println!("{}", job.command);
        }
        println!();
    }

    println!("Pass summary ({}, cap {})", summary.mode, summary.cap);
    println!("  discovered:        {}", summary.discovered);
    println!("  eligible:          {}", summary.eligible);
    println!("  selected:          {}", summary.selected);
    println!("  already complete:  {}", summary.complete_skipped);
    println!("  dispatched:        {}", summary.dispatched);
    println!("  succeeded:         {}", summary.succeeded);
    println!("  failed:            {}", summary.failed);
    if summary.cancelled > 0 {
        println!("  cancelled:         {}", summary.cancelled);
    }
    if summary.dispatched > 0 {
        println!("  peak in flight:    {}", summary.peak_in_flight);
    }

    let failed: Vec<_> = summary.subjects_in(SubjectState::Failed).collect();
    if !failed.is_empty() {
        println!("\nFailed subjects (details in {}):", summary.error_log.display());
        for report in failed {
            println!(
                "  {} (exit {})",
                report.subject,
                report.exit_code.unwrap_or_default()
            );
        }
    }

    if !summary.still_running.is_empty() {
        println!(
            "\nStill running; run `longsurf repair {}` once they finish:",
            output_root.display()
        );
        for job in &summary.still_running {
            match job.pid {
                Some(pid) => println!("  {} (pid {})", job.subject, pid),
                None => println!("  {}", job.subject),
            }
        }
    }
}

fn run_repair_command(args: RepairArgs) -> anyhow::Result<()> {
    let options = LinkOptions {
        force: args.force,
        dry_run: args.dry_run,
    };
    let summary = repair(&args.output_root, options)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_repair_summary(&summary);
    }

    if summary.errors > 0 {
        anyhow::bail!("{} link(s) could not be created", summary.errors);
    }
    Ok(())
}

fn print_repair_summary(summary: &RepairSummary) {
    for report in &summary.templates {
        println!(
            "{}: {} timepoint(s), {} created, {} updated, {} skipped, {} warning(s)",
            report.template,
            report.outcomes.len(),
            report.created(),
            report.updated(),
            report.skipped(),
            report.warnings() + report.errors()
        );
        for outcome in &report.outcomes {
            if matches!(outcome.status, LinkStatus::Warn | LinkStatus::Error) {
                println!("  [{}] {}: {}", outcome.status, outcome.timepoint, outcome.message);
            }
        }
    }
    for orphan in &summary.orphan_timepoints {
        println!("[WARN] {orphan}: no template directory");
    }

    let prefix = if summary.dry_run { "(dry run) " } else { "" };
    println!(
        "\n{}Templates scanned: {}\n{}Links created: {}, updated: {}, skipped: {}, warnings: {}, errors: {}",
        prefix,
        summary.templates_scanned,
        prefix,
        summary.links_created,
        summary.links_updated,
        summary.links_skipped,
        summary.warnings,
        summary.errors
    );
}

fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let marker_file = match &args.config {
        Some(path) => OrchestratorConfig::load(path)?.marker_file,
        None => DEFAULT_MARKER_FILE.to_string(),
    };
    let discovery = SubjectDiscoverer::new(&args.dataset).discover()?;
    let checker = CompletionChecker::new(OutputLayout::new(&args.output), marker_file);
    let completion: Vec<_> = discovery.eligible.iter().map(|s| checker.check(s)).collect();

    if args.json {
        let value = serde_json::json!({
            "eligible": completion,
            "skipped": discovery.skipped.iter().map(|s| serde_json::json!({
                "subject": s.subject.id,
                "reason": s.reason.to_string(),
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    for report in &completion {
        if report.is_complete() {
            println!("{:<24} complete", report.subject);
            continue;
        }
        let missing: Vec<String> = report
            .incomplete()
            .map(|t| match (t.raw_present, t.marker_present) {
                (false, false) => format!("{} (raw, marker)", t.timepoint),
                (false, true) => format!("{} (raw)", t.timepoint),
                _ => format!("{} (marker)", t.timepoint),
            })
            .collect();
        println!("{:<24} incomplete: {}", report.subject, missing.join(", "));
    }
    for skipped in &discovery.skipped {
        println!("{:<24} ineligible: {}", skipped.subject.id, skipped.reason);
    }

    let complete = completion.iter().filter(|c| c.is_complete()).count();
    println!(
        "\n{} eligible, {} complete, {} to process, {} ineligible",
        completion.len(),
        complete,
        completion.len() - complete,
        discovery.skipped.len()
    );
    info!(dataset = %args.dataset.display(), output = %args.output.display(), "Status computed");
    Ok(())
}

fn run_errors_command(args: ErrorsArgs) -> anyhow::Result<()> {
    let records = read_records(&args.log)
        .map_err(|e| anyhow::anyhow!("Failed to read error log {}: {}", args.log.display(), e))?;

    if args.subjects_only {
        for subject in failed_subjects(&records) {
            println!("{subject}");
        }
        return Ok(());
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    for record in &records {
        println!(
            "{}  {:<16} exit {:>3}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.subject,
            record.exit_code
        );
        if let Some(last) = record.log_excerpt.last() {
            println!("    {last}");
        }
    }
    println!(
        "\n{} record(s), {} distinct subject(s)",
        records.len(),
        failed_subjects(&records).len()
    );
    Ok(())
}
