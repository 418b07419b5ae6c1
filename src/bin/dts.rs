use std::fs;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, WrapErr};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use dts::backend::SearchParameters;
use dts::config::ConfigLoader;
use dts::domain::{Specification, StatusCode, TransferId};
use dts::engine::Engine;
use dts::error::DtsError;
use dts::output::{JsonOutput, RunReport, SnapshotSummary, StatusEvent};

#[derive(Parser)]
#[command(name = "dts")]
#[command(about = "Orchestrates staged file transfers between data repositories")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Submit a transfer specification and follow it to completion")]
    Run(RunArgs),
    #[command(about = "Search a configured repository for files")]
    Search(SearchArgs),
    #[command(about = "Summarize the saved snapshot of this instance")]
    Snapshot(SnapshotArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Path to a JSON transfer specification.
    spec: String,

    #[arg(long)]
    config: Option<String>,

    /// Cancel the transfer if it has not finished after this many seconds.
    #[arg(long, default_value_t = 600)]
    timeout: u64,
}

#[derive(Args)]
struct SearchArgs {
    repository: String,
    query: String,

    #[arg(long)]
    config: Option<String>,

    #[arg(long, default_value_t = 0)]
    offset: usize,

    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Args)]
struct SnapshotArgs {
    #[arg(long)]
    config: Option<String>,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<DtsError>() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &DtsError) -> u8 {
    match error {
        err if err.is_validation() => 2,
        DtsError::MissingConfig => 2,
        DtsError::Staging(_)
        | DtsError::Transport(_)
        | DtsError::Extraction(_)
        | DtsError::Manifest(_)
        | DtsError::AdapterState { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_transfer(args),
        Commands::Search(args) => run_search(args).map(|()| ExitCode::SUCCESS),
        Commands::Snapshot(args) => run_snapshot(args).map(|()| ExitCode::SUCCESS),
    }
}

fn run_transfer(args: RunArgs) -> miette::Result<ExitCode> {
    let resolved = ConfigLoader::resolve(args.config.as_deref())?;
    let registry = resolved.simulation.build_registry()?;

    let content = fs::read_to_string(&args.spec)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read specification {}", args.spec))?;
    let spec: Specification = serde_json::from_str(&content)
        .into_diagnostic()
        .wrap_err("failed to parse specification")?;

    let mut engine = Engine::new(resolved.engine, registry);
    engine.start()?;
    let followed = follow(&engine, spec, Duration::from_secs(args.timeout));
    let stopped = engine.stop();
    let report = followed?;
    stopped?;

    JsonOutput::print_run(&report).into_diagnostic()?;
    if report.status.code == StatusCode::Failed {
        return Ok(ExitCode::from(3));
    }
    Ok(ExitCode::SUCCESS)
}

/// Submits `spec` and prints every status change until the transfer ends.
fn follow(engine: &Engine, spec: Specification, timeout: Duration) -> miette::Result<RunReport> {
    let id: TransferId = engine.create(spec)?;
    let deadline = Instant::now() + timeout;
    let interval = engine.config().poll_interval.min(Duration::from_millis(250));
    let mut last = None;
    let mut cancel_sent = false;

    loop {
        let status = engine.status(id)?;
        if last.as_ref() != Some(&status) {
            JsonOutput::print_event(&StatusEvent {
                transfer_id: id,
                at: Utc::now(),
                status: status.clone(),
            })
            .into_diagnostic()?;
            last = Some(status.clone());
        }
        if status.code.is_terminal() {
            break;
        }
        if !cancel_sent && Instant::now() >= deadline {
            warn!(transfer_id = %id, "timed out, cancelling");
            engine.cancel(id)?;
            cancel_sent = true;
        }
        thread::sleep(interval);
    }

    let transfer = engine.transfer(id)?;
    Ok(RunReport::from_transfer(&transfer))
}

fn run_search(args: SearchArgs) -> miette::Result<()> {
    let resolved = ConfigLoader::resolve(args.config.as_deref())?;
    let registry = resolved.simulation.build_registry()?;
    let params = SearchParameters {
        query: args.query,
        offset: args.offset,
        limit: args.limit,
    };
    let results = registry.search(&args.repository, &params)?;
    JsonOutput::print_search(&results).into_diagnostic()?;
    Ok(())
}

fn run_snapshot(args: SnapshotArgs) -> miette::Result<()> {
    let resolved = ConfigLoader::resolve(args.config.as_deref())?;
    let store = resolved.engine.snapshot_store();
    let Some(snapshot) = store.load()? else {
        return Err(miette::Report::msg(format!(
            "no snapshot at {}",
            store.path()
        )));
    };
    let summary = SnapshotSummary::new(store.path().to_path_buf(), &snapshot);
    JsonOutput::print_snapshot(&summary).into_diagnostic()?;
    Ok(())
}
