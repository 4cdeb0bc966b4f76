mod catalog;
mod logging;
mod orchestrator;
mod status;
mod summary;
mod worker;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "mrf-scraper")]
#[command(about = "Fleet-wide scraper and normalizer for hospital price-transparency files.")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Regenerate status/summary.csv and status/badge.json from an existing status/ directory.
    Summary(SummaryArgs),
    /// Internal re-exec target for a single hospital; reads a WorkerInput JSON line on stdin and
    /// writes a ScrapeResult JSON line on stdout. Not part of the public CLI surface.
    #[command(hide = true)]
    Worker,
}

#[derive(clap::Args, Debug, Clone)]
struct RunArgs {
    /// Scrape only this two-letter state code.
    #[arg(long)]
    state: Option<String>,
    /// Scrape only this six-character CCN (implies a single hospital).
    #[arg(long)]
    ccn: Option<String>,
    /// Load the catalog and print what would run, without fetching anything.
    #[arg(long, default_value_t = false)]
    validate_only: bool,
    /// Run the full pipeline (fetch, extract, normalize) but write neither output nor status files.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Skip a hospital if its prior output is newer than this many days. 0 disables the skip.
    #[arg(long, default_value_t = 0)]
    max_age_days: u32,
    /// Maximum number of hospital subprocesses to run concurrently.
    #[arg(long, default_value_t = 8)]
    parallel: usize,
    /// Hard per-hospital timeout, in seconds, enforced by the parent regardless of what the
    /// worker is doing.
    #[arg(long, default_value_t = 1200)]
    timeout: u64,
    /// Emit newline-delimited JSON logs instead of human-readable text.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
    /// Raise the default log level from info to debug.
    #[arg(long, default_value_t = false)]
    verbose: bool,
    /// Directory containing dim/urls/<state>.json and dim/CONCEPT.csv.gz.
    #[arg(long, default_value = "dim")]
    dim_dir: PathBuf,
    /// Directory hospital output JSONL files are written under (data/<STATE>/<CCN>.jsonl).
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
    /// Directory per-state status CSVs and the summary artifacts are written under.
    #[arg(long, default_value = "status")]
    status_dir: PathBuf,
}

#[derive(clap::Args, Debug)]
struct SummaryArgs {
    /// Directory containing status/<STATE>.csv files to scan.
    #[arg(long, default_value = "status")]
    status_dir: PathBuf,
    #[arg(long, default_value_t = false)]
    json_logs: bool,
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Worker) => {
            // Logging for the worker subcommand is configured without argument access: the
            // worker protocol only ever cares that logs go to stderr, not about verbosity.
            logging::init(false, false);
            worker::run_worker_from_stdin().await?;
            Ok(())
        }
        Some(Commands::Summary(args)) => {
            logging::init(args.json_logs, args.verbose);
            let summaries = summary::regenerate(&args.status_dir)?;
            tracing::info!(states = summaries.len(), "summary regenerated");
            Ok(())
        }
        None => run(cli.run).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    logging::init(args.json_logs, args.verbose);

    if let Some(ccn) = &args.ccn {
        if ccn.len() != 6 || !ccn.chars().all(|c| c.is_ascii_alphanumeric()) {
            anyhow::bail!("--ccn must be a six-character CCN, got {ccn:?}");
        }
    }

    let records = catalog::load(&args.dim_dir, args.state.as_deref(), args.ccn.as_deref())
        .context("loading catalog")?;

    if records.is_empty() {
        anyhow::bail!(
            "no hospitals matched state={:?} ccn={:?}; check the catalog under {}",
            args.state,
            args.ccn,
            args.dim_dir.display()
        );
    }

    tracing::info!(hospitals = records.len(), "catalog loaded");

    if args.validate_only {
        for record in &records {
            let extractor = mrf_fetch::select_extractor(record);
            println!(
                "{}\t{}\t{}\t{:?}",
                record.ccn, record.state, record.file_url, extractor
            );
        }
        return Ok(());
    }

    let vocab_path = args.dim_dir.join("CONCEPT.csv.gz");
    let config = orchestrator::OrchestratorConfig {
        parallel: args.parallel,
        timeout: Duration::from_secs(args.timeout),
        max_age_days: args.max_age_days,
        dry_run: args.dry_run,
        data_dir: args.data_dir,
        status_dir: args.status_dir,
        vocab_path,
    };

    let outcome = orchestrator::run(records, &config).await?;
    tracing::info!(
        total = outcome.results.len(),
        failures = outcome.results.iter().filter(|r| r.status == mrf_core::ScrapeStatus::Failure).count(),
        "run complete"
    );

    if outcome.any_failure {
        std::process::exit(1);
    }
    Ok(())
}
