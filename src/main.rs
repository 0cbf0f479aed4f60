use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use cloudmig::config::{AppConfig, DEFAULT_CONFIG_PATH};
use cloudmig::context::{MigrationContext, watch_interrupts};
use cloudmig::core::{Orchestrator, ProgressStore, RunReport, TransferState};
use cloudmig::{adapters, logging};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Exit code when the operator interrupts twice; no report is written.
const FORCED_EXIT_CODE: i32 = 130;

#[derive(Parser)]
#[command(name = "cloudmig")]
#[command(about = "Resumable, verified migration of a file tree between storage accounts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file; missing is fine if everything comes from env or flags
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate, resuming from the progress file if one exists
    Run(RunArgs),
    /// Show the counts recorded in the progress file
    Status,
    /// Put Failed records back to Pending so the next run retries them
    Reset {
        /// Also reset records whose last verification mismatched
        #[arg(long)]
        include_mismatched: bool,
    },
    /// Write a configuration file with every default filled in
    InitConfig { path: PathBuf },
}

#[derive(Args, Serialize)]
struct RunArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    source_account: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    destination_account: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    source_root: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    destination_root: Option<String>,

    /// Path prefix to skip; may be repeated
    #[serde(rename = "excluded_paths", skip_serializing_if = "Vec::is_empty")]
    #[arg(long = "exclude")]
    exclude: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    batch_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    retry_attempts: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    retry_budget: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verify_after_transfer: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    progress_file: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    report_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    staging_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run(args) => {
            let config = AppConfig::new(&cli.config, Some(args))?;
            init_logging(&config)?;
            let report = run_migration(config).await?;
            std::process::exit(report.exit_code());
        }
        Commands::Status => {
            let config = AppConfig::load_unchecked(&cli.config, None::<&RunArgs>)?;
            init_logging(&config)?;
            run_status(&config).await.context("Failed to read progress")?
        }
        Commands::Reset { include_mismatched } => {
            let config = AppConfig::load_unchecked(&cli.config, None::<&RunArgs>)?;
            init_logging(&config)?;
            run_reset(&config, *include_mismatched)
                .await
                .context("Failed to reset progress")?
        }
        Commands::InitConfig { path } => run_init_config(path)?,
    }

    Ok(())
}

fn init_logging(config: &AppConfig) -> Result<()> {
    logging::init(logging::LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
        file: config.log_file.clone(),
    })
    .context("Failed to initialize logging")
}

async fn run_migration(config: AppConfig) -> Result<RunReport> {
    let ctx = MigrationContext::new(config);

    let token = ctx.cancel.clone();
    tokio::spawn(async move {
        if watch_interrupts(token, tokio::signal::ctrl_c).await {
            std::process::exit(FORCED_EXIT_CODE);
        }
    });

    let source = adapters::get_client(&ctx.config.source_account);
    let destination = adapters::get_client(&ctx.config.destination_account);

    let mut orchestrator = Orchestrator::new(ctx, source, destination)
        .await
        .context("Failed to prepare migration")?;
    let report = orchestrator.run().await;

    println!("Migration {:?}: {}", report.outcome, report.summary);
    println!(
        "Transferred this run: {} files, {} bytes",
        report.files_transferred, report.bytes_transferred
    );
    for folder in &report.skipped_folders {
        println!("Skipped unreadable folder: {}", folder);
    }
    if let Some(path) = &report.report_path {
        println!("Report: {}", path.display());
    }

    Ok(report)
}

async fn run_status(config: &AppConfig) -> Result<()> {
    let store = ProgressStore::open(config.progress_file.clone()).await?;
    if store.is_empty() {
        println!("No progress recorded at {}", config.progress_file.display());
        return Ok(());
    }

    println!("{}", store.snapshot());

    for record in store.records() {
        if record.state == TransferState::Failed {
            println!(
                "  failed     {} ({} attempts): {}",
                record.path,
                record.attempts,
                record.last_error.as_deref().unwrap_or("unknown error")
            );
        } else if let Some(reason) = &record.mismatch {
            println!("  mismatched {}: {}", record.path, reason);
        }
    }

    Ok(())
}

async fn run_reset(config: &AppConfig, include_mismatched: bool) -> Result<()> {
    let mut store = ProgressStore::open(config.progress_file.clone()).await?;
    let count = store.reset(include_mismatched).await?;
    println!("{} records reset to Pending", count);
    Ok(())
}

fn run_init_config(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists, refusing to overwrite", path.display());
    }
    AppConfig::default().write_toml(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}
