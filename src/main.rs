//! cloudstripe - Multi-cloud backup
//!
//! Usage:
//!   cloudstripe upload <paths...>          - Back up files
//!   cloudstripe download <ids...> -o DIR   - Restore files
//!   cloudstripe list [--untracked]         - List indexed files
//!   cloudstripe verify <ids...> | --all    - Verify stored copies
//!   cloudstripe recover <ids...> | --all   - Repair damaged copies
//!   cloudstripe scrub                      - Verify and repair until Ctrl-C
//!   cloudstripe health                     - Show backend health

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use cloudstripe::{
    config::Config,
    engine::BackupEngine,
    index::FileId,
    oplog::TracingSink,
    sync::UploadOutcome,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cloudstripe")]
#[command(author = "cloudstripe Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-cloud backup with replication, erasure coding and recovery")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up files
    Upload {
        /// Files to upload
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Restore files into a directory
    Download {
        /// File identities (absolute paths at upload time)
        #[arg(required = true)]
        ids: Vec<String>,

        /// Directory to restore into
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// List indexed files
    List {
        /// List backend objects no indexed file refers to
        #[arg(long)]
        untracked: bool,
    },

    /// Verify stored copies against their checksums
    Verify {
        /// File identities
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        ids: Vec<String>,

        /// Verify every indexed file
        #[arg(long)]
        all: bool,
    },

    /// Repair missing or corrupt copies
    Recover {
        /// File identities
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        ids: Vec<String>,

        /// Recover every file that needs it
        #[arg(long)]
        all: bool,
    },

    /// Verify and recover periodically until interrupted
    Scrub,

    /// Show backend health
    Health,
}

fn main() {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .as_deref()
        .map(expand_tilde)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()));

    let level = match &config {
        Ok(config) => config.logging.level.clone(),
        Err(_) => "info".to_string(),
    };
    let json = config.as_ref().map(|c| c.logging.json).unwrap_or(false);
    init_logging(cli.verbose, &level, json);

    let result = config.and_then(|config| {
        let runtime = tokio::runtime::Runtime::new().context("starting runtime")?;
        runtime.block_on(run_command(cli.command, &config))
    });

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool, level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
        }
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = installed {
        eprintln!("Failed to install log subscriber: {}", e);
    }
}

async fn run_command(command: Commands, config: &Config) -> anyhow::Result<()> {
    let engine = BackupEngine::from_config(config, Arc::new(TracingSink))?;

    let result = match command {
        Commands::Upload { paths } => cmd_upload(&engine, paths).await,
        Commands::Download { ids, output } => cmd_download(&engine, ids, &output).await,
        Commands::List { untracked } => cmd_list(&engine, untracked).await,
        Commands::Verify { ids, all } => cmd_verify(&engine, ids, all).await,
        Commands::Recover { ids, all } => cmd_recover(&engine, ids, all).await,
        Commands::Scrub => cmd_scrub(&engine).await,
        Commands::Health => cmd_health(&engine),
    };

    engine.flush().await?;
    result
}

async fn cmd_upload(engine: &BackupEngine, paths: Vec<PathBuf>) -> anyhow::Result<()> {
    let mut failed = 0;
    for (path, result) in engine.trigger_upload(paths).await {
        match result {
            Ok(report) => {
                let how = match report.outcome {
                    UploadOutcome::Skipped => "unchanged",
                    UploadOutcome::Replicated => "replicated",
                    UploadOutcome::Fragmented => "fragmented",
                };
                println!(
                    "{}: {} ({}/{} stored)",
                    path.display(),
                    how,
                    report.stored,
                    report.required
                );
                if !report.degraded.is_empty() {
                    let names: Vec<&str> = report.degraded.iter().map(|b| b.as_str()).collect();
                    println!("  degraded backends: {}", names.join(", "));
                }
            }
            Err(e) => {
                failed += 1;
                println!("{}: FAILED: {}", path.display(), e);
            }
        }
    }

    if failed > 0 {
        bail!("{} upload(s) failed", failed);
    }
    Ok(())
}

async fn cmd_download(engine: &BackupEngine, ids: Vec<String>, output: &Path) -> anyhow::Result<()> {
    let mut failed = 0;
    for id in ids.into_iter().map(FileId::new) {
        let target = output.join(relative_to_root(id.as_str()));
        match engine.restore(&id, &target).await {
            Ok(size) => println!("{} -> {} ({} bytes)", id, target.display(), size),
            Err(e) => {
                failed += 1;
                println!("{}: FAILED: {}", id, e);
            }
        }
    }

    if failed > 0 {
        bail!("{} download(s) failed", failed);
    }
    Ok(())
}

async fn cmd_list(engine: &BackupEngine, untracked: bool) -> anyhow::Result<()> {
    if untracked {
        let objects = engine.list_untracked().await?;
        if objects.is_empty() {
            println!("No untracked objects.");
        }
        for object in objects {
            println!("{}\t{}", object.backend, object.key);
        }
        return Ok(());
    }

    let files = engine.list_files()?;
    if files.is_empty() {
        println!("No files indexed.");
        return Ok(());
    }
    println!("{:<13} {:<10} {:>12}  IDENTITY", "STATUS", "PRIMARY", "SIZE");
    for file in files {
        println!(
            "{:<13} {:<10} {:>12}  {}{}",
            file.status.to_string(),
            file.primary_backend.as_ref().map(|b| b.as_str()).unwrap_or("-"),
            file.size,
            file.identity,
            if file.fragmented { " [ec]" } else { "" }
        );
    }
    Ok(())
}

async fn cmd_verify(engine: &BackupEngine, ids: Vec<String>, all: bool) -> anyhow::Result<()> {
    if all {
        let summary = engine.verify_all().await?;
        println!(
            "{} files: {} healthy, {} degraded, {} unrecoverable, {} errors",
            summary.files, summary.healthy, summary.degraded, summary.unrecoverable, summary.errors
        );
        return Ok(());
    }

    let mut failed = 0;
    for id in ids.into_iter().map(FileId::new) {
        match engine.verify(&id).await {
            Ok(report) => {
                println!("{}: {} ({}/{} intact)", id, report.status, report.intact, report.checked);
                for (backend, key) in &report.suspect {
                    println!("  suspect: {} on {}", key, backend);
                }
            }
            Err(e) => {
                failed += 1;
                println!("{}: FAILED: {}", id, e);
            }
        }
    }

    if failed > 0 {
        bail!("{} verification(s) failed", failed);
    }
    Ok(())
}

async fn cmd_recover(engine: &BackupEngine, ids: Vec<String>, all: bool) -> anyhow::Result<()> {
    if all {
        let summary = engine.recover_all().await?;
        println!(
            "{} files needed repair: {} recovered, {} partial, {} unrecoverable, {} errors",
            summary.attempted, summary.completed, summary.partial, summary.unrecoverable, summary.errors
        );
        if summary.unrecoverable > 0 {
            bail!("{} file(s) unrecoverable", summary.unrecoverable);
        }
        return Ok(());
    }

    let mut failed = 0;
    for id in ids.into_iter().map(FileId::new) {
        match engine.recover(&id).await {
            Ok(report) if report.writes() == 0 && report.is_complete() => {
                println!("{}: nothing to repair", id)
            }
            Ok(report) => {
                println!(
                    "{}: {} repaired, {} relocated, {} unresolved",
                    id,
                    report.repaired.len(),
                    report.relocated.len(),
                    report.unresolved.len()
                );
                for relocation in &report.relocated {
                    println!("  moved {} from {} to {}", relocation.key, relocation.from, relocation.to);
                }
            }
            Err(e) => {
                failed += 1;
                println!("{}: FAILED: {}", id, e);
            }
        }
    }

    if failed > 0 {
        bail!("{} recovery(ies) failed", failed);
    }
    Ok(())
}

async fn cmd_scrub(engine: &BackupEngine) -> anyhow::Result<()> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, finishing current pass");
            let _ = tx.send(true);
        }
    });

    engine.scrub(rx).await;
    Ok(())
}

fn cmd_health(engine: &BackupEngine) -> anyhow::Result<()> {
    println!(
        "{:<10} {:<9} {:>6} {:>6} {:>8} {:>7}  LAST ERROR",
        "BACKEND", "CIRCUIT", "OPS", "FAILED", "SUSPECT", "ERR%"
    );
    for health in engine.health() {
        println!(
            "{:<10} {:<9} {:>6} {:>6} {:>8} {:>6.1}%  {}",
            health.backend.as_str(),
            format!("{:?}", health.circuit),
            health.total_operations,
            health.failed_operations,
            health.suspect_marks,
            health.error_rate() * 100.0,
            health.last_error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

/// Path of an identity below the restore directory
fn relative_to_root(identity: &str) -> PathBuf {
    Path::new(identity)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
