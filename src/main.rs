use anyhow::{Context, Result};
use arcsync::config::Config;
use arcsync::transport::{BlobStore, ObjectStoreBackend};
use arcsync::{Reconciler, RunInput, RunOutput};
use clap::Parser;
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Mirror local directories into a bucket as compressed archives
#[derive(Parser, Debug)]
#[command(name = "arcsync", version, about)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, env = "ARCSYNC_CONFIG")]
    config: PathBuf,

    /// Report what would be uploaded and deleted without changing anything
    #[arg(long)]
    dry_run: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Print one JSON line per target instead of a summary
    #[arg(long)]
    json: bool,

    /// Override the configured concurrency
    #[arg(long)]
    concurrency: Option<usize>,
}

#[derive(Serialize)]
struct TargetReport<'a> {
    target: &'a str,
    prefix: &'a str,
    #[serde(flatten)]
    output: RunOutput,
    dry_run: bool,
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    info!(version = env!("CARGO_PKG_VERSION"), "arcsync");

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency;
        config.validate().context("Invalid --concurrency")?;
    }
    let dry_run = cli.dry_run || config.dry_run;
    if dry_run {
        info!("Dry run is enabled");
    }
    info!(targets = config.targets.len(), "Loaded config");

    let backend: Arc<dyn BlobStore> = Arc::new(
        ObjectStoreBackend::from_config(&config.storage)
            .context("Failed to set up storage backend")?,
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping current run");
            interrupt.cancel();
        }
    });

    for (i, target) in config.targets.iter().enumerate() {
        let target_name = target.path.display().to_string();
        info!(i, target = %target_name, max_depth = target.max_depth, prefix = %target.prefix, "Start");

        let input = RunInput {
            root: target.path.clone(),
            max_depth: target.max_depth,
            prefix: target.prefix.clone(),
            storage_class: config.storage.storage_class.clone(),
            dry_run,
            concurrency: config.concurrency,
            metadata_key: config.metadata_key.clone(),
        };
        let output = Reconciler::new(input, backend.clone())
            .run(cancel.clone())
            .await
            .with_context(|| format!("Run failed for {}", target_name))?;

        if cli.json {
            let report = TargetReport {
                target: &target_name,
                prefix: &target.prefix,
                output,
                dry_run,
            };
            println!("{}", serde_json::to_string(&report)?);
        } else {
            let verb = if dry_run { "would upload" } else { "uploaded" };
            let del_verb = if dry_run { "would delete" } else { "deleted" };
            println!(
                "{} {}: {} {}, {} {}",
                "✓".green(),
                target_name.bold(),
                verb,
                output.uploaded.to_string().cyan(),
                del_verb,
                output.deleted.to_string().yellow(),
            );
        }
    }

    Ok(())
}
