use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pricewatch_sync::{report_daily_markdown, RunMode, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pricewatch")]
#[command(about = "Aggregate retailer catalogs into price and stock history snapshots")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one fetch/resolve/track cycle and commit the data directory.
    Sync {
        /// Reprocess cached raw catalogs instead of fetching.
        #[arg(long)]
        offline: bool,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run cycles on the `SYNC_CRON` schedule until interrupted.
    Watch,
    /// Print a markdown summary of the last committed cycle.
    Report {
        /// Data directory to read; defaults to `PRICEWATCH_DATA_DIR`.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("PRICEWATCH_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "pricewatch=debug,info"
        } else {
            "info"
        })
    });

    let format = env::var("PRICEWATCH_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry.with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr)).init();
        }
        _ => {
            registry.with(fmt::layer().compact().with_writer(std::io::stderr)).init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        offline: false,
        json: false,
    }) {
        Commands::Sync { offline, json } => {
            let mode = if offline { RunMode::Offline } else { RunMode::Online };
            let summary = SyncPipeline::new(config)?.run_once(mode).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary).context("serializing run summary")?);
            } else {
                println!(
                    "sync complete: run_id={} stores={} stale={} failed={} listings={} products={} data={}",
                    summary.run_id,
                    summary.stores,
                    summary.stale_stores.len(),
                    summary.failed_stores.len(),
                    summary.listings,
                    summary.products,
                    summary.data_dir
                );
            }
        }
        Commands::Watch => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let Some(mut scheduler) = pipeline.maybe_build_scheduler().await? else {
                return Ok(());
            };
            scheduler.start().await.context("starting scheduler")?;
            info!(%cron, "watching; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { data_dir } => {
            let dir = data_dir.unwrap_or(config.data_dir);
            println!("{}", report_daily_markdown(&dir)?);
        }
    }

    Ok(())
}
