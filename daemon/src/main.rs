//! Context Memory Daemon Entry Point
//!
//! Opens the memory store and keeps it consolidated:
//! - Scheduled mode (default): consolidates on an interval until Ctrl-C
//! - One-shot mode (--once): runs a single consolidation pass and exits

mod memory;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::memory::MemoryManager;

#[derive(Parser)]
#[command(name = "context-memory-daemon")]
#[command(about = "Background consolidation for the context memory graph")]
#[command(version)]
struct Args {
    /// Directory holding the RocksDB store
    #[arg(long, short, default_value = ".context-memory")]
    data_dir: PathBuf,

    /// JSON engine configuration; defaults apply when omitted
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Seconds between consolidation runs (overrides the config)
    #[arg(long)]
    interval_secs: Option<u64>,

    /// Run one consolidation pass and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Library `log` records are bridged into tracing by `init`
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "context_memory=info,context_memory_daemon=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut manager = MemoryManager::initialize(&args.data_dir, args.config.as_deref())?;
    tracing::info!("Data directory: {:?}", manager.data_dir());

    if args.once {
        let report = manager.consolidate_once().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        manager.shutdown().await;
        return Ok(());
    }

    manager.start_scheduler(args.interval_secs.map(Duration::from_secs));
    tracing::info!("Starting consolidation scheduler");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    manager.shutdown().await;
    Ok(())
}
