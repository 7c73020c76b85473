//! CLI entry point for plexus.
//!
//! `plexus run` assembles the kernel with the storage engine and the console
//! gateway and runs until interrupted.  `plexus check` validates the
//! configuration without connecting to anything.

mod cli;
mod config;
mod gateway;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use plexus_kernel::{ComponentBuilder, Kernel, Lifecycle, SignalBus};
use plexus_storage::StorageEngine;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::config::{AppConfig, LogSettings};
use crate::gateway::Console;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => cmd_run(&config).await,
        Commands::Check { config } => cmd_check(&config),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(path: &Path) -> Result<()> {
    let config = AppConfig::load(path)?;
    init_tracing(&config.log);
    info!(node = %config.kernel.name, "starting plexus");

    let bus = SignalBus::new(config.kernel.bus_capacity);

    let storage = StorageEngine::builder(bus.clone(), config.storage.clone())
        .build()
        .await;
    let console = ComponentBuilder::new(
        Console::stdio(bus.clone(), config.storage.reply_route.clone()),
        bus.clone(),
    )
    .build()
    .await;

    let kernel = Arc::new(Kernel::new(bus, [storage, console]));
    info!(components = ?kernel.components().names(), "kernel assembled");

    tokio::select! {
        result = kernel.run() => result.context("kernel loop failed")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("interrupt received, shutting down");
        }
    }

    kernel.kill().await?;
    info!("plexus stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: check
// ---------------------------------------------------------------------------

fn cmd_check(path: &Path) -> Result<()> {
    init_tracing(&LogSettings {
        level: "warn".into(),
        json: false,
    });

    let config = AppConfig::load(path)?;
    let sources = config
        .storage
        .resolve_sources()
        .context("failed to resolve data sources")?;

    println!();
    println!("  plexus configuration: {}", path.display());
    println!("  ====================");
    println!();

    let mut invalid = 0;
    for source in &sources {
        match source.dsn() {
            Ok(_) => println!("  {:<16} {:<12} OK", source.name, source.dialect),
            Err(err) => {
                invalid += 1;
                println!("  {:<16} {:<12} INVALID ({err})", source.name, source.dialect);
            }
        }
    }

    let journal = &config.storage.journal;
    if !sources.iter().any(|s| s.name == journal.source) {
        invalid += 1;
        println!("  journal source `{}` is not configured", journal.source);
    }
    println!();

    if invalid > 0 {
        bail!("{invalid} configuration problem(s) found");
    }
    println!("  {} data source(s) OK", sources.len());
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Install the global subscriber.  Logs go to stderr; stdout carries the
/// console gateway's replies.
fn init_tracing(settings: &LogSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if settings.json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}
