//! CLI argument definitions for plexus.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// plexus -- a pluggable service micro-kernel.
#[derive(Parser)]
#[command(
    name = "plexus",
    version,
    about = "plexus -- pluggable service micro-kernel",
    long_about = "Runs a kernel that routes bus messages between components. \
                  The storage engine executes commands against configured backends \
                  and journals every outcome."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the kernel with the storage engine and the console gateway.
    Run {
        /// Path to the TOML configuration file.
        #[arg(long, short, default_value = "config/plexus.toml")]
        config: PathBuf,
    },

    /// Validate the configuration and list the resolved data sources.
    Check {
        /// Path to the TOML configuration file.
        #[arg(long, short, default_value = "config/plexus.toml")]
        config: PathBuf,
    },
}
