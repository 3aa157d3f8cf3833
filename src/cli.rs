//! CLI definitions for threadctl.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// threadctl CLI.
#[derive(Parser)]
#[command(name = "threadctl")]
#[command(about = "Cooperative controller runtime demo")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "THREADCTL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the demo controllers (default)
    Run {
        /// Seconds to run; 0 runs until Ctrl-C
        #[arg(long)]
        duration: Option<u64>,

        /// Steps in the scan batch job
        #[arg(long)]
        scan_steps: Option<u64>,
    },

    /// Validate the configuration and print the effective values
    CheckConfig,
}
