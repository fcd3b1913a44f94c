use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "dcsync", about = "Distributed cloud identity synchronization engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the sync engine daemon.
    Run {
        /// Path to the engine configuration file.
        #[arg(long, default_value = "/etc/dcsync/dcsync.yml")]
        config: PathBuf,
        /// Path to the local bookkeeping database.
        #[arg(long, default_value = "/var/lib/dcsync/state.redb")]
        store_path: PathBuf,
    },
    /// Check a configuration file and print the effective settings.
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
}
