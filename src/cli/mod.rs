pub mod import;
pub mod init;
pub mod validate;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tally", about = "Reconcile bank extracts against a beancount ledger.")]
pub struct Cli {
    /// More diagnostics on stderr (-d info, -dd debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub debug: u8,

    /// Working directory (default: current directory)
    #[arg(short, long, global = true)]
    pub repo: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the directory layout, ledger index and a sample config.
    Init,
    /// Draft ledger entries for extract transactions the ledger lacks.
    Import {
        /// List orphaned ledger transactions
        #[arg(short, long)]
        verbose: bool,
        /// Print the new entries instead of writing them
        #[arg(short = 'n', long)]
        dry_run: bool,
    },
    /// Check that the configuration and ledger load.
    Validate,
}
