mod cli;
mod config;
mod error;
mod extract;
mod handlers;
mod ledger;
mod logging;
mod models;
mod output;
mod reconciler;
mod repo;
mod rules;

use clap::Parser;

use cli::{Cli, Commands};
use repo::Repo;

fn main() {
    let cli = Cli::parse();
    logging::init_tracing(cli.debug);

    let result = Repo::resolve(cli.repo.as_deref()).and_then(|repo| match cli.command {
        Commands::Init => cli::init::run(&repo),
        Commands::Import { verbose, dry_run } => cli::import::run(&repo, verbose, dry_run),
        Commands::Validate => cli::validate::run(&repo),
    });

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
