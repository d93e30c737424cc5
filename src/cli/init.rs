use crate::config::SAMPLE_CONFIG;
use crate::error::Result;
use crate::ledger::rescan;
use crate::repo::Repo;

pub fn run(repo: &Repo) -> Result<()> {
    std::fs::create_dir_all(repo.extracts_dir())?;
    std::fs::create_dir_all(repo.transactions_dir())?;

    let config = repo.config_path();
    if !config.exists() {
        std::fs::write(&config, SAMPLE_CONFIG)?;
        println!("Wrote sample configuration to {}", config.display());
    }
    rescan(&repo.ledger_path(), &repo.transactions_dir())?;

    println!("Initialized tally at {}", repo.root().display());
    Ok(())
}
