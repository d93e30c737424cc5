use crate::config::Config;
use crate::error::Result;
use crate::handlers::HandlerRegistry;
use crate::ledger::load_ledger;
use crate::repo::Repo;

#[derive(Debug, PartialEq)]
struct Summary {
    rules: usize,
    accounts: usize,
    transactions: usize,
}

fn check(repo: &Repo) -> Result<Summary> {
    let config = Config::load(&repo.config_path(), &HandlerRegistry::builtin())?;
    let ledger = load_ledger(&repo.ledger_path())?;
    Ok(Summary {
        rules: config.rules.rules.len(),
        accounts: config.accounts.len(),
        transactions: ledger.len(),
    })
}

pub fn run(repo: &Repo) -> Result<()> {
    let summary = check(repo)?;
    println!(
        "{} rule(s), {} account(s), {} ledger transaction(s)",
        summary.rules, summary.accounts, summary.transactions
    );
    Ok(())
}
