use chrono::NaiveDate;
use colored::Colorize;

use crate::config::Config;
use crate::error::Result;
use crate::extract::load_extracts;
use crate::handlers::HandlerRegistry;
use crate::ledger::{load_ledger, print_entries, rescan, LedgerIndex};
use crate::output::{partition, write_buckets, OutputSlot, Written};
use crate::reconciler::{reconcile, Orphan};
use crate::repo::Repo;

pub fn run(repo: &Repo, verbose: bool, dry_run: bool) -> Result<()> {
    let today = chrono::Local::now().date_naive();
    import(repo, verbose, dry_run, today).map(|_| ())
}

fn report_orphans(orphans: &[Orphan], verbose: bool) {
    if orphans.is_empty() {
        return;
    }
    let headline = "WARNING: Transactions in ledger not found in extracts".yellow().bold();
    if verbose {
        println!("{headline}");
        for o in orphans {
            println!(" - {} - {} {}", o.date, o.reference, o.narration);
        }
    } else {
        eprintln!("{headline}");
        eprintln!("Pass -v for details");
    }
}

/// Returns the files written, `None` when nothing was written.
fn import(repo: &Repo, verbose: bool, dry_run: bool, today: NaiveDate) -> Result<Option<Written>> {
    repo.require_initialized()?;
    let config = Config::load(&repo.config_path(), &HandlerRegistry::builtin())?;
    let ledger = LedgerIndex::from_entries(load_ledger(&repo.ledger_path())?);
    let extracts = load_extracts(&repo.extracts_dir())?;
    if extracts.is_empty() {
        tracing::warn!("No extract records found in {}", repo.extracts_dir().display());
    }
    if ledger.is_empty() {
        tracing::info!("ledger has no referenced transactions yet");
    }
    tracing::info!(ledger = ledger.len(), extracts = extracts.len(), "reconciling");

    let result = reconcile(&ledger, &extracts, &config)?;
    report_orphans(&result.orphans, verbose);

    if result.nothing_to_do() {
        eprintln!("No new transactions found");
        return Ok(None);
    }
    if result.duplicates > 0 {
        tracing::info!("{} duplicate record(s) skipped", result.duplicates);
    }

    if dry_run {
        let stdout = std::io::stdout();
        print_entries(&mut stdout.lock(), &result.transactions)?;
        return Ok(None);
    }

    let Some(slot) = OutputSlot::allocate(&repo.transactions_dir(), today)? else {
        tracing::error!("Unable to create a new file for the new records");
        return Ok(None);
    };
    let written = write_buckets(&slot, &partition(result.transactions))?;
    rescan(&repo.ledger_path(), &repo.transactions_dir())?;

    println!("TODOs:");
    if let Some(path) = &written.auto {
        println!(" - check {} for accuracy", path.display());
    }
    if let Some(path) = &written.manual {
        println!(" - Fix the items in {}", path.display());
    }
    Ok(Some(written))
}
