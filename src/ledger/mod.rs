pub mod parser;
pub mod printer;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::{Result, TallyError};
use crate::models::LedgerTransaction;

pub use printer::print_entries;

/// Load every transaction reachable from `path`. Any parse error fails the
/// whole load after all errors have been reported.
pub fn load_ledger(path: &Path) -> Result<Vec<LedgerTransaction>> {
    let (entries, errors) = parser::load(path);
    if !errors.is_empty() {
        for e in &errors {
            tracing::error!("{e}");
        }
        return Err(TallyError::LedgerLoad { count: errors.len() });
    }
    tracing::info!(file = %path.display(), transactions = entries.len(), "ledger loaded");
    Ok(entries)
}

/// Ledger transactions by their `reference` metadata. A later entry with the
/// same reference replaces an earlier one.
#[derive(Debug, Default)]
pub struct LedgerIndex {
    by_reference: BTreeMap<String, LedgerTransaction>,
}

impl LedgerIndex {
    pub fn from_entries(entries: impl IntoIterator<Item = LedgerTransaction>) -> Self {
        let mut by_reference = BTreeMap::new();
        for txn in entries {
            if let Some(reference) = txn.reference() {
                by_reference.insert(reference.to_string(), txn);
            }
        }
        Self { by_reference }
    }

    pub fn references(&self) -> BTreeSet<&str> {
        self.by_reference.keys().map(String::as_str).collect()
    }

    pub fn get(&self, reference: &str) -> Option<&LedgerTransaction> {
        self.by_reference.get(reference)
    }

    pub fn len(&self) -> usize {
        self.by_reference.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_reference.is_empty()
    }
}

/// Rewrite the ledger index file so it includes every file in
/// `transactions_dir`, in name order.
pub fn rescan(ledger_path: &Path, transactions_dir: &Path) -> Result<()> {
    let dir_name = transactions_dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TallyError::Other(format!("bad directory: {}", transactions_dir.display())))?;
    let mut names: Vec<String> = std::fs::read_dir(transactions_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();

    let mut content = String::new();
    for name in &names {
        content.push_str(&format!("include \"{dir_name}/{name}\"\n"));
    }
    std::fs::write(ledger_path, content)?;
    tracing::debug!(files = names.len(), "ledger index rewritten");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::NaiveDate;

    use super::*;
    use crate::models::{Confidence, Metadata, REFERENCE_KEY};

    fn txn(reference: Option<&str>, narration: &str) -> LedgerTransaction {
        let mut meta = Metadata::new();
        if let Some(r) = reference {
            meta.insert(REFERENCE_KEY.to_string(), r.to_string());
        }
        LedgerTransaction {
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            meta,
            flag: Confidence::Confirmed,
            payee: None,
            narration: narration.to_string(),
            tags: BTreeSet::new(),
            links: BTreeSet::new(),
            postings: Vec::new(),
        }
    }

    #[test]
    fn test_index_skips_unreferenced_and_last_wins() {
        let index = LedgerIndex::from_entries(vec![
            txn(Some("A1"), "first"),
            txn(None, "opening balance"),
            txn(Some("A1"), "second"),
            txn(Some("B2"), "other"),
        ]);
        assert_eq!(index.len(), 2);
        assert_eq!(index.get("A1").unwrap().narration, "second");
        assert_eq!(index.references(), BTreeSet::from(["A1", "B2"]));
    }

    #[test]
    fn test_rescan_includes_sorted_files() {
        let dir = tempfile::tempdir().unwrap();
        let txns = dir.path().join("transactions");
        std::fs::create_dir(&txns).unwrap();
        std::fs::write(txns.join("2024-02-01_001_auto.beancount"), "").unwrap();
        std::fs::write(txns.join("2024-01-01_001_manual.beancount"), "").unwrap();
        std::fs::create_dir(txns.join("archive")).unwrap();
        let ledger = dir.path().join("ledger.beancount");
        rescan(&ledger, &txns).unwrap();
        let content = std::fs::read_to_string(&ledger).unwrap();
        assert_eq!(
            content,
            "include \"transactions/2024-01-01_001_manual.beancount\"\n\
             include \"transactions/2024-02-01_001_auto.beancount\"\n"
        );
    }

    #[test]
    fn test_load_ledger_fails_on_errors() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.beancount");
        std::fs::write(&ledger, "garbage\n").unwrap();
        let err = load_ledger(&ledger).unwrap_err();
        assert!(matches!(err, TallyError::LedgerLoad { count: 1 }));
    }

    #[test]
    fn test_load_ledger_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.beancount");
        std::fs::write(&ledger, "").unwrap();
        assert!(load_ledger(&ledger).unwrap().is_empty());
    }
}
