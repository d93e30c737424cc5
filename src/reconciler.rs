use std::collections::{BTreeSet, HashSet};

use chrono::NaiveDate;

use crate::config::Config;
use crate::error::Result;
use crate::extract::ExtractSet;
use crate::handlers::HandlerContext;
use crate::ledger::LedgerIndex;
use crate::models::LedgerTransaction;

/// How two reference sets relate.
#[derive(Debug, PartialEq)]
pub struct IdDiff<'a> {
    /// In the extracts only.
    pub new: BTreeSet<&'a str>,
    /// In the ledger only.
    pub orphans: BTreeSet<&'a str>,
    pub matched: BTreeSet<&'a str>,
}

pub fn diff<'a>(ledger_ids: &BTreeSet<&'a str>, extract_ids: &BTreeSet<&'a str>) -> IdDiff<'a> {
    IdDiff {
        new: extract_ids.difference(ledger_ids).copied().collect(),
        orphans: ledger_ids.difference(extract_ids).copied().collect(),
        matched: ledger_ids.intersection(extract_ids).copied().collect(),
    }
}

/// A ledger entry whose reference no extract mentions.
#[derive(Debug, Clone, PartialEq)]
pub struct Orphan {
    pub date: NaiveDate,
    pub reference: String,
    pub narration: String,
}

#[derive(Debug, Default)]
pub struct ReconcileResult {
    pub orphans: Vec<Orphan>,
    pub new_references: usize,
    pub duplicates: usize,
    /// Generated entries, oldest first.
    pub transactions: Vec<LedgerTransaction>,
}

impl ReconcileResult {
    pub fn nothing_to_do(&self) -> bool {
        self.new_references == 0
    }
}

/// Draft a ledger transaction for every extract reference the ledger lacks.
///
/// Records are visited in extract order and the first record carrying a
/// reference is the one classified. The first handler error aborts the run.
pub fn reconcile(ledger: &LedgerIndex, extracts: &ExtractSet, config: &Config) -> Result<ReconcileResult> {
    let ledger_ids = ledger.references();
    let extract_ids = extracts.references();
    let ids = diff(&ledger_ids, &extract_ids);
    tracing::debug!(
        new = ids.new.len(),
        matched = ids.matched.len(),
        orphans = ids.orphans.len(),
        "references compared"
    );

    let orphans = ids
        .orphans
        .iter()
        .filter_map(|r| ledger.get(r))
        .map(|txn| Orphan {
            date: txn.date,
            reference: txn.reference().unwrap_or_default().to_string(),
            narration: txn.narration.clone(),
        })
        .collect::<Vec<_>>();
    if !orphans.is_empty() {
        tracing::debug!("{} ledger transaction(s) not found in extracts", orphans.len());
    }

    let mut result = ReconcileResult {
        orphans,
        new_references: ids.new.len(),
        ..Default::default()
    };
    if ids.new.is_empty() {
        return Ok(result);
    }

    let ctx = HandlerContext {
        accounts: &config.accounts,
        default_handler: config.rules.default_handler.as_ref(),
    };
    let mut processed: HashSet<&str> = HashSet::new();
    for record in extracts.records() {
        let reference = record.reference.as_str();
        if !ids.new.contains(reference) {
            continue;
        }
        if !processed.insert(reference) {
            tracing::debug!("skipping duplicate reference {reference}");
            result.duplicates += 1;
            continue;
        }
        let handler = config.rules.select(record);
        tracing::debug!("{reference}: handled by {}", handler.key());
        let txn = handler.handle(&ctx, record)?;
        if !txn.is_balanced() {
            tracing::warn!("{reference}: generated entry does not balance: {:?}", txn.residual());
        }
        result.transactions.push(txn);
    }

    result.transactions.sort_by_key(|txn| txn.date);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rust_decimal::Decimal;

    use super::*;
    use crate::error::TallyError;
    use crate::handlers::HandlerRegistry;
    use crate::models::{Confidence, ExtractRecord, Metadata, REFERENCE_KEY};

    const CONFIG: &str = r#"{
        "accounts": {"BE01": "Assets:Bank:Checking"},
        "filters": [
            {"name": "nobody", "handler": "categorize", "category": "Never"},
            {"name": "Shop", "handler": "categorize", "category": "Groceries"},
            {"name": "Shop", "handler": "categorize", "category": "Shadowed"},
            {"name": "Jane Doe", "handler": "membership", "member": "JDoe", "monthly_cost": "25.00"}
        ]
    }"#;

    fn config() -> Config {
        Config::parse(CONFIG, &HandlerRegistry::builtin()).unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn record(reference: &str, day: &str, name: &str, amount: &str) -> ExtractRecord {
        ExtractRecord {
            account: "BE01".into(),
            booking_date: date(day),
            reference: reference.into(),
            amount: Decimal::from_str(amount).unwrap(),
            counterparty_name: name.into(),
            message: format!("msg {reference}"),
            ..Default::default()
        }
    }

    fn ledger_entry(reference: &str) -> LedgerTransaction {
        let mut meta = Metadata::new();
        meta.insert(REFERENCE_KEY.to_string(), reference.to_string());
        LedgerTransaction {
            date: date("2024-01-01"),
            meta,
            flag: Confidence::Confirmed,
            payee: None,
            narration: format!("booked {reference}"),
            tags: BTreeSet::new(),
            links: BTreeSet::new(),
            postings: Vec::new(),
        }
    }

    #[test]
    fn test_diff_partitions_union() {
        let universe = ["a", "b", "c", "d"];
        for lmask in 0u32..16 {
            for xmask in 0u32..16 {
                let pick = |mask: u32| -> BTreeSet<&str> {
                    universe.iter().enumerate().filter(|(i, _)| mask & (1 << i) != 0).map(|(_, s)| *s).collect()
                };
                let (l, x) = (pick(lmask), pick(xmask));
                let d = diff(&l, &x);
                assert!(d.new.is_disjoint(&d.orphans));
                assert!(d.new.is_disjoint(&d.matched));
                assert!(d.orphans.is_disjoint(&d.matched));
                let union: BTreeSet<&str> = d.new.iter().chain(&d.orphans).chain(&d.matched).copied().collect();
                let expected: BTreeSet<&str> = l.union(&x).copied().collect();
                assert_eq!(union, expected);
            }
        }
    }

    #[test]
    fn test_scenario_new_and_matched() {
        let ledger = LedgerIndex::from_entries(vec![ledger_entry("A1")]);
        let extracts: ExtractSet = vec![
            record("A1", "2024-01-01", "x", "-1.00"),
            record("B2", "2024-01-02", "x", "-2.00"),
        ]
        .into_iter()
        .collect();
        let result = reconcile(&ledger, &extracts, &config()).unwrap();
        assert!(result.orphans.is_empty());
        assert_eq!(result.new_references, 1);
        assert_eq!(result.transactions.len(), 1);
        let txn = &result.transactions[0];
        assert_eq!(txn.reference(), Some("B2"));
        assert_eq!(txn.flag, Confidence::Provisional);
    }

    #[test]
    fn test_orphans_reported() {
        let ledger = LedgerIndex::from_entries(vec![ledger_entry("GONE"), ledger_entry("A1")]);
        let extracts: ExtractSet = vec![record("A1", "2024-01-01", "x", "-1.00")].into_iter().collect();
        let result = reconcile(&ledger, &extracts, &config()).unwrap();
        assert_eq!(
            result.orphans,
            vec![Orphan {
                date: date("2024-01-01"),
                reference: "GONE".into(),
                narration: "booked GONE".into(),
            }]
        );
        assert!(result.nothing_to_do());
        assert!(result.transactions.is_empty());
    }

    #[test]
    fn test_duplicate_reference_classified_once() {
        let extracts: ExtractSet = vec![
            record("D1", "2024-01-05", "first", "-1.00"),
            record("D1", "2024-01-06", "second", "-9.00"),
        ]
        .into_iter()
        .collect();
        let result = reconcile(&LedgerIndex::default(), &extracts, &config()).unwrap();
        assert_eq!(result.transactions.len(), 1);
        assert_eq!(result.duplicates, 1);
        assert_eq!(result.transactions[0].payee.as_deref(), Some("first"));
    }

    #[test]
    fn test_unreferenced_records_are_ignored() {
        let extracts: ExtractSet = vec![record("", "2024-01-05", "x", "-1.00")].into_iter().collect();
        let result = reconcile(&LedgerIndex::default(), &extracts, &config()).unwrap();
        assert!(result.nothing_to_do());
    }

    #[test]
    fn test_first_matching_rule_handles() {
        let extracts: ExtractSet = vec![record("S1", "2024-01-05", "Shop", "-30.00")].into_iter().collect();
        let result = reconcile(&LedgerIndex::default(), &extracts, &config()).unwrap();
        let txn = &result.transactions[0];
        assert_eq!(txn.flag, Confidence::Confirmed);
        assert_eq!(txn.postings[1].account, "Expenses:Groceries");
    }

    #[test]
    fn test_membership_exact_and_off_by_a_cent() {
        let extracts: ExtractSet = vec![
            record("M1", "2024-01-05", "Jane Doe", "25.00"),
            record("M2", "2024-02-05", "Jane Doe", "25.01"),
        ]
        .into_iter()
        .collect();
        let result = reconcile(&LedgerIndex::default(), &extracts, &config()).unwrap();
        let (exact, off) = (&result.transactions[0], &result.transactions[1]);
        assert_eq!(exact.postings.len(), 4);
        assert!(exact.tags.contains("membership"));
        assert_eq!(off.postings.len(), 2);
        assert!(off.tags.is_empty());
        assert_eq!(off.flag, Confidence::Provisional);
    }

    #[test]
    fn test_every_transaction_balances() {
        let extracts: ExtractSet = vec![
            record("T1", "2024-01-05", "Jane Doe", "25.00"),
            record("T2", "2024-01-06", "Shop", "-17.35"),
            record("T3", "2024-01-07", "someone", "1000.00"),
            record("T4", "2024-01-08", "someone", "0.00"),
        ]
        .into_iter()
        .collect();
        let result = reconcile(&LedgerIndex::default(), &extracts, &config()).unwrap();
        assert_eq!(result.transactions.len(), 4);
        for txn in &result.transactions {
            assert!(txn.is_balanced(), "{txn:?}");
        }
    }

    #[test]
    fn test_sorted_by_date_stably() {
        let extracts: ExtractSet = vec![
            record("M", "2024-01-02", "x", "-1.00"),
            record("Z", "2024-01-01", "first", "-1.00"),
            record("A", "2024-01-01", "second", "-1.00"),
        ]
        .into_iter()
        .collect();
        let result = reconcile(&LedgerIndex::default(), &extracts, &config()).unwrap();
        let order: Vec<&str> = result.transactions.iter().filter_map(|t| t.reference()).collect();
        assert_eq!(order, vec!["Z", "A", "M"]);
    }

    #[test]
    fn test_unknown_account_aborts_run() {
        let mut bad = record("X2", "2024-01-02", "x", "-1.00");
        bad.account = "UNKNOWN".into();
        let extracts: ExtractSet = vec![record("X1", "2024-01-01", "x", "-1.00"), bad].into_iter().collect();
        let err = reconcile(&LedgerIndex::default(), &extracts, &config()).unwrap_err();
        assert!(matches!(err, TallyError::UnknownAccount(_)));
    }
}
