use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;

use crate::error::{Result, TallyError};

pub const DEFAULT_CURRENCY: &str = "EUR";

/// Round to cents, half to even, and pin the scale so `25` prints as `25.00`.
pub fn quantize(value: Decimal) -> Decimal {
    let mut q = value.round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven);
    q.rescale(2);
    q
}

/// Spreadsheet cells hold binary floats; take the exact value before rounding.
pub fn amount_from_f64(value: f64) -> Option<Decimal> {
    Decimal::from_f64_retain(value).map(quantize)
}

/// Parse a printed amount. `(12.00)` is negative.
///
/// With both `.` and `,` present the last one is the decimal separator. A
/// separator that repeats, or appears once followed by exactly three digits
/// after a non-zero integer part, is a thousands mark. Otherwise it is the
/// decimal separator.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let s: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '"' | '$' | '€'))
        .collect();
    let (negative, s) = match s.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        Some(inner) => (true, inner.to_string()),
        None => (false, s),
    };
    let normalized = match decimal_separator(&s) {
        Some(pos) => {
            let (int_part, frac_part) = s.split_at(pos);
            let int_part: String = int_part.chars().filter(|c| *c != '.' && *c != ',').collect();
            format!("{int_part}.{}", &frac_part[1..])
        }
        None => s.chars().filter(|c| *c != '.' && *c != ',').collect(),
    };
    let value = Decimal::from_str(&normalized).ok()?;
    Some(quantize(if negative { -value } else { value }))
}

/// Byte position of the decimal separator in `s`, if it has one.
fn decimal_separator(s: &str) -> Option<usize> {
    let pos = s.rfind(['.', ','])?;
    let sep = s[pos..].chars().next()?;
    let mixed = s.contains(if sep == '.' { ',' } else { '.' });
    if mixed {
        return Some(pos);
    }
    if s.matches(sep).count() > 1 {
        return None;
    }
    let frac = &s[pos + 1..];
    let int_digits = s[..pos].trim_start_matches(['-', '+']);
    let grouped = frac.len() == 3
        && frac.chars().all(|c| c.is_ascii_digit())
        && int_digits.chars().any(|c| c.is_ascii_digit() && c != '0');
    if grouped {
        None
    } else {
        Some(pos)
    }
}

// ---------------------------------------------------------------------------
// Extract records
// ---------------------------------------------------------------------------

/// One line of a bank extract.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractRecord {
    pub account: String,
    pub booking_date: NaiveDate,
    pub value_date: NaiveDate,
    pub operation_date: NaiveDate,
    pub reference: String,
    pub description: String,
    pub amount: Decimal,
    pub currency: String,
    pub counterparty_account: String,
    pub counterparty_name: String,
    pub message: String,
}

impl Default for ExtractRecord {
    fn default() -> Self {
        Self {
            account: String::new(),
            booking_date: NaiveDate::default(),
            value_date: NaiveDate::default(),
            operation_date: NaiveDate::default(),
            reference: String::new(),
            description: String::new(),
            amount: quantize(Decimal::ZERO),
            currency: DEFAULT_CURRENCY.to_string(),
            counterparty_account: String::new(),
            counterparty_name: String::new(),
            message: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractField {
    Account,
    BookingDate,
    ValueDate,
    OperationDate,
    Reference,
    Description,
    Amount,
    Currency,
    CounterpartyAccount,
    CounterpartyName,
    Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Date,
    Amount,
}

impl ExtractField {
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::BookingDate | Self::ValueDate | Self::OperationDate => FieldKind::Date,
            Self::Amount => FieldKind::Amount,
            _ => FieldKind::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Date(NaiveDate),
    Amount(Decimal),
}

impl FieldValue {
    /// Parse `raw` according to the kind of `field`.
    pub fn parse(field: ExtractField, raw: &str) -> Option<Self> {
        match field.kind() {
            FieldKind::Text => Some(Self::Text(raw.to_string())),
            FieldKind::Date => parse_date(raw).map(Self::Date),
            FieldKind::Amount => parse_amount(raw).map(Self::Amount),
        }
    }
}

/// Accepts `YYYY-MM-DD` (optionally followed by a time) and `DD/MM/YYYY`.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let head = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
        .ok()
}

/// A configured replacement for one field of an extract record.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldOverride {
    pub field: ExtractField,
    pub value: FieldValue,
}

impl FieldOverride {
    pub fn new(field: ExtractField, raw: &str) -> Result<Self> {
        let value = FieldValue::parse(field, raw).ok_or_else(|| {
            TallyError::Config(format!("invalid replacement for {field:?}: {raw:?}"))
        })?;
        Ok(Self { field, value })
    }
}

impl ExtractRecord {
    fn text_mut(&mut self, field: ExtractField) -> Option<&mut String> {
        match field {
            ExtractField::Account => Some(&mut self.account),
            ExtractField::Reference => Some(&mut self.reference),
            ExtractField::Description => Some(&mut self.description),
            ExtractField::Currency => Some(&mut self.currency),
            ExtractField::CounterpartyAccount => Some(&mut self.counterparty_account),
            ExtractField::CounterpartyName => Some(&mut self.counterparty_name),
            ExtractField::Message => Some(&mut self.message),
            _ => None,
        }
    }

    fn date_mut(&mut self, field: ExtractField) -> Option<&mut NaiveDate> {
        match field {
            ExtractField::BookingDate => Some(&mut self.booking_date),
            ExtractField::ValueDate => Some(&mut self.value_date),
            ExtractField::OperationDate => Some(&mut self.operation_date),
            _ => None,
        }
    }

    /// Store `value` into `field`. A value of the wrong kind leaves the record untouched.
    pub fn set(&mut self, field: ExtractField, value: FieldValue) {
        match value {
            FieldValue::Text(s) => {
                if let Some(slot) = self.text_mut(field) {
                    *slot = s;
                }
            }
            FieldValue::Date(d) => {
                if let Some(slot) = self.date_mut(field) {
                    *slot = d;
                }
            }
            FieldValue::Amount(a) => {
                if field == ExtractField::Amount {
                    self.amount = a;
                }
            }
        }
    }

    /// Copy of this record with `overrides` applied in order.
    pub fn with_overrides(&self, overrides: &[FieldOverride]) -> ExtractRecord {
        let mut patched = self.clone();
        for o in overrides {
            patched.set(o.field, o.value.clone());
        }
        patched
    }
}

// ---------------------------------------------------------------------------
// Ledger transactions
// ---------------------------------------------------------------------------

/// How much trust a generated entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Confidence {
    /// Produced by a configured rule or written by hand.
    Confirmed,
    /// Produced by the fallback handler.
    Provisional,
}

impl Confidence {
    pub fn symbol(&self) -> char {
        match self {
            Self::Confirmed => '!',
            Self::Provisional => '?',
        }
    }

    pub fn from_symbol(symbol: char) -> Self {
        if symbol == '?' {
            Self::Provisional
        } else {
            Self::Confirmed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Amount {
    pub number: Decimal,
    pub currency: String,
}

impl Amount {
    pub fn new(number: Decimal, currency: impl Into<String>) -> Self {
        Self {
            number,
            currency: currency.into(),
        }
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.number, self.currency)
    }
}

pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub struct Posting {
    pub account: String,
    pub units: Amount,
    pub cost: Option<Amount>,
    pub price: Option<Amount>,
    pub meta: Metadata,
}

impl Posting {
    pub fn new(account: impl Into<String>, units: Amount) -> Self {
        Self {
            account: account.into(),
            units,
            cost: None,
            price: None,
            meta: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerTransaction {
    pub date: NaiveDate,
    pub meta: Metadata,
    pub flag: Confidence,
    pub payee: Option<String>,
    pub narration: String,
    pub tags: BTreeSet<String>,
    pub links: BTreeSet<String>,
    pub postings: Vec<Posting>,
}

pub const REFERENCE_KEY: &str = "reference";

impl LedgerTransaction {
    pub fn reference(&self) -> Option<&str> {
        self.meta.get(REFERENCE_KEY).map(String::as_str)
    }

    /// Sum of posting units per currency. Zero everywhere for a balanced entry.
    pub fn residual(&self) -> BTreeMap<String, Decimal> {
        let mut sums: BTreeMap<String, Decimal> = BTreeMap::new();
        for p in &self.postings {
            *sums.entry(p.units.currency.clone()).or_default() += p.units.number;
        }
        sums
    }

    pub fn is_balanced(&self) -> bool {
        self.residual().values().all(|v| v.is_zero())
    }
}
