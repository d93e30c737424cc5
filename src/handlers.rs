use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::config::AccountRegistry;
use crate::error::{Result, TallyError};
use crate::models::{
    amount_from_f64, parse_amount, quantize, Amount, Confidence, ExtractField, ExtractRecord,
    FieldOverride, LedgerTransaction, Metadata, Posting, REFERENCE_KEY,
};

pub const DEFAULT_KEY: &str = "default";
pub const UNACCOUNTED: &str = "UnaccountedFunds";
pub const MEMBERSHIP_UNIT: &str = "MEMBERSHIP_MONTH";

/// Raw handler configuration: the filter entry it was declared in.
pub type HandlerOptions = serde_json::Map<String, Value>;

/// What a handler may consult while building an entry.
pub struct HandlerContext<'a> {
    pub accounts: &'a AccountRegistry,
    pub default_handler: &'a dyn Handler,
}

/// Turns one extract record into one balanced ledger transaction.
pub trait Handler: fmt::Debug {
    fn key(&self) -> &'static str;

    fn overrides(&self) -> &[FieldOverride];

    /// Entries from configured rules are trusted more than fallback entries.
    fn confidence(&self) -> Confidence {
        Confidence::Confirmed
    }

    fn source_type(&self, record: &ExtractRecord) -> &'static str {
        if record.amount > Decimal::ZERO {
            "Income"
        } else {
            "Expenses"
        }
    }

    /// Last component of the counter-account.
    fn default_source(&self, record: &ExtractRecord) -> String;

    fn handle(&self, ctx: &HandlerContext<'_>, record: &ExtractRecord) -> Result<LedgerTransaction> {
        standard_transaction(self, ctx, record)
    }
}

/// Two postings moving `record.amount` between the bank account and
/// `{source_type}:{default_source}`. Metadata keeps the unpatched reference.
pub fn standard_transaction<H: Handler + ?Sized>(
    handler: &H,
    ctx: &HandlerContext<'_>,
    record: &ExtractRecord,
) -> Result<LedgerTransaction> {
    let mut meta = Metadata::new();
    meta.insert(REFERENCE_KEY.to_string(), record.reference.clone());

    let txn = record.with_overrides(handler.overrides());
    let account = ctx.accounts.resolve(&txn.account)?;
    let counter = format!("{}:{}", handler.source_type(&txn), handler.default_source(&txn));

    Ok(LedgerTransaction {
        date: txn.booking_date,
        meta,
        flag: handler.confidence(),
        payee: Some(txn.counterparty_name.clone()).filter(|p| !p.is_empty()),
        narration: txn.message.clone(),
        tags: BTreeSet::new(),
        links: BTreeSet::new(),
        postings: vec![
            Posting::new(account, Amount::new(txn.amount, txn.currency.clone())),
            Posting::new(counter, Amount::new(-txn.amount, txn.currency.clone())),
        ],
    })
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

/// Fallback for records no rule claims.
#[derive(Debug, Default)]
pub struct DefaultHandler {
    overrides: Vec<FieldOverride>,
}

impl DefaultHandler {
    pub fn new(overrides: Vec<FieldOverride>) -> Self {
        Self { overrides }
    }
}

impl Handler for DefaultHandler {
    fn key(&self) -> &'static str {
        DEFAULT_KEY
    }

    fn overrides(&self) -> &[FieldOverride] {
        &self.overrides
    }

    fn confidence(&self) -> Confidence {
        Confidence::Provisional
    }

    fn default_source(&self, _record: &ExtractRecord) -> String {
        UNACCOUNTED.to_string()
    }
}

/// Books the counter side on a fixed category.
#[derive(Debug)]
pub struct Categorize {
    category: String,
    overrides: Vec<FieldOverride>,
}

impl Categorize {
    pub fn new(category: &str, overrides: Vec<FieldOverride>) -> Self {
        Self {
            category: category.to_string(),
            overrides,
        }
    }
}

impl Handler for Categorize {
    fn key(&self) -> &'static str {
        "categorize"
    }

    fn overrides(&self) -> &[FieldOverride] {
        &self.overrides
    }

    fn default_source(&self, _record: &ExtractRecord) -> String {
        self.category.clone()
    }
}

/// Monthly membership fees. A payment of exactly the fee also credits the
/// member one month; anything else is left to the fallback handler.
#[derive(Debug)]
pub struct Membership {
    member: String,
    monthly_cost: Decimal,
    overrides: Vec<FieldOverride>,
}

impl Membership {
    pub fn new(member: &str, monthly_cost: Decimal, overrides: Vec<FieldOverride>) -> Self {
        Self {
            member: member.to_string(),
            monthly_cost: quantize(monthly_cost),
            overrides,
        }
    }
}

impl Handler for Membership {
    fn key(&self) -> &'static str {
        "membership"
    }

    fn overrides(&self) -> &[FieldOverride] {
        &self.overrides
    }

    fn default_source(&self, _record: &ExtractRecord) -> String {
        "Membership".to_string()
    }

    fn handle(&self, ctx: &HandlerContext<'_>, record: &ExtractRecord) -> Result<LedgerTransaction> {
        if record.amount != self.monthly_cost {
            return ctx.default_handler.handle(ctx, record);
        }
        let mut txn = standard_transaction(self, ctx, record)?;
        txn.tags.insert("membership".to_string());
        txn.postings.push(Posting::new(
            "Assets:Membership",
            Amount::new(Decimal::ONE, MEMBERSHIP_UNIT),
        ));
        txn.postings.push(Posting::new(
            format!("Liabilities:Members:{}", self.member),
            Amount::new(-Decimal::ONE, MEMBERSHIP_UNIT),
        ));
        Ok(txn)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub type HandlerFactory = fn(&HandlerOptions) -> Result<Box<dyn Handler>>;

/// Handler kinds by the name rules refer to them with.
pub struct HandlerRegistry {
    factories: BTreeMap<&'static str, HandlerFactory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(DEFAULT_KEY, build_default);
        registry.register("categorize", build_categorize);
        registry.register("membership", build_membership);
        registry
    }

    pub fn register(&mut self, key: &'static str, factory: HandlerFactory) {
        self.factories.insert(key, factory);
    }

    /// `None` selects the default handler.
    pub fn build(&self, key: Option<&str>, options: &HandlerOptions) -> Result<Box<dyn Handler>> {
        let key = key.unwrap_or(DEFAULT_KEY);
        let factory = self
            .factories
            .get(key)
            .ok_or_else(|| TallyError::UnknownHandler(key.to_string()))?;
        factory(options)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn handler_options<T: DeserializeOwned>(key: &str, options: &HandlerOptions) -> Result<T> {
    serde_json::from_value(Value::Object(options.clone()))
        .map_err(|e| TallyError::Config(format!("{key} handler: {e}")))
}

/// The optional `replace` object shared by every handler kind.
pub fn parse_overrides(options: &HandlerOptions) -> Result<Vec<FieldOverride>> {
    let Some(replace) = options.get("replace") else {
        return Ok(Vec::new());
    };
    let Value::Object(entries) = replace else {
        return Err(TallyError::Config("`replace` must be an object".to_string()));
    };
    let mut overrides = Vec::new();
    for (name, value) in entries {
        let field: ExtractField = serde_json::from_value(Value::String(name.clone()))
            .map_err(|_| TallyError::Config(format!("unknown field in `replace`: {name}")))?;
        let raw = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            other => {
                return Err(TallyError::Config(format!(
                    "replacement for {name} must be a string or number, got {other}"
                )))
            }
        };
        overrides.push(FieldOverride::new(field, &raw)?);
    }
    Ok(overrides)
}

fn build_default(options: &HandlerOptions) -> Result<Box<dyn Handler>> {
    Ok(Box::new(DefaultHandler::new(parse_overrides(options)?)))
}

#[derive(Deserialize)]
struct CategorizeOptions {
    category: String,
}

fn build_categorize(options: &HandlerOptions) -> Result<Box<dyn Handler>> {
    let opts: CategorizeOptions = handler_options("categorize", options)?;
    Ok(Box::new(Categorize::new(&opts.category, parse_overrides(options)?)))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CostSpec {
    Text(String),
    Number(f64),
}

#[derive(Deserialize)]
struct MembershipOptions {
    member: String,
    #[serde(default)]
    monthly_cost: Option<CostSpec>,
}

fn build_membership(options: &HandlerOptions) -> Result<Box<dyn Handler>> {
    let opts: MembershipOptions = handler_options("membership", options)?;
    let monthly_cost = match opts.monthly_cost {
        None => Decimal::new(2500, 2),
        Some(CostSpec::Text(s)) => parse_amount(&s)
            .ok_or_else(|| TallyError::Config(format!("membership handler: bad monthly_cost {s:?}")))?,
        Some(CostSpec::Number(n)) => amount_from_f64(n)
            .ok_or_else(|| TallyError::Config(format!("membership handler: bad monthly_cost {n}")))?,
    };
    Ok(Box::new(Membership::new(
        &opts.member,
        monthly_cost,
        parse_overrides(options)?,
    )))
}
