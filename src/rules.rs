use regex::Regex;
use serde::Deserialize;

use crate::error::{Result, TallyError};
use crate::handlers::Handler;
use crate::models::ExtractRecord;

/// A single test against one text field.
#[derive(Debug, Clone)]
pub enum Matcher {
    Exact(String),
    /// Matches when the pattern matches at the start of the field.
    Pattern(Regex),
}

impl Matcher {
    pub fn pattern(source: &str) -> Result<Self> {
        let re = Regex::new(&format!(r"\A(?:{source})"))
            .map_err(|e| TallyError::Config(format!("invalid regex {source:?}: {e}")))?;
        Ok(Self::Pattern(re))
    }

    pub fn matches(&self, field: &str) -> bool {
        match self {
            Self::Exact(s) => s == field,
            Self::Pattern(re) => re.is_match(field),
        }
    }
}

/// Matcher as written in `config.json`: a bare string or `{"regex": "..."}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MatcherSpec {
    Exact(String),
    Regex { regex: String },
}

impl MatcherSpec {
    pub fn compile(&self) -> Result<Matcher> {
        match self {
            Self::Exact(s) => Ok(Matcher::Exact(s.clone())),
            Self::Regex { regex } => Matcher::pattern(regex),
        }
    }
}

/// A field takes one matcher or a list of them. `Many` is tried first so that
/// `["x"]` is never read as a one-field `{"regex": ...}` struct.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MatcherList {
    Many(Vec<MatcherSpec>),
    One(MatcherSpec),
}

impl Default for MatcherList {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl MatcherList {
    pub fn compile(&self) -> Result<Vec<Matcher>> {
        match self {
            Self::Many(specs) => specs.iter().map(MatcherSpec::compile).collect(),
            Self::One(spec) => Ok(vec![spec.compile()?]),
        }
    }
}

/// An empty list accepts anything; otherwise any matcher may accept.
fn field_matches(value: &str, matchers: &[Matcher]) -> bool {
    matchers.is_empty() || matchers.iter().any(|m| m.matches(value))
}

/// Field predicates plus the handler that takes the records they select.
#[derive(Debug)]
pub struct Rule {
    pub name: Vec<Matcher>,
    pub kind: Vec<Matcher>,
    pub message: Vec<Matcher>,
    pub account: Vec<Matcher>,
    pub handler: Box<dyn Handler>,
}

impl Rule {
    pub fn test(&self, record: &ExtractRecord) -> bool {
        field_matches(&record.message, &self.message)
            && field_matches(&record.counterparty_account, &self.account)
            && field_matches(&record.counterparty_name, &self.name)
            && field_matches(&record.description, &self.kind)
    }
}

/// Rules in configured order, with the handler for records none of them take.
#[derive(Debug)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    pub default_handler: Box<dyn Handler>,
}

impl RuleSet {
    /// First matching rule wins.
    pub fn select(&self, record: &ExtractRecord) -> &dyn Handler {
        self.rules
            .iter()
            .find(|r| r.test(record))
            .map(|r| r.handler.as_ref())
            .unwrap_or(self.default_handler.as_ref())
    }
}
