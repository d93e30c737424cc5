use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, TallyError};
use crate::handlers::{HandlerOptions, HandlerRegistry};
use crate::rules::{MatcherList, Rule, RuleSet};

/// Maps the bank's account identifiers to ledger account paths.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct AccountRegistry {
    accounts: BTreeMap<String, String>,
}

impl AccountRegistry {
    pub fn resolve(&self, account_id: &str) -> Result<&str> {
        self.accounts
            .get(account_id)
            .map(String::as_str)
            .ok_or_else(|| TallyError::UnknownAccount(account_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }
}

impl FromIterator<(String, String)> for AccountRegistry {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            accounts: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFilter {
    #[serde(default)]
    name: MatcherList,
    #[serde(default)]
    kind: MatcherList,
    #[serde(default)]
    message: MatcherList,
    #[serde(default)]
    account: MatcherList,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    accounts: AccountRegistry,
    #[serde(default)]
    default: HandlerOptions,
    #[serde(default)]
    filters: Vec<HandlerOptions>,
}

/// Everything `config.json` describes, ready to use.
#[derive(Debug)]
pub struct Config {
    pub accounts: AccountRegistry,
    pub rules: RuleSet,
}

impl Config {
    pub fn load(path: &Path, registry: &HandlerRegistry) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TallyError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&content, registry)
    }

    pub fn parse(content: &str, registry: &HandlerRegistry) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(content)
            .map_err(|e| TallyError::Config(e.to_string()))?;

        let default_handler = registry.build(None, &raw.default)?;

        let mut rules = Vec::with_capacity(raw.filters.len());
        for (i, entry) in raw.filters.iter().enumerate() {
            let filter: RawFilter = serde_json::from_value(Value::Object(entry.clone()))
                .map_err(|e| TallyError::Config(format!("filter #{}: {e}", i + 1)))?;
            let handler_key = match entry.get("handler") {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.as_str()),
                Some(other) => {
                    return Err(TallyError::Config(format!(
                        "filter #{}: handler must be a string, got {other}",
                        i + 1
                    )))
                }
            };
            rules.push(Rule {
                name: filter.name.compile()?,
                kind: filter.kind.compile()?,
                message: filter.message.compile()?,
                account: filter.account.compile()?,
                handler: registry.build(handler_key, entry)?,
            });
        }
        tracing::debug!(rules = rules.len(), accounts = raw.accounts.len(), "configuration loaded");

        Ok(Self {
            accounts: raw.accounts,
            rules: RuleSet {
                rules,
                default_handler,
            },
        })
    }
}

pub const SAMPLE_CONFIG: &str = r#"{
  "accounts": {
    "BE00000000000000": "Assets:Bank:Checking"
  },
  "default": {},
  "filters": [
    {
      "name": "Electricity Company",
      "handler": "categorize",
      "category": "Utilities:Power"
    }
  ]
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractRecord;

    fn parse(content: &str) -> Result<Config> {
        Config::parse(content, &HandlerRegistry::builtin())
    }

    #[test]
    fn test_empty_object_is_valid() {
        let config = parse("{}").unwrap();
        assert!(config.rules.rules.is_empty());
        assert_eq!(config.accounts.len(), 0);
        assert_eq!(config.rules.default_handler.key(), "default");
    }

    #[test]
    fn test_sample_config_parses() {
        let config = parse(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.rules.rules.len(), 1);
        assert_eq!(
            config.accounts.resolve("BE00000000000000").unwrap(),
            "Assets:Bank:Checking"
        );
    }

    #[test]
    fn test_filters_keep_order_and_handlers() {
        let config = parse(
            r#"{
                "filters": [
                    {"name": ["A", {"regex": "B+"}], "handler": "categorize", "category": "One"},
                    {"kind": "Card", "account": ["BE1"], "handler": "membership", "member": "m1"},
                    {"message": {"regex": "^x"}}
                ]
            }"#,
        )
        .unwrap();
        let rules = &config.rules.rules;
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].name.len(), 2);
        assert_eq!(rules[0].handler.key(), "categorize");
        assert_eq!(rules[1].kind.len(), 1);
        assert_eq!(rules[1].handler.key(), "membership");
        assert_eq!(rules[2].handler.key(), "default");
    }

    #[test]
    fn test_rule_selection_through_config() {
        let config = parse(
            r#"{"filters": [{"name": "Shop", "handler": "categorize", "category": "Groceries"}]}"#,
        )
        .unwrap();
        let shop = ExtractRecord {
            counterparty_name: "Shop".into(),
            ..Default::default()
        };
        assert_eq!(config.rules.select(&shop).default_source(&shop), "Groceries");
        let other = ExtractRecord::default();
        assert_eq!(config.rules.select(&other).key(), "default");
    }

    #[test]
    fn test_default_section_carries_replacements() {
        let config = parse(r#"{"default": {"replace": {"message": "check me"}}}"#).unwrap();
        assert_eq!(config.rules.default_handler.overrides().len(), 1);
    }

    #[test]
    fn test_missing_handler_option_fails_at_load() {
        let err = parse(r#"{"filters": [{"handler": "categorize"}]}"#).unwrap_err();
        assert!(matches!(err, TallyError::Config(_)));
    }

    #[test]
    fn test_bad_regex_fails_at_load() {
        let err = parse(r#"{"filters": [{"name": {"regex": "("}}]}"#).unwrap_err();
        assert!(matches!(err, TallyError::Config(_)));
    }

    #[test]
    fn test_unknown_handler_fails_at_load() {
        let err = parse(r#"{"filters": [{"handler": "nope"}]}"#).unwrap_err();
        assert!(matches!(err, TallyError::UnknownHandler(_)));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(parse("{ not json"), Err(TallyError::Config(_))));
        assert!(matches!(parse(r#"{"filters": [{"name": 42}]}"#), Err(TallyError::Config(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("config.json"), &HandlerRegistry::builtin()).unwrap_err();
        assert!(matches!(err, TallyError::Config(_)));
    }
}
