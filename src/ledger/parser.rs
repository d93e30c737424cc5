use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::models::{Amount, Confidence, LedgerTransaction, Metadata, Posting};

const FLAGS: &str = "*!?&#%PSTCURM";

#[derive(Debug, Clone, PartialEq)]
pub struct LoadError {
    pub file: PathBuf,
    pub line: usize,
    pub message: String,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.file.display(), self.line, self.message)
    }
}

/// Read a ledger file and everything it includes.
///
/// Understands the subset this tool writes plus what hand-kept ledgers
/// commonly contain: transactions with metadata, tags, links and postings
/// (one elided amount is interpolated), `include`, `option` and `plugin`.
/// Other dated directives are skipped together with their indented bodies.
pub fn load(path: &Path) -> (Vec<LedgerTransaction>, Vec<LoadError>) {
    let mut loader = Loader::default();
    loader.load_file(path);
    (loader.entries, loader.errors)
}

/// Parse ledger text that has no includes to resolve.
#[cfg(test)]
pub fn parse_str(content: &str, origin: &Path) -> (Vec<LedgerTransaction>, Vec<LoadError>) {
    let mut loader = Loader::default();
    loader.parse(content, origin);
    (loader.entries, loader.errors)
}

#[derive(Default)]
struct Loader {
    visited: HashSet<PathBuf>,
    entries: Vec<LedgerTransaction>,
    errors: Vec<LoadError>,
}

struct Pending {
    txn: LedgerTransaction,
    line: usize,
    elided: Option<usize>,
    in_posting: bool,
    broken: bool,
}

impl Loader {
    fn error(&mut self, file: &Path, line: usize, message: impl Into<String>) {
        self.errors.push(LoadError {
            file: file.to_path_buf(),
            line,
            message: message.into(),
        });
    }

    fn load_file(&mut self, path: &Path) {
        let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        if !self.visited.insert(key) {
            tracing::debug!(file = %path.display(), "already included, skipping");
            return;
        }
        match std::fs::read_to_string(path) {
            Ok(content) => self.parse(&content, path),
            Err(e) => self.error(path, 0, format!("cannot read file: {e}")),
        }
    }

    fn parse(&mut self, content: &str, file: &Path) {
        let mut pending: Option<Pending> = None;
        let mut skipping = false;

        for (idx, raw) in content.lines().enumerate() {
            let lineno = idx + 1;
            let line = strip_comment(raw);
            if line.trim().is_empty() {
                if raw.trim_start().starts_with(';') {
                    continue;
                }
                self.finish(pending.take(), file);
                skipping = false;
                continue;
            }

            if line.starts_with([' ', '\t']) {
                if skipping {
                    continue;
                }
                match pending.as_mut() {
                    Some(p) => {
                        if let Err(msg) = body_line(p, line.trim()) {
                            p.broken = true;
                            self.error(file, lineno, msg);
                        }
                    }
                    None => self.error(file, lineno, "indented line outside of an entry"),
                }
                continue;
            }

            self.finish(pending.take(), file);
            skipping = false;
            let line = line.trim_end();

            if let Some(rest) = line.strip_prefix("include") {
                match tokenize(rest).as_deref() {
                    Ok([Token::Str(target)]) => {
                        let base = file.parent().unwrap_or_else(|| Path::new("."));
                        self.load_file(&base.join(target));
                    }
                    _ => self.error(file, lineno, "include expects one quoted path"),
                }
                continue;
            }
            if ["option", "plugin", "pushtag", "poptag"]
                .iter()
                .any(|kw| line.starts_with(kw))
            {
                continue;
            }

            let Some(date) = line.get(..10).and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            else {
                self.error(file, lineno, format!("unrecognized line: {line}"));
                continue;
            };
            let rest = line[10..].trim_start();
            let (keyword, header) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            let flag = match keyword {
                "txn" => Some('*'),
                k if k.chars().count() == 1 && FLAGS.contains(k) => k.chars().next(),
                _ => None,
            };
            let Some(flag) = flag else {
                // open, close, balance, price, note, ...
                skipping = true;
                continue;
            };
            match parse_header(date, flag, header) {
                Ok(txn) => {
                    pending = Some(Pending {
                        txn,
                        line: lineno,
                        elided: None,
                        in_posting: false,
                        broken: false,
                    })
                }
                Err(msg) => {
                    self.error(file, lineno, msg);
                    skipping = true;
                }
            }
        }
        self.finish(pending, file);
    }

    fn finish(&mut self, pending: Option<Pending>, file: &Path) {
        let Some(mut p) = pending else {
            return;
        };
        if p.broken {
            return;
        }
        if let Some(idx) = p.elided {
            let residual = p.txn.residual();
            let mut open = residual.into_iter().filter(|(_, v)| !v.is_zero());
            match (open.next(), open.next()) {
                (Some((currency, sum)), None) => p.txn.postings[idx].units = Amount::new(-sum, currency),
                (None, _) => {
                    self.error(file, p.line, "cannot interpolate elided amount: nothing to balance");
                    return;
                }
                (Some(_), Some(_)) => {
                    self.error(file, p.line, "cannot interpolate elided amount across currencies");
                    return;
                }
            }
        }
        self.entries.push(p.txn);
    }
}

fn parse_header(date: NaiveDate, flag: char, header: &str) -> Result<LedgerTransaction, String> {
    let mut strings = Vec::new();
    let mut tags = BTreeSet::new();
    let mut links = BTreeSet::new();
    for token in tokenize(header)? {
        match token {
            Token::Str(s) => strings.push(s),
            Token::Word(w) => add_tag_or_link(&w, &mut tags, &mut links)?,
        }
    }
    let (payee, narration) = match strings.len() {
        0 => (None, String::new()),
        1 => (None, strings.remove(0)),
        2 => {
            let narration = strings.remove(1);
            (Some(strings.remove(0)), narration)
        }
        n => return Err(format!("too many strings in transaction header ({n})")),
    };
    Ok(LedgerTransaction {
        date,
        meta: Metadata::new(),
        flag: Confidence::from_symbol(flag),
        payee,
        narration,
        tags,
        links,
        postings: Vec::new(),
    })
}

fn add_tag_or_link(word: &str, tags: &mut BTreeSet<String>, links: &mut BTreeSet<String>) -> Result<(), String> {
    if let Some(tag) = word.strip_prefix('#') {
        tags.insert(tag.to_string());
    } else if let Some(link) = word.strip_prefix('^') {
        links.insert(link.to_string());
    } else {
        return Err(format!("unexpected token: {word}"));
    }
    Ok(())
}

fn body_line(p: &mut Pending, line: &str) -> Result<(), String> {
    if let Some((key, value)) = split_meta(line) {
        let value = meta_value(value)?;
        match (p.in_posting, p.txn.postings.last_mut()) {
            (true, Some(posting)) => posting.meta.insert(key.to_string(), value),
            _ => p.txn.meta.insert(key.to_string(), value),
        };
        return Ok(());
    }
    if line.starts_with(['#', '^']) {
        for token in tokenize(line)? {
            match token {
                Token::Word(w) => add_tag_or_link(&w, &mut p.txn.tags, &mut p.txn.links)?,
                Token::Str(s) => return Err(format!("unexpected string: {s:?}")),
            }
        }
        return Ok(());
    }

    let (posting, elided) = parse_posting(line)?;
    if elided {
        if p.elided.is_some() {
            return Err("more than one posting without amount".to_string());
        }
        p.elided = Some(p.txn.postings.len());
    }
    p.txn.postings.push(posting);
    p.in_posting = true;
    Ok(())
}

/// `key: value` where the key starts with a lowercase letter.
fn split_meta(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    let mut chars = key.chars();
    let first = chars.next()?;
    if first.is_ascii_lowercase() && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        Some((key, value.trim()))
    } else {
        None
    }
}

fn meta_value(value: &str) -> Result<String, String> {
    if value.starts_with('"') {
        match tokenize(value)?.as_slice() {
            [Token::Str(s)] => Ok(s.clone()),
            _ => Err(format!("bad metadata value: {value}")),
        }
    } else {
        Ok(value.to_string())
    }
}

fn parse_posting(line: &str) -> Result<(Posting, bool), String> {
    let mut line = line;
    if let Some((flag, rest)) = line.split_once(' ') {
        if flag.chars().count() == 1 && FLAGS.contains(flag) {
            line = rest.trim_start();
        }
    }
    let (account, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    if !account.contains(':') || !account.starts_with(|c: char| c.is_ascii_uppercase()) {
        return Err(format!("invalid account: {account}"));
    }
    let rest = rest.trim();
    if rest.is_empty() {
        let posting = Posting::new(account, Amount::new(Decimal::ZERO, ""));
        return Ok((posting, true));
    }

    let (rest, price) = match rest.split_once('@') {
        Some((head, tail)) => {
            let tail = tail.trim_start_matches('@');
            (head.trim(), Some(parse_amount_tokens(tail)?))
        }
        None => (rest, None),
    };
    let (units_part, cost) = match rest.split_once('{') {
        Some((head, tail)) => {
            let inner = tail
                .strip_suffix('}')
                .or_else(|| tail.trim_end().strip_suffix('}'))
                .ok_or_else(|| format!("unclosed cost in: {line}"))?;
            let cost = if inner.trim().is_empty() {
                None
            } else {
                Some(parse_amount_tokens(inner)?)
            };
            (head.trim(), cost)
        }
        None => (rest, None),
    };
    let mut posting = Posting::new(account, parse_amount_tokens(units_part)?);
    posting.cost = cost;
    posting.price = price;
    Ok((posting, false))
}

fn parse_amount_tokens(text: &str) -> Result<Amount, String> {
    let mut parts = text.split_whitespace();
    let (Some(number), Some(currency), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("expected `NUMBER CURRENCY`, got: {}", text.trim()));
    };
    let number = Decimal::from_str(&number.replace(',', ""))
        .map_err(|e| format!("invalid number {number}: {e}"))?;
    Ok(Amount::new(number, currency))
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            ';' if !in_string => return &line[..i],
            _ => {}
        }
    }
    line
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Word(String),
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut s = String::new();
            loop {
                match chars.next() {
                    Some('\\') => match chars.next() {
                        Some('n') => s.push('\n'),
                        Some(other) => s.push(other),
                        None => return Err("unterminated string".to_string()),
                    },
                    Some('"') => break,
                    Some(other) => s.push(other),
                    None => return Err("unterminated string".to_string()),
                }
            }
            tokens.push(Token::Str(s));
        } else {
            let mut w = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                w.push(c);
                chars.next();
            }
            tokens.push(Token::Word(w));
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> (Vec<LedgerTransaction>, Vec<LoadError>) {
        parse_str(content, Path::new("test.beancount"))
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_parse_full_transaction() {
        let (entries, errors) = parse(
            r#"
option "operating_currency" "EUR"
2024-01-01 open Assets:Bank:Checking EUR

2024-01-15 ! "Jane Doe" "January fee" #membership ^inv-1
  reference: "REF-1"
  Assets:Bank:Checking  25.00 EUR ; paid
    note: "bank side"
  Income:Membership    -25.00 EUR
"#,
        );
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(entries.len(), 1);
        let txn = &entries[0];
        assert_eq!(txn.date, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        assert_eq!(txn.flag, Confidence::Confirmed);
        assert_eq!(txn.payee.as_deref(), Some("Jane Doe"));
        assert_eq!(txn.narration, "January fee");
        assert!(txn.tags.contains("membership"));
        assert!(txn.links.contains("inv-1"));
        assert_eq!(txn.reference(), Some("REF-1"));
        assert_eq!(txn.postings.len(), 2);
        assert_eq!(txn.postings[0].meta.get("note").map(String::as_str), Some("bank side"));
        assert_eq!(txn.postings[1].units, Amount::new(dec("-25.00"), "EUR"));
    }

    #[test]
    fn test_narration_only_and_txn_keyword() {
        let (entries, errors) = parse(
            "2024-02-01 txn \"Groceries\"\n  Expenses:Food  10 EUR\n  Assets:Cash  -10 EUR\n",
        );
        assert!(errors.is_empty());
        assert_eq!(entries[0].payee, None);
        assert_eq!(entries[0].narration, "Groceries");
        assert_eq!(entries[0].flag, Confidence::Confirmed);
    }

    #[test]
    fn test_provisional_flag_reads_back() {
        let (entries, _) = parse("2024-02-01 ? \"x\"\n  Expenses:Food  1 EUR\n  Assets:Cash\n");
        assert_eq!(entries[0].flag, Confidence::Provisional);
    }

    #[test]
    fn test_elided_amount_is_interpolated() {
        let (entries, errors) = parse(
            "2024-02-01 * \"Split\"\n  Expenses:Food  10.50 EUR\n  Expenses:Drinks  4.25 EUR\n  Assets:Cash\n",
        );
        assert!(errors.is_empty());
        assert_eq!(entries[0].postings[2].units, Amount::new(dec("-14.75"), "EUR"));
        assert!(entries[0].is_balanced());
    }

    #[test]
    fn test_two_elided_amounts_is_error() {
        let (_, errors) = parse("2024-02-01 * \"x\"\n  Expenses:Food\n  Assets:Cash\n");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, 3);
    }

    #[test]
    fn test_cost_and_price() {
        let (entries, errors) = parse(
            "2024-03-01 * \"Buy\"\n  Assets:Broker  2 ABC {10.00 EUR}\n  Assets:Cash  -20.00 EUR\n\n\
             2024-03-02 * \"Fx\"\n  Assets:Usd  10 USD @ 0.90 EUR\n  Assets:Cash  -9.00 EUR\n",
        );
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(entries[0].postings[0].cost, Some(Amount::new(dec("10.00"), "EUR")));
        assert_eq!(entries[1].postings[0].price, Some(Amount::new(dec("0.90"), "EUR")));
    }

    #[test]
    fn test_skips_other_directives_with_bodies() {
        let (entries, errors) = parse(
            "2024-01-01 open Assets:Bank EUR\n  description: \"main\"\n2024-01-02 balance Assets:Bank 0 EUR\n",
        );
        assert!(errors.is_empty());
        assert!(entries.is_empty());
    }

    #[test]
    fn test_reports_garbage_with_line_numbers() {
        let (_, errors) = parse("this is not a ledger\n2024-01-01 * \"x\"\n  not-an-account 5 EUR\n");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].line, 1);
        assert_eq!(errors[1].line, 3);
        assert!(errors[1].to_string().starts_with("test.beancount:3:"));
    }

    #[test]
    fn test_semicolon_inside_string_is_kept() {
        let (entries, _) = parse("2024-01-01 * \"a;b\"\n  reference: \"x;y\"\n  Assets:A  1 EUR\n  Assets:B  -1 EUR\n");
        assert_eq!(entries[0].narration, "a;b");
        assert_eq!(entries[0].reference(), Some("x;y"));
    }

    #[test]
    fn test_escaped_quotes() {
        let (entries, errors) = parse("2024-01-01 * \"say \\\"hi\\\"\"\n  Assets:A  1 EUR\n  Assets:B  -1 EUR\n");
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(entries[0].narration, "say \"hi\"");
    }

    #[test]
    fn test_includes_are_followed_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("transactions")).unwrap();
        std::fs::write(
            dir.path().join("transactions").join("a.beancount"),
            "2024-01-01 * \"a\"\n  reference: \"A1\"\n  Assets:A  1 EUR\n  Assets:B  -1 EUR\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("ledger.beancount"),
            "include \"transactions/a.beancount\"\ninclude \"transactions/a.beancount\"\n",
        )
        .unwrap();
        let (entries, errors) = load(&dir.path().join("ledger.beancount"));
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reference(), Some("A1"));
    }

    #[test]
    fn test_missing_include_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ledger.beancount"), "include \"nope.beancount\"\n").unwrap();
        let (_, errors) = load(&dir.path().join("ledger.beancount"));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("cannot read"));
    }
}
