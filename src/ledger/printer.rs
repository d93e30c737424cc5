use std::fmt::Write as _;
use std::io::{self, Write};

use crate::models::{LedgerTransaction, Metadata};

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' | '\r' => out.push(' '),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn write_meta(out: &mut String, meta: &Metadata, indent: &str) {
    for (key, value) in meta {
        let _ = writeln!(out, "{indent}{key}: {}", quote(value));
    }
}

/// Render one transaction, postings aligned on the decimal column.
pub fn format_entry(txn: &LedgerTransaction) -> String {
    let mut out = String::new();
    let _ = write!(out, "{} {}", txn.date.format("%Y-%m-%d"), txn.flag.symbol());
    if let Some(payee) = &txn.payee {
        let _ = write!(out, " {}", quote(payee));
    }
    let _ = write!(out, " {}", quote(&txn.narration));
    for tag in &txn.tags {
        let _ = write!(out, " #{tag}");
    }
    for link in &txn.links {
        let _ = write!(out, " ^{link}");
    }
    out.push('\n');
    write_meta(&mut out, &txn.meta, "  ");

    let account_width = txn.postings.iter().map(|p| p.account.len()).max().unwrap_or(0);
    let number_width = txn
        .postings
        .iter()
        .map(|p| p.units.number.to_string().len())
        .max()
        .unwrap_or(0);
    for p in &txn.postings {
        let _ = write!(
            out,
            "  {:<aw$}  {:>nw$} {}",
            p.account,
            p.units.number.to_string(),
            p.units.currency,
            aw = account_width,
            nw = number_width,
        );
        if let Some(cost) = &p.cost {
            let _ = write!(out, " {{{cost}}}");
        }
        if let Some(price) = &p.price {
            let _ = write!(out, " @ {price}");
        }
        out.push('\n');
        write_meta(&mut out, &p.meta, "    ");
    }
    out
}

/// Entries separated by blank lines.
pub fn print_entries<W: Write>(writer: &mut W, entries: &[LedgerTransaction]) -> io::Result<()> {
    for (i, txn) in entries.iter().enumerate() {
        if i > 0 {
            writeln!(writer)?;
        }
        write!(writer, "{}", format_entry(txn))?;
    }
    Ok(())
}
