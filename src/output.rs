use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::error::Result;
use crate::ledger::print_entries;
use crate::models::{Confidence, LedgerTransaction};

const MAX_SLOTS: u32 = 1000;

/// Generated transactions split by confidence. `auto` holds the provisional
/// entries, `manual` the confirmed ones; the file names depend on this.
#[derive(Debug, Default)]
pub struct Buckets {
    pub auto: Vec<LedgerTransaction>,
    pub manual: Vec<LedgerTransaction>,
}

pub fn partition(transactions: Vec<LedgerTransaction>) -> Buckets {
    let (auto, manual): (Vec<_>, Vec<_>) = transactions
        .into_iter()
        .partition(|txn| txn.flag == Confidence::Provisional);
    Buckets { auto, manual }
}

/// A free `{date}_{seq}` prefix in the transactions directory.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSlot {
    dir: PathBuf,
    prefix: String,
}

impl OutputSlot {
    /// First sequence number in `1..1000` no existing file uses for `date`.
    pub fn allocate(dir: &Path, date: NaiveDate) -> Result<Option<OutputSlot>> {
        let taken: Vec<String> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        let date = date.format("%Y-%m-%d");
        for seq in 1..MAX_SLOTS {
            let prefix = format!("{date}_{seq:03}");
            let marker = format!("{prefix}_");
            if !taken.iter().any(|name| name.starts_with(&marker)) {
                return Ok(Some(OutputSlot {
                    dir: dir.to_path_buf(),
                    prefix,
                }));
            }
        }
        Ok(None)
    }

    pub fn auto_path(&self) -> PathBuf {
        self.dir.join(format!("{}_auto.beancount", self.prefix))
    }

    pub fn manual_path(&self) -> PathBuf {
        self.dir.join(format!("{}_manual.beancount", self.prefix))
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct Written {
    pub auto: Option<PathBuf>,
    pub manual: Option<PathBuf>,
}

fn write_file(path: &Path, entries: &[LedgerTransaction]) -> Result<()> {
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let mut writer = BufWriter::new(file);
    let printed = print_entries(&mut writer, entries).and_then(|_| writer.flush());
    if let Err(e) = printed {
        drop(writer);
        let _ = std::fs::remove_file(path);
        return Err(e.into());
    }
    tracing::info!(file = %path.display(), entries = entries.len(), "written");
    Ok(())
}

/// Write each non-empty bucket to its slot file. Existing files are never
/// replaced, and a failed run leaves no file of its own behind.
pub fn write_buckets(slot: &OutputSlot, buckets: &Buckets) -> Result<Written> {
    let mut written = Written::default();
    if !buckets.auto.is_empty() {
        let path = slot.auto_path();
        write_file(&path, &buckets.auto)?;
        written.auto = Some(path);
    }
    if !buckets.manual.is_empty() {
        let path = slot.manual_path();
        if let Err(e) = write_file(&path, &buckets.manual) {
            if let Some(auto) = &written.auto {
                if let Err(cleanup) = std::fs::remove_file(auto) {
                    tracing::error!("cannot remove {}: {cleanup}", auto.display());
                }
            }
            return Err(e);
        }
        written.manual = Some(path);
    }
    Ok(written)
}
