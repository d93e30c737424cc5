use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use chrono::NaiveDate;

use crate::error::{Result, TallyError};
use crate::models::{amount_from_f64, parse_amount, parse_date, ExtractField, ExtractRecord, FieldKind, FieldValue};

// ---------------------------------------------------------------------------
// Extract set
// ---------------------------------------------------------------------------

/// All extract records of a run, in file order, plus a reference index.
#[derive(Debug, Default)]
pub struct ExtractSet {
    records: Vec<ExtractRecord>,
    by_reference: HashMap<String, usize>,
}

impl ExtractSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append records. Empty references are not indexed; a repeated reference
    /// points the index at the newest record.
    pub fn extend(&mut self, records: impl IntoIterator<Item = ExtractRecord>) {
        for record in records {
            if !record.reference.is_empty() {
                self.by_reference.insert(record.reference.clone(), self.records.len());
            }
            self.records.push(record);
        }
    }

    pub fn records(&self) -> &[ExtractRecord] {
        &self.records
    }

    #[cfg(test)]
    pub fn get(&self, reference: &str) -> Option<&ExtractRecord> {
        self.by_reference.get(reference).map(|&i| &self.records[i])
    }

    pub fn references(&self) -> BTreeSet<&str> {
        self.by_reference.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FromIterator<ExtractRecord> for ExtractSet {
    fn from_iter<I: IntoIterator<Item = ExtractRecord>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

// ---------------------------------------------------------------------------
// Columns and cells
// ---------------------------------------------------------------------------

#[cfg(feature = "xlsx")]
const SHEET: &str = "Verrichtingen";

const COLUMNS: &[(&str, ExtractField)] = &[
    ("Rekening", ExtractField::Account),
    ("Boekdatum", ExtractField::BookingDate),
    ("Valutadatum", ExtractField::ValueDate),
    ("Verrichtingsdatum", ExtractField::OperationDate),
    ("Referentie", ExtractField::Reference),
    ("Beschrijving", ExtractField::Description),
    ("Bedrag", ExtractField::Amount),
    ("Munt", ExtractField::Currency),
    ("Rekening tegenpartij", ExtractField::CounterpartyAccount),
    ("Naam tegenpartij", ExtractField::CounterpartyName),
    ("Mededeling", ExtractField::Message),
];

/// Map header positions to fields, warning about columns we don't know.
fn column_map<S: AsRef<str>>(headers: &[S], source: &str) -> Vec<(usize, ExtractField, String)> {
    let mut columns = Vec::new();
    for (idx, header) in headers.iter().enumerate() {
        let header = header.as_ref().trim().trim_start_matches('\u{feff}');
        match COLUMNS.iter().find(|(name, _)| *name == header) {
            Some((_, field)) => columns.push((idx, *field, header.to_string())),
            None => tracing::warn!("Unknown column {header:?} in {source}"),
        }
    }
    columns
}

#[derive(Debug, Clone, PartialEq)]
enum CellValue {
    Empty,
    Text(String),
    Number(f64),
}

pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    // Excel epoch is 1899-12-30 (accounting for the 1900 leap year bug)
    if !serial.is_finite() {
        return None;
    }
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    base.checked_add_signed(chrono::Duration::try_days(serial.floor() as i64)?)
}

/// `None` keeps the record's default for the field.
fn convert(field: ExtractField, cell: CellValue) -> std::result::Result<Option<FieldValue>, String> {
    let value = match (field.kind(), cell) {
        (_, CellValue::Empty) => return Ok(None),
        (FieldKind::Text, CellValue::Text(s)) => FieldValue::Text(s),
        (FieldKind::Text, CellValue::Number(n)) if n.fract() == 0.0 => {
            FieldValue::Text(format!("{}", n as i64))
        }
        (FieldKind::Text, CellValue::Number(n)) => FieldValue::Text(n.to_string()),
        (FieldKind::Date, CellValue::Number(n)) => {
            FieldValue::Date(excel_serial_to_date(n).ok_or_else(|| format!("bad date serial {n}"))?)
        }
        (FieldKind::Date, CellValue::Text(s)) => {
            FieldValue::Date(parse_date(&s).ok_or_else(|| format!("bad date {s:?}"))?)
        }
        (FieldKind::Amount, CellValue::Number(n)) => {
            FieldValue::Amount(amount_from_f64(n).ok_or_else(|| format!("bad amount {n}"))?)
        }
        (FieldKind::Amount, CellValue::Text(s)) => {
            FieldValue::Amount(parse_amount(&s).ok_or_else(|| format!("bad amount {s:?}"))?)
        }
    };
    Ok(Some(value))
}

fn decode_rows<I>(headers: &[String], rows: I, source: &str) -> Result<Vec<ExtractRecord>>
where
    I: IntoIterator<Item = Vec<CellValue>>,
{
    let columns = column_map(headers, source);
    let mut records = Vec::new();
    for (i, row) in rows.into_iter().enumerate() {
        if row.iter().all(|c| *c == CellValue::Empty) {
            continue;
        }
        let mut record = ExtractRecord::default();
        for (idx, field, header) in &columns {
            let cell = row.get(*idx).cloned().unwrap_or(CellValue::Empty);
            let value = convert(*field, cell).map_err(|message| TallyError::Extract {
                file: source.to_string(),
                message: format!("row {}, column {header}: {message}", i + 2),
            })?;
            if let Some(value) = value {
                record.set(*field, value);
            }
        }
        records.push(record);
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// File formats
// ---------------------------------------------------------------------------

fn decode_csv_str(content: &str, source: &str) -> Result<Vec<ExtractRecord>> {
    let first_line = content.lines().next().unwrap_or("");
    let delimiter = if first_line.contains(';') { b';' } else { b',' };
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(content.as_bytes());
    let headers: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();
    let mut rows: Vec<Vec<CellValue>> = Vec::new();
    for result in rdr.records() {
        let record = result?;
        rows.push(
            record
                .iter()
                .map(|f| {
                    let f = f.trim();
                    if f.is_empty() {
                        CellValue::Empty
                    } else {
                        CellValue::Text(f.to_string())
                    }
                })
                .collect(),
        );
    }
    decode_rows(&headers, rows, source)
}

fn decode_csv(path: &Path) -> Result<Vec<ExtractRecord>> {
    let content = std::fs::read_to_string(path)?;
    decode_csv_str(&content, &path.display().to_string())
}

#[cfg(feature = "xlsx")]
fn cell_value(data: &calamine::Data) -> CellValue {
    use calamine::Data;
    match data {
        Data::Empty | Data::Error(_) => CellValue::Empty,
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => {
            if s.trim().is_empty() {
                CellValue::Empty
            } else {
                CellValue::Text(s.clone())
            }
        }
        Data::Float(f) => CellValue::Number(*f),
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::DateTime(dt) => CellValue::Number(dt.as_f64()),
        Data::Bool(b) => CellValue::Text(b.to_string()),
    }
}

#[cfg(feature = "xlsx")]
fn decode_range(range: &calamine::Range<calamine::Data>, source: &str) -> Result<Vec<ExtractRecord>> {
    let mut rows = range.rows();
    let Some(header_row) = rows.next() else {
        return Ok(Vec::new());
    };
    let headers: Vec<String> = header_row.iter().map(|d| d.to_string()).collect();
    decode_rows(&headers, rows.map(|r| r.iter().map(cell_value).collect()), source)
}

#[cfg(feature = "xlsx")]
fn decode_xlsx(path: &Path) -> Result<Vec<ExtractRecord>> {
    use calamine::Reader;
    let mut workbook = calamine::open_workbook_auto(path)?;
    let range = workbook.worksheet_range(SHEET)?;
    decode_range(&range, &path.display().to_string())
}

#[cfg(not(feature = "xlsx"))]
fn decode_xlsx(path: &Path) -> Result<Vec<ExtractRecord>> {
    tracing::warn!("Skipping {} (built without xlsx support)", path.display());
    Ok(Vec::new())
}

/// Decode one extract file. Unsupported file types are skipped with a warning.
pub fn import_file(path: &Path) -> Result<Option<Vec<ExtractRecord>>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let records = match ext.as_str() {
        "xlsx" => {
            tracing::info!("Importing file as XLSX: {}", path.display());
            decode_xlsx(path)?
        }
        "csv" => {
            tracing::info!("Importing file as CSV: {}", path.display());
            decode_csv(path)?
        }
        _ => {
            let kind = if ext.is_empty() { "no extension" } else { ext.as_str() };
            tracing::warn!("Skipping {} ({kind})", path.display());
            return Ok(None);
        }
    };
    Ok(Some(records))
}

/// Every extract in `dir`, concatenated in file-name order.
pub fn load_extracts(dir: &Path) -> Result<ExtractSet> {
    tracing::info!("Loading extracts from {}", dir.display());
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut set = ExtractSet::new();
    for path in &paths {
        if let Some(records) = import_file(path)? {
            let unreferenced = records.iter().filter(|r| r.reference.is_empty()).count();
            if unreferenced > 0 {
                tracing::warn!("{unreferenced} record(s) without reference in {}", path.display());
            }
            set.extend(records);
        }
    }
    tracing::info!(records = set.len(), files = paths.len(), "extracts loaded");
    Ok(set)
}
