use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::OnceLock;

use camino::Utf8Path;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::domain::{EnrichmentResult, WorkItem};
use crate::error::WildError;

pub const DEDUP_KEY_LEN: usize = 16;

/// Append-only record store keyed by a unique identifier.
pub trait Ledger {
    fn contains(&self, id: &str) -> bool;
    /// Writes `entry` unless its identifier is already recorded.
    fn append(&mut self, entry: &LedgerEntry) -> Result<(), WildError>;
    fn all_ids(&self) -> &HashSet<String>;

    fn len(&self) -> usize {
        self.all_ids().len()
    }

    fn is_empty(&self) -> bool {
        self.all_ids().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub id: String,
    pub columns: Vec<(String, String)>,
}

impl LedgerEntry {
    pub fn new(id: impl Into<String>, columns: Vec<(String, String)>) -> Self {
        Self {
            id: id.into(),
            columns,
        }
    }

    /// Input columns first, enrichment columns after.
    pub fn enriched(item: &WorkItem, result: &EnrichmentResult, enriched_at: &str) -> Self {
        let mut columns = item.fields.clone();
        for (name, value) in result.columns(enriched_at) {
            match columns.iter_mut().find(|(existing, _)| *existing == name) {
                Some(slot) => slot.1 = value,
                None => columns.push((name, value)),
            }
        }
        Self {
            id: item.id.clone(),
            columns,
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }
}

/// CSV file opened in append mode; the header is written once and never rewritten.
pub struct CsvLedger {
    key_column: String,
    headers: Option<Vec<String>>,
    ids: HashSet<String>,
    writer: csv::Writer<File>,
}

impl CsvLedger {
    pub fn open(path: &Utf8Path, key_column: &str) -> Result<Self, WildError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| WildError::Filesystem(err.to_string()))?;
        }

        let (headers, ids) = if is_non_empty(path)? {
            repair_torn_tail(path)?;
            let (headers, ids) = scan_existing(path, key_column)?;
            (Some(headers), ids)
        } else {
            (None, HashSet::new())
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_std_path())
            .map_err(|err| WildError::Filesystem(format!("open ledger {path}: {err}")))?;
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        tracing::debug!(ledger = %path, entries = ids.len(), "ledger opened");

        Ok(Self {
            key_column: key_column.to_string(),
            headers,
            ids,
            writer,
        })
    }

    pub fn headers(&self) -> Option<&[String]> {
        self.headers.as_deref()
    }

    fn row_for(&self, headers: &[String], entry: &LedgerEntry) -> Vec<String> {
        headers
            .iter()
            .map(|name| {
                if *name == self.key_column {
                    entry.id.clone()
                } else {
                    entry.get(name).unwrap_or_default().to_string()
                }
            })
            .collect()
    }
}

impl Ledger for CsvLedger {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn append(&mut self, entry: &LedgerEntry) -> Result<(), WildError> {
        if self.ids.contains(&entry.id) {
            tracing::debug!(id = %entry.id, "already in ledger; skipping append");
            return Ok(());
        }

        if self.headers.is_none() {
            let mut headers: Vec<String> =
                entry.columns.iter().map(|(name, _)| name.clone()).collect();
            if !headers.contains(&self.key_column) {
                headers.insert(0, self.key_column.clone());
            }
            self.writer.write_record(&headers)?;
            self.headers = Some(headers);
        }

        let row = self.row_for(self.headers.as_deref().unwrap_or_default(), entry);
        self.writer.write_record(&row)?;
        self.writer
            .flush()
            .map_err(|err| WildError::Filesystem(err.to_string()))?;
        self.ids.insert(entry.id.clone());
        Ok(())
    }

    fn all_ids(&self) -> &HashSet<String> {
        &self.ids
    }
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: Vec<LedgerEntry>,
    ids: HashSet<String>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }
}

impl Ledger for MemoryLedger {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn append(&mut self, entry: &LedgerEntry) -> Result<(), WildError> {
        if self.ids.insert(entry.id.clone()) {
            self.entries.push(entry.clone());
        }
        Ok(())
    }

    fn all_ids(&self) -> &HashSet<String> {
        &self.ids
    }
}

/// Hex SHA-256 of `source`, truncated to `DEDUP_KEY_LEN` characters.
pub fn dedup_key(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex.truncate(DEDUP_KEY_LEN);
    hex
}

pub fn image_filename(key: &str) -> String {
    format!("img_{key}.jpg")
}

pub fn key_from_filename(filename: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^img_([0-9a-f]{16})\.jpg$").expect("static dedup filename pattern")
    });
    pattern
        .captures(filename.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn is_non_empty(path: &Utf8Path) -> Result<bool, WildError> {
    match fs::metadata(path.as_std_path()) {
        Ok(meta) => Ok(meta.len() > 0),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(WildError::Filesystem(err.to_string())),
    }
}

/// Line appended after a torn row. It outlives the repair, so every later
/// open still knows the row above it is incomplete.
pub const TORN_MARKER: &str = "#torn";

pub fn is_torn_marker(record: &csv::StringRecord) -> bool {
    record.len() == 1 && record.get(0) == Some(TORN_MARKER)
}

/// A crash can leave the last row without its newline. Terminate it and mark
/// it torn in a single write so the next append starts on a fresh line.
fn repair_torn_tail(path: &Utf8Path) -> Result<(), WildError> {
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .open(path.as_std_path())
        .map_err(|err| WildError::Filesystem(err.to_string()))?;
    file.seek(SeekFrom::End(-1))
        .map_err(|err| WildError::Filesystem(err.to_string()))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)
        .map_err(|err| WildError::Filesystem(err.to_string()))?;
    if last[0] != b'\n' {
        tracing::warn!(ledger = %path, "ledger ends mid-row; marking torn line");
        file.write_all(format!("\n{TORN_MARKER}\n").as_bytes())
            .map_err(|err| WildError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

/// A row followed by the torn marker never counts as recorded, even when its
/// field count matches the header.
fn scan_existing(
    path: &Utf8Path,
    key_column: &str,
) -> Result<(Vec<String>, HashSet<String>), WildError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path.as_std_path())?;
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let key_index = headers.iter().position(|name| name == key_column);
    let missing_key = || WildError::MissingIdentifier(key_column.to_string());

    let mut ids = HashSet::new();
    let mut torn = 0usize;
    // Held back one row so a marker on the next line can still discard it.
    let mut previous: Option<String> = None;
    for (index, record) in reader.records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(ledger = %path, error = %err, "skipping unreadable ledger row");
                ids.extend(previous.take());
                torn += 1;
                continue;
            }
        };
        if is_torn_marker(&record) {
            if index == 0 {
                return Err(WildError::TornHeader(path.to_string()));
            }
            if previous.take().is_some() {
                torn += 1;
            }
            continue;
        }
        ids.extend(previous.take());
        if record.len() != headers.len() {
            torn += 1;
            continue;
        }
        let key_index = key_index.ok_or_else(missing_key)?;
        previous = record
            .get(key_index)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
    }
    ids.extend(previous);
    if key_index.is_none() {
        return Err(missing_key());
    }

    if torn > 0 {
        tracing::warn!(ledger = %path, torn, "ignored incomplete ledger rows");
    }
    Ok((headers, ids))
}
