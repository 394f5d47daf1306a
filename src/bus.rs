//! Streaming parser for sorted BUS text records.
//!
//! A BUS text stream has four whitespace-delimited columns per line:
//! barcode, UMI, equivalence-class ID, multiplicity. The upstream
//! aligner emits records sorted by (barcode, UMI); downstream
//! deduplication depends on that order, so the reader validates it and
//! fails hard on a violation.

use memchr::memchr;
use memmap2::Mmap;
use rayon::prelude::*;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use thiserror::Error;

/// Minimum file size to use mmap (smaller files use buffered I/O).
const MMAP_THRESHOLD: usize = 64 * 1024;

/// Errors that can occur while quantifying a BUS stream.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Stream not sorted at record {record}: {message}")]
    Unsorted { record: usize, message: String },

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("no barcodes survived the knee cut")]
    EmptyCellSet,
}

pub type Result<T> = std::result::Result<T, BusError>;

/// A single pseudoalignment record from a BUS text stream.
///
/// Immutable once parsed. `count` is the read multiplicity reported by
/// the aligner, not a UMI count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRecord {
    pub barcode: String,
    pub umi: String,
    pub ec: u32,
    pub count: u32,
}

impl BusRecord {
    pub fn new(barcode: impl Into<String>, umi: impl Into<String>, ec: u32, count: u32) -> Self {
        Self {
            barcode: barcode.into(),
            umi: umi.into(),
            ec,
            count,
        }
    }
}

/// Fast u32 parsing - no allocation, no error formatting.
///
/// Returns None if the input is empty or contains non-digit characters.
#[inline(always)]
pub fn parse_u32_fast(bytes: &[u8]) -> Option<u32> {
    if bytes.is_empty() {
        return None;
    }
    let mut n: u32 = 0;
    for &b in bytes {
        let d = b.wrapping_sub(b'0');
        if d > 9 {
            return None;
        }
        n = n.checked_mul(10)?.checked_add(d as u32)?;
    }
    Some(n)
}

/// Parse the four BUS columns from a raw line - zero allocation until
/// the record itself is built.
///
/// Accepts tab or space delimiters (bustools emits tabs; hand-written
/// fixtures often use spaces). Returns None on the wrong field count
/// or unparseable integers.
#[inline]
pub fn parse_bus_bytes(line: &[u8]) -> Option<BusRecord> {
    let mut fields = line
        .split(|&b| b == b'\t' || b == b' ')
        .filter(|f| !f.is_empty());

    let barcode = fields.next()?;
    let umi = fields.next()?;
    let ec = parse_u32_fast(fields.next()?)?;
    let count = parse_u32_fast(fields.next()?)?;
    if fields.next().is_some() {
        return None;
    }

    let barcode = std::str::from_utf8(barcode).ok()?;
    let umi = std::str::from_utf8(umi).ok()?;
    Some(BusRecord::new(barcode, umi, ec, count))
}

/// Inline order validator for (barcode, UMI) sorted streams.
///
/// Also enforces fixed barcode and UMI widths: the first record pins
/// the expected lengths.
#[derive(Debug, Default)]
pub struct OrderValidator {
    prev_barcode: Option<String>,
    prev_umi: String,
    barcode_len: usize,
    umi_len: usize,
    record_count: usize,
}

impl OrderValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate that the given record maintains sort order and field
    /// widths. Returns Err if out of order or a width changes.
    #[inline]
    pub fn validate(&mut self, record: &BusRecord) -> Result<()> {
        self.record_count += 1;

        match &self.prev_barcode {
            None => {
                self.barcode_len = record.barcode.len();
                self.umi_len = record.umi.len();
            }
            Some(prev) => {
                if record.barcode.len() != self.barcode_len {
                    return Err(BusError::InvalidFormat(format!(
                        "barcode width changed from {} to {} at record {}",
                        self.barcode_len,
                        record.barcode.len(),
                        self.record_count
                    )));
                }
                if record.umi.len() != self.umi_len {
                    return Err(BusError::InvalidFormat(format!(
                        "UMI width changed from {} to {} at record {}",
                        self.umi_len,
                        record.umi.len(),
                        self.record_count
                    )));
                }
                let order = (record.barcode.as_str(), record.umi.as_str());
                if order < (prev.as_str(), self.prev_umi.as_str()) {
                    return Err(BusError::Unsorted {
                        record: self.record_count,
                        message: format!(
                            "({}, {}) comes after ({}, {})",
                            record.barcode, record.umi, prev, self.prev_umi
                        ),
                    });
                }
            }
        }

        if let Some(prev) = &mut self.prev_barcode {
            prev.clear();
            prev.push_str(&record.barcode);
        } else {
            self.prev_barcode = Some(record.barcode.clone());
        }
        self.prev_umi.clear();
        self.prev_umi.push_str(&record.umi);
        Ok(())
    }

    /// Get the number of records validated.
    pub fn record_count(&self) -> usize {
        self.record_count
    }
}

/// A streaming BUS text reader.
///
/// Validates (barcode, UMI) sort order as records are produced; the
/// whole input is never buffered.
pub struct BusReader<R: Read> {
    reader: BufReader<R>,
    line_number: usize,
    buffer: String,
    validator: OrderValidator,
}

impl BusReader<File> {
    /// Open a BUS text file from a path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(file))
    }
}

impl<R: Read> BusReader<R> {
    /// Create a new BUS reader from any readable source.
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line_number: 0,
            buffer: String::with_capacity(128),
            validator: OrderValidator::new(),
        }
    }

    /// Read the next record, skipping blank and comment lines.
    pub fn read_record(&mut self) -> Result<Option<BusRecord>> {
        loop {
            self.buffer.clear();
            let bytes_read = self.reader.read_line(&mut self.buffer)?;
            if bytes_read == 0 {
                return Ok(None);
            }
            self.line_number += 1;

            let line = self.buffer.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let record = parse_bus_bytes(line.as_bytes()).ok_or_else(|| BusError::Parse {
                line: self.line_number,
                message: format!(
                    "expected 4 fields (barcode, umi, ec, count), got '{}'",
                    line
                ),
            })?;
            self.validator.validate(&record)?;
            return Ok(Some(record));
        }
    }

    /// Get an iterator over all records.
    pub fn records(self) -> BusRecordIter<R> {
        BusRecordIter { reader: self }
    }
}

/// Iterator over BUS records.
pub struct BusRecordIter<R: Read> {
    reader: BusReader<R>,
}

impl<R: Read> Iterator for BusRecordIter<R> {
    type Item = Result<BusRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Parse records from a string (useful for testing).
pub fn parse_records(content: &str) -> Result<Vec<BusRecord>> {
    BusReader::new(content.as_bytes()).records().collect()
}

/// Verify that a BUS text file is sorted by (barcode, UMI).
///
/// Returns Ok(record count) if sorted, Err with details if not.
pub fn verify_sorted<P: AsRef<Path>>(path: P) -> Result<usize> {
    let reader = BusReader::from_path(path)?;
    let mut n = 0;
    for result in reader.records() {
        result?;
        n += 1;
    }
    Ok(n)
}

/// Load an entire BUS text file, validating sort order.
///
/// Large files are memory-mapped and parsed in parallel with rayon;
/// small files go through the buffered reader. Aggregation is the one
/// full buffering point of the pipeline, so whole-file loading is
/// acceptable here; `BusReader` remains the streaming API.
pub fn load_records<P: AsRef<Path>>(path: P) -> Result<Vec<BusRecord>> {
    let file = File::open(path.as_ref())?;
    let len = file.metadata()?.len() as usize;

    if len < MMAP_THRESHOLD {
        return BusReader::new(file).records().collect();
    }

    // Safety: the mapping is read-only and dropped before return.
    let mmap = unsafe { Mmap::map(&file)? };
    let records = parse_mapped(&mmap)?;

    let mut validator = OrderValidator::new();
    for record in &records {
        validator.validate(record)?;
    }
    Ok(records)
}

/// Split mapped bytes into lines and parse them in parallel.
fn parse_mapped(data: &[u8]) -> Result<Vec<BusRecord>> {
    let mut lines: Vec<(usize, &[u8])> = Vec::with_capacity(data.len() / 32);
    let mut pos = 0;
    let mut line_number = 0;
    while pos < data.len() {
        let end = match memchr(b'\n', &data[pos..]) {
            Some(i) => pos + i,
            None => data.len(),
        };
        line_number += 1;
        let line = &data[pos..end];
        let line = if line.ends_with(b"\r") {
            &line[..line.len() - 1]
        } else {
            line
        };
        if !line.is_empty() && line[0] != b'#' {
            lines.push((line_number, line));
        }
        pos = end + 1;
    }

    lines
        .par_iter()
        .map(|&(line_number, line)| {
            parse_bus_bytes(line).ok_or_else(|| BusError::Parse {
                line: line_number,
                message: format!(
                    "expected 4 fields (barcode, umi, ec, count), got '{}'",
                    String::from_utf8_lossy(line)
                ),
            })
        })
        .collect()
}
