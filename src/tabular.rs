// 📄 Tabular Store - delimited text in, delimited text out
//
// Portal files are `;`-separated, published in one of several encodings and
// use Brazilian number formatting ("1.234,56"). Everything the pipeline
// writes is `;`-separated UTF-8.

use serde::Serialize;
use std::fs;
use std::path::Path;

use crate::config::SOURCE_ENCODINGS;
use crate::error::{PipelineError, Result};

pub const DELIMITER: u8 = b';';

// ============================================================================
// RAW TABLE
// ============================================================================

/// Header + rows exactly as read, before any schema mapping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        RawTable { headers, rows }
    }

    /// Headers lower-cased and trimmed, inner spaces turned into `_`
    pub fn normalized_headers(&self) -> Vec<String> {
        self.headers.iter().map(|h| normalize_header(h)).collect()
    }

    /// Index of the first column whose normalized header is in `candidates`
    pub fn find_column(&self, candidates: &[&str]) -> Option<usize> {
        let headers = self.normalized_headers();
        candidates
            .iter()
            .find_map(|c| headers.iter().position(|h| h == c))
    }

    /// Cell value, "" when the row is short
    pub fn cell<'a>(&'a self, row: &'a [String], column: Option<usize>) -> &'a str {
        column
            .and_then(|idx| row.get(idx))
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub fn normalize_header(header: &str) -> String {
    header
        .trim_start_matches('\u{feff}')
        .trim()
        .trim_matches('"')
        .trim()
        .to_lowercase()
        .replace(' ', "_")
}

// ============================================================================
// DECODING
// ============================================================================

/// cp1252 code points for bytes 0x80..=0x9F (0 = undefined)
const CP1252_HIGH: [u32; 32] = [
    0x20AC, 0, 0x201A, 0x0192, 0x201E, 0x2026, 0x2020, 0x2021, 0x02C6, 0x2030, 0x0160, 0x2039,
    0x0152, 0, 0x017D, 0, 0, 0x2018, 0x2019, 0x201C, 0x201D, 0x2022, 0x2013, 0x2014, 0x02DC,
    0x2122, 0x0161, 0x203A, 0x0153, 0, 0x017E, 0x0178,
];

fn decode_with(bytes: &[u8], encoding: &str) -> Option<String> {
    match encoding.to_lowercase().as_str() {
        "utf-8" | "utf8" => String::from_utf8(bytes.to_vec()).ok(),
        "latin-1" | "latin1" | "iso-8859-1" => Some(bytes.iter().map(|b| *b as char).collect()),
        "cp1252" | "windows-1252" => bytes
            .iter()
            .map(|b| match *b {
                0x80..=0x9F => match CP1252_HIGH[(*b - 0x80) as usize] {
                    0 => None,
                    code => char::from_u32(code),
                },
                other => Some(other as char),
            })
            .collect(),
        _ => None,
    }
}

/// Try each encoding in order; the first one that decodes wins.
pub fn decode_bytes(bytes: &[u8], encodings: &[&str], origin: &str) -> Result<String> {
    for encoding in encodings {
        if let Some(text) = decode_with(bytes, encoding) {
            tracing::debug!("decoded {} as {}", origin, encoding);
            return Ok(text.trim_start_matches('\u{feff}').to_string());
        }
    }
    Err(PipelineError::Decoding {
        path: origin.to_string(),
        tried: encodings.join(", "),
    })
}

// ============================================================================
// READING
// ============================================================================

pub fn parse_table(text: &str, delimiter: u8) -> Result<RawTable> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()?
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(|v| v.to_string()).collect());
    }

    Ok(RawTable { headers, rows })
}

/// Read a portal file with the default encoding fallback list
pub fn read_table(path: &Path) -> Result<RawTable> {
    read_table_with(path, DELIMITER, SOURCE_ENCODINGS)
}

pub fn read_table_with(path: &Path, delimiter: u8, encodings: &[&str]) -> Result<RawTable> {
    let bytes = fs::read(path)?;
    let text = decode_bytes(&bytes, encodings, &path.display().to_string())?;
    parse_table(&text, delimiter)
}

// ============================================================================
// NUMBERS
// ============================================================================

/// Parse a decimal written either as "1234.56" or in Brazilian form
/// "1.234,56". Blank, "nan" and non-finite inputs are absent.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let value = raw.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("nan") {
        return None;
    }

    let canonical = if value.contains(',') {
        value.replace('.', "").replace(',', ".")
    } else {
        value.to_string()
    };

    canonical.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse an integer, accepting "3" and "3.0" but not "3.5"
pub fn parse_int(raw: &str) -> Option<i32> {
    let value = raw.trim();
    if let Ok(n) = value.parse::<i32>() {
        return Some(n);
    }
    let float = parse_decimal(value)?;
    if float.fract() == 0.0 && float.abs() <= i32::MAX as f64 {
        Some(float as i32)
    } else {
        None
    }
}

// ============================================================================
// WRITING
// ============================================================================

fn writer_for(path: &Path) -> Result<csv::Writer<fs::File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(csv::WriterBuilder::new()
        .delimiter(DELIMITER)
        .from_path(path)?)
}

/// Write string rows under a fixed header
pub fn write_rows(path: &Path, headers: &[&str], rows: &[Vec<String>]) -> Result<()> {
    let mut writer = writer_for(path)?;
    writer.write_record(headers)?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write serde rows; the header comes from the struct field names
pub fn write_serialized<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    let mut writer = writer_for(path)?;
    for item in items {
        writer.serialize(item)?;
    }
    writer.flush()?;
    Ok(())
}
