//! CSV decoding with delimiter sniffing and opportunistic typing.
//!
//! Exports from different spreadsheet tools disagree on delimiters and
//! encodings, so the decoder:
//!
//! - sniffs the delimiter among `,` `;` `\t` `|` from the first lines,
//! - trims and upper-cases every header so alias lookup is case-insensitive,
//! - turns numeric-looking cells into numbers (except zero-padded codes),
//! - skips blank lines, including lines made only of delimiters,
//! - falls back to Windows-1252 when the bytes are not valid UTF-8.

use std::borrow::Cow;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord};

use crate::error::{LoadError, ParseError};
use crate::models::{RawRecord, RawValue};

/// Delimiters tried by [`sniff_delimiter`], in tie-break order.
const CANDIDATES: [u8; 4] = [b',', b';', b'\t', b'|'];

/// Number of non-blank lines inspected when sniffing.
const SNIFF_LINES: usize = 10;

/// Largest integer a cell may hold and still be typed as a number.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Decode CSV text into raw records.
///
/// The first non-blank row is the header row. An input with only a header
/// (or nothing at all) yields an empty vector.
pub fn decode_str(text: &str) -> Result<Vec<RawRecord>, ParseError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let delimiter = sniff_delimiter(text);

    let mut rdr = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut headers: Option<Vec<String>> = None;
    let mut records = Vec::new();

    for result in rdr.records() {
        let record = result?;
        if is_blank(&record) {
            continue;
        }

        match &headers {
            None => {
                let parsed: Vec<String> =
                    record.iter().map(|h| h.trim().to_uppercase()).collect();
                tracing::debug!(
                    delimiter = %(delimiter as char).escape_default(),
                    headers = ?parsed,
                    "detected CSV headers"
                );
                headers = Some(parsed);
            }
            Some(names) => records.push(to_raw_record(names, &record)),
        }
    }

    Ok(records)
}

/// Decode raw bytes, handling a UTF-8 BOM and legacy Windows-1252 exports.
pub fn decode_bytes(bytes: &[u8]) -> Result<Vec<RawRecord>, ParseError> {
    decode_str(&text_from_bytes(bytes))
}

/// Bytes → text: strip a UTF-8 BOM, fall back to Windows-1252.
pub fn text_from_bytes(bytes: &[u8]) -> Cow<'_, str> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => {
            tracing::debug!("input is not valid UTF-8; decoding as Windows-1252");
            let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            text
        }
    }
}

/// Read and decode a local file.
pub async fn decode_file(path: &Path) -> Result<Vec<RawRecord>, LoadError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(decode_bytes(&bytes)?)
}

/// Guess the delimiter from the first non-blank lines.
///
/// A candidate qualifies when every sampled line splits into the same number
/// of fields and that number is greater than one. Among qualifying
/// candidates the widest wins. If none qualifies, the candidate with the
/// widest header row is used, and comma is the last resort.
pub fn sniff_delimiter(text: &str) -> u8 {
    let sample = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(SNIFF_LINES)
        .collect::<Vec<_>>()
        .join("\n");

    let mut consistent: Option<(u8, usize)> = None;
    let mut widest_header: Option<(u8, usize)> = None;

    for &delimiter in &CANDIDATES {
        let mut rdr = ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(sample.as_bytes());
        let counts: Vec<usize> = rdr
            .records()
            .filter_map(|r| r.ok())
            .map(|r| r.len())
            .collect();

        let Some(&first) = counts.first() else {
            continue;
        };
        if first < 2 {
            continue;
        }
        if widest_header.map_or(true, |(_, n)| first > n) {
            widest_header = Some((delimiter, first));
        }
        if counts.iter().all(|&c| c == first) && consistent.map_or(true, |(_, n)| first > n) {
            consistent = Some((delimiter, first));
        }
    }

    consistent
        .or(widest_header)
        .map(|(d, _)| d)
        .unwrap_or(b',')
}

fn is_blank(record: &StringRecord) -> bool {
    record.iter().all(|field| field.trim().is_empty())
}

fn to_raw_record(headers: &[String], record: &StringRecord) -> RawRecord {
    let mut raw = RawRecord::with_capacity(headers.len());
    for (name, cell) in headers.iter().zip(record.iter()) {
        // First occurrence of a duplicated header wins.
        raw.entry(name.clone()).or_insert_with(|| parse_value(cell));
    }
    raw
}

/// Type a single cell: empty → `Null`, numeric → `Number`, else `Text`.
pub fn parse_value(cell: &str) -> RawValue {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return RawValue::Null;
    }
    if looks_numeric(trimmed) {
        if let Ok(value) = trimmed.parse::<f64>() {
            if value.is_finite() && value.abs() <= MAX_SAFE_INTEGER {
                return RawValue::Number(value);
            }
        }
    }
    RawValue::Text(cell.to_string())
}

/// Plain decimal or scientific notation, optionally negative.
///
/// Zero-padded integers such as `00123` are rejected so store and SKU codes
/// keep their padding.
fn looks_numeric(s: &str) -> bool {
    let unsigned = s.strip_prefix('-').unwrap_or(s);
    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(i) => (&unsigned[..i], Some(&unsigned[i + 1..])),
        None => (unsigned, None),
    };

    let mut digits = 0usize;
    let mut dots = 0usize;
    for c in mantissa.chars() {
        match c {
            '0'..='9' => digits += 1,
            '.' => dots += 1,
            _ => return false,
        }
    }
    if digits == 0 || dots > 1 {
        return false;
    }

    let bytes = mantissa.as_bytes();
    if bytes.len() > 1 && bytes[0] == b'0' && bytes[1].is_ascii_digit() {
        return false;
    }

    match exponent {
        None => true,
        Some(exp) => {
            let exp = exp.strip_prefix(['+', '-']).unwrap_or(exp);
            !exp.is_empty() && exp.chars().all(|c| c.is_ascii_digit())
        }
    }
}
