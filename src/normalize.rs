//! Raw sheet rows to typed records
//!
//! Pricing tab: A item name, B price, C currency, D unit, E category.
//! Shipping tab: A zone or method, B price.
//!
//! Malformed rows are skipped and reported, never fatal. When a key appears
//! more than once the last row wins.

use anyhow::bail;
use bigdecimal::num_bigint::Sign;
use bigdecimal::{BigDecimal, RoundingMode};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::types::{PriceRecord, ShippingRecord};

/// Fractional digits kept for every price
pub const PRICE_SCALE: i64 = 2;
/// Prices with more digits than this before the decimal point are rejected
pub const MAX_PRICE_INTEGER_DIGITS: i64 = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MissingKey,
    MissingPrice,
    InvalidPrice(String),
    NegativePrice(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingKey => write!(f, "empty key"),
            SkipReason::MissingPrice => write!(f, "empty price"),
            SkipReason::InvalidPrice(raw) => write!(f, "non-numeric price '{}'", raw),
            SkipReason::NegativePrice(raw) => write!(f, "negative price '{}'", raw),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRow {
    /// 1-based row number as shown in the spreadsheet
    pub row: usize,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized<T> {
    pub records: BTreeMap<String, T>,
    pub skipped: Vec<SkippedRow>,
}

impl<T> Normalized<T> {
    fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            skipped: Vec::new(),
        }
    }

    fn skip(&mut self, sheet: &str, row: usize, reason: SkipReason) {
        warn!("{} row {}: skipped ({})", sheet, row, reason);
        self.skipped.push(SkippedRow { row, reason });
    }

    fn insert(&mut self, sheet: &str, row: usize, key: String, record: T) {
        if self.records.insert(key.clone(), record).is_some() {
            warn!(
                "{} row {}: duplicate key '{}', replacing the earlier row",
                sheet, row, key
            );
        }
    }
}

/// Parse a price cell. Rounds half-even to `PRICE_SCALE` digits.
pub fn parse_price(raw: &str) -> Result<BigDecimal, SkipReason> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SkipReason::MissingPrice);
    }
    let value = BigDecimal::from_str(trimmed)
        .map_err(|_| SkipReason::InvalidPrice(trimmed.to_string()))?;
    match value.sign() {
        Sign::Minus => return Err(SkipReason::NegativePrice(trimmed.to_string())),
        Sign::NoSign => return Ok(BigDecimal::from(0).with_scale(PRICE_SCALE)),
        Sign::Plus => {}
    }

    // Checked on the exponent before rounding, which expands every digit
    let (_, scale) = value.as_bigint_and_exponent();
    let integer_digits = (value.digits() as i64).saturating_sub(scale);
    if integer_digits > MAX_PRICE_INTEGER_DIGITS {
        return Err(SkipReason::InvalidPrice(trimmed.to_string()));
    }
    if integer_digits < -PRICE_SCALE {
        // Every significant digit sits below the rounding position
        return Ok(BigDecimal::from(0).with_scale(PRICE_SCALE));
    }
    Ok(value.with_scale_round(PRICE_SCALE, RoundingMode::HalfEven))
}

fn cell(row: &[String], index: usize) -> &str {
    row.get(index).map(|c| c.trim()).unwrap_or("")
}

fn optional_cell(row: &[String], index: usize) -> Option<String> {
    let value = cell(row, index);
    (!value.is_empty()).then(|| value.to_string())
}

fn is_blank(row: &[String]) -> bool {
    row.iter().all(|c| c.trim().is_empty())
}

/// Shared walk over data rows: drops headers and blank rows, extracts key and price
fn normalize_rows<T>(
    sheet: &str,
    rows: &[Vec<String>],
    header_rows: usize,
    mut build: impl FnMut(&[String], String, BigDecimal) -> T,
) -> Normalized<T> {
    let mut out = Normalized::new();

    for (index, row) in rows.iter().enumerate().skip(header_rows) {
        let row_number = index + 1;
        if is_blank(row) {
            debug!("{} row {}: blank", sheet, row_number);
            continue;
        }

        let key = cell(row, 0);
        if key.is_empty() {
            out.skip(sheet, row_number, SkipReason::MissingKey);
            continue;
        }

        let price = match parse_price(cell(row, 1)) {
            Ok(price) => price,
            Err(reason) => {
                out.skip(sheet, row_number, reason);
                continue;
            }
        };

        let record = build(row, key.to_string(), price);
        out.insert(sheet, row_number, key.to_string(), record);
    }

    out
}

pub fn normalize_prices(rows: &[Vec<String>], header_rows: usize) -> Normalized<PriceRecord> {
    normalize_rows("pricing", rows, header_rows, |row, item_name, price| {
        PriceRecord {
            item_name,
            price,
            currency: optional_cell(row, 2),
            unit: optional_cell(row, 3),
            category: optional_cell(row, 4),
        }
    })
}

pub fn normalize_shipping(rows: &[Vec<String>], header_rows: usize) -> Normalized<ShippingRecord> {
    normalize_rows("shipping", rows, header_rows, |_, zone, price| {
        ShippingRecord { zone, price }
    })
}

/// A single cell addressed in A1 notation, zero-based internally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRef {
    pub row: usize,
    pub col: usize,
}

impl CellRef {
    /// Parse "D1", "AA12", ...
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(s.len());
        let (letters, digits) = s.split_at(split);
        if letters.is_empty() || letters.len() > 3 || digits.is_empty() {
            bail!("expected a cell like D1, got '{}'", s);
        }

        let col = letters
            .bytes()
            .fold(0usize, |acc, b| acc * 26 + (b.to_ascii_uppercase() - b'A' + 1) as usize);
        let row: usize = match digits.parse() {
            Ok(row) if row > 0 => row,
            _ => bail!("expected a cell like D1, got '{}'", s),
        };
        Ok(Self {
            row: row - 1,
            col: col - 1,
        })
    }
}

/// The "last updated" note kept in one cell of the pricing tab.
///
/// A leading "Updated" is dropped. Dates such as `2023-Feb-19` or
/// `2023-02-19` come back as ISO dates; anything else is returned as written.
pub fn updated_marker(rows: &[Vec<String>], cell: CellRef) -> Option<String> {
    let raw = rows.get(cell.row)?.get(cell.col)?.trim();
    let text = match raw.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("updated") => {
            raw[7..].trim_start().trim_start_matches(':').trim()
        }
        _ => raw,
    };
    if text.is_empty() {
        return None;
    }

    for format in ["%Y-%b-%d", "%Y-%m-%d", "%d %b %Y", "%d %B %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    debug!("pricing updated marker '{}' is not a date, keeping it as text", text);
    Some(text.to_string())
}
