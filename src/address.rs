//! A1-notation cell and range addresses.
//!
//! The shared store is addressed the way spreadsheets are: a column made of
//! letters, a 1-based row number, and an optional sheet prefix separated by
//! `!`. Sheet names that contain anything other than ASCII alphanumerics and
//! underscores are quoted with single quotes (`'My Sheet'!B5`), and a quote
//! inside a quoted name is doubled.
//!
//! # Examples
//!
//! ```
//! use sheetrelay::address::{CellAddress, CellRange};
//!
//! let cell: CellAddress = "Prompts!C5".parse().unwrap();
//! assert_eq!(cell.sheet.as_deref(), Some("Prompts"));
//! assert_eq!(cell.column, 2);
//! assert_eq!(cell.row, 5);
//! assert_eq!(cell.to_string(), "Prompts!C5");
//!
//! let range: CellRange = "'Q3 data'!B5:D7".parse().unwrap();
//! assert_eq!(range.width(), 3);
//! assert_eq!(range.height(), 3);
//! assert_eq!(range.to_string(), "'Q3 data'!B5:D7");
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Errors produced while parsing addresses or column names.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// The column part is empty or contains non-letters.
    #[error("invalid column name '{0}'")]
    InvalidColumn(String),

    /// The row part is missing, zero, or not a number.
    #[error("invalid row in '{0}'")]
    InvalidRow(String),

    /// The address does not have the `[sheet!]A1` shape.
    #[error("malformed address '{0}'")]
    Malformed(String),

    /// A range whose two corners name different sheets.
    #[error("range '{0}' spans two sheets")]
    SheetMismatch(String),
}

/// Converts a column name (`A`, `Z`, `AA`, ...) to a 0-based index.
///
/// Lowercase letters are accepted.
///
/// ```
/// use sheetrelay::address::column_index;
///
/// assert_eq!(column_index("A").unwrap(), 0);
/// assert_eq!(column_index("z").unwrap(), 25);
/// assert_eq!(column_index("AA").unwrap(), 26);
/// assert!(column_index("A1").is_err());
/// ```
pub fn column_index(name: &str) -> Result<u32, AddressError> {
    if name.is_empty() || name.len() > 6 {
        return Err(AddressError::InvalidColumn(name.to_string()));
    }
    let mut index: u32 = 0;
    for ch in name.chars() {
        if !ch.is_ascii_alphabetic() {
            return Err(AddressError::InvalidColumn(name.to_string()));
        }
        let digit = u32::from(ch.to_ascii_uppercase() as u8 - b'A') + 1;
        index = index * 26 + digit;
    }
    Ok(index - 1)
}

/// Converts a 0-based column index back to its letter name.
///
/// ```
/// use sheetrelay::address::column_name;
///
/// assert_eq!(column_name(0), "A");
/// assert_eq!(column_name(27), "AB");
/// ```
pub fn column_name(index: u32) -> String {
    let mut n = u64::from(index) + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = ((n - 1) % 26) as u8;
        letters.push(char::from(b'A' + rem));
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

fn needs_quotes(sheet: &str) -> bool {
    sheet.is_empty() || !sheet.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn write_sheet(f: &mut fmt::Formatter<'_>, sheet: &Option<String>) -> fmt::Result {
    match sheet {
        Some(name) if needs_quotes(name) => write!(f, "'{}'!", name.replace('\'', "''")),
        Some(name) => write!(f, "{name}!"),
        None => Ok(()),
    }
}

/// Splits `[sheet!]rest` into the unquoted sheet name and the remainder.
fn split_sheet(input: &str) -> Result<(Option<String>, &str), AddressError> {
    if let Some(stripped) = input.strip_prefix('\'') {
        // Quoted sheet: find the closing quote that is not doubled.
        let mut name = String::new();
        let mut chars = stripped.char_indices().peekable();
        while let Some((i, ch)) = chars.next() {
            if ch == '\'' {
                if matches!(chars.peek(), Some((_, '\''))) {
                    name.push('\'');
                    chars.next();
                    continue;
                }
                let rest = &stripped[i + 1..];
                let rest = rest
                    .strip_prefix('!')
                    .ok_or_else(|| AddressError::Malformed(input.to_string()))?;
                return Ok((Some(name), rest));
            }
            name.push(ch);
        }
        return Err(AddressError::Malformed(input.to_string()));
    }

    match input.split_once('!') {
        Some((sheet, rest)) if !sheet.is_empty() => Ok((Some(sheet.to_string()), rest)),
        Some(_) => Err(AddressError::Malformed(input.to_string())),
        None => Ok((None, input)),
    }
}

fn parse_a1(input: &str, whole: &str) -> Result<(u32, u32), AddressError> {
    let split = input
        .find(|c: char| c.is_ascii_digit())
        .ok_or_else(|| AddressError::InvalidRow(whole.to_string()))?;
    let (letters, digits) = input.split_at(split);
    let column = column_index(letters)?;
    let row: u32 = digits
        .parse()
        .map_err(|_| AddressError::InvalidRow(whole.to_string()))?;
    if row == 0 {
        return Err(AddressError::InvalidRow(whole.to_string()));
    }
    Ok((column, row))
}

/// A single cell in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CellAddress {
    /// Optional sheet (tab) name.
    pub sheet: Option<String>,
    /// 0-based column index.
    pub column: u32,
    /// 1-based row number.
    pub row: u32,
}

impl CellAddress {
    /// Builds an address from a sheet, a column name, and a row.
    pub fn new(sheet: Option<&str>, column: &str, row: u32) -> Result<Self, AddressError> {
        if row == 0 {
            return Err(AddressError::InvalidRow(format!("{column}{row}")));
        }
        Ok(Self {
            sheet: sheet.map(str::to_string),
            column: column_index(column)?,
            row,
        })
    }

    /// Builds an address from already-resolved indices.
    pub fn from_indices(sheet: Option<String>, column: u32, row: u32) -> Self {
        Self { sheet, column, row }
    }

    /// Returns the column letters of this address.
    pub fn column_name(&self) -> String {
        column_name(self.column)
    }
}

impl fmt::Display for CellAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_sheet(f, &self.sheet)?;
        write!(f, "{}{}", column_name(self.column), self.row)
    }
}

impl FromStr for CellAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (sheet, a1) = split_sheet(trimmed)?;
        if a1.contains(':') {
            return Err(AddressError::Malformed(trimmed.to_string()));
        }
        let (column, row) = parse_a1(a1, trimmed)?;
        Ok(Self { sheet, column, row })
    }
}

impl TryFrom<String> for CellAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CellAddress> for String {
    fn from(value: CellAddress) -> Self {
        value.to_string()
    }
}

/// A rectangular block of cells, inclusive on both corners.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellRange {
    /// Optional sheet (tab) name shared by both corners.
    pub sheet: Option<String>,
    /// First column (0-based).
    pub start_column: u32,
    /// First row (1-based).
    pub start_row: u32,
    /// Last column (0-based, inclusive).
    pub end_column: u32,
    /// Last row (1-based, inclusive).
    pub end_row: u32,
}

impl CellRange {
    /// Builds a range, normalizing the corners so start <= end.
    pub fn new(sheet: Option<String>, a: (u32, u32), b: (u32, u32)) -> Self {
        Self {
            sheet,
            start_column: a.0.min(b.0),
            start_row: a.1.min(b.1),
            end_column: a.0.max(b.0),
            end_row: a.1.max(b.1),
        }
    }

    /// A single-column range spanning `first_row..=last_row`.
    pub fn column(sheet: Option<String>, column: u32, first_row: u32, last_row: u32) -> Self {
        Self::new(sheet, (column, first_row), (column, last_row))
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        (self.end_column - self.start_column + 1) as usize
    }

    /// Number of rows.
    pub fn height(&self) -> usize {
        (self.end_row - self.start_row + 1) as usize
    }

    /// Returns `true` if the cell lies inside this range.
    pub fn contains(&self, cell: &CellAddress) -> bool {
        cell.sheet == self.sheet
            && (self.start_column..=self.end_column).contains(&cell.column)
            && (self.start_row..=self.end_row).contains(&cell.row)
    }

    /// Iterates every cell in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = CellAddress> + '_ {
        (self.start_row..=self.end_row).flat_map(move |row| {
            (self.start_column..=self.end_column)
                .map(move |column| CellAddress::from_indices(self.sheet.clone(), column, row))
        })
    }
}

impl fmt::Display for CellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_sheet(f, &self.sheet)?;
        write!(
            f,
            "{}{}:{}{}",
            column_name(self.start_column),
            self.start_row,
            column_name(self.end_column),
            self.end_row
        )
    }
}

impl FromStr for CellRange {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (sheet, body) = split_sheet(trimmed)?;
        let (first, second) = match body.split_once(':') {
            Some((a, b)) => (a, b),
            None => (body, body),
        };
        // Allow a redundant sheet prefix on the second corner (`S!A1:S!B2`).
        let second = match split_sheet(second)? {
            (Some(other), rest) if Some(&other) == sheet.as_ref() => rest,
            (Some(_), _) => return Err(AddressError::SheetMismatch(trimmed.to_string())),
            (None, rest) => rest,
        };
        let a = parse_a1(first, trimmed)?;
        let b = parse_a1(second, trimmed)?;
        Ok(Self::new(sheet, a, b))
    }
}
