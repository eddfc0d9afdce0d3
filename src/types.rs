//! Type definitions for spreadsheet cells

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone};
use std::fmt;

/// Default number format applied to date cells without an explicit column pattern
pub const DEFAULT_DATE_PATTERN: &str = "yyyy-mm-dd";

/// Default number format applied to date-time cells without an explicit column pattern
pub const DEFAULT_DATETIME_PATTERN: &str = "yyyy-mm-dd hh:mm:ss";

/// Represents a single cell value produced by a schema
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    /// Empty cell
    Empty,
    /// String value
    String(String),
    /// Integer value
    Int(i64),
    /// Float value
    Float(f64),
    /// Boolean value
    Bool(bool),
    /// Calendar date without time
    Date(NaiveDate),
    /// Date with time of day
    DateTime(NaiveDateTime),
}

impl CellValue {
    /// String cell from any displayable value (fallback for non-primitive leaves)
    pub fn text(value: impl fmt::Display) -> Self {
        CellValue::String(value.to_string())
    }

    /// Check if cell is empty
    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    /// Whether the value is a date or date-time
    pub fn is_temporal(&self) -> bool {
        matches!(self, CellValue::Date(_) | CellValue::DateTime(_))
    }

    /// Type-based default number format, if any
    pub fn default_pattern(&self) -> Option<&'static str> {
        match self {
            CellValue::Date(_) => Some(DEFAULT_DATE_PATTERN),
            CellValue::DateTime(_) => Some(DEFAULT_DATETIME_PATTERN),
            _ => None,
        }
    }

    /// Convert cell value to string
    pub fn as_string(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::String(s) => s.clone(),
            CellValue::Int(i) => i.to_string(),
            CellValue::Float(f) => f.to_string(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Date(d) => d.to_string(),
            CellValue::DateTime(d) => d.to_string(),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::String(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::String(s)
    }
}

impl From<&String> for CellValue {
    fn from(s: &String) -> Self {
        CellValue::String(s.clone())
    }
}

macro_rules! int_cell {
    ($($t:ty),*) => {
        $(impl From<$t> for CellValue {
            fn from(i: $t) -> Self {
                CellValue::Int(i64::from(i))
            }
        })*
    };
}

int_cell!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for CellValue {
    fn from(i: u64) -> Self {
        match i64::try_from(i) {
            Ok(v) => CellValue::Int(v),
            Err(_) => CellValue::Float(i as f64),
        }
    }
}

impl From<usize> for CellValue {
    fn from(i: usize) -> Self {
        CellValue::from(i as u64)
    }
}

impl From<f32> for CellValue {
    fn from(f: f32) -> Self {
        CellValue::Float(f64::from(f))
    }
}

impl From<f64> for CellValue {
    fn from(f: f64) -> Self {
        CellValue::Float(f)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::Bool(b)
    }
}

impl From<NaiveDate> for CellValue {
    fn from(d: NaiveDate) -> Self {
        CellValue::Date(d)
    }
}

impl From<NaiveDateTime> for CellValue {
    fn from(d: NaiveDateTime) -> Self {
        CellValue::DateTime(d)
    }
}

impl<Tz: TimeZone> From<DateTime<Tz>> for CellValue {
    fn from(d: DateTime<Tz>) -> Self {
        CellValue::DateTime(d.naive_local())
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(CellValue::Empty)
    }
}

/// Convert a 0-based column index to its letter (0 -> A, 25 -> Z, 26 -> AA)
pub fn col_to_letter(col: u32) -> String {
    let mut result = String::new();
    let mut col = col + 1;

    while col > 0 {
        col -= 1;
        result.insert(0, (b'A' + (col % 26) as u8) as char);
        col /= 26;
    }

    result
}

/// Excel-style cell reference for 0-based row/column indices (e.g. "A1", "B2")
pub fn cell_reference(row: u32, col: u32) -> String {
    format!("{}{}", col_to_letter(col), row + 1)
}

/// Excel serial day number for a date (1900 date system, 1900-03-01 onwards)
pub fn excel_serial_date(date: NaiveDate) -> f64 {
    // 1899-12-30 absorbs the fictitious 1900-02-29
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30).unwrap_or(NaiveDate::MIN);
    (date - epoch).num_days() as f64
}

/// Excel serial number for a date-time: whole days plus the fraction of the day
pub fn excel_serial_datetime(datetime: NaiveDateTime) -> f64 {
    let midnight = datetime.date().and_hms_opt(0, 0, 0).unwrap_or(datetime);
    let millis = (datetime - midnight).num_milliseconds() as f64;
    excel_serial_date(datetime.date()) + millis / 86_400_000.0
}
