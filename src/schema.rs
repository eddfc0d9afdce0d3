//! Sheet schemas: headers, column layout and row extraction
//!
//! Implement [`SheetSchema`] directly, or assemble a [`ColumnSchema`] from closures:
//!
//! ```
//! use sheetstream::schema::{SchemaBuilder, SheetSchema};
//!
//! struct Order {
//!     id: u64,
//!     customer: String,
//!     amount: f64,
//! }
//!
//! let schema = SchemaBuilder::<Order>::new("Orders")
//!     .column("Order ID", 20, |o| o.id.into())
//!     .column("Customer", 15, |o| o.customer.as_str().into())
//!     .column_with_pattern("Amount", 15, "#,##0.00", |o| o.amount.into())
//!     .build();
//!
//! assert_eq!(schema.headers(), ["Order ID", "Customer", "Amount"]);
//! ```

use crate::types::CellValue;

/// Width used for columns without an explicit width, in characters
pub const DEFAULT_COLUMN_WIDTH: u32 = 15;

/// Describes how entities of type `T` map onto one worksheet
///
/// `to_row` must return exactly `headers().len()` values for every entity.
pub trait SheetSchema<T>: Send + Sync {
    fn sheet_name(&self) -> &str;

    /// Column headers in display order (duplicates allowed)
    fn headers(&self) -> &[String];

    /// Column widths in characters; shorter lists are padded with [`DEFAULT_COLUMN_WIDTH`]
    fn column_widths(&self) -> Vec<u32>;

    /// Per-column number format patterns; may be shorter than `headers()`
    fn column_patterns(&self) -> Vec<Option<String>> {
        Vec::new()
    }

    fn to_row(&self, entity: &T) -> Vec<CellValue>;
}

/// Column widths padded (never truncated) to the header count
pub fn resolved_column_widths<T, S>(schema: &S) -> Vec<u32>
where
    S: SheetSchema<T> + ?Sized,
{
    let mut widths = schema.column_widths();
    let headers = schema.headers().len();
    if widths.len() < headers {
        widths.resize(headers, DEFAULT_COLUMN_WIDTH);
    }
    widths
}

type Extractor<T> = Box<dyn Fn(&T) -> CellValue + Send + Sync>;

struct Column<T> {
    width: u32,
    pattern: Option<String>,
    extractor: Extractor<T>,
}

/// Closure-based schema; one extractor per column keeps rows and headers aligned
pub struct ColumnSchema<T> {
    sheet_name: String,
    headers: Vec<String>,
    columns: Vec<Column<T>>,
}

impl<T> SheetSchema<T> for ColumnSchema<T> {
    fn sheet_name(&self) -> &str {
        &self.sheet_name
    }

    fn headers(&self) -> &[String] {
        &self.headers
    }

    fn column_widths(&self) -> Vec<u32> {
        self.columns.iter().map(|c| c.width).collect()
    }

    fn column_patterns(&self) -> Vec<Option<String>> {
        self.columns.iter().map(|c| c.pattern.clone()).collect()
    }

    fn to_row(&self, entity: &T) -> Vec<CellValue> {
        self.columns.iter().map(|c| (c.extractor)(entity)).collect()
    }
}

/// Builder for [`ColumnSchema`]
pub struct SchemaBuilder<T> {
    sheet_name: String,
    headers: Vec<String>,
    columns: Vec<Column<T>>,
}

impl<T> SchemaBuilder<T> {
    pub fn new(sheet_name: impl Into<String>) -> Self {
        SchemaBuilder {
            sheet_name: sheet_name.into(),
            headers: Vec::new(),
            columns: Vec::new(),
        }
    }

    /// Add a column
    pub fn column<F>(self, header: impl Into<String>, width: u32, extractor: F) -> Self
    where
        F: Fn(&T) -> CellValue + Send + Sync + 'static,
    {
        self.push(header.into(), width, None, Box::new(extractor))
    }

    /// Add a column with an explicit number format (e.g. `#,##0.00`, `dd/mm/yyyy`)
    pub fn column_with_pattern<F>(
        self,
        header: impl Into<String>,
        width: u32,
        pattern: impl Into<String>,
        extractor: F,
    ) -> Self
    where
        F: Fn(&T) -> CellValue + Send + Sync + 'static,
    {
        self.push(header.into(), width, Some(pattern.into()), Box::new(extractor))
    }

    fn push(
        mut self,
        header: String,
        width: u32,
        pattern: Option<String>,
        extractor: Extractor<T>,
    ) -> Self {
        self.headers.push(header);
        self.columns.push(Column {
            width,
            pattern,
            extractor,
        });
        self
    }

    pub fn build(self) -> ColumnSchema<T> {
        ColumnSchema {
            sheet_name: self.sheet_name,
            headers: self.headers,
            columns: self.columns,
        }
    }
}
