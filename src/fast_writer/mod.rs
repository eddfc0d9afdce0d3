//! Minimal XLSX writer with a bounded memory footprint
//!
//! Only what the export engine needs:
//! - one worksheet with a resident row window and a (optionally gzip) spill file
//! - inline strings, numbers, booleans and dates
//! - column widths, number formats, header and border styles
//! - ZIP packaging into any `Write + Seek` sink
//!
//! ```
//! use sheetstream::fast_writer::{Cell, StreamingWorkbook};
//! use sheetstream::CellValue;
//! use std::io::Cursor;
//!
//! let mut workbook = StreamingWorkbook::new(100, true);
//! let sheet = workbook.create_sheet("Sheet1")?;
//! sheet.append_row(0, vec![Cell::new("Name".into(), 0), Cell::new("Age".into(), 0)])?;
//! sheet.append_row(1, vec![Cell::new("Alice".into(), 0), Cell::new(CellValue::Int(30), 0)])?;
//!
//! let bytes = workbook.write_to(Cursor::new(Vec::new()))?.into_inner();
//! workbook.dispose()?;
//! assert!(!bytes.is_empty());
//! # Ok::<(), sheetstream::ExportError>(())
//! ```

pub mod spill;
pub mod styles;
pub mod workbook;
pub mod worksheet;
pub mod xml_writer;

pub use styles::{CellStyle, StyleSheet};
pub use workbook::StreamingWorkbook;
pub use worksheet::{Cell, SheetWindow, EXCEL_MAX_COLUMNS, EXCEL_MAX_ROWS};
pub use xml_writer::XmlWriter;
