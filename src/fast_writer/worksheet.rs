//! Worksheet with a bounded resident row window
//!
//! Rows stay in memory until the window is full; the oldest rows are then serialized into a
//! [`SpillFile`]. Packaging streams the spill file followed by the rows still resident.

use super::spill::SpillFile;
use super::xml_writer::XmlWriter;
use crate::error::{ExportError, Result};
use crate::types::{col_to_letter, excel_serial_date, excel_serial_datetime, CellValue};
use std::collections::VecDeque;
use std::io::Write;

/// Rows per worksheet supported by the XLSX format
pub const EXCEL_MAX_ROWS: u32 = 1_048_576;

/// Columns per worksheet supported by the XLSX format
pub const EXCEL_MAX_COLUMNS: usize = 16_384;

/// Value plus the index of its cell format
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub value: CellValue,
    pub style: u32,
}

impl Cell {
    pub fn new(value: CellValue, style: u32) -> Self {
        Cell { value, style }
    }
}

#[derive(Debug)]
struct Row {
    index: u32,
    cells: Vec<Cell>,
}

/// Single worksheet keeping at most `window_size` rows in memory
pub struct SheetWindow {
    name: String,
    column_widths: Vec<u32>,
    window_size: usize,
    resident: VecDeque<Row>,
    spill: Option<SpillFile>,
    column_letters: Vec<String>,
    next_index: u32,
}

impl SheetWindow {
    pub fn new(name: impl Into<String>, window_size: usize, compress: bool) -> Result<Self> {
        Ok(SheetWindow {
            name: name.into(),
            column_widths: Vec::new(),
            window_size: window_size.max(1),
            resident: VecDeque::with_capacity(window_size.max(1)),
            spill: Some(SpillFile::create(compress)?),
            column_letters: Vec::new(),
            next_index: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Widths in characters, one per column
    pub fn set_column_widths(&mut self, widths: Vec<u32>) {
        self.column_widths = widths;
    }

    pub fn resident_rows(&self) -> usize {
        self.resident.len()
    }

    /// Rows appended so far
    pub fn row_count(&self) -> u32 {
        self.next_index
    }

    /// Append the row at `index`; rows must arrive in increasing order
    ///
    /// Non-finite floats are rejected with [`ExportError::CellValue`].
    pub fn append_row(&mut self, index: u32, cells: Vec<Cell>) -> Result<()> {
        if index >= EXCEL_MAX_ROWS {
            return Err(ExportError::Write(format!(
                "row index {index} exceeds the sheet limit of {EXCEL_MAX_ROWS} rows"
            )));
        }
        if index < self.next_index {
            return Err(ExportError::Write(format!(
                "row {index} already written (next row is {})",
                self.next_index
            )));
        }
        if cells.len() > EXCEL_MAX_COLUMNS {
            return Err(ExportError::Write(format!(
                "{} columns exceed the sheet limit of {EXCEL_MAX_COLUMNS}",
                cells.len()
            )));
        }
        for (column, cell) in cells.iter().enumerate() {
            if let CellValue::Float(f) = cell.value {
                if !f.is_finite() {
                    return Err(ExportError::CellValue {
                        row: index,
                        column,
                        message: format!("{f} cannot be stored in a cell"),
                    });
                }
            }
        }

        self.resident.push_back(Row { index, cells });
        self.next_index = index + 1;
        if self.resident.len() > self.window_size {
            self.flush_rows(self.window_size)?;
        }
        Ok(())
    }

    /// Page out all but the newest `keep` rows and flush the spill file
    pub fn flush_rows(&mut self, keep: usize) -> Result<()> {
        let Some(spill) = self.spill.as_mut() else {
            return Err(ExportError::Write(format!(
                "sheet '{}' already disposed",
                self.name
            )));
        };
        while self.resident.len() > keep {
            let Some(row) = self.resident.pop_front() else {
                break;
            };
            write_row(spill.writer()?, &row, &mut self.column_letters)?;
            spill.record_row();
        }
        spill.flush()
    }

    /// Write the complete worksheet part into `out`
    pub fn write_part<W: Write>(&mut self, out: &mut W) -> Result<()> {
        let spill = self.spill.as_mut().ok_or_else(|| {
            ExportError::Write(format!("sheet '{}' already disposed", self.name))
        })?;

        let mut xml = XmlWriter::new(&mut *out);
        xml.write_str("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n")?;
        xml.start_element("worksheet")?;
        xml.attribute(
            "xmlns",
            "http://schemas.openxmlformats.org/spreadsheetml/2006/main",
        )?;
        xml.attribute(
            "xmlns:r",
            "http://schemas.openxmlformats.org/officeDocument/2006/relationships",
        )?;
        xml.close_start_tag()?;

        if self.next_index > 0 {
            let last_col = self
                .column_widths
                .len()
                .max(self.resident.iter().map(|r| r.cells.len()).max().unwrap_or(0))
                .max(1);
            xml.start_element("dimension")?;
            let last = format!(
                "A1:{}{}",
                col_to_letter(last_col as u32 - 1),
                self.next_index
            );
            xml.attribute("ref", &last)?;
            xml.close_empty_tag()?;
        }

        if !self.column_widths.is_empty() {
            xml.start_element("cols")?;
            xml.close_start_tag()?;
            for (i, width) in self.column_widths.iter().enumerate() {
                xml.start_element("col")?;
                xml.attribute_int("min", i as i64 + 1)?;
                xml.attribute_int("max", i as i64 + 1)?;
                xml.attribute_int("width", i64::from(*width))?;
                xml.attribute_int("customWidth", 1)?;
                xml.close_empty_tag()?;
            }
            xml.end_element("cols")?;
        }

        xml.start_element("sheetData")?;
        xml.close_start_tag()?;
        xml.flush()?;

        let spilled = spill.copy_into(&mut *out)?;
        log::debug!(
            "Copied {} spilled rows ({} bytes) into sheet '{}'",
            spill.rows_spilled(),
            spilled,
            self.name
        );

        let mut xml = XmlWriter::new(&mut *out);
        for row in &self.resident {
            write_row(&mut xml, row, &mut self.column_letters)?;
        }
        xml.end_element("sheetData")?;
        xml.end_element("worksheet")?;
        xml.flush()
    }

    /// Delete the spill file; safe to call more than once
    pub fn dispose(&mut self) -> Result<()> {
        self.resident.clear();
        match self.spill.take() {
            Some(spill) => spill.dispose(),
            None => Ok(()),
        }
    }
}

fn column_letter(letters: &mut Vec<String>, column: usize) -> &str {
    while letters.len() <= column {
        letters.push(col_to_letter(letters.len() as u32));
    }
    &letters[column]
}

fn write_row<W: Write>(xml: &mut XmlWriter<W>, row: &Row, letters: &mut Vec<String>) -> Result<()> {
    let row_number = i64::from(row.index) + 1;
    xml.start_element("row")?;
    xml.attribute_int("r", row_number)?;
    xml.close_start_tag()?;

    for (column, cell) in row.cells.iter().enumerate() {
        if cell.value.is_empty() && cell.style == 0 {
            continue;
        }
        xml.start_element("c")?;
        xml.write_raw(b" r=\"")?;
        xml.write_str(column_letter(letters, column))?;
        xml.write_int(row_number)?;
        xml.write_raw(b"\"")?;
        if cell.style != 0 {
            xml.attribute_int("s", i64::from(cell.style))?;
        }

        match &cell.value {
            CellValue::Empty => {
                xml.close_empty_tag()?;
                continue;
            }
            CellValue::String(s) => {
                xml.write_raw(b" t=\"inlineStr\"><is><t")?;
                if s.starts_with(char::is_whitespace) || s.ends_with(char::is_whitespace) {
                    xml.write_raw(b" xml:space=\"preserve\"")?;
                }
                xml.close_start_tag()?;
                xml.write_escaped(s)?;
                xml.write_raw(b"</t></is>")?;
            }
            CellValue::Int(i) => {
                xml.write_raw(b"><v>")?;
                xml.write_int(*i)?;
                xml.write_raw(b"</v>")?;
            }
            CellValue::Float(f) => {
                xml.write_raw(b"><v>")?;
                xml.write_float(*f)?;
                xml.write_raw(b"</v>")?;
            }
            CellValue::Bool(b) => {
                xml.write_raw(if *b { b" t=\"b\"><v>1</v>" } else { b" t=\"b\"><v>0</v>" })?;
            }
            CellValue::Date(d) => {
                xml.write_raw(b"><v>")?;
                xml.write_float(excel_serial_date(*d))?;
                xml.write_raw(b"</v>")?;
            }
            CellValue::DateTime(dt) => {
                xml.write_raw(b"><v>")?;
                xml.write_float(excel_serial_datetime(*dt))?;
                xml.write_raw(b"</v>")?;
            }
        }
        xml.end_element("c")?;
    }

    xml.end_element("row")
}
