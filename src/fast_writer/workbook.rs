//! Streaming workbook packaged into an XLSX container

use super::styles::StyleSheet;
use super::worksheet::SheetWindow;
use super::xml_writer::XmlWriter;
use crate::error::{ExportError, Result};
use std::io::{Seek, Write};
use zip::write::{FileOptions, ZipWriter};
use zip::CompressionMethod;

/// Single-sheet workbook with a bounded memory footprint
///
/// Rows go through [`SheetWindow`], so memory stays proportional to the window size no
/// matter how many rows are written. Call [`dispose`](Self::dispose) when done, whether
/// packaging succeeded or not, to remove the spill file.
pub struct StreamingWorkbook {
    sheet: Option<SheetWindow>,
    styles: StyleSheet,
    window_size: usize,
    compress_temp_files: bool,
}

impl StreamingWorkbook {
    pub fn new(window_size: usize, compress_temp_files: bool) -> Self {
        StreamingWorkbook {
            sheet: None,
            styles: StyleSheet::new(),
            window_size,
            compress_temp_files,
        }
    }

    /// Create the (only) worksheet
    pub fn create_sheet(&mut self, name: &str) -> Result<&mut SheetWindow> {
        if self.sheet.is_some() {
            return Err(ExportError::Write(
                "workbook already has a worksheet".to_string(),
            ));
        }
        let sheet = SheetWindow::new(name, self.window_size, self.compress_temp_files)?;
        Ok(self.sheet.insert(sheet))
    }

    pub fn sheet_mut(&mut self) -> Result<&mut SheetWindow> {
        self.sheet
            .as_mut()
            .ok_or_else(|| ExportError::Write("No active worksheet".to_string()))
    }

    pub fn styles_mut(&mut self) -> &mut StyleSheet {
        &mut self.styles
    }

    /// Package the workbook into `output` and return it
    pub fn write_to<W: Write + Seek>(&mut self, output: W) -> Result<W> {
        let sheet = self
            .sheet
            .as_mut()
            .ok_or_else(|| ExportError::Write("No active worksheet".to_string()))?;

        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(6));
        let mut zip = ZipWriter::new(output);

        zip.start_file("[Content_Types].xml", options)?;
        zip.write_all(CONTENT_TYPES.as_bytes())?;

        zip.start_file("_rels/.rels", options)?;
        zip.write_all(ROOT_RELS.as_bytes())?;

        zip.start_file("docProps/core.xml", options)?;
        write_core_props(&mut zip)?;

        zip.start_file("docProps/app.xml", options)?;
        zip.write_all(APP_PROPS.as_bytes())?;

        zip.start_file("xl/workbook.xml", options)?;
        {
            let mut xml = XmlWriter::new(&mut zip);
            xml.write_str("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n")?;
            xml.start_element("workbook")?;
            xml.attribute(
                "xmlns",
                "http://schemas.openxmlformats.org/spreadsheetml/2006/main",
            )?;
            xml.attribute(
                "xmlns:r",
                "http://schemas.openxmlformats.org/officeDocument/2006/relationships",
            )?;
            xml.close_start_tag()?;
            xml.write_str("<sheets>")?;
            xml.start_element("sheet")?;
            xml.attribute("name", sheet.name())?;
            xml.attribute_int("sheetId", 1)?;
            xml.attribute("r:id", "rId1")?;
            xml.close_empty_tag()?;
            xml.write_str("</sheets>")?;
            xml.end_element("workbook")?;
            xml.flush()?;
        }

        zip.start_file("xl/_rels/workbook.xml.rels", options)?;
        zip.write_all(WORKBOOK_RELS.as_bytes())?;

        zip.start_file("xl/styles.xml", options)?;
        {
            let mut xml = XmlWriter::new(&mut zip);
            self.styles.write_xml(&mut xml)?;
            xml.flush()?;
        }

        // near the row cap the sheet part can pass 4 GiB uncompressed
        zip.start_file("xl/worksheets/sheet1.xml", options.large_file(true))?;
        sheet.write_part(&mut zip)?;

        let mut output = zip.finish()?;
        output.flush()?;
        Ok(output)
    }

    /// Remove temp files; failures are reported, never panics
    pub fn dispose(&mut self) -> Result<()> {
        match self.sheet.as_mut() {
            Some(sheet) => sheet.dispose(),
            None => Ok(()),
        }
    }
}

fn write_core_props<W: Write>(writer: &mut W) -> Result<()> {
    let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<cp:coreProperties xmlns:cp="http://schemas.openxmlformats.org/package/2006/metadata/core-properties" xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:dcterms="http://purl.org/dc/terms/" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
<dc:creator>sheetstream</dc:creator>
<dcterms:created xsi:type="dcterms:W3CDTF">{now}</dcterms:created>
<dcterms:modified xsi:type="dcterms:W3CDTF">{now}</dcterms:modified>
</cp:coreProperties>"#
    );
    writer.write_all(xml.as_bytes())?;
    Ok(())
}

const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">
<Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>
<Default Extension="xml" ContentType="application/xml"/>
<Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/>
<Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>
<Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/>
<Override PartName="/docProps/core.xml" ContentType="application/vnd.openxmlformats-package.core-properties+xml"/>
<Override PartName="/docProps/app.xml" ContentType="application/vnd.openxmlformats-officedocument.extended-properties+xml"/>
</Types>"#;

const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/>
<Relationship Id="rId2" Type="http://schemas.openxmlformats.org/package/2006/relationships/metadata/core-properties" Target="docProps/core.xml"/>
<Relationship Id="rId3" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/extended-properties" Target="docProps/app.xml"/>
</Relationships>"#;

const APP_PROPS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Properties xmlns="http://schemas.openxmlformats.org/officeDocument/2006/extended-properties">
<Application>sheetstream</Application>
<DocSecurity>0</DocSecurity>
<ScaleCrop>false</ScaleCrop>
<LinksUpToDate>false</LinksUpToDate>
<SharedDoc>false</SharedDoc>
<HyperlinksChanged>false</HyperlinksChanged>
</Properties>"#;

const WORKBOOK_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/>
<Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/>
</Relationships>"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fast_writer::{Cell, CellStyle};
    use crate::types::CellValue;
    use std::io::{Cursor, Read};

    #[test]
    fn test_workbook_package() -> Result<()> {
        let mut workbook = StreamingWorkbook::new(1, true);
        let bold = workbook.styles_mut().register(&CellStyle {
            header: true,
            ..CellStyle::default()
        });
        {
            let sheet = workbook.create_sheet("People")?;
            sheet.append_row(0, vec![Cell::new("Name".into(), bold)])?;
            sheet.append_row(1, vec![Cell::new("Alice".into(), 0)])?;
            sheet.append_row(2, vec![Cell::new("Bob".into(), 0)])?;
        }

        let bytes = workbook.write_to(Cursor::new(Vec::new()))?.into_inner();
        workbook.dispose()?;

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
        for part in [
            "[Content_Types].xml",
            "_rels/.rels",
            "xl/workbook.xml",
            "xl/_rels/workbook.xml.rels",
            "xl/styles.xml",
        ] {
            assert!(archive.by_name(part).is_ok(), "missing {part}");
        }

        let mut workbook_xml = String::new();
        archive
            .by_name("xl/workbook.xml")?
            .read_to_string(&mut workbook_xml)?;
        assert!(workbook_xml.contains("<sheet name=\"People\" sheetId=\"1\" r:id=\"rId1\"/>"));

        let mut sheet_xml = String::new();
        archive
            .by_name("xl/worksheets/sheet1.xml")?
            .read_to_string(&mut sheet_xml)?;
        let alice = sheet_xml.find("Alice").unwrap();
        let bob = sheet_xml.find("Bob").unwrap();
        assert!(sheet_xml.find("Name").unwrap() < alice && alice < bob);
        Ok(())
    }

    /// Extra field bytes of the local header written for `name`
    fn local_extra_field<'a>(bytes: &'a [u8], name: &str) -> &'a [u8] {
        let header = bytes
            .windows(4)
            .enumerate()
            .filter(|(_, w)| *w == [0x50, 0x4b, 0x03, 0x04])
            .map(|(i, _)| i)
            .find(|&i| {
                let name_len = u16::from_le_bytes([bytes[i + 26], bytes[i + 27]]) as usize;
                &bytes[i + 30..i + 30 + name_len] == name.as_bytes()
            })
            .unwrap();
        let name_len = u16::from_le_bytes([bytes[header + 26], bytes[header + 27]]) as usize;
        let extra_len = u16::from_le_bytes([bytes[header + 28], bytes[header + 29]]) as usize;
        let start = header + 30 + name_len;
        &bytes[start..start + extra_len]
    }

    #[test]
    fn test_sheet_part_allows_zip64() -> Result<()> {
        let mut workbook = StreamingWorkbook::new(10, false);
        workbook
            .create_sheet("Big")?
            .append_row(0, vec![Cell::new("x".into(), 0)])?;
        let bytes = workbook.write_to(Cursor::new(Vec::new()))?.into_inner();
        workbook.dispose()?;

        let sheet_extra = local_extra_field(&bytes, "xl/worksheets/sheet1.xml");
        assert_eq!(&sheet_extra[..2], &[0x01, 0x00]);
        assert!(local_extra_field(&bytes, "xl/styles.xml").is_empty());

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
        let mut sheet_xml = String::new();
        archive
            .by_name("xl/worksheets/sheet1.xml")?
            .read_to_string(&mut sheet_xml)?;
        assert!(sheet_xml.contains("<t>x</t>"));
        Ok(())
    }

    #[test]
    fn test_second_sheet_rejected() -> Result<()> {
        let mut workbook = StreamingWorkbook::new(10, false);
        workbook.create_sheet("One")?;
        assert!(workbook.create_sheet("Two").is_err());
        workbook.dispose()
    }
}
