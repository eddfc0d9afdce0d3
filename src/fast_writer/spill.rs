//! Temp file holding serialized rows that left the resident window

use super::xml_writer::XmlWriter;
use crate::error::{ExportError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Sink behind the spill writer, optionally gzip-compressed
pub enum SpillSink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Write for SpillSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SpillSink::Plain(w) => w.write(buf),
            SpillSink::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SpillSink::Plain(w) => w.flush(),
            SpillSink::Gzip(w) => w.flush(),
        }
    }
}

impl SpillSink {
    fn finish(self) -> io::Result<()> {
        let mut inner = match self {
            SpillSink::Plain(w) => w,
            SpillSink::Gzip(w) => w.finish()?,
        };
        inner.flush()
    }
}

/// Append-only spill file; read back once when the workbook is packaged
pub struct SpillFile {
    file: NamedTempFile,
    writer: Option<XmlWriter<SpillSink>>,
    compressed: bool,
    rows: u64,
}

impl SpillFile {
    pub fn create(compress: bool) -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("sheetstream-")
            .suffix(".xml")
            .tempfile()?;
        let handle = BufWriter::with_capacity(64 * 1024, file.reopen()?);
        let sink = if compress {
            SpillSink::Gzip(GzEncoder::new(handle, Compression::fast()))
        } else {
            SpillSink::Plain(handle)
        };
        log::debug!(
            "Created spill file {} (compressed: {})",
            file.path().display(),
            compress
        );
        Ok(SpillFile {
            file,
            writer: Some(XmlWriter::new(sink)),
            compressed: compress,
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Writer for appending row XML
    pub fn writer(&mut self) -> Result<&mut XmlWriter<SpillSink>> {
        self.writer
            .as_mut()
            .ok_or_else(|| ExportError::Write("spill file already finished".to_string()))
    }

    pub(crate) fn record_row(&mut self) {
        self.rows += 1;
    }

    /// Rows appended so far
    pub fn rows_spilled(&self) -> u64 {
        self.rows
    }

    /// Push buffered row XML down to the file
    pub fn flush(&mut self) -> Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }

    /// Finish writing and copy the spilled XML into `out`
    pub fn copy_into<W: Write>(&mut self, out: &mut W) -> Result<u64> {
        if let Some(writer) = self.writer.take() {
            writer.into_inner()?.finish()?;
        }
        let reader = BufReader::with_capacity(64 * 1024, self.file.reopen()?);
        let copied = if self.compressed {
            io::copy(&mut GzDecoder::new(reader), out)?
        } else {
            let mut reader = reader;
            io::copy(&mut reader, out)?
        };
        Ok(copied)
    }

    /// Delete the file from disk
    pub fn dispose(self) -> Result<()> {
        let path = self.file.path().to_path_buf();
        drop(self.writer);
        self.file.close().map_err(|e| ExportError::ResourceCleanup {
            resource: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spill_roundtrip(compress: bool) -> Result<()> {
        let mut spill = SpillFile::create(compress)?;
        assert!(spill.path().exists());

        for i in 0..3 {
            let writer = spill.writer()?;
            writer.start_element("row")?;
            writer.attribute_int("r", i + 1)?;
            writer.close_empty_tag()?;
            spill.record_row();
        }
        spill.flush()?;
        assert_eq!(spill.rows_spilled(), 3);

        let mut out = Vec::new();
        spill.copy_into(&mut out)?;
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "<row r=\"1\"/><row r=\"2\"/><row r=\"3\"/>"
        );

        let path = spill.path().to_path_buf();
        spill.dispose()?;
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_plain_spill() -> Result<()> {
        spill_roundtrip(false)
    }

    #[test]
    fn test_gzip_spill() -> Result<()> {
        spill_roundtrip(true)
    }
}
