//! Buffered XML writer with minimal allocations

use crate::error::Result;
use std::io::Write;

const FLUSH_THRESHOLD: usize = 4096;

/// XML writer that batches small writes into one buffer before hitting the sink
pub struct XmlWriter<W: Write> {
    writer: W,
    buffer: Vec<u8>,
    numbers: itoa::Buffer,
}

impl<W: Write> XmlWriter<W> {
    pub fn new(writer: W) -> Self {
        XmlWriter {
            writer,
            buffer: Vec::with_capacity(8192),
            numbers: itoa::Buffer::new(),
        }
    }

    /// Write raw bytes without escaping
    #[inline]
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        self.maybe_flush()
    }

    #[inline]
    pub fn write_str(&mut self, s: &str) -> Result<()> {
        self.write_raw(s.as_bytes())
    }

    #[inline]
    pub fn write_int(&mut self, value: i64) -> Result<()> {
        let formatted = self.numbers.format(value);
        self.buffer.extend_from_slice(formatted.as_bytes());
        self.maybe_flush()
    }

    /// Write a finite float in its shortest round-trip form
    #[inline]
    pub fn write_float(&mut self, value: f64) -> Result<()> {
        if value.fract() == 0.0 && value.abs() < 1e15 {
            return self.write_int(value as i64);
        }
        self.write_str(&value.to_string())
    }

    /// Write `<name`
    #[inline]
    pub fn start_element(&mut self, name: &str) -> Result<()> {
        self.buffer.push(b'<');
        self.write_str(name)
    }

    /// Write `</name>`
    #[inline]
    pub fn end_element(&mut self, name: &str) -> Result<()> {
        self.buffer.extend_from_slice(b"</");
        self.buffer.extend_from_slice(name.as_bytes());
        self.write_raw(b">")
    }

    /// Write `<name/>`
    #[inline]
    pub fn empty_element(&mut self, name: &str) -> Result<()> {
        self.buffer.push(b'<');
        self.buffer.extend_from_slice(name.as_bytes());
        self.write_raw(b"/>")
    }

    #[inline]
    pub fn attribute(&mut self, name: &str, value: &str) -> Result<()> {
        self.buffer.push(b' ');
        self.buffer.extend_from_slice(name.as_bytes());
        self.buffer.extend_from_slice(b"=\"");
        self.write_escaped(value)?;
        self.write_raw(b"\"")
    }

    #[inline]
    pub fn attribute_int(&mut self, name: &str, value: i64) -> Result<()> {
        self.buffer.push(b' ');
        self.buffer.extend_from_slice(name.as_bytes());
        self.buffer.extend_from_slice(b"=\"");
        self.write_int(value)?;
        self.write_raw(b"\"")
    }

    /// Write `>`
    #[inline]
    pub fn close_start_tag(&mut self) -> Result<()> {
        self.write_raw(b">")
    }

    /// Write `/>`
    #[inline]
    pub fn close_empty_tag(&mut self) -> Result<()> {
        self.write_raw(b"/>")
    }

    /// Write text with XML escaping
    ///
    /// Control characters that XML 1.0 forbids are written as `_xHHHH_`, which spreadsheet
    /// readers decode back to the original character. A literal `_xHHHH_` in the text has its
    /// leading underscore written as `_x005F_` so it reads back unchanged.
    pub fn write_escaped(&mut self, text: &str) -> Result<()> {
        for (pos, ch) in text.char_indices() {
            match ch {
                '_' if looks_encoded(&text[pos..]) => self.buffer.extend_from_slice(b"_x005F_"),
                '&' => self.buffer.extend_from_slice(b"&amp;"),
                '<' => self.buffer.extend_from_slice(b"&lt;"),
                '>' => self.buffer.extend_from_slice(b"&gt;"),
                '"' => self.buffer.extend_from_slice(b"&quot;"),
                '\t' | '\n' | '\r' => self.buffer.push(ch as u8),
                c if (c as u32) < 0x20 || c == '\u{FFFE}' || c == '\u{FFFF}' => {
                    let encoded = format!("_x{:04X}_", c as u32);
                    self.buffer.extend_from_slice(encoded.as_bytes());
                }
                c if c.is_ascii() => self.buffer.push(c as u8),
                c => {
                    let mut utf8 = [0u8; 4];
                    self.buffer
                        .extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
                }
            }
        }
        self.maybe_flush()
    }

    #[inline]
    fn maybe_flush(&mut self) -> Result<()> {
        if self.buffer.len() > FLUSH_THRESHOLD {
            self.writer.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    /// Flush the buffer and the underlying writer
    pub fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.writer.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        self.writer.flush()?;
        Ok(())
    }

    /// Flush and hand back the underlying writer
    pub fn into_inner(mut self) -> Result<W> {
        self.flush()?;
        Ok(self.writer)
    }
}

/// `_xHHHH_` at the start of `text`
fn looks_encoded(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() >= 7
        && bytes[0] == b'_'
        && bytes[1] == b'x'
        && bytes[2..6].iter().all(u8::is_ascii_hexdigit)
        && bytes[6] == b'_'
}
