//! Cell formats and the styles.xml part

use super::xml_writer::XmlWriter;
use crate::error::Result;
use std::collections::HashMap;
use std::io::Write;

/// First id available for custom number formats
const FIRST_CUSTOM_NUM_FMT: u32 = 164;

const BUILTIN_NUM_FMTS: &[(&str, u32)] = &[
    ("General", 0),
    ("0", 1),
    ("0.00", 2),
    ("#,##0", 3),
    ("#,##0.00", 4),
    ("0%", 9),
    ("0.00%", 10),
    ("0.00E+00", 11),
    ("m/d/yy", 14),
    ("h:mm", 20),
    ("h:mm:ss", 21),
    ("m/d/yy h:mm", 22),
    ("@", 49),
];

const FONT_REGULAR: u32 = 0;
const FONT_BOLD: u32 = 1;
const FILL_NONE: u32 = 0;
const FILL_HEADER: u32 = 2;
const BORDER_NONE: u32 = 0;
const BORDER_THIN: u32 = 1;

/// Style requested for a cell
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CellStyle {
    /// Number format pattern such as `#,##0.00` or `yyyy-mm-dd`
    pub number_format: Option<String>,
    /// Bold, grey fill, centred
    pub header: bool,
    /// Thin border on all sides
    pub border: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Xf {
    num_fmt_id: u32,
    font_id: u32,
    fill_id: u32,
    border_id: u32,
    centred: bool,
}

/// Registry of cell formats; index 0 is the default format
#[derive(Debug)]
pub struct StyleSheet {
    num_fmts: Vec<(u32, String)>,
    xfs: Vec<Xf>,
    index: HashMap<CellStyle, u32>,
}

impl Default for StyleSheet {
    fn default() -> Self {
        Self::new()
    }
}

impl StyleSheet {
    pub fn new() -> Self {
        let default_xf = Xf {
            num_fmt_id: 0,
            font_id: FONT_REGULAR,
            fill_id: FILL_NONE,
            border_id: BORDER_NONE,
            centred: false,
        };
        let mut index = HashMap::new();
        index.insert(CellStyle::default(), 0);
        StyleSheet {
            num_fmts: Vec::new(),
            xfs: vec![default_xf],
            index,
        }
    }

    /// Format index for `style`, registering it on first use
    pub fn register(&mut self, style: &CellStyle) -> u32 {
        if let Some(&id) = self.index.get(style) {
            return id;
        }
        let num_fmt_id = match style.number_format.as_deref() {
            Some(pattern) => self.num_fmt_id(pattern),
            None => 0,
        };
        let xf = Xf {
            num_fmt_id,
            font_id: if style.header { FONT_BOLD } else { FONT_REGULAR },
            fill_id: if style.header { FILL_HEADER } else { FILL_NONE },
            border_id: if style.border { BORDER_THIN } else { BORDER_NONE },
            centred: style.header,
        };
        let id = self.xfs.len() as u32;
        self.xfs.push(xf);
        self.index.insert(style.clone(), id);
        id
    }

    fn num_fmt_id(&mut self, pattern: &str) -> u32 {
        if let Some((_, id)) = BUILTIN_NUM_FMTS.iter().find(|(p, _)| *p == pattern) {
            return *id;
        }
        if let Some((id, _)) = self.num_fmts.iter().find(|(_, p)| p == pattern) {
            return *id;
        }
        let id = FIRST_CUSTOM_NUM_FMT + self.num_fmts.len() as u32;
        self.num_fmts.push((id, pattern.to_string()));
        id
    }

    /// Number of registered cell formats
    pub fn len(&self) -> usize {
        self.xfs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xfs.is_empty()
    }

    pub fn write_xml<W: Write>(&self, xml: &mut XmlWriter<W>) -> Result<()> {
        xml.write_str("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n")?;
        xml.start_element("styleSheet")?;
        xml.attribute(
            "xmlns",
            "http://schemas.openxmlformats.org/spreadsheetml/2006/main",
        )?;
        xml.close_start_tag()?;

        if !self.num_fmts.is_empty() {
            xml.start_element("numFmts")?;
            xml.attribute_int("count", self.num_fmts.len() as i64)?;
            xml.close_start_tag()?;
            for (id, code) in &self.num_fmts {
                xml.start_element("numFmt")?;
                xml.attribute_int("numFmtId", i64::from(*id))?;
                xml.attribute("formatCode", code)?;
                xml.close_empty_tag()?;
            }
            xml.end_element("numFmts")?;
        }

        xml.write_str(
            "<fonts count=\"2\">\
<font><sz val=\"11\"/><name val=\"Calibri\"/><family val=\"2\"/></font>\
<font><b/><sz val=\"11\"/><name val=\"Calibri\"/><family val=\"2\"/></font>\
</fonts>\
<fills count=\"3\">\
<fill><patternFill patternType=\"none\"/></fill>\
<fill><patternFill patternType=\"gray125\"/></fill>\
<fill><patternFill patternType=\"solid\"><fgColor rgb=\"FFD9D9D9\"/><bgColor indexed=\"64\"/></patternFill></fill>\
</fills>\
<borders count=\"2\">\
<border><left/><right/><top/><bottom/><diagonal/></border>\
<border><left style=\"thin\"><color auto=\"1\"/></left><right style=\"thin\"><color auto=\"1\"/></right>\
<top style=\"thin\"><color auto=\"1\"/></top><bottom style=\"thin\"><color auto=\"1\"/></bottom><diagonal/></border>\
</borders>\
<cellStyleXfs count=\"1\"><xf numFmtId=\"0\" fontId=\"0\" fillId=\"0\" borderId=\"0\"/></cellStyleXfs>",
        )?;

        xml.start_element("cellXfs")?;
        xml.attribute_int("count", self.xfs.len() as i64)?;
        xml.close_start_tag()?;
        for xf in &self.xfs {
            xml.start_element("xf")?;
            xml.attribute_int("numFmtId", i64::from(xf.num_fmt_id))?;
            xml.attribute_int("fontId", i64::from(xf.font_id))?;
            xml.attribute_int("fillId", i64::from(xf.fill_id))?;
            xml.attribute_int("borderId", i64::from(xf.border_id))?;
            xml.attribute_int("xfId", 0)?;
            if xf.num_fmt_id != 0 {
                xml.attribute_int("applyNumberFormat", 1)?;
            }
            if xf.font_id != FONT_REGULAR {
                xml.attribute_int("applyFont", 1)?;
            }
            if xf.fill_id != FILL_NONE {
                xml.attribute_int("applyFill", 1)?;
            }
            if xf.border_id != BORDER_NONE {
                xml.attribute_int("applyBorder", 1)?;
            }
            if xf.centred {
                xml.attribute_int("applyAlignment", 1)?;
                xml.close_start_tag()?;
                xml.write_str("<alignment horizontal=\"center\" vertical=\"center\"/>")?;
                xml.end_element("xf")?;
            } else {
                xml.close_empty_tag()?;
            }
        }
        xml.end_element("cellXfs")?;

        xml.write_str(
            "<cellStyles count=\"1\"><cellStyle name=\"Normal\" xfId=\"0\" builtinId=\"0\"/></cellStyles>",
        )?;
        xml.end_element("styleSheet")?;
        Ok(())
    }
}
