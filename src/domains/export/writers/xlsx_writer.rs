//! Single-sheet OOXML workbook assembled with the `zip` crate.
//!
//! The sheet body is buffered because the package can only be finalized once
//! every row is known; everything else streams.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::{Cursor, Write};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use tokio::io::AsyncWriteExt;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::format::{escape_markup, Cell, ValueFormatter};
use super::{OutputWriter, RenderSpec, RenderStats, Renderer};
use crate::domains::export::context::ExportContext;
use crate::domains::export::io::{CountingWriter, LimitedWriter};
use crate::domains::export::source::RowIterator;
use crate::domains::export::tracking::next_or_done;
use crate::domains::export::types::{Column, ColumnType};
use crate::errors::{ExportError, ExportResult};

/// Hard row limit of a spreadsheet
pub const XLSX_MAX_ROWS: u64 = 1_048_576;
const DEFAULT_SHEET: &str = "Sheet1";
const MAIN_NS: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";
const REL_NS: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#;

#[derive(Debug, Clone, Copy, Default)]
pub struct XlsxRenderer;

/// Number formats and cell styles used by one workbook.
#[derive(Debug, Default)]
struct StyleRegistry {
    custom_formats: Vec<String>,
    xfs: Vec<(u32, bool)>,
    lookup: HashMap<(u32, bool), usize>,
}

impl StyleRegistry {
    const FIRST_CUSTOM_FORMAT: u32 = 164;

    fn new() -> Self {
        let mut styles = Self::default();
        styles.xf(0, false);
        styles
    }

    fn number_format(&mut self, code: &str) -> u32 {
        match code {
            "" | "General" => 0,
            "0" => 1,
            "0.00" => 2,
            code => {
                let position = match self.custom_formats.iter().position(|c| c == code) {
                    Some(position) => position,
                    None => {
                        self.custom_formats.push(code.to_string());
                        self.custom_formats.len() - 1
                    }
                };
                Self::FIRST_CUSTOM_FORMAT + position as u32
            }
        }
    }

    fn xf(&mut self, format_id: u32, bold: bool) -> usize {
        if let Some(index) = self.lookup.get(&(format_id, bold)) {
            return *index;
        }
        self.xfs.push((format_id, bold));
        let index = self.xfs.len() - 1;
        self.lookup.insert((format_id, bold), index);
        index
    }

    /// Style for a column: its custom format, else the default for its type.
    fn column_style(&mut self, column: &Column) -> usize {
        let code = match (&column.format, column.kind) {
            (Some(code), _) => code.as_str(),
            (None, ColumnType::Date) => "yyyy-mm-dd",
            (None, ColumnType::Datetime) => "yyyy-mm-dd hh:mm:ss",
            (None, ColumnType::Time) => "hh:mm:ss",
            (None, ColumnType::Float) => "0.00",
            (None, _) => "General",
        };
        let format_id = self.number_format(code);
        self.xf(format_id, false)
    }

    fn to_xml(&self) -> String {
        let mut xml = String::new();
        xml.push_str(XML_DECL);
        let _ = write!(xml, r#"<styleSheet xmlns="{}">"#, MAIN_NS);
        if !self.custom_formats.is_empty() {
            let _ = write!(xml, r#"<numFmts count="{}">"#, self.custom_formats.len());
            for (i, code) in self.custom_formats.iter().enumerate() {
                let _ = write!(
                    xml,
                    r#"<numFmt numFmtId="{}" formatCode="{}"/>"#,
                    Self::FIRST_CUSTOM_FORMAT + i as u32,
                    escape_markup(code)
                );
            }
            xml.push_str("</numFmts>");
        }
        xml.push_str(r#"<fonts count="2"><font><sz val="11"/><name val="Calibri"/></font><font><b/><sz val="11"/><name val="Calibri"/></font></fonts>"#);
        xml.push_str(r#"<fills count="2"><fill><patternFill patternType="none"/></fill><fill><patternFill patternType="gray125"/></fill></fills>"#);
        xml.push_str(r#"<borders count="1"><border><left/><right/><top/><bottom/><diagonal/></border></borders>"#);
        xml.push_str(r#"<cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs>"#);
        let _ = write!(xml, r#"<cellXfs count="{}">"#, self.xfs.len());
        for (format_id, bold) in &self.xfs {
            let _ = write!(
                xml,
                r#"<xf numFmtId="{}" fontId="{}" fillId="0" borderId="0" xfId="0" applyNumberFormat="1" applyFont="1"/>"#,
                format_id,
                u8::from(*bold)
            );
        }
        xml.push_str("</cellXfs>");
        xml.push_str(r#"<cellStyles count="1"><cellStyle name="Normal" xfId="0" builtinId="0"/></cellStyles>"#);
        xml.push_str("</styleSheet>");
        xml
    }
}

/// `0 -> A`, `25 -> Z`, `26 -> AA`
fn column_letter(mut index: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(b'A' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    letters.iter().rev().map(|b| *b as char).collect()
}

fn excel_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1899, 12, 30)
        .unwrap_or_default()
        .and_time(NaiveTime::MIN)
}

fn serial_datetime(value: NaiveDateTime) -> f64 {
    let delta = value - excel_epoch();
    delta.num_milliseconds() as f64 / 86_400_000.0
}

fn serial_time(value: NaiveTime) -> f64 {
    (value.num_seconds_from_midnight() as f64 + value.nanosecond() as f64 / 1e9) / 86_400.0
}

fn validate_sheet_name(name: &str) -> ExportResult<()> {
    let len = name.chars().count();
    if len == 0 || len > 31 || name.contains(['[', ']', ':', '*', '?', '/', '\\']) {
        return Err(ExportError::validation(format!("invalid sheet name: {:?}", name)));
    }
    Ok(())
}

fn push_cell(xml: &mut String, reference: &str, cell: &Cell, style: usize) {
    let number = |xml: &mut String, value: f64| {
        let _ = write!(xml, r#"<c r="{}" s="{}"><v>{}</v></c>"#, reference, style, value);
    };
    match cell {
        Cell::Empty => {}
        Cell::Bool(b) => {
            let _ = write!(xml, r#"<c r="{}" s="{}" t="b"><v>{}</v></c>"#, reference, style, u8::from(*b));
        }
        Cell::Int(i) => {
            let _ = write!(xml, r#"<c r="{}" s="{}"><v>{}</v></c>"#, reference, style, i);
        }
        Cell::Float(f) if f.is_finite() => number(xml, *f),
        Cell::Date(d) => number(xml, serial_datetime(d.and_time(NaiveTime::MIN))),
        Cell::DateTime(dt) => number(xml, serial_datetime(dt.naive_local())),
        Cell::Time(t) => number(xml, serial_time(*t)),
        other => {
            let _ = write!(
                xml,
                r#"<c r="{}" s="{}" t="inlineStr"><is><t xml:space="preserve">{}</t></is></c>"#,
                reference,
                style,
                escape_markup(&other.to_text())
            );
        }
    }
}

fn package(sheet_name: &str, sheet_xml: &str, styles_xml: &str) -> ExportResult<Vec<u8>> {
    let content_types = format!(
        r#"{}<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/><Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/></Types>"#,
        XML_DECL
    );
    let root_rels = format!(
        r#"{}<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="{}/officeDocument" Target="xl/workbook.xml"/></Relationships>"#,
        XML_DECL, REL_NS
    );
    let workbook = format!(
        r#"{}<workbook xmlns="{}" xmlns:r="{}"><sheets><sheet name="{}" sheetId="1" r:id="rId1"/></sheets></workbook>"#,
        XML_DECL,
        MAIN_NS,
        REL_NS,
        escape_markup(sheet_name)
    );
    let workbook_rels = format!(
        r#"{}<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="{}/worksheet" Target="worksheets/sheet1.xml"/><Relationship Id="rId2" Type="{}/styles" Target="styles.xml"/></Relationships>"#,
        XML_DECL, REL_NS, REL_NS
    );

    let parts: [(&str, &str); 6] = [
        ("[Content_Types].xml", &content_types),
        ("_rels/.rels", &root_rels),
        ("xl/workbook.xml", &workbook),
        ("xl/_rels/workbook.xml.rels", &workbook_rels),
        ("xl/styles.xml", styles_xml),
        ("xl/worksheets/sheet1.xml", sheet_xml),
    ];

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, body) in parts {
        zip.start_file(name, options)?;
        zip.write_all(body.as_bytes())?;
    }
    Ok(zip.finish()?.into_inner())
}

#[async_trait]
impl Renderer for XlsxRenderer {
    async fn render(
        &self,
        ctx: &ExportContext,
        spec: &RenderSpec,
        rows: &mut dyn RowIterator,
        out: &mut OutputWriter<'_>,
    ) -> ExportResult<RenderStats> {
        let options = &spec.options.xlsx;
        let sheet_name = options.sheet_name.as_deref().unwrap_or(DEFAULT_SHEET);
        validate_sheet_name(sheet_name)?;
        let include_headers = options.include_headers.unwrap_or(true);
        let header_rows = u64::from(include_headers);
        let row_limit = options
            .max_rows
            .filter(|n| *n > 0)
            .unwrap_or(XLSX_MAX_ROWS)
            .min(XLSX_MAX_ROWS - header_rows);
        let formatter = ValueFormatter::new(&spec.options.format)?;

        let mut styles = StyleRegistry::new();
        let header_style = styles.xf(0, true);
        let column_styles: Vec<usize> = spec.columns.iter().map(|c| styles.column_style(c)).collect();
        let letters: Vec<String> = (0..spec.columns.len()).map(column_letter).collect();

        let mut sheet = String::with_capacity(4096);
        sheet.push_str(XML_DECL);
        let _ = write!(sheet, r#"<worksheet xmlns="{}" xmlns:r="{}"><sheetData>"#, MAIN_NS, REL_NS);

        let mut line: u64 = 0;
        if include_headers {
            line += 1;
            let _ = write!(sheet, r#"<row r="{}">"#, line);
            for (column, letter) in spec.columns.iter().zip(&letters) {
                let reference = format!("{}{}", letter, line);
                push_cell(&mut sheet, &reference, &Cell::Text(column.header().to_string()), header_style);
            }
            sheet.push_str("</row>");
        }

        let mut count = 0u64;
        while let Some(row) = next_or_done(ctx, rows).await? {
            if count >= row_limit {
                return Err(ExportError::validation(format!("xlsx row limit exceeded ({})", row_limit)));
            }
            let cells = formatter.coerce_row(&spec.columns, &row)?;
            count += 1;
            line += 1;
            let _ = write!(sheet, r#"<row r="{}">"#, line);
            for ((cell, letter), style) in cells.iter().zip(&letters).zip(&column_styles) {
                let reference = format!("{}{}", letter, line);
                push_cell(&mut sheet, &reference, cell, *style);
            }
            sheet.push_str("</row>");
        }
        sheet.push_str("</sheetData></worksheet>");

        let body = package(sheet_name, &sheet, &styles.to_xml())?;
        let bytes = match options.max_bytes.filter(|n| *n > 0) {
            Some(limit) => {
                let mut limited = LimitedWriter::new(CountingWriter::new(out), limit);
                limited.write_all(&body).await?;
                limited.flush().await?;
                limited.bytes_written()
            }
            None => {
                let mut counted = CountingWriter::new(out);
                counted.write_all(&body).await?;
                counted.flush().await?;
                counted.bytes_written()
            }
        };

        log::debug!(target: "export::xlsx", "sheet {} with {} rows, {} bytes", sheet_name, count, bytes);
        Ok(RenderStats { rows: count, bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::types::{Row, Value};
    use crate::domains::export::writers::testing::render_to_vec;
    use std::io::Read;

    fn read_part(bytes: &[u8], name: &str) -> String {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes.to_vec())).unwrap();
        let mut file = archive.by_name(name).unwrap();
        let mut text = String::new();
        file.read_to_string(&mut text).unwrap();
        text
    }

    fn columns() -> Vec<Column> {
        vec![
            Column::new("id", ColumnType::Int),
            Column::string("name").with_label("Full name"),
            Column::new("joined", ColumnType::Date),
            Column::new("ratio", ColumnType::Float).with_format("0.00%"),
        ]
    }

    fn rows() -> Vec<Row> {
        vec![vec![
            Value::Int(1),
            Value::from("a & b"),
            Value::from("1900-01-01"),
            Value::Float(0.25),
        ]]
    }

    #[test]
    fn letters() {
        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(26), "AA");
        assert_eq!(column_letter(701), "ZZ");
        assert_eq!(column_letter(702), "AAA");
    }

    #[test]
    fn serials_follow_spreadsheet_epoch() {
        let day = NaiveDate::from_ymd_opt(1900, 1, 1).unwrap().and_time(NaiveTime::MIN);
        assert_eq!(serial_datetime(day), 2.0);
        assert_eq!(serial_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap()), 0.5);
    }

    #[tokio::test]
    async fn writes_a_readable_package() {
        let (out, stats) = render_to_vec(&XlsxRenderer, &RenderSpec::new(columns()), rows()).await.unwrap();
        assert_eq!(stats.rows, 1);
        assert_eq!(stats.bytes, out.len() as u64);

        let sheet = read_part(&out, "xl/worksheets/sheet1.xml");
        assert!(sheet.contains(r#"<c r="B1" s="1" t="inlineStr"><is><t xml:space="preserve">Full name</t></is></c>"#));
        assert!(sheet.contains(r#"<c r="A2" s="0"><v>1</v></c>"#));
        assert!(sheet.contains("a &amp; b"));
        assert!(sheet.contains("<v>2</v>"));

        let styles = read_part(&out, "xl/styles.xml");
        assert!(styles.contains(r#"formatCode="yyyy-mm-dd""#));
        assert!(styles.contains(r#"formatCode="0.00%""#));
        let workbook = read_part(&out, "xl/workbook.xml");
        assert!(workbook.contains(r#"name="Sheet1""#));
    }

    #[tokio::test]
    async fn enforces_row_and_byte_caps() {
        let mut spec = RenderSpec::new(columns());
        spec.options.xlsx.max_rows = Some(1);
        let two = [rows(), rows()].concat();
        let err = render_to_vec(&XlsxRenderer, &spec, two).await.unwrap_err();
        assert_eq!(err.kind().code(), "validation");

        let mut spec = RenderSpec::new(columns());
        spec.options.xlsx.max_bytes = Some(10);
        let err = render_to_vec(&XlsxRenderer, &spec, rows()).await.unwrap_err();
        assert_eq!(err.message(), "max bytes exceeded");
    }

    #[tokio::test]
    async fn rejects_bad_sheet_names() {
        let mut spec = RenderSpec::new(columns());
        spec.options.xlsx.sheet_name = Some("a/b".into());
        assert!(render_to_vec(&XlsxRenderer, &spec, rows()).await.is_err());
    }
}
