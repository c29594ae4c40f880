use async_trait::async_trait;
use csv::{Terminator, WriterBuilder};
use tokio::io::AsyncWriteExt;

use super::format::ValueFormatter;
use super::{OutputWriter, RenderSpec, RenderStats, Renderer};
use crate::domains::export::context::ExportContext;
use crate::domains::export::io::CountingWriter;
use crate::domains::export::source::RowIterator;
use crate::domains::export::tracking::next_or_done;
use crate::errors::{ExportError, ExportResult};

/// Streaming CSV writer: CRLF records, no BOM
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvRenderer;

#[derive(Clone)]
pub struct CsvConfig {
    pub delimiter: u8,
    pub include_headers: bool,
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            delimiter: b',',
            include_headers: true,
        }
    }
}

impl CsvConfig {
    pub fn from_spec(spec: &RenderSpec) -> ExportResult<Self> {
        let options = &spec.options.csv;
        let delimiter = match options.delimiter {
            None => b',',
            Some(c) if c.is_ascii() && c != '"' && c != '\r' && c != '\n' => c as u8,
            Some(c) => {
                return Err(ExportError::validation(format!("invalid csv delimiter {:?}", c)))
            }
        };
        Ok(Self {
            delimiter,
            include_headers: options.include_headers.unwrap_or(true),
        })
    }
}

/// Encodes one record into `buffer`, reusing its allocation.
fn encode_record<I, F>(config: &CsvConfig, buffer: &mut Vec<u8>, fields: I) -> ExportResult<()>
where
    I: IntoIterator<Item = F>,
    F: AsRef<[u8]>,
{
    buffer.clear();
    let mut wtr = WriterBuilder::new()
        .delimiter(config.delimiter)
        .terminator(Terminator::CRLF)
        .from_writer(buffer);
    wtr.write_record(fields)?;
    wtr.flush()?;
    Ok(())
}

#[async_trait]
impl Renderer for CsvRenderer {
    async fn render(
        &self,
        ctx: &ExportContext,
        spec: &RenderSpec,
        rows: &mut dyn RowIterator,
        out: &mut OutputWriter<'_>,
    ) -> ExportResult<RenderStats> {
        let config = CsvConfig::from_spec(spec)?;
        let formatter = ValueFormatter::new(&spec.options.format)?;
        let mut out = CountingWriter::new(out);
        let mut buffer = Vec::with_capacity(256);
        let mut count = 0u64;

        if config.include_headers {
            encode_record(&config, &mut buffer, spec.columns.iter().map(|c| c.header()))?;
            out.write_all(&buffer).await?;
        }

        while let Some(row) = next_or_done(ctx, rows).await? {
            let cells = formatter.coerce_row(&spec.columns, &row)?;
            encode_record(&config, &mut buffer, cells.iter().map(|c| c.to_text()))?;
            out.write_all(&buffer).await?;
            count += 1;
        }
        out.flush().await?;

        log::debug!(target: "export::csv", "wrote {} rows, {} bytes", count, out.bytes_written());
        Ok(RenderStats {
            rows: count,
            bytes: out.bytes_written(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::types::{Column, ColumnType, Row, Value};
    use crate::domains::export::writers::testing::render_to_vec;

    fn users() -> (Vec<Column>, Vec<Row>) {
        (
            vec![Column::new("id", ColumnType::Int), Column::string("name").with_label("Name")],
            vec![
                vec![Value::Int(1), Value::from("alice")],
                vec![Value::Int(2), Value::from("bob, jr")],
            ],
        )
    }

    #[tokio::test]
    async fn writes_header_and_crlf_records() {
        let (columns, rows) = users();
        let (out, stats) = render_to_vec(&CsvRenderer, &RenderSpec::new(columns), rows).await.unwrap();
        let text = String::from_utf8(out.clone()).unwrap();
        assert_eq!(text, "id,Name\r\n1,alice\r\n2,\"bob, jr\"\r\n");
        assert_eq!(stats.rows, 2);
        assert_eq!(stats.bytes, out.len() as u64);
    }

    #[tokio::test]
    async fn honors_delimiter_and_header_toggle() {
        let (columns, rows) = users();
        let mut spec = RenderSpec::new(columns);
        spec.options.csv.delimiter = Some(';');
        spec.options.csv.include_headers = Some(false);
        let (out, _) = render_to_vec(&CsvRenderer, &spec, rows).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "1;alice\r\n2;bob, jr\r\n");
    }

    #[tokio::test]
    async fn round_trips_through_csv_reader() {
        let columns = vec![
            Column::new("id", ColumnType::Int),
            Column::string("note"),
            Column::new("score", ColumnType::Float),
            Column::new("active", ColumnType::Bool),
        ];
        let rows = vec![
            vec![Value::Int(7), Value::from("line one\nline \"two\""), Value::Float(2.5), Value::Bool(true)],
            vec![Value::Int(8), Value::Null, Value::Float(-1.0), Value::Bool(false)],
        ];
        let (out, _) = render_to_vec(&CsvRenderer, &RenderSpec::new(columns), rows).await.unwrap();

        let mut reader = csv::Reader::from_reader(out.as_slice());
        assert_eq!(reader.headers().unwrap(), vec!["id", "note", "score", "active"]);
        let records: Vec<csv::StringRecord> = reader.records().collect::<Result<_, _>>().unwrap();
        assert_eq!(&records[0][1], "line one\nline \"two\"");
        assert_eq!(records[0][2].parse::<f64>().unwrap(), 2.5);
        assert_eq!(&records[1][1], "");
        assert_eq!(records[1][3].parse::<bool>().unwrap(), false);
    }

    #[tokio::test]
    async fn coercion_failure_is_validation() {
        let columns = vec![Column::new("id", ColumnType::Int)];
        let err = render_to_vec(&CsvRenderer, &RenderSpec::new(columns), vec![vec![Value::from("x")]])
            .await
            .unwrap_err();
        assert_eq!(err.kind().code(), "validation");
    }
}
