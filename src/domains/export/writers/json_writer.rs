use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::format::ValueFormatter;
use super::{OutputWriter, RenderSpec, RenderStats, Renderer};
use crate::domains::export::context::ExportContext;
use crate::domains::export::io::CountingWriter;
use crate::domains::export::source::RowIterator;
use crate::domains::export::tracking::next_or_done;
use crate::domains::export::types::{Column, JsonMode};
use crate::errors::{ExportError, ExportResult};

/// JSON array or newline-delimited objects, keyed by column name in schema order.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRenderer;

fn encode_error(err: serde_json::Error) -> ExportError {
    ExportError::internal(format!("json encode: {}", err))
}

fn encode_object(buffer: &mut Vec<u8>, columns: &[Column], values: &[serde_json::Value]) -> ExportResult<()> {
    buffer.push(b'{');
    for (i, (column, value)) in columns.iter().zip(values).enumerate() {
        if i > 0 {
            buffer.push(b',');
        }
        serde_json::to_writer(&mut *buffer, &column.name).map_err(encode_error)?;
        buffer.push(b':');
        serde_json::to_writer(&mut *buffer, value).map_err(encode_error)?;
    }
    buffer.push(b'}');
    Ok(())
}

#[async_trait]
impl Renderer for JsonRenderer {
    async fn render(
        &self,
        ctx: &ExportContext,
        spec: &RenderSpec,
        rows: &mut dyn RowIterator,
        out: &mut OutputWriter<'_>,
    ) -> ExportResult<RenderStats> {
        let mode = spec.options.json.mode.unwrap_or_default();
        let formatter = ValueFormatter::new(&spec.options.format)?;
        let mut out = CountingWriter::new(out);
        let mut buffer = Vec::with_capacity(256);
        let mut count = 0u64;

        if mode == JsonMode::Array {
            out.write_all(b"[").await?;
        }
        while let Some(row) = next_or_done(ctx, rows).await? {
            let values: Vec<serde_json::Value> = formatter
                .coerce_row(&spec.columns, &row)?
                .iter()
                .map(|cell| cell.to_json())
                .collect();

            buffer.clear();
            if mode == JsonMode::Array && count > 0 {
                buffer.push(b',');
            }
            encode_object(&mut buffer, &spec.columns, &values)?;
            if mode == JsonMode::Lines {
                buffer.push(b'\n');
            }
            out.write_all(&buffer).await?;
            count += 1;
        }
        if mode == JsonMode::Array {
            out.write_all(b"]").await?;
        }
        out.flush().await?;

        Ok(RenderStats {
            rows: count,
            bytes: out.bytes_written(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::types::{ColumnType, Row, Value};
    use crate::domains::export::writers::testing::render_to_vec;

    fn spec(mode: JsonMode) -> RenderSpec {
        let mut spec = RenderSpec::new(vec![
            Column::string("token"),
            Column::new("id", ColumnType::Int),
            Column::new("ok", ColumnType::Bool),
        ]);
        spec.options.json.mode = Some(mode);
        spec
    }

    fn rows() -> Vec<Row> {
        vec![
            vec![Value::from("a\"b"), Value::Int(1), Value::Bool(true)],
            vec![Value::Null, Value::from("2"), Value::Null],
        ]
    }

    #[tokio::test]
    async fn array_mode_keeps_schema_order() {
        let (out, stats) = render_to_vec(&JsonRenderer, &spec(JsonMode::Array), rows()).await.unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            r#"[{"token":"a\"b","id":1,"ok":true},{"token":null,"id":2,"ok":null}]"#
        );
        assert_eq!(stats.rows, 2);
    }

    #[tokio::test]
    async fn empty_array() {
        let (out, _) = render_to_vec(&JsonRenderer, &spec(JsonMode::Array), vec![]).await.unwrap();
        assert_eq!(out, b"[]".to_vec());
    }

    #[tokio::test]
    async fn lines_match_array_objects() {
        let (array, _) = render_to_vec(&JsonRenderer, &spec(JsonMode::Array), rows()).await.unwrap();
        let (lines, _) = render_to_vec(&JsonRenderer, &spec(JsonMode::Lines), rows()).await.unwrap();

        let from_array: Vec<serde_json::Value> = serde_json::from_slice(&array).unwrap();
        let text = String::from_utf8(lines).unwrap();
        assert!(text.ends_with('\n'));
        let from_lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(from_array, from_lines);
    }
}
