use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use super::format::{escape_markup, ValueFormatter};
use super::{OutputWriter, RenderSpec, RenderStats, Renderer};
use crate::domains::export::context::ExportContext;
use crate::domains::export::io::CountingWriter;
use crate::domains::export::source::RowIterator;
use crate::domains::export::tracking::next_or_done;
use crate::domains::export::types::Column;
use crate::errors::{ExportError, ExportResult};

pub const DEFAULT_MAX_HTML_BYTES: u64 = 5 * 1024 * 1024;
pub const DEFAULT_TEMPLATE: &str = "default";

/// Everything a template sees
#[derive(Debug, Clone, Serialize)]
pub struct TemplateData {
    pub title: String,
    pub definition: String,
    pub export_id: String,
    pub generated_at: DateTime<Utc>,
    pub columns: Vec<Column>,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub data: BTreeMap<String, serde_json::Value>,
}

/// Pluggable template engine.
pub trait TemplateExecutor: Send + Sync {
    fn execute(&self, template: &str, data: &TemplateData, out: &mut Vec<u8>) -> ExportResult<()>;
}

/// Built-in executor producing a plain HTML table. Knows `default` and `table`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlTableExecutor;

impl TemplateExecutor for HtmlTableExecutor {
    fn execute(&self, template: &str, data: &TemplateData, out: &mut Vec<u8>) -> ExportResult<()> {
        if template != DEFAULT_TEMPLATE && template != "table" {
            return Err(ExportError::not_found(format!("template {} not found", template)));
        }
        let title = escape_markup(&data.title);
        let mut html = String::with_capacity(1024 + data.rows.len() * 64);
        let _ = write!(
            html,
            "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{}</title></head><body>\n<h1>{}</h1>\n<table>\n<thead><tr>",
            title, title
        );
        for header in &data.headers {
            let _ = write!(html, "<th>{}</th>", escape_markup(header));
        }
        html.push_str("</tr></thead>\n<tbody>\n");
        for row in &data.rows {
            html.push_str("<tr>");
            for value in row {
                let _ = write!(html, "<td>{}</td>", escape_markup(value));
            }
            html.push_str("</tr>\n");
        }
        html.push_str("</tbody>\n</table>\n</body></html>\n");
        out.extend_from_slice(html.as_bytes());
        Ok(())
    }
}

/// HTML renderer over an injected [`TemplateExecutor`]. The page is
/// buffered, so its size is capped by `max_html_bytes`.
#[derive(Clone)]
pub struct TemplateRenderer {
    executor: Arc<dyn TemplateExecutor>,
    max_html_bytes: u64,
}

impl TemplateRenderer {
    pub fn new(executor: Arc<dyn TemplateExecutor>) -> Self {
        Self {
            executor,
            max_html_bytes: DEFAULT_MAX_HTML_BYTES,
        }
    }

    /// Fallback cap when neither definition nor request sets one.
    pub fn with_max_html_bytes(mut self, max: u64) -> Self {
        if max > 0 {
            self.max_html_bytes = max;
        }
        self
    }

    /// Runs the template and returns the page with the number of rows consumed.
    pub(crate) async fn render_html(
        &self,
        ctx: &ExportContext,
        spec: &RenderSpec,
        rows: &mut dyn RowIterator,
    ) -> ExportResult<(Vec<u8>, u64)> {
        let options = spec.effective_template();
        let limit = if options.max_html_bytes > 0 {
            options.max_html_bytes
        } else {
            self.max_html_bytes
        };
        let too_large = || ExportError::validation(format!("html exceeds max_html_bytes ({})", limit));
        let formatter = ValueFormatter::new(&spec.options.format)?;

        let mut buffered: u64 = 0;
        let mut text_rows = Vec::new();
        while let Some(row) = next_or_done(ctx, rows).await? {
            let cells: Vec<String> = formatter
                .coerce_row(&spec.columns, &row)?
                .iter()
                .map(|cell| cell.to_text())
                .collect();
            buffered += cells.iter().map(|c| c.len() as u64).sum::<u64>();
            if buffered > limit {
                return Err(too_large());
            }
            text_rows.push(cells);
        }
        let count = text_rows.len() as u64;

        let data = TemplateData {
            title: options
                .title
                .clone()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| spec.definition.clone()),
            definition: spec.definition.clone(),
            export_id: spec.export_id.clone(),
            generated_at: Utc::now(),
            headers: spec.columns.iter().map(|c| c.header().to_string()).collect(),
            columns: spec.columns.clone(),
            rows: text_rows,
            data: options.data.clone(),
        };
        let template = options.template.as_deref().filter(|t| !t.is_empty()).unwrap_or(DEFAULT_TEMPLATE);

        let mut html = Vec::new();
        self.executor.execute(template, &data, &mut html)?;
        if html.len() as u64 > limit {
            return Err(too_large());
        }
        Ok((html, count))
    }
}

#[async_trait]
impl Renderer for TemplateRenderer {
    async fn render(
        &self,
        ctx: &ExportContext,
        spec: &RenderSpec,
        rows: &mut dyn RowIterator,
        out: &mut OutputWriter<'_>,
    ) -> ExportResult<RenderStats> {
        let (html, count) = self.render_html(ctx, spec, rows).await?;
        let mut out = CountingWriter::new(out);
        out.write_all(&html).await?;
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
    use crate::domains::export::types::{ColumnType, Value};
    use crate::domains::export::writers::testing::render_to_vec;

    fn spec() -> RenderSpec {
        let mut spec = RenderSpec::new(vec![Column::new("id", ColumnType::Int), Column::string("name")]);
        spec.definition = "users".into();
        spec
    }

    #[tokio::test]
    async fn renders_escaped_table() {
        let renderer = TemplateRenderer::new(Arc::new(HtmlTableExecutor));
        let rows = vec![vec![Value::Int(1), Value::from("<script>")]];
        let (out, stats) = render_to_vec(&renderer, &spec(), rows).await.unwrap();
        let html = String::from_utf8(out).unwrap();
        assert!(html.contains("<title>users</title>"));
        assert!(html.contains("<th>id</th><th>name</th>"));
        assert!(html.contains("<td>1</td><td>&lt;script&gt;</td>"));
        assert_eq!(stats.rows, 1);
    }

    #[tokio::test]
    async fn guards_buffered_html() {
        let renderer = TemplateRenderer::new(Arc::new(HtmlTableExecutor)).with_max_html_bytes(64);
        let rows = vec![vec![Value::Int(1), Value::from("x")]];
        let err = render_to_vec(&renderer, &spec(), rows).await.unwrap_err();
        assert_eq!(err.kind().code(), "validation");
    }

    #[tokio::test]
    async fn unknown_template_is_not_found() {
        let renderer = TemplateRenderer::new(Arc::new(HtmlTableExecutor));
        let mut spec = spec();
        spec.options.template.template = Some("invoice".into());
        let err = render_to_vec(&renderer, &spec, vec![]).await.unwrap_err();
        assert_eq!(err.kind().code(), "not_found");
    }

    struct Capture;

    impl TemplateExecutor for Capture {
        fn execute(&self, template: &str, data: &TemplateData, out: &mut Vec<u8>) -> ExportResult<()> {
            let summary = serde_json::json!({"template": template, "title": data.title, "data": data.data, "rows": data.rows});
            out.extend_from_slice(summary.to_string().as_bytes());
            Ok(())
        }
    }

    #[tokio::test]
    async fn passes_merged_options_to_executor() {
        let renderer = TemplateRenderer::new(Arc::new(Capture));
        let mut spec = spec();
        spec.template.template = Some("report".into());
        spec.template.data.insert("org".into(), serde_json::json!("acme"));
        spec.options.template.title = Some("Q1".into());
        let (out, _) = render_to_vec(&renderer, &spec, vec![vec![Value::Int(3), Value::Null]]).await.unwrap();
        let seen: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(seen["template"], "report");
        assert_eq!(seen["title"], "Q1");
        assert_eq!(seen["data"]["org"], "acme");
        assert_eq!(seen["rows"], serde_json::json!([["3", ""]]));
    }
}
