//! Renderers: one per wire format, each streaming rows into an `AsyncWrite`.

pub mod csv_writer;
pub mod format;
pub mod json_writer;
pub mod pdf_writer;
pub mod sqlite_writer;
pub mod template_writer;
pub mod xlsx_writer;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

pub use csv_writer::CsvRenderer;
pub use format::{parse_timezone, Cell, ValueFormatter};
pub use json_writer::JsonRenderer;
pub use pdf_writer::{PdfEngine, PdfRenderer, PdfSettings};
pub use sqlite_writer::SqliteRenderer;
pub use template_writer::{HtmlTableExecutor, TemplateData, TemplateExecutor, TemplateRenderer};
pub use xlsx_writer::XlsxRenderer;

use crate::domains::export::context::ExportContext;
use crate::domains::export::definition::TemplateOptions;
use crate::domains::export::registry::Registry;
use crate::domains::export::source::RowIterator;
use crate::domains::export::types::{Column, Format, RenderOptions};
use crate::errors::ExportResult;

/// Output sink handed to renderers
pub type OutputWriter<'a> = dyn AsyncWrite + Send + Unpin + 'a;

/// What a renderer needs besides the rows
#[derive(Debug, Clone, Default)]
pub struct RenderSpec {
    pub export_id: String,
    pub definition: String,
    pub filename: String,
    pub columns: Vec<Column>,
    pub options: RenderOptions,
    /// Definition-level template settings; request options override them
    pub template: TemplateOptions,
}

impl RenderSpec {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            ..Default::default()
        }
    }

    pub fn with_options(mut self, options: RenderOptions) -> Self {
        self.options = options;
        self
    }

    /// Definition template merged with the request's template options.
    pub fn effective_template(&self) -> TemplateOptions {
        let request = &self.options.template;
        self.template.merge(&TemplateOptions {
            template: request.template.clone(),
            title: request.title.clone(),
            data: request.data.clone(),
            max_html_bytes: request.max_html_bytes.unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub rows: u64,
    pub bytes: u64,
}

#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(
        &self,
        ctx: &ExportContext,
        spec: &RenderSpec,
        rows: &mut dyn RowIterator,
        out: &mut OutputWriter<'_>,
    ) -> ExportResult<RenderStats>;
}

impl Registry<Arc<dyn Renderer>> {
    /// Renderers for every format that needs no injected engine.
    /// `pdf` is left for the host to register with its engine.
    pub fn with_defaults() -> Self {
        Self::with_html_limit(template_writer::DEFAULT_MAX_HTML_BYTES)
    }

    /// Same as [`with_defaults`](Self::with_defaults) with a custom cap on rendered HTML.
    pub fn with_html_limit(max_html_bytes: u64) -> Self {
        let registry = Registry::new("renderer");
        let renderers: [(Format, Arc<dyn Renderer>); 6] = [
            (Format::Csv, Arc::new(CsvRenderer)),
            (Format::Json, Arc::new(JsonRenderer)),
            (Format::Ndjson, Arc::new(JsonRenderer)),
            (Format::Xlsx, Arc::new(XlsxRenderer)),
            (Format::Sqlite, Arc::new(SqliteRenderer)),
            (Format::Template, Arc::new(TemplateRenderer::new(Arc::new(HtmlTableExecutor)).with_max_html_bytes(max_html_bytes))),
        ];
        for (format, renderer) in renderers {
            if let Err(err) = registry.register(format.as_str(), renderer) {
                log::error!(target: "export::writers", "default renderer {}: {}", format, err);
            }
        }
        registry
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::registry::RendererRegistry;
    use crate::domains::export::types::TemplateRenderOptions;
    use std::collections::BTreeMap;

    #[test]
    fn defaults_cover_engine_free_formats() {
        let registry = RendererRegistry::with_defaults();
        assert_eq!(
            registry.keys().unwrap(),
            vec!["csv", "json", "ndjson", "sqlite", "template", "xlsx"]
        );
        assert!(registry.get("pdf").is_err());
    }

    #[test]
    fn request_template_options_override_definition() {
        let mut spec = RenderSpec::new(vec![]);
        spec.template = TemplateOptions {
            template: Some("base".into()),
            title: Some("Users".into()),
            data: BTreeMap::from([("a".to_string(), serde_json::json!(1))]),
            max_html_bytes: 100,
        };
        spec.options.template = TemplateRenderOptions {
            template: None,
            title: Some("Active users".into()),
            max_html_bytes: Some(50),
            data: BTreeMap::from([("b".to_string(), serde_json::json!(2))]),
        };
        let merged = spec.effective_template();
        assert_eq!(merged.template.as_deref(), Some("base"));
        assert_eq!(merged.title.as_deref(), Some("Active users"));
        assert_eq!(merged.max_html_bytes, 50);
        assert_eq!(merged.data.len(), 2);
    }
}
