use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::AsyncWriteExt;

use super::template_writer::TemplateRenderer;
use super::{OutputWriter, RenderSpec, RenderStats, Renderer};
use crate::domains::export::context::ExportContext;
use crate::domains::export::io::CountingWriter;
use crate::domains::export::source::RowIterator;
use crate::domains::export::types::{ExternalAssets, PdfMargins, PdfOptions};
use crate::errors::{ExportError, ExportResult};

static MARGIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+(\.\d+)?(mm|cm|in|px|pt)?$").expect("margin pattern"));
static BASE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(https?|file)://\S+$").expect("base url pattern"));

const PAGE_SIZES: [&str; 6] = ["A3", "A4", "A5", "Letter", "Legal", "Tabloid"];

/// Validated options handed to a [`PdfEngine`]
#[derive(Debug, Clone, PartialEq)]
pub struct PdfSettings {
    pub page_size: String,
    pub margins: PdfMargins,
    pub scale: f64,
    pub print_background: bool,
    pub base_url: Option<String>,
    pub external_assets: ExternalAssets,
}

impl PdfSettings {
    pub fn from_options(options: &PdfOptions) -> ExportResult<Self> {
        let page_size = match options.page_size.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            None => "A4".to_string(),
            Some(raw) => PAGE_SIZES
                .iter()
                .find(|size| size.eq_ignore_ascii_case(raw))
                .map(|size| size.to_string())
                .ok_or_else(|| ExportError::validation(format!("unsupported page size: {}", raw)))?,
        };

        let margins = &options.margins;
        for (side, value) in [
            ("top", &margins.top),
            ("right", &margins.right),
            ("bottom", &margins.bottom),
            ("left", &margins.left),
        ] {
            if let Some(value) = value {
                if !MARGIN.is_match(value.trim()) {
                    return Err(ExportError::validation(format!("invalid {} margin: {}", side, value)));
                }
            }
        }

        let scale = options.scale.unwrap_or(1.0);
        if !(0.1..=2.0).contains(&scale) {
            return Err(ExportError::validation(format!("pdf scale must be between 0.1 and 2.0, got {}", scale)));
        }

        let base_url = options.base_url.as_ref().map(|u| u.trim().to_string()).filter(|u| !u.is_empty());
        if let Some(url) = &base_url {
            if !BASE_URL.is_match(url) {
                return Err(ExportError::validation(format!("invalid base url: {}", url)));
            }
        }

        Ok(Self {
            page_size,
            margins: margins.clone(),
            scale,
            print_background: options.print_background.unwrap_or(false),
            base_url,
            external_assets: options.external_assets.unwrap_or_default(),
        })
    }
}

/// HTML-to-PDF conversion backend.
#[async_trait]
pub trait PdfEngine: Send + Sync {
    async fn render(&self, ctx: &ExportContext, html: Vec<u8>, settings: &PdfSettings) -> ExportResult<Vec<u8>>;
}

/// Template renderer followed by a PDF engine.
#[derive(Clone)]
pub struct PdfRenderer {
    html: TemplateRenderer,
    engine: Arc<dyn PdfEngine>,
}

impl PdfRenderer {
    pub fn new(html: TemplateRenderer, engine: Arc<dyn PdfEngine>) -> Self {
        Self { html, engine }
    }
}

#[async_trait]
impl Renderer for PdfRenderer {
    async fn render(
        &self,
        ctx: &ExportContext,
        spec: &RenderSpec,
        rows: &mut dyn RowIterator,
        out: &mut OutputWriter<'_>,
    ) -> ExportResult<RenderStats> {
        let settings = PdfSettings::from_options(&spec.options.pdf)?;
        let (html, count) = self.html.render_html(ctx, spec, rows).await?;
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let pdf = self.engine.render(ctx, html, &settings).await?;

        let mut out = CountingWriter::new(out);
        out.write_all(&pdf).await?;
        out.flush().await?;
        Ok(RenderStats {
            rows: count,
            bytes: out.bytes_written(),
        })
    }
}
