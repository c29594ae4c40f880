//! Transformer pipeline: streaming stages wrap the iterator, buffered stages
//! materialize it under the policy row/byte caps.

mod builtin;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use builtin::{AugmentTransformer, FilterTransformer, MapOp, MapTransformer, SortTransformer};

use crate::domains::export::context::ExportContext;
use crate::domains::export::io::MAX_BYTES_EXCEEDED;
use crate::domains::export::registry::{Registry, TransformerRegistry};
use crate::domains::export::source::{BoxRowIterator, VecRowIterator};
use crate::domains::export::tracking::{next_or_done, SchemaGuard};
use crate::domains::export::types::{Column, Row};
use crate::errors::{ErrorKind, ExportError, ExportResult};

/// Per-definition transformer entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    pub key: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl TransformerConfig {
    /// `options` should be a JSON object; anything else is ignored.
    pub fn new(key: impl Into<String>, options: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            options: match options {
                serde_json::Value::Object(map) => map,
                _ => serde_json::Map::new(),
            },
        }
    }

    pub fn decode_options<T: DeserializeOwned>(&self) -> ExportResult<T> {
        serde_json::from_value(serde_json::Value::Object(self.options.clone()))
            .map_err(|e| ExportError::validation(format!("invalid options: {}", e)))
    }
}

/// 1→1 / 1→0|1 / widening stage applied lazily per row.
pub trait StreamingTransformer: Send + Sync {
    fn wrap(&self, input: BoxRowIterator, schema: &[Column]) -> ExportResult<(BoxRowIterator, Vec<Column>)>;
}

/// Stage that needs the whole dataset, e.g. sorting.
pub trait BufferedTransformer: Send + Sync {
    fn process(&self, rows: Vec<Row>, schema: &[Column]) -> ExportResult<(Vec<Row>, Vec<Column>)>;
}

pub enum Transformer {
    Streaming(Box<dyn StreamingTransformer>),
    Buffered(Box<dyn BufferedTransformer>),
}

pub trait TransformerFactory: Send + Sync {
    fn create(&self, config: &TransformerConfig) -> ExportResult<Transformer>;
}

impl<F> TransformerFactory for F
where
    F: Fn(&TransformerConfig) -> ExportResult<Transformer> + Send + Sync,
{
    fn create(&self, config: &TransformerConfig) -> ExportResult<Transformer> {
        self(config)
    }
}

impl Registry<Arc<dyn TransformerFactory>> {
    /// Registry preloaded with `filter`, `map`, `augment` and `sort`.
    pub fn with_builtins() -> Self {
        let registry = Registry::new("transformer");
        let builtins: [(&str, Arc<dyn TransformerFactory>); 4] = [
            ("filter", Arc::new(|c: &TransformerConfig| {
                Ok(Transformer::Streaming(Box::new(FilterTransformer::from_config(c)?)))
            })),
            ("map", Arc::new(|c: &TransformerConfig| {
                Ok(Transformer::Streaming(Box::new(MapTransformer::from_config(c)?)))
            })),
            ("augment", Arc::new(|c: &TransformerConfig| {
                Ok(Transformer::Streaming(Box::new(AugmentTransformer::from_config(c)?)))
            })),
            ("sort", Arc::new(|c: &TransformerConfig| {
                Ok(Transformer::Buffered(Box::new(SortTransformer::from_config(c)?)))
            })),
        ];
        for (key, factory) in builtins {
            if let Err(err) = registry.register(key, factory) {
                log::error!(target: "export::transform", "builtin {}: {}", key, err);
            }
        }
        registry
    }
}

/// Caps applied while a buffered stage drains its input
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformLimits {
    pub max_rows: u64,
    pub max_bytes: u64,
}

/// Resolves `configs` in order and composes them over `input`.
pub async fn apply_transformers(
    ctx: &ExportContext,
    registry: &TransformerRegistry,
    configs: &[TransformerConfig],
    input: BoxRowIterator,
    schema: Vec<Column>,
    limits: TransformLimits,
) -> ExportResult<(BoxRowIterator, Vec<Column>)> {
    let mut iter = input;
    let mut schema = schema;

    for config in configs {
        let factory = registry.get(&config.key).map_err(|err| match err.kind() {
            ErrorKind::NotFound => ExportError::validation(format!("unknown transformer: {}", config.key)),
            _ => err,
        })?;
        let transformer = factory
            .create(config)
            .map_err(|err| ExportError::validation(format!("transformer {}: {}", config.key, err)))?;

        let (next, next_schema) = match transformer {
            Transformer::Streaming(stage) => {
                let (wrapped, next_schema) = stage.wrap(iter, &schema)?;
                if next_schema.len() < schema.len() {
                    return Err(ExportError::validation(format!(
                        "streaming transformer {} dropped columns",
                        config.key
                    )));
                }
                (wrapped, next_schema)
            }
            Transformer::Buffered(stage) => {
                let rows = drain_bounded(ctx, iter, limits).await?;
                let (rows, next_schema) = stage.process(rows, &schema)?;
                (Box::new(VecRowIterator::new(rows)) as BoxRowIterator, next_schema)
            }
        };

        log::debug!(
            target: "export::transform",
            "applied {} ({} -> {} columns)",
            config.key,
            schema.len(),
            next_schema.len()
        );
        iter = Box::new(SchemaGuard::new(next, next_schema.len(), config.key.clone()));
        schema = next_schema;
    }

    Ok((iter, schema))
}

async fn drain_bounded(ctx: &ExportContext, mut iter: BoxRowIterator, limits: TransformLimits) -> ExportResult<Vec<Row>> {
    let mut rows = Vec::new();
    let mut bytes: u64 = 0;
    while let Some(row) = next_or_done(ctx, iter.as_mut()).await? {
        if limits.max_rows > 0 && rows.len() as u64 >= limits.max_rows {
            return Err(ExportError::validation(format!("max rows exceeded ({})", limits.max_rows)));
        }
        bytes += row.iter().map(|v| v.text_len() as u64).sum::<u64>();
        if limits.max_bytes > 0 && bytes > limits.max_bytes {
            return Err(ExportError::validation(MAX_BYTES_EXCEEDED));
        }
        rows.push(row);
    }
    Ok(rows)
}
