//! Row producers: iterator contract, source factories and an in-memory source.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::auth::Actor;
use crate::domains::export::context::ExportContext;
use crate::domains::export::definition::ResolvedDefinition;
use crate::domains::export::types::{Column, ExportRequest, Row, Selection, SelectionMode, Value};
use crate::errors::{ExportError, ExportResult};

/// Pull-based row stream. Callers never invoke `next` concurrently.
#[async_trait]
pub trait RowIterator: Send {
    /// `Ok(None)` at end of stream.
    async fn next(&mut self, ctx: &ExportContext) -> ExportResult<Option<Row>>;

    async fn close(&mut self) -> ExportResult<()> {
        Ok(())
    }
}

pub type BoxRowIterator = Box<dyn RowIterator>;

/// Everything a source needs to open an iterator for one run
#[derive(Debug, Clone)]
pub struct RowSourceSpec {
    pub definition: ResolvedDefinition,
    pub request: ExportRequest,
    pub selection: Selection,
    /// Projected columns, in output order
    pub columns: Vec<Column>,
    /// Query after the decoder hook, if any
    pub query: Option<serde_json::Value>,
    pub actor: Actor,
}

#[async_trait]
pub trait RowSource: Send + Sync {
    async fn open(&self, ctx: &ExportContext, spec: &RowSourceSpec) -> ExportResult<BoxRowIterator>;
}

/// Creates a per-request source.
pub trait RowSourceFactory: Send + Sync {
    fn create(
        &self,
        request: &ExportRequest,
        definition: &ResolvedDefinition,
    ) -> ExportResult<Box<dyn RowSource>>;
}

impl<F> RowSourceFactory for F
where
    F: Fn(&ExportRequest, &ResolvedDefinition) -> ExportResult<Box<dyn RowSource>> + Send + Sync,
{
    fn create(
        &self,
        request: &ExportRequest,
        definition: &ResolvedDefinition,
    ) -> ExportResult<Box<dyn RowSource>> {
        self(request, definition)
    }
}

/// Factory handing out clones of one shared source.
pub struct SharedSourceFactory<S> {
    source: Arc<S>,
}

impl<S: RowSource + 'static> SharedSourceFactory<S> {
    pub fn new(source: S) -> Self {
        Self {
            source: Arc::new(source),
        }
    }
}

struct SharedSource<S>(Arc<S>);

#[async_trait]
impl<S: RowSource + 'static> RowSource for SharedSource<S> {
    async fn open(&self, ctx: &ExportContext, spec: &RowSourceSpec) -> ExportResult<BoxRowIterator> {
        self.0.open(ctx, spec).await
    }
}

impl<S: RowSource + 'static> RowSourceFactory for SharedSourceFactory<S> {
    fn create(&self, _: &ExportRequest, _: &ResolvedDefinition) -> ExportResult<Box<dyn RowSource>> {
        Ok(Box::new(SharedSource(self.source.clone())))
    }
}

/// Maps `(definition, variant, raw query)` to the value handed to the source.
pub trait QueryDecoder: Send + Sync {
    fn decode(
        &self,
        definition: &str,
        variant: Option<&str>,
        raw: &serde_json::Value,
    ) -> ExportResult<serde_json::Value>;
}

/// Iterator over rows already in memory
pub struct VecRowIterator {
    rows: std::vec::IntoIter<Row>,
}

impl VecRowIterator {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

#[async_trait]
impl RowIterator for VecRowIterator {
    async fn next(&mut self, ctx: &ExportContext) -> ExportResult<Option<Row>> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        Ok(self.rows.next())
    }
}

/// Source over a fixed table of rows, projected to the requested columns.
#[derive(Debug, Clone)]
pub struct StaticRowSource {
    columns: Vec<String>,
    rows: Vec<Row>,
    id_column: Option<String>,
}

impl StaticRowSource {
    /// `columns` names the positions of `rows`.
    pub fn new<I, S>(columns: I, rows: Vec<Row>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows,
            id_column: None,
        }
    }

    /// Column matched against `selection.ids`; defaults to `id`.
    pub fn with_id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = Some(column.into());
        self
    }

    fn position(&self, name: &str) -> ExportResult<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| ExportError::validation(format!("source has no column {}", name)))
    }
}

#[async_trait]
impl RowSource for StaticRowSource {
    async fn open(&self, ctx: &ExportContext, spec: &RowSourceSpec) -> ExportResult<BoxRowIterator> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let positions = spec
            .columns
            .iter()
            .map(|c| self.position(&c.name))
            .collect::<ExportResult<Vec<usize>>>()?;

        let wanted: Option<(usize, HashSet<&str>)> = match spec.selection.effective_mode() {
            SelectionMode::All => None,
            SelectionMode::Ids => {
                let id_column = self.id_column.as_deref().unwrap_or("id");
                let ids = spec.selection.ids.iter().map(String::as_str).collect();
                Some((self.position(id_column)?, ids))
            }
            SelectionMode::Query => {
                return Err(ExportError::validation(
                    "static source does not support query selection",
                ))
            }
        };

        let rows = self
            .rows
            .iter()
            .filter(|row| match &wanted {
                None => true,
                Some((index, ids)) => row
                    .get(*index)
                    .map(|v| ids.contains(v.to_string().as_str()))
                    .unwrap_or(false),
            })
            .map(|row| {
                positions
                    .iter()
                    .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
                    .collect::<Row>()
            })
            .collect();

        Ok(Box::new(VecRowIterator::new(rows)))
    }
}

/// Shared handle over the iterator a source opened. The runner keeps one
/// clone to close the source on every exit path while the pipeline owns the
/// other. Closing is idempotent; a closed handle yields end of stream.
#[derive(Clone)]
pub struct SharedRowIterator {
    inner: Arc<tokio::sync::Mutex<Option<BoxRowIterator>>>,
}

impl SharedRowIterator {
    pub fn new(inner: BoxRowIterator) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(Some(inner))),
        }
    }
}

#[async_trait]
impl RowIterator for SharedRowIterator {
    async fn next(&mut self, ctx: &ExportContext) -> ExportResult<Option<Row>> {
        let mut guard = self.inner.lock().await;
        match guard.as_mut() {
            Some(iter) => iter.next(ctx).await,
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> ExportResult<()> {
        let taken = self.inner.lock().await.take();
        match taken {
            Some(mut iter) => iter.close().await,
            None => Ok(()),
        }
    }
}

/// Drains an iterator into memory. Test helper and buffered-stage building block.
pub async fn collect_rows(ctx: &ExportContext, iter: &mut dyn RowIterator) -> ExportResult<Vec<Row>> {
    let mut rows = Vec::new();
    while let Some(row) = iter.next(ctx).await? {
        rows.push(row);
    }
    Ok(rows)
}
