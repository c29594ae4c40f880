use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domains::export::context::ExportContext;
use crate::domains::export::source::{BoxRowIterator, RowIterator};
use crate::domains::export::tracker::{ProgressDelta, ProgressTracker};
use crate::domains::export::types::{Row, Value};
use crate::errors::{ExportError, ExportResult};

/// Pulls the next row, returning early when the context fires so a
/// blocked source cannot outlive its deadline.
pub(crate) async fn next_or_done(
    ctx: &ExportContext,
    inner: &mut dyn RowIterator,
) -> ExportResult<Option<Row>> {
    if let Some(err) = ctx.err() {
        return Err(err);
    }
    if !ctx.is_bounded() {
        return inner.next(ctx).await;
    }
    tokio::select! {
        biased;
        err = ctx.done() => Err(err),
        row = inner.next(ctx) => row,
    }
}

/// Wraps the source iterator: row-length check, `max_rows`, redaction, progress.
pub struct TrackingIterator {
    inner: BoxRowIterator,
    export_id: String,
    expected_len: usize,
    max_rows: u64,
    redactions: Vec<(usize, Value)>,
    tracker: Option<Arc<dyn ProgressTracker>>,
    tolerate_advance_errors: bool,
    count: u64,
}

impl TrackingIterator {
    pub fn new(inner: BoxRowIterator, export_id: impl Into<String>, expected_len: usize) -> Self {
        Self {
            inner,
            export_id: export_id.into(),
            expected_len,
            max_rows: 0,
            redactions: Vec::new(),
            tracker: None,
            tolerate_advance_errors: false,
            count: 0,
        }
    }

    pub fn with_max_rows(mut self, max_rows: u64) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn with_redactions(mut self, redactions: &BTreeMap<usize, String>) -> Self {
        self.redactions = redactions
            .iter()
            .map(|(index, value)| (*index, Value::String(value.clone())))
            .collect();
        self
    }

    pub fn with_tracker(mut self, tracker: Option<Arc<dyn ProgressTracker>>, tolerate_errors: bool) -> Self {
        self.tracker = tracker;
        self.tolerate_advance_errors = tolerate_errors;
        self
    }

    pub fn rows_seen(&self) -> u64 {
        self.count
    }
}

#[async_trait]
impl RowIterator for TrackingIterator {
    async fn next(&mut self, ctx: &ExportContext) -> ExportResult<Option<Row>> {
        let Some(mut row) = next_or_done(ctx, self.inner.as_mut()).await? else {
            return Ok(None);
        };

        if row.len() != self.expected_len {
            return Err(ExportError::validation(format!(
                "row {} has {} values, expected {}",
                self.count + 1,
                row.len(),
                self.expected_len
            )));
        }

        self.count += 1;
        if self.max_rows > 0 && self.count > self.max_rows {
            return Err(ExportError::validation(format!(
                "max rows exceeded ({})",
                self.max_rows
            )));
        }

        for (index, value) in &self.redactions {
            if let Some(slot) = row.get_mut(*index) {
                *slot = value.clone();
            }
        }

        if let Some(tracker) = &self.tracker {
            let delta = ProgressDelta {
                rows: 1,
                ..Default::default()
            };
            if let Err(err) = tracker.advance(&self.export_id, delta).await {
                if !self.tolerate_advance_errors {
                    return Err(err);
                }
                log::warn!(
                    target: "export::tracking",
                    "export {}: ignoring progress error: {}",
                    self.export_id,
                    err
                );
            }
        }

        Ok(Some(row))
    }

    async fn close(&mut self) -> ExportResult<()> {
        self.inner.close().await
    }
}

/// Fails the run when a stage yields rows that do not match its schema.
pub struct SchemaGuard {
    inner: BoxRowIterator,
    expected_len: usize,
    stage: String,
}

impl SchemaGuard {
    pub fn new(inner: BoxRowIterator, expected_len: usize, stage: impl Into<String>) -> Self {
        Self {
            inner,
            expected_len,
            stage: stage.into(),
        }
    }
}

#[async_trait]
impl RowIterator for SchemaGuard {
    async fn next(&mut self, ctx: &ExportContext) -> ExportResult<Option<Row>> {
        match self.inner.next(ctx).await? {
            Some(row) if row.len() != self.expected_len => Err(ExportError::validation(format!(
                "transformer {} produced {} values, schema has {}",
                self.stage,
                row.len(),
                self.expected_len
            ))),
            other => Ok(other),
        }
    }

    async fn close(&mut self) -> ExportResult<()> {
        self.inner.close().await
    }
}
