//! Lifecycle and metrics events emitted by the runner and service.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domains::export::types::{DeliveryMode, ExportRecord, Format};
use crate::errors::{ExportError, ExportResult};

pub const EVENT_REQUESTED: &str = "export.requested";
pub const EVENT_STARTED: &str = "export.started";
pub const EVENT_COMPLETED: &str = "export.completed";
pub const EVENT_FAILED: &str = "export.failed";
pub const EVENT_CANCELED: &str = "export.canceled";
pub const EVENT_DELETED: &str = "export.deleted";

/// Fixed metadata keys written by the engine itself
pub mod meta {
    pub const COLUMNS: &str = "columns";
    pub const SELECTION_MODE: &str = "selection_mode";
    pub const SELECTION_COUNT: &str = "selection_count";
    pub const ESTIMATED_ROWS: &str = "estimated_rows";
    pub const ESTIMATED_BYTES: &str = "estimated_bytes";
    pub const ESTIMATED_DURATION: &str = "estimated_duration";
    pub const FILENAME: &str = "filename";
    pub const ROWS: &str = "rows";
    pub const BYTES: &str = "bytes";
    pub const DURATION: &str = "duration";
    pub const ERROR: &str = "error";
    pub const ERROR_KIND: &str = "error_kind";
    pub const STAGE: &str = "stage";
}

pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Error metadata as stored on failed records and failure events.
pub fn error_metadata(stage: Option<&str>, err: &ExportError) -> Metadata {
    let mut metadata = Metadata::new();
    if let Some(stage) = stage {
        metadata.insert(meta::STAGE.into(), stage.into());
    }
    metadata.insert(meta::ERROR.into(), err.message().into());
    metadata.insert(meta::ERROR_KIND.into(), err.kind().code().into());
    metadata
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub name: String,
    pub export_id: String,
    pub definition: String,
    pub format: Format,
    pub delivery: DeliveryMode,
    pub actor_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ChangeEvent {
    pub fn meta(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }
}

/// Per-run measurements, emitted once at the end of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsEvent {
    pub name: String,
    pub export_id: String,
    pub definition: String,
    pub format: Format,
    pub delivery: DeliveryMode,
    pub actor_id: String,
    pub timestamp: DateTime<Utc>,
    pub rows: u64,
    pub bytes: u64,
    pub duration: Duration,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

/// Fire-and-forget sink for lifecycle events.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: &ChangeEvent);
}

pub trait MetricsHook: Send + Sync {
    fn observe(&self, event: &MetricsEvent);
}

/// Writes every event to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEmitter;

impl EventEmitter for LogEmitter {
    fn emit(&self, event: &ChangeEvent) {
        log::info!(
            target: "export::events",
            "{} id={} definition={} format={} actor={}",
            event.name,
            event.export_id,
            event.definition,
            event.format,
            event.actor_id
        );
    }
}

impl MetricsHook for LogEmitter {
    fn observe(&self, event: &MetricsEvent) {
        log::info!(
            target: "export::metrics",
            "{} id={} rows={} bytes={} duration_ms={} success={}",
            event.name,
            event.export_id,
            event.rows,
            event.bytes,
            event.duration.as_millis(),
            event.success
        );
    }
}

/// Keeps events in memory in emission order.
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<ChangeEvent>>,
    metrics: Mutex<Vec<MetricsEvent>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn metrics(&self) -> Vec<MetricsEvent> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Event names recorded for one export, in order.
    pub fn names_for(&self, export_id: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.export_id == export_id)
            .map(|e| e.name)
            .collect()
    }
}

impl EventEmitter for RecordingEmitter {
    fn emit(&self, event: &ChangeEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

impl MetricsHook for RecordingEmitter {
    fn observe(&self, event: &MetricsEvent) {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Delivery channel for finished async exports (email, webhook, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, record: &ExportRecord) -> ExportResult<()>;
}
