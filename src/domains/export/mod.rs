//! Declarative export pipeline: definitions resolve requests, row sources feed
//! transformers and renderers, and the service delivers the result inline or
//! through the async queue and artifact store.

pub mod context;
pub mod definition;
pub mod delivery;
pub mod events;
pub mod handler;
pub mod idempotency;
pub mod io;
pub mod policy;
pub mod queue_manager;
pub mod registry;
pub mod resolver;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod source;
pub mod sources;
pub mod store;
pub mod tracker;
pub mod tracking;
pub mod transform;
pub mod types;
pub mod writers;

#[cfg(test)]
mod scenarios;

pub use context::{CancelHandle, ExportContext};
pub use definition::{
    DefinitionRegistry, DefinitionVariant, DeliveryPolicy, DeliveryThresholds, ExportDefinition, ExportPolicy,
    ResolvedDefinition, SelectionPolicy,
};
pub use events::{ChangeEvent, EventEmitter, LogEmitter, MetricsEvent, MetricsHook, Notifier};
pub use handler::{ExportHandler, RequestCarrier, ResponseCarrier};
pub use idempotency::{IdempotencyStore, MemoryIdempotencyStore};
pub use policy::{DeleteStrategy, QuotaHook, RateLimiter, RetentionPolicy, RetentionRules};
pub use queue_manager::{JobProcessor, LocalJobQueue};
pub use registry::{RendererRegistry, RowSourceRegistry, TransformerRegistry};
pub use resolver::ResolvedExport;
pub use runner::{IdGenerator, RunOutcome, Runner, RunnerConfig};
pub use scheduler::{AsyncScheduler, ExecutionMessage, JobQueue};
pub use service::{DownloadInfo, ExportPlan, ExportService, PlannedDelivery};
pub use source::{QueryDecoder, RowIterator, RowSource, RowSourceFactory, RowSourceSpec};
pub use store::{ArtifactStore, LocalArtifactStore, MemoryArtifactStore};
pub use tracker::{MemoryTracker, ProgressTracker};
pub use types::{
    Column, ColumnType, DeliveryMode, ExportRecord, ExportRequest, ExportState, Format, HistoryFilter, Row, Value,
};
pub use writers::Renderer;
