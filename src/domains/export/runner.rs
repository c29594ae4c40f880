//! The export pipeline: resolve, authorize, open the source, track, transform, render.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::auth::{Actor, ActorProvider, ExportGuard};
use crate::domains::export::context::ExportContext;
use crate::domains::export::definition::{DefinitionRegistry, DeliveryPolicy, ResolvedDefinition};
use crate::domains::export::delivery::select_delivery;
use crate::domains::export::events::{
    error_metadata, meta, ChangeEvent, EventEmitter, Metadata, MetricsEvent, MetricsHook, EVENT_CANCELED,
    EVENT_COMPLETED, EVENT_FAILED, EVENT_REQUESTED, EVENT_STARTED,
};
use crate::domains::export::io::LimitedWriter;
use crate::domains::export::policy::{QuotaHook, RetentionPolicy};
use crate::domains::export::registry::{RendererRegistry, RowSourceRegistry, TransformerRegistry};
use crate::domains::export::resolver::{resolve_export, ResolvedExport};
use crate::domains::export::source::{BoxRowIterator, QueryDecoder, RowIterator, RowSourceSpec, SharedRowIterator};
use crate::domains::export::tracker::{CompletionMeta, ProgressTracker};
use crate::domains::export::tracking::TrackingIterator;
use crate::domains::export::transform::{apply_transformers, TransformLimits};
use crate::domains::export::types::{DeliveryMode, ExportRecord, ExportRequest, ExportState, Format};
use crate::domains::export::writers::{OutputWriter, RenderSpec, RenderStats};
use crate::errors::{ErrorKind, ExportError, ExportResult};

/// Source of export ids.
#[derive(Debug, Clone, Default)]
pub enum IdGenerator {
    #[default]
    Uuid,
    /// `{prefix}{n}` with `n` counting from 1
    Sequence { prefix: String, next: Arc<AtomicU64> },
    /// Always the same id; used when the record already exists
    Fixed(String),
}

impl IdGenerator {
    pub fn sequence(prefix: impl Into<String>) -> Self {
        IdGenerator::Sequence {
            prefix: prefix.into(),
            next: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn fixed(id: impl Into<String>) -> Self {
        IdGenerator::Fixed(id.into())
    }

    pub fn next_id(&self) -> String {
        match self {
            IdGenerator::Uuid => Uuid::new_v4().to_string(),
            IdGenerator::Sequence { prefix, next } => {
                format!("{}{}", prefix, next.fetch_add(1, Ordering::Relaxed))
            }
            IdGenerator::Fixed(id) => id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    /// Log tracker `advance` failures instead of aborting the run.
    pub tolerate_advance_errors: bool,
    /// Base thresholds for `auto` delivery
    pub delivery: DeliveryPolicy,
}

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub export_id: String,
    pub definition: String,
    pub variant: Option<String>,
    pub format: Format,
    pub delivery: DeliveryMode,
    pub filename: String,
    pub content_type: String,
    pub actor: Actor,
    pub rows: u64,
    pub bytes: u64,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

impl RunOutcome {
    /// Completed record for runs that had no tracker.
    pub fn to_record(&self) -> ExportRecord {
        let mut record = ExportRecord::queued(
            self.export_id.clone(),
            self.definition.clone(),
            self.format,
            self.delivery,
            &self.actor,
            self.started_at,
        );
        record.variant = self.variant.clone();
        record.state = ExportState::Completed;
        record.counts.processed = self.rows;
        record.counts.total = self.rows;
        record.bytes_written = self.bytes;
        record.started_at = Some(self.started_at);
        record.completed_at = Some(self.completed_at);
        record.expires_at = self.expires_at;
        record.metadata = self.metadata.clone();
        record
    }
}

/// Where a failure happened, kept in record metadata.
type StageError = (&'static str, ExportError);

fn at(stage: &'static str) -> impl FnOnce(ExportError) -> StageError {
    move |err| (stage, err)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Per-run values shared by event emission and record updates.
struct RunScope {
    export_id: String,
    definition: String,
    format: Format,
    delivery: DeliveryMode,
    actor_id: String,
    tracked: bool,
}

impl RunScope {
    fn from_record(record: &ExportRecord) -> Self {
        Self {
            export_id: record.id.clone(),
            definition: record.definition.clone(),
            format: record.format,
            delivery: record.delivery,
            actor_id: record.actor_id.clone(),
            tracked: true,
        }
    }

    fn from_outcome(outcome: &RunOutcome) -> Self {
        Self {
            export_id: outcome.export_id.clone(),
            definition: outcome.definition.clone(),
            format: outcome.format,
            delivery: outcome.delivery,
            actor_id: outcome.actor.id.clone(),
            tracked: true,
        }
    }
}

/// Executes one export end to end. Cheap to clone; every collaborator is shared.
#[derive(Clone)]
pub struct Runner {
    definitions: Arc<DefinitionRegistry>,
    sources: Arc<RowSourceRegistry>,
    renderers: Arc<RendererRegistry>,
    transformers: Arc<TransformerRegistry>,
    tracker: Option<Arc<dyn ProgressTracker>>,
    guard: Option<Arc<dyn ExportGuard>>,
    actors: Option<Arc<dyn ActorProvider>>,
    quota: Option<Arc<dyn QuotaHook>>,
    emitter: Option<Arc<dyn EventEmitter>>,
    metrics: Option<Arc<dyn MetricsHook>>,
    retention: Option<Arc<dyn RetentionPolicy>>,
    decoder: Option<Arc<dyn QueryDecoder>>,
    ids: IdGenerator,
    config: RunnerConfig,
}

impl Runner {
    /// Runner with the default renderers and built-in transformers.
    pub fn new(definitions: Arc<DefinitionRegistry>, sources: Arc<RowSourceRegistry>) -> Self {
        Self {
            definitions,
            sources,
            renderers: Arc::new(RendererRegistry::with_defaults()),
            transformers: Arc::new(TransformerRegistry::with_builtins()),
            tracker: None,
            guard: None,
            actors: None,
            quota: None,
            emitter: None,
            metrics: None,
            retention: None,
            decoder: None,
            ids: IdGenerator::default(),
            config: RunnerConfig::default(),
        }
    }

    pub fn with_renderers(mut self, renderers: Arc<RendererRegistry>) -> Self {
        self.renderers = renderers;
        self
    }

    pub fn with_transformers(mut self, transformers: Arc<TransformerRegistry>) -> Self {
        self.transformers = transformers;
        self
    }

    pub fn with_tracker(mut self, tracker: Option<Arc<dyn ProgressTracker>>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_guard(mut self, guard: Arc<dyn ExportGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn with_actor_provider(mut self, provider: Arc<dyn ActorProvider>) -> Self {
        self.actors = Some(provider);
        self
    }

    pub fn with_quota(mut self, quota: Option<Arc<dyn QuotaHook>>) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsHook>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_retention(mut self, retention: Arc<dyn RetentionPolicy>) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn with_query_decoder(mut self, decoder: Arc<dyn QueryDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn with_id_generator(mut self, ids: IdGenerator) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn definitions(&self) -> &Arc<DefinitionRegistry> {
        &self.definitions
    }

    pub fn tracker(&self) -> Option<&Arc<dyn ProgressTracker>> {
        self.tracker.as_ref()
    }

    pub fn guard(&self) -> Option<&Arc<dyn ExportGuard>> {
        self.guard.as_ref()
    }

    pub fn quota(&self) -> Option<&Arc<dyn QuotaHook>> {
        self.quota.as_ref()
    }

    pub fn emitter(&self) -> Option<&Arc<dyn EventEmitter>> {
        self.emitter.as_ref()
    }

    pub fn retention(&self) -> Option<&Arc<dyn RetentionPolicy>> {
        self.retention.as_ref()
    }

    pub fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Resolves the request against its definition without running it.
    pub fn resolve(&self, request: &ExportRequest) -> ExportResult<(ResolvedDefinition, ResolvedExport, DeliveryMode)> {
        let definition = self.definitions.resolve(request)?;
        let resolved = resolve_export(request, &definition, Utc::now())?;
        let delivery = select_delivery(&resolved.request, &definition, &self.config.delivery);
        Ok((definition, resolved, delivery))
    }

    /// Runs a synchronous export, rendering into `output`.
    pub async fn run(
        &self,
        ctx: &ExportContext,
        request: &ExportRequest,
        output: &mut OutputWriter<'_>,
    ) -> ExportResult<RunOutcome> {
        self.run_as(ctx, request, output, DeliveryMode::Sync).await
    }

    /// Worker entry for async exports whose record was created up front.
    pub(crate) async fn run_async_job(
        &self,
        ctx: &ExportContext,
        request: &ExportRequest,
        output: &mut OutputWriter<'_>,
    ) -> ExportResult<RunOutcome> {
        self.run_as(ctx, request, output, DeliveryMode::Async).await
    }

    async fn run_as(
        &self,
        ctx: &ExportContext,
        request: &ExportRequest,
        output: &mut OutputWriter<'_>,
        mode: DeliveryMode,
    ) -> ExportResult<RunOutcome> {
        let clock = tokio::time::Instant::now();
        let started_at = Utc::now();

        let (definition, resolved, delivery) = self.resolve(request)?;
        if mode == DeliveryMode::Sync && delivery == DeliveryMode::Async {
            return Err(ExportError::validation(
                "runner executes sync exports only; async delivery goes through the export service",
            ));
        }

        let actor = self.resolve_actor(ctx).await?;
        if let Some(guard) = &self.guard {
            guard.authorize_export(&actor, &resolved.request, &definition).await?;
        }
        if let Some(quota) = &self.quota {
            quota.allow(&actor, &resolved.request, &definition).await?;
        }

        let policy = &definition.policy;
        let ctx = if policy.max_duration.is_zero() {
            ctx.clone()
        } else {
            ctx.with_timeout(policy.max_duration)
        };

        let export_id = self.ids.next_id();
        let mut record = ExportRecord::queued(
            export_id.clone(),
            definition.name.clone(),
            resolved.format,
            mode,
            &actor,
            started_at,
        );
        record.variant = definition.variant.clone();
        record.metadata = request_metadata(&resolved);
        if let Some(retention) = &self.retention {
            record.expire_after(retention.ttl(&actor, &resolved.request, &definition));
        }
        let expires_at = record.expires_at;

        let mut scope = RunScope {
            export_id: export_id.clone(),
            definition: definition.name.clone(),
            format: resolved.format,
            delivery: mode,
            actor_id: actor.id.clone(),
            tracked: false,
        };

        if let Some(tracker) = &self.tracker {
            tracker.start(record.clone()).await?;
            scope.tracked = true;
            if let Err(err) = tracker.set_state(&export_id, ExportState::Running).await {
                return Err(self.finish_failure(&ctx, &scope, clock, ("start", err)).await);
            }
        }

        log::info!(
            target: "export::runner",
            "export {} started: definition={} format={} delivery={} actor={}",
            export_id,
            definition.name,
            resolved.format,
            mode,
            actor.id
        );
        log::debug!(
            target: "export::runner",
            "export {} columns={:?} filename={} max_rows={} max_bytes={} max_duration={:?}",
            export_id,
            resolved.column_names,
            resolved.filename,
            policy.max_rows,
            policy.max_bytes,
            policy.max_duration
        );
        if mode == DeliveryMode::Sync {
            self.emit(&scope, EVENT_REQUESTED, record.metadata.clone());
        }
        self.emit(&scope, EVENT_STARTED, Metadata::new());

        let stats = match self.execute(&ctx, &definition, &resolved, &actor, &export_id, output).await {
            Ok(stats) => stats,
            Err(failure) => return Err(self.finish_failure(&ctx, &scope, clock, failure).await),
        };

        let duration = clock.elapsed();
        let mut metadata = Metadata::new();
        metadata.insert(meta::ROWS.into(), stats.rows.into());
        metadata.insert(meta::BYTES.into(), stats.bytes.into());
        metadata.insert(meta::DURATION.into(), millis(duration).into());
        metadata.insert(meta::FILENAME.into(), resolved.filename.clone().into());

        if let Some(tracker) = &self.tracker {
            let completion = CompletionMeta {
                rows: stats.rows,
                bytes: stats.bytes,
                metadata: metadata.clone(),
            };
            if let Err(err) = tracker.complete(&export_id, completion).await {
                return Err(self.finish_failure(&ctx, &scope, clock, ("complete", err)).await);
            }
        }

        log::info!(
            target: "export::runner",
            "export {} rendered: rows={} bytes={} duration={:?}",
            export_id,
            stats.rows,
            stats.bytes,
            duration
        );
        // async runs are announced once the artifact is published
        if mode == DeliveryMode::Sync {
            self.emit(&scope, EVENT_COMPLETED, metadata.clone());
            self.observe(&scope, stats, None, duration);
        }

        let mut outcome_metadata = record.metadata;
        outcome_metadata.extend(metadata);
        Ok(RunOutcome {
            export_id,
            definition: definition.name.clone(),
            variant: definition.variant.clone(),
            format: resolved.format,
            delivery: mode,
            filename: resolved.filename.clone(),
            content_type: resolved.format.content_type().to_string(),
            actor,
            rows: stats.rows,
            bytes: stats.bytes,
            duration,
            started_at,
            completed_at: Utc::now(),
            expires_at,
            metadata: outcome_metadata,
        })
    }

    async fn resolve_actor(&self, ctx: &ExportContext) -> ExportResult<Actor> {
        match &self.actors {
            Some(provider) => provider.actor(ctx).await.map_err(|err| match err.kind() {
                ErrorKind::Authz => err,
                _ => ExportError::authz(format!("cannot resolve actor: {}", err.message())),
            }),
            None => Ok(ctx.actor().cloned().unwrap_or_default()),
        }
    }

    /// Opens the source and drives it through the pipeline, closing it on every path.
    async fn execute(
        &self,
        ctx: &ExportContext,
        definition: &ResolvedDefinition,
        resolved: &ResolvedExport,
        actor: &Actor,
        export_id: &str,
        output: &mut OutputWriter<'_>,
    ) -> Result<RenderStats, StageError> {
        let factory = self.sources.get(&definition.row_source).map_err(at("source"))?;
        let source = factory.create(&resolved.request, definition).map_err(at("source"))?;

        let query = match (&self.decoder, &resolved.request.query) {
            (Some(decoder), Some(raw)) => Some(
                decoder
                    .decode(&definition.name, definition.variant.as_deref(), raw)
                    .map_err(at("source"))?,
            ),
            (_, query) => query.clone(),
        };
        let spec = RowSourceSpec {
            definition: definition.clone(),
            request: resolved.request.clone(),
            selection: resolved.selection.clone(),
            columns: resolved.columns.clone(),
            query,
            actor: actor.clone(),
        };

        let opened = source.open(ctx, &spec).await.map_err(at("source"))?;
        let mut handle = SharedRowIterator::new(opened);
        let result = self
            .pipeline(ctx, definition, resolved, export_id, Box::new(handle.clone()), output)
            .await;
        if let Err(err) = handle.close().await {
            log::warn!(target: "export::runner", "export {}: closing source: {}", export_id, err);
        }
        result
    }

    async fn pipeline(
        &self,
        ctx: &ExportContext,
        definition: &ResolvedDefinition,
        resolved: &ResolvedExport,
        export_id: &str,
        source: BoxRowIterator,
        output: &mut OutputWriter<'_>,
    ) -> Result<RenderStats, StageError> {
        let policy = &definition.policy;
        let tracked = TrackingIterator::new(source, export_id, resolved.columns.len())
            .with_max_rows(policy.max_rows)
            .with_redactions(&resolved.redact_indices)
            .with_tracker(self.tracker.clone(), self.config.tolerate_advance_errors);

        let limits = TransformLimits {
            max_rows: policy.max_rows,
            max_bytes: policy.max_bytes,
        };
        let (mut rows, columns) = apply_transformers(
            ctx,
            &self.transformers,
            &definition.transformers,
            Box::new(tracked),
            resolved.columns.clone(),
            limits,
        )
        .await
        .map_err(at("transform"))?;

        let renderer = self.renderers.get(resolved.format.as_str()).map_err(at("render"))?;
        let mut spec = RenderSpec::new(columns).with_options(resolved.request.render_options.clone());
        spec.export_id = export_id.to_string();
        spec.definition = definition.name.clone();
        spec.filename = resolved.filename.clone();
        spec.template = definition.template.clone();

        let rendered = if policy.max_bytes > 0 {
            let mut limited = LimitedWriter::new(&mut *output, policy.max_bytes);
            renderer.render(ctx, &spec, rows.as_mut(), &mut limited).await
        } else {
            renderer.render(ctx, &spec, rows.as_mut(), output).await
        };
        rendered.map_err(at("render"))
    }

    /// Moves the record to its terminal state and emits the matching event.
    async fn finish_failure(
        &self,
        ctx: &ExportContext,
        scope: &RunScope,
        clock: tokio::time::Instant,
        failure: StageError,
    ) -> ExportError {
        let (stage, err) = failure;
        let err = match ctx.err() {
            Some(canceled) if canceled.kind() == ErrorKind::Canceled => canceled,
            _ => err,
        };

        let mut metadata = error_metadata(Some(stage), &err);
        metadata.insert(meta::DURATION.into(), millis(clock.elapsed()).into());

        if err.kind() == ErrorKind::Canceled {
            if let (Some(tracker), true) = (&self.tracker, scope.tracked) {
                if let Err(update) = tracker.set_state(&scope.export_id, ExportState::Canceled).await {
                    log::warn!(target: "export::runner", "export {}: marking canceled: {}", scope.export_id, update);
                }
            }
            log::info!(target: "export::runner", "export {} canceled during {}", scope.export_id, stage);
            self.emit(scope, EVENT_CANCELED, metadata);
        } else {
            if let (Some(tracker), true) = (&self.tracker, scope.tracked) {
                if let Err(update) = tracker.fail(&scope.export_id, metadata.clone()).await {
                    log::warn!(target: "export::runner", "export {}: marking failed: {}", scope.export_id, update);
                }
            }
            log::warn!(
                target: "export::runner",
                "export {} failed during {}: {} ({})",
                scope.export_id,
                stage,
                err,
                err.kind()
            );
            self.emit(scope, EVENT_FAILED, metadata);
        }
        self.observe(scope, RenderStats::default(), Some(&err), clock.elapsed());
        err
    }

    /// Announces an async export whose artifact has been published.
    pub(crate) fn report_completed(&self, outcome: &RunOutcome, metadata: Metadata) {
        let scope = RunScope::from_outcome(outcome);
        self.emit(&scope, EVENT_COMPLETED, metadata);
        let stats = RenderStats {
            rows: outcome.rows,
            bytes: outcome.bytes,
        };
        self.observe(&scope, stats, None, outcome.duration);
    }

    /// Announces an async export that rendered but could not be published.
    pub(crate) fn report_failed(&self, outcome: &RunOutcome, stage: &str, err: &ExportError) {
        let scope = RunScope::from_outcome(outcome);
        self.emit(&scope, EVENT_FAILED, error_metadata(Some(stage), err));
        self.observe(&scope, RenderStats::default(), Some(err), outcome.duration);
    }

    /// Emits a lifecycle event for a record handled outside a run.
    pub(crate) fn report_record(&self, record: &ExportRecord, name: &str, metadata: Metadata) {
        self.emit(&RunScope::from_record(record), name, metadata);
    }

    fn emit(&self, scope: &RunScope, name: &str, metadata: Metadata) {
        if let Some(emitter) = &self.emitter {
            emitter.emit(&ChangeEvent {
                name: name.to_string(),
                export_id: scope.export_id.clone(),
                definition: scope.definition.clone(),
                format: scope.format,
                delivery: scope.delivery,
                actor_id: scope.actor_id.clone(),
                timestamp: Utc::now(),
                metadata,
            });
        }
    }

    fn observe(&self, scope: &RunScope, stats: RenderStats, err: Option<&ExportError>, duration: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.observe(&MetricsEvent {
                name: if err.is_some() { EVENT_FAILED } else { EVENT_COMPLETED }.to_string(),
                export_id: scope.export_id.clone(),
                definition: scope.definition.clone(),
                format: scope.format,
                delivery: scope.delivery,
                actor_id: scope.actor_id.clone(),
                timestamp: Utc::now(),
                rows: stats.rows,
                bytes: stats.bytes,
                duration,
                success: err.is_none(),
                error_kind: err.map(|e| e.kind().code().to_string()),
            });
        }
    }
}

/// Fixed metadata describing what was asked for.
pub(crate) fn request_metadata(resolved: &ResolvedExport) -> Metadata {
    let request = &resolved.request;
    let mut metadata = Metadata::new();
    metadata.insert(meta::COLUMNS.into(), resolved.column_names.clone().into());
    metadata.insert(
        meta::SELECTION_MODE.into(),
        resolved.selection.effective_mode().as_str().into(),
    );
    metadata.insert(meta::SELECTION_COUNT.into(), (resolved.selection.ids.len() as u64).into());
    if let Some(rows) = request.estimated_rows {
        metadata.insert(meta::ESTIMATED_ROWS.into(), rows.into());
    }
    if let Some(bytes) = request.estimated_bytes {
        metadata.insert(meta::ESTIMATED_BYTES.into(), bytes.into());
    }
    if let Some(duration) = request.estimated_duration {
        metadata.insert(meta::ESTIMATED_DURATION.into(), millis(duration).into());
    }
    metadata.insert(meta::FILENAME.into(), resolved.filename.clone().into());
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAllGuard;
    use crate::domains::export::context::CancelHandle;
    use crate::domains::export::definition::{ExportDefinition, ExportPolicy};
    use crate::domains::export::events::RecordingEmitter;
    use crate::domains::export::source::{RowSource, SharedSourceFactory, StaticRowSource};
    use crate::domains::export::tracker::MemoryTracker;
    use crate::domains::export::transform::TransformerConfig;
    use crate::domains::export::types::{Column, ColumnType, Row, Value};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn users_definition(policy: ExportPolicy) -> ExportDefinition {
        ExportDefinition::new(
            "users",
            "users",
            vec![Column::new("id", ColumnType::Int), Column::string("name")],
        )
        .with_policy(policy)
    }

    fn user_rows() -> Vec<Row> {
        vec![
            vec![Value::Int(1), Value::from("alice")],
            vec![Value::Int(2), Value::from("bob")],
        ]
    }

    struct Harness {
        runner: Runner,
        tracker: Arc<MemoryTracker>,
        events: Arc<RecordingEmitter>,
    }

    fn harness_with(definition: ExportDefinition, sources: RowSourceRegistry) -> Harness {
        let definitions = DefinitionRegistry::new();
        definitions.register(definition).unwrap();
        let tracker = Arc::new(MemoryTracker::new());
        let events = Arc::new(RecordingEmitter::new());
        let runner = Runner::new(Arc::new(definitions), Arc::new(sources))
            .with_tracker(Some(tracker.clone()))
            .with_guard(Arc::new(AllowAllGuard))
            .with_emitter(events.clone())
            .with_metrics(events.clone())
            .with_id_generator(IdGenerator::sequence("run-"));
        Harness { runner, tracker, events }
    }

    fn harness(policy: ExportPolicy) -> Harness {
        let sources = RowSourceRegistry::new("row source");
        sources
            .register("users", Arc::new(SharedSourceFactory::new(StaticRowSource::new(["id", "name"], user_rows()))))
            .unwrap();
        harness_with(users_definition(policy), sources)
    }

    fn sync_request(format: &str) -> ExportRequest {
        ExportRequest::new("users", format).with_delivery(DeliveryMode::Sync)
    }

    #[tokio::test]
    async fn sync_csv_run_tracks_every_row() {
        let h = harness(ExportPolicy::default());
        let mut out: Vec<u8> = Vec::new();
        let outcome = h
            .runner
            .run(&ExportContext::background(), &sync_request("csv"), &mut out)
            .await
            .unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "id,name\r\n1,alice\r\n2,bob\r\n");
        assert_eq!(outcome.export_id, "run-1");
        assert_eq!(outcome.rows, 2);

        let record = h.tracker.status("run-1").await.unwrap();
        assert_eq!(record.state, ExportState::Completed);
        assert_eq!(record.counts.processed, 2);
        assert_eq!(h.tracker.advance_calls("run-1").await, outcome.rows);
        assert_eq!(record.metadata[meta::ROWS], 2);
        assert_eq!(record.metadata[meta::SELECTION_MODE], "all");
        assert_eq!(
            h.events.names_for("run-1"),
            vec![EVENT_REQUESTED, EVENT_STARTED, EVENT_COMPLETED]
        );
        let metrics = h.events.metrics();
        assert_eq!(metrics.len(), 1);
        assert!(metrics[0].success);
    }

    #[tokio::test]
    async fn async_delivery_is_rejected() {
        let h = harness(ExportPolicy::default());
        let mut out: Vec<u8> = Vec::new();
        let request = ExportRequest::new("users", "csv").with_delivery(DeliveryMode::Async);
        let err = h
            .runner
            .run(&ExportContext::background(), &request, &mut out)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(h.tracker.is_empty());
    }

    struct CountingFactory {
        opens: Arc<AtomicUsize>,
    }

    struct CountingSource {
        opens: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RowSource for CountingSource {
        async fn open(&self, ctx: &ExportContext, spec: &RowSourceSpec) -> ExportResult<BoxRowIterator> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            StaticRowSource::new(["id", "name"], user_rows()).open(ctx, spec).await
        }
    }

    impl crate::domains::export::source::RowSourceFactory for CountingFactory {
        fn create(
            &self,
            _: &ExportRequest,
            _: &ResolvedDefinition,
        ) -> ExportResult<Box<dyn RowSource>> {
            Ok(Box::new(CountingSource {
                opens: self.opens.clone(),
            }))
        }
    }

    struct DenyGuard;

    #[async_trait]
    impl ExportGuard for DenyGuard {
        async fn authorize_export(&self, _: &Actor, _: &ExportRequest, _: &ResolvedDefinition) -> ExportResult<()> {
            Err(ExportError::authz("denied"))
        }

        async fn authorize_download(&self, _: &Actor, _: &ExportRecord) -> ExportResult<()> {
            Err(ExportError::authz("denied"))
        }
    }

    #[tokio::test]
    async fn guard_runs_before_source_open() {
        let opens = Arc::new(AtomicUsize::new(0));
        let sources = RowSourceRegistry::new("row source");
        sources
            .register("users", Arc::new(CountingFactory { opens: opens.clone() }))
            .unwrap();
        let h = harness_with(users_definition(ExportPolicy::default()), sources);
        let runner = h.runner.clone().with_guard(Arc::new(DenyGuard));

        let mut out: Vec<u8> = Vec::new();
        let err = runner
            .run(&ExportContext::background(), &sync_request("csv"), &mut out)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authz);
        assert_eq!(opens.load(Ordering::SeqCst), 0);
        assert!(h.tracker.is_empty());

        h.runner
            .run(&ExportContext::background(), &sync_request("csv"), &mut out)
            .await
            .unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn redacted_values_never_reach_the_renderer() {
        let policy = ExportPolicy {
            redact_columns: vec!["name".into()],
            ..Default::default()
        };
        let h = harness(policy);
        let mut out: Vec<u8> = Vec::new();
        h.runner
            .run(&ExportContext::background(), &sync_request("json"), &mut out)
            .await
            .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            r#"[{"id":1,"name":"[redacted]"},{"id":2,"name":"[redacted]"}]"#
        );
    }

    #[tokio::test]
    async fn max_bytes_fails_the_record() {
        let policy = ExportPolicy {
            max_bytes: 1,
            ..Default::default()
        };
        let h = harness(policy);
        let mut out: Vec<u8> = Vec::new();
        let err = h
            .runner
            .run(&ExportContext::background(), &sync_request("csv"), &mut out)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.message(), "max bytes exceeded");

        let record = h.tracker.status("run-1").await.unwrap();
        assert_eq!(record.state, ExportState::Failed);
        assert_eq!(record.metadata[meta::ERROR_KIND], "validation");
        assert_eq!(record.metadata[meta::STAGE], "render");
        assert_eq!(h.events.names_for("run-1").last().map(String::as_str), Some(EVENT_FAILED));
    }

    #[tokio::test]
    async fn max_rows_is_enforced_while_streaming() {
        let policy = ExportPolicy {
            max_rows: 1,
            ..Default::default()
        };
        let h = harness(policy);
        let mut out: Vec<u8> = Vec::new();
        let err = h
            .runner
            .run(&ExportContext::background(), &sync_request("ndjson"), &mut out)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    /// Yields one row, then fires `cancel` (if any) and blocks forever.
    struct StallingSource {
        cancel: Option<CancelHandle>,
    }

    struct StallingIterator {
        sent: bool,
        cancel: Option<CancelHandle>,
    }

    #[async_trait]
    impl RowIterator for StallingIterator {
        async fn next(&mut self, _ctx: &ExportContext) -> ExportResult<Option<Row>> {
            if !self.sent {
                self.sent = true;
                return Ok(Some(vec![Value::Int(1), Value::from("alice")]));
            }
            if let Some(cancel) = &self.cancel {
                cancel.cancel();
            }
            futures::future::pending::<()>().await;
            Ok(None)
        }
    }

    #[async_trait]
    impl RowSource for StallingSource {
        async fn open(&self, _: &ExportContext, _: &RowSourceSpec) -> ExportResult<BoxRowIterator> {
            Ok(Box::new(StallingIterator {
                sent: false,
                cancel: self.cancel.clone(),
            }))
        }
    }

    fn stalling_harness(policy: ExportPolicy, cancel: Option<CancelHandle>) -> Harness {
        let sources = RowSourceRegistry::new("row source");
        sources
            .register("users", Arc::new(SharedSourceFactory::new(StallingSource { cancel })))
            .unwrap();
        harness_with(users_definition(policy), sources)
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_surfaces_as_timeout() {
        let policy = ExportPolicy {
            max_duration: Duration::from_millis(1),
            ..Default::default()
        };
        let h = stalling_harness(policy, None);
        let mut out: Vec<u8> = Vec::new();
        let err = h
            .runner
            .run(&ExportContext::background(), &sync_request("csv"), &mut out)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        let record = h.tracker.status("run-1").await.unwrap();
        assert_eq!(record.state, ExportState::Failed);
        assert_eq!(record.metadata[meta::ERROR_KIND], "timeout");
    }

    #[tokio::test]
    async fn cancellation_marks_record_canceled() {
        let (ctx, cancel) = ExportContext::background().with_cancel();
        let h = stalling_harness(ExportPolicy::default(), Some(cancel));
        let mut out: Vec<u8> = Vec::new();
        let err = h.runner.run(&ctx, &sync_request("csv"), &mut out).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);

        let record = h.tracker.status("run-1").await.unwrap();
        assert_eq!(record.state, ExportState::Canceled);
        let names = h.events.names_for("run-1");
        assert_eq!(names.last().map(String::as_str), Some(EVENT_CANCELED));
        assert!(!names.iter().any(|n| n == EVENT_COMPLETED));
    }

    #[tokio::test]
    async fn transformers_run_in_order() {
        let mut definition = users_definition(ExportPolicy::default());
        definition.transformers = vec![
            TransformerConfig::new("map", serde_json::json!({"column": "name", "op": "upper"})),
            TransformerConfig::new("sort", serde_json::json!({"column": "id", "descending": true})),
        ];
        let sources = RowSourceRegistry::new("row source");
        sources
            .register("users", Arc::new(SharedSourceFactory::new(StaticRowSource::new(["id", "name"], user_rows()))))
            .unwrap();
        let h = harness_with(definition, sources);
        let mut out: Vec<u8> = Vec::new();
        h.runner
            .run(&ExportContext::background(), &sync_request("csv"), &mut out)
            .await
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "id,name\r\n2,BOB\r\n1,ALICE\r\n");
    }

    #[tokio::test]
    async fn unknown_source_is_not_found() {
        let h = harness_with(users_definition(ExportPolicy::default()), RowSourceRegistry::new("row source"));
        let mut out: Vec<u8> = Vec::new();
        let err = h
            .runner
            .run(&ExportContext::background(), &sync_request("csv"), &mut out)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(h.tracker.status("run-1").await.unwrap().metadata[meta::STAGE], "source");
    }

    #[tokio::test]
    async fn runs_without_tracker() {
        let h = harness(ExportPolicy::default());
        let runner = h.runner.clone().with_tracker(None);
        let mut out: Vec<u8> = Vec::new();
        let outcome = runner
            .run(&ExportContext::background(), &sync_request("csv"), &mut out)
            .await
            .unwrap();
        let record = outcome.to_record();
        assert_eq!(record.state, ExportState::Completed);
        assert_eq!(record.counts.processed, 2);
        assert!(h.tracker.is_empty());
    }

    #[test]
    fn id_generators() {
        let seq = IdGenerator::sequence("e");
        assert_eq!(seq.next_id(), "e1");
        assert_eq!(seq.clone().next_id(), "e2");
        assert_eq!(IdGenerator::fixed("x").next_id(), "x");
        assert_eq!(IdGenerator::Uuid.next_id().len(), 36);
    }
}
