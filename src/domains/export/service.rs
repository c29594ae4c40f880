//! Export orchestration: sync runs, async hand-off to the queue, the async
//! worker entry, and record management (status, history, cancel, delete,
//! download, cleanup).

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::auth::Actor;
use crate::domains::export::context::ExportContext;
use crate::domains::export::definition::ResolvedDefinition;
use crate::domains::export::events::{
    error_metadata, Metadata, Notifier, EVENT_CANCELED, EVENT_DELETED, EVENT_FAILED, EVENT_REQUESTED,
};
use crate::domains::export::io::{pipe, PipeWriter};
use crate::domains::export::policy::DeleteStrategy;
use crate::domains::export::queue_manager::JobProcessor;
use crate::domains::export::resolver::ResolvedExport;
use crate::domains::export::runner::{request_metadata, IdGenerator, RunOutcome, Runner};
use crate::domains::export::scheduler::{request_signature, AsyncScheduler, ExecutionMessage, ExecutionPayload};
use crate::domains::export::store::{ArtifactReader, ArtifactStore};
use crate::domains::export::tracker::{
    ArtifactTracker, CompletionMeta, ProgressDelta, ProgressTracker, RecordDeleter, RecordUpdater,
};
use crate::domains::export::types::{
    artifact_key, ArtifactMeta, ArtifactRef, DeliveryMode, ExportRecord, ExportRequest, ExportState, Format,
    HistoryFilter,
};
use crate::domains::export::writers::OutputWriter;
use crate::errors::{ErrorKind, ExportError, ExportResult};

pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;
pub const DEFAULT_SIGNED_URL_TTL: Duration = Duration::from_secs(15 * 60);

/// Delivery chosen for a plan. Unlike [`DeliveryMode`] it has no `auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedDelivery {
    Sync,
    Async,
}

impl PlannedDelivery {
    /// `auto` left unresolved falls back to sync, like an unset policy default.
    pub fn from_mode(mode: DeliveryMode) -> Self {
        match mode {
            DeliveryMode::Async => PlannedDelivery::Async,
            DeliveryMode::Sync | DeliveryMode::Auto => PlannedDelivery::Sync,
        }
    }

    pub fn mode(self) -> DeliveryMode {
        match self {
            PlannedDelivery::Sync => DeliveryMode::Sync,
            PlannedDelivery::Async => DeliveryMode::Async,
        }
    }
}

/// What a request will produce, known before anything runs.
#[derive(Debug, Clone)]
pub struct ExportPlan {
    pub export_id: String,
    pub delivery: PlannedDelivery,
    pub format: Format,
    pub filename: String,
    pub content_type: String,
    resolved: ResolvedExport,
}

/// Where a completed artifact can be fetched from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub id: String,
    pub artifact: ArtifactRef,
}

pub struct ExportService {
    runner: Runner,
    store: Option<Arc<dyn ArtifactStore>>,
    scheduler: Option<Arc<AsyncScheduler>>,
    notifier: Option<Arc<dyn Notifier>>,
    delete_strategy: DeleteStrategy,
    pipe_capacity: usize,
    signed_url_ttl: Duration,
}

impl ExportService {
    pub fn new(runner: Runner) -> Self {
        Self {
            runner,
            store: None,
            scheduler: None,
            notifier: None,
            delete_strategy: DeleteStrategy::default(),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            signed_url_ttl: DEFAULT_SIGNED_URL_TTL,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<AsyncScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_delete_strategy(mut self, strategy: DeleteStrategy) -> Self {
        self.delete_strategy = strategy;
        self
    }

    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity.max(1);
        self
    }

    pub fn with_signed_url_ttl(mut self, ttl: Duration) -> Self {
        self.signed_url_ttl = ttl;
        self
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    pub fn store(&self) -> Option<&Arc<dyn ArtifactStore>> {
        self.store.as_ref()
    }

    fn tracker(&self) -> ExportResult<&Arc<dyn ProgressTracker>> {
        self.runner
            .tracker()
            .ok_or_else(|| ExportError::not_implemented("export tracker is not configured"))
    }

    fn artifact_store(&self) -> ExportResult<&Arc<dyn ArtifactStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| ExportError::not_implemented("artifact store is not configured"))
    }

    /// Resolves `request` and allocates its export id.
    pub fn plan(&self, request: &ExportRequest) -> ExportResult<ExportPlan> {
        let (_, resolved, delivery) = self.runner.resolve(request)?;
        Ok(ExportPlan {
            export_id: self.runner.ids().next_id(),
            delivery: PlannedDelivery::from_mode(delivery),
            format: resolved.format,
            filename: resolved.filename.clone(),
            content_type: resolved.format.content_type().to_string(),
            resolved,
        })
    }

    /// Runs a sync export into `output`, or queues an async one.
    pub async fn request_export(
        &self,
        ctx: &ExportContext,
        actor: &Actor,
        request: &ExportRequest,
        output: Option<&mut OutputWriter<'_>>,
    ) -> ExportResult<ExportRecord> {
        let plan = self.plan(request)?;
        self.request_planned(ctx, actor, request, &plan, output).await
    }

    /// [`request_export`](Self::request_export) for a plan obtained earlier,
    /// so callers can announce the id and filename before the body.
    pub async fn request_planned(
        &self,
        ctx: &ExportContext,
        actor: &Actor,
        request: &ExportRequest,
        plan: &ExportPlan,
        output: Option<&mut OutputWriter<'_>>,
    ) -> ExportResult<ExportRecord> {
        match plan.delivery {
            PlannedDelivery::Sync => {
                let output =
                    output.ok_or_else(|| ExportError::validation("sync export requires an output writer"))?;
                let runner = self
                    .runner
                    .clone()
                    .with_id_generator(IdGenerator::fixed(plan.export_id.clone()));
                let outcome = runner.run(&ctx.with_actor(actor.clone()), request, output).await?;
                match runner.tracker() {
                    Some(tracker) => tracker.status(&outcome.export_id).await,
                    None => Ok(outcome.to_record()),
                }
            }
            PlannedDelivery::Async => self.queue_export(ctx, actor, request, plan).await,
        }
    }

    async fn queue_export(
        &self,
        ctx: &ExportContext,
        actor: &Actor,
        request: &ExportRequest,
        plan: &ExportPlan,
    ) -> ExportResult<ExportRecord> {
        let tracker = self.tracker()?;
        self.artifact_store()?;
        let scheduler = self
            .scheduler
            .as_ref()
            .ok_or_else(|| ExportError::not_implemented("async scheduler is not configured"))?;

        let (definition, resolved) = (&plan.resolved.definition, &plan.resolved);
        if let Some(guard) = self.runner.guard() {
            guard.authorize_export(actor, &resolved.request, definition).await?;
        }
        if let Some(quota) = self.runner.quota() {
            quota.allow(actor, &resolved.request, definition).await?;
        }

        let signature = match request.idempotency_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() && scheduler.dedupes() => Some(request_signature(key, actor, request)?),
            _ => None,
        };
        let _serialized = match &signature {
            Some(signature) => Some(scheduler.lock(signature).await),
            None => None,
        };

        if let Some(signature) = &signature {
            if let Some(existing) = scheduler.lookup(signature).await? {
                match tracker.status(&existing).await {
                    Ok(record) if record.state.is_reusable() => {
                        log::info!(
                            target: "export::service",
                            "idempotent request matched export {} ({})",
                            record.id,
                            record.state
                        );
                        return Ok(record);
                    }
                    Ok(_) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(err),
                }
            }
        }

        let record = self.async_record(&plan.export_id, actor, definition, resolved);
        tracker.start(record.clone()).await?;
        self.runner.report_record(&record, EVENT_REQUESTED, record.metadata.clone());
        log::info!(
            target: "export::service",
            "export {} queued: definition={} format={} actor={}",
            record.id,
            record.definition,
            record.format,
            actor.id
        );

        if let Err(err) = scheduler
            .enqueue(ctx, &record.id, actor, request, signature.as_deref())
            .await
        {
            let metadata = error_metadata(Some("enqueue"), &err);
            if let Err(update) = tracker.fail(&record.id, metadata.clone()).await {
                log::warn!(target: "export::service", "export {}: marking failed: {}", record.id, update);
            }
            log::error!(target: "export::service", "export {}: enqueue failed: {}", record.id, err);
            self.runner.report_record(&record, EVENT_FAILED, metadata);
            return Err(err);
        }

        tracker.status(&record.id).await
    }

    /// Queued record carrying the artifact key and metadata it will be published under.
    fn async_record(
        &self,
        id: &str,
        actor: &Actor,
        definition: &ResolvedDefinition,
        resolved: &ResolvedExport,
    ) -> ExportRecord {
        let now = Utc::now();
        let mut record = ExportRecord::queued(id, definition.name.clone(), resolved.format, DeliveryMode::Async, actor, now);
        record.variant = definition.variant.clone();
        record.metadata = request_metadata(resolved);
        if let Some(retention) = self.runner.retention() {
            record.expire_after(retention.ttl(actor, &resolved.request, definition));
        }
        record.artifact = Some(ArtifactRef {
            key: artifact_key(id, resolved.format),
            meta: ArtifactMeta {
                content_type: resolved.format.content_type().to_string(),
                size: 0,
                filename: resolved.filename.clone(),
                created_at: Some(now),
                expires_at: record.expires_at,
            },
        });
        record
    }

    /// Worker entry for a queued async export: renders through a pipe into the store.
    pub async fn generate_export(
        &self,
        ctx: &ExportContext,
        actor: &Actor,
        id: &str,
        request: &ExportRequest,
    ) -> ExportResult<ExportRecord> {
        let tracker = self.tracker()?.clone();
        let store = self.artifact_store()?.clone();
        let (definition, resolved, _) = self.runner.resolve(request)?;

        let record = match tracker.status(id).await {
            Ok(record) => record,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let record = self.async_record(id, actor, &definition, &resolved);
                tracker.start(record.clone()).await?;
                record
            }
            Err(err) => return Err(err),
        };
        match record.state {
            ExportState::Canceled => return Err(ExportError::canceled()),
            ExportState::Completed => return Ok(record),
            ExportState::Failed | ExportState::Deleted => {
                return Err(ExportError::validation(format!("export {} is {}", id, record.state)))
            }
            _ => {}
        }

        let key = record
            .artifact
            .as_ref()
            .map(|artifact| artifact.key.clone())
            .unwrap_or_else(|| artifact_key(id, record.format));
        let meta = ArtifactMeta {
            content_type: resolved.format.content_type().to_string(),
            size: 0,
            filename: resolved.filename.clone(),
            created_at: Some(Utc::now()),
            expires_at: record.expires_at,
        };

        let (ctx, cancel) = ctx.with_cancel();
        let ctx = ctx.with_actor(actor.clone());
        let (mut writer, reader) = pipe(self.pipe_capacity);
        let upload = {
            let store = store.clone();
            let ctx = ctx.clone();
            let key = key.clone();
            tokio::spawn(async move { store.put(&ctx, &key, Box::new(reader), meta).await })
        };

        let publishing = Arc::new(PublishingTracker::new(tracker.clone()));
        let runner = self
            .runner
            .clone()
            .with_id_generator(IdGenerator::fixed(id))
            .with_tracker(Some(publishing.clone() as Arc<dyn ProgressTracker>))
            .with_quota(None);

        let outcome = match runner.run_async_job(&ctx, request, &mut writer).await {
            Ok(outcome) => outcome,
            Err(run_err) => {
                writer.close_with_error(run_err.clone());
                let err = match upload.await {
                    Ok(Err(store_err)) if run_err.kind() == ErrorKind::Internal => store_err,
                    _ => run_err,
                };
                match tracker.status(id).await {
                    Ok(current) if !current.state.is_terminal() => {
                        if let Err(update) = tracker.fail(id, error_metadata(Some("run"), &err)).await {
                            log::warn!(target: "export::service", "export {}: marking failed: {}", id, update);
                        }
                    }
                    _ => {}
                }
                return Err(err);
            }
        };

        let published = self
            .publish(tracker.as_ref(), &publishing, id, writer, upload, &outcome)
            .await;
        if let Err(err) = published {
            cancel.cancel();
            if let Err(cleanup) = store.delete(&ExportContext::background(), &key).await {
                log::warn!(target: "export::service", "export {}: removing {}: {}", id, key, cleanup);
            }
            log::error!(target: "export::service", "export {}: publishing artifact failed: {}", id, err);
            match tracker.status(id).await {
                Ok(current) if current.state.is_terminal() => {
                    log::info!(target: "export::service", "export {} already {}", id, current.state);
                }
                _ => {
                    if let Err(update) = tracker.fail(id, error_metadata(Some("publish"), &err)).await {
                        log::warn!(target: "export::service", "export {}: marking failed: {}", id, update);
                    }
                    runner.report_failed(&outcome, "publish", &err);
                }
            }
            return Err(err);
        }

        let record = tracker.status(id).await?;
        runner.report_completed(&outcome, record.metadata.clone());
        log::info!(
            target: "export::service",
            "export {} published to {} ({} bytes)",
            id,
            key,
            record.bytes_written
        );
        if let Some(notifier) = &self.notifier {
            if let Err(err) = notifier.notify(&record).await {
                log::warn!(target: "export::service", "export {}: notification failed: {}", id, err);
            }
        }
        Ok(record)
    }

    /// Finishes the upload and completes the record with the stashed figures.
    async fn publish(
        &self,
        tracker: &dyn ProgressTracker,
        publishing: &PublishingTracker,
        id: &str,
        writer: PipeWriter,
        upload: JoinHandle<ExportResult<ArtifactRef>>,
        outcome: &RunOutcome,
    ) -> ExportResult<()> {
        writer.close().await?;
        let artifact = upload.await??;
        self.attach_artifact(tracker, id, artifact).await?;
        let completion = publishing.take_completion().unwrap_or_else(|| CompletionMeta {
            rows: outcome.rows,
            bytes: outcome.bytes,
            metadata: Metadata::new(),
        });
        tracker.complete(id, completion).await
    }

    async fn attach_artifact(
        &self,
        tracker: &dyn ProgressTracker,
        id: &str,
        artifact: ArtifactRef,
    ) -> ExportResult<()> {
        if let Some(artifacts) = tracker.as_artifact_tracker() {
            return artifacts.set_artifact(id, artifact).await;
        }
        if let Some(updater) = tracker.as_record_updater() {
            let mut record = tracker.status(id).await?;
            record.bytes_written = artifact.meta.size;
            record.artifact = Some(artifact);
            return updater.update(record).await;
        }
        log::warn!(target: "export::service", "export {}: tracker cannot store artifact references", id);
        Ok(())
    }

    /// Record visible to `actor`. Out-of-scope records read as missing.
    pub async fn status(&self, _ctx: &ExportContext, actor: &Actor, id: &str) -> ExportResult<ExportRecord> {
        let record = self.tracker()?.status(id).await?;
        if !actor.scope.permits(&record.scope) {
            return Err(ExportError::not_found(format!("export {} not found", id)));
        }
        if let Some(guard) = self.runner.guard() {
            guard.authorize_download(actor, &record).await?;
        }
        Ok(record)
    }

    /// Records matching `filter` that `actor` may see, newest first.
    pub async fn history(
        &self,
        _ctx: &ExportContext,
        actor: &Actor,
        filter: &HistoryFilter,
    ) -> ExportResult<Vec<ExportRecord>> {
        let tracker = self.tracker()?;
        let unbounded = HistoryFilter {
            limit: None,
            ..filter.clone()
        };
        let mut visible = Vec::new();
        for record in tracker.list(&unbounded).await? {
            if !actor.scope.permits(&record.scope) {
                continue;
            }
            if let Some(guard) = self.runner.guard() {
                if guard.authorize_download(actor, &record).await.is_err() {
                    continue;
                }
            }
            visible.push(record);
        }
        if let Some(limit) = filter.limit.filter(|limit| *limit > 0) {
            visible.truncate(limit);
        }
        Ok(visible)
    }

    pub async fn cancel_export(&self, ctx: &ExportContext, actor: &Actor, id: &str) -> ExportResult<ExportRecord> {
        let tracker = self.tracker()?;
        let record = self.status(ctx, actor, id).await?;
        match record.state {
            ExportState::Canceled => return Ok(record),
            state if state.is_terminal() => {
                return Err(ExportError::validation(format!("export {} is already {}", id, state)))
            }
            _ => {}
        }
        tracker.set_state(id, ExportState::Canceled).await?;
        log::info!(target: "export::service", "export {} canceled by {}", id, actor.id);
        // running exports announce their own cancellation when the runner stops
        if record.state == ExportState::Queued {
            self.runner.report_record(&record, EVENT_CANCELED, Metadata::new());
        }
        tracker.status(id).await
    }

    /// Removes the artifact, then marks the record according to the delete strategy.
    pub async fn delete_export(&self, ctx: &ExportContext, actor: &Actor, id: &str) -> ExportResult<ExportRecord> {
        let tracker = self.tracker()?;
        let store = self.artifact_store()?;
        let record = self.status(ctx, actor, id).await?;
        if record.state == ExportState::Deleted {
            return Ok(record);
        }
        let updater = match self.delete_strategy {
            DeleteStrategy::Tombstone { .. } => Some(tracker.as_record_updater().ok_or_else(|| {
                ExportError::not_implemented("tombstone deletes require a tracker that can update records")
            })?),
            DeleteStrategy::Soft => None,
        };

        let key = record
            .artifact
            .as_ref()
            .map(|artifact| artifact.key.clone())
            .unwrap_or_else(|| artifact_key(id, record.format));
        store.delete(ctx, &key).await?;

        match (self.delete_strategy, updater) {
            (DeleteStrategy::Tombstone { ttl }, Some(updater)) => {
                let mut tombstone = tracker.status(id).await?;
                tombstone.state = ExportState::Deleted;
                tombstone.expires_at = expiry(Utc::now(), ttl);
                updater.update(tombstone).await?;
            }
            _ => tracker.set_state(id, ExportState::Deleted).await?,
        }
        log::info!(target: "export::service", "export {} deleted by {}", id, actor.id);
        self.runner.report_record(&record, EVENT_DELETED, Metadata::new());
        tracker.status(id).await
    }

    /// Confirms a completed artifact can be opened and returns its reference.
    pub async fn download_metadata(
        &self,
        ctx: &ExportContext,
        actor: &Actor,
        id: &str,
    ) -> ExportResult<DownloadInfo> {
        let store = self.artifact_store()?;
        let record = self.status(ctx, actor, id).await?;
        if record.state != ExportState::Completed {
            return Err(ExportError::validation(format!(
                "export {} is {}, not completed",
                id, record.state
            )));
        }
        let artifact = record
            .artifact
            .ok_or_else(|| ExportError::not_found(format!("export {} has no artifact", id)))?;
        let (reader, _) = store.open(ctx, &artifact.key).await?;
        drop(reader);
        Ok(DownloadInfo {
            id: record.id,
            artifact,
        })
    }

    /// Opens the artifact body for streaming.
    pub async fn open_artifact(
        &self,
        ctx: &ExportContext,
        actor: &Actor,
        id: &str,
    ) -> ExportResult<(ArtifactReader, ArtifactMeta)> {
        let info = self.download_metadata(ctx, actor, id).await?;
        self.artifact_store()?.open(ctx, &info.artifact.key).await
    }

    /// Time-limited URL for the artifact. `not_implemented` when the store cannot sign.
    pub async fn signed_url(&self, ctx: &ExportContext, actor: &Actor, id: &str) -> ExportResult<String> {
        let info = self.download_metadata(ctx, actor, id).await?;
        self.artifact_store()?
            .signed_url(ctx, &info.artifact.key, self.signed_url_ttl)
            .await
    }

    /// Removes expired artifacts and their records. Returns how many were removed.
    pub async fn cleanup(&self, ctx: &ExportContext, now: DateTime<Utc>) -> ExportResult<usize> {
        let tracker = self.tracker()?;
        let store = self.artifact_store()?;
        let deleter = tracker.as_record_deleter();
        let updater = tracker.as_record_updater();

        let mut removed = 0;
        for record in tracker.list(&HistoryFilter::default()).await? {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            if !record.is_expired(now) || !record.state.is_terminal() {
                continue;
            }
            // tombstones are only revisited when the tracker can drop them
            if record.state == ExportState::Deleted && deleter.is_none() {
                continue;
            }

            let key = record
                .artifact
                .as_ref()
                .map(|artifact| artifact.key.clone())
                .unwrap_or_else(|| artifact_key(&record.id, record.format));
            store.delete(ctx, &key).await?;

            if let Some(deleter) = deleter {
                deleter.delete(&record.id).await?;
            } else if let Some(updater) = updater {
                let mut updated = record.clone();
                updated.state = ExportState::Deleted;
                updater.update(updated).await?;
            } else {
                tracker.set_state(&record.id, ExportState::Deleted).await?;
            }
            log::debug!(target: "export::service", "cleaned up expired export {}", record.id);
            removed += 1;
        }
        if removed > 0 {
            log::info!(target: "export::service", "cleanup removed {} expired exports", removed);
        }
        Ok(removed)
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
}

#[async_trait]
impl JobProcessor for ExportService {
    async fn process(&self, message: ExecutionMessage) -> ExportResult<()> {
        let payload = ExecutionPayload::decode(&message.parameters.payload)?;
        if payload.export_id != message.job_id {
            return Err(ExportError::validation(format!(
                "job {} carries payload for export {}",
                message.job_id, payload.export_id
            )));
        }
        let ctx = ExportContext::background().with_actor(payload.actor.clone());
        self.generate_export(&ctx, &payload.actor, &payload.export_id, &payload.request)
            .await
            .map(|_| ())
    }
}

/// Wraps the real tracker while an async export renders: the record already
/// exists, and completion waits until the artifact is published.
struct PublishingTracker {
    inner: Arc<dyn ProgressTracker>,
    completion: Mutex<Option<CompletionMeta>>,
}

impl PublishingTracker {
    fn new(inner: Arc<dyn ProgressTracker>) -> Self {
        Self {
            inner,
            completion: Mutex::new(None),
        }
    }

    fn take_completion(&self) -> Option<CompletionMeta> {
        self.completion.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[async_trait]
impl ProgressTracker for PublishingTracker {
    async fn start(&self, record: ExportRecord) -> ExportResult<String> {
        Ok(record.id)
    }

    async fn advance(&self, id: &str, delta: ProgressDelta) -> ExportResult<()> {
        self.inner.advance(id, delta).await
    }

    async fn set_state(&self, id: &str, state: ExportState) -> ExportResult<()> {
        self.inner.set_state(id, state).await
    }

    async fn complete(&self, id: &str, meta: CompletionMeta) -> ExportResult<()> {
        self.inner.set_state(id, ExportState::Publishing).await?;
        *self.completion.lock().unwrap_or_else(PoisonError::into_inner) = Some(meta);
        Ok(())
    }

    async fn fail(&self, id: &str, metadata: Metadata) -> ExportResult<()> {
        self.inner.fail(id, metadata).await
    }

    async fn status(&self, id: &str) -> ExportResult<ExportRecord> {
        self.inner.status(id).await
    }

    async fn list(&self, filter: &HistoryFilter) -> ExportResult<Vec<ExportRecord>> {
        self.inner.list(filter).await
    }

    fn as_artifact_tracker(&self) -> Option<&dyn ArtifactTracker> {
        self.inner.as_artifact_tracker()
    }

    fn as_record_updater(&self) -> Option<&dyn RecordUpdater> {
        self.inner.as_record_updater()
    }

    fn as_record_deleter(&self) -> Option<&dyn RecordDeleter> {
        self.inner.as_record_deleter()
    }
}
