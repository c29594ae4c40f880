//! End-to-end scenarios driven through the handler and the service.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::auth::{Actor, AllowAllGuard};
use crate::domains::export::context::ExportContext;
use crate::domains::export::definition::{DefinitionRegistry, ExportDefinition, ExportPolicy};
use crate::domains::export::events::RecordingEmitter;
use crate::domains::export::handler::{ExportHandler, MemoryRequest, MemoryResponse, HEADER_EXPORT_ID};
use crate::domains::export::idempotency::MemoryIdempotencyStore;
use crate::domains::export::queue_manager::{JobProcessor, LocalJobQueue};
use crate::domains::export::registry::RowSourceRegistry;
use crate::domains::export::runner::{IdGenerator, Runner};
use crate::domains::export::scheduler::AsyncScheduler;
use crate::domains::export::service::ExportService;
use crate::domains::export::source::{
    BoxRowIterator, RowIterator, RowSource, RowSourceSpec, SharedSourceFactory, StaticRowSource,
};
use crate::domains::export::store::{ArtifactReader, ArtifactStore, MemoryArtifactStore};
use crate::domains::export::tracker::{MemoryTracker, ProgressTracker};
use crate::domains::export::types::{
    ArtifactMeta, ArtifactRef, Column, ColumnType, DeliveryMode, ExportRequest, ExportState, HistoryFilter, Row,
    Value,
};
use crate::errors::ExportResult;

struct Engine {
    service: Arc<ExportService>,
    handler: ExportHandler,
    tracker: Arc<MemoryTracker>,
    queue: Arc<LocalJobQueue>,
}

fn engine(definition: ExportDefinition, source: impl RowSource + 'static, store: Arc<dyn ArtifactStore>) -> Engine {
    let definitions = DefinitionRegistry::new();
    let source_key = definition.row_source.clone();
    definitions.register(definition).unwrap();
    let sources = RowSourceRegistry::new("row source");
    sources
        .register(source_key, Arc::new(SharedSourceFactory::new(source)))
        .unwrap();

    let tracker = Arc::new(MemoryTracker::new());
    let runner = Runner::new(Arc::new(definitions), Arc::new(sources))
        .with_tracker(Some(tracker.clone()))
        .with_guard(Arc::new(AllowAllGuard))
        .with_emitter(Arc::new(RecordingEmitter::new()));

    let queue = Arc::new(LocalJobQueue::new(2));
    let scheduler = AsyncScheduler::new(queue.clone())
        .with_signature_store(Arc::new(MemoryIdempotencyStore::new()), Duration::from_secs(3600));
    let service = Arc::new(
        ExportService::new(runner)
            .with_store(store)
            .with_scheduler(Arc::new(scheduler)),
    );
    let weak = Arc::downgrade(&service);
    let processor: Weak<dyn JobProcessor> = weak;
    queue.set_processor(processor);

    Engine {
        handler: ExportHandler::new(service.clone(), "/exports"),
        service,
        tracker,
        queue,
    }
}

fn users() -> ExportDefinition {
    ExportDefinition::new(
        "users",
        "users",
        vec![Column::new("id", ColumnType::Int), Column::string("name")],
    )
}

fn user_rows() -> StaticRowSource {
    StaticRowSource::new(
        ["id", "name"],
        vec![
            vec![Value::Int(1), Value::from("alice")],
            vec![Value::Int(2), Value::from("bob")],
        ],
    )
}

fn post(body: serde_json::Value) -> MemoryRequest {
    MemoryRequest::new("POST", "/exports")
        .with_json(&body)
        .with_actor(Actor::new("u1"))
}

fn get(path: &str) -> MemoryRequest {
    MemoryRequest::new("GET", path).with_actor(Actor::new("u1"))
}

#[tokio::test]
async fn sync_csv_happy_path() {
    let engine = engine(users(), user_rows(), Arc::new(MemoryArtifactStore::new()));
    let mut req = post(json!({"definition": "users", "format": "csv", "delivery": "sync"}));
    let mut res = MemoryResponse::new();
    engine.handler.handle(&mut req, &mut res).await;

    assert_eq!(res.status(), 200);
    assert_eq!(res.text(), "id,name\r\n1,alice\r\n2,bob\r\n");
    let id = res.header(HEADER_EXPORT_ID).unwrap_or_default().to_string();
    assert!(!id.is_empty());
    assert!(res.header("Content-Disposition").unwrap().contains("attachment"));
    assert!(res.header("Content-Type").unwrap().starts_with("text/csv"));

    let record = engine.tracker.status(&id).await.unwrap();
    assert_eq!(record.state, ExportState::Completed);
    assert_eq!(record.counts.processed, 2);
}

#[tokio::test]
async fn async_with_idempotency_key() {
    let engine = engine(users(), user_rows(), Arc::new(MemoryArtifactStore::new()));
    let body = json!({"definition": "users", "format": "csv", "delivery": "async"});

    let mut ids = Vec::new();
    for _ in 0..2 {
        let mut req = post(body.clone()).with_header("Idempotency-Key", "abc123");
        let mut res = MemoryResponse::new();
        engine.handler.handle(&mut req, &mut res).await;
        assert_eq!(res.status(), 202, "{}", res.text());
        let payload = res.json().unwrap();
        let id = payload["id"].as_str().unwrap().to_string();
        assert_eq!(payload["status_url"], format!("/exports/{}", id));
        assert_eq!(payload["download_url"], format!("/exports/{}/download", id));
        ids.push(id);
    }
    assert_eq!(ids[0], ids[1]);

    engine.queue.wait_idle().await;
    let mut req = get(&format!("/exports/{}", ids[0]));
    let mut res = MemoryResponse::new();
    engine.handler.handle(&mut req, &mut res).await;
    assert_eq!(res.status(), 200);
    assert_eq!(res.json().unwrap()["state"], "completed");

    let all = engine.tracker.list(&HistoryFilter::default()).await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn shared_idempotency_key_across_actors() {
    let engine = engine(users(), user_rows(), Arc::new(MemoryArtifactStore::new()));
    let body = json!({"definition": "users", "format": "csv", "delivery": "async"});

    let mut ids = Vec::new();
    for user in ["u1", "u2"] {
        let mut req = MemoryRequest::new("POST", "/exports")
            .with_json(&body)
            .with_actor(Actor::new(user))
            .with_header("Idempotency-Key", "abc123");
        let mut res = MemoryResponse::new();
        engine.handler.handle(&mut req, &mut res).await;
        assert_eq!(res.status(), 202, "{}", res.text());
        ids.push(res.json().unwrap()["id"].as_str().unwrap().to_string());
    }
    assert_ne!(ids[0], ids[1]);

    engine.queue.wait_idle().await;
    for id in &ids {
        let record = engine.tracker.status(id).await.unwrap();
        assert_eq!(record.state, ExportState::Completed, "export {}", id);
    }
}

struct StallingSource;

struct StallingIterator {
    sent: bool,
}

#[async_trait]
impl RowIterator for StallingIterator {
    async fn next(&mut self, _ctx: &ExportContext) -> ExportResult<Option<Row>> {
        if !self.sent {
            self.sent = true;
            return Ok(Some(vec![Value::Int(1), Value::from("alice")]));
        }
        futures::future::pending::<()>().await;
        Ok(None)
    }
}

#[async_trait]
impl RowSource for StallingSource {
    async fn open(&self, _: &ExportContext, _: &RowSourceSpec) -> ExportResult<BoxRowIterator> {
        Ok(Box::new(StallingIterator { sent: false }))
    }
}

#[tokio::test(start_paused = true)]
async fn deadline_exceeded() {
    let definition = users().with_policy(ExportPolicy {
        max_duration: Duration::from_millis(1),
        ..Default::default()
    });
    let engine = engine(definition, StallingSource, Arc::new(MemoryArtifactStore::new()));
    let runner = engine.service.runner().clone().with_id_generator(IdGenerator::fixed("slow-1"));
    let service = ExportService::new(runner);

    let mut out: Vec<u8> = Vec::new();
    let err = service
        .request_export(
            &ExportContext::background(),
            &Actor::new("u1"),
            &ExportRequest::new("users", "csv").with_delivery(DeliveryMode::Sync),
            Some(&mut out),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind().code(), "timeout");

    let record = engine.tracker.status("slow-1").await.unwrap();
    assert_eq!(record.state, ExportState::Failed);
    assert_eq!(record.metadata["error_kind"], "timeout");
}

#[tokio::test]
async fn max_bytes_limit() {
    let definition = users().with_policy(ExportPolicy {
        max_bytes: 1,
        ..Default::default()
    });
    let engine = engine(definition, user_rows(), Arc::new(MemoryArtifactStore::new()));
    let mut req = post(json!({"definition": "users", "format": "csv", "delivery": "sync"}));
    let mut res = MemoryResponse::new();
    engine.handler.handle(&mut req, &mut res).await;

    assert_eq!(res.status(), 400);
    assert!(res.header(HEADER_EXPORT_ID).is_none());
    assert_eq!(
        res.json().unwrap(),
        json!({"error": {"message": "max bytes exceeded", "code": "validation"}})
    );
}

#[tokio::test]
async fn redaction() {
    let definition = ExportDefinition::new(
        "tokens",
        "tokens",
        vec![Column::string("id"), Column::string("token")],
    )
    .with_policy(ExportPolicy {
        redact_columns: vec!["token".into()],
        ..Default::default()
    });
    let source = StaticRowSource::new(["id", "token"], vec![vec![Value::from("1"), Value::from("secret")]]);
    let engine = engine(definition, source, Arc::new(MemoryArtifactStore::new()));

    let mut req = post(json!({"definition": "tokens", "format": "json", "delivery": "sync"}));
    let mut res = MemoryResponse::new();
    engine.handler.handle(&mut req, &mut res).await;
    assert_eq!(res.status(), 200);
    assert_eq!(res.text(), r#"[{"id":"1","token":"[redacted]"}]"#);
}

/// Memory store that can sign URLs.
struct SigningStore {
    inner: MemoryArtifactStore,
}

#[async_trait]
impl ArtifactStore for SigningStore {
    async fn put(&self, ctx: &ExportContext, key: &str, reader: ArtifactReader, meta: ArtifactMeta) -> ExportResult<ArtifactRef> {
        self.inner.put(ctx, key, reader, meta).await
    }

    async fn open(&self, ctx: &ExportContext, key: &str) -> ExportResult<(ArtifactReader, ArtifactMeta)> {
        self.inner.open(ctx, key).await
    }

    async fn delete(&self, ctx: &ExportContext, key: &str) -> ExportResult<()> {
        self.inner.delete(ctx, key).await
    }

    async fn signed_url(&self, _ctx: &ExportContext, key: &str, _ttl: Duration) -> ExportResult<String> {
        Ok(format!("https://cdn.example.com/{}?sig=test", key))
    }
}

async fn completed_async_export(engine: &Engine) -> String {
    let record = engine
        .service
        .request_export(
            &ExportContext::background(),
            &Actor::new("u1"),
            &ExportRequest::new("users", "csv").with_delivery(DeliveryMode::Async),
            None,
        )
        .await
        .unwrap();
    engine.queue.wait_idle().await;
    assert_eq!(
        engine.tracker.status(&record.id).await.unwrap().state,
        ExportState::Completed
    );
    record.id
}

#[tokio::test]
async fn download_signed_url() {
    let store = Arc::new(SigningStore {
        inner: MemoryArtifactStore::new(),
    });
    let engine = engine(users(), user_rows(), store);
    let id = completed_async_export(&engine).await;

    let mut req = get(&format!("/exports/{}/download", id));
    let mut res = MemoryResponse::new();
    engine.handler.handle(&mut req, &mut res).await;
    assert_eq!(res.status(), 302);
    assert_eq!(
        res.header("Location"),
        Some(format!("https://cdn.example.com/exports/{}.csv?sig=test", id).as_str())
    );

    let unsigned = engine_without_signing().await;
    let mut req = get(&format!("/exports/{}/download", unsigned.1));
    let mut res = MemoryResponse::new();
    unsigned.0.handler.handle(&mut req, &mut res).await;
    assert_eq!(res.status(), 200);
    assert!(res.header("Location").is_none());
    assert_eq!(res.text(), "id,name\r\n1,alice\r\n2,bob\r\n");
}

async fn engine_without_signing() -> (Engine, String) {
    let engine = engine(users(), user_rows(), Arc::new(MemoryArtifactStore::new()));
    let id = completed_async_export(&engine).await;
    (engine, id)
}

#[tokio::test]
async fn unknown_routes_and_missing_actor() {
    let engine = engine(users(), user_rows(), Arc::new(MemoryArtifactStore::new()));

    let mut req = get("/exports/missing");
    let mut res = MemoryResponse::new();
    engine.handler.handle(&mut req, &mut res).await;
    assert_eq!(res.status(), 404);
    assert_eq!(res.json().unwrap()["error"]["code"], "not_found");

    let mut req = MemoryRequest::new("GET", "/exports");
    let mut res = MemoryResponse::new();
    engine.handler.handle(&mut req, &mut res).await;
    assert_eq!(res.status(), 403);

    let mut req = post(json!({"definition": "users", "format": "csv", "bogus": true}));
    let mut res = MemoryResponse::new();
    engine.handler.handle(&mut req, &mut res).await;
    assert_eq!(res.status(), 400);
    assert_eq!(res.json().unwrap()["error"]["code"], "validation");
}
