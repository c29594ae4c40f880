//! Async hand-off: execution messages, idempotency signatures and the scheduler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::OwnedMutexGuard;

use crate::auth::Actor;
use crate::domains::export::context::ExportContext;
use crate::domains::export::idempotency::{IdempotencyStore, DEFAULT_IDEMPOTENCY_TTL};
use crate::domains::export::resolver::normalize_request;
use crate::domains::export::types::ExportRequest;
use crate::errors::{ExportError, ExportResult};

pub const DEFAULT_SCRIPT_PATH: &str = "export.generate";
const PAYLOAD_KIND: &str = "export.generate";
const PAYLOAD_VERSION: u32 = 1;

/// What a queue does with a message whose idempotency key is already pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    #[default]
    DropDuplicate,
    Allow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionParameters {
    /// Base64 of the tagged JSON [`ExecutionPayload`]
    pub payload: String,
}

/// Message handed to the job queue for one async export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMessage {
    pub job_id: String,
    pub script_path: String,
    pub parameters: ExecutionParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub dedup_policy: DedupPolicy,
}

/// Decoded message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPayload {
    pub kind: String,
    pub version: u32,
    pub export_id: String,
    pub actor: Actor,
    pub request: ExportRequest,
}

impl ExecutionPayload {
    pub fn new(export_id: impl Into<String>, actor: Actor, request: ExportRequest) -> Self {
        Self {
            kind: PAYLOAD_KIND.to_string(),
            version: PAYLOAD_VERSION,
            export_id: export_id.into(),
            actor,
            request,
        }
    }

    pub fn encode(&self) -> ExportResult<String> {
        let raw = serde_json::to_vec(self)
            .map_err(|e| ExportError::internal(format!("encode payload: {}", e)))?;
        Ok(STANDARD.encode(raw))
    }

    pub fn decode(encoded: &str) -> ExportResult<Self> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ExportError::validation(format!("invalid payload encoding: {}", e)))?;
        let payload: ExecutionPayload = serde_json::from_slice(&raw)
            .map_err(|e| ExportError::validation(format!("invalid payload: {}", e)))?;
        if payload.kind != PAYLOAD_KIND || payload.version != PAYLOAD_VERSION {
            return Err(ExportError::validation(format!(
                "unsupported payload {} v{}",
                payload.kind, payload.version
            )));
        }
        Ok(payload)
    }
}

/// Deterministic hash over the idempotency key, the actor identity and the
/// normalized request. Selected ids are sorted first.
pub fn request_signature(key: &str, actor: &Actor, request: &ExportRequest) -> ExportResult<String> {
    let (request, format) = normalize_request(request)?;
    let selection = &request.selection;
    let mut ids = selection.ids.clone();
    ids.sort();
    let columns: Vec<&str> = request.columns.iter().map(|c| c.trim()).collect();
    let query = match &request.query {
        Some(query) => serde_json::to_string(query)
            .map_err(|e| ExportError::internal(format!("encode query: {}", e)))?,
        None => String::new(),
    };

    let canonical = json!({
        "key": key.trim(),
        "actor_id": actor.id,
        "tenant": actor.scope.tenant,
        "workspace": actor.scope.workspace,
        "definition": request.definition,
        "variant": request.source_variant,
        "format": format.as_str(),
        "columns": columns,
        "selection": {
            "mode": selection.mode.map(|m| m.as_str()),
            "ids": ids,
            "query": selection.query,
        },
        "query": query,
    });
    let encoded = serde_json::to_vec(&canonical)
        .map_err(|e| ExportError::internal(format!("encode signature: {}", e)))?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

/// External queue that runs execution messages.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, message: ExecutionMessage) -> ExportResult<()>;
}

/// Encodes execution messages, retries enqueue and remembers idempotency signatures.
pub struct AsyncScheduler {
    queue: Arc<dyn JobQueue>,
    signatures: Option<Arc<dyn IdempotencyStore>>,
    ttl: Duration,
    retries: u32,
    retry_delay: Duration,
    script_path: String,
    dedup_policy: DedupPolicy,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AsyncScheduler {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            signatures: None,
            ttl: DEFAULT_IDEMPOTENCY_TTL,
            retries: 0,
            retry_delay: Duration::from_millis(100),
            script_path: DEFAULT_SCRIPT_PATH.to_string(),
            dedup_policy: DedupPolicy::default(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_signature_store(mut self, store: Arc<dyn IdempotencyStore>, ttl: Duration) -> Self {
        self.signatures = Some(store);
        self.ttl = ttl;
        self
    }

    /// Extra enqueue attempts after the first failure.
    pub fn with_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = delay;
        self
    }

    pub fn with_script_path(mut self, script_path: impl Into<String>) -> Self {
        self.script_path = script_path.into();
        self
    }

    pub fn with_dedup_policy(mut self, policy: DedupPolicy) -> Self {
        self.dedup_policy = policy;
        self
    }

    pub fn dedupes(&self) -> bool {
        self.signatures.is_some()
    }

    /// Serializes lookup and registration for one signature.
    pub async fn lock(&self, signature: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(signature.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Export id previously registered for `signature`.
    pub async fn lookup(&self, signature: &str) -> ExportResult<Option<String>> {
        match &self.signatures {
            Some(store) => store.lookup(signature).await,
            None => Ok(None),
        }
    }

    /// Message for one export. Queue-level dedup keys on the request
    /// signature, never on the caller's raw idempotency key.
    pub fn message(
        &self,
        export_id: &str,
        actor: &Actor,
        request: &ExportRequest,
        signature: Option<&str>,
    ) -> ExportResult<ExecutionMessage> {
        let payload = ExecutionPayload::new(export_id, actor.clone(), request.clone()).encode()?;
        Ok(ExecutionMessage {
            job_id: export_id.to_string(),
            script_path: self.script_path.clone(),
            parameters: ExecutionParameters { payload },
            idempotency_key: signature.map(str::to_string),
            dedup_policy: self.dedup_policy,
        })
    }

    /// Enqueues the job, then maps `signature` to `export_id` for the TTL.
    pub async fn enqueue(
        &self,
        ctx: &ExportContext,
        export_id: &str,
        actor: &Actor,
        request: &ExportRequest,
        signature: Option<&str>,
    ) -> ExportResult<ExecutionMessage> {
        let message = self.message(export_id, actor, request, signature)?;

        let mut attempt = 0;
        loop {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            match self.queue.enqueue(message.clone()).await {
                Ok(()) => break,
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    log::warn!(
                        target: "export::scheduler",
                        "enqueue {} failed (attempt {}): {}",
                        export_id,
                        attempt,
                        err
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }

        if let (Some(store), Some(signature)) = (&self.signatures, signature) {
            store.remember(signature, export_id, self.ttl).await?;
        }
        log::debug!(target: "export::scheduler", "enqueued {} ({})", export_id, self.script_path);
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::idempotency::MemoryIdempotencyStore;
    use crate::domains::export::queue_manager::RecordingJobQueue;
    use crate::domains::export::types::Selection;
    use crate::errors::ErrorKind;

    fn request() -> ExportRequest {
        let mut request = ExportRequest::new("users", "CSV");
        request.selection = Selection::ids(["3", "1", "2"]);
        request
    }

    #[test]
    fn signature_is_canonical() {
        let actor = Actor::new("u1").with_scope("t", "w");
        let base = request_signature("abc", &actor, &request()).unwrap();

        let mut reordered = request();
        reordered.selection = Selection::ids(["1", "2", "3"]);
        reordered.format = "csv".into();
        assert_eq!(request_signature("abc", &actor, &reordered).unwrap(), base);
        assert_eq!(base.len(), 64);

        assert_ne!(request_signature("other", &actor, &request()).unwrap(), base);
        let elsewhere = Actor::new("u1").with_scope("t", "x");
        assert_ne!(request_signature("abc", &elsewhere, &request()).unwrap(), base);
        let mut narrower = request();
        narrower.columns = vec!["id".into()];
        assert_ne!(request_signature("abc", &actor, &narrower).unwrap(), base);
    }

    #[test]
    fn payload_round_trips_and_checks_tag() {
        let payload = ExecutionPayload::new("e1", Actor::new("u1"), request());
        let decoded = ExecutionPayload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(decoded, payload);

        let mut foreign = payload.clone();
        foreign.kind = "other".into();
        let err = ExecutionPayload::decode(&foreign.encode().unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(ExecutionPayload::decode("not base64!").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_retries_then_remembers_signature() {
        let queue = Arc::new(RecordingJobQueue::failing(2));
        let signatures = Arc::new(MemoryIdempotencyStore::new());
        let scheduler = AsyncScheduler::new(queue.clone())
            .with_signature_store(signatures.clone(), Duration::from_secs(60))
            .with_retries(2, Duration::from_millis(10));

        let message = scheduler
            .enqueue(&ExportContext::background(), "e1", &Actor::new("u1"), &request(), Some("sig"))
            .await
            .unwrap();
        assert_eq!(message.job_id, "e1");
        assert_eq!(message.idempotency_key.as_deref(), Some("sig"));
        assert_eq!(queue.messages().len(), 1);
        assert_eq!(scheduler.lookup("sig").await.unwrap().as_deref(), Some("e1"));
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_gives_up_after_retries() {
        let queue = Arc::new(RecordingJobQueue::failing(5));
        let signatures = Arc::new(MemoryIdempotencyStore::new());
        let scheduler = AsyncScheduler::new(queue.clone())
            .with_signature_store(signatures, Duration::from_secs(60))
            .with_retries(1, Duration::from_millis(10));

        let err = scheduler
            .enqueue(&ExportContext::background(), "e1", &Actor::new("u1"), &request(), Some("sig"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(queue.messages().is_empty());
        assert_eq!(scheduler.lookup("sig").await.unwrap(), None);
    }

    #[tokio::test]
    async fn dedup_key_is_the_signature_not_the_raw_key() {
        let scheduler = AsyncScheduler::new(Arc::new(RecordingJobQueue::new()));
        let mut keyed = request();
        keyed.idempotency_key = Some("abc123".into());

        let first = request_signature("abc123", &Actor::new("u1"), &keyed).unwrap();
        let second = request_signature("abc123", &Actor::new("u2"), &keyed).unwrap();
        let a = scheduler.message("e1", &Actor::new("u1"), &keyed, Some(&first)).unwrap();
        let b = scheduler.message("e2", &Actor::new("u2"), &keyed, Some(&second)).unwrap();
        assert_ne!(a.idempotency_key, b.idempotency_key);

        let unsigned = scheduler.message("e3", &Actor::new("u1"), &keyed, None).unwrap();
        assert_eq!(unsigned.idempotency_key, None);
    }
}
