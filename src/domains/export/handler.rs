//! Transport-agnostic HTTP-style ingress for the export service.
//!
//! Routes, relative to the handler base path:
//!
//! | Method | Path              | Action                          |
//! |--------|-------------------|---------------------------------|
//! | POST   | `/`               | request an export               |
//! | GET    | `/`               | history                         |
//! | GET    | `/{id}`           | status                          |
//! | POST   | `/{id}/cancel`    | cancel                          |
//! | DELETE | `/{id}`           | delete                          |
//! | GET    | `/{id}/download`  | signed URL redirect or stream   |

use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWrite};

use crate::auth::{Actor, ActorProvider, ContextActorProvider};
use crate::domains::export::context::ExportContext;
use crate::domains::export::io::CountingWriter;
use crate::domains::export::service::{ExportService, PlannedDelivery};
use crate::domains::export::store::ArtifactReader;
use crate::domains::export::types::{ExportRequest, ExportState, Format, HistoryFilter};
use crate::domains::export::writers::OutputWriter;
use crate::errors::{ErrorKind, ExportError, ExportResult};

pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_CONTENT_DISPOSITION: &str = "Content-Disposition";
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";
pub const HEADER_EXPORT_ID: &str = "X-Export-Id";
pub const HEADER_IDEMPOTENCY_KEY: &str = "Idempotency-Key";

const DEFAULT_MAX_BODY_BYTES: u64 = 1024 * 1024;

/// Incoming request as seen by the handler.
pub trait RequestCarrier: Send {
    fn method(&self) -> &str;
    /// Path without the query string
    fn path(&self) -> &str;
    fn header(&self, name: &str) -> Option<String>;
    fn query(&self, name: &str) -> Option<String>;
    fn url(&self) -> String;
    /// Takes the body. Later calls yield an empty reader.
    fn body(&mut self) -> ArtifactReader;
    fn context(&self) -> ExportContext;
}

/// Outgoing response.
#[async_trait]
pub trait ResponseCarrier: Send {
    fn set_header(&mut self, name: &str, value: &str);
    fn del_header(&mut self, name: &str);
    fn write_header(&mut self, status: u16);
    async fn write(&mut self, bytes: &[u8]) -> ExportResult<()>;
    async fn write_json(&mut self, status: u16, payload: &serde_json::Value) -> ExportResult<()>;
    /// Streaming body writer, when the transport supports one. The first
    /// byte written commits status 200 unless a status was already written.
    fn writer(&mut self) -> Option<&mut OutputWriter<'_>>;
    fn redirect(&mut self, location: &str, status: u16);
}

pub struct ExportHandler {
    service: Arc<ExportService>,
    base_path: String,
    actors: Arc<dyn ActorProvider>,
    max_body_bytes: u64,
}

impl ExportHandler {
    pub fn new(service: Arc<ExportService>, base_path: impl Into<String>) -> Self {
        let base_path = base_path.into().trim_end_matches('/').to_string();
        Self {
            service,
            base_path,
            actors: Arc::new(ContextActorProvider),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_actor_provider(mut self, actors: Arc<dyn ActorProvider>) -> Self {
        self.actors = actors;
        self
    }

    pub fn with_max_body_bytes(mut self, max: u64) -> Self {
        self.max_body_bytes = max;
        self
    }

    pub async fn handle(&self, req: &mut dyn RequestCarrier, res: &mut dyn ResponseCarrier) {
        let ctx = req.context();
        let result = match self.actors.actor(&ctx).await {
            Ok(actor) => self.route(&ctx, &actor, req, res).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            log::debug!(target: "export::handler", "{} {}: {}", req.method(), req.path(), err);
            write_error(res, &err).await;
        }
    }

    async fn route(
        &self,
        ctx: &ExportContext,
        actor: &Actor,
        req: &mut dyn RequestCarrier,
        res: &mut dyn ResponseCarrier,
    ) -> ExportResult<()> {
        let path = req.path().to_string();
        let rest = path
            .strip_prefix(&self.base_path)
            .filter(|rest| rest.is_empty() || rest.starts_with('/'))
            .ok_or_else(|| ExportError::not_found(format!("no route for {}", path)))?;
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        let method = req.method().to_ascii_uppercase();

        match (method.as_str(), segments.as_slice()) {
            ("POST", []) => self.create(ctx, actor, req, res).await,
            ("GET", []) => self.history(ctx, actor, req, res).await,
            ("GET", [id]) => {
                let record = self.service.status(ctx, actor, id).await?;
                res.write_json(200, &to_json(&record)?).await
            }
            ("DELETE", [id]) => {
                let record = self.service.delete_export(ctx, actor, id).await?;
                res.write_json(200, &to_json(&record)?).await
            }
            ("POST", [id, "cancel"]) => {
                let record = self.service.cancel_export(ctx, actor, id).await?;
                res.write_json(200, &to_json(&record)?).await
            }
            ("GET", [id, "download"]) => self.download(ctx, actor, id, res).await,
            (_, []) | (_, [_]) | (_, [_, "cancel"]) | (_, [_, "download"]) => Err(ExportError::validation(
                format!("method {} not allowed on {}", method, path),
            )),
            _ => Err(ExportError::not_found(format!("no route for {}", path))),
        }
    }

    async fn read_request(&self, req: &mut dyn RequestCarrier) -> ExportResult<ExportRequest> {
        let mut raw = Vec::new();
        req.body()
            .take(self.max_body_bytes + 1)
            .read_to_end(&mut raw)
            .await?;
        if raw.len() as u64 > self.max_body_bytes {
            return Err(ExportError::validation("request body too large"));
        }
        let mut request: ExportRequest = serde_json::from_slice(&raw)
            .map_err(|e| ExportError::validation(format!("invalid export request: {}", e)))?;
        if let Some(key) = req.header(HEADER_IDEMPOTENCY_KEY).filter(|key| !key.trim().is_empty()) {
            request.idempotency_key = Some(key.trim().to_string());
        }
        Ok(request)
    }

    async fn create(
        &self,
        ctx: &ExportContext,
        actor: &Actor,
        req: &mut dyn RequestCarrier,
        res: &mut dyn ResponseCarrier,
    ) -> ExportResult<()> {
        let request = self.read_request(req).await?;
        let plan = self.service.plan(&request)?;

        if plan.delivery == PlannedDelivery::Async {
            let record = self.service.request_planned(ctx, actor, &request, &plan, None).await?;
            let status_url = format!("{}/{}", self.base_path, record.id);
            let payload = json!({
                "id": record.id,
                "status_url": status_url,
                "download_url": format!("{}/download", status_url),
            });
            return res.write_json(202, &payload).await;
        }

        res.set_header(HEADER_CONTENT_TYPE, &plan.content_type);
        res.set_header(HEADER_CONTENT_DISPOSITION, &content_disposition(&plan.filename));
        res.set_header(HEADER_EXPORT_ID, &plan.export_id);

        let (result, written) = match res.writer() {
            Some(writer) => {
                let mut counting = CountingWriter::new(writer);
                let result = self
                    .service
                    .request_planned(ctx, actor, &request, &plan, Some(&mut counting))
                    .await;
                (result, counting.bytes_written())
            }
            None => (
                Err(ExportError::not_implemented("response does not support streaming")),
                0,
            ),
        };

        match result {
            Ok(record) => {
                log::debug!(
                    target: "export::handler",
                    "sync export {} streamed {} bytes",
                    record.id,
                    written
                );
                Ok(())
            }
            Err(err) if written == 0 => {
                res.del_header(HEADER_CONTENT_TYPE);
                res.del_header(HEADER_CONTENT_DISPOSITION);
                res.del_header(HEADER_EXPORT_ID);
                Err(err)
            }
            Err(err) => {
                // the status line is gone, the client sees a truncated body
                log::error!(
                    target: "export::handler",
                    "sync export {} failed after {} bytes: {}",
                    plan.export_id,
                    written,
                    err
                );
                Ok(())
            }
        }
    }

    async fn history(
        &self,
        ctx: &ExportContext,
        actor: &Actor,
        req: &mut dyn RequestCarrier,
        res: &mut dyn ResponseCarrier,
    ) -> ExportResult<()> {
        let filter = history_filter(req)?;
        let records = self.service.history(ctx, actor, &filter).await?;
        res.write_json(200, &json!({ "exports": to_json(&records)? })).await
    }

    async fn download(
        &self,
        ctx: &ExportContext,
        actor: &Actor,
        id: &str,
        res: &mut dyn ResponseCarrier,
    ) -> ExportResult<()> {
        match self.service.signed_url(ctx, actor, id).await {
            Ok(url) => {
                res.redirect(&url, 302);
                return Ok(());
            }
            Err(err) if err.kind() == ErrorKind::NotImplemented => {}
            Err(err) => return Err(err),
        }

        let (mut reader, meta) = self.service.open_artifact(ctx, actor, id).await?;
        res.set_header(HEADER_CONTENT_TYPE, &meta.content_type);
        res.set_header(HEADER_CONTENT_DISPOSITION, &content_disposition(&meta.filename));
        res.set_header(HEADER_CONTENT_LENGTH, &meta.size.to_string());
        res.set_header(HEADER_EXPORT_ID, id);
        match res.writer() {
            Some(writer) => {
                tokio::io::copy(&mut reader, writer).await?;
            }
            None => {
                let mut body = Vec::new();
                reader.read_to_end(&mut body).await?;
                res.write_header(200);
                res.write(&body).await?;
            }
        }
        Ok(())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> ExportResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| ExportError::internal(format!("encode response: {}", e)))
}

async fn write_error(res: &mut dyn ResponseCarrier, err: &ExportError) {
    let status = err.kind().http_status();
    if let Err(write_err) = res.write_json(status, &json!({ "error": err })).await {
        log::warn!(target: "export::handler", "writing error response: {}", write_err);
    }
}

/// `attachment` disposition with an ASCII fallback and an RFC 5987 `filename*`.
pub fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(filename)
    )
}

fn parse_time(name: &str, raw: &str) -> ExportResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ExportError::validation(format!("invalid {}: {}", name, e)))
}

fn history_filter(req: &dyn RequestCarrier) -> ExportResult<HistoryFilter> {
    let mut filter = HistoryFilter::default();
    filter.definition = req.query("definition").filter(|v| !v.is_empty());
    filter.actor_id = req.query("actor_id").filter(|v| !v.is_empty());
    if let Some(state) = req.query("state").filter(|v| !v.is_empty()) {
        filter.state = Some(ExportState::parse(&state)?);
    }
    if let Some(format) = req.query("format").filter(|v| !v.is_empty()) {
        filter.format = Some(Format::parse(&format)?);
    }
    if let Some(since) = req.query("since").filter(|v| !v.is_empty()) {
        filter.since = Some(parse_time("since", &since)?);
    }
    if let Some(until) = req.query("until").filter(|v| !v.is_empty()) {
        filter.until = Some(parse_time("until", &until)?);
    }
    if let Some(limit) = req.query("limit").filter(|v| !v.is_empty()) {
        let limit = limit
            .trim()
            .parse::<usize>()
            .map_err(|_| ExportError::validation(format!("invalid limit: {}", limit)))?;
        filter.limit = Some(limit);
    }
    Ok(filter)
}

/// In-memory request, for tests and embedding.
pub struct MemoryRequest {
    method: String,
    path: String,
    raw_query: String,
    query: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
    ctx: ExportContext,
}

impl MemoryRequest {
    /// `target` is a path with an optional `?query`.
    pub fn new(method: impl Into<String>, target: &str) -> Self {
        let (path, raw_query) = target.split_once('?').unwrap_or((target, ""));
        let query = raw_query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                (decode(name), decode(value))
            })
            .collect();
        Self {
            method: method.into(),
            path: path.to_string(),
            raw_query: raw_query.to_string(),
            query,
            headers: BTreeMap::new(),
            body: Vec::new(),
            ctx: ExportContext::background(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_json(self, body: &serde_json::Value) -> Self {
        self.with_header(HEADER_CONTENT_TYPE, "application/json")
            .with_body(body.to_string())
    }

    pub fn with_context(mut self, ctx: ExportContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.ctx = self.ctx.with_actor(actor);
        self
    }
}

fn decode(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}

impl RequestCarrier for MemoryRequest {
    fn method(&self) -> &str {
        &self.method
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers.get(&name.to_ascii_lowercase()).cloned()
    }

    fn query(&self, name: &str) -> Option<String> {
        self.query.get(name).cloned()
    }

    fn url(&self) -> String {
        if self.raw_query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.raw_query)
        }
    }

    fn body(&mut self) -> ArtifactReader {
        Box::new(io::Cursor::new(std::mem::take(&mut self.body)))
    }

    fn context(&self) -> ExportContext {
        self.ctx.clone()
    }
}

/// Buffered response, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryResponse {
    status: Option<u16>,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl MemoryResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Written status; 200 when only a body was written.
    pub fn status(&self) -> u16 {
        self.status.unwrap_or(200)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> ExportResult<serde_json::Value> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ExportError::internal(format!("response is not json: {}", e)))
    }

    fn commit(&mut self) {
        if self.status.is_none() {
            self.status = Some(200);
        }
    }
}

#[async_trait]
impl ResponseCarrier for MemoryResponse {
    fn set_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    }

    fn del_header(&mut self, name: &str) {
        self.headers.remove(&name.to_ascii_lowercase());
    }

    fn write_header(&mut self, status: u16) {
        if self.status.is_none() {
            self.status = Some(status);
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> ExportResult<()> {
        self.commit();
        self.body.extend_from_slice(bytes);
        Ok(())
    }

    async fn write_json(&mut self, status: u16, payload: &serde_json::Value) -> ExportResult<()> {
        self.set_header(HEADER_CONTENT_TYPE, "application/json");
        self.write_header(status);
        let encoded = serde_json::to_vec(payload)
            .map_err(|e| ExportError::internal(format!("encode response: {}", e)))?;
        self.write(&encoded).await
    }

    fn writer(&mut self) -> Option<&mut OutputWriter<'_>> {
        Some(self)
    }

    fn redirect(&mut self, location: &str, status: u16) {
        self.set_header("Location", location);
        self.write_header(status);
    }
}

impl AsyncWrite for MemoryResponse {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.commit();
        this.body.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_request_parses_target() {
        let req = MemoryRequest::new("GET", "/exports?state=completed&definition=user%20list&limit=5")
            .with_header("Idempotency-Key", "abc");
        assert_eq!(req.path(), "/exports");
        assert_eq!(req.query("definition").as_deref(), Some("user list"));
        assert_eq!(req.header("idempotency-key").as_deref(), Some("abc"));
        assert_eq!(req.url(), "/exports?state=completed&definition=user%20list&limit=5");

        let filter = history_filter(&req).unwrap();
        assert_eq!(filter.state, Some(ExportState::Completed));
        assert_eq!(filter.limit, Some(5));
    }

    #[test]
    fn invalid_history_params_are_validation_errors() {
        let req = MemoryRequest::new("GET", "/exports?since=yesterday");
        assert_eq!(history_filter(&req).unwrap_err().kind(), ErrorKind::Validation);
        let req = MemoryRequest::new("GET", "/exports?limit=-1");
        assert_eq!(history_filter(&req).unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn disposition_escapes_filename() {
        assert_eq!(
            content_disposition("users.csv"),
            "attachment; filename=\"users.csv\"; filename*=UTF-8''users.csv"
        );
        let odd = content_disposition("rapport \"été\".csv");
        assert!(odd.starts_with("attachment; filename=\"rapport __t__.csv\""));
        assert!(odd.contains("filename*=UTF-8''rapport%20%22%C3%A9t%C3%A9%22.csv"));
    }

    #[tokio::test]
    async fn first_body_write_commits_ok() {
        let mut res = MemoryResponse::new();
        res.set_header("X-Export-Id", "e1");
        {
            let writer = res.writer().unwrap();
            tokio::io::AsyncWriteExt::write_all(writer, b"id\r\n").await.unwrap();
        }
        res.write_header(500);
        assert_eq!(res.status(), 200);
        assert_eq!(res.header("x-export-id"), Some("e1"));
        assert_eq!(res.text(), "id\r\n");
    }
}
