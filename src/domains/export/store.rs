//! Artifact storage contract plus in-memory and filesystem backends.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::domains::export::context::ExportContext;
use crate::domains::export::types::{ArtifactMeta, ArtifactRef};
use crate::errors::{ExportError, ExportResult};

pub type ArtifactReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Consumes `reader` to EOF; the stored size is the number of bytes read.
    async fn put(&self, ctx: &ExportContext, key: &str, reader: ArtifactReader, meta: ArtifactMeta) -> ExportResult<ArtifactRef>;

    /// `not_found` for unknown keys.
    async fn open(&self, ctx: &ExportContext, key: &str) -> ExportResult<(ArtifactReader, ArtifactMeta)>;

    /// Idempotent.
    async fn delete(&self, ctx: &ExportContext, key: &str) -> ExportResult<()>;

    /// `not_implemented` when the backend cannot sign.
    async fn signed_url(&self, ctx: &ExportContext, key: &str, ttl: Duration) -> ExportResult<String>;
}

fn missing(key: &str) -> ExportError {
    ExportError::not_found(format!("artifact {} not found", key))
}

fn expiry_timestamp(ttl: Duration) -> i64 {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
    (Utc::now() + ttl).timestamp()
}

/// Reads `reader` to EOF, giving up as soon as the context fires.
async fn drain(ctx: &ExportContext, reader: &mut ArtifactReader) -> ExportResult<Vec<u8>> {
    let mut body = Vec::new();
    let mut chunk = vec![0u8; 16 * 1024];
    loop {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let n = if ctx.is_bounded() {
            tokio::select! {
                biased;
                err = ctx.done() => return Err(err),
                n = reader.read(&mut chunk) => n?,
            }
        } else {
            reader.read(&mut chunk).await?
        };
        if n == 0 {
            return Ok(body);
        }
        body.extend_from_slice(&chunk[..n]);
    }
}

fn finalize_meta(mut meta: ArtifactMeta, size: u64) -> ArtifactMeta {
    meta.size = size;
    if meta.created_at.is_none() {
        meta.created_at = Some(Utc::now());
    }
    meta
}

/// Reference store keeping artifacts in memory.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    objects: RwLock<HashMap<String, (Vec<u8>, ArtifactMeta)>>,
    url_base: Option<String>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables `signed_url`, producing `{base}/{key}?expires={unix}`.
    pub fn with_url_base(mut self, base: impl Into<String>) -> Self {
        self.url_base = Some(base.into().trim_end_matches('/').to_string());
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).contains_key(key)
    }

    pub fn bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|(body, _)| body.clone())
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, ctx: &ExportContext, key: &str, mut reader: ArtifactReader, meta: ArtifactMeta) -> ExportResult<ArtifactRef> {
        let body = drain(ctx, &mut reader).await?;
        let meta = finalize_meta(meta, body.len() as u64);
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), (body, meta.clone()));
        Ok(ArtifactRef {
            key: key.to_string(),
            meta,
        })
    }

    async fn open(&self, _ctx: &ExportContext, key: &str) -> ExportResult<(ArtifactReader, ArtifactMeta)> {
        let (body, meta) = self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| missing(key))?;
        Ok((Box::new(std::io::Cursor::new(body)), meta))
    }

    async fn delete(&self, _ctx: &ExportContext, key: &str) -> ExportResult<()> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    async fn signed_url(&self, _ctx: &ExportContext, key: &str, ttl: Duration) -> ExportResult<String> {
        let base = self
            .url_base
            .as_ref()
            .ok_or_else(|| ExportError::not_implemented("signed urls are not supported by this store"))?;
        if !self.contains(key) {
            return Err(missing(key));
        }
        Ok(format!(
            "{}/{}?expires={}",
            base,
            urlencoding::encode(key),
            expiry_timestamp(ttl)
        ))
    }
}

/// Filesystem store rooted at a directory. Metadata lives next to each
/// artifact in a `.meta.json` sidecar.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a key to a path below the root, rejecting traversal.
    fn path_for(&self, key: &str) -> ExportResult<PathBuf> {
        let invalid = || ExportError::validation(format!("invalid artifact key: {}", key));
        if key.is_empty() || key.contains('\\') || key.contains('\0') {
            return Err(invalid());
        }
        let mut path = self.root.clone();
        for part in key.split('/') {
            if part.is_empty() || part.ends_with(".meta.json") {
                return Err(invalid());
            }
            match Path::new(part).components().next() {
                Some(Component::Normal(_)) => path.push(part),
                _ => return Err(invalid()),
            }
        }
        Ok(path)
    }

    fn sidecar(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".meta.json");
        PathBuf::from(name)
    }

    async fn remove_if_present(path: &Path) -> ExportResult<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, ctx: &ExportContext, key: &str, mut reader: ArtifactReader, meta: ArtifactMeta) -> ExportResult<ArtifactRef> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = path.with_extension("partial");

        let written = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            let mut chunk = vec![0u8; 64 * 1024];
            let mut size = 0u64;
            loop {
                if let Some(err) = ctx.err() {
                    return Err(err);
                }
                let n = reader.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                file.write_all(&chunk[..n]).await?;
                size += n as u64;
            }
            file.sync_all().await?;
            ExportResult::Ok(size)
        }
        .await;
        let size = match written {
            Ok(size) => size,
            Err(err) => {
                let _ = Self::remove_if_present(&partial).await;
                return Err(err);
            }
        };

        tokio::fs::rename(&partial, &path).await?;
        let meta = finalize_meta(meta, size);
        let sidecar = serde_json::to_vec_pretty(&meta)
            .map_err(|e| ExportError::internal(format!("artifact metadata: {}", e)))?;
        tokio::fs::write(Self::sidecar(&path), sidecar).await?;

        log::debug!(target: "export::store", "stored {} ({} bytes) at {}", key, size, path.display());
        Ok(ArtifactRef {
            key: key.to_string(),
            meta,
        })
    }

    async fn open(&self, _ctx: &ExportContext, key: &str) -> ExportResult<(ArtifactReader, ArtifactMeta)> {
        let path = self.path_for(key)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(missing(key)),
            Err(err) => return Err(err.into()),
        };
        let meta = match tokio::fs::read(Self::sidecar(&path)).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| ExportError::internal(format!("artifact metadata: {}", e)))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ArtifactMeta {
                size: file.metadata().await?.len(),
                ..Default::default()
            },
            Err(err) => return Err(err.into()),
        };
        Ok((Box::new(file), meta))
    }

    async fn delete(&self, _ctx: &ExportContext, key: &str) -> ExportResult<()> {
        let path = self.path_for(key)?;
        Self::remove_if_present(&path).await?;
        Self::remove_if_present(&Self::sidecar(&path)).await
    }

    async fn signed_url(&self, _ctx: &ExportContext, key: &str, ttl: Duration) -> ExportResult<String> {
        let path = self.path_for(key)?;
        if tokio::fs::metadata(&path).await.is_err() {
            return Err(missing(key));
        }
        let absolute = if path.is_absolute() {
            path
        } else {
            std::env::current_dir()?.join(path)
        };
        let encoded: Vec<String> = absolute
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(urlencoding::encode(&part.to_string_lossy()).into_owned()),
                _ => None,
            })
            .collect();
        Ok(format!("file:///{}?expires={}", encoded.join("/"), expiry_timestamp(ttl)))
    }
}
