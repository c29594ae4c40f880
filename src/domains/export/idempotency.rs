use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::ExportResult;

pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Maps an idempotency signature to the export it produced.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Export id stored under `signature`, unless expired.
    async fn lookup(&self, signature: &str) -> ExportResult<Option<String>>;

    /// Stores or replaces the mapping. A zero `ttl` never expires.
    async fn remember(&self, signature: &str, export_id: &str, ttl: Duration) -> ExportResult<()>;

    async fn forget(&self, signature: &str) -> ExportResult<()>;
}

#[derive(Debug, Clone)]
struct Entry {
    export_id: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires| expires > now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryIdempotencyStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops expired entries, returning how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts the mapping and drops whatever expired before `now`.
    fn remember_at(&self, signature: &str, export_id: &str, ttl: Duration, now: DateTime<Utc>) {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|ttl| now.checked_add_signed(ttl))
        };
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, entry| entry.is_live(now));
        entries.insert(
            signature.to_string(),
            Entry {
                export_id: export_id.to_string(),
                expires_at,
            },
        );
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn lookup(&self, signature: &str) -> ExportResult<Option<String>> {
        let now = Utc::now();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .get(signature)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.export_id.clone()))
    }

    async fn remember(&self, signature: &str, export_id: &str, ttl: Duration) -> ExportResult<()> {
        self.remember_at(signature, export_id, ttl, Utc::now());
        Ok(())
    }

    async fn forget(&self, signature: &str) -> ExportResult<()> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(signature);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remembers_until_expiry() {
        let store = MemoryIdempotencyStore::new();
        assert_eq!(store.lookup("sig").await.unwrap(), None);

        store.remember("sig", "e1", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.lookup("sig").await.unwrap().as_deref(), Some("e1"));

        store.remember("sig", "e2", Duration::ZERO).await.unwrap();
        assert_eq!(store.lookup("sig").await.unwrap().as_deref(), Some("e2"));

        store.forget("sig").await.unwrap();
        assert_eq!(store.lookup("sig").await.unwrap(), None);
    }

    #[tokio::test]
    async fn purge_drops_expired_entries() {
        let store = MemoryIdempotencyStore::new();
        store.remember("a", "e1", Duration::from_secs(1)).await.unwrap();
        store.remember("b", "e2", Duration::ZERO).await.unwrap();
        let later = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(store.purge_expired(later), 1);
        assert_eq!(store.lookup("b").await.unwrap().as_deref(), Some("e2"));
    }

    #[test]
    fn remember_sweeps_expired_entries() {
        let store = MemoryIdempotencyStore::new();
        let now = Utc::now();
        store.remember_at("a", "e1", Duration::from_secs(1), now);
        store.remember_at("b", "e2", Duration::from_secs(1), now);
        assert_eq!(store.len(), 2);

        store.remember_at("c", "e3", Duration::from_secs(60), now + chrono::Duration::seconds(5));
        assert_eq!(store.len(), 1);
    }
}
