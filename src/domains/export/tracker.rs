//! Durable export lifecycle: the tracker contract, its optional
//! capabilities, and the in-memory reference implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::domains::export::events::Metadata;
use crate::domains::export::types::{ArtifactRef, ExportRecord, ExportState, HistoryFilter};
use crate::errors::{ExportError, ExportResult};

/// Increment applied by `advance`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressDelta {
    pub rows: u64,
    pub bytes: u64,
    pub errors: u64,
}

/// Final figures recorded by `complete`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionMeta {
    pub rows: u64,
    pub bytes: u64,
    pub metadata: Metadata,
}

#[async_trait]
pub trait ProgressTracker: Send + Sync {
    /// Persists a new record and returns its id.
    async fn start(&self, record: ExportRecord) -> ExportResult<String>;

    async fn advance(&self, id: &str, delta: ProgressDelta) -> ExportResult<()>;

    async fn set_state(&self, id: &str, state: ExportState) -> ExportResult<()>;

    async fn complete(&self, id: &str, meta: CompletionMeta) -> ExportResult<()>;

    /// Moves the record to `failed`, merging `metadata` into it.
    async fn fail(&self, id: &str, metadata: Metadata) -> ExportResult<()>;

    async fn status(&self, id: &str) -> ExportResult<ExportRecord>;

    /// Matching records, newest first.
    async fn list(&self, filter: &HistoryFilter) -> ExportResult<Vec<ExportRecord>>;

    fn as_artifact_tracker(&self) -> Option<&dyn ArtifactTracker> {
        None
    }

    fn as_record_updater(&self) -> Option<&dyn RecordUpdater> {
        None
    }

    fn as_record_deleter(&self) -> Option<&dyn RecordDeleter> {
        None
    }
}

#[async_trait]
pub trait ArtifactTracker: Send + Sync {
    async fn set_artifact(&self, id: &str, artifact: ArtifactRef) -> ExportResult<()>;
}

#[async_trait]
pub trait RecordUpdater: Send + Sync {
    /// Replaces a stored record wholesale.
    async fn update(&self, record: ExportRecord) -> ExportResult<()>;
}

#[async_trait]
pub trait RecordDeleter: Send + Sync {
    /// Removes a record. Missing ids are not an error.
    async fn delete(&self, id: &str) -> ExportResult<()>;
}

fn not_found(id: &str) -> ExportError {
    ExportError::not_found(format!("export {} not found", id))
}

fn transition(record: &mut ExportRecord, next: ExportState) -> ExportResult<()> {
    if !record.state.can_transition_to(next) {
        if record.state == ExportState::Canceled {
            return Err(ExportError::canceled());
        }
        return Err(ExportError::validation(format!(
            "export {}: invalid transition {} -> {}",
            record.id, record.state, next
        )));
    }
    let now = Utc::now();
    if next == ExportState::Running && record.started_at.is_none() {
        record.started_at = Some(now);
    }
    if next.is_terminal() && next != ExportState::Deleted && record.completed_at.is_none() {
        record.completed_at = Some(now);
    }
    record.state = next;
    Ok(())
}

#[derive(Debug)]
struct Entry {
    record: ExportRecord,
    advance_calls: u64,
}

/// Reference tracker. Each record sits behind its own lock so transitions
/// on one export apply in order without blocking others.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    entries: RwLock<HashMap<String, Arc<Mutex<Entry>>>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &str) -> ExportResult<Arc<Mutex<Entry>>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    fn all_entries(&self) -> Vec<Arc<Mutex<Entry>>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Number of `advance` calls observed for `id`.
    pub async fn advance_calls(&self, id: &str) -> u64 {
        match self.entry(id) {
            Ok(entry) => entry.lock().await.advance_calls,
            Err(_) => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProgressTracker for MemoryTracker {
    async fn start(&self, record: ExportRecord) -> ExportResult<String> {
        if record.id.trim().is_empty() {
            return Err(ExportError::validation("export id is required"));
        }
        let id = record.id.clone();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&id) {
            return Err(ExportError::validation(format!("export {} already exists", id)));
        }
        entries.insert(
            id.clone(),
            Arc::new(Mutex::new(Entry {
                record,
                advance_calls: 0,
            })),
        );
        log::debug!(target: "export::tracker", "started {}", id);
        Ok(id)
    }

    async fn advance(&self, id: &str, delta: ProgressDelta) -> ExportResult<()> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock().await;
        match entry.record.state {
            ExportState::Canceled => return Err(ExportError::canceled()),
            state if state.is_terminal() => {
                return Err(ExportError::validation(format!("export {} is {}", id, state)))
            }
            _ => {}
        }
        entry.advance_calls += 1;
        let record = &mut entry.record;
        record.counts.processed += delta.rows;
        record.counts.errors += delta.errors;
        record.bytes_written += delta.bytes;
        Ok(())
    }

    async fn set_state(&self, id: &str, state: ExportState) -> ExportResult<()> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock().await;
        transition(&mut entry.record, state)?;
        log::debug!(target: "export::tracker", "{} -> {}", id, state);
        Ok(())
    }

    async fn complete(&self, id: &str, meta: CompletionMeta) -> ExportResult<()> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock().await;
        let record = &mut entry.record;
        transition(record, ExportState::Completed)?;
        record.counts.total = meta.rows;
        record.bytes_written = meta.bytes;
        record.metadata.extend(meta.metadata);
        Ok(())
    }

    async fn fail(&self, id: &str, metadata: Metadata) -> ExportResult<()> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock().await;
        let record = &mut entry.record;
        transition(record, ExportState::Failed)?;
        record.metadata.extend(metadata);
        Ok(())
    }

    async fn status(&self, id: &str) -> ExportResult<ExportRecord> {
        let entry = self.entry(id)?;
        let record = entry.lock().await.record.clone();
        Ok(record)
    }

    async fn list(&self, filter: &HistoryFilter) -> ExportResult<Vec<ExportRecord>> {
        let mut records = Vec::new();
        for entry in self.all_entries() {
            let entry = entry.lock().await;
            if filter.matches(&entry.record) {
                records.push(entry.record.clone());
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit.filter(|l| *l > 0) {
            records.truncate(limit);
        }
        Ok(records)
    }

    fn as_artifact_tracker(&self) -> Option<&dyn ArtifactTracker> {
        Some(self)
    }

    fn as_record_updater(&self) -> Option<&dyn RecordUpdater> {
        Some(self)
    }

    fn as_record_deleter(&self) -> Option<&dyn RecordDeleter> {
        Some(self)
    }
}

#[async_trait]
impl ArtifactTracker for MemoryTracker {
    async fn set_artifact(&self, id: &str, artifact: ArtifactRef) -> ExportResult<()> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock().await;
        entry.record.bytes_written = artifact.meta.size;
        entry.record.artifact = Some(artifact);
        Ok(())
    }
}

#[async_trait]
impl RecordUpdater for MemoryTracker {
    async fn update(&self, record: ExportRecord) -> ExportResult<()> {
        let entry = self.entry(&record.id)?;
        entry.lock().await.record = record;
        Ok(())
    }
}

#[async_trait]
impl RecordDeleter for MemoryTracker {
    async fn delete(&self, id: &str) -> ExportResult<()> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Actor;
    use crate::domains::export::types::{ArtifactMeta, DeliveryMode, Format};
    use crate::errors::ErrorKind;
    use chrono::Duration;

    fn record(id: &str, definition: &str, offset_secs: i64) -> ExportRecord {
        ExportRecord::queued(
            id,
            definition,
            Format::Csv,
            DeliveryMode::Async,
            &Actor::new("u1"),
            Utc::now() + Duration::seconds(offset_secs),
        )
    }

    #[tokio::test]
    async fn lifecycle_updates_timestamps_and_counts() {
        let tracker = MemoryTracker::new();
        tracker.start(record("e1", "users", 0)).await.unwrap();
        tracker.set_state("e1", ExportState::Running).await.unwrap();
        for _ in 0..3 {
            tracker.advance("e1", ProgressDelta { rows: 1, ..Default::default() }).await.unwrap();
        }
        tracker
            .complete("e1", CompletionMeta { rows: 3, bytes: 42, ..Default::default() })
            .await
            .unwrap();

        let status = tracker.status("e1").await.unwrap();
        assert_eq!(status.state, ExportState::Completed);
        assert_eq!(status.counts.processed, 3);
        assert_eq!(status.counts.total, 3);
        assert_eq!(status.bytes_written, 42);
        assert!(status.started_at.is_some());
        assert!(status.completed_at.is_some());
        assert_eq!(tracker.advance_calls("e1").await, 3);
    }

    #[tokio::test]
    async fn rejects_backward_transitions_and_duplicates() {
        let tracker = MemoryTracker::new();
        tracker.start(record("e1", "users", 0)).await.unwrap();
        assert!(tracker.start(record("e1", "users", 0)).await.is_err());
        tracker.set_state("e1", ExportState::Running).await.unwrap();
        let err = tracker.set_state("e1", ExportState::Queued).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn canceled_record_stops_progress() {
        let tracker = MemoryTracker::new();
        tracker.start(record("e1", "users", 0)).await.unwrap();
        tracker.set_state("e1", ExportState::Running).await.unwrap();
        tracker.set_state("e1", ExportState::Canceled).await.unwrap();
        let err = tracker.advance("e1", ProgressDelta::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);
        let err = tracker.complete("e1", CompletionMeta::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);
    }

    #[tokio::test]
    async fn missing_records_are_not_found() {
        let tracker = MemoryTracker::new();
        assert_eq!(tracker.status("nope").await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(
            tracker.advance("nope", ProgressDelta::default()).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(tracker.advance_calls("nope").await, 0);
    }

    #[tokio::test]
    async fn history_is_filtered_newest_first() {
        let tracker = MemoryTracker::new();
        tracker.start(record("old", "users", -60)).await.unwrap();
        tracker.start(record("new", "users", 0)).await.unwrap();
        tracker.start(record("other", "orders", -30)).await.unwrap();

        let filter = HistoryFilter {
            definition: Some("users".into()),
            ..Default::default()
        };
        let ids: Vec<_> = tracker.list(&filter).await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["new", "old"]);

        let limited = HistoryFilter {
            limit: Some(1),
            ..Default::default()
        };
        assert_eq!(tracker.list(&limited).await.unwrap()[0].id, "new");
    }

    #[tokio::test]
    async fn capabilities_update_and_delete() {
        let tracker = MemoryTracker::new();
        tracker.start(record("e1", "users", 0)).await.unwrap();
        let artifact = ArtifactRef {
            key: "exports/e1.csv".into(),
            meta: ArtifactMeta {
                size: 9,
                ..Default::default()
            },
        };
        tracker.as_artifact_tracker().unwrap().set_artifact("e1", artifact.clone()).await.unwrap();
        assert_eq!(tracker.status("e1").await.unwrap().artifact, Some(artifact));

        let mut changed = tracker.status("e1").await.unwrap();
        changed.state = ExportState::Deleted;
        tracker.as_record_updater().unwrap().update(changed).await.unwrap();
        assert_eq!(tracker.status("e1").await.unwrap().state, ExportState::Deleted);

        let deleter = tracker.as_record_deleter().unwrap();
        deleter.delete("e1").await.unwrap();
        deleter.delete("e1").await.unwrap();
        assert!(tracker.is_empty());
    }
}
