use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, Notify, Semaphore};

use crate::domains::export::scheduler::{DedupPolicy, ExecutionMessage, JobQueue};
use crate::errors::{ExportError, ExportResult};

/// Executes one queued message
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, message: ExecutionMessage) -> ExportResult<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed(String),
}

/// Handle for tracking a queued job
pub struct JobHandle {
    pub id: String,
    status_receiver: watch::Receiver<JobStatus>,
}

impl JobHandle {
    pub async fn wait_for_completion(&mut self) -> ExportResult<()> {
        loop {
            match &*self.status_receiver.borrow_and_update() {
                JobStatus::Completed => return Ok(()),
                JobStatus::Failed(err) => return Err(ExportError::internal(err.clone())),
                _ => {}
            }
            self.status_receiver
                .changed()
                .await
                .map_err(|_| ExportError::internal("job status channel closed"))?;
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status_receiver.borrow().clone()
    }
}

/// Queue statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub active: usize,
    pub capacity: usize,
}

/// Finished job statuses kept for `status`/`subscribe` lookups.
pub const DEFAULT_FINISHED_STATUSES: usize = 1024;

/// In-process queue that runs messages on the tokio runtime with bounded
/// concurrency. Messages carrying an idempotency key under
/// [`DedupPolicy::DropDuplicate`] are dropped while an equal key is pending.
/// Only the most recent finished statuses are kept.
pub struct LocalJobQueue {
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    pending_keys: Arc<Mutex<HashSet<String>>>,
    job_statuses: Arc<Mutex<HashMap<String, watch::Sender<JobStatus>>>>,
    finished: Arc<Mutex<VecDeque<String>>>,
    keep_finished: usize,
    processor: RwLock<Option<Weak<dyn JobProcessor>>>,
}

impl LocalJobQueue {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            max_concurrent,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            queued: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            pending_keys: Arc::new(Mutex::new(HashSet::new())),
            job_statuses: Arc::new(Mutex::new(HashMap::new())),
            finished: Arc::new(Mutex::new(VecDeque::new())),
            keep_finished: DEFAULT_FINISHED_STATUSES,
            processor: RwLock::new(None),
        }
    }

    /// How many finished statuses stay queryable.
    pub fn with_finished_statuses(mut self, keep: usize) -> Self {
        self.keep_finished = keep;
        self
    }

    /// Number of statuses currently held, pending and finished.
    pub async fn tracked_statuses(&self) -> usize {
        self.job_statuses.lock().await.len()
    }

    /// Attaches the processor. Held weakly since the processor usually owns the queue.
    pub fn set_processor(&self, processor: Weak<dyn JobProcessor>) {
        *self.processor.write().unwrap_or_else(PoisonError::into_inner) = Some(processor);
    }

    fn processor(&self) -> Option<Arc<dyn JobProcessor>> {
        self.processor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub async fn subscribe(&self, job_id: &str) -> Option<JobHandle> {
        self.job_statuses.lock().await.get(job_id).map(|tx| JobHandle {
            id: job_id.to_string(),
            status_receiver: tx.subscribe(),
        })
    }

    pub async fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.job_statuses
            .lock()
            .await
            .get(job_id)
            .map(|tx| tx.borrow().clone())
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self.queued.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
            capacity: self.max_concurrent,
        }
    }

    /// Resolves once no job is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.queued.load(Ordering::SeqCst) == 0 && self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl JobQueue for LocalJobQueue {
    async fn enqueue(&self, message: ExecutionMessage) -> ExportResult<()> {
        let dedup_key = match (&message.idempotency_key, message.dedup_policy) {
            (Some(key), DedupPolicy::DropDuplicate) if !key.is_empty() => Some(key.clone()),
            _ => None,
        };
        if let Some(key) = &dedup_key {
            if !self.pending_keys.lock().await.insert(key.clone()) {
                log::debug!(target: "export::queue", "dropping duplicate job {} (key {})", message.job_id, key);
                return Ok(());
            }
        }

        let (tx, _) = watch::channel(JobStatus::Queued);
        self.job_statuses.lock().await.insert(message.job_id.clone(), tx);
        self.queued.fetch_add(1, Ordering::SeqCst);

        let processor = self.processor();
        let semaphore = self.semaphore.clone();
        let queued = self.queued.clone();
        let active = self.active.clone();
        let idle = self.idle.clone();
        let pending_keys = self.pending_keys.clone();
        let statuses = self.job_statuses.clone();
        let finished = self.finished.clone();
        let keep_finished = self.keep_finished;

        tokio::spawn(async move {
            let job_id = message.job_id.clone();
            // The semaphore is never closed.
            let permit = semaphore.acquire_owned().await.ok();
            active.fetch_add(1, Ordering::SeqCst);
            queued.fetch_sub(1, Ordering::SeqCst);

            let set_status = |status: JobStatus| {
                let statuses = statuses.clone();
                let job_id = job_id.clone();
                async move {
                    if let Some(tx) = statuses.lock().await.get(&job_id) {
                        tx.send_replace(status);
                    }
                }
            };

            set_status(JobStatus::Running).await;
            let result = match processor {
                Some(processor) => processor.process(message).await,
                None => Err(ExportError::not_implemented("no job processor attached")),
            };
            let status = match result {
                Ok(()) => JobStatus::Completed,
                Err(err) => {
                    log::error!(target: "export::queue", "job {} failed: {}", job_id, err);
                    JobStatus::Failed(err.to_string())
                }
            };
            {
                let mut statuses = statuses.lock().await;
                if let Some(tx) = statuses.get(&job_id) {
                    tx.send_replace(status);
                }
                let mut finished = finished.lock().await;
                finished.push_back(job_id.clone());
                while finished.len() > keep_finished {
                    if let Some(evicted) = finished.pop_front() {
                        statuses.remove(&evicted);
                    }
                }
            }

            if let Some(key) = dedup_key {
                pending_keys.lock().await.remove(&key);
            }
            drop(permit);
            active.fetch_sub(1, Ordering::SeqCst);
            idle.notify_waiters();
        });
        Ok(())
    }
}

/// Queue that only records what it receives. The first `failures` calls fail.
#[derive(Debug, Default)]
pub struct RecordingJobQueue {
    messages: std::sync::Mutex<Vec<ExecutionMessage>>,
    failures: AtomicU32,
}

impl RecordingJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(failures: u32) -> Self {
        Self {
            messages: Default::default(),
            failures: AtomicU32::new(failures),
        }
    }

    pub fn messages(&self) -> Vec<ExecutionMessage> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl JobQueue for RecordingJobQueue {
    async fn enqueue(&self, message: ExecutionMessage) -> ExportResult<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ExportError::internal("queue unavailable"));
        }
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(())
    }
}
