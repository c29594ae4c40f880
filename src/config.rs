//! Engine settings read from `EXPORT_*` environment variables.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::domains::export::definition::{DeliveryPolicy, DeliveryThresholds};
use crate::domains::export::idempotency::{MemoryIdempotencyStore, DEFAULT_IDEMPOTENCY_TTL};
use crate::domains::export::policy::{DeleteStrategy, QuotaHook, RateLimiter, RetentionRules};
use crate::domains::export::queue_manager::LocalJobQueue;
use crate::domains::export::registry::RendererRegistry;
use crate::domains::export::runner::{Runner, RunnerConfig};
use crate::domains::export::scheduler::{AsyncScheduler, JobQueue};
use crate::domains::export::service::ExportService;
use crate::domains::export::store::{ArtifactStore, LocalArtifactStore, MemoryArtifactStore};
use crate::domains::export::types::DeliveryMode;
use crate::domains::export::writers::template_writer::DEFAULT_MAX_HTML_BYTES;
use crate::errors::{ExportError, ExportResult};
use crate::utils::parse_duration;

pub const DEFAULT_RETENTION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_ENQUEUE_RETRIES: u32 = 3;
pub const DEFAULT_QUEUE_CONCURRENCY: usize = 4;
const ENQUEUE_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Base delivery policy merged under each definition's own
    pub delivery: DeliveryPolicy,
    pub idempotency_ttl: Duration,
    pub delete_strategy: DeleteStrategy,
    /// Zero keeps artifacts forever.
    pub retention_ttl: Duration,
    /// Zero disables rate limiting.
    pub rate_limit_max: u32,
    pub rate_limit_window: Duration,
    /// Local directory for artifacts; memory when unset.
    pub artifact_root: Option<PathBuf>,
    pub max_html_bytes: u64,
    pub enqueue_retries: u32,
    pub queue_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delivery: DeliveryPolicy::default(),
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            delete_strategy: DeleteStrategy::Soft,
            retention_ttl: DEFAULT_RETENTION_TTL,
            rate_limit_max: 0,
            rate_limit_window: DEFAULT_RATE_LIMIT_WINDOW,
            artifact_root: None,
            max_html_bytes: DEFAULT_MAX_HTML_BYTES,
            enqueue_retries: DEFAULT_ENQUEUE_RETRIES,
            queue_concurrency: DEFAULT_QUEUE_CONCURRENCY,
        }
    }
}

impl EngineConfig {
    /// Loads `.env` when present, then reads the process environment.
    pub fn from_env() -> ExportResult<Self> {
        if let Err(err) = dotenv::dotenv() {
            log::debug!(target: "export::config", "no .env loaded: {}", err);
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable source. Unset or blank variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> ExportResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(raw) = get("EXPORT_ASYNC_MAX_ROWS") {
            config.delivery.thresholds.max_rows = parse_number("EXPORT_ASYNC_MAX_ROWS", &raw)?;
        }
        if let Some(raw) = get("EXPORT_ASYNC_MAX_BYTES") {
            config.delivery.thresholds.max_bytes = parse_number("EXPORT_ASYNC_MAX_BYTES", &raw)?;
        }
        if let Some(raw) = get("EXPORT_ASYNC_MAX_DURATION") {
            config.delivery.thresholds.max_duration = parse_duration_var("EXPORT_ASYNC_MAX_DURATION", &raw)?;
        }
        if let Some(raw) = get("EXPORT_DEFAULT_DELIVERY") {
            config.delivery.default = Some(parse_delivery(&raw)?);
        }
        if let Some(raw) = get("EXPORT_IDEMPOTENCY_TTL") {
            config.idempotency_ttl = parse_duration_var("EXPORT_IDEMPOTENCY_TTL", &raw)?;
        }
        if let Some(raw) = get("EXPORT_RETENTION_TTL") {
            config.retention_ttl = parse_duration_var("EXPORT_RETENTION_TTL", &raw)?;
        }

        let tombstone_ttl = match get("EXPORT_TOMBSTONE_TTL") {
            Some(raw) => parse_duration_var("EXPORT_TOMBSTONE_TTL", &raw)?,
            None => DEFAULT_TOMBSTONE_TTL,
        };
        if let Some(raw) = get("EXPORT_DELETE_STRATEGY") {
            config.delete_strategy = DeleteStrategy::parse(&raw, tombstone_ttl)
                .map_err(|err| ExportError::validation(format!("EXPORT_DELETE_STRATEGY: {}", err.message())))?;
        }

        if let Some(raw) = get("EXPORT_RATE_LIMIT_MAX") {
            config.rate_limit_max = parse_number("EXPORT_RATE_LIMIT_MAX", &raw)?;
        }
        if let Some(raw) = get("EXPORT_RATE_LIMIT_WINDOW") {
            config.rate_limit_window = parse_duration_var("EXPORT_RATE_LIMIT_WINDOW", &raw)?;
        }
        config.artifact_root = get("EXPORT_ARTIFACT_ROOT").map(PathBuf::from);
        if let Some(raw) = get("EXPORT_MAX_HTML_BYTES") {
            config.max_html_bytes = parse_number("EXPORT_MAX_HTML_BYTES", &raw)?;
        }
        if let Some(raw) = get("EXPORT_ENQUEUE_RETRIES") {
            config.enqueue_retries = parse_number("EXPORT_ENQUEUE_RETRIES", &raw)?;
        }
        if let Some(raw) = get("EXPORT_QUEUE_CONCURRENCY") {
            let concurrency: usize = parse_number("EXPORT_QUEUE_CONCURRENCY", &raw)?;
            if concurrency == 0 {
                return Err(ExportError::validation("EXPORT_QUEUE_CONCURRENCY must be at least 1"));
            }
            config.queue_concurrency = concurrency;
        }

        log::debug!(target: "export::config", "loaded engine config: {:?}", config);
        Ok(config)
    }

    pub fn delivery_thresholds(&self) -> &DeliveryThresholds {
        &self.delivery.thresholds
    }

    /// Applies delivery thresholds, the HTML cap, retention and rate limiting.
    pub fn configure_runner(&self, runner: Runner) -> Runner {
        let mut runner = runner
            .with_renderers(Arc::new(RendererRegistry::with_html_limit(self.max_html_bytes)))
            .with_config(RunnerConfig {
                delivery: self.delivery.clone(),
                ..RunnerConfig::default()
            });
        if !self.retention_ttl.is_zero() {
            runner = runner.with_retention(Arc::new(RetentionRules::new(self.retention_ttl)));
        }
        if self.rate_limit_max > 0 {
            let limiter: Arc<dyn QuotaHook> = Arc::new(RateLimiter::new(self.rate_limit_max, self.rate_limit_window));
            runner = runner.with_quota(Some(limiter));
        }
        runner
    }

    pub fn artifact_store(&self) -> Arc<dyn ArtifactStore> {
        match &self.artifact_root {
            Some(root) => Arc::new(LocalArtifactStore::new(root.clone())),
            None => Arc::new(MemoryArtifactStore::new()),
        }
    }

    pub fn local_queue(&self) -> Arc<LocalJobQueue> {
        Arc::new(LocalJobQueue::new(self.queue_concurrency))
    }

    /// Scheduler with an in-memory signature store holding keys for `idempotency_ttl`.
    pub fn scheduler(&self, queue: Arc<dyn JobQueue>) -> AsyncScheduler {
        AsyncScheduler::new(queue)
            .with_signature_store(Arc::new(MemoryIdempotencyStore::new()), self.idempotency_ttl)
            .with_retries(self.enqueue_retries, ENQUEUE_RETRY_DELAY)
    }

    /// Wraps a configured runner into a service with a store, scheduler and delete strategy.
    pub fn service(&self, runner: Runner, queue: Arc<dyn JobQueue>) -> ExportService {
        ExportService::new(self.configure_runner(runner))
            .with_store(self.artifact_store())
            .with_scheduler(Arc::new(self.scheduler(queue)))
            .with_delete_strategy(self.delete_strategy)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> ExportResult<T> {
    raw.parse()
        .map_err(|_| ExportError::validation(format!("{}: invalid number \"{}\"", name, raw)))
}

fn parse_duration_var(name: &str, raw: &str) -> ExportResult<Duration> {
    parse_duration(raw).map_err(|err| ExportError::validation(format!("{}: {}", name, err.message())))
}

fn parse_delivery(raw: &str) -> ExportResult<DeliveryMode> {
    match raw.to_ascii_lowercase().as_str() {
        "sync" => Ok(DeliveryMode::Sync),
        "async" => Ok(DeliveryMode::Async),
        "auto" => Ok(DeliveryMode::Auto),
        other => Err(ExportError::validation(format!(
            "EXPORT_DEFAULT_DELIVERY: unknown delivery mode \"{}\"",
            other
        ))),
    }
}
