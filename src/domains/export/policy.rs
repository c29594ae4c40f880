//! Retention, quota and delete policies.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::auth::Actor;
use crate::domains::export::definition::ResolvedDefinition;
use crate::domains::export::types::{ExportRequest, Format};
use crate::errors::{ExportError, ExportResult};
use crate::utils::duration_serde;

/// Computes how long an async artifact is kept. Zero means no expiry.
pub trait RetentionPolicy: Send + Sync {
    fn ttl(&self, actor: &Actor, request: &ExportRequest, definition: &ResolvedDefinition) -> Duration;
}

/// Rule matched on any combination of definition, format and role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(with = "duration_serde")]
    pub ttl: Duration,
}

impl RetentionRule {
    /// `None` when the rule does not apply; otherwise its specificity.
    fn score(&self, actor: &Actor, definition: &str, format: Format) -> Option<u8> {
        let mut score = 0;
        if let Some(name) = &self.definition {
            if name != definition {
                return None;
            }
            score += 4;
        }
        if let Some(wanted) = self.format {
            if wanted != format {
                return None;
            }
            score += 2;
        }
        if let Some(role) = &self.role {
            if !actor.has_role(role) {
                return None;
            }
            score += 1;
        }
        (score > 0).then_some(score)
    }
}

/// Table driven retention.
///
/// Lookup order: best matching rule, then by definition, by format, by the
/// first actor role with a mapping, then the default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionRules {
    #[serde(default, with = "duration_serde")]
    pub default_ttl: Duration,
    #[serde(default)]
    pub rules: Vec<RetentionRule>,
    #[serde(default)]
    pub by_definition: BTreeMap<String, Duration>,
    #[serde(default)]
    pub by_format: BTreeMap<Format, Duration>,
    #[serde(default)]
    pub by_role: BTreeMap<String, Duration>,
}

impl RetentionRules {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            ..Default::default()
        }
    }

    pub fn with_rule(mut self, rule: RetentionRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn for_definition(mut self, definition: impl Into<String>, ttl: Duration) -> Self {
        self.by_definition.insert(definition.into(), ttl);
        self
    }

    pub fn for_format(mut self, format: Format, ttl: Duration) -> Self {
        self.by_format.insert(format, ttl);
        self
    }

    pub fn for_role(mut self, role: impl Into<String>, ttl: Duration) -> Self {
        self.by_role.insert(role.into(), ttl);
        self
    }
}

impl RetentionPolicy for RetentionRules {
    fn ttl(&self, actor: &Actor, request: &ExportRequest, definition: &ResolvedDefinition) -> Duration {
        let format = Format::parse(&request.format).unwrap_or(Format::Csv);

        let mut best: Option<(u8, Duration)> = None;
        for rule in &self.rules {
            if let Some(score) = rule.score(actor, &definition.name, format) {
                if best.map_or(true, |(top, _)| score > top) {
                    best = Some((score, rule.ttl));
                }
            }
        }
        if let Some((_, ttl)) = best {
            return ttl;
        }

        if let Some(ttl) = self.by_definition.get(&definition.name) {
            return *ttl;
        }
        if let Some(ttl) = self.by_format.get(&format) {
            return *ttl;
        }
        actor
            .roles
            .iter()
            .find_map(|role| self.by_role.get(role))
            .copied()
            .unwrap_or(self.default_ttl)
    }
}

/// Admission hook run before a source is opened.
#[async_trait]
pub trait QuotaHook: Send + Sync {
    async fn allow(&self, actor: &Actor, request: &ExportRequest, definition: &ResolvedDefinition) -> ExportResult<()>;
}

pub type RateKeyFn = Arc<dyn Fn(&Actor) -> String + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window limiter keyed per actor.
pub struct RateLimiter {
    max: u32,
    window: Duration,
    key: RateKeyFn,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    /// Keys on `actor id + tenant + workspace`.
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            key: Arc::new(|actor: &Actor| actor.rate_key()),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_key(mut self, key: impl Fn(&Actor) -> String + Send + Sync + 'static) -> Self {
        self.key = Arc::new(key);
        self
    }

    /// Keys with an open window.
    pub fn tracked(&self) -> usize {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Counts one hit for `actor`.
    pub fn check(&self, actor: &Actor) -> ExportResult<()> {
        if self.max == 0 || self.window.is_zero() {
            return Ok(());
        }
        let key = (self.key)(actor);
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let window = self.window;
        windows.retain(|_, w| now.duration_since(w.started) < window);
        let entry = windows.entry(key).or_insert(Window { started: now, count: 0 });
        if now.duration_since(entry.started) >= self.window {
            *entry = Window { started: now, count: 0 };
        }
        entry.count += 1;
        if entry.count > self.max {
            return Err(ExportError::validation("rate limit exceeded"));
        }
        Ok(())
    }
}

#[async_trait]
impl QuotaHook for RateLimiter {
    async fn allow(&self, actor: &Actor, _: &ExportRequest, _: &ResolvedDefinition) -> ExportResult<()> {
        self.check(actor)
    }
}

/// How `delete` treats the record once the artifact is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DeleteStrategy {
    /// Mark the record deleted.
    #[default]
    Soft,
    /// Mark it deleted and keep it until cleanup passes `ttl`.
    Tombstone {
        #[serde(with = "duration_serde")]
        ttl: Duration,
    },
}

impl DeleteStrategy {
    /// `soft`, `tombstone` (with `ttl`) or `hard` as an alias of soft.
    pub fn parse(raw: &str, ttl: Duration) -> ExportResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "soft" | "hard" => Ok(DeleteStrategy::Soft),
            "tombstone" => Ok(DeleteStrategy::Tombstone { ttl }),
            other => Err(ExportError::validation(format!("unknown delete strategy: {}", other))),
        }
    }
}
