//! Request-scoped cancellation, deadline and actor.

use std::sync::Arc;
use std::time::Duration;

use futures::future;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::Actor;
use crate::errors::ExportError;

/// Cancels the context returned alongside it and every context derived from that one.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Cloneable handle passed down every suspension point of an export.
#[derive(Debug, Clone, Default)]
pub struct ExportContext {
    token: Option<CancellationToken>,
    deadline: Option<Instant>,
    actor: Option<Arc<Actor>>,
}

impl ExportContext {
    /// Root context: never canceled, no deadline, no actor.
    pub fn background() -> Self {
        Self::default()
    }

    /// Child context that is canceled by the returned handle or by any ancestor.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let token = match &self.token {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let mut child = self.clone();
        child.token = Some(token.clone());
        (child, CancelHandle { token })
    }

    /// Child context bounded by `deadline`; an earlier deadline is kept.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut child = self.clone();
        child.deadline = Some(match self.deadline {
            Some(existing) if existing <= deadline => existing,
            _ => deadline,
        });
        child
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_actor(&self, actor: Actor) -> Self {
        let mut child = self.clone();
        child.actor = Some(Arc::new(actor));
        child
    }

    pub fn actor(&self) -> Option<&Actor> {
        self.actor.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether this context can ever report an error.
    pub fn is_bounded(&self) -> bool {
        self.token.is_some() || self.deadline.is_some()
    }

    /// `Some` once canceled or past the deadline. Cancellation wins.
    pub fn err(&self) -> Option<ExportError> {
        if self.token.as_ref().map_or(false, CancellationToken::is_cancelled) {
            return Some(ExportError::canceled());
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ExportError::deadline_exceeded()),
            _ => None,
        }
    }

    /// Resolves with the context error once it is canceled or the deadline passes.
    /// Pending forever for an unbounded context.
    pub async fn done(&self) -> ExportError {
        let canceled = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => future::pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = canceled => ExportError::canceled(),
            _ = expired => ExportError::deadline_exceeded(),
        }
    }
}
