use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::auth::context::Actor;
use crate::domains::export::context::ExportContext;
use crate::domains::export::definition::ResolvedDefinition;
use crate::domains::export::types::{ExportRecord, ExportRequest};
use crate::errors::{ExportError, ExportResult};

/// Authorization hooks consulted before any row source is opened and
/// before a record or artifact is handed out.
#[async_trait]
pub trait ExportGuard: Send + Sync {
    async fn authorize_export(
        &self,
        actor: &Actor,
        request: &ExportRequest,
        definition: &ResolvedDefinition,
    ) -> ExportResult<()>;

    async fn authorize_download(&self, actor: &Actor, record: &ExportRecord) -> ExportResult<()>;
}

/// Permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllGuard;

#[async_trait]
impl ExportGuard for AllowAllGuard {
    async fn authorize_export(&self, _: &Actor, _: &ExportRequest, _: &ResolvedDefinition) -> ExportResult<()> {
        Ok(())
    }

    async fn authorize_download(&self, _: &Actor, _: &ExportRecord) -> ExportResult<()> {
        Ok(())
    }
}

/// Role based guard.
///
/// Definitions listed in `required` need one of their roles to be exported.
/// Records are visible to their owner and to `admin_roles`.
#[derive(Debug, Clone, Default)]
pub struct RoleGuard {
    required: BTreeMap<String, Vec<String>>,
    admin_roles: Vec<String>,
}

impl RoleGuard {
    pub fn new() -> Self {
        Self {
            required: BTreeMap::new(),
            admin_roles: vec!["admin".to_string()],
        }
    }

    pub fn require<I, S>(mut self, definition: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required
            .insert(definition.into(), roles.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_admin_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.admin_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    fn is_admin(&self, actor: &Actor) -> bool {
        self.admin_roles.iter().any(|r| actor.has_role(r))
    }
}

#[async_trait]
impl ExportGuard for RoleGuard {
    async fn authorize_export(
        &self,
        actor: &Actor,
        _request: &ExportRequest,
        definition: &ResolvedDefinition,
    ) -> ExportResult<()> {
        if actor.is_anonymous() {
            return Err(ExportError::authz("authentication required"));
        }
        if self.is_admin(actor) {
            return Ok(());
        }
        match self.required.get(&definition.name) {
            Some(roles) if !roles.iter().any(|r| actor.has_role(r)) => Err(ExportError::authz(format!(
                "You do not have permission to export {}",
                definition.name
            ))),
            _ => Ok(()),
        }
    }

    async fn authorize_download(&self, actor: &Actor, record: &ExportRecord) -> ExportResult<()> {
        actor.authorize_owner_or_roles(&record.actor_id, &self.admin_roles)
    }
}

/// Supplies the acting identity for a run.
#[async_trait]
pub trait ActorProvider: Send + Sync {
    async fn actor(&self, ctx: &ExportContext) -> ExportResult<Actor>;
}

/// Reads the actor attached to the context.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextActorProvider;

#[async_trait]
impl ActorProvider for ContextActorProvider {
    async fn actor(&self, ctx: &ExportContext) -> ExportResult<Actor> {
        ctx.actor()
            .cloned()
            .ok_or_else(|| ExportError::authz("no actor in context"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::definition::ExportDefinition;
    use crate::domains::export::types::{Column, DeliveryMode, Format};
    use crate::errors::ErrorKind;
    use chrono::Utc;

    fn resolved(name: &str) -> ResolvedDefinition {
        ResolvedDefinition {
            definition: ExportDefinition::new(name, "static", vec![Column::string("id")]),
            variant: None,
        }
    }

    #[tokio::test]
    async fn role_guard_checks_definition_roles() {
        let guard = RoleGuard::new().require("payroll", ["finance"]);
        let request = ExportRequest::new("payroll", "csv");

        let clerk = Actor::new("u1").with_roles(["sales"]);
        let err = guard.authorize_export(&clerk, &request, &resolved("payroll")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authz);
        assert!(guard.authorize_export(&clerk, &request, &resolved("users")).await.is_ok());

        let finance = Actor::new("u2").with_roles(["Finance"]);
        assert!(guard.authorize_export(&finance, &request, &resolved("payroll")).await.is_ok());

        let anonymous = Actor::default();
        assert!(guard.authorize_export(&anonymous, &request, &resolved("users")).await.is_err());
    }

    #[tokio::test]
    async fn downloads_are_owner_or_admin() {
        let guard = RoleGuard::new();
        let record = ExportRecord::queued(
            "e1",
            "users",
            Format::Csv,
            DeliveryMode::Async,
            &Actor::new("owner"),
            Utc::now(),
        );
        assert!(guard.authorize_download(&Actor::new("owner"), &record).await.is_ok());
        assert!(guard
            .authorize_download(&Actor::new("x").with_roles(["admin"]), &record)
            .await
            .is_ok());
        assert!(guard.authorize_download(&Actor::new("x"), &record).await.is_err());
    }

    #[tokio::test]
    async fn context_provider_requires_actor() {
        let provider = ContextActorProvider;
        let err = provider.actor(&ExportContext::background()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authz);
        let ctx = ExportContext::background().with_actor(Actor::new("u1"));
        assert_eq!(provider.actor(&ctx).await.unwrap().id, "u1");
    }
}
