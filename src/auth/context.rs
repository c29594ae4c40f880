use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{ExportError, ExportResult};

/// Tenant + workspace pair attached to actors and to every export record
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default)]
    pub tenant: String,
    #[serde(default)]
    pub workspace: String,
}

impl Scope {
    pub fn new(tenant: impl Into<String>, workspace: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            workspace: workspace.into(),
        }
    }

    /// Whether a record owned by `other` is visible from this scope.
    /// Empty fields on this side do not restrict.
    pub fn permits(&self, other: &Scope) -> bool {
        (self.tenant.is_empty() || self.tenant == other.tenant)
            && (self.workspace.is_empty() || self.workspace == other.workspace)
    }
}

/// Represents the requesting party of an export
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Stable identifier of the requesting user or system
    #[serde(default)]
    pub id: String,

    /// Role names, used by guards and retention rules
    #[serde(default)]
    pub roles: Vec<String>,

    /// Tenant / workspace the actor operates in
    #[serde(default)]
    pub scope: Scope,

    /// Free-form attributes carried for guards
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Actor used by background work that has no requesting user
    pub fn system() -> Self {
        Self {
            id: "system".to_string(),
            roles: vec!["admin".to_string()],
            ..Default::default()
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_scope(mut self, tenant: impl Into<String>, workspace: impl Into<String>) -> Self {
        self.scope = Scope::new(tenant, workspace);
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }

    pub fn is_anonymous(&self) -> bool {
        self.id.is_empty()
    }

    /// Key used by per-actor rate limiting.
    pub fn rate_key(&self) -> String {
        format!("{}|{}|{}", self.id, self.scope.tenant, self.scope.workspace)
    }

    /// Owner or any of `roles` may access.
    pub fn authorize_owner_or_roles(&self, owner_id: &str, roles: &[String]) -> ExportResult<()> {
        if (!self.id.is_empty() && self.id == owner_id) || roles.iter().any(|r| self.has_role(r)) {
            Ok(())
        } else {
            Err(ExportError::authz(
                "You do not have permission to access this export",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_scope_fields_do_not_restrict() {
        let record = Scope::new("acme", "ops");
        assert!(Scope::default().permits(&record));
        assert!(Scope::new("acme", "").permits(&record));
        assert!(!Scope::new("acme", "sales").permits(&record));
        assert!(!Scope::new("other", "").permits(&record));
    }

    #[test]
    fn owner_or_role_authorization() {
        let owner = Actor::new("u1");
        assert!(owner.authorize_owner_or_roles("u1", &[]).is_ok());

        let admin = Actor::new("u2").with_roles(["Admin"]);
        assert!(admin.authorize_owner_or_roles("u1", &["admin".into()]).is_ok());

        let other = Actor::new("u3");
        let err = other.authorize_owner_or_roles("u1", &["admin".into()]).unwrap_err();
        assert_eq!(err.kind().code(), "authz");
    }

    #[test]
    fn rate_key_includes_scope() {
        let actor = Actor::new("u1").with_scope("t", "w");
        assert_eq!(actor.rate_key(), "u1|t|w");
    }
}
