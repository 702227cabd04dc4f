//! User directory seam: role membership of a username, and the members
//! of a role.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use fleet_core::{FleetError, TenantId};

/// Source of role membership.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Roles held by `username` in `tenant`. An unknown user holds no roles.
    async fn roles_of(&self, tenant: &TenantId, username: &str)
        -> Result<Vec<String>, DirectoryError>;

    /// Usernames holding `role` in `tenant`, sorted.
    async fn users_in_role(&self, tenant: &TenantId, role: &str)
        -> Result<Vec<String>, DirectoryError>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("user directory unavailable: {0}")]
    Unavailable(String),
}

impl From<DirectoryError> for FleetError {
    fn from(err: DirectoryError) -> Self {
        FleetError::Dependency(err.to_string())
    }
}

/// In-process directory with roles set by the embedding application.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    roles: RwLock<BTreeMap<(TenantId, String), BTreeSet<String>>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the roles of a user.
    pub fn set_roles<I, R>(&self, tenant: &TenantId, username: &str, roles: I)
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        let roles: BTreeSet<String> = roles.into_iter().map(Into::into).collect();
        let key = (tenant.clone(), username.to_string());
        let mut guard = self.roles.write();
        if roles.is_empty() {
            guard.remove(&key);
        } else {
            guard.insert(key, roles);
        }
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn roles_of(
        &self,
        tenant: &TenantId,
        username: &str,
    ) -> Result<Vec<String>, DirectoryError> {
        Ok(self
            .roles
            .read()
            .get(&(tenant.clone(), username.to_string()))
            .map(|roles| roles.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn users_in_role(
        &self,
        tenant: &TenantId,
        role: &str,
    ) -> Result<Vec<String>, DirectoryError> {
        Ok(self
            .roles
            .read()
            .iter()
            .filter(|((t, _), roles)| t == tenant && roles.contains(role))
            .map(|((_, username), _)| username.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roles_are_tenant_scoped() {
        let dir = StaticDirectory::new();
        let acme = TenantId::new("acme").unwrap();
        let other = TenantId::new("other").unwrap();
        dir.set_roles(&acme, "alice", ["ops", "admins", "ops"]);

        assert_eq!(
            dir.roles_of(&acme, "alice").await.unwrap(),
            vec!["admins".to_string(), "ops".to_string()]
        );
        assert!(dir.roles_of(&other, "alice").await.unwrap().is_empty());
        assert!(dir.roles_of(&acme, "bob").await.unwrap().is_empty());

        dir.set_roles(&acme, "alice", Vec::<String>::new());
        assert!(dir.roles_of(&acme, "alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_role_members_are_sorted_and_tenant_scoped() {
        let dir = StaticDirectory::new();
        let acme = TenantId::new("acme").unwrap();
        let other = TenantId::new("other").unwrap();
        dir.set_roles(&acme, "carol", ["ops"]);
        dir.set_roles(&acme, "alice", ["ops", "admins"]);
        dir.set_roles(&acme, "bob", ["admins"]);
        dir.set_roles(&other, "dave", ["ops"]);

        assert_eq!(
            dir.users_in_role(&acme, "ops").await.unwrap(),
            vec!["alice".to_string(), "carol".to_string()]
        );
        assert!(dir.users_in_role(&acme, "nobody").await.unwrap().is_empty());
    }
}
