//! Scope assignments: which devices a policy targets.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use fleet_core::{DeviceId, DeviceType};

use crate::model::PolicyError;

/// The targeting rule that binds a policy to devices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum PolicyScope {
    /// One specific device.
    Device(DeviceId),
    /// Every device owned by a user.
    User(String),
    /// Every device owned by a member of a role.
    Role(String),
    /// Every device of a type.
    DeviceType(DeviceType),
}

impl PolicyScope {
    /// The kind of this scope.
    pub fn kind(&self) -> ScopeKind {
        match self {
            Self::Device(_) => ScopeKind::Device,
            Self::User(_) => ScopeKind::User,
            Self::Role(_) => ScopeKind::Role,
            Self::DeviceType(_) => ScopeKind::DeviceType,
        }
    }
}

/// Scope kind, ordered from most to least specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Device,
    User,
    Role,
    DeviceType,
}

impl ScopeKind {
    /// Specificity rank. Lower is more specific.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Device => 0,
            Self::User => 1,
            Self::Role => 2,
            Self::DeviceType => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::User => "user",
            Self::Role => "role",
            Self::DeviceType => "device_type",
        }
    }
}

impl std::fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All scope assignments of one policy, grouped by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyScopes {
    pub devices: BTreeSet<DeviceId>,
    pub users: BTreeSet<String>,
    pub roles: BTreeSet<String>,
    pub device_types: BTreeSet<DeviceType>,
}

impl PolicyScopes {
    /// Insert one scope. Returns false if it was already present.
    pub fn insert(&mut self, scope: PolicyScope) -> bool {
        match scope {
            PolicyScope::Device(id) => self.devices.insert(id),
            PolicyScope::User(user) => self.users.insert(user),
            PolicyScope::Role(role) => self.roles.insert(role),
            PolicyScope::DeviceType(t) => self.device_types.insert(t),
        }
    }

    pub fn contains(&self, scope: &PolicyScope) -> bool {
        match scope {
            PolicyScope::Device(id) => self.devices.contains(id),
            PolicyScope::User(user) => self.users.contains(user),
            PolicyScope::Role(role) => self.roles.contains(role),
            PolicyScope::DeviceType(t) => self.device_types.contains(t),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
            && self.users.is_empty()
            && self.roles.is_empty()
            && self.device_types.is_empty()
    }

    /// Total number of assignments.
    pub fn len(&self) -> usize {
        self.devices.len() + self.users.len() + self.roles.len() + self.device_types.len()
    }

    /// Flatten into individual scopes.
    pub fn iter(&self) -> impl Iterator<Item = PolicyScope> + '_ {
        self.devices
            .iter()
            .copied()
            .map(PolicyScope::Device)
            .chain(self.users.iter().cloned().map(PolicyScope::User))
            .chain(self.roles.iter().cloned().map(PolicyScope::Role))
            .chain(self.device_types.iter().cloned().map(PolicyScope::DeviceType))
    }
}

/// Validate a batch of scopes for a policy targeting `policy_type`, and
/// collapse duplicates within the batch.
///
/// A device-type scope must name the policy's own device type; user and
/// role names must not be blank.
pub fn normalize_batch(
    policy_type: &DeviceType,
    scopes: &[PolicyScope],
) -> Result<Vec<PolicyScope>, PolicyError> {
    if scopes.is_empty() {
        return Err(PolicyError::InvalidScope("scope batch is empty".to_string()));
    }
    let mut seen = BTreeSet::new();
    for scope in scopes {
        match scope {
            PolicyScope::User(name) | PolicyScope::Role(name) if name.trim().is_empty() => {
                return Err(PolicyError::InvalidScope(format!(
                    "{} name must not be empty",
                    scope.kind()
                )));
            }
            PolicyScope::DeviceType(t) if t != policy_type => {
                return Err(PolicyError::InvalidScope(format!(
                    "device type {t} does not match the policy's profile type {policy_type}"
                )));
            }
            _ => {}
        }
        seen.insert(scope.clone());
    }
    Ok(seen.into_iter().collect())
}
