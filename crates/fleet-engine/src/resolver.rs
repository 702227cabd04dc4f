//! # Policy Resolver
//!
//! Computes the single effective policy of a device from every policy that
//! reaches it through a device, user, role or device-type assignment.
//!
//! Role membership comes from the user directory. When the directory is
//! unreachable the role scope is skipped and the resolution is flagged
//! `degraded`: on-demand callers still get an answer, but the
//! recomputation driver never caches it.

use std::sync::Arc;

use fleet_core::{FleetError, TenantId};
use fleet_policy::{select_effective, Policy, PolicySnapshot, ScopeKind, Subject};
use fleet_state::Device;
use fleet_store::{CandidateQuery, FleetStore};

use crate::directory::UserDirectory;

/// The winning policy and the scope it won through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub policy: Policy,
    pub scope: ScopeKind,
}

impl ResolvedPolicy {
    /// The frozen form written to the effective-policy cache.
    pub fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot::of(&self.policy, self.scope)
    }
}

/// Outcome of one resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// `None` when no active, matching policy reaches the device.
    pub resolved: Option<ResolvedPolicy>,
    /// Role scopes were skipped because the directory failed.
    pub degraded: bool,
}

#[derive(Clone)]
pub struct PolicyResolver {
    store: Arc<dyn FleetStore>,
    directory: Arc<dyn UserDirectory>,
}

impl PolicyResolver {
    pub fn new(store: Arc<dyn FleetStore>, directory: Arc<dyn UserDirectory>) -> Self {
        Self { store, directory }
    }

    /// Resolve the effective policy of `device`.
    ///
    /// Resolution does not look at enrollment status; callers decide
    /// whether a REMOVED device is worth resolving.
    pub async fn resolve(&self, tenant: &TenantId, device: &Device) -> Result<Resolution, FleetError> {
        let owner = device.owner();
        let (roles, degraded) = match self.directory.roles_of(tenant, owner).await {
            Ok(roles) => (roles, false),
            Err(e) => {
                tracing::warn!(tenant = %tenant, device = %device.identifier, owner, error = %e,
                    "role lookup failed, resolving without role scopes");
                (Vec::new(), true)
            }
        };

        let query = CandidateQuery {
            device_id: device.id,
            device_type: &device.identifier.device_type,
            user: owner,
            roles: &roles,
        };
        let candidates = self.store.candidates(tenant, &query).await?;
        let subject = Subject {
            device_type: &device.identifier.device_type,
            ownership: device.enrollment.ownership,
        };
        let resolved = select_effective(&subject, candidates).map(|winner| ResolvedPolicy {
            policy: winner.policy,
            scope: winner.scope,
        });
        tracing::debug!(
            tenant = %tenant,
            device = %device.identifier,
            policy_id = ?resolved.as_ref().map(|r| r.policy.id),
            degraded,
            "device resolved"
        );
        Ok(Resolution { resolved, degraded })
    }
}
