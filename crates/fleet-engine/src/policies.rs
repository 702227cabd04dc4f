//! # Policy Administration
//!
//! CRUD for policies and their scope assignments. Every write is a single
//! store transaction that also records the change-ledger entries for the
//! affected device type, so recomputation picks it up on the next pass.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use fleet_core::{
    DeviceId, DeviceIdentifier, DeviceType, FleetError, PolicyId, ProfileId, TenantId, Timestamp,
};
use fleet_policy::{Policy, PolicyDraft, PolicyScope, PolicyScopes, PriorityChange, Profile};
use fleet_store::{ledger_keys_for, FleetStore};

#[derive(Clone)]
pub struct PolicyAdministrator {
    store: Arc<dyn FleetStore>,
}

impl PolicyAdministrator {
    pub fn new(store: Arc<dyn FleetStore>) -> Self {
        Self { store }
    }

    /// Create a policy. The store assigns the next free priority.
    pub async fn create(&self, tenant: &TenantId, draft: &PolicyDraft) -> Result<Policy, FleetError> {
        let profile = draft.validate()?;
        let now = Timestamp::now();
        let policy = Policy {
            id: PolicyId::new(),
            tenant: tenant.clone(),
            name: draft.name.trim().to_string(),
            profile,
            priority: 0,
            compliance: draft.compliance,
            ownership_type: draft.ownership_type,
            active: draft.active,
            updated: false,
            created_at: now,
            updated_at: now,
        };
        let created = self.store.create_policy(tenant, policy).await?;
        tracing::info!(tenant = %tenant, policy_id = %created.id, priority = created.priority,
            device_type = %created.device_type(), "policy created");
        Ok(created)
    }

    /// Rewrite name, profile, compliance and ownership filter. Priority and
    /// the active flag are left alone.
    pub async fn update(
        &self,
        tenant: &TenantId,
        id: PolicyId,
        draft: &PolicyDraft,
    ) -> Result<Policy, FleetError> {
        let mut profile = draft.validate()?;
        let existing = self.require(tenant, id).await?;
        if draft.profile.as_ref().and_then(|p| p.id).is_none() {
            profile.id = existing.profile.id;
        }
        let candidate = Policy {
            name: draft.name.trim().to_string(),
            profile,
            compliance: draft.compliance,
            ownership_type: draft.ownership_type,
            updated_at: Timestamp::now(),
            ..existing
        };
        let updated = self.store.update_policy(tenant, candidate).await?;
        tracing::info!(tenant = %tenant, policy_id = %id, "policy updated");
        Ok(updated)
    }

    /// Delete a policy together with all of its scope assignments.
    pub async fn delete(&self, tenant: &TenantId, id: PolicyId) -> Result<(), FleetError> {
        self.store.delete_policy(tenant, id, Timestamp::now()).await?;
        tracing::info!(tenant = %tenant, policy_id = %id, "policy deleted");
        Ok(())
    }

    pub async fn activate(&self, tenant: &TenantId, id: PolicyId) -> Result<Policy, FleetError> {
        self.set_active(tenant, id, true).await
    }

    pub async fn deactivate(&self, tenant: &TenantId, id: PolicyId) -> Result<Policy, FleetError> {
        self.set_active(tenant, id, false).await
    }

    async fn set_active(
        &self,
        tenant: &TenantId,
        id: PolicyId,
        active: bool,
    ) -> Result<Policy, FleetError> {
        let policy = self
            .store
            .set_policy_active(tenant, id, active, Timestamp::now())
            .await?;
        tracing::info!(tenant = %tenant, policy_id = %id, active, "policy activation changed");
        Ok(policy)
    }

    /// Reassign priorities in one transaction.
    pub async fn update_priorities(
        &self,
        tenant: &TenantId,
        changes: &[PriorityChange],
    ) -> Result<Vec<Policy>, FleetError> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        let touched = self
            .store
            .update_priorities(tenant, changes, Timestamp::now())
            .await?;
        tracing::info!(tenant = %tenant, count = touched.len(), "policy priorities updated");
        Ok(touched)
    }

    /// Assign a batch of scopes. Returns how many were new.
    pub async fn assign(
        &self,
        tenant: &TenantId,
        id: PolicyId,
        scopes: &[PolicyScope],
    ) -> Result<usize, FleetError> {
        let inserted = self
            .store
            .assign_scopes(tenant, id, scopes, Timestamp::now())
            .await?;
        tracing::info!(tenant = %tenant, policy_id = %id, requested = scopes.len(), inserted,
            "policy scopes assigned");
        Ok(inserted)
    }

    /// Mark the policy's device type dirty without changing the policy.
    pub async fn record_change(&self, tenant: &TenantId, id: PolicyId) -> Result<(), FleetError> {
        let policy = self.require(tenant, id).await?;
        self.store
            .mark_dirty(tenant, &ledger_keys_for(&policy), Timestamp::now())
            .await
    }

    /// Drop every pending change of the tenant.
    pub async fn clear_changes(&self, tenant: &TenantId) -> Result<u64, FleetError> {
        let cleared = self.store.clear_ledger(tenant).await?;
        tracing::info!(tenant = %tenant, cleared, "policy changes cleared");
        Ok(cleared)
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub async fn get(&self, tenant: &TenantId, id: PolicyId) -> Result<Policy, FleetError> {
        self.require(tenant, id).await
    }

    pub async fn list(&self, tenant: &TenantId) -> Result<Vec<Policy>, FleetError> {
        self.store.list_policies(tenant).await
    }

    pub async fn count(&self, tenant: &TenantId) -> Result<u64, FleetError> {
        self.store.count_policies(tenant).await
    }

    pub async fn of_device_type(
        &self,
        tenant: &TenantId,
        device_type: &DeviceType,
    ) -> Result<Vec<Policy>, FleetError> {
        self.store.policies_of_type(tenant, device_type).await
    }

    pub async fn of_user(&self, tenant: &TenantId, username: &str) -> Result<Vec<Policy>, FleetError> {
        self.store
            .policies_with_scope(tenant, &PolicyScope::User(username.to_string()))
            .await
    }

    pub async fn of_role(&self, tenant: &TenantId, role: &str) -> Result<Vec<Policy>, FleetError> {
        self.store
            .policies_with_scope(tenant, &PolicyScope::Role(role.to_string()))
            .await
    }

    /// Policies assigned directly to a device.
    pub async fn of_device(
        &self,
        tenant: &TenantId,
        identifier: &DeviceIdentifier,
    ) -> Result<Vec<Policy>, FleetError> {
        let device = self
            .store
            .get_device(tenant, identifier)
            .await?
            .ok_or_else(|| FleetError::not_found("device", identifier))?;
        self.store
            .policies_with_scope(tenant, &PolicyScope::Device(device.id))
            .await
    }

    /// Profiles carried by the tenant's policies, each once, in the
    /// priority order of the first policy carrying it.
    pub async fn profiles(&self, tenant: &TenantId) -> Result<Vec<Profile>, FleetError> {
        let mut seen = BTreeSet::new();
        Ok(self
            .store
            .list_policies(tenant)
            .await?
            .into_iter()
            .filter(|p| seen.insert(p.profile.id))
            .map(|p| p.profile)
            .collect())
    }

    pub async fn profile(&self, tenant: &TenantId, id: ProfileId) -> Result<Profile, FleetError> {
        self.store
            .list_policies(tenant)
            .await?
            .into_iter()
            .map(|p| p.profile)
            .find(|profile| profile.id == id)
            .ok_or_else(|| FleetError::not_found("profile", id))
    }

    pub async fn scopes(&self, tenant: &TenantId, id: PolicyId) -> Result<PolicyScopes, FleetError> {
        self.store.policy_scopes(tenant, id).await
    }

    pub async fn assigned_devices(
        &self,
        tenant: &TenantId,
        id: PolicyId,
    ) -> Result<BTreeSet<DeviceId>, FleetError> {
        Ok(self.scopes(tenant, id).await?.devices)
    }

    pub async fn assigned_users(
        &self,
        tenant: &TenantId,
        id: PolicyId,
    ) -> Result<BTreeSet<String>, FleetError> {
        Ok(self.scopes(tenant, id).await?.users)
    }

    pub async fn assigned_roles(
        &self,
        tenant: &TenantId,
        id: PolicyId,
    ) -> Result<BTreeSet<String>, FleetError> {
        Ok(self.scopes(tenant, id).await?.roles)
    }

    /// Device → policy for every device with a cached effective policy.
    pub async fn applied_policy_ids(
        &self,
        tenant: &TenantId,
    ) -> Result<BTreeMap<DeviceId, PolicyId>, FleetError> {
        self.store.applied_policy_ids(tenant).await
    }

    async fn require(&self, tenant: &TenantId, id: PolicyId) -> Result<Policy, FleetError> {
        self.store
            .get_policy(tenant, id)
            .await?
            .ok_or_else(|| FleetError::not_found("policy", id))
    }
}
