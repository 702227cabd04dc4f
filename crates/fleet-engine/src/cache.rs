//! Effective-policy cache: the resolved snapshot per device and its
//! acknowledgement state.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_core::{DeviceId, FleetError, PolicyId, TenantId, Timestamp};
use fleet_policy::{EffectivePolicyRecord, EffectivePolicyWrite, ExpectedRevision, PolicySnapshot, PutOutcome};
use fleet_store::FleetStore;

#[derive(Clone)]
pub struct EffectivePolicyCache {
    store: Arc<dyn FleetStore>,
}

impl EffectivePolicyCache {
    pub fn new(store: Arc<dyn FleetStore>) -> Self {
        Self { store }
    }

    /// The cached record, or `NotFound`.
    pub async fn get(
        &self,
        tenant: &TenantId,
        device: DeviceId,
    ) -> Result<EffectivePolicyRecord, FleetError> {
        self.find(tenant, device)
            .await?
            .ok_or_else(|| FleetError::not_found("effective policy", device))
    }

    pub async fn find(
        &self,
        tenant: &TenantId,
        device: DeviceId,
    ) -> Result<Option<EffectivePolicyRecord>, FleetError> {
        self.store.get_effective(tenant, device).await
    }

    pub async fn exists(&self, tenant: &TenantId, device: DeviceId) -> Result<bool, FleetError> {
        Ok(self.find(tenant, device).await?.is_some())
    }

    /// Write `snapshot` for `device` if the stored revision still matches
    /// `expected`. Identical bytes are left untouched.
    pub async fn put(
        &self,
        tenant: &TenantId,
        device: DeviceId,
        snapshot: &PolicySnapshot,
        expected: ExpectedRevision,
    ) -> Result<(PutOutcome, EffectivePolicyRecord), FleetError> {
        let write = EffectivePolicyWrite::new(device, snapshot)?;
        let (outcome, record) = self
            .store
            .put_effective(tenant, write, expected, Timestamp::now())
            .await?;
        if outcome != PutOutcome::Unchanged {
            tracing::debug!(tenant = %tenant, device = %device, policy_id = %record.policy_id,
                revision = record.revision, outcome = ?outcome, "effective policy written");
        }
        Ok((outcome, record))
    }

    /// Record that the device confirmed receipt. Idempotent.
    pub async fn mark_applied(
        &self,
        tenant: &TenantId,
        device: DeviceId,
    ) -> Result<EffectivePolicyRecord, FleetError> {
        self.store.mark_applied(tenant, device, Timestamp::now()).await
    }

    pub async fn remove(
        &self,
        tenant: &TenantId,
        device: DeviceId,
        expected: ExpectedRevision,
    ) -> Result<bool, FleetError> {
        let removed = self.store.remove_effective(tenant, device, expected).await?;
        if removed {
            tracing::debug!(tenant = %tenant, device = %device, "effective policy removed");
        }
        Ok(removed)
    }

    pub async fn applied_policy_ids(
        &self,
        tenant: &TenantId,
    ) -> Result<BTreeMap<DeviceId, PolicyId>, FleetError> {
        self.store.applied_policy_ids(tenant).await
    }
}
