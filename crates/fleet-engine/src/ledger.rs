//! Change-propagation ledger: which `(policy, device type)` pairs of a
//! tenant still need recomputation.

use std::sync::Arc;

use fleet_core::{FleetError, LeaseId, TenantId, Timestamp};
use fleet_policy::{ClaimRequest, ClaimedEntry, CompleteOutcome, LedgerEntry, LedgerKey};
use fleet_store::FleetStore;

use crate::config::EngineConfig;

#[derive(Clone)]
pub struct ChangePropagationLedger {
    store: Arc<dyn FleetStore>,
    worker_id: String,
    lease_ttl: std::time::Duration,
    claim_batch: usize,
}

impl ChangePropagationLedger {
    pub fn new(store: Arc<dyn FleetStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            worker_id: config.worker_id.clone(),
            lease_ttl: config.lease_ttl,
            claim_batch: config.claim_batch,
        }
    }

    /// Mark keys dirty. Marks of an already dirty key collapse.
    pub async fn mark_dirty(&self, tenant: &TenantId, keys: &[LedgerKey]) -> Result<(), FleetError> {
        if keys.is_empty() {
            return Ok(());
        }
        self.store.mark_dirty(tenant, keys, Timestamp::now()).await
    }

    /// Claim the next batch of dirty entries under a fresh lease.
    pub async fn drain_dirty(&self, tenant: &TenantId) -> Result<Vec<ClaimedEntry>, FleetError> {
        let now = Timestamp::now();
        let request = ClaimRequest {
            worker: self.worker_id.clone(),
            lease: LeaseId::new(),
            expires_at: now.plus(self.lease_ttl),
            now,
            limit: self.claim_batch,
        };
        let claimed = self.store.claim_dirty(tenant, &request).await?;
        if !claimed.is_empty() {
            tracing::debug!(tenant = %tenant, lease = %request.lease, count = claimed.len(),
                "ledger entries claimed");
        }
        Ok(claimed)
    }

    /// Clear a processed entry unless it was re-marked meanwhile.
    pub async fn complete(
        &self,
        tenant: &TenantId,
        claim: &ClaimedEntry,
    ) -> Result<CompleteOutcome, FleetError> {
        let outcome = self.store.complete_claim(tenant, claim).await?;
        if outcome == CompleteOutcome::LeaseLost {
            tracing::warn!(tenant = %tenant, policy_id = %claim.key.policy_id,
                device_type = %claim.key.device_type, "ledger lease lost before completion");
        }
        Ok(outcome)
    }

    /// Hand a claim back unprocessed.
    pub async fn release(&self, tenant: &TenantId, claim: &ClaimedEntry) -> Result<bool, FleetError> {
        self.store.release_claim(tenant, claim).await
    }

    pub async fn pending(&self, tenant: &TenantId) -> Result<Vec<LedgerEntry>, FleetError> {
        self.store.list_ledger(tenant).await
    }
}
