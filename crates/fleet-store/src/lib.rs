//! # fleet-store — Transactional Persistence Seam
//!
//! [`FleetStore`] is the only way the engine reads or writes durable state.
//!
//! ## Contract
//!
//! - **One method, one transaction.** Every state-changing method commits
//!   all of its writes or none of them. A failure returns
//!   `FleetError::Persistence` (or the more specific error that aborted the
//!   transaction) and leaves no partial state behind.
//! - **Tenant isolation.** Every method takes a `TenantId`. The memory
//!   backend keeps one partition per tenant; every SQL statement filters
//!   by `tenant_id`. A record of one tenant is invisible to every other.
//! - **Ledger in the same transaction.** Policy writes record their change
//!   ledger entries inside the same transaction as the policy write.
//!
//! ## Backends
//!
//! - [`MemoryStore`] (`memory.rs`): per-tenant partitions, in-place writes
//!   with an undo log replayed on failure, fault injection for rollback
//!   tests.
//! - [`PgStore`] (`postgres/`): SQLx over PostgreSQL with embedded
//!   migrations.

pub mod memory;
pub mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;

use fleet_core::{
    DeviceId, DeviceIdentifier, DeviceType, EnrollmentId, FleetError, PolicyId, TenantId, Timestamp,
};
use fleet_policy::{
    Candidate, ClaimRequest, ClaimedEntry, CompleteOutcome, EffectivePolicyRecord,
    EffectivePolicyWrite, ExpectedRevision, LedgerEntry, LedgerKey, Policy, PolicyScope,
    PolicyScopes, PriorityChange, PutOutcome,
};
use fleet_state::{Device, DeviceFilter, EnrollmentInfo, EnrollmentStatus};

pub use memory::{FaultPoint, MemoryStore};
pub use postgres::{init_pool, PgStore};

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, FleetError>;

/// The scopes through which a device can be reached.
#[derive(Debug, Clone)]
pub struct CandidateQuery<'a> {
    pub device_id: DeviceId,
    pub device_type: &'a DeviceType,
    pub user: &'a str,
    pub roles: &'a [String],
}

/// Durable state of the engine.
#[async_trait]
pub trait FleetStore: Send + Sync + 'static {
    // ── Devices and enrollments ──────────────────────────────────────

    /// Insert a device and its first enrollment.
    ///
    /// Fails with `Conflict` if the identifier is already enrolled.
    async fn create_device(&self, tenant: &TenantId, device: &Device) -> StoreResult<()>;

    /// Update device attributes and its current enrollment row together.
    ///
    /// Fails with `Conflict` if the stored device has moved to another
    /// enrollment since `device` was read, or if its enrollment has become
    /// terminal while `device` still carries a live status.
    async fn save_device(&self, tenant: &TenantId, device: &Device) -> StoreResult<()>;

    /// Move a device to a new enrollment row: rewrite `previous`, insert
    /// `device.enrollment`, and update the device row.
    ///
    /// Fails with `Conflict` unless `previous` is still the device's current
    /// enrollment.
    async fn switch_enrollment(
        &self,
        tenant: &TenantId,
        device: &Device,
        previous: &EnrollmentInfo,
    ) -> StoreResult<()>;

    async fn get_device(
        &self,
        tenant: &TenantId,
        identifier: &DeviceIdentifier,
    ) -> StoreResult<Option<Device>>;

    async fn get_device_by_id(&self, tenant: &TenantId, id: DeviceId)
        -> StoreResult<Option<Device>>;

    /// Devices matching `filter`, ordered by device type then identifier.
    async fn list_devices(&self, tenant: &TenantId, filter: &DeviceFilter)
        -> StoreResult<Vec<Device>>;

    async fn count_devices(&self, tenant: &TenantId, filter: &DeviceFilter) -> StoreResult<u64>;

    /// Every enrollment row of a device, oldest first.
    async fn enrollment_history(
        &self,
        tenant: &TenantId,
        device: DeviceId,
    ) -> StoreResult<Vec<EnrollmentInfo>>;

    // ── Policies ─────────────────────────────────────────────────────

    /// Insert a policy. The store assigns `priority = max + 1` (1 for the
    /// tenant's first policy) and marks the ledger.
    async fn create_policy(&self, tenant: &TenantId, policy: Policy) -> StoreResult<Policy>;

    /// Rewrite name, profile, compliance and ownership filter. Priority and
    /// the active flag are unchanged. Marks the ledger for the old and new
    /// device type.
    async fn update_policy(&self, tenant: &TenantId, policy: Policy) -> StoreResult<Policy>;

    /// Reassign priorities in bulk. Fails with `Conflict` on a duplicate or
    /// a collision with an untouched policy.
    async fn update_priorities(
        &self,
        tenant: &TenantId,
        changes: &[PriorityChange],
        at: Timestamp,
    ) -> StoreResult<Vec<Policy>>;

    async fn set_policy_active(
        &self,
        tenant: &TenantId,
        id: PolicyId,
        active: bool,
        at: Timestamp,
    ) -> StoreResult<Policy>;

    /// Delete a policy and all its scope assignments.
    async fn delete_policy(&self, tenant: &TenantId, id: PolicyId, at: Timestamp)
        -> StoreResult<()>;

    async fn get_policy(&self, tenant: &TenantId, id: PolicyId) -> StoreResult<Option<Policy>>;

    /// All policies, ordered by priority.
    async fn list_policies(&self, tenant: &TenantId) -> StoreResult<Vec<Policy>>;

    /// Policies whose profile targets `device_type`, ordered by priority.
    async fn policies_of_type(
        &self,
        tenant: &TenantId,
        device_type: &DeviceType,
    ) -> StoreResult<Vec<Policy>>;

    /// Policies assigned through exactly `scope`, ordered by priority.
    async fn policies_with_scope(
        &self,
        tenant: &TenantId,
        scope: &PolicyScope,
    ) -> StoreResult<Vec<Policy>>;

    async fn count_policies(&self, tenant: &TenantId) -> StoreResult<u64>;

    /// Insert a batch of scope assignments. Assignments already present
    /// collapse. Returns the number newly inserted.
    async fn assign_scopes(
        &self,
        tenant: &TenantId,
        policy: PolicyId,
        scopes: &[PolicyScope],
        at: Timestamp,
    ) -> StoreResult<usize>;

    async fn policy_scopes(&self, tenant: &TenantId, policy: PolicyId)
        -> StoreResult<PolicyScopes>;

    /// Every (policy, scope) pair reaching a device. Unfiltered: activity,
    /// device type and ownership are checked by selection.
    async fn candidates(
        &self,
        tenant: &TenantId,
        query: &CandidateQuery<'_>,
    ) -> StoreResult<Vec<Candidate>>;

    // ── Effective policy cache ───────────────────────────────────────

    async fn get_effective(
        &self,
        tenant: &TenantId,
        device: DeviceId,
    ) -> StoreResult<Option<EffectivePolicyRecord>>;

    /// Insert or update the effective record of a device, checking
    /// `expected` first. A byte-identical snapshot is left untouched.
    async fn put_effective(
        &self,
        tenant: &TenantId,
        write: EffectivePolicyWrite,
        expected: ExpectedRevision,
        at: Timestamp,
    ) -> StoreResult<(PutOutcome, EffectivePolicyRecord)>;

    /// Set `applied`. Idempotent: the first applied time is kept.
    async fn mark_applied(
        &self,
        tenant: &TenantId,
        device: DeviceId,
        at: Timestamp,
    ) -> StoreResult<EffectivePolicyRecord>;

    /// Remove the effective record of a device. Returns whether one existed.
    async fn remove_effective(
        &self,
        tenant: &TenantId,
        device: DeviceId,
        expected: ExpectedRevision,
    ) -> StoreResult<bool>;

    /// Device → policy for every cached record.
    async fn applied_policy_ids(&self, tenant: &TenantId)
        -> StoreResult<BTreeMap<DeviceId, PolicyId>>;

    // ── Change ledger ────────────────────────────────────────────────

    /// Mark entries dirty. Existing entries collapse and bump their
    /// generation.
    async fn mark_dirty(&self, tenant: &TenantId, keys: &[LedgerKey], at: Timestamp)
        -> StoreResult<()>;

    /// Claim up to `request.limit` claimable entries under a lease.
    async fn claim_dirty(
        &self,
        tenant: &TenantId,
        request: &ClaimRequest,
    ) -> StoreResult<Vec<ClaimedEntry>>;

    /// Finish a claim: remove the entry if its generation is unchanged,
    /// otherwise release the lease and leave it dirty.
    async fn complete_claim(
        &self,
        tenant: &TenantId,
        claim: &ClaimedEntry,
    ) -> StoreResult<CompleteOutcome>;

    /// Return a claim unprocessed. Returns whether the lease was still held.
    async fn release_claim(&self, tenant: &TenantId, claim: &ClaimedEntry) -> StoreResult<bool>;

    async fn list_ledger(&self, tenant: &TenantId) -> StoreResult<Vec<LedgerEntry>>;

    /// Drop every ledger entry of the tenant. Returns how many were removed.
    async fn clear_ledger(&self, tenant: &TenantId) -> StoreResult<u64>;

    // ── Health ───────────────────────────────────────────────────────

    /// Check that the backend is reachable.
    async fn ping(&self) -> StoreResult<()>;
}

/// Reject a save built from a stale read of the device.
///
/// `current` and `status` describe the enrollment the stored device points
/// at, read inside the writing transaction.
pub(crate) fn check_save(
    current: EnrollmentId,
    status: EnrollmentStatus,
    device: &Device,
) -> StoreResult<()> {
    if current != device.enrollment.id {
        return Err(FleetError::conflict(format!(
            "device {} moved to enrollment {current} concurrently",
            device.identifier
        )));
    }
    if status.is_terminal() && !device.enrollment.status.is_terminal() {
        return Err(FleetError::conflict(format!(
            "device {} was disenrolled concurrently",
            device.identifier
        )));
    }
    Ok(())
}

/// Reject an enrollment switch whose `previous` row is no longer current.
pub(crate) fn check_switch(
    current: EnrollmentId,
    device: &Device,
    previous: &EnrollmentInfo,
) -> StoreResult<()> {
    if current != previous.id {
        return Err(FleetError::conflict(format!(
            "device {} moved to enrollment {current} concurrently",
            device.identifier
        )));
    }
    Ok(())
}

/// Ledger keys touched by a change to `policy`.
pub fn ledger_keys_for(policy: &Policy) -> Vec<LedgerKey> {
    vec![LedgerKey {
        policy_id: policy.id,
        device_type: policy.device_type().clone(),
    }]
}
