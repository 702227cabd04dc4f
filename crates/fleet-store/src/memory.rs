//! # In-Memory Backend
//!
//! One partition per tenant, held in a `DashMap` of
//! `Arc<parking_lot::RwLock<TenantTables>>`. A write method locks its
//! tenant's partition and writes rows in place through a [`Transaction`],
//! which records the prior value of every row it touches. Committing
//! discards that undo log; any other exit (an error, or a panic unwinding
//! through the method) replays it backwards, so a failed method leaves the
//! partition exactly as it was. The cost of a transaction is proportional
//! to the rows it writes, not to the size of the tenant.
//!
//! Locks are synchronous and never held across `.await`: every trait method
//! runs to completion under the lock without yielding.
//!
//! [`FaultPoint`] makes the next write method fail after a given number of
//! row writes. Tests use it to prove that a multi-row write (device plus
//! enrollment, policy delete cascade, priority reorder) rolls back in full.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use fleet_core::{
    DeviceId, DeviceIdentifier, DeviceType, EnrollmentId, FleetError, PolicyId, TenantId, Timestamp,
};
use fleet_policy::{
    check_reorder, next_priority, normalize_batch, Candidate, ClaimRequest, ClaimedEntry,
    CompleteOutcome, EffectivePolicyRecord, EffectivePolicyWrite, ExpectedRevision, Lease,
    LedgerEntry, LedgerKey, Policy, PolicyScope, PolicyScopes, PriorityChange, PutOutcome,
    ScopeKind,
};
use fleet_state::{Device, DeviceFilter, EnrollmentInfo};

use crate::{check_save, check_switch, ledger_keys_for, CandidateQuery, FleetStore, StoreResult};

/// An injected failure for the next write method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    /// Fail when the transaction attempts its `n`-th row write (0-based),
    /// after `n` writes have already been applied.
    AfterWrites(usize),
}

#[derive(Debug, Clone)]
struct EnrollmentRow {
    device: DeviceId,
    seq: u64,
    info: EnrollmentInfo,
}

#[derive(Debug, Default)]
struct TenantTables {
    devices: BTreeMap<DeviceId, Device>,
    identifiers: BTreeMap<DeviceIdentifier, DeviceId>,
    enrollments: BTreeMap<EnrollmentId, EnrollmentRow>,
    policies: BTreeMap<PolicyId, Policy>,
    scopes: BTreeMap<PolicyId, PolicyScopes>,
    effective: BTreeMap<DeviceId, EffectivePolicyRecord>,
    ledger: BTreeMap<LedgerKey, LedgerEntry>,
    seq: u64,
}

impl TenantTables {
    fn policy(&self, id: PolicyId) -> StoreResult<&Policy> {
        self.policies
            .get(&id)
            .ok_or_else(|| FleetError::not_found("policy", id))
    }

    fn sorted_policies<'a>(&self, policies: impl Iterator<Item = &'a Policy>) -> Vec<Policy> {
        let mut out: Vec<Policy> = policies.cloned().collect();
        out.sort_by_key(|p| (p.priority, p.id));
        out
    }

    /// The enrollment the stored device currently points at.
    fn current_enrollment(&self, device: &Device) -> StoreResult<&EnrollmentInfo> {
        let stored = self
            .devices
            .get(&device.id)
            .ok_or_else(|| FleetError::not_found("device", &device.identifier))?;
        if stored.identifier != device.identifier {
            return Err(FleetError::validation("device identifier cannot change"));
        }
        Ok(&stored.enrollment)
    }
}

/// Prior value of one row, restored on rollback.
enum Undo {
    Device(DeviceId, Option<Device>),
    Identifier(DeviceIdentifier, Option<DeviceId>),
    Enrollment(EnrollmentId, Option<EnrollmentRow>),
    Policy(PolicyId, Option<Policy>),
    Scopes(PolicyId, Option<PolicyScopes>),
    Effective(DeviceId, Option<EffectivePolicyRecord>),
    Ledger(LedgerKey, Option<LedgerEntry>),
    Seq(u64),
}

fn restore<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, prior: Option<V>) {
    match prior {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}

impl Undo {
    fn revert(self, tables: &mut TenantTables) {
        match self {
            Undo::Device(key, prior) => restore(&mut tables.devices, key, prior),
            Undo::Identifier(key, prior) => restore(&mut tables.identifiers, key, prior),
            Undo::Enrollment(key, prior) => restore(&mut tables.enrollments, key, prior),
            Undo::Policy(key, prior) => restore(&mut tables.policies, key, prior),
            Undo::Scopes(key, prior) => restore(&mut tables.scopes, key, prior),
            Undo::Effective(key, prior) => restore(&mut tables.effective, key, prior),
            Undo::Ledger(key, prior) => restore(&mut tables.ledger, key, prior),
            Undo::Seq(seq) => tables.seq = seq,
        }
    }
}

/// One write method's view of a locked partition.
///
/// Rows are written only through the `put_*`/`remove_*` helpers so that
/// every change lands in the undo log.
struct Transaction<'a> {
    tables: &'a mut TenantTables,
    undo: Vec<Undo>,
    tenant: TenantId,
    writes: usize,
    fail_at: Option<usize>,
}

impl Transaction<'_> {
    /// Account for one row write, failing if a fault is armed here.
    fn write(&mut self, table: &str) -> StoreResult<()> {
        if self.fail_at == Some(self.writes) {
            return Err(FleetError::persistence(format!(
                "injected fault writing {table} (write #{})",
                self.writes
            )));
        }
        self.writes += 1;
        Ok(())
    }

    fn commit(mut self) {
        self.undo.clear();
    }

    fn next_seq(&mut self) -> u64 {
        self.undo.push(Undo::Seq(self.tables.seq));
        self.tables.seq += 1;
        self.tables.seq
    }

    fn put_device(&mut self, device: Device) {
        let id = device.id;
        let prior = self.tables.devices.insert(id, device);
        self.undo.push(Undo::Device(id, prior));
    }

    fn put_identifier(&mut self, identifier: DeviceIdentifier, device: DeviceId) {
        let prior = self.tables.identifiers.insert(identifier.clone(), device);
        self.undo.push(Undo::Identifier(identifier, prior));
    }

    fn put_enrollment(&mut self, row: EnrollmentRow) {
        let id = row.info.id;
        let prior = self.tables.enrollments.insert(id, row);
        self.undo.push(Undo::Enrollment(id, prior));
    }

    fn put_policy(&mut self, policy: Policy) {
        let id = policy.id;
        let prior = self.tables.policies.insert(id, policy);
        self.undo.push(Undo::Policy(id, prior));
    }

    fn remove_policy(&mut self, id: PolicyId) {
        let prior = self.tables.policies.remove(&id);
        self.undo.push(Undo::Policy(id, prior));
    }

    fn put_scopes(&mut self, id: PolicyId, scopes: PolicyScopes) {
        let prior = self.tables.scopes.insert(id, scopes);
        self.undo.push(Undo::Scopes(id, prior));
    }

    fn remove_scopes(&mut self, id: PolicyId) {
        let prior = self.tables.scopes.remove(&id);
        self.undo.push(Undo::Scopes(id, prior));
    }

    fn put_effective(&mut self, record: EffectivePolicyRecord) {
        let device = record.device_id;
        let prior = self.tables.effective.insert(device, record);
        self.undo.push(Undo::Effective(device, prior));
    }

    fn remove_effective(&mut self, device: DeviceId) {
        let prior = self.tables.effective.remove(&device);
        self.undo.push(Undo::Effective(device, prior));
    }

    fn put_ledger(&mut self, entry: LedgerEntry) {
        let key = entry.key.clone();
        let prior = self.tables.ledger.insert(key.clone(), entry);
        self.undo.push(Undo::Ledger(key, prior));
    }

    fn remove_ledger(&mut self, key: &LedgerKey) {
        let prior = self.tables.ledger.remove(key);
        self.undo.push(Undo::Ledger(key.clone(), prior));
    }

    /// Clear the lease of a ledger entry, if it still exists.
    fn release_lease(&mut self, key: &LedgerKey) {
        if let Some(mut entry) = self.tables.ledger.get(key).cloned() {
            entry.lease = None;
            self.put_ledger(entry);
        }
    }

    fn mark(&mut self, keys: &[LedgerKey], at: Timestamp) -> StoreResult<()> {
        for key in keys {
            self.write("ledger")?;
            let entry = match self.tables.ledger.get(key).cloned() {
                Some(mut entry) => {
                    entry.remark(at);
                    entry
                }
                None => LedgerEntry::new(self.tenant.clone(), key.clone(), at),
            };
            self.put_ledger(entry);
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        while let Some(undo) = self.undo.pop() {
            undo.revert(self.tables);
        }
    }
}

/// In-memory [`FleetStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    tenants: DashMap<TenantId, Arc<RwLock<TenantTables>>>,
    fault: Mutex<Option<FaultPoint>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot fault for the next write method.
    pub fn inject_fault(&self, fault: FaultPoint) {
        *self.fault.lock() = Some(fault);
    }

    fn partition(&self, tenant: &TenantId) -> Arc<RwLock<TenantTables>> {
        Arc::clone(self.tenants.entry(tenant.clone()).or_default().value())
    }

    fn read<R>(&self, tenant: &TenantId, f: impl FnOnce(&TenantTables) -> R) -> R {
        let partition = self.partition(tenant);
        let guard = partition.read();
        f(&guard)
    }

    fn transact<R>(
        &self,
        tenant: &TenantId,
        f: impl FnOnce(&mut Transaction<'_>) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let partition = self.partition(tenant);
        let mut guard = partition.write();
        let fail_at = self.fault.lock().take().map(|FaultPoint::AfterWrites(n)| n);
        let mut tx = Transaction {
            tables: &mut *guard,
            undo: Vec::new(),
            tenant: tenant.clone(),
            writes: 0,
            fail_at,
        };
        match f(&mut tx) {
            Ok(result) => {
                tx.commit();
                Ok(result)
            }
            Err(err) => {
                let undone = tx.undo.len();
                drop(tx);
                tracing::debug!(tenant = %tenant, error = %err, undone,
                    "memory transaction rolled back");
                Err(err)
            }
        }
    }
}

#[async_trait]
impl FleetStore for MemoryStore {
    // ── Devices and enrollments ──────────────────────────────────────

    async fn create_device(&self, tenant: &TenantId, device: &Device) -> StoreResult<()> {
        self.transact(tenant, |tx| {
            if tx.tables.identifiers.contains_key(&device.identifier) {
                return Err(FleetError::conflict(format!(
                    "device {} is already enrolled",
                    device.identifier
                )));
            }
            tx.write("devices")?;
            tx.put_device(device.clone());
            tx.put_identifier(device.identifier.clone(), device.id);
            tx.write("enrollments")?;
            let seq = tx.next_seq();
            tx.put_enrollment(EnrollmentRow {
                device: device.id,
                seq,
                info: device.enrollment.clone(),
            });
            Ok(())
        })
    }

    async fn save_device(&self, tenant: &TenantId, device: &Device) -> StoreResult<()> {
        self.transact(tenant, |tx| {
            let current = tx.tables.current_enrollment(device)?;
            check_save(current.id, current.status, device)?;
            let row = match tx.tables.enrollments.get(&device.enrollment.id) {
                Some(row) if row.device == device.id => EnrollmentRow {
                    info: device.enrollment.clone(),
                    ..row.clone()
                },
                _ => {
                    return Err(FleetError::persistence(format!(
                        "current enrollment row of {} is missing",
                        device.identifier
                    )))
                }
            };
            tx.write("devices")?;
            tx.put_device(device.clone());
            tx.write("enrollments")?;
            tx.put_enrollment(row);
            Ok(())
        })
    }

    async fn switch_enrollment(
        &self,
        tenant: &TenantId,
        device: &Device,
        previous: &EnrollmentInfo,
    ) -> StoreResult<()> {
        self.transact(tenant, |tx| {
            let current = tx.tables.current_enrollment(device)?;
            check_switch(current.id, device, previous)?;
            let previous_row = match tx.tables.enrollments.get(&previous.id) {
                Some(row) if row.device == device.id => EnrollmentRow {
                    info: previous.clone(),
                    ..row.clone()
                },
                _ => return Err(FleetError::not_found("enrollment", previous.id)),
            };
            tx.write("enrollments")?;
            tx.put_enrollment(previous_row);
            tx.write("enrollments")?;
            if tx.tables.enrollments.contains_key(&device.enrollment.id) {
                return Err(FleetError::conflict(format!(
                    "enrollment {} already exists",
                    device.enrollment.id
                )));
            }
            let seq = tx.next_seq();
            tx.put_enrollment(EnrollmentRow {
                device: device.id,
                seq,
                info: device.enrollment.clone(),
            });
            tx.write("devices")?;
            tx.put_device(device.clone());
            Ok(())
        })
    }

    async fn get_device(
        &self,
        tenant: &TenantId,
        identifier: &DeviceIdentifier,
    ) -> StoreResult<Option<Device>> {
        Ok(self.read(tenant, |t| {
            t.identifiers
                .get(identifier)
                .and_then(|id| t.devices.get(id))
                .cloned()
        }))
    }

    async fn get_device_by_id(
        &self,
        tenant: &TenantId,
        id: DeviceId,
    ) -> StoreResult<Option<Device>> {
        Ok(self.read(tenant, |t| t.devices.get(&id).cloned()))
    }

    async fn list_devices(
        &self,
        tenant: &TenantId,
        filter: &DeviceFilter,
    ) -> StoreResult<Vec<Device>> {
        let mut devices: Vec<Device> = self.read(tenant, |t| {
            t.devices
                .values()
                .filter(|d| filter.matches(d))
                .cloned()
                .collect()
        });
        devices.sort_by(|a, b| {
            (&a.identifier.device_type, &a.identifier.id)
                .cmp(&(&b.identifier.device_type, &b.identifier.id))
        });
        Ok(devices)
    }

    async fn count_devices(&self, tenant: &TenantId, filter: &DeviceFilter) -> StoreResult<u64> {
        Ok(self.read(tenant, |t| {
            t.devices.values().filter(|d| filter.matches(d)).count() as u64
        }))
    }

    async fn enrollment_history(
        &self,
        tenant: &TenantId,
        device: DeviceId,
    ) -> StoreResult<Vec<EnrollmentInfo>> {
        Ok(self.read(tenant, |t| {
            let mut rows: Vec<&EnrollmentRow> = t
                .enrollments
                .values()
                .filter(|row| row.device == device)
                .collect();
            rows.sort_by_key(|row| row.seq);
            rows.into_iter().map(|row| row.info.clone()).collect()
        }))
    }

    // ── Policies ─────────────────────────────────────────────────────

    async fn create_policy(&self, tenant: &TenantId, mut policy: Policy) -> StoreResult<Policy> {
        self.transact(tenant, |tx| {
            if tx.tables.policies.contains_key(&policy.id) {
                return Err(FleetError::conflict(format!("{} already exists", policy.id)));
            }
            policy.tenant = tenant.clone();
            policy.priority = next_priority(tx.tables.policies.values().map(|p| p.priority));
            policy.updated = false;
            tx.write("policies")?;
            tx.put_policy(policy.clone());
            tx.put_scopes(policy.id, PolicyScopes::default());
            tx.mark(&ledger_keys_for(&policy), policy.created_at)?;
            Ok(policy)
        })
    }

    async fn update_policy(&self, tenant: &TenantId, policy: Policy) -> StoreResult<Policy> {
        self.transact(tenant, |tx| {
            let stored = tx.tables.policy(policy.id)?.clone();
            let updated = Policy {
                id: stored.id,
                tenant: stored.tenant.clone(),
                name: policy.name,
                profile: policy.profile,
                priority: stored.priority,
                compliance: policy.compliance,
                ownership_type: policy.ownership_type,
                active: stored.active,
                updated: true,
                created_at: stored.created_at,
                updated_at: policy.updated_at,
            };
            tx.write("policies")?;
            tx.put_policy(updated.clone());
            let mut keys = ledger_keys_for(&stored);
            for key in ledger_keys_for(&updated) {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
            tx.mark(&keys, updated.updated_at)?;
            Ok(updated)
        })
    }

    async fn update_priorities(
        &self,
        tenant: &TenantId,
        changes: &[PriorityChange],
        at: Timestamp,
    ) -> StoreResult<Vec<Policy>> {
        self.transact(tenant, |tx| {
            for change in changes {
                tx.tables.policy(change.policy_id)?;
            }
            let current: BTreeMap<PolicyId, u32> = tx
                .tables
                .policies
                .values()
                .map(|p| (p.id, p.priority))
                .collect();
            check_reorder(changes, &current)?;
            let mut touched = Vec::with_capacity(changes.len());
            for change in changes {
                tx.write("policies")?;
                let mut policy = tx.tables.policy(change.policy_id)?.clone();
                policy.priority = change.priority;
                policy.updated = true;
                policy.updated_at = at;
                tx.put_policy(policy.clone());
                touched.push(policy);
            }
            let keys: Vec<LedgerKey> = touched.iter().flat_map(ledger_keys_for).collect();
            tx.mark(&keys, at)?;
            Ok(touched)
        })
    }

    async fn set_policy_active(
        &self,
        tenant: &TenantId,
        id: PolicyId,
        active: bool,
        at: Timestamp,
    ) -> StoreResult<Policy> {
        self.transact(tenant, |tx| {
            let mut policy = tx.tables.policy(id)?.clone();
            tx.write("policies")?;
            policy.active = active;
            policy.updated = true;
            policy.updated_at = at;
            tx.put_policy(policy.clone());
            tx.mark(&ledger_keys_for(&policy), at)?;
            Ok(policy)
        })
    }

    async fn delete_policy(
        &self,
        tenant: &TenantId,
        id: PolicyId,
        at: Timestamp,
    ) -> StoreResult<()> {
        self.transact(tenant, |tx| {
            let policy = tx.tables.policy(id)?.clone();
            let assigned = tx.tables.scopes.get(&id).map_or(0, PolicyScopes::len);
            tx.remove_scopes(id);
            for _ in 0..assigned {
                tx.write("scopes")?;
            }
            tx.write("policies")?;
            tx.remove_policy(id);
            tx.mark(&ledger_keys_for(&policy), at)?;
            Ok(())
        })
    }

    async fn get_policy(&self, tenant: &TenantId, id: PolicyId) -> StoreResult<Option<Policy>> {
        Ok(self.read(tenant, |t| t.policies.get(&id).cloned()))
    }

    async fn list_policies(&self, tenant: &TenantId) -> StoreResult<Vec<Policy>> {
        Ok(self.read(tenant, |t| t.sorted_policies(t.policies.values())))
    }

    async fn policies_of_type(
        &self,
        tenant: &TenantId,
        device_type: &DeviceType,
    ) -> StoreResult<Vec<Policy>> {
        Ok(self.read(tenant, |t| {
            t.sorted_policies(
                t.policies
                    .values()
                    .filter(|p| p.device_type() == device_type),
            )
        }))
    }

    async fn policies_with_scope(
        &self,
        tenant: &TenantId,
        scope: &PolicyScope,
    ) -> StoreResult<Vec<Policy>> {
        Ok(self.read(tenant, |t| {
            t.sorted_policies(
                t.scopes
                    .iter()
                    .filter(|(_, scopes)| scopes.contains(scope))
                    .filter_map(|(id, _)| t.policies.get(id)),
            )
        }))
    }

    async fn count_policies(&self, tenant: &TenantId) -> StoreResult<u64> {
        Ok(self.read(tenant, |t| t.policies.len() as u64))
    }

    async fn assign_scopes(
        &self,
        tenant: &TenantId,
        policy: PolicyId,
        scopes: &[PolicyScope],
        at: Timestamp,
    ) -> StoreResult<usize> {
        self.transact(tenant, |tx| {
            let stored = tx.tables.policy(policy)?.clone();
            let batch = normalize_batch(stored.device_type(), scopes)?;
            for scope in &batch {
                if let PolicyScope::Device(device) = scope {
                    if !tx.tables.devices.contains_key(device) {
                        return Err(FleetError::not_found("device", device));
                    }
                }
            }
            let mut merged = tx.tables.scopes.get(&policy).cloned().unwrap_or_default();
            let mut inserted = 0;
            for scope in batch {
                if merged.contains(&scope) {
                    continue;
                }
                tx.write("scopes")?;
                merged.insert(scope);
                inserted += 1;
            }
            if inserted > 0 {
                tx.put_scopes(policy, merged);
                tx.mark(&ledger_keys_for(&stored), at)?;
            }
            Ok(inserted)
        })
    }

    async fn policy_scopes(
        &self,
        tenant: &TenantId,
        policy: PolicyId,
    ) -> StoreResult<PolicyScopes> {
        self.read(tenant, |t| {
            t.policy(policy)?;
            Ok(t.scopes.get(&policy).cloned().unwrap_or_default())
        })
    }

    async fn candidates(
        &self,
        tenant: &TenantId,
        query: &CandidateQuery<'_>,
    ) -> StoreResult<Vec<Candidate>> {
        let roles: BTreeSet<&String> = query.roles.iter().collect();
        Ok(self.read(tenant, |t| {
            let mut out = Vec::new();
            for (id, scopes) in &t.scopes {
                let Some(policy) = t.policies.get(id) else {
                    continue;
                };
                let mut push = |scope: ScopeKind| {
                    out.push(Candidate {
                        policy: policy.clone(),
                        scope,
                    })
                };
                if scopes.devices.contains(&query.device_id) {
                    push(ScopeKind::Device);
                }
                if scopes.users.contains(query.user) {
                    push(ScopeKind::User);
                }
                if scopes.roles.iter().any(|r| roles.contains(r)) {
                    push(ScopeKind::Role);
                }
                if scopes.device_types.contains(query.device_type) {
                    push(ScopeKind::DeviceType);
                }
            }
            out
        }))
    }

    // ── Effective policy cache ───────────────────────────────────────

    async fn get_effective(
        &self,
        tenant: &TenantId,
        device: DeviceId,
    ) -> StoreResult<Option<EffectivePolicyRecord>> {
        Ok(self.read(tenant, |t| t.effective.get(&device).cloned()))
    }

    async fn put_effective(
        &self,
        tenant: &TenantId,
        write: EffectivePolicyWrite,
        expected: ExpectedRevision,
        at: Timestamp,
    ) -> StoreResult<(PutOutcome, EffectivePolicyRecord)> {
        self.transact(tenant, |tx| {
            let device = write.device_id;
            if !tx.tables.devices.contains_key(&device) {
                return Err(FleetError::not_found("device", device));
            }
            expected.check(device, tx.tables.effective.get(&device))?;
            match tx.tables.effective.get(&device).cloned() {
                Some(existing) if write.is_unchanged(&existing) => {
                    Ok((PutOutcome::Unchanged, existing))
                }
                Some(mut existing) => {
                    tx.write("effective")?;
                    write.apply_to(&mut existing, at);
                    tx.put_effective(existing.clone());
                    Ok((PutOutcome::Updated, existing))
                }
                None => {
                    tx.write("effective")?;
                    let record = write.into_new_record(at);
                    tx.put_effective(record.clone());
                    Ok((PutOutcome::Inserted, record))
                }
            }
        })
    }

    async fn mark_applied(
        &self,
        tenant: &TenantId,
        device: DeviceId,
        at: Timestamp,
    ) -> StoreResult<EffectivePolicyRecord> {
        self.transact(tenant, |tx| {
            let mut record = tx
                .tables
                .effective
                .get(&device)
                .cloned()
                .ok_or_else(|| FleetError::not_found("effective policy", device))?;
            if record.applied {
                return Ok(record);
            }
            tx.write("effective")?;
            record.applied = true;
            record.applied_time = Some(at);
            tx.put_effective(record.clone());
            Ok(record)
        })
    }

    async fn remove_effective(
        &self,
        tenant: &TenantId,
        device: DeviceId,
        expected: ExpectedRevision,
    ) -> StoreResult<bool> {
        self.transact(tenant, |tx| {
            expected.check(device, tx.tables.effective.get(&device))?;
            if !tx.tables.effective.contains_key(&device) {
                return Ok(false);
            }
            tx.write("effective")?;
            tx.remove_effective(device);
            Ok(true)
        })
    }

    async fn applied_policy_ids(
        &self,
        tenant: &TenantId,
    ) -> StoreResult<BTreeMap<DeviceId, PolicyId>> {
        Ok(self.read(tenant, |t| {
            t.effective
                .iter()
                .map(|(device, record)| (*device, record.policy_id))
                .collect()
        }))
    }

    // ── Change ledger ────────────────────────────────────────────────

    async fn mark_dirty(
        &self,
        tenant: &TenantId,
        keys: &[LedgerKey],
        at: Timestamp,
    ) -> StoreResult<()> {
        self.transact(tenant, |tx| tx.mark(keys, at))
    }

    async fn claim_dirty(
        &self,
        tenant: &TenantId,
        request: &ClaimRequest,
    ) -> StoreResult<Vec<ClaimedEntry>> {
        self.transact(tenant, |tx| {
            let mut ready: Vec<(Timestamp, LedgerKey)> = tx
                .tables
                .ledger
                .values()
                .filter(|e| e.is_claimable(request.now))
                .map(|e| (e.marked_at, e.key.clone()))
                .collect();
            ready.sort();
            ready.truncate(request.limit);

            let mut claimed = Vec::with_capacity(ready.len());
            for (_, key) in ready {
                tx.write("ledger")?;
                let Some(mut entry) = tx.tables.ledger.get(&key).cloned() else {
                    continue;
                };
                entry.lease = Some(Lease {
                    id: request.lease,
                    worker: request.worker.clone(),
                    expires_at: request.expires_at,
                });
                claimed.push(ClaimedEntry {
                    tenant: tenant.clone(),
                    key,
                    generation: entry.generation,
                    lease: request.lease,
                });
                tx.put_ledger(entry);
            }
            Ok(claimed)
        })
    }

    async fn complete_claim(
        &self,
        tenant: &TenantId,
        claim: &ClaimedEntry,
    ) -> StoreResult<CompleteOutcome> {
        self.transact(tenant, |tx| {
            let generation = match tx.tables.ledger.get(&claim.key) {
                Some(entry) if entry.is_held_by(claim.lease) => entry.generation,
                _ => return Ok(CompleteOutcome::LeaseLost),
            };
            tx.write("ledger")?;
            if generation == claim.generation {
                tx.remove_ledger(&claim.key);
                return Ok(CompleteOutcome::Cleared);
            }
            tx.release_lease(&claim.key);
            Ok(CompleteOutcome::StillDirty)
        })
    }

    async fn release_claim(&self, tenant: &TenantId, claim: &ClaimedEntry) -> StoreResult<bool> {
        self.transact(tenant, |tx| {
            let held = tx
                .tables
                .ledger
                .get(&claim.key)
                .is_some_and(|e| e.is_held_by(claim.lease));
            if !held {
                return Ok(false);
            }
            tx.write("ledger")?;
            tx.release_lease(&claim.key);
            Ok(true)
        })
    }

    async fn list_ledger(&self, tenant: &TenantId) -> StoreResult<Vec<LedgerEntry>> {
        Ok(self.read(tenant, |t| t.ledger.values().cloned().collect()))
    }

    async fn clear_ledger(&self, tenant: &TenantId) -> StoreResult<u64> {
        self.transact(tenant, |tx| {
            let keys: Vec<LedgerKey> = tx.tables.ledger.keys().cloned().collect();
            if !keys.is_empty() {
                tx.write("ledger")?;
            }
            for key in &keys {
                tx.remove_ledger(key);
            }
            Ok(keys.len() as u64)
        })
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_state::{EnrollmentStatus, OwnershipType};

    fn tenant(name: &str) -> TenantId {
        TenantId::new(name).unwrap()
    }

    fn device(tenant: &TenantId, id: &str) -> Device {
        Device {
            id: DeviceId::new(),
            tenant: tenant.clone(),
            identifier: DeviceIdentifier::new(id, DeviceType::new("android").unwrap()).unwrap(),
            name: id.to_string(),
            description: None,
            properties: Default::default(),
            enrollment: EnrollmentInfo::new(
                "alice",
                OwnershipType::Byod,
                EnrollmentStatus::Active,
                Timestamp::now(),
            )
            .unwrap(),
        }
    }

    #[tokio::test]
    async fn test_fault_rolls_back_device_and_enrollment() {
        let store = MemoryStore::new();
        let t = tenant("acme");
        let d = device(&t, "imei-1");
        store.inject_fault(FaultPoint::AfterWrites(1));
        let err = store.create_device(&t, &d).await.unwrap_err();
        assert!(matches!(err, FleetError::Persistence(_)));
        assert!(store.get_device(&t, &d.identifier).await.unwrap().is_none());
        assert!(store.enrollment_history(&t, d.id).await.unwrap().is_empty());

        store.create_device(&t, &d).await.unwrap();
        assert!(store.get_device(&t, &d.identifier).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fault_is_one_shot() {
        let store = MemoryStore::new();
        let t = tenant("acme");
        store.inject_fault(FaultPoint::AfterWrites(0));
        assert!(store.create_device(&t, &device(&t, "a")).await.is_err());
        assert!(store.create_device(&t, &device(&t, "a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_rollback_restores_rows_and_sequence_in_place() {
        let store = MemoryStore::new();
        let t = tenant("acme");
        let d = device(&t, "imei-1");
        store.create_device(&t, &d).await.unwrap();
        let seq_before = store.partition(&t).read().seq;

        let mut previous = d.enrollment.clone();
        previous.status = EnrollmentStatus::Removed;
        let mut moved = d.clone();
        moved.enrollment =
            EnrollmentInfo::new("bob", OwnershipType::Cope, EnrollmentStatus::Active, Timestamp::now())
                .unwrap();
        // Fails on the device row, after both enrollment rows were written.
        store.inject_fault(FaultPoint::AfterWrites(2));
        assert!(store.switch_enrollment(&t, &moved, &previous).await.is_err());

        let partition = store.partition(&t);
        let tables = partition.read();
        assert_eq!(tables.seq, seq_before);
        assert_eq!(tables.enrollments.len(), 1);
        assert_eq!(
            tables.enrollments[&d.enrollment.id].info.status,
            EnrollmentStatus::Active
        );
        assert_eq!(tables.devices[&d.id].enrollment.id, d.enrollment.id);
    }

    #[tokio::test]
    async fn test_committed_transaction_keeps_its_writes() {
        let store = MemoryStore::new();
        let t = tenant("acme");
        let d = device(&t, "imei-1");
        store.create_device(&t, &d).await.unwrap();
        let mut renamed = d.clone();
        renamed.name = "renamed".into();
        store.save_device(&t, &renamed).await.unwrap();
        let stored = store.get_device_by_id(&t, d.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "renamed");
    }

    #[tokio::test]
    async fn test_partitions_are_isolated() {
        let store = MemoryStore::new();
        let (a, b) = (tenant("alpha"), tenant("beta"));
        let d = device(&a, "imei-1");
        store.create_device(&a, &d).await.unwrap();
        assert!(store.get_device(&b, &d.identifier).await.unwrap().is_none());
        assert!(store.get_device_by_id(&b, d.id).await.unwrap().is_none());
        assert_eq!(store.count_devices(&b, &DeviceFilter::default()).await.unwrap(), 0);
        // The same identifier may be enrolled independently in another tenant.
        store.create_device(&b, &device(&b, "imei-1")).await.unwrap();
    }
}
