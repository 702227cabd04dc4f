//! # PostgreSQL Backend
//!
//! [`PgStore`] implements [`FleetStore`] with SQLx over PostgreSQL. Every
//! state-changing trait method opens one transaction, runs the row-level
//! functions of the submodules against it, and commits. Returning early
//! with `?` drops the transaction, which rolls it back.
//!
//! Policy writes take a per-tenant advisory lock first, so priority
//! assignment and reorders of one tenant run one at a time. The unique
//! `(tenant_id, priority)` constraint is deferred to commit, which lets a
//! reorder swap two priorities inside the transaction.

pub mod devices;
pub mod effective;
pub mod ledger;
pub mod policies;

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};

use fleet_core::{DeviceId, DeviceIdentifier, DeviceType, FleetError, PolicyId, TenantId, Timestamp};
use fleet_policy::{
    check_reorder, next_priority, normalize_batch, Candidate, ClaimRequest, ClaimedEntry,
    CompleteOutcome, EffectivePolicyRecord, EffectivePolicyWrite, ExpectedRevision, LedgerEntry,
    LedgerKey, Policy, PolicyScope, PolicyScopes, PriorityChange, PutOutcome,
};
use fleet_state::{Device, DeviceFilter, EnrollmentInfo};

use crate::{check_save, check_switch, ledger_keys_for, CandidateQuery, FleetStore, StoreResult};

/// Initialize the database connection pool and run migrations.
///
/// Returns `None` if `DATABASE_URL` is not set (in-memory-only mode).
/// Returns `Err` if the URL is set but the connection or migration fails.
pub async fn init_pool() -> Result<Option<PgPool>, sqlx::Error> {
    let url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            tracing::warn!(
                "DATABASE_URL not set, running with the in-memory store. \
                 State will not survive restarts."
            );
            return Ok(None);
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(&url)
        .await?;

    tracing::info!("Connected to PostgreSQL");

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    Ok(Some(pool))
}

/// Map a driver error onto the engine taxonomy.
///
/// Unique violations (`23505`) and serialization failures (`40001`) mean a
/// concurrent writer won, so they surface as `Conflict`.
pub(crate) fn db_err(err: sqlx::Error) -> FleetError {
    if let sqlx::Error::Database(db) = &err {
        if matches!(db.code().as_deref(), Some("23505") | Some("40001")) {
            return FleetError::conflict(db.message().to_string());
        }
    }
    FleetError::persistence(err.to_string())
}

pub(crate) fn corrupt(what: &str, err: impl std::fmt::Display) -> FleetError {
    FleetError::persistence(format!("corrupt {what} row: {err}"))
}

/// PostgreSQL-backed [`FleetStore`].
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> StoreResult<sqlx::Transaction<'static, sqlx::Postgres>> {
        self.pool.begin().await.map_err(db_err)
    }

    async fn conn(&self) -> StoreResult<sqlx::pool::PoolConnection<sqlx::Postgres>> {
        self.pool.acquire().await.map_err(db_err)
    }
}

async fn mark_keys(
    conn: &mut sqlx::PgConnection,
    tenant: &TenantId,
    keys: &[LedgerKey],
    at: Timestamp,
) -> StoreResult<()> {
    for key in keys {
        ledger::mark(&mut *conn, tenant, key, at).await?;
    }
    Ok(())
}

#[async_trait]
impl FleetStore for PgStore {
    // ── Devices and enrollments ──────────────────────────────────────

    async fn create_device(&self, tenant: &TenantId, device: &Device) -> StoreResult<()> {
        let mut tx = self.begin().await?;
        if devices::get_by_identifier(&mut tx, tenant, &device.identifier)
            .await?
            .is_some()
        {
            return Err(FleetError::conflict(format!(
                "device {} is already enrolled",
                device.identifier
            )));
        }
        devices::insert_device(&mut tx, tenant, device).await?;
        devices::insert_enrollment(&mut tx, tenant, device.id, &device.enrollment).await?;
        tx.commit().await.map_err(db_err)
    }

    async fn save_device(&self, tenant: &TenantId, device: &Device) -> StoreResult<()> {
        let mut tx = self.begin().await?;
        let (current, status) = devices::current_enrollment(&mut tx, tenant, device.id)
            .await?
            .ok_or_else(|| FleetError::not_found("device", &device.identifier))?;
        check_save(current, status, device)?;
        if !devices::update_device(&mut tx, tenant, device).await? {
            return Err(FleetError::not_found("device", &device.identifier));
        }
        if !devices::update_enrollment(&mut tx, tenant, device.id, &device.enrollment).await? {
            return Err(FleetError::persistence(format!(
                "current enrollment row of {} is missing",
                device.identifier
            )));
        }
        tx.commit().await.map_err(db_err)
    }

    async fn switch_enrollment(
        &self,
        tenant: &TenantId,
        device: &Device,
        previous: &EnrollmentInfo,
    ) -> StoreResult<()> {
        let mut tx = self.begin().await?;
        let (current, _) = devices::current_enrollment(&mut tx, tenant, device.id)
            .await?
            .ok_or_else(|| FleetError::not_found("device", &device.identifier))?;
        check_switch(current, device, previous)?;
        if !devices::update_enrollment(&mut tx, tenant, device.id, previous).await? {
            return Err(FleetError::not_found("enrollment", previous.id));
        }
        devices::insert_enrollment(&mut tx, tenant, device.id, &device.enrollment).await?;
        devices::update_device(&mut tx, tenant, device).await?;
        tx.commit().await.map_err(db_err)
    }

    async fn get_device(
        &self,
        tenant: &TenantId,
        identifier: &DeviceIdentifier,
    ) -> StoreResult<Option<Device>> {
        let mut conn = self.conn().await?;
        devices::get_by_identifier(&mut conn, tenant, identifier).await
    }

    async fn get_device_by_id(
        &self,
        tenant: &TenantId,
        id: DeviceId,
    ) -> StoreResult<Option<Device>> {
        let mut conn = self.conn().await?;
        devices::get_by_id(&mut conn, tenant, id).await
    }

    async fn list_devices(
        &self,
        tenant: &TenantId,
        filter: &DeviceFilter,
    ) -> StoreResult<Vec<Device>> {
        let mut conn = self.conn().await?;
        devices::list(&mut conn, tenant, filter).await
    }

    async fn count_devices(&self, tenant: &TenantId, filter: &DeviceFilter) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        devices::count(&mut conn, tenant, filter).await
    }

    async fn enrollment_history(
        &self,
        tenant: &TenantId,
        device: DeviceId,
    ) -> StoreResult<Vec<EnrollmentInfo>> {
        let mut conn = self.conn().await?;
        devices::history(&mut conn, tenant, device).await
    }

    // ── Policies ─────────────────────────────────────────────────────

    async fn create_policy(&self, tenant: &TenantId, mut policy: Policy) -> StoreResult<Policy> {
        let mut tx = self.begin().await?;
        policies::lock_tenant(&mut tx, tenant).await?;
        let max = policies::max_priority(&mut tx, tenant).await?;
        policy.tenant = tenant.clone();
        policy.priority = next_priority(max);
        policy.updated = false;
        policies::insert(&mut tx, tenant, &policy).await?;
        mark_keys(&mut tx, tenant, &ledger_keys_for(&policy), policy.created_at).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(policy)
    }

    async fn update_policy(&self, tenant: &TenantId, policy: Policy) -> StoreResult<Policy> {
        let mut tx = self.begin().await?;
        policies::lock_tenant(&mut tx, tenant).await?;
        let stored = policies::get(&mut tx, tenant, policy.id, true)
            .await?
            .ok_or_else(|| FleetError::not_found("policy", policy.id))?;
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
        policies::update(&mut tx, tenant, &updated).await?;
        let mut keys = ledger_keys_for(&stored);
        for key in ledger_keys_for(&updated) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        mark_keys(&mut tx, tenant, &keys, updated.updated_at).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(updated)
    }

    async fn update_priorities(
        &self,
        tenant: &TenantId,
        changes: &[PriorityChange],
        at: Timestamp,
    ) -> StoreResult<Vec<Policy>> {
        let mut tx = self.begin().await?;
        policies::lock_tenant(&mut tx, tenant).await?;
        let all = policies::list(&mut tx, tenant).await?;
        let mut by_id: BTreeMap<PolicyId, Policy> = all.into_iter().map(|p| (p.id, p)).collect();
        for change in changes {
            if !by_id.contains_key(&change.policy_id) {
                return Err(FleetError::not_found("policy", change.policy_id));
            }
        }
        let current: BTreeMap<PolicyId, u32> =
            by_id.values().map(|p| (p.id, p.priority)).collect();
        check_reorder(changes, &current)?;

        let mut touched = Vec::with_capacity(changes.len());
        for change in changes {
            let policy = by_id
                .get_mut(&change.policy_id)
                .ok_or_else(|| FleetError::not_found("policy", change.policy_id))?;
            policy.priority = change.priority;
            policy.updated = true;
            policy.updated_at = at;
            policies::update(&mut tx, tenant, policy).await?;
            touched.push(policy.clone());
        }
        let keys: Vec<LedgerKey> = touched.iter().flat_map(ledger_keys_for).collect();
        mark_keys(&mut tx, tenant, &keys, at).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(touched)
    }

    async fn set_policy_active(
        &self,
        tenant: &TenantId,
        id: PolicyId,
        active: bool,
        at: Timestamp,
    ) -> StoreResult<Policy> {
        let mut tx = self.begin().await?;
        policies::lock_tenant(&mut tx, tenant).await?;
        let mut policy = policies::get(&mut tx, tenant, id, true)
            .await?
            .ok_or_else(|| FleetError::not_found("policy", id))?;
        policy.active = active;
        policy.updated = true;
        policy.updated_at = at;
        policies::update(&mut tx, tenant, &policy).await?;
        mark_keys(&mut tx, tenant, &ledger_keys_for(&policy), at).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(policy)
    }

    async fn delete_policy(
        &self,
        tenant: &TenantId,
        id: PolicyId,
        at: Timestamp,
    ) -> StoreResult<()> {
        let mut tx = self.begin().await?;
        policies::lock_tenant(&mut tx, tenant).await?;
        let policy = policies::get(&mut tx, tenant, id, true)
            .await?
            .ok_or_else(|| FleetError::not_found("policy", id))?;
        let removed = policies::delete_scopes(&mut tx, tenant, id).await?;
        policies::delete(&mut tx, tenant, id).await?;
        mark_keys(&mut tx, tenant, &ledger_keys_for(&policy), at).await?;
        tx.commit().await.map_err(db_err)?;
        tracing::debug!(tenant = %tenant, policy = %id, scopes = removed, "policy deleted");
        Ok(())
    }

    async fn get_policy(&self, tenant: &TenantId, id: PolicyId) -> StoreResult<Option<Policy>> {
        let mut conn = self.conn().await?;
        policies::get(&mut conn, tenant, id, false).await
    }

    async fn list_policies(&self, tenant: &TenantId) -> StoreResult<Vec<Policy>> {
        let mut conn = self.conn().await?;
        policies::list(&mut conn, tenant).await
    }

    async fn policies_of_type(
        &self,
        tenant: &TenantId,
        device_type: &DeviceType,
    ) -> StoreResult<Vec<Policy>> {
        let mut conn = self.conn().await?;
        policies::list_of_type(&mut conn, tenant, device_type).await
    }

    async fn policies_with_scope(
        &self,
        tenant: &TenantId,
        scope: &PolicyScope,
    ) -> StoreResult<Vec<Policy>> {
        let mut conn = self.conn().await?;
        policies::with_scope(&mut conn, tenant, scope).await
    }

    async fn count_policies(&self, tenant: &TenantId) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        policies::count(&mut conn, tenant).await
    }

    async fn assign_scopes(
        &self,
        tenant: &TenantId,
        policy: PolicyId,
        scopes: &[PolicyScope],
        at: Timestamp,
    ) -> StoreResult<usize> {
        let mut tx = self.begin().await?;
        policies::lock_tenant(&mut tx, tenant).await?;
        let stored = policies::get(&mut tx, tenant, policy, true)
            .await?
            .ok_or_else(|| FleetError::not_found("policy", policy))?;
        let batch = normalize_batch(stored.device_type(), scopes)?;
        for scope in &batch {
            if let PolicyScope::Device(device) = scope {
                if !devices::exists(&mut tx, tenant, *device).await? {
                    return Err(FleetError::not_found("device", device));
                }
            }
        }
        let mut inserted = 0;
        for scope in &batch {
            if policies::insert_scope(&mut tx, tenant, policy, scope).await? {
                inserted += 1;
            }
        }
        if inserted > 0 {
            mark_keys(&mut tx, tenant, &ledger_keys_for(&stored), at).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(inserted)
    }

    async fn policy_scopes(
        &self,
        tenant: &TenantId,
        policy: PolicyId,
    ) -> StoreResult<PolicyScopes> {
        let mut conn = self.conn().await?;
        if policies::get(&mut conn, tenant, policy, false).await?.is_none() {
            return Err(FleetError::not_found("policy", policy));
        }
        policies::scopes(&mut conn, tenant, policy).await
    }

    async fn candidates(
        &self,
        tenant: &TenantId,
        query: &CandidateQuery<'_>,
    ) -> StoreResult<Vec<Candidate>> {
        let mut conn = self.conn().await?;
        policies::candidates(&mut conn, tenant, query).await
    }

    // ── Effective policy cache ───────────────────────────────────────

    async fn get_effective(
        &self,
        tenant: &TenantId,
        device: DeviceId,
    ) -> StoreResult<Option<EffectivePolicyRecord>> {
        let mut conn = self.conn().await?;
        effective::get(&mut conn, tenant, device, false).await
    }

    async fn put_effective(
        &self,
        tenant: &TenantId,
        write: EffectivePolicyWrite,
        expected: ExpectedRevision,
        at: Timestamp,
    ) -> StoreResult<(PutOutcome, EffectivePolicyRecord)> {
        let device = write.device_id;
        let mut tx = self.begin().await?;
        if !devices::exists(&mut tx, tenant, device).await? {
            return Err(FleetError::not_found("device", device));
        }
        let existing = effective::get(&mut tx, tenant, device, true).await?;
        expected.check(device, existing.as_ref())?;
        let outcome = match existing {
            Some(existing) if write.is_unchanged(&existing) => {
                return Ok((PutOutcome::Unchanged, existing));
            }
            Some(mut existing) => {
                write.apply_to(&mut existing, at);
                effective::update(&mut tx, tenant, &existing).await?;
                (PutOutcome::Updated, existing)
            }
            None => {
                let record = write.into_new_record(at);
                effective::insert(&mut tx, tenant, &record).await?;
                (PutOutcome::Inserted, record)
            }
        };
        tx.commit().await.map_err(db_err)?;
        Ok(outcome)
    }

    async fn mark_applied(
        &self,
        tenant: &TenantId,
        device: DeviceId,
        at: Timestamp,
    ) -> StoreResult<EffectivePolicyRecord> {
        let mut tx = self.begin().await?;
        let mut record = effective::get(&mut tx, tenant, device, true)
            .await?
            .ok_or_else(|| FleetError::not_found("effective policy", device))?;
        if !record.applied {
            record.applied = true;
            record.applied_time = Some(at);
            effective::update(&mut tx, tenant, &record).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(record)
    }

    async fn remove_effective(
        &self,
        tenant: &TenantId,
        device: DeviceId,
        expected: ExpectedRevision,
    ) -> StoreResult<bool> {
        let mut tx = self.begin().await?;
        let existing = effective::get(&mut tx, tenant, device, true).await?;
        expected.check(device, existing.as_ref())?;
        if existing.is_none() {
            return Ok(false);
        }
        let removed = effective::delete(&mut tx, tenant, device).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(removed)
    }

    async fn applied_policy_ids(
        &self,
        tenant: &TenantId,
    ) -> StoreResult<BTreeMap<DeviceId, PolicyId>> {
        let mut conn = self.conn().await?;
        effective::policy_ids(&mut conn, tenant).await
    }

    // ── Change ledger ────────────────────────────────────────────────

    async fn mark_dirty(
        &self,
        tenant: &TenantId,
        keys: &[LedgerKey],
        at: Timestamp,
    ) -> StoreResult<()> {
        let mut tx = self.begin().await?;
        mark_keys(&mut tx, tenant, keys, at).await?;
        tx.commit().await.map_err(db_err)
    }

    async fn claim_dirty(
        &self,
        tenant: &TenantId,
        request: &ClaimRequest,
    ) -> StoreResult<Vec<ClaimedEntry>> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }
        let mut tx = self.begin().await?;
        let claimed = ledger::claim(&mut tx, tenant, request).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(claimed)
    }

    async fn complete_claim(
        &self,
        tenant: &TenantId,
        claim: &ClaimedEntry,
    ) -> StoreResult<CompleteOutcome> {
        if &claim.tenant != tenant {
            return Ok(CompleteOutcome::LeaseLost);
        }
        let mut tx = self.begin().await?;
        let outcome = ledger::complete(&mut tx, claim).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(outcome)
    }

    async fn release_claim(&self, tenant: &TenantId, claim: &ClaimedEntry) -> StoreResult<bool> {
        if &claim.tenant != tenant {
            return Ok(false);
        }
        let mut tx = self.begin().await?;
        let released = ledger::release(&mut tx, claim).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(released)
    }

    async fn list_ledger(&self, tenant: &TenantId) -> StoreResult<Vec<LedgerEntry>> {
        let mut conn = self.conn().await?;
        ledger::list(&mut conn, tenant).await
    }

    async fn clear_ledger(&self, tenant: &TenantId) -> StoreResult<u64> {
        let mut tx = self.begin().await?;
        let removed = ledger::clear(&mut tx, tenant).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(removed)
    }

    // ── Health ───────────────────────────────────────────────────────

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
