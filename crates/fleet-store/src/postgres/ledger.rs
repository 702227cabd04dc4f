//! Change-ledger persistence.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so two workers claiming at the same
//! moment never receive the same entry.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use fleet_core::{DeviceType, FleetError, LeaseId, PolicyId, TenantId, Timestamp};
use fleet_policy::{ClaimRequest, ClaimedEntry, CompleteOutcome, Lease, LedgerEntry, LedgerKey};

use super::{corrupt, db_err};

/// Insert an entry, or bump the generation of an existing one.
pub async fn mark(
    conn: &mut PgConnection,
    tenant: &TenantId,
    key: &LedgerKey,
    at: Timestamp,
) -> Result<(), FleetError> {
    sqlx::query(
        "INSERT INTO policy_change_ledger (tenant_id, policy_id, device_type, generation, marked_at)
         VALUES ($1, $2, $3, 1, $4)
         ON CONFLICT (tenant_id, policy_id, device_type)
         DO UPDATE SET generation = policy_change_ledger.generation + 1,
                       marked_at = EXCLUDED.marked_at",
    )
    .bind(tenant.as_str())
    .bind(key.policy_id.0)
    .bind(key.device_type.as_str())
    .bind(*at.as_datetime())
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub async fn claim(
    conn: &mut PgConnection,
    tenant: &TenantId,
    request: &ClaimRequest,
) -> Result<Vec<ClaimedEntry>, FleetError> {
    let limit = i64::try_from(request.limit).unwrap_or(i64::MAX);
    let rows: Vec<(Uuid, String, i64)> = sqlx::query_as(
        "UPDATE policy_change_ledger l
            SET lease_id = $2, lease_worker = $3, lease_expires_at = $4
          WHERE (l.tenant_id, l.policy_id, l.device_type) IN (
                SELECT tenant_id, policy_id, device_type FROM policy_change_ledger
                 WHERE tenant_id = $1 AND (lease_expires_at IS NULL OR lease_expires_at <= $5)
                 ORDER BY marked_at, policy_id, device_type
                 LIMIT $6
                 FOR UPDATE SKIP LOCKED)
         RETURNING l.policy_id, l.device_type, l.generation",
    )
    .bind(tenant.as_str())
    .bind(request.lease.0)
    .bind(&request.worker)
    .bind(*request.expires_at.as_datetime())
    .bind(*request.now.as_datetime())
    .bind(limit)
    .fetch_all(conn)
    .await
    .map_err(db_err)?;

    rows.into_iter()
        .map(|(policy_id, device_type, generation)| {
            Ok(ClaimedEntry {
                tenant: tenant.clone(),
                key: LedgerKey {
                    policy_id: PolicyId::from_uuid(policy_id),
                    device_type: DeviceType::new(device_type).map_err(|e| corrupt("ledger", e))?,
                },
                generation: u64::try_from(generation).map_err(|e| corrupt("ledger", e))?,
                lease: request.lease,
            })
        })
        .collect()
}

pub async fn complete(
    conn: &mut PgConnection,
    claim: &ClaimedEntry,
) -> Result<CompleteOutcome, FleetError> {
    let generation = i64::try_from(claim.generation).map_err(|e| corrupt("ledger", e))?;
    let deleted = sqlx::query(
        "DELETE FROM policy_change_ledger
          WHERE tenant_id = $1 AND policy_id = $2 AND device_type = $3
            AND lease_id = $4 AND generation = $5",
    )
    .bind(claim.tenant.as_str())
    .bind(claim.key.policy_id.0)
    .bind(claim.key.device_type.as_str())
    .bind(claim.lease.0)
    .bind(generation)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    if deleted.rows_affected() > 0 {
        return Ok(CompleteOutcome::Cleared);
    }
    if release(conn, claim).await? {
        Ok(CompleteOutcome::StillDirty)
    } else {
        Ok(CompleteOutcome::LeaseLost)
    }
}

/// Drop the lease of a claim. Returns whether the lease was still held.
pub async fn release(conn: &mut PgConnection, claim: &ClaimedEntry) -> Result<bool, FleetError> {
    let result = sqlx::query(
        "UPDATE policy_change_ledger
            SET lease_id = NULL, lease_worker = NULL, lease_expires_at = NULL
          WHERE tenant_id = $1 AND policy_id = $2 AND device_type = $3 AND lease_id = $4",
    )
    .bind(claim.tenant.as_str())
    .bind(claim.key.policy_id.0)
    .bind(claim.key.device_type.as_str())
    .bind(claim.lease.0)
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(result.rows_affected() > 0)
}

pub async fn list(conn: &mut PgConnection, tenant: &TenantId) -> Result<Vec<LedgerEntry>, FleetError> {
    let rows = sqlx::query_as::<_, LedgerRow>(
        "SELECT policy_id, device_type, generation, marked_at, lease_id, lease_worker, lease_expires_at
         FROM policy_change_ledger WHERE tenant_id = $1 ORDER BY marked_at, policy_id, device_type",
    )
    .bind(tenant.as_str())
    .fetch_all(conn)
    .await
    .map_err(db_err)?;
    rows.into_iter().map(|r| r.into_record(tenant)).collect()
}

pub async fn clear(conn: &mut PgConnection, tenant: &TenantId) -> Result<u64, FleetError> {
    let result = sqlx::query("DELETE FROM policy_change_ledger WHERE tenant_id = $1")
        .bind(tenant.as_str())
        .execute(conn)
        .await
        .map_err(db_err)?;
    Ok(result.rows_affected())
}

/// Internal row type for SQLx mapping.
#[derive(sqlx::FromRow)]
struct LedgerRow {
    policy_id: Uuid,
    device_type: String,
    generation: i64,
    marked_at: DateTime<Utc>,
    lease_id: Option<Uuid>,
    lease_worker: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
}

impl LedgerRow {
    fn into_record(self, tenant: &TenantId) -> Result<LedgerEntry, FleetError> {
        let lease = match (self.lease_id, self.lease_worker, self.lease_expires_at) {
            (Some(id), Some(worker), Some(expires_at)) => Some(Lease {
                id: LeaseId::from_uuid(id),
                worker,
                expires_at: Timestamp::from_utc(expires_at),
            }),
            _ => None,
        };
        Ok(LedgerEntry {
            tenant: tenant.clone(),
            key: LedgerKey {
                policy_id: PolicyId::from_uuid(self.policy_id),
                device_type: DeviceType::new(self.device_type).map_err(|e| corrupt("ledger", e))?,
            },
            generation: u64::try_from(self.generation).map_err(|e| corrupt("ledger", e))?,
            marked_at: Timestamp::from_utc(self.marked_at),
            lease,
        })
    }
}
