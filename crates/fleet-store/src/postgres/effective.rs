//! Effective-policy cache persistence.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use fleet_core::{DeviceId, FleetError, PolicyId, TenantId, Timestamp};
use fleet_policy::EffectivePolicyRecord;

use super::{corrupt, db_err};

const COLUMNS: &str = "device_id, policy_id, snapshot, snapshot_digest, created_time, updated_time,
        applied, applied_time, revision";

/// Fetch the record of a device, optionally locking it.
pub async fn get(
    conn: &mut PgConnection,
    tenant: &TenantId,
    device: DeviceId,
    for_update: bool,
) -> Result<Option<EffectivePolicyRecord>, FleetError> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let sql = format!(
        "SELECT {COLUMNS} FROM effective_policies WHERE tenant_id = $1 AND device_id = $2{lock}"
    );
    let row = sqlx::query_as::<_, EffectiveRow>(&sql)
        .bind(tenant.as_str())
        .bind(device.0)
        .fetch_optional(conn)
        .await
        .map_err(db_err)?;
    row.map(EffectiveRow::into_record).transpose()
}

pub async fn insert(
    conn: &mut PgConnection,
    tenant: &TenantId,
    record: &EffectivePolicyRecord,
) -> Result<(), FleetError> {
    sqlx::query(
        "INSERT INTO effective_policies (tenant_id, device_id, policy_id, snapshot, snapshot_digest,
                                         created_time, updated_time, applied, applied_time, revision)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(tenant.as_str())
    .bind(record.device_id.0)
    .bind(record.policy_id.0)
    .bind(&record.snapshot)
    .bind(&record.snapshot_digest)
    .bind(*record.created_time.as_datetime())
    .bind(*record.updated_time.as_datetime())
    .bind(record.applied)
    .bind(record.applied_time.map(|t| *t.as_datetime()))
    .bind(revision_param(record.revision)?)
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub async fn update(
    conn: &mut PgConnection,
    tenant: &TenantId,
    record: &EffectivePolicyRecord,
) -> Result<bool, FleetError> {
    let result = sqlx::query(
        "UPDATE effective_policies SET policy_id = $3, snapshot = $4, snapshot_digest = $5,
                updated_time = $6, applied = $7, applied_time = $8, revision = $9
         WHERE tenant_id = $1 AND device_id = $2",
    )
    .bind(tenant.as_str())
    .bind(record.device_id.0)
    .bind(record.policy_id.0)
    .bind(&record.snapshot)
    .bind(&record.snapshot_digest)
    .bind(*record.updated_time.as_datetime())
    .bind(record.applied)
    .bind(record.applied_time.map(|t| *t.as_datetime()))
    .bind(revision_param(record.revision)?)
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete(
    conn: &mut PgConnection,
    tenant: &TenantId,
    device: DeviceId,
) -> Result<bool, FleetError> {
    let result =
        sqlx::query("DELETE FROM effective_policies WHERE tenant_id = $1 AND device_id = $2")
            .bind(tenant.as_str())
            .bind(device.0)
            .execute(conn)
            .await
            .map_err(db_err)?;
    Ok(result.rows_affected() > 0)
}

pub async fn policy_ids(
    conn: &mut PgConnection,
    tenant: &TenantId,
) -> Result<BTreeMap<DeviceId, PolicyId>, FleetError> {
    let rows: Vec<(Uuid, Uuid)> = sqlx::query_as(
        "SELECT device_id, policy_id FROM effective_policies WHERE tenant_id = $1",
    )
    .bind(tenant.as_str())
    .fetch_all(conn)
    .await
    .map_err(db_err)?;
    Ok(rows
        .into_iter()
        .map(|(d, p)| (DeviceId::from_uuid(d), PolicyId::from_uuid(p)))
        .collect())
}

fn revision_param(revision: u64) -> Result<i64, FleetError> {
    i64::try_from(revision).map_err(|_| FleetError::persistence("revision overflow"))
}

/// Internal row type for SQLx mapping.
#[derive(sqlx::FromRow)]
struct EffectiveRow {
    device_id: Uuid,
    policy_id: Uuid,
    snapshot: Vec<u8>,
    snapshot_digest: String,
    created_time: DateTime<Utc>,
    updated_time: DateTime<Utc>,
    applied: bool,
    applied_time: Option<DateTime<Utc>>,
    revision: i64,
}

impl EffectiveRow {
    fn into_record(self) -> Result<EffectivePolicyRecord, FleetError> {
        Ok(EffectivePolicyRecord {
            device_id: DeviceId::from_uuid(self.device_id),
            policy_id: PolicyId::from_uuid(self.policy_id),
            snapshot: self.snapshot,
            snapshot_digest: self.snapshot_digest,
            created_time: Timestamp::from_utc(self.created_time),
            updated_time: Timestamp::from_utc(self.updated_time),
            applied: self.applied,
            applied_time: self.applied_time.map(Timestamp::from_utc),
            revision: u64::try_from(self.revision).map_err(|e| corrupt("effective policy", e))?,
        })
    }
}
