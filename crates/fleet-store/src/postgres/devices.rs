//! Device and enrollment persistence.
//!
//! All functions take a `&mut PgConnection` so they run inside the
//! caller's transaction. A device row points at its current enrollment
//! row through `enrollment_id`; older enrollment rows stay as history.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use fleet_core::{
    DeviceId, DeviceIdentifier, DeviceType, EnrollmentId, FleetError, TenantId, Timestamp,
};
use fleet_state::{Device, DeviceFilter, EnrollmentInfo, EnrollmentStatus, OwnershipType};

use super::{corrupt, db_err};

const DEVICE_COLUMNS: &str = "d.id, d.device_type, d.identifier, d.name, d.description, d.properties,
        e.id AS enrollment_id, e.owner, e.ownership, e.status,
        e.date_of_enrollment, e.date_of_last_update";

/// Insert the device row.
pub async fn insert_device(
    conn: &mut PgConnection,
    tenant: &TenantId,
    device: &Device,
) -> Result<(), FleetError> {
    let properties = serde_json::to_value(&device.properties)
        .map_err(|e| FleetError::validation(format!("device properties: {e}")))?;
    sqlx::query(
        "INSERT INTO devices (tenant_id, id, device_type, identifier, name, description, properties, enrollment_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(tenant.as_str())
    .bind(device.id.0)
    .bind(device.identifier.device_type.as_str())
    .bind(&device.identifier.id)
    .bind(&device.name)
    .bind(&device.description)
    .bind(&properties)
    .bind(device.enrollment.id.0)
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Rewrite mutable device attributes and the current-enrollment pointer.
pub async fn update_device(
    conn: &mut PgConnection,
    tenant: &TenantId,
    device: &Device,
) -> Result<bool, FleetError> {
    let properties = serde_json::to_value(&device.properties)
        .map_err(|e| FleetError::validation(format!("device properties: {e}")))?;
    let result = sqlx::query(
        "UPDATE devices SET name = $3, description = $4, properties = $5, enrollment_id = $6
         WHERE tenant_id = $1 AND id = $2 AND device_type = $7 AND identifier = $8",
    )
    .bind(tenant.as_str())
    .bind(device.id.0)
    .bind(&device.name)
    .bind(&device.description)
    .bind(&properties)
    .bind(device.enrollment.id.0)
    .bind(device.identifier.device_type.as_str())
    .bind(&device.identifier.id)
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(result.rows_affected() > 0)
}

/// Insert an enrollment row for `device`.
pub async fn insert_enrollment(
    conn: &mut PgConnection,
    tenant: &TenantId,
    device: DeviceId,
    info: &EnrollmentInfo,
) -> Result<(), FleetError> {
    sqlx::query(
        "INSERT INTO enrollments (tenant_id, id, device_id, owner, ownership, status, date_of_enrollment, date_of_last_update)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(tenant.as_str())
    .bind(info.id.0)
    .bind(device.0)
    .bind(&info.owner)
    .bind(info.ownership.as_str())
    .bind(info.status.as_str())
    .bind(*info.date_of_enrollment.as_datetime())
    .bind(*info.date_of_last_update.as_datetime())
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Rewrite an existing enrollment row of `device`.
pub async fn update_enrollment(
    conn: &mut PgConnection,
    tenant: &TenantId,
    device: DeviceId,
    info: &EnrollmentInfo,
) -> Result<bool, FleetError> {
    let result = sqlx::query(
        "UPDATE enrollments SET owner = $4, ownership = $5, status = $6,
                date_of_enrollment = $7, date_of_last_update = $8
         WHERE tenant_id = $1 AND id = $2 AND device_id = $3",
    )
    .bind(tenant.as_str())
    .bind(info.id.0)
    .bind(device.0)
    .bind(&info.owner)
    .bind(info.ownership.as_str())
    .bind(info.status.as_str())
    .bind(*info.date_of_enrollment.as_datetime())
    .bind(*info.date_of_last_update.as_datetime())
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(result.rows_affected() > 0)
}

pub async fn exists(
    conn: &mut PgConnection,
    tenant: &TenantId,
    id: DeviceId,
) -> Result<bool, FleetError> {
    let found: Option<i32> =
        sqlx::query_scalar("SELECT 1 FROM devices WHERE tenant_id = $1 AND id = $2")
            .bind(tenant.as_str())
            .bind(id.0)
            .fetch_optional(conn)
            .await
            .map_err(db_err)?;
    Ok(found.is_some())
}

/// Current enrollment id and status of a device, locking the device row
/// until the transaction ends.
pub async fn current_enrollment(
    conn: &mut PgConnection,
    tenant: &TenantId,
    id: DeviceId,
) -> Result<Option<(EnrollmentId, EnrollmentStatus)>, FleetError> {
    let row: Option<(Uuid, String)> = sqlx::query_as(
        "SELECT e.id, e.status FROM devices d
         JOIN enrollments e ON e.tenant_id = d.tenant_id AND e.id = d.enrollment_id
         WHERE d.tenant_id = $1 AND d.id = $2
         FOR UPDATE OF d",
    )
    .bind(tenant.as_str())
    .bind(id.0)
    .fetch_optional(conn)
    .await
    .map_err(db_err)?;
    row.map(|(enrollment, status)| {
        let status: EnrollmentStatus = status.parse().map_err(|e| corrupt("enrollment", e))?;
        Ok((EnrollmentId::from_uuid(enrollment), status))
    })
    .transpose()
}

pub async fn get_by_identifier(
    conn: &mut PgConnection,
    tenant: &TenantId,
    identifier: &DeviceIdentifier,
) -> Result<Option<Device>, FleetError> {
    let sql = format!(
        "SELECT {DEVICE_COLUMNS} FROM devices d
         JOIN enrollments e ON e.tenant_id = d.tenant_id AND e.id = d.enrollment_id
         WHERE d.tenant_id = $1 AND d.device_type = $2 AND d.identifier = $3"
    );
    let row = sqlx::query_as::<_, DeviceRow>(&sql)
        .bind(tenant.as_str())
        .bind(identifier.device_type.as_str())
        .bind(&identifier.id)
        .fetch_optional(conn)
        .await
        .map_err(db_err)?;
    row.map(|r| r.into_record(tenant)).transpose()
}

pub async fn get_by_id(
    conn: &mut PgConnection,
    tenant: &TenantId,
    id: DeviceId,
) -> Result<Option<Device>, FleetError> {
    let sql = format!(
        "SELECT {DEVICE_COLUMNS} FROM devices d
         JOIN enrollments e ON e.tenant_id = d.tenant_id AND e.id = d.enrollment_id
         WHERE d.tenant_id = $1 AND d.id = $2"
    );
    let row = sqlx::query_as::<_, DeviceRow>(&sql)
        .bind(tenant.as_str())
        .bind(id.0)
        .fetch_optional(conn)
        .await
        .map_err(db_err)?;
    row.map(|r| r.into_record(tenant)).transpose()
}

const FILTER_CLAUSE: &str = "d.tenant_id = $1
           AND ($2::text IS NULL OR d.device_type = $2)
           AND ($3::text IS NULL OR e.status = $3)
           AND ($4::text IS NULL OR e.owner = $4)
           AND ($5::text IS NULL OR d.name ILIKE '%' || $5 || '%' ESCAPE '\\')";

pub async fn list(
    conn: &mut PgConnection,
    tenant: &TenantId,
    filter: &DeviceFilter,
) -> Result<Vec<Device>, FleetError> {
    let sql = format!(
        "SELECT {DEVICE_COLUMNS} FROM devices d
         JOIN enrollments e ON e.tenant_id = d.tenant_id AND e.id = d.enrollment_id
         WHERE {FILTER_CLAUSE}
         ORDER BY d.device_type, d.identifier"
    );
    let rows = sqlx::query_as::<_, DeviceRow>(&sql)
        .bind(tenant.as_str())
        .bind(filter.device_type.as_ref().map(DeviceType::as_str))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.owner.as_deref())
        .bind(filter.name.as_deref().map(escape_like))
        .fetch_all(conn)
        .await
        .map_err(db_err)?;
    rows.into_iter().map(|r| r.into_record(tenant)).collect()
}

pub async fn count(
    conn: &mut PgConnection,
    tenant: &TenantId,
    filter: &DeviceFilter,
) -> Result<u64, FleetError> {
    let sql = format!(
        "SELECT COUNT(*) FROM devices d
         JOIN enrollments e ON e.tenant_id = d.tenant_id AND e.id = d.enrollment_id
         WHERE {FILTER_CLAUSE}"
    );
    let n: i64 = sqlx::query_scalar(&sql)
        .bind(tenant.as_str())
        .bind(filter.device_type.as_ref().map(DeviceType::as_str))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.owner.as_deref())
        .bind(filter.name.as_deref().map(escape_like))
        .fetch_one(conn)
        .await
        .map_err(db_err)?;
    Ok(n.max(0) as u64)
}

pub async fn history(
    conn: &mut PgConnection,
    tenant: &TenantId,
    device: DeviceId,
) -> Result<Vec<EnrollmentInfo>, FleetError> {
    let rows = sqlx::query_as::<_, EnrollmentRow>(
        "SELECT id, owner, ownership, status, date_of_enrollment, date_of_last_update
         FROM enrollments WHERE tenant_id = $1 AND device_id = $2 ORDER BY seq",
    )
    .bind(tenant.as_str())
    .bind(device.0)
    .fetch_all(conn)
    .await
    .map_err(db_err)?;
    rows.into_iter().map(EnrollmentRow::into_record).collect()
}

fn escape_like(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    for c in fragment.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Internal row type for SQLx mapping.
#[derive(sqlx::FromRow)]
struct DeviceRow {
    id: Uuid,
    device_type: String,
    identifier: String,
    name: String,
    description: Option<String>,
    properties: serde_json::Value,
    enrollment_id: Uuid,
    owner: String,
    ownership: String,
    status: String,
    date_of_enrollment: DateTime<Utc>,
    date_of_last_update: DateTime<Utc>,
}

impl DeviceRow {
    fn into_record(self, tenant: &TenantId) -> Result<Device, FleetError> {
        let device_type =
            DeviceType::new(self.device_type).map_err(|e| corrupt("device", e))?;
        let identifier =
            DeviceIdentifier::new(self.identifier, device_type).map_err(|e| corrupt("device", e))?;
        let properties: BTreeMap<String, String> =
            serde_json::from_value(self.properties).map_err(|e| corrupt("device", e))?;
        Ok(Device {
            id: DeviceId::from_uuid(self.id),
            tenant: tenant.clone(),
            identifier,
            name: self.name,
            description: self.description,
            properties,
            enrollment: EnrollmentRow {
                id: self.enrollment_id,
                owner: self.owner,
                ownership: self.ownership,
                status: self.status,
                date_of_enrollment: self.date_of_enrollment,
                date_of_last_update: self.date_of_last_update,
            }
            .into_record()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EnrollmentRow {
    id: Uuid,
    owner: String,
    ownership: String,
    status: String,
    date_of_enrollment: DateTime<Utc>,
    date_of_last_update: DateTime<Utc>,
}

impl EnrollmentRow {
    fn into_record(self) -> Result<EnrollmentInfo, FleetError> {
        let ownership: OwnershipType =
            self.ownership.parse().map_err(|e| corrupt("enrollment", e))?;
        let status: EnrollmentStatus = self.status.parse().map_err(|e| corrupt("enrollment", e))?;
        Ok(EnrollmentInfo {
            id: EnrollmentId::from_uuid(self.id),
            owner: self.owner,
            ownership,
            status,
            date_of_enrollment: Timestamp::from_utc(self.date_of_enrollment),
            date_of_last_update: Timestamp::from_utc(self.date_of_last_update),
        })
    }
}
