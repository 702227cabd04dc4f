//! Policy and scope-assignment persistence.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use fleet_core::{DeviceId, DeviceType, FleetError, PolicyId, TenantId, Timestamp};
use fleet_policy::{Candidate, ComplianceMode, Policy, PolicyScope, PolicyScopes, Profile, ScopeKind};
use fleet_state::OwnershipType;

use super::{corrupt, db_err};
use crate::CandidateQuery;

const POLICY_COLUMNS: &str = "p.id, p.name, p.profile, p.priority, p.compliance, p.ownership_type,
        p.active, p.updated, p.created_at, p.updated_at";

/// Serialize policy writes of one tenant for the rest of the transaction.
pub async fn lock_tenant(conn: &mut PgConnection, tenant: &TenantId) -> Result<(), FleetError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(tenant.as_str())
        .execute(conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

pub async fn max_priority(conn: &mut PgConnection, tenant: &TenantId) -> Result<Option<u32>, FleetError> {
    let max: Option<i32> = sqlx::query_scalar("SELECT MAX(priority) FROM policies WHERE tenant_id = $1")
        .bind(tenant.as_str())
        .fetch_one(conn)
        .await
        .map_err(db_err)?;
    max.map(|p| u32::try_from(p).map_err(|e| corrupt("policy", e)))
        .transpose()
}

pub async fn insert(
    conn: &mut PgConnection,
    tenant: &TenantId,
    policy: &Policy,
) -> Result<(), FleetError> {
    let profile = profile_json(&policy.profile)?;
    sqlx::query(
        "INSERT INTO policies (tenant_id, id, name, profile, device_type, priority, compliance,
                               ownership_type, active, updated, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
    )
    .bind(tenant.as_str())
    .bind(policy.id.0)
    .bind(&policy.name)
    .bind(&profile)
    .bind(policy.device_type().as_str())
    .bind(priority_param(policy.priority)?)
    .bind(policy.compliance.as_str())
    .bind(policy.ownership_type.map(|o| o.as_str()))
    .bind(policy.active)
    .bind(policy.updated)
    .bind(*policy.created_at.as_datetime())
    .bind(*policy.updated_at.as_datetime())
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Rewrite every mutable column of a stored policy.
pub async fn update(
    conn: &mut PgConnection,
    tenant: &TenantId,
    policy: &Policy,
) -> Result<bool, FleetError> {
    let profile = profile_json(&policy.profile)?;
    let result = sqlx::query(
        "UPDATE policies SET name = $3, profile = $4, device_type = $5, priority = $6,
                compliance = $7, ownership_type = $8, active = $9, updated = $10, updated_at = $11
         WHERE tenant_id = $1 AND id = $2",
    )
    .bind(tenant.as_str())
    .bind(policy.id.0)
    .bind(&policy.name)
    .bind(&profile)
    .bind(policy.device_type().as_str())
    .bind(priority_param(policy.priority)?)
    .bind(policy.compliance.as_str())
    .bind(policy.ownership_type.map(|o| o.as_str()))
    .bind(policy.active)
    .bind(policy.updated)
    .bind(*policy.updated_at.as_datetime())
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete(conn: &mut PgConnection, tenant: &TenantId, id: PolicyId) -> Result<bool, FleetError> {
    let result = sqlx::query("DELETE FROM policies WHERE tenant_id = $1 AND id = $2")
        .bind(tenant.as_str())
        .bind(id.0)
        .execute(conn)
        .await
        .map_err(db_err)?;
    Ok(result.rows_affected() > 0)
}

/// Fetch a policy, optionally locking its row for the transaction.
pub async fn get(
    conn: &mut PgConnection,
    tenant: &TenantId,
    id: PolicyId,
    for_update: bool,
) -> Result<Option<Policy>, FleetError> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let sql = format!(
        "SELECT {POLICY_COLUMNS} FROM policies p WHERE p.tenant_id = $1 AND p.id = $2{lock}"
    );
    let row = sqlx::query_as::<_, PolicyRow>(&sql)
        .bind(tenant.as_str())
        .bind(id.0)
        .fetch_optional(conn)
        .await
        .map_err(db_err)?;
    row.map(|r| r.into_record(tenant)).transpose()
}

pub async fn list(conn: &mut PgConnection, tenant: &TenantId) -> Result<Vec<Policy>, FleetError> {
    let sql = format!(
        "SELECT {POLICY_COLUMNS} FROM policies p WHERE p.tenant_id = $1 ORDER BY p.priority, p.id"
    );
    let rows = sqlx::query_as::<_, PolicyRow>(&sql)
        .bind(tenant.as_str())
        .fetch_all(conn)
        .await
        .map_err(db_err)?;
    rows.into_iter().map(|r| r.into_record(tenant)).collect()
}

pub async fn list_of_type(
    conn: &mut PgConnection,
    tenant: &TenantId,
    device_type: &DeviceType,
) -> Result<Vec<Policy>, FleetError> {
    let sql = format!(
        "SELECT {POLICY_COLUMNS} FROM policies p
         WHERE p.tenant_id = $1 AND p.device_type = $2 ORDER BY p.priority, p.id"
    );
    let rows = sqlx::query_as::<_, PolicyRow>(&sql)
        .bind(tenant.as_str())
        .bind(device_type.as_str())
        .fetch_all(conn)
        .await
        .map_err(db_err)?;
    rows.into_iter().map(|r| r.into_record(tenant)).collect()
}

pub async fn count(conn: &mut PgConnection, tenant: &TenantId) -> Result<u64, FleetError> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM policies WHERE tenant_id = $1")
        .bind(tenant.as_str())
        .fetch_one(conn)
        .await
        .map_err(db_err)?;
    Ok(n.max(0) as u64)
}

// ── Scopes ───────────────────────────────────────────────────────────

fn scope_table(kind: ScopeKind) -> (&'static str, &'static str) {
    match kind {
        ScopeKind::Device => ("policy_device_scopes", "device_id"),
        ScopeKind::User => ("policy_user_scopes", "username"),
        ScopeKind::Role => ("policy_role_scopes", "role_name"),
        ScopeKind::DeviceType => ("policy_device_type_scopes", "device_type"),
    }
}

/// Insert one scope row. Returns false if it already existed.
pub async fn insert_scope(
    conn: &mut PgConnection,
    tenant: &TenantId,
    policy: PolicyId,
    scope: &PolicyScope,
) -> Result<bool, FleetError> {
    let (table, column) = scope_table(scope.kind());
    let sql = format!(
        "INSERT INTO {table} (tenant_id, policy_id, {column}) VALUES ($1, $2, $3)
         ON CONFLICT DO NOTHING"
    );
    let query = sqlx::query(&sql).bind(tenant.as_str()).bind(policy.0);
    let query = match scope {
        PolicyScope::Device(device) => query.bind(device.0),
        PolicyScope::User(name) | PolicyScope::Role(name) => query.bind(name.clone()),
        PolicyScope::DeviceType(t) => query.bind(t.as_str().to_string()),
    };
    let result = query.execute(conn).await.map_err(db_err)?;
    Ok(result.rows_affected() > 0)
}

/// Delete every scope row of `policy`, one table at a time.
pub async fn delete_scopes(
    conn: &mut PgConnection,
    tenant: &TenantId,
    policy: PolicyId,
) -> Result<u64, FleetError> {
    let mut removed = 0;
    for kind in [ScopeKind::Device, ScopeKind::User, ScopeKind::Role, ScopeKind::DeviceType] {
        let (table, _) = scope_table(kind);
        let sql = format!("DELETE FROM {table} WHERE tenant_id = $1 AND policy_id = $2");
        let result = sqlx::query(&sql)
            .bind(tenant.as_str())
            .bind(policy.0)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        removed += result.rows_affected();
    }
    Ok(removed)
}

pub async fn scopes(
    conn: &mut PgConnection,
    tenant: &TenantId,
    policy: PolicyId,
) -> Result<PolicyScopes, FleetError> {
    let mut scopes = PolicyScopes::default();
    let devices: Vec<Uuid> = sqlx::query_scalar(
        "SELECT device_id FROM policy_device_scopes WHERE tenant_id = $1 AND policy_id = $2",
    )
    .bind(tenant.as_str())
    .bind(policy.0)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;
    scopes
        .devices
        .extend(devices.into_iter().map(DeviceId::from_uuid));

    for kind in [ScopeKind::User, ScopeKind::Role, ScopeKind::DeviceType] {
        let (table, column) = scope_table(kind);
        let sql = format!("SELECT {column} FROM {table} WHERE tenant_id = $1 AND policy_id = $2");
        let values: Vec<String> = sqlx::query_scalar(&sql)
            .bind(tenant.as_str())
            .bind(policy.0)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;
        for value in values {
            let scope = match kind {
                ScopeKind::User => PolicyScope::User(value),
                ScopeKind::Role => PolicyScope::Role(value),
                _ => PolicyScope::DeviceType(
                    DeviceType::new(value).map_err(|e| corrupt("scope", e))?,
                ),
            };
            scopes.insert(scope);
        }
    }
    Ok(scopes)
}

/// Policies assigned through exactly `scope`.
pub async fn with_scope(
    conn: &mut PgConnection,
    tenant: &TenantId,
    scope: &PolicyScope,
) -> Result<Vec<Policy>, FleetError> {
    let (table, column) = scope_table(scope.kind());
    let sql = format!(
        "SELECT {POLICY_COLUMNS} FROM policies p
         WHERE p.tenant_id = $1 AND EXISTS (
             SELECT 1 FROM {table} s
             WHERE s.tenant_id = p.tenant_id AND s.policy_id = p.id AND s.{column} = $2)
         ORDER BY p.priority, p.id"
    );
    let query = sqlx::query_as::<_, PolicyRow>(&sql).bind(tenant.as_str());
    let query = match scope {
        PolicyScope::Device(device) => query.bind(device.0),
        PolicyScope::User(name) | PolicyScope::Role(name) => query.bind(name.clone()),
        PolicyScope::DeviceType(t) => query.bind(t.as_str().to_string()),
    };
    let rows = query.fetch_all(conn).await.map_err(db_err)?;
    rows.into_iter().map(|r| r.into_record(tenant)).collect()
}

/// Every (policy, scope kind) reaching the device described by `query`.
pub async fn candidates(
    conn: &mut PgConnection,
    tenant: &TenantId,
    query: &CandidateQuery<'_>,
) -> Result<Vec<Candidate>, FleetError> {
    let sql = format!(
        "SELECT {POLICY_COLUMNS}, 'device' AS scope FROM policies p
         WHERE p.tenant_id = $1 AND EXISTS (SELECT 1 FROM policy_device_scopes s
               WHERE s.tenant_id = p.tenant_id AND s.policy_id = p.id AND s.device_id = $2)
         UNION ALL
         SELECT {POLICY_COLUMNS}, 'user' AS scope FROM policies p
         WHERE p.tenant_id = $1 AND EXISTS (SELECT 1 FROM policy_user_scopes s
               WHERE s.tenant_id = p.tenant_id AND s.policy_id = p.id AND s.username = $3)
         UNION ALL
         SELECT {POLICY_COLUMNS}, 'role' AS scope FROM policies p
         WHERE p.tenant_id = $1 AND EXISTS (SELECT 1 FROM policy_role_scopes s
               WHERE s.tenant_id = p.tenant_id AND s.policy_id = p.id AND s.role_name = ANY($4))
         UNION ALL
         SELECT {POLICY_COLUMNS}, 'device_type' AS scope FROM policies p
         WHERE p.tenant_id = $1 AND EXISTS (SELECT 1 FROM policy_device_type_scopes s
               WHERE s.tenant_id = p.tenant_id AND s.policy_id = p.id AND s.device_type = $5)"
    );
    let rows = sqlx::query_as::<_, CandidateRow>(&sql)
        .bind(tenant.as_str())
        .bind(query.device_id.0)
        .bind(query.user)
        .bind(query.roles)
        .bind(query.device_type.as_str())
        .fetch_all(conn)
        .await
        .map_err(db_err)?;
    rows.into_iter()
        .map(|row| {
            let scope = match row.scope.as_str() {
                "device" => ScopeKind::Device,
                "user" => ScopeKind::User,
                "role" => ScopeKind::Role,
                _ => ScopeKind::DeviceType,
            };
            Ok(Candidate {
                policy: row.policy.into_record(tenant)?,
                scope,
            })
        })
        .collect()
}

fn profile_json(profile: &Profile) -> Result<serde_json::Value, FleetError> {
    serde_json::to_value(profile).map_err(|e| FleetError::validation(format!("profile: {e}")))
}

fn priority_param(priority: u32) -> Result<i32, FleetError> {
    i32::try_from(priority).map_err(|_| FleetError::validation(format!("priority {priority} out of range")))
}

/// Internal row type for SQLx mapping.
#[derive(sqlx::FromRow)]
struct PolicyRow {
    id: Uuid,
    name: String,
    profile: serde_json::Value,
    priority: i32,
    compliance: String,
    ownership_type: Option<String>,
    active: bool,
    updated: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PolicyRow {
    fn into_record(self, tenant: &TenantId) -> Result<Policy, FleetError> {
        let profile: Profile =
            serde_json::from_value(self.profile).map_err(|e| corrupt("policy", e))?;
        let compliance: ComplianceMode =
            self.compliance.parse().map_err(|e| corrupt("policy", e))?;
        let ownership_type = self
            .ownership_type
            .map(|o| o.parse::<OwnershipType>())
            .transpose()
            .map_err(|e| corrupt("policy", e))?;
        Ok(Policy {
            id: PolicyId::from_uuid(self.id),
            tenant: tenant.clone(),
            name: self.name,
            profile,
            priority: u32::try_from(self.priority).map_err(|e| corrupt("policy", e))?,
            compliance,
            ownership_type,
            active: self.active,
            updated: self.updated,
            created_at: Timestamp::from_utc(self.created_at),
            updated_at: Timestamp::from_utc(self.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct CandidateRow {
    #[sqlx(flatten)]
    policy: PolicyRow,
    scope: String,
}
