//! # Device Routes
//!
//! - `POST   /v1/devices` — Enroll (or re-enroll) a device
//! - `GET    /v1/devices` — List devices (`type`, `status`, `owner`, `name` filters)
//! - `GET    /v1/devices/:type/:id` — Get a device
//! - `PUT    /v1/devices/:type/:id` — Modify the current enrollment
//! - `DELETE /v1/devices/:type/:id` — Disenroll
//! - `PUT    /v1/devices/:type/:id/status` — Administrative status change
//! - `GET    /v1/devices/:type/:id/history` — Enrollment history
//! - `GET    /v1/devices/:type/:id/resolution` — Resolve on demand
//! - `GET    /v1/devices/:type/:id/effective-policy` — Cached effective policy
//! - `POST   /v1/devices/:type/:id/effective-policy/applied` — Acknowledge receipt
//! - `GET    /v1/roles/:role/devices` — Devices owned by members of a role

use std::collections::BTreeMap;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use fleet_core::{DeviceId, PolicyId, Timestamp};
use fleet_engine::{EnrollAction, Enrolled};
use fleet_policy::{EffectivePolicyRecord, Policy, PolicySnapshot, ScopeKind};
use fleet_state::{Device, DeviceFilter, EnrollmentInfo, EnrollmentRequest, EnrollmentStatus, OwnershipType};

use crate::error::AppError;
use crate::extractors::{device_identifier, extract_json, extract_query, Tenant};
use crate::state::AppState;

// ── Request / response types ─────────────────────────────────────────

/// Body of `PUT /v1/devices/:type/:id`. The identity comes from the path.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModifyDeviceRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    pub owner: String,
    pub ownership: OwnershipType,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusRequest {
    pub status: EnrollmentStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceListResponse {
    pub devices: Vec<Device>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResolutionResponse {
    pub policy: Policy,
    pub scope: ScopeKind,
}

/// A cached effective policy with its snapshot decoded.
#[derive(Debug, Serialize, Deserialize)]
pub struct EffectivePolicyResponse {
    pub device_id: DeviceId,
    pub policy_id: PolicyId,
    pub snapshot: PolicySnapshot,
    pub snapshot_digest: String,
    pub revision: u64,
    pub applied: bool,
    pub applied_time: Option<Timestamp>,
    pub created_time: Timestamp,
    pub updated_time: Timestamp,
}

impl TryFrom<EffectivePolicyRecord> for EffectivePolicyResponse {
    type Error = AppError;

    fn try_from(record: EffectivePolicyRecord) -> Result<Self, Self::Error> {
        let snapshot = record.decode_snapshot().map_err(|e| {
            AppError::Internal(format!(
                "stored snapshot of {} does not decode: {e}",
                record.device_id
            ))
        })?;
        Ok(Self {
            device_id: record.device_id,
            policy_id: record.policy_id,
            snapshot,
            snapshot_digest: record.snapshot_digest,
            revision: record.revision,
            applied: record.applied,
            applied_time: record.applied_time,
            created_time: record.created_time,
            updated_time: record.updated_time,
        })
    }
}

// ── Router ───────────────────────────────────────────────────────────

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/devices", post(enroll).get(list_devices))
        .route(
            "/v1/devices/:device_type/:id",
            get(get_device).put(modify_device).delete(disenroll),
        )
        .route("/v1/devices/:device_type/:id/status", put(set_status))
        .route("/v1/devices/:device_type/:id/history", get(history))
        .route("/v1/devices/:device_type/:id/resolution", get(resolve))
        .route(
            "/v1/devices/:device_type/:id/effective-policy",
            get(effective_policy),
        )
        .route(
            "/v1/devices/:device_type/:id/effective-policy/applied",
            post(mark_applied),
        )
        .route("/v1/roles/:role/devices", get(list_role_devices))
}

// ── Handlers ─────────────────────────────────────────────────────────

/// POST /v1/devices — 201 for a new device, 200 for a re-enrollment.
async fn enroll(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    body: Result<Json<EnrollmentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Enrolled>), AppError> {
    let request = extract_json(body)?;
    let enrolled = state.engine.enroll(&tenant, &request).await?;
    let status = if enrolled.action == EnrollAction::Created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(enrolled)))
}

async fn list_devices(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    query: Result<Query<DeviceFilter>, QueryRejection>,
) -> Result<Json<DeviceListResponse>, AppError> {
    let filter = extract_query(query)?;
    let devices = state.engine.list_devices(&tenant, &filter).await?;
    let total = devices.len();
    Ok(Json(DeviceListResponse { devices, total }))
}

async fn list_role_devices(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(role): Path<String>,
) -> Result<Json<DeviceListResponse>, AppError> {
    let devices = state.engine.list_devices_by_role(&tenant, &role).await?;
    let total = devices.len();
    Ok(Json(DeviceListResponse { devices, total }))
}

async fn get_device(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path((device_type, id)): Path<(String, String)>,
) -> Result<Json<Device>, AppError> {
    let identifier = device_identifier(&device_type, &id)?;
    Ok(Json(state.engine.get_device(&tenant, &identifier).await?))
}

async fn modify_device(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path((device_type, id)): Path<(String, String)>,
    body: Result<Json<ModifyDeviceRequest>, JsonRejection>,
) -> Result<Json<Device>, AppError> {
    let body = extract_json(body)?;
    let request = EnrollmentRequest {
        identifier: device_identifier(&device_type, &id)?,
        name: body.name,
        description: body.description,
        properties: body.properties,
        owner: body.owner,
        ownership: body.ownership,
    };
    Ok(Json(state.engine.modify_enrollment(&tenant, &request).await?))
}

async fn disenroll(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path((device_type, id)): Path<(String, String)>,
) -> Result<Json<Device>, AppError> {
    let identifier = device_identifier(&device_type, &id)?;
    Ok(Json(state.engine.disenroll(&tenant, &identifier).await?))
}

async fn set_status(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path((device_type, id)): Path<(String, String)>,
    body: Result<Json<StatusRequest>, JsonRejection>,
) -> Result<Json<Device>, AppError> {
    let StatusRequest { status } = extract_json(body)?;
    let identifier = device_identifier(&device_type, &id)?;
    Ok(Json(state.engine.set_status(&tenant, &identifier, status).await?))
}

async fn history(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path((device_type, id)): Path<(String, String)>,
) -> Result<Json<Vec<EnrollmentInfo>>, AppError> {
    let identifier = device_identifier(&device_type, &id)?;
    Ok(Json(state.engine.enrollment().history(&tenant, &identifier).await?))
}

async fn resolve(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path((device_type, id)): Path<(String, String)>,
) -> Result<Json<ResolutionResponse>, AppError> {
    let identifier = device_identifier(&device_type, &id)?;
    let resolved = state.engine.resolve(&tenant, &identifier).await?;
    Ok(Json(ResolutionResponse {
        policy: resolved.policy,
        scope: resolved.scope,
    }))
}

async fn effective_policy(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path((device_type, id)): Path<(String, String)>,
) -> Result<Json<EffectivePolicyResponse>, AppError> {
    let identifier = device_identifier(&device_type, &id)?;
    let record = state.engine.get_effective_policy(&tenant, &identifier).await?;
    Ok(Json(record.try_into()?))
}

async fn mark_applied(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path((device_type, id)): Path<(String, String)>,
) -> Result<Json<EffectivePolicyResponse>, AppError> {
    let identifier = device_identifier(&device_type, &id)?;
    let record = state.engine.mark_applied(&tenant, &identifier).await?;
    Ok(Json(record.try_into()?))
}
