//! # Policy Routes
//!
//! - `POST   /v1/policies` — Create a policy (priority assigned by the store)
//! - `GET    /v1/policies` — List policies by priority
//! - `PUT    /v1/policies/priorities` — Bulk priority reassignment
//! - `GET    /v1/policies/:policy_id` — Get a policy
//! - `PUT    /v1/policies/:policy_id` — Update name, profile, compliance, ownership
//! - `DELETE /v1/policies/:policy_id` — Delete a policy and its scopes
//! - `POST   /v1/policies/:policy_id/activate`
//! - `POST   /v1/policies/:policy_id/deactivate`
//! - `GET    /v1/policies/:policy_id/scopes` — Current scope assignments
//! - `POST   /v1/policies/:policy_id/scopes` — Assign a batch of scopes
//! - `GET    /v1/profiles` — Profiles carried by the tenant's policies
//! - `GET    /v1/profiles/:profile_id` — Get a profile

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use fleet_core::{PolicyId, ProfileId};
use fleet_policy::{Policy, PolicyDraft, PolicyScope, PolicyScopes, PriorityChange, Profile};

use crate::error::AppError;
use crate::extractors::{extract_json, Tenant};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrioritiesRequest {
    pub priorities: Vec<PriorityChange>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssignScopesRequest {
    pub scopes: Vec<PolicyScope>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AssignScopesResponse {
    /// Assignments that were not already present.
    pub inserted: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PolicyListResponse {
    pub policies: Vec<Policy>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProfileListResponse {
    pub profiles: Vec<Profile>,
    pub total: usize,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/policies", post(create_policy).get(list_policies))
        .route("/v1/policies/priorities", put(update_priorities))
        .route(
            "/v1/policies/:policy_id",
            get(get_policy).put(update_policy).delete(delete_policy),
        )
        .route("/v1/policies/:policy_id/activate", post(activate_policy))
        .route("/v1/policies/:policy_id/deactivate", post(deactivate_policy))
        .route(
            "/v1/policies/:policy_id/scopes",
            get(list_scopes).post(assign_scopes),
        )
        .route("/v1/profiles", get(list_profiles))
        .route("/v1/profiles/:profile_id", get(get_profile))
}

fn policy_id(raw: &str) -> Result<PolicyId, AppError> {
    Ok(raw.parse()?)
}

async fn create_policy(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    body: Result<Json<PolicyDraft>, JsonRejection>,
) -> Result<(StatusCode, Json<Policy>), AppError> {
    let draft = extract_json(body)?;
    let policy = state.engine.create_policy(&tenant, &draft).await?;
    Ok((StatusCode::CREATED, Json(policy)))
}

async fn list_policies(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
) -> Result<Json<PolicyListResponse>, AppError> {
    let policies = state.engine.list_policies(&tenant).await?;
    let total = policies.len();
    Ok(Json(PolicyListResponse { policies, total }))
}

async fn update_priorities(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    body: Result<Json<PrioritiesRequest>, JsonRejection>,
) -> Result<Json<Vec<Policy>>, AppError> {
    let request = extract_json(body)?;
    let touched = state
        .engine
        .update_policy_priorities(&tenant, &request.priorities)
        .await?;
    Ok(Json(touched))
}

async fn get_policy(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> Result<Json<Policy>, AppError> {
    Ok(Json(state.engine.get_policy(&tenant, policy_id(&id)?).await?))
}

async fn update_policy(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
    body: Result<Json<PolicyDraft>, JsonRejection>,
) -> Result<Json<Policy>, AppError> {
    let draft = extract_json(body)?;
    Ok(Json(state.engine.update_policy(&tenant, policy_id(&id)?, &draft).await?))
}

async fn delete_policy(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.engine.delete_policy(&tenant, policy_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn activate_policy(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> Result<Json<Policy>, AppError> {
    Ok(Json(state.engine.activate_policy(&tenant, policy_id(&id)?).await?))
}

async fn deactivate_policy(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> Result<Json<Policy>, AppError> {
    Ok(Json(state.engine.deactivate_policy(&tenant, policy_id(&id)?).await?))
}

async fn list_scopes(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> Result<Json<PolicyScopes>, AppError> {
    Ok(Json(state.engine.policies().scopes(&tenant, policy_id(&id)?).await?))
}

async fn assign_scopes(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
    body: Result<Json<AssignScopesRequest>, JsonRejection>,
) -> Result<Json<AssignScopesResponse>, AppError> {
    let request = extract_json(body)?;
    let inserted = state
        .engine
        .assign_scope(&tenant, policy_id(&id)?, &request.scopes)
        .await?;
    Ok(Json(AssignScopesResponse { inserted }))
}

async fn list_profiles(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
) -> Result<Json<ProfileListResponse>, AppError> {
    let profiles = state.engine.list_profiles(&tenant).await?;
    let total = profiles.len();
    Ok(Json(ProfileListResponse { profiles, total }))
}

async fn get_profile(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> Result<Json<Profile>, AppError> {
    let id: ProfileId = id.parse()?;
    Ok(Json(state.engine.get_profile(&tenant, id).await?))
}
