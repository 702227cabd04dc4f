//! # Recomputation Routes
//!
//! - `POST   /v1/recomputation` — Run one pass for the caller's tenant now
//! - `GET    /v1/recomputation/pending` — Dirty ledger entries
//! - `GET    /v1/recomputation/schedule` — Current schedule, if any
//! - `PUT    /v1/recomputation/schedule` — Start or reschedule periodic passes
//! - `DELETE /v1/recomputation/schedule` — Stop periodic passes

use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use fleet_engine::PassReport;
use fleet_policy::LedgerEntry;

use crate::error::AppError;
use crate::extractors::{extract_json, Tenant};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleRequest {
    /// Seconds between passes. Defaults to the engine's configured interval.
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScheduleResponse {
    pub running: bool,
    pub interval_secs: Option<u64>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/recomputation", post(run_pass))
        .route("/v1/recomputation/pending", get(pending))
        .route(
            "/v1/recomputation/schedule",
            get(get_schedule).put(put_schedule).delete(delete_schedule),
        )
}

async fn run_pass(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
) -> Result<Json<PassReport>, AppError> {
    Ok(Json(state.engine.run_recomputation_pass(&tenant).await?))
}

async fn pending(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
) -> Result<Json<Vec<LedgerEntry>>, AppError> {
    Ok(Json(state.engine.ledger().pending(&tenant).await?))
}

async fn get_schedule(State(state): State<AppState>, Tenant(tenant): Tenant) -> Json<ScheduleResponse> {
    let scheduler = state.engine.scheduler();
    Json(ScheduleResponse {
        running: scheduler.is_running(&tenant),
        interval_secs: scheduler.interval(&tenant).map(|d| d.as_secs()),
    })
}

async fn put_schedule(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    body: Result<Json<ScheduleRequest>, JsonRejection>,
) -> Result<Json<ScheduleResponse>, AppError> {
    let request = extract_json(body)?;
    let interval = request
        .interval_secs
        .map(Duration::from_secs)
        .unwrap_or(state.engine.config().recompute_interval);
    let scheduler = state.engine.scheduler();
    if scheduler.interval(&tenant).is_some() {
        scheduler.update(&tenant, interval)?;
    } else {
        scheduler.start(&tenant, interval)?;
    }
    Ok(Json(ScheduleResponse {
        running: true,
        interval_secs: Some(interval.as_secs()),
    }))
}

async fn delete_schedule(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
) -> Result<StatusCode, AppError> {
    if state.engine.scheduler().stop(&tenant) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!(
            "no recomputation schedule for tenant {tenant}"
        )))
    }
}
