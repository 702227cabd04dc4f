//! # fleet-api — HTTP Surface of the Fleet Engine
//!
//! ## API Surface
//!
//! | Prefix                | Module                       | Domain                     |
//! |-----------------------|------------------------------|----------------------------|
//! | `/v1/devices/*`       | [`routes::devices`]          | Enrollment, effective policy |
//! | `/v1/policies/*`      | [`routes::policies`]         | Policy administration      |
//! | `/v1/profiles/*`      | [`routes::policies`]         | Profiles carried by policies |
//! | `/v1/roles/*`         | [`routes::devices`]          | Devices of role members    |
//! | `/v1/recomputation/*` | [`routes::recomputation`]    | Passes and scheduling      |
//! | `/health/*`           | this module                  | Liveness and readiness     |
//!
//! Every `/v1` route acts on the tenant named by the `x-tenant-id` header.
//! Errors use one JSON shape, see [`error::AppError`].

pub mod error;
pub mod extractors;
pub mod routes;
pub mod state;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Router;
use tower_http::trace::TraceLayer;

pub use error::AppError;
pub use state::{AppConfig, AppState};

/// Assemble the application router.
pub fn app(state: AppState) -> Router {
    let api = Router::new()
        .merge(routes::devices::router())
        .merge(routes::policies::router())
        .merge(routes::recomputation::router())
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024));

    let health = Router::new()
        .route("/health/liveness", axum::routing::get(liveness))
        .route("/health/readiness", axum::routing::get(readiness));

    Router::new()
        .merge(health)
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn liveness() -> &'static str {
    "ok"
}

/// Readiness check: 200 "ready" when the store answers, 503 otherwise.
async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.store().ping().await {
        Ok(()) => (StatusCode::OK, "ready").into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "store health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "store unreachable").into_response()
        }
    }
}
