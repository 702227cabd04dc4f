//! # Custom Extractors
//!
//! The tenant header extractor and helpers that turn Axum rejections into
//! [`AppError`] so every failure shares one response shape.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use axum::Json;

use fleet_core::{DeviceIdentifier, DeviceType, TenantId};

use crate::error::AppError;

/// Header carrying the caller's tenant.
pub const TENANT_HEADER: &str = "x-tenant-id";

/// The tenant a request acts on, taken from `x-tenant-id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant(pub TenantId);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Tenant {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(TENANT_HEADER)
            .ok_or_else(|| AppError::BadRequest(format!("missing {TENANT_HEADER} header")))?
            .to_str()
            .map_err(|_| AppError::BadRequest(format!("{TENANT_HEADER} is not valid ASCII")))?;
        Ok(Self(TenantId::new(raw)?))
    }
}

/// Extract a JSON body, mapping deserialization errors to [`AppError::BadRequest`].
pub fn extract_json<T>(result: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    result
        .map(|Json(v)| v)
        .map_err(|err| AppError::BadRequest(err.body_text()))
}

pub fn extract_query<T>(result: Result<Query<T>, QueryRejection>) -> Result<T, AppError> {
    result
        .map(|Query(v)| v)
        .map_err(|err| AppError::BadRequest(err.body_text()))
}

/// Build a device identifier from the `/{type}/{identifier}` path pair.
pub fn device_identifier(device_type: &str, id: &str) -> Result<DeviceIdentifier, AppError> {
    let device_type = DeviceType::new(device_type)?;
    Ok(DeviceIdentifier::new(id, device_type)?)
}
