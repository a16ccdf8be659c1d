//! Device registration and pairing endpoints.
//!
//! Elders issue short-lived codes out of band; a guardian redeems one to
//! become paired. Routing only ever reads the resulting pairings.

use crate::error::StorageError;
use crate::server::LinkRelay;
use crate::storage::{Device, IssuedCode, Pairing};
use axum::extract::rejection::JsonRejection;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use kinlink_types::{DeviceId, Role};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Body of `POST /api/devices`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceRequest {
    /// Device to register.
    pub device_id: String,
    /// `guardian` or `elder`.
    #[serde(rename = "type")]
    pub role: String,
}

/// Body of `POST /api/pairing/codes`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueCodeRequest {
    /// Elder the code will pair with.
    pub elder_id: String,
}

/// Body of `POST /api/pairing/redeem`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemCodeRequest {
    /// Guardian redeeming the code.
    pub guardian_id: String,
    /// Code shown on the elder's device.
    pub code: String,
}

/// Response of `GET /api/pairings/:deviceId`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingList {
    /// Device whose pairings are listed.
    pub device_id: DeviceId,
    /// Pairings on either side.
    pub pairings: Vec<Pairing>,
}

/// API failure, rendered as `{"error": ...}` with a matching status.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Request body or path was unusable.
    #[error("{0}")]
    BadRequest(String),

    /// Nothing to act on.
    #[error("{0}")]
    NotFound(String),

    /// Redemption attempts exhausted for this guardian.
    #[error("Too many redemption attempts")]
    RateLimited,

    /// Store operation failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Storage(e) => match e {
                StorageError::DeviceNotFound { .. } => StatusCode::NOT_FOUND,
                StorageError::RoleMismatch { .. } => StatusCode::CONFLICT,
                StorageError::InvalidCode => StatusCode::BAD_REQUEST,
                StorageError::CodeSpaceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
                StorageError::Database(_) | StorageError::Corrupt(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("API request failed: {}", self);
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn device_id(raw: String, field: &str) -> Result<DeviceId, ApiError> {
    DeviceId::new(raw).map_err(|_| ApiError::BadRequest(format!("{} must not be empty", field)))
}

/// `POST /api/devices`
pub async fn register_device(
    Extension(relay): Extension<Arc<LinkRelay>>,
    body: Result<Json<RegisterDeviceRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Device>), ApiError> {
    let Json(request) = body?;
    let id = device_id(request.device_id, "deviceId")?;
    let role: Role = request
        .role
        .parse()
        .map_err(|_| ApiError::BadRequest("type must be guardian or elder".into()))?;

    let device = relay.storage().register_device(&id, role).await?;
    Ok((StatusCode::CREATED, Json(device)))
}

/// `POST /api/pairing/codes`
pub async fn issue_code(
    Extension(relay): Extension<Arc<LinkRelay>>,
    body: Result<Json<IssueCodeRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<IssuedCode>), ApiError> {
    let Json(request) = body?;
    let elder_id = device_id(request.elder_id, "elderId")?;
    let ttl = Duration::from_secs(relay.config().pairing.code_ttl_secs);

    let issued = relay.storage().issue_code(&elder_id, ttl).await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

/// `POST /api/pairing/redeem`
pub async fn redeem_code(
    Extension(relay): Extension<Arc<LinkRelay>>,
    body: Result<Json<RedeemCodeRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Pairing>), ApiError> {
    let Json(request) = body?;
    let guardian_id = device_id(request.guardian_id, "guardianId")?;

    if relay.rate_limits().check_redeem(guardian_id.as_str()).is_err() {
        relay.metrics().rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("Redeem rate limit hit for guardian {}", guardian_id);
        return Err(ApiError::RateLimited);
    }

    let pairing = relay
        .storage()
        .redeem_code(&guardian_id, request.code.trim())
        .await?;
    Ok((StatusCode::CREATED, Json(pairing)))
}

/// `GET /api/pairings/:deviceId`
pub async fn list_pairings(
    Extension(relay): Extension<Arc<LinkRelay>>,
    Path(raw_id): Path<String>,
) -> Result<Json<PairingList>, ApiError> {
    let id = device_id(raw_id, "deviceId")?;
    let pairings = relay.storage().list_pairings(&id).await?;
    Ok(Json(PairingList {
        device_id: id,
        pairings,
    }))
}

/// `DELETE /api/pairings/:guardianId/:elderId`
///
/// Takes effect on the next routed message; live connections stay open.
pub async fn remove_pairing(
    Extension(relay): Extension<Arc<LinkRelay>>,
    Path((guardian, elder)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let guardian_id = device_id(guardian, "guardianId")?;
    let elder_id = device_id(elder, "elderId")?;

    if relay.storage().remove_pairing(&guardian_id, &elder_id).await? {
        tracing::info!("Unpaired guardian {} from elder {}", guardian_id, elder_id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound("Pairing not found".into()))
    }
}
