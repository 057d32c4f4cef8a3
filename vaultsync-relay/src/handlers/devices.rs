//! Device registration and management handlers.

use crate::auth::ClientIdentity;
use crate::error::RelayError;
use crate::server::AppState;
use crate::storage::Registration;
use axum::extract::{Path, State};
use axum::http::Extensions;
use axum::Json;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Deserialize)]
pub struct RegisterDeviceRequest {
    pub device_id: Uuid,
    pub user_id: Uuid,
    pub device_name: String,
    pub device_type: String,
    pub public_key: String, // base64
}

#[derive(Serialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
    pub registered_at: i64,
    pub revoked: bool,
    /// Whether the device currently holds a live update stream.
    pub live: bool,
}

/// A further device, enrolled by an already registered device of the owner.
#[derive(Deserialize)]
pub struct EnrollDeviceRequest {
    pub device_id: Uuid,
    pub device_name: String,
    pub device_type: String,
    pub public_key: String, // base64
}

/// Register the first device of a new owner.
pub async fn register_device(
    State(state): State<AppState>,
    Json(req): Json<RegisterDeviceRequest>,
) -> Result<Json<serde_json::Value>, RelayError> {
    let public_key = decode_public_key(&req.public_key)?;

    let registration = state.storage.register_device(
        req.device_id,
        req.user_id,
        &req.device_name,
        &req.device_type,
        &public_key,
        Utc::now().timestamp(),
    )?;

    if registration == Registration::Created {
        tracing::info!(device_id = %req.device_id, user_id = %req.user_id, "Device registered");
    }
    Ok(Json(serde_json::json!({"status": registration_status(registration)})))
}

/// Add a device to the caller's owner.
pub async fn enroll_device(
    State(state): State<AppState>,
    extensions: Extensions,
    Json(req): Json<EnrollDeviceRequest>,
) -> Result<Json<serde_json::Value>, RelayError> {
    let identity = ClientIdentity::from_extensions(&extensions)?;
    let public_key = decode_public_key(&req.public_key)?;

    let registration = state.storage.enroll_device(
        req.device_id,
        identity.user_id,
        &req.device_name,
        &req.device_type,
        &public_key,
        Utc::now().timestamp(),
    )?;

    if registration == Registration::Created {
        tracing::info!(
            device_id = %req.device_id,
            user_id = %identity.user_id,
            enrolled_by = %identity.device_id,
            "Device enrolled"
        );
    }
    Ok(Json(serde_json::json!({"status": registration_status(registration)})))
}

fn decode_public_key(encoded: &str) -> Result<Vec<u8>, RelayError> {
    let public_key = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| RelayError::BadRequest(format!("Invalid public key: {}", e)))?;

    if public_key.len() != 32 {
        return Err(RelayError::BadRequest(
            "Public key must be 32 bytes".to_string(),
        ));
    }
    Ok(public_key)
}

fn registration_status(registration: Registration) -> &'static str {
    match registration {
        Registration::Created => "registered",
        Registration::Unchanged => "unchanged",
    }
}

pub async fn list_devices(
    State(state): State<AppState>,
    extensions: Extensions,
) -> Result<Json<Vec<DeviceInfo>>, RelayError> {
    let identity = ClientIdentity::from_extensions(&extensions)?;

    let devices = state
        .storage
        .list_devices(identity.user_id)?
        .into_iter()
        .map(|device| {
            let live = Uuid::parse_str(&device.device_id)
                .is_ok_and(|id| state.controller.is_subscribed(identity.user_id, id));
            DeviceInfo {
                device_id: device.device_id,
                device_name: device.device_name,
                device_type: device.device_type,
                registered_at: device.registered_at,
                revoked: device.revoked,
                live,
            }
        })
        .collect();

    Ok(Json(devices))
}

/// Revoke a device of the caller's owner and drop its live stream.
pub async fn revoke_device(
    State(state): State<AppState>,
    Path(target_id): Path<String>,
    extensions: Extensions,
) -> Result<Json<serde_json::Value>, RelayError> {
    let identity = ClientIdentity::from_extensions(&extensions)?;
    let target = Uuid::parse_str(&target_id)
        .map_err(|_| RelayError::BadRequest("Invalid device ID".to_string()))?;

    state
        .storage
        .revoke_device(identity.user_id, target, Utc::now().timestamp())?;
    let disconnected = state.controller.disconnect(identity.user_id, target);

    tracing::info!(
        device_id = %target,
        revoked_by = %identity.device_id,
        disconnected,
        "Device revoked"
    );

    Ok(Json(serde_json::json!({
        "status": "revoked",
        "disconnected": disconnected,
    })))
}
