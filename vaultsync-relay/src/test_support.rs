//! Helpers shared by the relay's HTTP tests.

use crate::auth::sign_request;
use crate::config::RelayConfig;
use crate::server::AppState;
use crate::storage::RelayStorage;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use base64::Engine;
use ed25519_dalek::SigningKey;
use tower::ServiceExt;
use uuid::Uuid;

/// A device with a deterministic signing key.
pub struct TestDevice {
    pub key: SigningKey,
    pub device_id: Uuid,
    pub user_id: Uuid,
}

impl TestDevice {
    pub fn new(user_id: Uuid, seed: u8) -> Self {
        Self {
            key: SigningKey::from_bytes(&[seed; 32]),
            device_id: Uuid::new_v4(),
            user_id,
        }
    }

    pub fn auth_header(&self, method: &str, path: &str, body: &[u8]) -> String {
        sign_request(&self.key, self.device_id, method, path, body)
    }
}

pub fn test_state() -> AppState {
    let config = RelayConfig {
        in_memory_secrets: true,
        ..RelayConfig::default()
    };
    AppState::new(RelayStorage::in_memory().unwrap(), config).unwrap()
}

pub async fn register(app: &Router, device: &TestDevice) {
    let body = serde_json::json!({
        "device_id": device.device_id,
        "user_id": device.user_id,
        "device_name": "test device",
        "device_type": "desktop",
        "public_key": base64::engine::general_purpose::STANDARD
            .encode(device.key.verifying_key().to_bytes()),
    });

    let response = app
        .clone()
        .oneshot(
            Request::post("/api/v1/devices/register")
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

/// Add `device` to `sponsor`'s owner.
pub async fn enroll(app: &Router, sponsor: &TestDevice, device: &TestDevice) {
    assert_eq!(sponsor.user_id, device.user_id);
    let body = serde_json::json!({
        "device_id": device.device_id,
        "device_name": "enrolled device",
        "device_type": "mobile",
        "public_key": base64::engine::general_purpose::STANDARD
            .encode(device.key.verifying_key().to_bytes()),
    });

    let response = app
        .clone()
        .oneshot(signed(
            sponsor,
            "POST",
            "/api/v1/devices/enroll",
            body.to_string().into_bytes(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

pub fn signed(device: &TestDevice, method: &str, path: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(path)
        .header("Authorization", device.auth_header(method, path, &body))
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
