//! Ed25519 auth middleware for the relay server.
//!
//! Every authenticated request carries
//! `Authorization: VaultSync-Ed25519 <device_id>:<unix_ts>:<nonce>:<sig_b64>`
//! where the signature covers `METHOD\nPATH\nTS\nNONCE\nhex(sha256(body))`.

use crate::error::RelayError;
use crate::server::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Extensions, Request};
use axum::middleware::Next;
use axum::response::Response;
use base64::Engine;
use chrono::Utc;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const AUTH_SCHEME: &str = "VaultSync-Ed25519";

/// The authenticated caller: a registered device acting for its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_id: Uuid,
    /// Doubles as the sync client id.
    pub device_id: Uuid,
}

impl ClientIdentity {
    pub fn from_extensions(extensions: &Extensions) -> Result<Self, RelayError> {
        extensions
            .get::<ClientIdentity>()
            .copied()
            .ok_or_else(|| RelayError::Auth("No client identity".to_string()))
    }
}

#[derive(Debug)]
struct AuthHeader {
    device_id: Uuid,
    timestamp: i64,
    nonce: String,
    signature: Vec<u8>,
}

/// Auth middleware: verifies the Ed25519 signature on every authenticated request.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, RelayError> {
    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RelayError::Auth("Missing Authorization header".to_string()))?
        .to_string();
    let header = parse_auth_header(&auth_header)?;

    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();

    // Read body for signature verification
    let (parts, body) = request.into_parts();
    let body_bytes = axum::body::to_bytes(body, state.config.max_payload_size)
        .await
        .map_err(|e| RelayError::BadRequest(format!("Failed to read body: {}", e)))?;

    let now = Utc::now().timestamp();
    if (now - header.timestamp).abs() > state.config.nonce_window_secs {
        return Err(RelayError::Auth("Request expired".to_string()));
    }

    let device = state
        .storage
        .device_key(header.device_id)?
        .ok_or_else(|| RelayError::Auth("Unknown device".to_string()))?;
    if device.revoked {
        return Err(RelayError::Auth("Device revoked".to_string()));
    }

    let message = signing_message(&method, &path, header.timestamp, &header.nonce, &body_bytes);
    verify_signature(&device.public_key, message.as_bytes(), &header.signature)?;

    if !state.rate_limiter.check(header.device_id) {
        tracing::warn!(device_id = %header.device_id, "Rate limit exceeded");
        return Err(RelayError::RateLimited);
    }

    if !state
        .storage
        .record_nonce(&header.nonce, header.device_id, now)?
    {
        return Err(RelayError::Auth("Nonce reused".to_string()));
    }

    // Reconstruct request with the identity in extensions and original body
    let mut request = Request::from_parts(parts, Body::from(body_bytes));
    request.extensions_mut().insert(ClientIdentity {
        user_id: device.user_id,
        device_id: header.device_id,
    });

    Ok(next.run(request).await)
}

/// The exact text a client signs.
pub fn signing_message(method: &str, path: &str, timestamp: i64, nonce: &str, body: &[u8]) -> String {
    let body_hash = hex::encode(Sha256::digest(body));
    format!(
        "{}\n{}\n{}\n{}\n{}",
        method, path, timestamp, nonce, body_hash
    )
}

fn parse_auth_header(header: &str) -> Result<AuthHeader, RelayError> {
    let stripped = header
        .strip_prefix(AUTH_SCHEME)
        .and_then(|rest| rest.strip_prefix(' '))
        .ok_or_else(|| RelayError::Auth("Invalid auth scheme".to_string()))?;

    let parts: Vec<&str> = stripped.splitn(4, ':').collect();
    if parts.len() != 4 {
        return Err(RelayError::Auth("Invalid auth format".to_string()));
    }

    let device_id =
        Uuid::parse_str(parts[0]).map_err(|_| RelayError::Auth("Invalid device ID".to_string()))?;
    let timestamp: i64 = parts[1]
        .parse()
        .map_err(|_| RelayError::Auth("Invalid timestamp".to_string()))?;
    let nonce = parts[2].to_string();
    if nonce.is_empty() {
        return Err(RelayError::Auth("Empty nonce".to_string()));
    }
    let signature = base64::engine::general_purpose::STANDARD
        .decode(parts[3])
        .map_err(|_| RelayError::Auth("Invalid signature encoding".to_string()))?;

    Ok(AuthHeader {
        device_id,
        timestamp,
        nonce,
        signature,
    })
}

fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), RelayError> {
    let key_array: [u8; 32] = public_key
        .try_into()
        .map_err(|_| RelayError::Auth("Invalid public key".to_string()))?;
    let verifying_key = VerifyingKey::from_bytes(&key_array)
        .map_err(|_| RelayError::Auth("Invalid public key".to_string()))?;

    let sig_array: [u8; 64] = signature
        .try_into()
        .map_err(|_| RelayError::Auth("Invalid signature length".to_string()))?;
    let signature = Signature::from_bytes(&sig_array);

    verifying_key
        .verify(message, &signature)
        .map_err(|_| RelayError::Auth("Signature verification failed".to_string()))
}

/// Build a valid `Authorization` header value for tests.
#[cfg(test)]
pub fn sign_request(
    key: &ed25519_dalek::SigningKey,
    device_id: Uuid,
    method: &str,
    path: &str,
    body: &[u8],
) -> String {
    use ed25519_dalek::Signer;

    let timestamp = Utc::now().timestamp();
    let nonce = Uuid::new_v4().simple().to_string();
    let message = signing_message(method, path, timestamp, &nonce, body);
    let signature = key.sign(message.as_bytes());
    format!(
        "{} {}:{}:{}:{}",
        AUTH_SCHEME,
        device_id,
        timestamp,
        nonce,
        base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    #[test]
    fn test_parse_valid_header() {
        let key = SigningKey::from_bytes(&[1; 32]);
        let device = Uuid::new_v4();
        let header = sign_request(&key, device, "POST", "/api/v1/secrets/update", b"{}");

        let parsed = parse_auth_header(&header).unwrap();
        assert_eq!(parsed.device_id, device);
        assert_eq!(parsed.signature.len(), 64);
    }

    #[test]
    fn test_parse_rejects_malformed_headers() {
        let device = Uuid::new_v4();
        for bad in [
            format!("Bearer {device}:1:n:AAAA"),
            format!("{AUTH_SCHEME}{device}:1:n:AAAA"),
            format!("{AUTH_SCHEME} {device}:1:n"),
            format!("{AUTH_SCHEME} not-a-uuid:1:n:AAAA"),
            format!("{AUTH_SCHEME} {device}:soon:n:AAAA"),
            format!("{AUTH_SCHEME} {device}:1::AAAA"),
            format!("{AUTH_SCHEME} {device}:1:n:***"),
        ] {
            assert!(
                matches!(parse_auth_header(&bad), Err(RelayError::Auth(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_signature_covers_body() {
        use ed25519_dalek::Signer;

        let key = SigningKey::from_bytes(&[9; 32]);
        let public = key.verifying_key().to_bytes();
        let message = signing_message("POST", "/p", 42, "nonce", b"original");
        let signature = key.sign(message.as_bytes()).to_bytes();

        assert!(verify_signature(&public, message.as_bytes(), &signature).is_ok());

        let tampered = signing_message("POST", "/p", 42, "nonce", b"tampered");
        assert!(verify_signature(&public, tampered.as_bytes(), &signature).is_err());
        assert!(verify_signature(&public[..31], message.as_bytes(), &signature).is_err());
    }
}
