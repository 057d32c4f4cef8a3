//! Axum router setup.

use crate::auth::auth_middleware;
use crate::config::RelayConfig;
use crate::handlers::{devices, secrets};
use crate::rate_limit::RateLimiter;
use crate::storage::{RelayStorage, SqliteSecretStore};
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use vaultsync_core::{MemorySecretStore, SecretStore, SecretsController};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub storage: RelayStorage,
    pub controller: Arc<SecretsController>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(storage: RelayStorage, config: RelayConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn SecretStore> = if config.in_memory_secrets {
            tracing::warn!("Secrets are kept in memory and will not survive a restart");
            Arc::new(MemorySecretStore::new())
        } else {
            Arc::new(SqliteSecretStore::open(storage.clone())?)
        };

        let controller =
            SecretsController::new(store).with_catch_up_routing(config.catch_up_deletions);

        Ok(Self {
            storage,
            controller: Arc::new(controller),
            rate_limiter: RateLimiter::new(config.rate_limit_per_minute),
            config: Arc::new(config),
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    // Authenticated routes
    let authenticated = Router::new()
        .route("/api/v1/devices", get(devices::list_devices))
        .route("/api/v1/devices/enroll", post(devices::enroll_device))
        .route("/api/v1/devices/{id}/revoke", post(devices::revoke_device))
        .route("/api/v1/secrets/update", post(secrets::update_secret))
        .route("/api/v1/secrets/subscribe", get(secrets::subscribe))
        .route("/api/v1/secrets/status", get(secrets::status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // Unauthenticated routes
    let public = Router::new()
        .route("/api/v1/devices/register", post(devices::register_device))
        .route("/health", get(health));

    Router::new()
        .merge(authenticated)
        .merge(public)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(state.config.max_payload_size))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{body_json, register, signed, test_state, TestDevice};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_health() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_auth_is_unauthorized() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::get("/api/v1/secrets/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Missing Authorization header");
    }

    #[tokio::test]
    async fn test_unregistered_device_is_unauthorized() {
        let app = build_router(test_state());
        let stranger = TestDevice::new(Uuid::new_v4(), 3);

        let response = app
            .oneshot(signed(&stranger, "GET", "/api/v1/secrets/status", Vec::new()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_replayed_request_is_rejected() {
        let app = build_router(test_state());
        let device = TestDevice::new(Uuid::new_v4(), 4);
        register(&app, &device).await;

        let request = signed(&device, "GET", "/api/v1/secrets/status", Vec::new());
        let header = request.headers().get("Authorization").unwrap().clone();

        let first = app.clone().oneshot(request).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let replay = Request::get("/api/v1/secrets/status")
            .header("Authorization", header)
            .body(Body::empty())
            .unwrap();
        let second = app.oneshot(replay).await.unwrap();
        assert_eq!(second.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(second).await["error"], "Nonce reused");
    }

    #[tokio::test]
    async fn test_tampered_body_is_rejected() {
        let app = build_router(test_state());
        let device = TestDevice::new(Uuid::new_v4(), 5);
        register(&app, &device).await;

        let body = br#"{"action":"create","secret":{"kind":"memo","data":""}}"#.to_vec();
        let request = signed(&device, "POST", "/api/v1/secrets/update", body);
        let (parts, _) = request.into_parts();
        let forged = Request::from_parts(
            parts,
            Body::from(r#"{"action":"create","secret":{"kind":"memo","data":"AA=="}}"#),
        );

        let response = app.oneshot(forged).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let config = RelayConfig {
            in_memory_secrets: true,
            rate_limit_per_minute: 2,
            ..RelayConfig::default()
        };
        let state = AppState::new(RelayStorage::in_memory().unwrap(), config).unwrap();
        let app = build_router(state);
        let device = TestDevice::new(Uuid::new_v4(), 6);
        register(&app, &device).await;

        for _ in 0..2 {
            let ok = app
                .clone()
                .oneshot(signed(&device, "GET", "/api/v1/secrets/status", Vec::new()))
                .await
                .unwrap();
            assert_eq!(ok.status(), StatusCode::OK);
        }
        let limited = app
            .oneshot(signed(&device, "GET", "/api/v1/secrets/status", Vec::new()))
            .await
            .unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_sqlite_backed_state() {
        let state = AppState::new(RelayStorage::in_memory().unwrap(), RelayConfig::default()).unwrap();
        let app = build_router(state.clone());
        let device = TestDevice::new(Uuid::new_v4(), 8);
        register(&app, &device).await;

        let body = br#"{"action":"create","secret":{"kind":"memo","data":"AQID"}}"#.to_vec();
        let response = app
            .oneshot(signed(&device, "POST", "/api/v1/secrets/update", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let count: i64 = state
            .storage
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM secrets", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
