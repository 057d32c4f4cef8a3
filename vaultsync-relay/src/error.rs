//! Relay error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use vaultsync_core::{StoreError, SyncError};

/// Relay server error types mapped to HTTP status codes.
#[derive(Debug)]
pub enum RelayError {
    Database(String),
    Auth(String),
    NotFound(String),
    Conflict(String),
    RateLimited,
    BadRequest(String),
    Internal(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database(e) => write!(f, "Database error: {}", e),
            Self::Auth(e) => write!(f, "Auth error: {}", e),
            Self::NotFound(e) => write!(f, "Not found: {}", e),
            Self::Conflict(e) => write!(f, "Conflict: {}", e),
            Self::RateLimited => write!(f, "Rate limited"),
            Self::BadRequest(e) => write!(f, "Bad request: {}", e),
            Self::Internal(e) => write!(f, "Internal error: {}", e),
        }
    }
}

impl std::error::Error for RelayError {}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Database(_) | Self::Internal(_) => {
                tracing::error!("{}", self);
                "Internal server error".to_string()
            }
            Self::Auth(e)
            | Self::NotFound(e)
            | Self::Conflict(e)
            | Self::BadRequest(e) => e.clone(),
            Self::RateLimited => "Rate limited".to_string(),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<SyncError> for RelayError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::AlreadySubscribed { .. } => Self::Conflict(e.to_string()),
            SyncError::NotFound(_) | SyncError::Store(StoreError::NotFound(_)) => {
                Self::NotFound(e.to_string())
            }
            SyncError::UnknownAction(_)
            | SyncError::InvalidArgument(_)
            | SyncError::Version(_) => Self::BadRequest(e.to_string()),
            SyncError::Store(_) => Self::Database(e.to_string()),
            SyncError::Cancelled => Self::Internal(e.to_string()),
        }
    }
}

impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        SyncError::from(e).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_sync_errors_map_to_statuses() {
        let cases = [
            (
                SyncError::AlreadySubscribed {
                    user_id: Uuid::new_v4(),
                    client_id: Uuid::new_v4(),
                },
                StatusCode::CONFLICT,
            ),
            (SyncError::UnknownAction("upsert".into()), StatusCode::BAD_REQUEST),
            (SyncError::InvalidArgument("id".into()), StatusCode::BAD_REQUEST),
            (
                SyncError::Store(StoreError::NotFound(Uuid::new_v4())),
                StatusCode::NOT_FOUND,
            ),
            (
                SyncError::Store(StoreError::Storage("io".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (SyncError::Cancelled, StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            assert_eq!(RelayError::from(err).status(), status);
        }
    }

    #[tokio::test]
    async fn test_internal_details_are_hidden() {
        let response = RelayError::Database("table secrets is locked".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Internal server error");
    }
}
