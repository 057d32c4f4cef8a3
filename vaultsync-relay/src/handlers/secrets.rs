//! Secret write, status and live update stream handlers.

use crate::auth::ClientIdentity;
use crate::error::RelayError;
use crate::server::AppState;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::Extensions;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vaultsync_core::{
    parse_known_ids, Secret, SecretKind, SyncError, Update, UpdateAction, Version,
};

/// Close code sent when the subscribe request is malformed.
pub const CLOSE_BAD_REQUEST: u16 = 4000;
/// Close code sent when the device already holds a live stream.
pub const CLOSE_CONFLICT: u16 = 4009;

const SUBSCRIBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
pub struct SecretPayload {
    pub id: Option<String>,
    pub kind: Option<String>,
    #[serde(default)]
    pub data: String, // base64
    pub version: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateRequest {
    pub action: String,
    pub secret: SecretPayload,
}

#[derive(Serialize)]
pub struct UpdateResponse {
    pub version: Version,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_id: Option<Uuid>,
}

/// First frame a client sends on the update stream.
#[derive(Deserialize)]
pub struct SubscribeRequest {
    pub known_version: Option<String>,
    #[serde(default)]
    pub known_ids: Vec<String>,
}

/// One update as sent to a subscriber.
#[derive(Serialize)]
struct UpdateFrame<'a> {
    action: UpdateAction,
    secret: &'a Secret,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub user_id: Uuid,
    pub secret_count: usize,
    pub live_clients: usize,
}

pub async fn update_secret(
    State(state): State<AppState>,
    extensions: Extensions,
    Json(req): Json<UpdateRequest>,
) -> Result<Json<UpdateResponse>, RelayError> {
    let identity = ClientIdentity::from_extensions(&extensions)?;
    let update = decode_update(identity, req)?;

    // Fires if the client goes away and the handler is dropped mid-write.
    let cancel = CancellationToken::new();
    let _abandoned = cancel.clone().drop_guard();
    let outcome = state.controller.make_update(update, &cancel).await?;

    Ok(Json(UpdateResponse {
        version: outcome.version,
        new_id: outcome.new_id,
    }))
}

fn decode_update(identity: ClientIdentity, req: UpdateRequest) -> Result<Update, RelayError> {
    let action: UpdateAction = req.action.parse()?;

    let kind = match (action, req.secret.kind.as_deref()) {
        (_, Some(kind)) => kind.parse::<SecretKind>()?,
        (UpdateAction::Delete, None) => SecretKind::default(),
        (_, None) => {
            return Err(RelayError::BadRequest(format!(
                "Secret kind is required to {}",
                action.as_str()
            )))
        }
    };
    let data = base64::engine::general_purpose::STANDARD
        .decode(&req.secret.data)
        .map_err(|e| RelayError::BadRequest(format!("Invalid secret data: {}", e)))?;
    if let Some(version) = &req.secret.version {
        version.parse::<Version>().map_err(SyncError::from)?;
    }

    let id = match (action, req.secret.id.as_deref()) {
        (UpdateAction::Create, _) => Uuid::nil(),
        (_, Some(raw)) => Uuid::parse_str(raw)
            .map_err(|_| RelayError::BadRequest(format!("Invalid secret id: {}", raw)))?,
        (_, None) => {
            return Err(RelayError::BadRequest(format!(
                "Secret id is required to {}",
                action.as_str()
            )))
        }
    };

    let mut secret = Secret::new(kind, data);
    secret.id = id;
    Ok(Update::new(identity.user_id, identity.device_id, action, secret))
}

pub async fn status(
    State(state): State<AppState>,
    extensions: Extensions,
) -> Result<Json<StatusResponse>, RelayError> {
    let identity = ClientIdentity::from_extensions(&extensions)?;
    let secret_count = state
        .controller
        .store()
        .secret_ids(identity.user_id)
        .await?
        .len();

    Ok(Json(StatusResponse {
        user_id: identity.user_id,
        secret_count,
        live_clients: state.controller.live_clients(identity.user_id),
    }))
}

/// GET /api/v1/secrets/subscribe: WebSocket stream of updates.
///
/// The client opens with a [`SubscribeRequest`] text frame; the server
/// answers with catch-up frames followed by live updates until either side
/// closes.
pub async fn subscribe(
    State(state): State<AppState>,
    extensions: Extensions,
    ws: WebSocketUpgrade,
) -> Result<Response, RelayError> {
    let identity = ClientIdentity::from_extensions(&extensions)?;

    if state
        .controller
        .is_subscribed(identity.user_id, identity.device_id)
    {
        return Err(SyncError::AlreadySubscribed {
            user_id: identity.user_id,
            client_id: identity.device_id,
        }
        .into());
    }

    Ok(ws
        .on_upgrade(move |socket| stream_updates(socket, state, identity))
        .into_response())
}

async fn stream_updates(socket: WebSocket, state: AppState, identity: ClientIdentity) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let request = match tokio::time::timeout(SUBSCRIBE_REQUEST_TIMEOUT, ws_receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(_))) => {
            close(&mut ws_sender, CLOSE_BAD_REQUEST, "Expected a subscribe request").await;
            return;
        }
        Ok(_) => return,
        Err(_) => {
            close(&mut ws_sender, close_code::POLICY, "Subscribe request timed out").await;
            return;
        }
    };

    let (known_version, known_ids) = match parse_subscribe_request(request.as_str()) {
        Ok(parsed) => parsed,
        Err(e) => {
            close(&mut ws_sender, CLOSE_BAD_REQUEST, &e.to_string()).await;
            return;
        }
    };

    // Ends the subscription however this function returns.
    let cancel = CancellationToken::new();
    let _unsubscribe = cancel.clone().drop_guard();

    let updates = match state.controller.subscribe_updates(
        identity.user_id,
        identity.device_id,
        known_version,
        known_ids,
        &cancel,
    ) {
        Ok(updates) => updates,
        Err(e) => {
            let code = match &e {
                SyncError::AlreadySubscribed { .. } => CLOSE_CONFLICT,
                _ => close_code::ERROR,
            };
            close(&mut ws_sender, code, &e.to_string()).await;
            return;
        }
    };
    let mut updates = updates.into_stream();

    loop {
        tokio::select! {
            update = updates.next() => {
                let Some(update) = update else {
                    close(&mut ws_sender, close_code::AWAY, "Subscription closed").await;
                    break;
                };
                let frame = UpdateFrame {
                    action: update.action,
                    secret: &update.secret,
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to encode update: {}", e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::debug!(
        user_id = %identity.user_id,
        device_id = %identity.device_id,
        "Update stream closed"
    );
}

fn parse_subscribe_request(text: &str) -> Result<(Version, Vec<Uuid>), RelayError> {
    let request: SubscribeRequest = serde_json::from_str(text)
        .map_err(|e| RelayError::BadRequest(format!("Invalid subscribe request: {}", e)))?;

    let known_version = match request.known_version.as_deref() {
        Some(raw) => raw.parse::<Version>().map_err(SyncError::from)?,
        None => Version::epoch(),
    };

    Ok((known_version, parse_known_ids(&request.known_ids)))
}

async fn close<S>(sender: &mut S, code: u16, reason: &str)
where
    S: Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = sender.send(Message::Close(Some(frame))).await;
}
