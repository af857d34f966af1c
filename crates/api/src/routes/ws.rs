//! WebSocket push channel for real-time notifications.
//!
//! Clients authenticate with an access token in the `Authorization` header or
//! `?token=`. A bad token still gets an upgraded socket, which is then closed
//! with code 4001 so browsers can tell auth failures from network errors.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use planner_engine::users::UserService;

use crate::hub::NotificationHub;
use crate::middleware::auth::{TokenType, bearer_token, decode_typed};
use crate::state::AppState;

pub const UNAUTHORIZED_CLOSE_CODE: u16 = 4001;
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/notifications/", get(notifications_socket))
}

#[derive(Debug, Default, Deserialize)]
pub struct SocketParams {
    pub token: Option<String>,
}

/// Resolve the connecting user, or `None` when the token is missing or invalid.
async fn authenticate(state: &AppState, token: Option<String>) -> Option<Uuid> {
    let claims = decode_typed(&token?, &state.config.jwt_secret, TokenType::Access).ok()?;
    let user = UserService::get(&state.pool, claims.user_id().ok()?).await.ok()?;
    user.is_active.then_some(user.id)
}

/// GET /ws/notifications/
async fn notifications_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SocketParams>,
) -> Response {
    let token = bearer_token(&headers).or(params.token);
    let user = authenticate(&state, token).await;
    let hub = state.hub.clone();

    ws.on_upgrade(move |socket| async move {
        match user {
            Some(user_id) => serve(socket, hub, user_id).await,
            None => reject(socket).await,
        }
    })
}

async fn reject(mut socket: WebSocket) {
    let frame = CloseFrame {
        code: UNAUTHORIZED_CLOSE_CODE,
        reason: "Unauthorized".into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %e, "Failed to send close frame");
    }
}

async fn serve(socket: WebSocket, hub: Arc<NotificationHub>, user_id: Uuid) {
    let mut notifications = hub.subscribe(user_id).await;
    let (mut sender, mut receiver) = socket.split();
    tracing::info!(user_id = %user_id, "Notification socket connected");

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            received = notifications.recv() => match received {
                Ok(payload) => {
                    if sender.send(Message::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(user_id = %user_id, skipped, "Socket fell behind, notifications dropped");
                }
                Err(RecvError::Closed) => break,
            },
            _ = ping.tick() => {
                let ping = json!({"ping": "ping"}).to_string();
                if sender.send(Message::Text(ping.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    drop(notifications);
    hub.release(user_id).await;
    tracing::info!(user_id = %user_id, "Notification socket disconnected");
}
