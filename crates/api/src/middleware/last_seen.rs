//! Records when authenticated users were last active.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use planner_engine::presence::PresenceTracker;

use crate::middleware::auth::{TokenType, bearer_token, decode_typed};
use crate::state::AppState;

pub async fn track_last_seen(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let user_id = bearer_token(request.headers())
        .and_then(|token| decode_typed(&token, &state.config.jwt_secret, TokenType::Access).ok())
        .and_then(|claims| claims.user_id().ok());

    if let Some(user_id) = user_id {
        let mut redis = state.redis.clone();
        if let Err(e) = PresenceTracker::touch(&mut redis, user_id).await {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to record last seen");
        }
    }

    next.run(request).await
}
