pub mod admins;
pub mod health;
pub mod notifications;
pub mod projects;
pub mod subscriptions;
pub mod tasks;
pub mod users;
pub mod ws;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use tower_http::services::ServeFile;

use crate::middleware::last_seen::track_last_seen;
use crate::middleware::throttle::throttle;
use crate::state::AppState;

/// Largest accepted request body.
pub const BODY_LIMIT_BYTES: usize = 1024 * 1024;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(users::router())
        .merge(projects::router())
        .merge(tasks::router())
        .merge(notifications::router())
        .merge(subscriptions::router())
        .merge(admins::router())
        .merge(ws::router())
        .route_service("/", ServeFile::new("static/index.html"))
        .layer(axum::middleware::from_fn_with_state(state.clone(), track_last_seen))
        .layer(axum::middleware::from_fn_with_state(state.clone(), throttle))
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .with_state(state)
}
