//! Notification inbox and preference routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use planner_common::error::AppError;
use planner_common::pagination::PageParams;
use planner_engine::notifications::{NotificationFilters, NotificationService};

use crate::middleware::auth::AuthUser;
use crate::response::envelope;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/notifications/",
            get(list_notifications).post(mark_read),
        )
        .route(
            "/api/v1/notifications/preferences/",
            get(get_preferences)
                .put(replace_preferences)
                .patch(merge_preferences),
        )
        .route(
            "/api/v1/notifications/{id}/",
            get(get_notification)
                .put(update_notification)
                .patch(update_notification),
        )
}

#[derive(Debug, Default, Deserialize)]
pub struct MarkReadRequest {
    #[serde(default)]
    pub ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ReadFlag {
    pub is_read: bool,
}

#[derive(Debug, Deserialize)]
pub struct PreferencesBody {
    pub preferences: Map<String, Value>,
}

async fn list_notifications(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(filters): Query<NotificationFilters>,
    Query(page): Query<PageParams>,
) -> Result<Response, AppError> {
    let notifications =
        NotificationService::list(&state.pool, Some(auth.id()), &filters, &page).await?;
    Ok(envelope(
        StatusCode::OK,
        "Notifications fetched successfully.",
        notifications,
    ))
}

/// POST /api/v1/notifications/: mark the given ids read, or every unread one.
async fn mark_read(
    State(state): State<AppState>,
    auth: AuthUser,
    body: Option<Json<MarkReadRequest>>,
) -> Result<Response, AppError> {
    let Json(req) = body.unwrap_or_default();
    let marked = NotificationService::mark_read(&state.pool, auth.id(), &req.ids).await?;
    Ok(envelope(
        StatusCode::OK,
        &format!("{} notification(s) marked as read.", marked),
        json!({ "marked_count": marked }),
    ))
}

async fn get_notification(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let notification = NotificationService::get(&state.pool, Some(auth.id()), id).await?;
    Ok(envelope(
        StatusCode::OK,
        "Notification details retrieved successfully.",
        notification,
    ))
}

async fn update_notification(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(flag): Json<ReadFlag>,
) -> Result<Response, AppError> {
    let notification = NotificationService::set_read(&state.pool, auth.id(), id, flag.is_read).await?;
    Ok(envelope(
        StatusCode::OK,
        "Notification updated successfully.",
        notification,
    ))
}

async fn get_preferences(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Response, AppError> {
    let preferences = NotificationService::preferences(&state.pool, auth.id()).await?;
    Ok(envelope(
        StatusCode::OK,
        "Notification preferences retrieved successfully.",
        preferences,
    ))
}

async fn replace_preferences(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<PreferencesBody>,
) -> Result<Response, AppError> {
    let preferences =
        NotificationService::update_preferences(&state.pool, auth.id(), &body.preferences, true)
            .await?;
    Ok(envelope(
        StatusCode::OK,
        "Notification preferences updated successfully.",
        preferences,
    ))
}

async fn merge_preferences(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<PreferencesBody>,
) -> Result<Response, AppError> {
    let preferences =
        NotificationService::update_preferences(&state.pool, auth.id(), &body.preferences, false)
            .await?;
    Ok(envelope(
        StatusCode::OK,
        "Notification preferences partially updated successfully.",
        preferences,
    ))
}
