//! Task, comment and status-change-request routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use planner_common::error::AppError;
use planner_common::pagination::PageParams;
use planner_common::types::TaskStatus;
use planner_engine::comments::{CommentFilters, CommentService, CreateComment, UpdateComment};
use planner_engine::status_requests::{
    CreateRequest, RequestAction, RequestFilters, StatusRequestService, UpdateRequest,
};
use planner_engine::tasks::{CreateTask, TaskFilters, TaskService, UpdateTask};

use crate::middleware::auth::AuthUser;
use crate::response::success;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/tasks/", get(list_tasks).post(create_task))
        .route(
            "/api/v1/tasks/{id}/",
            get(get_task).put(update_task).patch(update_task).delete(delete_task),
        )
        .route("/api/v1/tasks/status/change/{id}/", patch(change_status))
        .route(
            "/api/v1/tasks/comments/",
            get(list_comments).post(create_comment),
        )
        .route(
            "/api/v1/tasks/comments/{id}/",
            get(get_comment)
                .put(update_comment)
                .patch(update_comment)
                .delete(delete_comment),
        )
        .route("/api/v1/tasks/comments/{id}/replies/", get(comment_replies))
        .route(
            "/api/v1/tasks/status/change/requests/",
            get(list_requests).post(create_request),
        )
        .route(
            "/api/v1/tasks/status/change/requests/{id}/",
            get(get_request)
                .put(update_request)
                .patch(update_request)
                .delete(delete_request),
        )
        .route(
            "/api/v1/tasks/status/change/requests/{id}/action/",
            post(act_on_request),
        )
}

#[derive(Debug, Deserialize)]
pub struct StatusChange {
    pub status: TaskStatus,
}

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub action: RequestAction,
}

// Tasks

async fn list_tasks(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(filters): Query<TaskFilters>,
    Query(page): Query<PageParams>,
) -> Result<Response, AppError> {
    let tasks = TaskService::list(&state.pool, auth.id(), &filters, &page).await?;
    Ok(success(StatusCode::OK, "Tasks retrieved successfully.", Some(tasks)))
}

async fn create_task(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(params): Json<CreateTask>,
) -> Result<Response, AppError> {
    let mut redis = state.redis.clone();
    let task = TaskService::create(&state.pool, &mut redis, &auth.user, &params).await?;

    tracing::info!(task_id = %task.task.id, project_id = %params.project, "Task created");
    Ok(success(StatusCode::CREATED, "Task created successfully.", Some(task)))
}

async fn get_task(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let task = TaskService::detail(&state.pool, auth.id(), id).await?;
    Ok(success(StatusCode::OK, "Task details retrieved successfully.", Some(task)))
}

async fn update_task(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(params): Json<UpdateTask>,
) -> Result<Response, AppError> {
    let mut redis = state.redis.clone();
    let task = TaskService::update(&state.pool, &mut redis, auth.id(), id, &params).await?;
    Ok(success(StatusCode::OK, "Task updated successfully.", Some(task)))
}

async fn delete_task(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let mut redis = state.redis.clone();
    TaskService::delete(&state.pool, &mut redis, auth.id(), id).await?;

    tracing::info!(task_id = %id, "Task deleted");
    Ok(success::<Value>(
        StatusCode::NO_CONTENT,
        "Task has been deleted successfully.",
        None,
    ))
}

/// PATCH /api/v1/tasks/status/change/{id}/: an assignee marks the task completed.
async fn change_status(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<StatusChange>,
) -> Result<Response, AppError> {
    let mut redis = state.redis.clone();
    let task = TaskService::change_status(&state.pool, &mut redis, auth.id(), id, req.status).await?;
    Ok(success(StatusCode::OK, "Task status updated successfully.", Some(task)))
}

// Comments

async fn list_comments(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(filters): Query<CommentFilters>,
    Query(page): Query<PageParams>,
) -> Result<Response, AppError> {
    let comments = CommentService::list(&state.pool, auth.id(), &filters, &page).await?;
    Ok(success(StatusCode::OK, "Comments retrieved successfully.", Some(comments)))
}

async fn create_comment(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(params): Json<CreateComment>,
) -> Result<Response, AppError> {
    let mut redis = state.redis.clone();
    let comment = CommentService::create(&state.pool, &mut redis, &auth.user, &params).await?;
    Ok(success(StatusCode::CREATED, "Comment created successfully.", Some(comment)))
}

async fn get_comment(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let comment = CommentService::detail(&state.pool, auth.id(), id).await?;
    Ok(success(StatusCode::OK, "Comment retrieved successfully.", Some(comment)))
}

async fn update_comment(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(params): Json<UpdateComment>,
) -> Result<Response, AppError> {
    let mut redis = state.redis.clone();
    let comment = CommentService::update(&state.pool, &mut redis, &auth.user, id, &params).await?;
    Ok(success(StatusCode::OK, "Comment updated successfully.", Some(comment)))
}

async fn delete_comment(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    CommentService::delete(&state.pool, auth.id(), id).await?;
    Ok(success::<Value>(
        StatusCode::NO_CONTENT,
        "Comment deleted successfully.",
        None,
    ))
}

async fn comment_replies(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Query(page): Query<PageParams>,
) -> Result<Response, AppError> {
    let replies = CommentService::replies(&state.pool, auth.id(), id, &page).await?;
    Ok(success(StatusCode::OK, "Replies retrieved successfully.", Some(replies)))
}

// Status change requests

async fn list_requests(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(filters): Query<RequestFilters>,
    Query(page): Query<PageParams>,
) -> Result<Response, AppError> {
    let requests = StatusRequestService::list(&state.pool, auth.id(), &filters, &page).await?;
    Ok(success(
        StatusCode::OK,
        "Status change requests retrieved successfully.",
        Some(requests),
    ))
}

async fn create_request(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(params): Json<CreateRequest>,
) -> Result<Response, AppError> {
    let mut redis = state.redis.clone();
    let request = StatusRequestService::create(&state.pool, &mut redis, &auth.user, &params).await?;
    Ok(success(
        StatusCode::CREATED,
        "Status change request created successfully.",
        Some(request),
    ))
}

async fn get_request(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let (request, _, _) = StatusRequestService::visible(&state.pool, auth.id(), id).await?;
    Ok(success(
        StatusCode::OK,
        "Status change request retrieved successfully.",
        Some(request),
    ))
}

async fn update_request(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(params): Json<UpdateRequest>,
) -> Result<Response, AppError> {
    let request = StatusRequestService::update(&state.pool, auth.id(), id, &params).await?;
    Ok(success(
        StatusCode::OK,
        "Status change request updated successfully.",
        Some(request),
    ))
}

async fn delete_request(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    StatusRequestService::delete(&state.pool, auth.id(), id).await?;
    Ok(success::<Value>(
        StatusCode::NO_CONTENT,
        "Status change request deleted successfully.",
        None,
    ))
}

/// POST /api/v1/tasks/status/change/requests/{id}/action/
async fn act_on_request(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<ActionRequest>,
) -> Result<Response, AppError> {
    let mut redis = state.redis.clone();
    let request = StatusRequestService::act(&state.pool, &mut redis, auth.id(), id, req.action).await?;

    tracing::info!(request_id = %id, action = ?req.action, "Status change request resolved");
    let message = match req.action {
        RequestAction::Accept => "Status change request accepted.",
        RequestAction::Reject => "Status change request rejected.",
    };
    Ok(success(StatusCode::OK, message, Some(request)))
}
