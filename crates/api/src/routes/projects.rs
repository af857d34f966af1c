//! Project, membership and invitation routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use planner_common::error::AppError;
use planner_common::pagination::PageParams;
use planner_engine::invitations::{AcceptOutcome, InvitationFilters, InvitationService};
use planner_engine::projects::{CreateProject, ProjectFilters, ProjectService, UpdateProject};

use crate::middleware::auth::{AuthUser, OptionalAuthUser};
use crate::response::{envelope, message};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/projects/", get(list_projects).post(create_project))
        .route(
            "/api/v1/projects/{id}/",
            get(get_project)
                .put(update_project)
                .patch(update_project)
                .delete(delete_project),
        )
        .route("/api/v1/projects/memberships/{id}/", get(get_membership))
        .route(
            "/api/v1/projects/invite/",
            get(list_invitations).post(create_invitation),
        )
        .route("/api/v1/projects/invite/accept/", post(accept_invitation))
}

#[derive(Debug, Deserialize)]
pub struct InviteRequest {
    pub project: Uuid,
    pub email: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenParam {
    pub token: Option<String>,
}

/// GET /api/v1/projects/
async fn list_projects(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(filters): Query<ProjectFilters>,
    Query(page): Query<PageParams>,
) -> Result<Response, AppError> {
    let projects = ProjectService::list(&state.pool, auth.id(), &filters, &page).await?;
    Ok(envelope(StatusCode::OK, "Projects retrieved successfully.", projects))
}

/// POST /api/v1/projects/
async fn create_project(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(params): Json<CreateProject>,
) -> Result<Response, AppError> {
    let mut redis = state.redis.clone();
    let project = ProjectService::create(&state.pool, &mut redis, &auth.user, &params).await?;

    tracing::info!(project_id = %project.project.id, owner = %auth.id(), "Project created");
    Ok(envelope(StatusCode::CREATED, "Project created successfully.", project))
}

/// GET /api/v1/projects/{id}/
async fn get_project(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let project = ProjectService::detail(&state.pool, auth.id(), id).await?;
    Ok(envelope(StatusCode::OK, "Project retrieved successfully.", project))
}

/// PUT|PATCH /api/v1/projects/{id}/
async fn update_project(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(params): Json<UpdateProject>,
) -> Result<Response, AppError> {
    let mut redis = state.redis.clone();
    let project = ProjectService::update(&state.pool, &mut redis, auth.id(), id, &params).await?;
    Ok(envelope(StatusCode::OK, "Project updated successfully.", project))
}

/// DELETE /api/v1/projects/{id}/
async fn delete_project(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    ProjectService::delete(&state.pool, auth.id(), id).await?;

    tracing::info!(project_id = %id, "Project deleted");
    Ok(envelope(
        StatusCode::NO_CONTENT,
        "Project successfully deleted.",
        serde_json::Value::Null,
    ))
}

/// GET /api/v1/projects/memberships/{id}/
async fn get_membership(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let membership = ProjectService::membership(&state.pool, auth.id(), id).await?;
    Ok(envelope(
        StatusCode::OK,
        "Project membership retrieved successfully.",
        membership,
    ))
}

/// GET /api/v1/projects/invite/
async fn list_invitations(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(filters): Query<InvitationFilters>,
    Query(page): Query<PageParams>,
) -> Result<Response, AppError> {
    let invitations = InvitationService::list_sent(&state.pool, auth.id(), &filters, &page).await?;
    Ok(Json(invitations).into_response())
}

/// POST /api/v1/projects/invite/
async fn create_invitation(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<InviteRequest>,
) -> Result<Response, AppError> {
    let mut redis = state.redis.clone();
    let invitation = InvitationService::invite(
        &state.pool,
        &mut redis,
        &state.config.frontend_url,
        &auth.user,
        req.project,
        &req.email,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(invitation)).into_response())
}

/// POST /api/v1/projects/invite/accept/
///
/// The token may arrive in the JSON body or the `?token=` query string.
async fn accept_invitation(
    State(state): State<AppState>,
    OptionalAuthUser(auth): OptionalAuthUser,
    Query(query): Query<TokenParam>,
    body: Option<Json<TokenParam>>,
) -> Result<Response, AppError> {
    let raw = body
        .and_then(|Json(b)| b.token)
        .or(query.token)
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| AppError::Validation("Token is required.".to_string()))?;
    let token = Uuid::parse_str(raw.trim())
        .map_err(|_| AppError::Validation("Invalid or already used invitation token.".to_string()))?;

    let outcome = InvitationService::accept(&state.pool, token, auth.map(|a| a.id())).await?;
    let response = match outcome {
        AcceptOutcome::Accepted(invitation) => {
            tracing::info!(invitation_id = %invitation.id, "Invitation accepted");
            message(StatusCode::OK, "Invitation accepted successfully.")
        }
        AcceptOutcome::AlreadyMember(_) => {
            message(StatusCode::OK, "You are already a member of this project.")
        }
        AcceptOutcome::LoginRequired(invitation) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "message": "Please register or log in to accept the invitation.",
                "project_name": invitation.project_name,
                "token": invitation.token,
            })),
        )
            .into_response(),
    };
    Ok(response)
}
