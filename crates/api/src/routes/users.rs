//! Account routes: registration, login, tokens, profile, passwords and OTPs.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use planner_common::error::AppError;
use planner_common::types::OtpPurpose;
use planner_engine::users::{
    OtpOutcome, ProfileUpdate, ProfileView, RegisterOutcome, RegisterParams, UserService,
};

use crate::middleware::auth::{
    AuthUser, OptionalAuthUser, TokenType, blacklist, decode_typed, is_blacklisted, issue_access,
    issue_pair, issue_reset,
};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/users/register/", post(register))
        .route("/api/v1/users/login/", post(login))
        .route("/api/v1/users/logout/", post(logout))
        .route("/api/v1/users/token/", post(obtain_token))
        .route("/api/v1/users/token/refresh/", post(refresh_token))
        .route(
            "/api/v1/users/profile/",
            get(get_profile).put(update_profile).patch(update_profile),
        )
        .route("/api/v1/users/password/change/", post(change_password))
        .route("/api/v1/users/password/reset/", post(request_password_reset))
        .route("/api/v1/users/password/reset/confirm/", post(confirm_password_reset))
        .route("/api/v1/users/otp/send/", post(send_otp))
        .route("/api/v1/users/otp/verify/", post(verify_otp))
}

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
    pub confirm_password: String,
}

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetConfirmRequest {
    pub reset_token: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct SendOtpRequest {
    pub email: String,
    pub purpose: OtpPurpose,
}

#[derive(Debug, Deserialize)]
pub struct VerifyOtpRequest {
    pub email: String,
    pub otp: String,
    pub purpose: OtpPurpose,
}

/// POST /api/v1/users/register/
async fn register(
    State(state): State<AppState>,
    Json(params): Json<RegisterParams>,
) -> Result<Response, AppError> {
    let mut redis = state.redis.clone();
    let response = match UserService::register(&state.pool, &mut redis, &params).await? {
        RegisterOutcome::Created(user) => (
            StatusCode::CREATED,
            Json(json!({
                "message": "Registration successful. Please verify your email.",
                "email": user.pending_email.unwrap_or(user.email),
            })),
        ),
        RegisterOutcome::OtpResent(user) => (
            StatusCode::OK,
            Json(json!({
                "message": "User exists but email not verified. OTP resent.",
                "email": user.pending_email.unwrap_or(user.email),
            })),
        ),
    };
    Ok(response.into_response())
}

/// POST /api/v1/users/login/
async fn login(
    State(state): State<AppState>,
    Json(req): Json<Credentials>,
) -> Result<Json<serde_json::Value>, AppError> {
    let user = UserService::authenticate(&state.pool, &req.username, &req.password).await?;
    let tokens = issue_pair(&user, &state.config)?;

    tracing::info!(user_id = %user.id, "User logged in");
    Ok(Json(json!({
        "refresh": tokens.refresh,
        "access": tokens.access,
        "username": user.username,
        "email": user.email,
        "role": user.role,
    })))
}

/// POST /api/v1/users/logout/: blacklist the refresh token.
async fn logout(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<RefreshRequest>,
) -> Result<Response, AppError> {
    let claims = decode_typed(&req.refresh, &state.config.jwt_secret, TokenType::Refresh)
        .map_err(|_| AppError::Validation("Invalid token".to_string()))?;
    if claims.user_id()? != auth.id() {
        return Err(AppError::Validation("Invalid token".to_string()));
    }

    let mut redis = state.redis.clone();
    blacklist(&mut redis, &claims).await?;

    tracing::info!(user_id = %auth.id(), "User logged out");
    Ok((
        StatusCode::RESET_CONTENT,
        Json(json!({"message": "Logged out successfully"})),
    )
        .into_response())
}

/// POST /api/v1/users/token/
async fn obtain_token(
    State(state): State<AppState>,
    Json(req): Json<Credentials>,
) -> Result<Json<serde_json::Value>, AppError> {
    let user = UserService::authenticate(&state.pool, &req.username, &req.password).await?;
    let tokens = issue_pair(&user, &state.config)?;
    Ok(Json(json!(tokens)))
}

/// POST /api/v1/users/token/refresh/
async fn refresh_token(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let claims = decode_typed(&req.refresh, &state.config.jwt_secret, TokenType::Refresh)?;
    let mut redis = state.redis.clone();
    if is_blacklisted(&mut redis, &claims).await? {
        return Err(AppError::Auth("Token is blacklisted".to_string()));
    }

    let user = UserService::get(&state.pool, claims.user_id()?).await?;
    if !user.is_active {
        return Err(AppError::Auth("User account is disabled".to_string()));
    }
    Ok(Json(json!({ "access": issue_access(&user, &state.config)? })))
}

/// GET /api/v1/users/profile/
async fn get_profile(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<ProfileView>, AppError> {
    Ok(Json(UserService::profile(&state.pool, auth.id()).await?))
}

/// PUT|PATCH /api/v1/users/profile/
async fn update_profile(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(update): Json<ProfileUpdate>,
) -> Result<Json<serde_json::Value>, AppError> {
    let mut redis = state.redis.clone();
    let (profile, email_change) =
        UserService::update_profile(&state.pool, &mut redis, auth.id(), &update).await?;

    let mut body = json!({
        "message": "Profile updated successfully",
        "profile": profile,
        "email_status": "verified",
    });
    if let Some(email) = email_change {
        body["email_status"] = json!("pending_verification");
        body["email_change"] = json!(format!(
            "Email verification OTP has been sent to {}. Please verify your new email address.",
            email
        ));
    }
    Ok(Json(body))
}

/// POST /api/v1/users/password/change/
async fn change_password(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let user = UserService::change_password(
        &state.pool,
        auth.id(),
        &req.old_password,
        &req.new_password,
        &req.confirm_password,
    )
    .await?;
    let tokens = issue_pair(&user, &state.config)?;

    Ok(Json(json!({
        "message": "Password updated successfully.",
        "access": tokens.access,
        "refresh": tokens.refresh,
    })))
}

/// POST /api/v1/users/password/reset/
async fn request_password_reset(
    State(state): State<AppState>,
    Json(req): Json<EmailRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let mut redis = state.redis.clone();
    UserService::request_password_reset(&state.pool, &mut redis, &req.email).await?;
    Ok(Json(json!({"detail": "Password reset OTP sent successfully"})))
}

/// POST /api/v1/users/password/reset/confirm/
async fn confirm_password_reset(
    State(state): State<AppState>,
    Json(req): Json<ResetConfirmRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let claims = decode_typed(&req.reset_token, &state.config.jwt_secret, TokenType::Reset)
        .map_err(|_| AppError::Validation("Invalid or expired reset token.".to_string()))?;
    let mut redis = state.redis.clone();
    if is_blacklisted(&mut redis, &claims).await? {
        return Err(AppError::Validation("Invalid or expired reset token.".to_string()));
    }
    let user = UserService::get(&state.pool, claims.user_id()?).await?;
    let user = UserService::set_password(&state.pool, &user, &req.new_password).await?;
    blacklist(&mut redis, &claims).await?;
    let tokens = issue_pair(&user, &state.config)?;

    tracing::info!(user_id = %user.id, "Password reset");
    Ok(Json(json!({
        "message": "Password has been reset successfully.",
        "tokens": tokens,
    })))
}

/// POST /api/v1/users/otp/send/
async fn send_otp(
    State(state): State<AppState>,
    OptionalAuthUser(auth): OptionalAuthUser,
    Json(req): Json<SendOtpRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let mut redis = state.redis.clone();
    let message = UserService::send_otp(
        &state.pool,
        &mut redis,
        &req.email,
        req.purpose,
        auth.map(|a| a.id()),
    )
    .await?;
    Ok(Json(json!({ "message": message })))
}

/// POST /api/v1/users/otp/verify/
async fn verify_otp(
    State(state): State<AppState>,
    Json(req): Json<VerifyOtpRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let body = match UserService::verify_otp(&state.pool, &req.email, req.purpose, &req.otp).await? {
        OtpOutcome::Registered(user) => {
            let tokens = issue_pair(&user, &state.config)?;
            json!({
                "message": "Email verified successfully.",
                "refresh": tokens.refresh,
                "access": tokens.access,
                "username": user.username,
                "email": user.email,
                "role": user.role,
            })
        }
        OtpOutcome::EmailChanged(user) => json!({
            "message": "Email updated successfully.",
            "email": user.email,
        }),
        OtpOutcome::ResetVerified(user) => json!({
            "message": "OTP verified. Use the reset token to set a new password.",
            "reset_token": issue_reset(&user, &state.config)?,
        }),
    };
    Ok(Json(body))
}
