//! Plan, subscription, payment and Stripe webhook routes.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use planner_common::error::AppError;
use planner_common::types::{Payment, SubscriptionPlan};
use planner_engine::stripe::{WebhookEvent, verify_signature};
use planner_engine::subscriptions::{SubscriptionDetails, SubscriptionService};

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/subscriptions/plans/", get(list_plans))
        .route("/api/v1/subscriptions/me/", get(my_subscription))
        .route("/api/v1/subscriptions/upgrade/", post(upgrade))
        .route("/api/v1/subscriptions/cancel/", post(cancel))
        .route("/api/v1/subscriptions/payments/", get(my_payments))
        .route("/api/v1/subscriptions/checkout-session/", post(checkout_session))
        .route("/api/v1/subscriptions/stripe/webhook/", post(stripe_webhook))
}

#[derive(Debug, Deserialize)]
pub struct PlanRequest {
    pub plan_id: Uuid,
}

fn return_url(state: &AppState) -> String {
    format!(
        "{}/api/v1/subscriptions/me/",
        state.config.frontend_url.trim_end_matches('/')
    )
}

/// GET /api/v1/subscriptions/plans/
async fn list_plans(State(state): State<AppState>) -> Result<Json<Vec<SubscriptionPlan>>, AppError> {
    Ok(Json(SubscriptionService::list_plans(&state.pool).await?))
}

/// GET /api/v1/subscriptions/me/
async fn my_subscription(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<SubscriptionDetails>, AppError> {
    Ok(Json(SubscriptionService::for_user(&state.pool, auth.id()).await?))
}

/// POST /api/v1/subscriptions/upgrade/
async fn upgrade(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<PlanRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let url = SubscriptionService::start_checkout(
        &state.pool,
        &state.stripe,
        &auth.user,
        req.plan_id,
        &return_url(&state),
        true,
    )
    .await?;
    Ok(Json(json!({ "checkout_url": url })))
}

/// POST /api/v1/subscriptions/checkout-session/
async fn checkout_session(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<PlanRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let url = SubscriptionService::start_checkout(
        &state.pool,
        &state.stripe,
        &auth.user,
        req.plan_id,
        &return_url(&state),
        false,
    )
    .await?;
    Ok(Json(json!({ "checkout_url": url })))
}

/// POST /api/v1/subscriptions/cancel/
async fn cancel(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<serde_json::Value>, AppError> {
    SubscriptionService::cancel(&state.pool, &state.stripe, auth.id()).await?;
    Ok(Json(json!({
        "message": "Subscription cancelled and reverted to basic plan"
    })))
}

/// GET /api/v1/subscriptions/payments/
async fn my_payments(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Vec<Payment>>, AppError> {
    Ok(Json(SubscriptionService::payments_for_user(&state.pool, auth.id()).await?))
}

/// POST /api/v1/subscriptions/stripe/webhook/
///
/// The body is read raw so the signature is checked over the exact bytes Stripe sent.
async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Bytes,
) -> Result<StatusCode, AppError> {
    let secret = state
        .config
        .stripe_webhook_secret
        .as_deref()
        .ok_or_else(|| AppError::Config("STRIPE_WEBHOOK_SECRET is not set".to_string()))?;
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Validation("Missing Stripe-Signature header".to_string()))?;

    verify_signature(&payload, signature, secret, Utc::now().timestamp())?;
    let event: WebhookEvent = serde_json::from_slice(&payload)
        .map_err(|e| AppError::Validation(format!("Invalid webhook payload: {}", e)))?;

    SubscriptionService::handle_webhook(&state.pool, &event).await?;
    Ok(StatusCode::OK)
}
