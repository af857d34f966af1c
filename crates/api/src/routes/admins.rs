//! Staff-only routes under `/api/v1/admins/`. Every handler takes `AdminUser`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use uuid::Uuid;

use planner_common::error::AppError;
use planner_common::pagination::{PageParams, Paginated};
use planner_common::types::{
    AdminActionLog, Comment, Notification, Payment, Project, StatusChangeRequest, Subscription,
    SubscriptionPlan, Task, TaskAssignment, User,
};
use planner_engine::admin::billing::{
    AdminBilling, AdminPaymentFilters, AdminSubscriptionFilters, CancelRequest, PaymentStats,
    PlanStats,
};
use planner_engine::admin::broadcast::{AdminNotifications, Broadcast, BulkNotifications};
use planner_engine::admin::projects::{
    AdminInvite, AdminProjectFilters, AdminProjectUpdate, AdminProjects, BulkAddMembers,
    BulkProjects, BulkRemoveMembers, BulkStatusChange, InviteReport,
};
use planner_engine::admin::users::{AdminUserUpdate, AdminUsers, BulkEmail, BulkUsers, UserFilters};
use planner_engine::admin::work::{
    AdminCommentFilters, AdminRequestFilters, AdminTaskFilters, AdminWork, AssignmentFilters,
    BulkAssignment, BulkDecision, BulkTaskUpdate,
};
use planner_engine::admin::{ActionLogFilters, AuditLog};
use planner_engine::analytics::Analytics;
use planner_engine::notifications::{NotificationFilters, NotificationStats};
use planner_engine::projects::ProjectDetail;
use planner_engine::subscriptions::SubscriptionDetails;
use planner_engine::users::UserService;

use crate::middleware::auth::AdminUser;
use crate::state::AppState;

const BASE: &str = "/api/v1/admins";

fn path(suffix: &str) -> String {
    format!("{}/{}", BASE, suffix)
}

pub fn router() -> Router<AppState> {
    Router::new()
        // Users
        .route(&path("users/"), get(list_users))
        .route(&path("users/activate/"), post(activate_users))
        .route(&path("users/deactivate/"), post(deactivate_users))
        .route(&path("users/send_email/"), post(email_users))
        .route(
            &path("users/{id}/"),
            get(get_user).patch(update_user).delete(delete_user),
        )
        // Projects and memberships
        .route(&path("projects/"), get(list_projects))
        .route(&path("projects/bulk_delete/"), post(bulk_delete_projects))
        .route(&path("projects/bulk_change_status/"), post(bulk_change_status))
        .route(&path("projects/invite/"), post(invite_to_project))
        .route(
            &path("projects/{id}/"),
            get(get_project).patch(update_project).delete(delete_project),
        )
        .route(&path("memberships/bulk_add/"), post(bulk_add_members))
        .route(&path("memberships/bulk_remove/"), post(bulk_remove_members))
        // Tasks
        .route(&path("tasks/"), get(list_tasks))
        .route(&path("tasks/bulk-update/"), post(bulk_update_tasks))
        .route(&path("tasks/assign/"), post(assign_tasks))
        .route(&path("tasks/unassign/"), post(unassign_tasks))
        .route(&path("task-assignments/"), get(list_assignments))
        .route(&path("status-change-requests/"), get(list_status_requests))
        .route(
            &path("status-change-requests/bulk-update/"),
            post(decide_status_requests),
        )
        // Subscriptions and billing
        .route(&path("subscriptions/"), get(list_subscriptions))
        .route(&path("subscriptions/plans/"), get(list_plans))
        .route(&path("subscriptions/plan-stats/"), get(plan_stats))
        .route(&path("subscriptions/payments/"), get(list_payments))
        .route(&path("subscriptions/payment-stats/"), get(payment_stats))
        .route(&path("subscriptions/dashboard-stats/"), get(dashboard_stats))
        .route(
            &path("subscriptions/{id}/cancel-subscription/"),
            post(cancel_subscription),
        )
        .route(
            &path("subscriptions/{id}/renew-subscription/"),
            post(renew_subscription),
        )
        // Notifications
        .route(&path("notifications/"), get(list_notifications))
        .route(&path("notifications/send/"), post(send_notifications))
        .route(&path("notifications/bulk_delete/"), post(bulk_delete_notifications))
        .route(&path("notifications/stats/"), get(notification_stats))
        .route(&path("notifications/{id}/resend/"), post(resend_notification))
        // Comments and the action log
        .route(&path("comments/"), get(list_comments))
        .route(&path("comments/{id}/"), delete(delete_comment))
        .route(&path("action-logs/"), get(list_action_logs))
        // Analytics and health
        .route(&path("analytics/user_activity/"), get(user_activity))
        .route(&path("analytics/project_stats/"), get(project_stats))
        .route(&path("analytics/task_stats/"), get(task_stats))
        .route(&path("analytics/subscription_stats/"), get(subscription_stats))
        .route(&path("health/check/"), get(health_check))
}

/// `{"status": message}`, the shape every admin bulk action answers with.
fn done(message: impl Into<String>) -> Json<Value> {
    Json(json!({ "status": message.into() }))
}

type Page<T> = Result<Json<Paginated<T>>, AppError>;

// Users

async fn list_users(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(filters): Query<UserFilters>,
    Query(page): Query<PageParams>,
) -> Page<User> {
    Ok(Json(AdminUsers::list(&state.pool, &filters, &page).await?))
}

async fn get_user(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> Result<Json<User>, AppError> {
    Ok(Json(UserService::get(&state.pool, id).await?))
}

async fn update_user(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<Uuid>,
    Json(update): Json<AdminUserUpdate>,
) -> Result<Json<User>, AppError> {
    Ok(Json(AdminUsers::update(&state.pool, admin.user(), id, &update).await?))
}

async fn delete_user(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    AdminUsers::delete(&state.pool, admin.user(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn activate_users(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(req): Json<BulkUsers>,
) -> Result<Json<Value>, AppError> {
    let result = AdminUsers::set_active(&state.pool, admin.user(), &req.user_ids, true).await?;
    Ok(done(format!("{} users activated", result.affected)))
}

async fn deactivate_users(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(req): Json<BulkUsers>,
) -> Result<Json<Value>, AppError> {
    let result = AdminUsers::set_active(&state.pool, admin.user(), &req.user_ids, false).await?;
    Ok(done(format!("{} users deactivated", result.affected)))
}

async fn email_users(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(req): Json<BulkEmail>,
) -> Result<Json<Value>, AppError> {
    let mut redis = state.redis.clone();
    let result = AdminUsers::send_email(&state.pool, &mut redis, admin.user(), &req).await?;
    Ok(done(format!("{} emails queued", result.affected)))
}

// Projects and memberships

async fn list_projects(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(filters): Query<AdminProjectFilters>,
    Query(page): Query<PageParams>,
) -> Page<Project> {
    Ok(Json(AdminProjects::list(&state.pool, &filters, &page).await?))
}

async fn get_project(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ProjectDetail>, AppError> {
    Ok(Json(AdminProjects::detail(&state.pool, id).await?))
}

async fn update_project(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<Uuid>,
    Json(update): Json<AdminProjectUpdate>,
) -> Result<Json<ProjectDetail>, AppError> {
    Ok(Json(AdminProjects::update(&state.pool, admin.user(), id, &update).await?))
}

async fn delete_project(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    AdminProjects::delete(&state.pool, admin.user(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn bulk_delete_projects(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(req): Json<BulkProjects>,
) -> Result<Json<Value>, AppError> {
    let result = AdminProjects::bulk_delete(&state.pool, admin.user(), &req.project_ids).await?;
    Ok(done(format!("{} projects deleted", result.affected)))
}

async fn bulk_change_status(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(req): Json<BulkStatusChange>,
) -> Result<Json<Value>, AppError> {
    let result = AdminProjects::bulk_change_status(&state.pool, admin.user(), &req).await?;
    Ok(done(format!(
        "{} projects updated to status {}",
        result.affected, req.status
    )))
}

async fn invite_to_project(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(req): Json<AdminInvite>,
) -> Result<Response, AppError> {
    let mut redis = state.redis.clone();
    let report: InviteReport = AdminProjects::invite(
        &state.pool,
        &mut redis,
        &state.config.frontend_url,
        admin.user(),
        &req,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(report)).into_response())
}

async fn bulk_add_members(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(req): Json<BulkAddMembers>,
) -> Result<Json<Value>, AppError> {
    let result = AdminProjects::bulk_add_members(&state.pool, admin.user(), &req).await?;
    Ok(done(format!("{} members added", result.affected)))
}

async fn bulk_remove_members(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(req): Json<BulkRemoveMembers>,
) -> Result<Json<Value>, AppError> {
    let result = AdminProjects::bulk_remove_members(&state.pool, admin.user(), &req).await?;
    Ok(done(format!("{} members removed", result.affected)))
}

// Tasks

async fn list_tasks(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(filters): Query<AdminTaskFilters>,
    Query(page): Query<PageParams>,
) -> Page<Task> {
    Ok(Json(AdminWork::tasks(&state.pool, &filters, &page).await?))
}

async fn bulk_update_tasks(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(req): Json<BulkTaskUpdate>,
) -> Result<Json<Value>, AppError> {
    let result = AdminWork::bulk_update_tasks(&state.pool, admin.user(), &req).await?;
    Ok(done(format!("{} tasks updated", result.affected)))
}

async fn assign_tasks(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(req): Json<BulkAssignment>,
) -> Result<Json<Value>, AppError> {
    let result = AdminWork::assign(&state.pool, admin.user(), &req).await?;
    Ok(done(format!("{} assignments created", result.affected)))
}

async fn unassign_tasks(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(req): Json<BulkAssignment>,
) -> Result<Json<Value>, AppError> {
    let result = AdminWork::unassign(&state.pool, admin.user(), &req).await?;
    Ok(done(format!("{} assignments deleted", result.affected)))
}

async fn list_assignments(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(filters): Query<AssignmentFilters>,
    Query(page): Query<PageParams>,
) -> Page<TaskAssignment> {
    Ok(Json(AdminWork::assignments(&state.pool, &filters, &page).await?))
}

async fn list_status_requests(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(filters): Query<AdminRequestFilters>,
    Query(page): Query<PageParams>,
) -> Page<StatusChangeRequest> {
    Ok(Json(AdminWork::status_requests(&state.pool, &filters, &page).await?))
}

async fn decide_status_requests(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(req): Json<BulkDecision>,
) -> Result<Json<Value>, AppError> {
    let mut redis = state.redis.clone();
    let result = AdminWork::decide_requests(&state.pool, &mut redis, admin.user(), &req).await?;
    Ok(Json(json!({
        "detail": "Bulk update completed.",
        "affected": result.affected,
    })))
}

// Subscriptions and billing

async fn list_subscriptions(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(filters): Query<AdminSubscriptionFilters>,
    Query(page): Query<PageParams>,
) -> Page<Subscription> {
    Ok(Json(AdminBilling::subscriptions(&state.pool, &filters, &page).await?))
}

async fn cancel_subscription(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<Value>, AppError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let details = AdminBilling::cancel(&state.pool, admin.user(), id, &request).await?;
    Ok(Json(json!({
        "status": "Subscription cancelled and reverted to basic plan",
        "new_plan": details.plan.name,
    })))
}

async fn renew_subscription(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<Uuid>,
) -> Result<Json<SubscriptionDetails>, AppError> {
    Ok(Json(AdminBilling::renew(&state.pool, admin.user(), id).await?))
}

async fn list_plans(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<Vec<SubscriptionPlan>>, AppError> {
    Ok(Json(AdminBilling::plans(&state.pool).await?))
}

async fn plan_stats(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<Vec<PlanStats>>, AppError> {
    Ok(Json(AdminBilling::plan_stats(&state.pool).await?))
}

async fn list_payments(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(filters): Query<AdminPaymentFilters>,
    Query(page): Query<PageParams>,
) -> Page<Payment> {
    Ok(Json(AdminBilling::payments(&state.pool, &filters, &page).await?))
}

async fn payment_stats(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<PaymentStats>, AppError> {
    Ok(Json(AdminBilling::payment_stats(&state.pool).await?))
}

async fn dashboard_stats(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<Value>, AppError> {
    Ok(Json(AdminBilling::dashboard_stats(&state.pool).await?))
}

// Notifications

async fn list_notifications(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(filters): Query<NotificationFilters>,
    Query(page): Query<PageParams>,
) -> Page<Notification> {
    Ok(Json(AdminNotifications::list(&state.pool, &filters, &page).await?))
}

async fn send_notifications(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(req): Json<Broadcast>,
) -> Result<Json<Value>, AppError> {
    let mut redis = state.redis.clone();
    let result = AdminNotifications::send(&state.pool, &mut redis, admin.user(), &req).await?;
    Ok(Json(json!({
        "status": "notifications sent",
        "recipients": result.affected,
    })))
}

async fn bulk_delete_notifications(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(req): Json<BulkNotifications>,
) -> Result<Json<Value>, AppError> {
    let result =
        AdminNotifications::bulk_delete(&state.pool, admin.user(), &req.notification_ids).await?;
    Ok(done(format!("{} notifications deleted", result.affected)))
}

async fn notification_stats(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<NotificationStats>, AppError> {
    Ok(Json(AdminNotifications::stats(&state.pool).await?))
}

async fn resend_notification(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let mut redis = state.redis.clone();
    let response = if AdminNotifications::resend(&state.pool, &mut redis, admin.user(), id).await? {
        (StatusCode::OK, done("Notification resent successfully"))
    } else {
        (StatusCode::BAD_REQUEST, done("Notification resend failed"))
    };
    Ok(response.into_response())
}

// Comments and the action log

async fn list_comments(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(filters): Query<AdminCommentFilters>,
    Query(page): Query<PageParams>,
) -> Page<Comment> {
    Ok(Json(AdminWork::comments(&state.pool, &filters, &page).await?))
}

async fn delete_comment(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    AdminWork::delete_comment(&state.pool, admin.user(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_action_logs(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(filters): Query<ActionLogFilters>,
    Query(page): Query<PageParams>,
) -> Page<AdminActionLog> {
    Ok(Json(AuditLog::list(&state.pool, &filters, &page).await?))
}

// Analytics and health

async fn user_activity(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<Value>, AppError> {
    let mut redis = state.redis.clone();
    Ok(Json(Analytics::user_activity(&state.pool, &mut redis).await?))
}

async fn project_stats(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<Value>, AppError> {
    let mut redis = state.redis.clone();
    Ok(Json(Analytics::project_stats(&state.pool, &mut redis).await?))
}

async fn task_stats(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<Value>, AppError> {
    let mut redis = state.redis.clone();
    Ok(Json(Analytics::task_stats(&state.pool, &mut redis).await?))
}

async fn subscription_stats(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<Value>, AppError> {
    let mut redis = state.redis.clone();
    Ok(Json(Analytics::subscription_stats(&state.pool, &mut redis).await?))
}

async fn health_check(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<Value>, AppError> {
    let mut redis = state.redis.clone();
    Ok(Json(Analytics::health(&state.pool, &mut redis).await?))
}
