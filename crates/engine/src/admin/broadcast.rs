use redis::aio::ConnectionManager;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use planner_common::error::AppError;
use planner_common::pagination::{PageParams, Paginated};
use planner_common::types::{Notification, NotificationType, Priority, User};

use super::users::selection_json;
use super::{AuditLog, BulkResult, Selection};
use crate::notifications::{NewNotification, NotificationFilters, NotificationService, NotificationStats};

#[derive(Debug, Clone, Deserialize)]
pub struct Broadcast {
    pub title: String,
    pub body: String,
    pub url: Option<String>,
    pub priority: Option<Priority>,
    pub user_ids: Selection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkNotifications {
    pub notification_ids: Vec<Uuid>,
}

pub struct AdminNotifications;

impl AdminNotifications {
    pub async fn list(
        pool: &PgPool,
        filters: &NotificationFilters,
        page: &PageParams,
    ) -> Result<Paginated<Notification>, AppError> {
        NotificationService::list(pool, None, filters, page).await
    }

    /// Send an admin notification to the selected active users.
    pub async fn send(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        admin: &User,
        broadcast: &Broadcast,
    ) -> Result<BulkResult, AppError> {
        if broadcast.title.trim().is_empty() || broadcast.body.trim().is_empty() {
            return Err(AppError::Validation("Title and body are required.".to_string()));
        }
        if broadcast.user_ids.is_empty() {
            return Err(AppError::Validation("No users selected.".to_string()));
        }

        let recipients: Vec<(Uuid,)> =
            sqlx::query_as("SELECT id FROM users WHERE is_active AND ($1::uuid[] IS NULL OR id = ANY($1))")
                .bind(broadcast.user_ids.as_filter())
                .fetch_all(pool)
                .await?;
        let recipients: Vec<Uuid> = recipients.into_iter().map(|(id,)| id).collect();

        let mut template = NewNotification::new(
            admin.id,
            NotificationType::AdminNotification,
            broadcast.title.trim(),
            broadcast.body.trim(),
        )
        .from_sender(admin.id)
        .with_priority(broadcast.priority.unwrap_or_default());
        if let Some(url) = &broadcast.url {
            template = template.with_url(url.clone());
        }
        NotificationService::notify_all(pool, redis, &recipients, &template).await;

        AuditLog::record(
            pool,
            admin.id,
            "send",
            "notification",
            None,
            json!({
                "title": broadcast.title,
                "user_ids": selection_json(&broadcast.user_ids),
                "recipients": recipients.len(),
            }),
        )
        .await?;
        Ok(BulkResult {
            affected: recipients.len() as u64,
        })
    }

    pub async fn bulk_delete(pool: &PgPool, admin: &User, ids: &[Uuid]) -> Result<BulkResult, AppError> {
        let affected = NotificationService::delete_many(pool, ids).await?;
        AuditLog::record(
            pool,
            admin.id,
            "bulk_delete",
            "notification",
            None,
            json!({"notification_ids": ids, "affected": affected}),
        )
        .await?;
        Ok(BulkResult { affected })
    }

    pub async fn stats(pool: &PgPool) -> Result<NotificationStats, AppError> {
        NotificationService::stats(pool).await
    }

    /// Retry delivery of one notification. Returns whether it went out.
    pub async fn resend(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        admin: &User,
        notification_id: Uuid,
    ) -> Result<bool, AppError> {
        let outcome = NotificationService::resend(pool, redis, notification_id).await?;
        let delivered = outcome.is_delivered();
        AuditLog::record(
            pool,
            admin.id,
            "resend",
            "notification",
            Some(notification_id),
            json!({"delivered": delivered}),
        )
        .await?;
        Ok(delivered)
    }
}
