//! Notification service: persistence, real-time fan-out and retries.
//!
//! Every notification is stored first and then published on the recipient's
//! Redis channel (`notifications:user:<id>`). API instances subscribe to those
//! channels and forward payloads to connected WebSocket clients. A failed
//! publish marks the row `failed` and schedules a retry job on the queue.

use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use planner_common::error::AppError;
use planner_common::pagination::{PageParams, Paginated};
use planner_common::queue::{Job, JobQueue};
use planner_common::types::{
    DeliveryStatus, Notification, NotificationPayload, NotificationPreference, NotificationType,
    Priority,
};

use crate::query::{contains_pattern, order_by};

/// Attempts after which a notification is permanently failed.
pub const RETRY_LIMIT: i32 = 3;

/// Minimum spacing between delivery attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(60);

/// Result of a redelivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResendOutcome {
    Delivered,
    /// Publishing failed again. A further retry is queued while the budget lasts.
    Failed,
    AlreadyDelivered,
    Exhausted,
    /// The previous attempt was within `RETRY_DELAY`; carries the time left.
    TooSoon(Duration),
}

impl ResendOutcome {
    pub fn is_delivered(self) -> bool {
        matches!(self, ResendOutcome::Delivered | ResendOutcome::AlreadyDelivered)
    }
}

/// Newest notifications kept per user by the weekly prune.
pub const KEEP_PER_USER: i64 = 50;

/// Categories a user can switch on or off.
pub const PREFERENCE_KEYS: [&str; 5] = ["account", "project", "task", "comment", "subscription"];

pub const CHANNEL_PREFIX: &str = "notifications:user:";
pub const CHANNEL_PATTERN: &str = "notifications:user:*";

pub fn channel_for(user_id: Uuid) -> String {
    format!("{}{}", CHANNEL_PREFIX, user_id)
}

/// Recover the user id from a channel name published by [`channel_for`].
pub fn user_from_channel(channel: &str) -> Option<Uuid> {
    channel
        .strip_prefix(CHANNEL_PREFIX)
        .and_then(|id| Uuid::parse_str(id).ok())
}

pub fn default_preferences() -> Value {
    let map: Map<String, Value> = PREFERENCE_KEYS
        .iter()
        .map(|key| (key.to_string(), Value::Bool(true)))
        .collect();
    Value::Object(map)
}

/// Trim a comment body for use in a notification.
pub fn excerpt(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        content.to_string()
    } else {
        let cut: String = content.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

/// A notification about to be sent.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub recipient_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub title: String,
    pub body: String,
    pub url: Option<String>,
    pub notification_type: NotificationType,
    pub priority: Priority,
    pub content_type: Option<String>,
    pub object_id: Option<Uuid>,
}

impl NewNotification {
    pub fn new(
        recipient_id: Uuid,
        notification_type: NotificationType,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            recipient_id,
            sender_id: None,
            title: title.into(),
            body: body.into(),
            url: None,
            notification_type,
            priority: Priority::default(),
            content_type: None,
            object_id: None,
        }
    }

    pub fn from_sender(mut self, sender_id: Uuid) -> Self {
        self.sender_id = Some(sender_id);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach the object this notification is about.
    pub fn about(mut self, content_type: &str, object_id: Uuid) -> Self {
        self.content_type = Some(content_type.to_string());
        self.object_id = Some(object_id);
        self
    }

    /// Same notification addressed to someone else.
    pub fn to(&self, recipient_id: Uuid) -> Self {
        Self {
            recipient_id,
            ..self.clone()
        }
    }
}

/// Query-string filters for notification lists.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationFilters {
    pub is_read: Option<bool>,
    pub notification_type: Option<String>,
    pub priority: Option<Priority>,
    pub status: Option<DeliveryStatus>,
    pub recipient: Option<Uuid>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub search: Option<String>,
    pub ordering: Option<String>,
}

/// Aggregate counts shown on the admin dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationStats {
    pub total: i64,
    pub unread: i64,
    pub by_type: Value,
    pub by_status: Value,
    pub by_priority: Value,
}

const ORDERING: &[(&str, &str)] = &[
    ("created_at", "created_at"),
    ("priority", "priority"),
    ("status", "status"),
    ("retry_count", "retry_count"),
];

pub struct NotificationService;

impl NotificationService {
    /// Store and deliver a notification, honouring the recipient's preferences.
    ///
    /// Returns `None` when the recipient has switched this category off.
    pub async fn send(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        new: NewNotification,
    ) -> Result<Option<Notification>, AppError> {
        if let Some(key) = new.notification_type.preference_key()
            && !Self::is_enabled(pool, new.recipient_id, key).await?
        {
            tracing::debug!(
                recipient_id = %new.recipient_id,
                category = key,
                "Notification suppressed by preferences"
            );
            return Ok(None);
        }

        let notification: Notification = sqlx::query_as(
            r#"
            INSERT INTO notifications
                (id, recipient_id, sender_id, title, message, url, notification_type,
                 priority, content_type, object_id, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending')
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.recipient_id)
        .bind(new.sender_id)
        .bind(&new.title)
        .bind(&new.body)
        .bind(&new.url)
        .bind(new.notification_type)
        .bind(new.priority)
        .bind(&new.content_type)
        .bind(new.object_id)
        .fetch_one(pool)
        .await?;

        let published = Self::publish(redis, &notification).await;
        let status = if published.is_ok() {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Failed
        };

        let notification: Notification = sqlx::query_as(
            "UPDATE notifications SET status = $1, last_attempt_at = now() WHERE id = $2 RETURNING *",
        )
        .bind(status)
        .bind(notification.id)
        .fetch_one(pool)
        .await?;

        // The retry job reads last_attempt_at, so it is stamped before scheduling.
        if let Err(e) = published {
            tracing::warn!(
                notification_id = %notification.id,
                error = %e,
                "Real-time delivery failed, scheduling retry"
            );
            let retry = Job::RetryNotification {
                notification_id: notification.id,
            };
            if let Err(e) = JobQueue::enqueue_in(redis, retry, RETRY_DELAY).await {
                tracing::error!(notification_id = %notification.id, error = %e, "Failed to schedule retry");
            }
        }

        tracing::debug!(
            notification_id = %notification.id,
            recipient_id = %notification.recipient_id,
            notification_type = %notification.notification_type,
            status = %notification.status,
            "Notification sent"
        );
        Ok(Some(notification))
    }

    /// Fire-and-forget variant of [`send`](Self::send) for side effects of other
    /// operations. Failures are logged and never propagate.
    pub async fn notify(pool: &PgPool, redis: &mut ConnectionManager, new: NewNotification) {
        let recipient_id = new.recipient_id;
        if let Err(e) = Self::send(pool, redis, new).await {
            tracing::warn!(recipient_id = %recipient_id, error = %e, "Failed to send notification");
        }
    }

    /// Send the same notification to each recipient.
    pub async fn notify_all(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        recipients: &[Uuid],
        template: &NewNotification,
    ) {
        for &recipient_id in recipients {
            Self::notify(pool, redis, template.to(recipient_id)).await;
        }
    }

    /// Publish a stored notification on its recipient's channel.
    pub async fn publish(
        redis: &mut ConnectionManager,
        notification: &Notification,
    ) -> Result<(), AppError> {
        let payload = NotificationPayload {
            title: notification.title.clone(),
            body: notification.message.clone(),
            url: notification.url.clone(),
        };
        let message = serde_json::to_string(&payload)
            .map_err(|e| AppError::Internal(format!("Failed to encode notification: {}", e)))?;

        redis::cmd("PUBLISH")
            .arg(channel_for(notification.recipient_id))
            .arg(message)
            .query_async::<i64>(redis)
            .await?;
        Ok(())
    }

    /// Retry delivery of a stored notification.
    ///
    /// Nothing is published when the retry budget is spent or the last attempt
    /// was too recent. Recency is measured against the database clock, which
    /// also stamped `last_attempt_at`.
    pub async fn resend(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        notification_id: Uuid,
    ) -> Result<ResendOutcome, AppError> {
        let notification = Self::get(pool, None, notification_id).await?;
        Self::attempt(pool, redis, notification).await
    }

    /// Scheduled retry. Skips notifications delivered since the job was queued.
    pub async fn retry(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        notification_id: Uuid,
    ) -> Result<ResendOutcome, AppError> {
        let notification = Self::get(pool, None, notification_id).await?;
        if notification.status == DeliveryStatus::Delivered {
            return Ok(ResendOutcome::AlreadyDelivered);
        }
        Self::attempt(pool, redis, notification).await
    }

    async fn attempt(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        notification: Notification,
    ) -> Result<ResendOutcome, AppError> {
        let notification_id = notification.id;

        if notification.retry_count >= RETRY_LIMIT {
            sqlx::query("UPDATE notifications SET status = 'failed' WHERE id = $1")
                .bind(notification_id)
                .execute(pool)
                .await?;
            return Ok(ResendOutcome::Exhausted);
        }

        if let Some(last) = notification.last_attempt_at {
            let (db_now,): (DateTime<Utc>,) = sqlx::query_as("SELECT now()").fetch_one(pool).await?;
            if let Some(wait) = retry_wait(last, db_now) {
                return Ok(ResendOutcome::TooSoon(wait));
            }
        }

        match Self::publish(redis, &notification).await {
            Ok(()) => {
                sqlx::query(
                    "UPDATE notifications SET status = 'delivered', retry_count = 0, last_attempt_at = now() WHERE id = $1",
                )
                .bind(notification_id)
                .execute(pool)
                .await?;
                tracing::info!(notification_id = %notification_id, "Notification redelivered");
                Ok(ResendOutcome::Delivered)
            }
            Err(e) => {
                let retry_count = notification.retry_count + 1;
                let status = retry_status(retry_count);
                sqlx::query(
                    "UPDATE notifications SET status = $1, retry_count = $2, last_attempt_at = now() WHERE id = $3",
                )
                .bind(status)
                .bind(retry_count)
                .bind(notification_id)
                .execute(pool)
                .await?;
                tracing::warn!(
                    notification_id = %notification_id,
                    retry_count,
                    error = %e,
                    "Notification redelivery failed"
                );
                if status == DeliveryStatus::Pending {
                    let retry = Job::RetryNotification { notification_id };
                    JobQueue::enqueue_in(redis, retry, RETRY_DELAY).await?;
                }
                Ok(ResendOutcome::Failed)
            }
        }
    }

    /// List notifications. `recipient` scopes to one user; `None` lists everyone's.
    pub async fn list(
        pool: &PgPool,
        recipient: Option<Uuid>,
        filters: &NotificationFilters,
        page: &PageParams,
    ) -> Result<Paginated<Notification>, AppError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM notifications WHERE TRUE");
        push_filters(&mut count, recipient, filters);
        let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

        let mut select = QueryBuilder::<Postgres>::new("SELECT * FROM notifications WHERE TRUE");
        push_filters(&mut select, recipient, filters);
        select.push(" ORDER BY ");
        select.push(order_by(filters.ordering.as_deref(), ORDERING, "-created_at"));
        select.push(" LIMIT ").push_bind(page.limit());
        select.push(" OFFSET ").push_bind(page.offset());
        let rows: Vec<Notification> = select.build_query_as().fetch_all(pool).await?;

        Ok(Paginated::new(rows, total, page))
    }

    /// Fetch one notification, optionally requiring it to belong to `recipient`.
    pub async fn get(
        pool: &PgPool,
        recipient: Option<Uuid>,
        notification_id: Uuid,
    ) -> Result<Notification, AppError> {
        let notification: Notification = sqlx::query_as(
            "SELECT * FROM notifications WHERE id = $1 AND ($2::uuid IS NULL OR recipient_id = $2)",
        )
        .bind(notification_id)
        .bind(recipient)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Notification not found.".to_string()))?;
        Ok(notification)
    }

    pub async fn set_read(
        pool: &PgPool,
        recipient: Uuid,
        notification_id: Uuid,
        is_read: bool,
    ) -> Result<Notification, AppError> {
        let notification: Notification = sqlx::query_as(
            "UPDATE notifications SET is_read = $1 WHERE id = $2 AND recipient_id = $3 RETURNING *",
        )
        .bind(is_read)
        .bind(notification_id)
        .bind(recipient)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Notification not found.".to_string()))?;
        Ok(notification)
    }

    /// Mark the given notifications read, or every unread one when `ids` is empty.
    pub async fn mark_read(pool: &PgPool, recipient: Uuid, ids: &[Uuid]) -> Result<u64, AppError> {
        let result = if ids.is_empty() {
            sqlx::query(
                "UPDATE notifications SET is_read = TRUE WHERE recipient_id = $1 AND is_read = FALSE",
            )
            .bind(recipient)
            .execute(pool)
            .await?
        } else {
            sqlx::query(
                "UPDATE notifications SET is_read = TRUE WHERE recipient_id = $1 AND id = ANY($2)",
            )
            .bind(recipient)
            .bind(ids)
            .execute(pool)
            .await?
        };
        Ok(result.rows_affected())
    }

    pub async fn delete_many(pool: &PgPool, ids: &[Uuid]) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = ANY($1)")
            .bind(ids)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Keep only the newest `keep` notifications of every recipient.
    pub async fn prune(pool: &PgPool, keep: i64) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM notifications
            WHERE id IN (
                SELECT id FROM (
                    SELECT id, ROW_NUMBER() OVER (PARTITION BY recipient_id ORDER BY created_at DESC) AS rank
                    FROM notifications
                ) ranked
                WHERE ranked.rank > $1
            )
            "#,
        )
        .bind(keep)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn stats(pool: &PgPool) -> Result<NotificationStats, AppError> {
        let (total, unread): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(*) FILTER (WHERE NOT is_read) FROM notifications",
        )
        .fetch_one(pool)
        .await?;

        Ok(NotificationStats {
            total,
            unread,
            by_type: count_by(pool, "notification_type").await?,
            by_status: count_by(pool, "status").await?,
            by_priority: count_by(pool, "priority").await?,
        })
    }

    /// The user's preferences, created with defaults on first access.
    pub async fn preferences(pool: &PgPool, user_id: Uuid) -> Result<NotificationPreference, AppError> {
        sqlx::query(
            "INSERT INTO notification_preferences (user_id, preferences) VALUES ($1, $2) ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(default_preferences())
        .execute(pool)
        .await?;

        let prefs: NotificationPreference =
            sqlx::query_as("SELECT * FROM notification_preferences WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(pool)
                .await?;
        Ok(prefs)
    }

    /// Apply preference changes. `replace` starts from defaults instead of the
    /// stored values, so omitted categories revert to enabled.
    pub async fn update_preferences(
        pool: &PgPool,
        user_id: Uuid,
        changes: &Map<String, Value>,
        replace: bool,
    ) -> Result<NotificationPreference, AppError> {
        validate_preferences(changes)?;

        let current = Self::preferences(pool, user_id).await?;
        let mut merged = if replace {
            default_preferences()
        } else {
            current.preferences
        };
        if let Value::Object(map) = &mut merged {
            for (key, value) in changes {
                map.insert(key.clone(), value.clone());
            }
        }

        let prefs: NotificationPreference = sqlx::query_as(
            "UPDATE notification_preferences SET preferences = $1, updated_at = now() WHERE user_id = $2 RETURNING *",
        )
        .bind(&merged)
        .bind(user_id)
        .fetch_one(pool)
        .await?;

        tracing::info!(user_id = %user_id, "Notification preferences updated");
        Ok(prefs)
    }

    async fn is_enabled(pool: &PgPool, user_id: Uuid, key: &str) -> Result<bool, AppError> {
        let prefs: Option<(Value,)> =
            sqlx::query_as("SELECT preferences FROM notification_preferences WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(pool)
                .await?;
        Ok(prefs
            .and_then(|(prefs,)| prefs.get(key).and_then(Value::as_bool))
            .unwrap_or(true))
    }
}

/// Status after a failed retry that brought the count to `retry_count`.
/// Time left before another attempt is allowed, or `None` once `RETRY_DELAY` has passed.
pub fn retry_wait(last_attempt: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
    let elapsed = (now - last_attempt).to_std().unwrap_or_default();
    RETRY_DELAY.checked_sub(elapsed).filter(|wait| !wait.is_zero())
}

pub fn retry_status(retry_count: i32) -> DeliveryStatus {
    if retry_count >= RETRY_LIMIT {
        DeliveryStatus::Failed
    } else {
        DeliveryStatus::Pending
    }
}

pub fn validate_preferences(changes: &Map<String, Value>) -> Result<(), AppError> {
    for (key, value) in changes {
        if !PREFERENCE_KEYS.contains(&key.as_str()) {
            return Err(AppError::Validation(format!(
                "Invalid notification type: {}",
                key
            )));
        }
        if !value.is_boolean() {
            return Err(AppError::Validation(format!(
                "Preference '{}' must be true or false",
                key
            )));
        }
    }
    Ok(())
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, recipient: Option<Uuid>, filters: &NotificationFilters) {
    if let Some(recipient) = recipient.or(filters.recipient) {
        qb.push(" AND recipient_id = ").push_bind(recipient);
    }
    if let Some(is_read) = filters.is_read {
        qb.push(" AND is_read = ").push_bind(is_read);
    }
    if let Some(kind) = &filters.notification_type {
        qb.push(" AND lower(notification_type) = lower(")
            .push_bind(kind.clone())
            .push(")");
    }
    if let Some(priority) = filters.priority {
        qb.push(" AND priority = ").push_bind(priority);
    }
    if let Some(status) = filters.status {
        qb.push(" AND status = ").push_bind(status);
    }
    if let Some(after) = filters.created_after {
        qb.push(" AND created_at >= ").push_bind(after);
    }
    if let Some(before) = filters.created_before {
        qb.push(" AND created_at <= ").push_bind(before);
    }
    if let Some(search) = filters.search.as_deref().filter(|s| !s.trim().is_empty()) {
        qb.push(" AND message ILIKE ").push_bind(contains_pattern(search.trim()));
    }
}

async fn count_by(pool: &PgPool, column: &'static str) -> Result<Value, AppError> {
    let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
        "SELECT {column}, COUNT(*) FROM notifications GROUP BY {column} ORDER BY {column}"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(key, count)| (key, json!(count)))
        .collect::<Map<String, Value>>()
        .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_round_trip() {
        let id = Uuid::new_v4();
        let channel = channel_for(id);
        assert!(channel.starts_with("notifications:user:"));
        assert_eq!(user_from_channel(&channel), Some(id));
        assert_eq!(user_from_channel("other:channel"), None);
    }

    #[test]
    fn test_default_preferences_enable_every_category() {
        let prefs = default_preferences();
        for key in PREFERENCE_KEYS {
            assert_eq!(prefs[key], Value::Bool(true));
        }
    }

    #[test]
    fn test_preference_validation() {
        let ok: Map<String, Value> = serde_json::from_value(json!({"task": false})).unwrap();
        assert!(validate_preferences(&ok).is_ok());

        let unknown: Map<String, Value> = serde_json::from_value(json!({"sms": true})).unwrap();
        assert!(validate_preferences(&unknown).is_err());

        let not_bool: Map<String, Value> = serde_json::from_value(json!({"task": "yes"})).unwrap();
        assert!(validate_preferences(&not_bool).is_err());
    }

    #[test]
    fn test_retry_status_gives_up_at_limit() {
        assert_eq!(retry_status(1), DeliveryStatus::Pending);
        assert_eq!(retry_status(2), DeliveryStatus::Pending);
        assert_eq!(retry_status(3), DeliveryStatus::Failed);
    }

    #[test]
    fn test_retry_wait_keeps_sub_second_remainder() {
        let last = Utc::now();
        let now = last + chrono::Duration::milliseconds(59_400);
        assert_eq!(retry_wait(last, now), Some(Duration::from_millis(600)));
        assert_eq!(retry_wait(last, last), Some(RETRY_DELAY));
        assert_eq!(retry_wait(last, last + chrono::Duration::seconds(60)), None);
        assert_eq!(retry_wait(last, last + chrono::Duration::seconds(90)), None);
    }

    #[test]
    fn test_resend_outcome_delivery() {
        assert!(ResendOutcome::Delivered.is_delivered());
        assert!(!ResendOutcome::TooSoon(Duration::from_secs(1)).is_delivered());
        assert!(!ResendOutcome::Exhausted.is_delivered());
    }

    #[test]
    fn test_excerpt() {
        assert_eq!(excerpt("short", 50), "short");
        let long = "x".repeat(60);
        assert_eq!(excerpt(&long, 50), format!("{}...", "x".repeat(50)));
    }

    #[test]
    fn test_builder_copies_to_new_recipient() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let template = NewNotification::new(a, NotificationType::Task, "Title", "Body")
            .with_url("/tasks/1")
            .with_priority(Priority::High);
        let copy = template.to(b);
        assert_eq!(copy.recipient_id, b);
        assert_eq!(copy.title, "Title");
        assert_eq!(copy.priority, Priority::High);
        assert_eq!(copy.url.as_deref(), Some("/tasks/1"));
    }
}
