//! Periodic housekeeping run by the scheduler.

use chrono::{Duration, Utc};
use redis::aio::ConnectionManager;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use planner_common::error::AppError;
use planner_common::types::NotificationType;

use crate::notifications::{KEEP_PER_USER, NewNotification, NotificationService};
use crate::otp::OtpService;
use crate::presence::PresenceTracker;

/// How far ahead a due date triggers a reminder.
pub const DUE_SOON_HOURS: i64 = 24;

pub const TASK_DUE_TITLE: &str = "Task Nearing Due Date";
pub const PROJECT_DUE_TITLE: &str = "Project Nearing Due Date";

#[derive(Debug, Clone, Default, Serialize)]
pub struct OverdueReport {
    pub task_reminders: usize,
    pub tasks_overdue: u64,
    pub project_reminders: usize,
    pub projects_overdue: u64,
}

pub struct Maintenance;

impl Maintenance {
    /// Remind people about work due within a day, then mark past-due work overdue.
    ///
    /// Each person is reminded once per task or project.
    pub async fn check_overdue_items(
        pool: &PgPool,
        redis: &mut ConnectionManager,
    ) -> Result<OverdueReport, AppError> {
        let now = Utc::now();
        let horizon = now + Duration::hours(DUE_SOON_HOURS);

        let task_targets: Vec<(Uuid, String, Uuid)> = sqlx::query_as(
            r#"
            SELECT t.id, t.name, a.user_id
            FROM tasks t JOIN task_assignments a ON a.task_id = t.id
            WHERE t.due_date > $1 AND t.due_date <= $2
              AND t.status IN ('not_started', 'in_progress')
              AND NOT EXISTS (
                  SELECT 1 FROM notifications n
                  WHERE n.recipient_id = a.user_id AND n.content_type = 'task'
                    AND n.object_id = t.id AND n.title = $3
              )
            "#,
        )
        .bind(now)
        .bind(horizon)
        .bind(TASK_DUE_TITLE)
        .fetch_all(pool)
        .await?;

        for (task_id, name, user_id) in &task_targets {
            let note = NewNotification::new(
                *user_id,
                NotificationType::Task,
                TASK_DUE_TITLE,
                format!("The task '{}' is nearing its due date.", name),
            )
            .with_url(format!("/api/v1/tasks/{}/", task_id))
            .about("task", *task_id);
            NotificationService::notify(pool, redis, note).await;
        }

        let tasks_overdue = sqlx::query(
            r#"
            UPDATE tasks SET status = 'overdue', updated_at = now()
            WHERE due_date < $1 AND status IN ('not_started', 'in_progress')
            "#,
        )
        .bind(now)
        .execute(pool)
        .await?
        .rows_affected();

        let project_targets: Vec<(Uuid, String, Uuid)> = sqlx::query_as(
            r#"
            SELECT p.id, p.name, m.user_id
            FROM projects p JOIN project_memberships m ON m.project_id = p.id
            WHERE p.due_date > $1 AND p.due_date <= $2
              AND p.status IN ('not_started', 'in_progress')
              AND NOT EXISTS (
                  SELECT 1 FROM notifications n
                  WHERE n.recipient_id = m.user_id AND n.content_type = 'project'
                    AND n.object_id = p.id AND n.title = $3
              )
            "#,
        )
        .bind(now)
        .bind(horizon)
        .bind(PROJECT_DUE_TITLE)
        .fetch_all(pool)
        .await?;

        for (project_id, name, user_id) in &project_targets {
            let note = NewNotification::new(
                *user_id,
                NotificationType::Project,
                PROJECT_DUE_TITLE,
                format!("The project '{}' is nearing its due date.", name),
            )
            .with_url(format!("/api/v1/projects/{}/", project_id))
            .about("project", *project_id);
            NotificationService::notify(pool, redis, note).await;
        }

        let projects_overdue = sqlx::query(
            r#"
            UPDATE projects SET status = 'overdue', updated_at = now()
            WHERE due_date < $1 AND status IN ('not_started', 'in_progress')
            "#,
        )
        .bind(now)
        .execute(pool)
        .await?
        .rows_affected();

        let report = OverdueReport {
            task_reminders: task_targets.len(),
            tasks_overdue,
            project_reminders: project_targets.len(),
            projects_overdue,
        };
        tracing::info!(
            task_reminders = report.task_reminders,
            tasks_overdue = report.tasks_overdue,
            project_reminders = report.project_reminders,
            projects_overdue = report.projects_overdue,
            "Checked overdue items"
        );
        Ok(report)
    }

    pub async fn prune_notifications(pool: &PgPool) -> Result<u64, AppError> {
        NotificationService::prune(pool, KEEP_PER_USER).await
    }

    pub async fn update_last_seen(pool: &PgPool, redis: &mut ConnectionManager) -> Result<usize, AppError> {
        PresenceTracker::flush(pool, redis).await
    }

    pub async fn cleanup_expired_otps(pool: &PgPool) -> Result<u64, AppError> {
        OtpService::purge_expired(pool).await
    }
}
