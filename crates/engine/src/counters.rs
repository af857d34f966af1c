//! Denormalised counters on projects, memberships, tasks and profiles.
//!
//! Counters are recomputed from the source rows rather than incremented, so a
//! refresh after any change leaves them exact.

use sqlx::PgPool;
use uuid::Uuid;

use planner_common::error::AppError;

pub struct Counters;

impl Counters {
    /// Recompute a project's task and member totals and every member's task counts.
    pub async fn refresh_project(pool: &PgPool, project_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE projects SET
                total_tasks = (SELECT COUNT(*) FROM tasks WHERE project_id = $1),
                total_member_count = (SELECT COUNT(*) FROM project_memberships WHERE project_id = $1)
            WHERE id = $1
            "#,
        )
        .bind(project_id)
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            UPDATE project_memberships m SET
                total_tasks = (
                    SELECT COUNT(*) FROM task_assignments a
                    JOIN tasks t ON t.id = a.task_id
                    WHERE t.project_id = m.project_id AND a.user_id = m.user_id
                ),
                completed_tasks = (
                    SELECT COUNT(*) FROM task_assignments a
                    JOIN tasks t ON t.id = a.task_id
                    WHERE t.project_id = m.project_id AND a.user_id = m.user_id
                      AND t.status = 'completed'
                )
            WHERE m.project_id = $1
            "#,
        )
        .bind(project_id)
        .execute(pool)
        .await?;

        tracing::trace!(project_id = %project_id, "Project counters refreshed");
        Ok(())
    }

    pub async fn refresh_task(pool: &PgPool, task_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE tasks SET total_assignees = (SELECT COUNT(*) FROM task_assignments WHERE task_id = $1) WHERE id = $1",
        )
        .bind(task_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Recompute owned and participated project counts for the given users.
    pub async fn refresh_profiles(pool: &PgPool, user_ids: &[Uuid]) -> Result<(), AppError> {
        if user_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE profiles p SET
                owned_projects_count = (SELECT COUNT(*) FROM projects WHERE owner_id = p.user_id),
                participated_projects_count = (SELECT COUNT(*) FROM project_memberships WHERE user_id = p.user_id)
            WHERE p.user_id = ANY($1)
            "#,
        )
        .bind(user_ids)
        .execute(pool)
        .await?;
        Ok(())
    }
}
