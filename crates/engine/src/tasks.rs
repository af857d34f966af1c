//! Tasks and their assignments.

use chrono::{DateTime, NaiveDate, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use planner_common::error::AppError;
use planner_common::pagination::{PageParams, Paginated};
use planner_common::types::{NotificationType, Project, Task, TaskStatus, User};

use crate::counters::Counters;
use crate::notifications::{NewNotification, NotificationService};
use crate::projects::{ProjectService, check_due_date, dedup, diff_members};
use crate::query::{contains_pattern, order_by};

const ORDERING: &[(&str, &str)] = &[
    ("due_date", "t.due_date"),
    ("status", "t.status"),
    ("created_at", "t.created_at"),
    ("total_assignees", "t.total_assignees"),
];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilters {
    pub status: Option<TaskStatus>,
    pub project: Option<Uuid>,
    pub assigned_by: Option<Uuid>,
    pub need_approval: Option<bool>,
    pub due_date: Option<NaiveDate>,
    pub due_date_after: Option<DateTime<Utc>>,
    pub due_date_before: Option<DateTime<Utc>>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub assignee: Option<Uuid>,
    pub search: Option<String>,
    pub ordering: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTask {
    pub project: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub need_approval: bool,
    #[serde(default)]
    pub assignees: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTask {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub due_date: Option<DateTime<Utc>>,
    pub need_approval: Option<bool>,
    pub assignees: Option<Vec<Uuid>>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AssigneeSummary {
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: Task,
    pub assignments: Vec<AssigneeSummary>,
}

fn task_url(task_id: Uuid) -> String {
    format!("/api/v1/tasks/{}/", task_id)
}

pub struct TaskService;

impl TaskService {
    pub async fn get(pool: &PgPool, task_id: Uuid) -> Result<Task, AppError> {
        let task: Task = sqlx::query_as("SELECT * FROM tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::NotFound("Task not found".to_string()))?;
        Ok(task)
    }

    /// Tasks the user is assigned to or whose project they own.
    pub async fn list(
        pool: &PgPool,
        user_id: Uuid,
        filters: &TaskFilters,
        page: &PageParams,
    ) -> Result<Paginated<Task>, AppError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM tasks t WHERE ");
        push_visible(&mut count, user_id);
        push_filters(&mut count, filters);
        let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

        let mut select = QueryBuilder::<Postgres>::new("SELECT t.* FROM tasks t WHERE ");
        push_visible(&mut select, user_id);
        push_filters(&mut select, filters);
        select.push(" ORDER BY ");
        select.push(order_by(filters.ordering.as_deref(), ORDERING, "-due_date"));
        select.push(" LIMIT ").push_bind(page.limit());
        select.push(" OFFSET ").push_bind(page.offset());
        let tasks: Vec<Task> = select.build_query_as().fetch_all(pool).await?;

        Ok(Paginated::new(tasks, total, page))
    }

    pub async fn create(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        user: &User,
        params: &CreateTask,
    ) -> Result<TaskDetail, AppError> {
        let project = ProjectService::get(pool, params.project)
            .await
            .map_err(|_| AppError::Validation("Project does not exist.".to_string()))?;

        if !ProjectService::is_member(pool, project.id, user.id).await? {
            return Err(AppError::Forbidden(
                "You must be a member of the project to create tasks.".to_string(),
            ));
        }
        if !project.status.can_create_task() {
            return Err(AppError::Validation(format!(
                "Cannot create tasks when project is {}",
                project.status
            )));
        }
        if params.name.trim().is_empty() {
            return Err(AppError::Validation("Task name is required.".to_string()));
        }
        check_due_date(params.due_date)?;

        let assignees = dedup(&params.assignees);
        Self::ensure_members(pool, project.id, &assignees).await?;

        let task: Task = sqlx::query_as(
            r#"
            INSERT INTO tasks (id, project_id, name, description, status, due_date, assigned_by, need_approval)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(project.id)
        .bind(params.name.trim())
        .bind(&params.description)
        .bind(params.status.unwrap_or_default())
        .bind(params.due_date)
        .bind(user.id)
        .bind(params.need_approval)
        .fetch_one(pool)
        .await?;

        Self::assign(pool, task.id, &assignees).await?;
        Counters::refresh_task(pool, task.id).await?;
        Counters::refresh_project(pool, project.id).await?;

        let template = NewNotification::new(
            user.id,
            NotificationType::Task,
            "New Task Assigned",
            format!("You have been assigned to the task '{}'.", task.name),
        )
        .from_sender(user.id)
        .with_url(task_url(task.id))
        .about("task", task.id);
        NotificationService::notify_all(pool, redis, &assignees, &template).await;

        tracing::info!(task_id = %task.id, project_id = %project.id, assignees = assignees.len(), "Task created");
        Self::assemble(pool, task.id).await
    }

    /// Task with assignments. Visible to assignees and the project owner.
    pub async fn detail(pool: &PgPool, user_id: Uuid, task_id: Uuid) -> Result<TaskDetail, AppError> {
        let task = Self::get(pool, task_id).await?;
        let project = ProjectService::get(pool, task.project_id).await?;
        if project.owner_id != user_id && !Self::is_assignee(pool, task_id, user_id).await? {
            return Err(AppError::NotFound("Task not found".to_string()));
        }
        Self::assemble(pool, task_id).await
    }

    pub async fn assemble(pool: &PgPool, task_id: Uuid) -> Result<TaskDetail, AppError> {
        let task = Self::get(pool, task_id).await?;
        let assignments: Vec<AssigneeSummary> = sqlx::query_as(
            r#"
            SELECT u.id AS user_id, u.username, u.email, a.assigned_at
            FROM task_assignments a JOIN users u ON u.id = a.user_id
            WHERE a.task_id = $1
            ORDER BY a.assigned_at
            "#,
        )
        .bind(task_id)
        .fetch_all(pool)
        .await?;
        Ok(TaskDetail { task, assignments })
    }

    /// Load a task and its project, requiring the caller to own the project.
    async fn owned(pool: &PgPool, user_id: Uuid, task_id: Uuid, verb: &str) -> Result<(Task, Project), AppError> {
        let task = Self::get(pool, task_id).await?;
        let project = ProjectService::get(pool, task.project_id).await?;
        if project.owner_id != user_id {
            return Err(AppError::Forbidden(format!(
                "Only the project owner can {} this task.",
                verb
            )));
        }
        Ok((task, project))
    }

    pub async fn update(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        user_id: Uuid,
        task_id: Uuid,
        params: &UpdateTask,
    ) -> Result<TaskDetail, AppError> {
        let (_, project) = Self::owned(pool, user_id, task_id, "update").await?;
        if !project.status.can_perform_activity() {
            return Err(AppError::Validation(format!(
                "Can't update task of {} project.",
                project.status
            )));
        }
        check_due_date(params.due_date)?;

        let desired = params.assignees.as_deref().map(dedup);
        if let Some(desired) = &desired {
            Self::ensure_members(pool, project.id, desired).await?;
        }

        let task: Task = sqlx::query_as(
            r#"
            UPDATE tasks SET
                name = COALESCE($1, name),
                description = COALESCE($2, description),
                status = COALESCE($3, status),
                due_date = COALESCE($4, due_date),
                need_approval = COALESCE($5, need_approval),
                updated_at = now()
            WHERE id = $6
            RETURNING *
            "#,
        )
        .bind(params.name.as_deref().map(str::trim))
        .bind(&params.description)
        .bind(params.status)
        .bind(params.due_date)
        .bind(params.need_approval)
        .bind(task_id)
        .fetch_one(pool)
        .await?;

        if let Some(desired) = desired {
            let current = Self::assignee_ids(pool, task_id).await?;
            let (added, removed) = diff_members(&current, &desired);
            Self::assign(pool, task_id, &added).await?;
            Self::unassign(pool, task_id, &removed).await?;

            let assigned = NewNotification::new(
                user_id,
                NotificationType::Task,
                "Task Assigned",
                format!("You have been assigned to the task '{}'.", task.name),
            )
            .from_sender(user_id)
            .with_url(task_url(task_id))
            .about("task", task_id);
            NotificationService::notify_all(pool, redis, &added, &assigned).await;

            let unassigned = NewNotification::new(
                user_id,
                NotificationType::Task,
                "Task Unassigned",
                format!("You have been unassigned from the task '{}'.", task.name),
            )
            .from_sender(user_id)
            .about("task", task_id);
            NotificationService::notify_all(pool, redis, &removed, &unassigned).await;
        }

        Counters::refresh_task(pool, task_id).await?;
        Counters::refresh_project(pool, project.id).await?;

        tracing::info!(task_id = %task_id, "Task updated");
        Self::assemble(pool, task.id).await
    }

    pub async fn delete(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        user_id: Uuid,
        task_id: Uuid,
    ) -> Result<(), AppError> {
        let (task, project) = Self::owned(pool, user_id, task_id, "delete").await?;
        let assignees = Self::assignee_ids(pool, task_id).await?;

        sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(task_id)
            .execute(pool)
            .await?;
        Counters::refresh_project(pool, project.id).await?;

        let template = NewNotification::new(
            user_id,
            NotificationType::Task,
            "Task Deleted",
            format!("The task '{}' has been deleted.", task.name),
        )
        .from_sender(user_id);
        NotificationService::notify_all(pool, redis, &assignees, &template).await;

        tracing::info!(task_id = %task_id, "Task deleted");
        Ok(())
    }

    /// Mark a task completed as one of its assignees.
    pub async fn change_status(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        user_id: Uuid,
        task_id: Uuid,
        status: TaskStatus,
    ) -> Result<TaskDetail, AppError> {
        if status != TaskStatus::Completed {
            return Err(AppError::Validation("Invalid status value.".to_string()));
        }
        let task = Self::get(pool, task_id).await?;
        let project = ProjectService::get(pool, task.project_id).await?;
        if !project.status.can_perform_activity() {
            return Err(AppError::Validation(format!(
                "Can't update task of {} project.",
                project.status
            )));
        }
        if task.need_approval {
            return Err(AppError::Forbidden(
                "Task requires approval to change status.".to_string(),
            ));
        }
        if !Self::is_assignee(pool, task_id, user_id).await? {
            return Err(AppError::Forbidden(
                "You must be assigned to the task to change its status.".to_string(),
            ));
        }

        Self::set_status(pool, task_id, status, None).await?;
        Counters::refresh_project(pool, project.id).await?;

        let assignees = Self::assignee_ids(pool, task_id).await?;
        let template = NewNotification::new(
            user_id,
            NotificationType::Task,
            "Task Status Updated",
            format!(
                "The status of the task '{}' has been updated to '{}'.",
                task.name, status
            ),
        )
        .from_sender(user_id)
        .with_url(task_url(task_id))
        .about("task", task_id);
        NotificationService::notify_all(pool, redis, &assignees, &template).await;

        Self::assemble(pool, task_id).await
    }

    pub async fn set_status(
        pool: &PgPool,
        task_id: Uuid,
        status: TaskStatus,
        approved_by: Option<Uuid>,
    ) -> Result<Task, AppError> {
        let task: Task = sqlx::query_as(
            "UPDATE tasks SET status = $1, approved_by = $2, updated_at = now() WHERE id = $3 RETURNING *",
        )
        .bind(status)
        .bind(approved_by)
        .bind(task_id)
        .fetch_one(pool)
        .await?;
        Ok(task)
    }

    pub async fn is_assignee(pool: &PgPool, task_id: Uuid, user_id: Uuid) -> Result<bool, AppError> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM task_assignments WHERE task_id = $1 AND user_id = $2)",
        )
        .bind(task_id)
        .bind(user_id)
        .fetch_one(pool)
        .await?;
        Ok(exists)
    }

    pub async fn assignee_ids(pool: &PgPool, task_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        let ids: Vec<(Uuid,)> =
            sqlx::query_as("SELECT user_id FROM task_assignments WHERE task_id = $1 ORDER BY assigned_at")
                .bind(task_id)
                .fetch_all(pool)
                .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Add assignments, skipping existing ones. Returns the users newly assigned.
    pub async fn assign(pool: &PgPool, task_id: Uuid, user_ids: &[Uuid]) -> Result<Vec<Uuid>, AppError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let added: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO task_assignments (id, task_id, user_id)
            SELECT gen_random_uuid(), $1, u FROM UNNEST($2::uuid[]) AS u
            ON CONFLICT (task_id, user_id) DO NOTHING
            RETURNING user_id
            "#,
        )
        .bind(task_id)
        .bind(user_ids)
        .fetch_all(pool)
        .await?;
        Ok(added.into_iter().map(|(id,)| id).collect())
    }

    pub async fn unassign(pool: &PgPool, task_id: Uuid, user_ids: &[Uuid]) -> Result<Vec<Uuid>, AppError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let removed: Vec<(Uuid,)> = sqlx::query_as(
            "DELETE FROM task_assignments WHERE task_id = $1 AND user_id = ANY($2) RETURNING user_id",
        )
        .bind(task_id)
        .bind(user_ids)
        .fetch_all(pool)
        .await?;
        Ok(removed.into_iter().map(|(id,)| id).collect())
    }

    async fn ensure_members(pool: &PgPool, project_id: Uuid, user_ids: &[Uuid]) -> Result<(), AppError> {
        if user_ids.is_empty() {
            return Ok(());
        }
        let members = ProjectService::member_ids(pool, project_id).await?;
        if let Some(outsider) = user_ids.iter().find(|id| !members.contains(id)) {
            return Err(AppError::Validation(format!(
                "User {} is not a member of the project.",
                outsider
            )));
        }
        Ok(())
    }
}

fn push_visible(qb: &mut QueryBuilder<'_, Postgres>, user_id: Uuid) {
    qb.push("(EXISTS (SELECT 1 FROM task_assignments a WHERE a.task_id = t.id AND a.user_id = ")
        .push_bind(user_id)
        .push(") OR EXISTS (SELECT 1 FROM projects p WHERE p.id = t.project_id AND p.owner_id = ")
        .push_bind(user_id)
        .push("))");
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filters: &TaskFilters) {
    if let Some(status) = filters.status {
        qb.push(" AND t.status = ").push_bind(status);
    }
    if let Some(project) = filters.project {
        qb.push(" AND t.project_id = ").push_bind(project);
    }
    if let Some(assigned_by) = filters.assigned_by {
        qb.push(" AND t.assigned_by = ").push_bind(assigned_by);
    }
    if let Some(need_approval) = filters.need_approval {
        qb.push(" AND t.need_approval = ").push_bind(need_approval);
    }
    if let Some(day) = filters.due_date {
        qb.push(" AND (t.due_date AT TIME ZONE 'UTC')::date = ").push_bind(day);
    }
    if let Some(after) = filters.due_date_after {
        qb.push(" AND t.due_date >= ").push_bind(after);
    }
    if let Some(before) = filters.due_date_before {
        qb.push(" AND t.due_date <= ").push_bind(before);
    }
    if let Some(after) = filters.created_after {
        qb.push(" AND t.created_at >= ").push_bind(after);
    }
    if let Some(before) = filters.created_before {
        qb.push(" AND t.created_at <= ").push_bind(before);
    }
    if let Some(assignee) = filters.assignee {
        qb.push(" AND EXISTS (SELECT 1 FROM task_assignments x WHERE x.task_id = t.id AND x.user_id = ")
            .push_bind(assignee)
            .push(")");
    }
    if let Some(search) = filters.search.as_deref().filter(|s| !s.trim().is_empty()) {
        let pattern = contains_pattern(search.trim());
        qb.push(" AND (t.name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR t.description ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_body_defaults() {
        let body: CreateTask = serde_json::from_value(serde_json::json!({
            "project": Uuid::nil(),
            "name": "Write docs"
        }))
        .unwrap();
        assert!(!body.need_approval);
        assert!(body.assignees.is_empty());
        assert_eq!(body.status.unwrap_or_default(), TaskStatus::NotStarted);
    }

    #[test]
    fn test_filters_parse_exact_due_date() {
        let filters: TaskFilters = serde_json::from_value(serde_json::json!({
            "due_date": "2030-05-01",
            "status": "overdue"
        }))
        .unwrap();
        assert_eq!(filters.due_date, NaiveDate::from_ymd_opt(2030, 5, 1));
        assert_eq!(filters.status, Some(TaskStatus::Overdue));
    }
}
