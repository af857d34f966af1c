//! Requests to complete tasks that need approval.

use redis::aio::ConnectionManager;
use serde::Deserialize;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use planner_common::error::AppError;
use planner_common::pagination::{PageParams, Paginated};
use planner_common::types::{
    NotificationType, Project, ProjectStatus, RequestStatus, StatusChangeRequest, Task,
    TaskStatus, User,
};

use crate::counters::Counters;
use crate::notifications::{NewNotification, NotificationService};
use crate::projects::ProjectService;
use crate::tasks::TaskService;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestFilters {
    pub task_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub status: Option<RequestStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRequest {
    pub task: Uuid,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestAction {
    Accept,
    Reject,
}

impl RequestAction {
    pub fn resolved_status(&self) -> RequestStatus {
        match self {
            RequestAction::Accept => RequestStatus::Approved,
            RequestAction::Reject => RequestStatus::Rejected,
        }
    }
}

/// Status change requests can only be raised or edited on running projects.
pub fn check_project_accepts_requests(status: ProjectStatus, verb: &str) -> Result<(), AppError> {
    match status {
        ProjectStatus::Completed => Err(AppError::Validation(format!(
            "Cannot {} status change requests for completed projects.",
            verb
        ))),
        ProjectStatus::OnHold => Err(AppError::Validation(format!(
            "Cannot {} status change requests for on hold projects.",
            verb
        ))),
        _ => Ok(()),
    }
}

fn request_url(request_id: Uuid) -> String {
    format!("/api/v1/tasks/status/change/requests/{}/", request_id)
}

pub struct StatusRequestService;

impl StatusRequestService {
    pub async fn get(pool: &PgPool, request_id: Uuid) -> Result<StatusChangeRequest, AppError> {
        let request: StatusChangeRequest =
            sqlx::query_as("SELECT * FROM status_change_requests WHERE id = $1")
                .bind(request_id)
                .fetch_optional(pool)
                .await?
                .ok_or_else(|| AppError::NotFound("Status change request not found.".to_string()))?;
        Ok(request)
    }

    /// Requests the user made, or on tasks they assigned or whose project they own.
    pub async fn list(
        pool: &PgPool,
        user_id: Uuid,
        filters: &RequestFilters,
        page: &PageParams,
    ) -> Result<Paginated<StatusChangeRequest>, AppError> {
        if let Some(task_id) = filters.task_id {
            let task = TaskService::get(pool, task_id).await?;
            if !Self::can_manage(pool, &task, user_id).await?
                && !TaskService::is_assignee(pool, task_id, user_id).await?
            {
                return Err(AppError::Forbidden("You are not assigned to this task.".to_string()));
            }
        }
        if let Some(project_id) = filters.project_id {
            let project = ProjectService::get(pool, project_id).await?;
            if project.owner_id != user_id && !ProjectService::is_member(pool, project_id, user_id).await? {
                return Err(AppError::Forbidden(
                    "You are not a member of this project or the owner.".to_string(),
                ));
            }
        }

        let build = |select: &str| {
            let mut qb = QueryBuilder::<Postgres>::new(select);
            qb.push(" FROM status_change_requests r JOIN tasks t ON t.id = r.task_id WHERE (r.user_id = ")
                .push_bind(user_id)
                .push(" OR t.assigned_by = ")
                .push_bind(user_id)
                .push(" OR EXISTS (SELECT 1 FROM projects p WHERE p.id = t.project_id AND p.owner_id = ")
                .push_bind(user_id)
                .push("))");
            if let Some(task_id) = filters.task_id {
                qb.push(" AND r.task_id = ").push_bind(task_id);
            }
            if let Some(project_id) = filters.project_id {
                qb.push(" AND t.project_id = ").push_bind(project_id);
            }
            if let Some(status) = filters.status {
                qb.push(" AND r.status = ").push_bind(status);
            }
            qb
        };

        let total: i64 = build("SELECT COUNT(*)").build_query_scalar().fetch_one(pool).await?;
        let mut select = build("SELECT r.*");
        select.push(" ORDER BY r.request_time DESC");
        select.push(" LIMIT ").push_bind(page.limit());
        select.push(" OFFSET ").push_bind(page.offset());
        let rows: Vec<StatusChangeRequest> = select.build_query_as().fetch_all(pool).await?;

        Ok(Paginated::new(rows, total, page))
    }

    pub async fn create(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        user: &User,
        params: &CreateRequest,
    ) -> Result<StatusChangeRequest, AppError> {
        let task = TaskService::get(pool, params.task).await?;
        let project = ProjectService::get(pool, task.project_id).await?;

        if !TaskService::is_assignee(pool, task.id, user.id).await? {
            return Err(AppError::Validation(
                "You must be assigned to the task to request status change".to_string(),
            ));
        }
        if !matches!(task.status, TaskStatus::InProgress | TaskStatus::Overdue) {
            return Err(AppError::Validation(
                "Only tasks that are 'in_progress' or 'overdue' can be marked as completed".to_string(),
            ));
        }
        if !task.need_approval {
            return Err(AppError::Validation(
                "Task doesn't require approval to be completed".to_string(),
            ));
        }
        check_project_accepts_requests(project.status, "create")?;

        let request: StatusChangeRequest = sqlx::query_as(
            r#"
            INSERT INTO status_change_requests (id, task_id, user_id, reason)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(task.id)
        .bind(user.id)
        .bind(&params.reason)
        .fetch_one(pool)
        .await?;

        if let Some(assigner) = task.assigned_by {
            let note = NewNotification::new(
                assigner,
                NotificationType::Task,
                "Status Change Request",
                format!(
                    "'{}' created a status change request for task: '{}'.",
                    user.username, task.name
                ),
            )
            .from_sender(user.id)
            .with_url(request_url(request.id))
            .about("status_change_request", request.id);
            NotificationService::notify(pool, redis, note).await;
        }

        tracing::info!(request_id = %request.id, task_id = %task.id, "Status change requested");
        Ok(request)
    }

    /// Load a request the caller may see: their own, or one they can act on.
    pub async fn visible(
        pool: &PgPool,
        user_id: Uuid,
        request_id: Uuid,
    ) -> Result<(StatusChangeRequest, Task, Project), AppError> {
        let request = Self::get(pool, request_id).await?;
        let task = TaskService::get(pool, request.task_id).await?;
        if request.user_id != user_id && !Self::can_manage(pool, &task, user_id).await? {
            return Err(AppError::NotFound("Status change request not found.".to_string()));
        }
        let project = ProjectService::get(pool, task.project_id).await?;
        Ok((request, task, project))
    }

    pub async fn update(
        pool: &PgPool,
        user_id: Uuid,
        request_id: Uuid,
        params: &UpdateRequest,
    ) -> Result<StatusChangeRequest, AppError> {
        let (request, _, project) = Self::visible(pool, user_id, request_id).await?;
        if request.status != RequestStatus::Pending {
            return Err(AppError::Validation(
                "Only pending status change requests can be updated.".to_string(),
            ));
        }
        check_project_accepts_requests(project.status, "update")?;

        let request: StatusChangeRequest = sqlx::query_as(
            "UPDATE status_change_requests SET reason = COALESCE($1, reason) WHERE id = $2 RETURNING *",
        )
        .bind(&params.reason)
        .bind(request_id)
        .fetch_one(pool)
        .await?;
        Ok(request)
    }

    pub async fn delete(pool: &PgPool, user_id: Uuid, request_id: Uuid) -> Result<(), AppError> {
        Self::visible(pool, user_id, request_id).await?;
        sqlx::query("DELETE FROM status_change_requests WHERE id = $1")
            .bind(request_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Accept or reject a pending request as the task's assigner or project owner.
    pub async fn act(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        user_id: Uuid,
        request_id: Uuid,
        action: RequestAction,
    ) -> Result<StatusChangeRequest, AppError> {
        let request = Self::get(pool, request_id).await?;
        let task = TaskService::get(pool, request.task_id).await?;
        if !Self::can_manage(pool, &task, user_id).await? {
            return Err(AppError::Forbidden(
                "You do not have permission to perform this action.".to_string(),
            ));
        }

        let resolved = Self::resolve(pool, &request, action.resolved_status(), Some(user_id), false)
            .await?
            .ok_or_else(|| AppError::Validation("This status change request is not pending.".to_string()))?;

        let note = NewNotification::new(
            resolved.user_id,
            NotificationType::Task,
            "Status Change Request Update",
            format!(
                "Your status change request for '{}' has been {}.",
                task.name, resolved.status
            ),
        )
        .from_sender(user_id)
        .with_url(request_url(resolved.id))
        .about("status_change_request", resolved.id);
        NotificationService::notify(pool, redis, note).await;

        Ok(resolved)
    }

    /// Move a pending request to `status` and apply it to the task.
    ///
    /// Approval completes the task. Rejection leaves the task alone unless
    /// `reopen_on_reject` is set, which returns it to in progress.
    /// Returns `None` if the request was no longer pending.
    pub async fn resolve(
        pool: &PgPool,
        request: &StatusChangeRequest,
        status: RequestStatus,
        resolver: Option<Uuid>,
        reopen_on_reject: bool,
    ) -> Result<Option<StatusChangeRequest>, AppError> {
        let approved_by = (status == RequestStatus::Approved).then_some(resolver).flatten();
        let resolved: Option<StatusChangeRequest> = sqlx::query_as(
            r#"
            UPDATE status_change_requests
            SET status = $1, approved_by = $2, resolution_time = now()
            WHERE id = $3 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(status)
        .bind(approved_by)
        .bind(request.id)
        .fetch_optional(pool)
        .await?;

        let Some(resolved) = resolved else {
            return Ok(None);
        };

        let task = match status {
            RequestStatus::Approved => {
                TaskService::set_status(pool, request.task_id, TaskStatus::Completed, approved_by).await?
            }
            RequestStatus::Rejected if reopen_on_reject => {
                TaskService::set_status(pool, request.task_id, TaskStatus::InProgress, None).await?
            }
            RequestStatus::Rejected | RequestStatus::Pending => {
                TaskService::get(pool, request.task_id).await?
            }
        };
        Counters::refresh_project(pool, task.project_id).await?;

        tracing::info!(request_id = %resolved.id, status = %resolved.status, "Status change request resolved");
        Ok(Some(resolved))
    }

    /// The task's assigner and the project owner may act on its requests.
    async fn can_manage(pool: &PgPool, task: &Task, user_id: Uuid) -> Result<bool, AppError> {
        if task.assigned_by == Some(user_id) {
            return Ok(true);
        }
        let project = ProjectService::get(pool, task.project_id).await?;
        Ok(project.owner_id == user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_parses_lowercase() {
        let action: RequestAction = serde_json::from_str(r#""accept""#).unwrap();
        assert_eq!(action, RequestAction::Accept);
        assert_eq!(action.resolved_status(), RequestStatus::Approved);
        assert!(serde_json::from_str::<RequestAction>(r#""approve""#).is_err());
    }

    #[test]
    fn test_project_gate() {
        assert!(check_project_accepts_requests(ProjectStatus::InProgress, "create").is_ok());
        let err = check_project_accepts_requests(ProjectStatus::OnHold, "update").unwrap_err();
        assert_eq!(
            err.public_message(),
            "Cannot update status change requests for on hold projects."
        );
    }
}
