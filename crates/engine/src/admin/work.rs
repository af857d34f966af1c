//! Admin views over tasks, assignments, status-change requests and comments.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::Deserialize;
use serde_json::json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use planner_common::error::AppError;
use planner_common::pagination::{PageParams, Paginated};
use planner_common::types::{
    Comment, RequestStatus, StatusChangeRequest, Task, TaskAssignment, TaskStatus, User,
};

use super::{AuditLog, BulkResult};
use crate::analytics::Analytics;
use crate::comments::CommentService;
use crate::counters::Counters;
use crate::projects::{ProjectService, dedup};
use crate::query::order_by;
use crate::status_requests::StatusRequestService;
use crate::tasks::TaskService;

const TASK_ORDERING: &[(&str, &str)] = &[
    ("created_at", "created_at"),
    ("due_date", "due_date"),
    ("status", "status"),
];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminTaskFilters {
    pub status: Option<TaskStatus>,
    pub project: Option<Uuid>,
    pub need_approval: Option<bool>,
    pub assignee: Option<Uuid>,
    pub ordering: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkTaskUpdate {
    pub task_ids: Vec<Uuid>,
    pub due_date: Option<DateTime<Utc>>,
    pub project: Option<Uuid>,
    pub status: Option<TaskStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkAssignment {
    pub task_ids: Vec<Uuid>,
    pub user_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssignmentFilters {
    pub task: Option<Uuid>,
    pub user: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminRequestFilters {
    pub status: Option<RequestStatus>,
    pub task: Option<Uuid>,
    pub user: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn resolved_status(&self) -> RequestStatus {
        match self {
            Decision::Approve => RequestStatus::Approved,
            Decision::Reject => RequestStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkDecision {
    pub request_ids: Vec<Uuid>,
    pub action: Decision,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminCommentFilters {
    pub task: Option<Uuid>,
    pub author: Option<Uuid>,
    pub parent: Option<Uuid>,
}

pub struct AdminWork;

impl AdminWork {
    pub async fn tasks(
        pool: &PgPool,
        filters: &AdminTaskFilters,
        page: &PageParams,
    ) -> Result<Paginated<Task>, AppError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM tasks WHERE TRUE");
        push_task_filters(&mut count, filters);
        let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

        let mut select = QueryBuilder::<Postgres>::new("SELECT * FROM tasks WHERE TRUE");
        push_task_filters(&mut select, filters);
        select.push(" ORDER BY ");
        select.push(order_by(filters.ordering.as_deref(), TASK_ORDERING, "-created_at"));
        select.push(" LIMIT ").push_bind(page.limit());
        select.push(" OFFSET ").push_bind(page.offset());
        let tasks: Vec<Task> = select.build_query_as().fetch_all(pool).await?;

        Ok(Paginated::new(tasks, total, page))
    }

    /// Apply the same due date, project or status to many tasks.
    pub async fn bulk_update_tasks(
        pool: &PgPool,
        admin: &User,
        request: &BulkTaskUpdate,
    ) -> Result<BulkResult, AppError> {
        if request.due_date.is_none() && request.project.is_none() && request.status.is_none() {
            return Err(AppError::Validation(
                "Provide at least one of due_date, project or status.".to_string(),
            ));
        }
        if let Some(project_id) = request.project {
            ProjectService::get(pool, project_id).await?;
        }

        let previous: Vec<(Uuid,)> =
            sqlx::query_as("SELECT DISTINCT project_id FROM tasks WHERE id = ANY($1)")
                .bind(&request.task_ids)
                .fetch_all(pool)
                .await?;

        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                due_date = COALESCE($1, due_date),
                project_id = COALESCE($2, project_id),
                status = COALESCE($3, status),
                updated_at = now()
            WHERE id = ANY($4)
            "#,
        )
        .bind(request.due_date)
        .bind(request.project)
        .bind(request.status)
        .bind(&request.task_ids)
        .execute(pool)
        .await?;

        let mut touched: BTreeSet<Uuid> = previous.into_iter().map(|(id,)| id).collect();
        touched.extend(request.project);
        for project_id in touched {
            Counters::refresh_project(pool, project_id).await?;
        }

        AuditLog::record(
            pool,
            admin.id,
            "bulk_update",
            "task",
            None,
            json!({
                "task_ids": request.task_ids,
                "due_date": request.due_date,
                "project": request.project,
                "status": request.status,
            }),
        )
        .await?;
        Ok(BulkResult {
            affected: result.rows_affected(),
        })
    }

    /// Assign every user to every task. Existing assignments are kept.
    pub async fn assign(pool: &PgPool, admin: &User, request: &BulkAssignment) -> Result<BulkResult, AppError> {
        Self::reassign(pool, admin, request, true).await
    }

    pub async fn unassign(pool: &PgPool, admin: &User, request: &BulkAssignment) -> Result<BulkResult, AppError> {
        Self::reassign(pool, admin, request, false).await
    }

    async fn reassign(
        pool: &PgPool,
        admin: &User,
        request: &BulkAssignment,
        assign: bool,
    ) -> Result<BulkResult, AppError> {
        if request.task_ids.is_empty() || request.user_ids.is_empty() {
            return Err(AppError::Validation("task_ids and user_ids are required.".to_string()));
        }
        let users = dedup(&request.user_ids);

        let mut affected = 0;
        let mut projects = BTreeSet::new();
        for &task_id in &dedup(&request.task_ids) {
            let task = match TaskService::get(pool, task_id).await {
                Ok(task) => task,
                Err(AppError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let changed = if assign {
                TaskService::assign(pool, task.id, &users).await?
            } else {
                TaskService::unassign(pool, task.id, &users).await?
            };
            affected += changed.len() as u64;
            Counters::refresh_task(pool, task.id).await?;
            projects.insert(task.project_id);
        }
        for project_id in projects {
            Counters::refresh_project(pool, project_id).await?;
        }

        let action = if assign { "assign" } else { "unassign" };
        AuditLog::record(
            pool,
            admin.id,
            action,
            "task_assignment",
            None,
            json!({"task_ids": request.task_ids, "user_ids": users, "affected": affected}),
        )
        .await?;
        Ok(BulkResult { affected })
    }

    pub async fn assignments(
        pool: &PgPool,
        filters: &AssignmentFilters,
        page: &PageParams,
    ) -> Result<Paginated<TaskAssignment>, AppError> {
        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM task_assignments
            WHERE ($1::uuid IS NULL OR task_id = $1) AND ($2::uuid IS NULL OR user_id = $2)
            "#,
        )
        .bind(filters.task)
        .bind(filters.user)
        .fetch_one(pool)
        .await?;

        let rows: Vec<TaskAssignment> = sqlx::query_as(
            r#"
            SELECT * FROM task_assignments
            WHERE ($1::uuid IS NULL OR task_id = $1) AND ($2::uuid IS NULL OR user_id = $2)
            ORDER BY assigned_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filters.task)
        .bind(filters.user)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(pool)
        .await?;

        Ok(Paginated::new(rows, total, page))
    }

    pub async fn status_requests(
        pool: &PgPool,
        filters: &AdminRequestFilters,
        page: &PageParams,
    ) -> Result<Paginated<StatusChangeRequest>, AppError> {
        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM status_change_requests
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::uuid IS NULL OR task_id = $2)
              AND ($3::uuid IS NULL OR user_id = $3)
            "#,
        )
        .bind(filters.status)
        .bind(filters.task)
        .bind(filters.user)
        .fetch_one(pool)
        .await?;

        let rows: Vec<StatusChangeRequest> = sqlx::query_as(
            r#"
            SELECT * FROM status_change_requests
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::uuid IS NULL OR task_id = $2)
              AND ($3::uuid IS NULL OR user_id = $3)
            ORDER BY request_time DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(filters.status)
        .bind(filters.task)
        .bind(filters.user)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(pool)
        .await?;

        Ok(Paginated::new(rows, total, page))
    }

    /// Approve or reject pending requests. Requests already resolved are skipped.
    ///
    /// Rejected tasks go back to in progress.
    pub async fn decide_requests(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        admin: &User,
        request: &BulkDecision,
    ) -> Result<BulkResult, AppError> {
        let status = request.action.resolved_status();
        let mut resolved = Vec::new();
        for &request_id in &dedup(&request.request_ids) {
            let pending = match StatusRequestService::get(pool, request_id).await {
                Ok(pending) => pending,
                Err(AppError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if StatusRequestService::resolve(pool, &pending, status, Some(admin.id), true)
                .await?
                .is_some()
            {
                resolved.push(request_id);
            }
        }

        Analytics::invalidate(redis).await;
        AuditLog::record(
            pool,
            admin.id,
            "bulk_update",
            "status_change_request",
            None,
            json!({"resolved": resolved, "status": status}),
        )
        .await?;
        Ok(BulkResult {
            affected: resolved.len() as u64,
        })
    }

    pub async fn comments(
        pool: &PgPool,
        filters: &AdminCommentFilters,
        page: &PageParams,
    ) -> Result<Paginated<Comment>, AppError> {
        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM comments
            WHERE ($1::uuid IS NULL OR task_id = $1)
              AND ($2::uuid IS NULL OR author_id = $2)
              AND ($3::uuid IS NULL OR parent_id = $3)
            "#,
        )
        .bind(filters.task)
        .bind(filters.author)
        .bind(filters.parent)
        .fetch_one(pool)
        .await?;

        let rows: Vec<Comment> = sqlx::query_as(
            r#"
            SELECT * FROM comments
            WHERE ($1::uuid IS NULL OR task_id = $1)
              AND ($2::uuid IS NULL OR author_id = $2)
              AND ($3::uuid IS NULL OR parent_id = $3)
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(filters.task)
        .bind(filters.author)
        .bind(filters.parent)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(pool)
        .await?;

        Ok(Paginated::new(rows, total, page))
    }

    pub async fn delete_comment(pool: &PgPool, admin: &User, comment_id: Uuid) -> Result<(), AppError> {
        let comment = CommentService::get(pool, comment_id).await?;
        CommentService::remove(pool, &comment).await?;
        AuditLog::record(
            pool,
            admin.id,
            "delete",
            "comment",
            Some(comment_id),
            json!({"task_id": comment.task_id, "author_id": comment.author_id}),
        )
        .await?;
        Ok(())
    }
}

fn push_task_filters(qb: &mut QueryBuilder<'_, Postgres>, filters: &AdminTaskFilters) {
    if let Some(status) = filters.status {
        qb.push(" AND status = ").push_bind(status);
    }
    if let Some(project) = filters.project {
        qb.push(" AND project_id = ").push_bind(project);
    }
    if let Some(need_approval) = filters.need_approval {
        qb.push(" AND need_approval = ").push_bind(need_approval);
    }
    if let Some(assignee) = filters.assignee {
        qb.push(" AND EXISTS (SELECT 1 FROM task_assignments a WHERE a.task_id = tasks.id AND a.user_id = ")
            .push_bind(assignee)
            .push(")");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_wire_format() {
        let bulk: BulkDecision =
            serde_json::from_value(json!({"request_ids": [], "action": "approve"})).unwrap();
        assert_eq!(bulk.action.resolved_status(), RequestStatus::Approved);
        assert_eq!(Decision::Reject.resolved_status(), RequestStatus::Rejected);
        assert!(serde_json::from_value::<Decision>(json!("accept")).is_err());
    }
}
