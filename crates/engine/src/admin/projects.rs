use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use planner_common::error::AppError;
use planner_common::pagination::{PageParams, Paginated};
use planner_common::types::{MembershipRole, Project, ProjectStatus, User};

use super::users::selection_json;
use super::{AuditLog, BulkResult, Selection, changes};
use crate::counters::Counters;
use crate::invitations::InvitationService;
use crate::projects::{ProjectDetail, ProjectService, dedup};
use crate::query::{contains_pattern, order_by};

const ORDERING: &[(&str, &str)] = &[
    ("created_at", "created_at"),
    ("due_date", "due_date"),
    ("total_tasks", "total_tasks"),
    ("name", "name"),
];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminProjectFilters {
    pub status: Option<ProjectStatus>,
    pub owner: Option<Uuid>,
    pub search: Option<String>,
    pub ordering: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminProjectUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub status: Option<ProjectStatus>,
    pub admin_override: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkProjects {
    pub project_ids: Vec<Uuid>,
}

/// Status arrives as free text so an unknown value can be reported clearly.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkStatusChange {
    pub project_ids: Vec<Uuid>,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminInvite {
    pub project: Uuid,
    pub emails: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InviteReport {
    pub invited: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkAddMembers {
    pub project_id: Uuid,
    pub user_ids: Vec<Uuid>,
    pub role: Option<MembershipRole>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkRemoveMembers {
    pub project_id: Uuid,
    pub user_ids: Selection,
}

pub fn parse_status(raw: &str) -> Result<ProjectStatus, AppError> {
    raw.parse::<ProjectStatus>().map_err(|_| {
        let valid: Vec<&str> = ProjectStatus::ALL.iter().map(|s| s.as_str()).collect();
        AppError::Validation(format!(
            "Invalid status: {}. Valid options are: {}",
            raw,
            valid.join(", ")
        ))
    })
}

pub struct AdminProjects;

impl AdminProjects {
    pub async fn list(
        pool: &PgPool,
        filters: &AdminProjectFilters,
        page: &PageParams,
    ) -> Result<Paginated<Project>, AppError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM projects WHERE TRUE");
        push_filters(&mut count, filters);
        let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

        let mut select = QueryBuilder::<Postgres>::new("SELECT * FROM projects WHERE TRUE");
        push_filters(&mut select, filters);
        select.push(" ORDER BY ");
        select.push(order_by(filters.ordering.as_deref(), ORDERING, "-created_at"));
        select.push(" LIMIT ").push_bind(page.limit());
        select.push(" OFFSET ").push_bind(page.offset());
        let projects: Vec<Project> = select.build_query_as().fetch_all(pool).await?;

        Ok(Paginated::new(projects, total, page))
    }

    pub async fn detail(pool: &PgPool, project_id: Uuid) -> Result<ProjectDetail, AppError> {
        let project = ProjectService::get(pool, project_id).await?;
        ProjectService::assemble(pool, project).await
    }

    pub async fn update(
        pool: &PgPool,
        admin: &User,
        project_id: Uuid,
        update: &AdminProjectUpdate,
    ) -> Result<ProjectDetail, AppError> {
        let before = ProjectService::get(pool, project_id).await?;
        let after: Project = sqlx::query_as(
            r#"
            UPDATE projects SET
                name = COALESCE($1, name),
                description = COALESCE($2, description),
                due_date = COALESCE($3, due_date),
                status = COALESCE($4, status),
                admin_override = COALESCE($5, admin_override),
                updated_at = now()
            WHERE id = $6
            RETURNING *
            "#,
        )
        .bind(&update.name)
        .bind(&update.description)
        .bind(update.due_date)
        .bind(update.status)
        .bind(update.admin_override)
        .bind(project_id)
        .fetch_one(pool)
        .await?;

        let mut diff = changes(&before, &after);
        if let Some(map) = diff.as_object_mut() {
            map.remove("updated_at");
        }
        AuditLog::record(pool, admin.id, "update", "project", Some(project_id), diff).await?;
        ProjectService::assemble(pool, after).await
    }

    pub async fn delete(pool: &PgPool, admin: &User, project_id: Uuid) -> Result<(), AppError> {
        let project = ProjectService::get(pool, project_id).await?;
        AuditLog::record(pool, admin.id, "delete", "project", Some(project_id), json!({"name": project.name})).await?;
        ProjectService::remove(pool, project_id).await
    }

    pub async fn bulk_delete(pool: &PgPool, admin: &User, project_ids: &[Uuid]) -> Result<BulkResult, AppError> {
        let mut affected = 0;
        for &project_id in &dedup(project_ids) {
            match ProjectService::remove(pool, project_id).await {
                Ok(()) => affected += 1,
                Err(AppError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        AuditLog::record(pool, admin.id, "bulk_delete", "project", None, json!({"project_ids": project_ids, "affected": affected})).await?;
        Ok(BulkResult { affected })
    }

    pub async fn bulk_change_status(
        pool: &PgPool,
        admin: &User,
        request: &BulkStatusChange,
    ) -> Result<BulkResult, AppError> {
        let status = parse_status(&request.status)?;
        let result = sqlx::query("UPDATE projects SET status = $1, updated_at = now() WHERE id = ANY($2)")
            .bind(status)
            .bind(&request.project_ids)
            .execute(pool)
            .await?;

        AuditLog::record(
            pool,
            admin.id,
            "bulk_change_status",
            "project",
            None,
            json!({"project_ids": request.project_ids, "status": status}),
        )
        .await?;
        Ok(BulkResult {
            affected: result.rows_affected(),
        })
    }

    /// Invite each address, skipping existing members and reusing live invitations.
    pub async fn invite(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        frontend_url: &str,
        admin: &User,
        request: &AdminInvite,
    ) -> Result<InviteReport, AppError> {
        let project = ProjectService::get(pool, request.project).await?;
        let mut report = InviteReport::default();

        for email in &request.emails {
            let email = email.trim();
            if InvitationService::is_member_email(pool, project.id, email).await? {
                report.skipped.push(email.to_string());
                continue;
            }
            match InvitationService::invite_as(pool, redis, frontend_url, admin, &project, email).await {
                Ok(_) => report.invited.push(email.to_string()),
                Err(AppError::Validation(reason)) => {
                    tracing::debug!(email, reason = %reason, "Skipping invitation");
                    report.skipped.push(email.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        AuditLog::record(
            pool,
            admin.id,
            "invite",
            "project",
            Some(project.id),
            json!({"invited": report.invited, "skipped": report.skipped}),
        )
        .await?;
        Ok(report)
    }

    pub async fn bulk_add_members(
        pool: &PgPool,
        admin: &User,
        request: &BulkAddMembers,
    ) -> Result<BulkResult, AppError> {
        let project = ProjectService::get(pool, request.project_id).await?;
        let role = request.role.unwrap_or(MembershipRole::Member);

        let mut added = Vec::new();
        for &user_id in &dedup(&request.user_ids) {
            if ProjectService::add_member(pool, project.id, user_id, role).await? {
                added.push(user_id);
            }
        }
        Counters::refresh_project(pool, project.id).await?;
        Counters::refresh_profiles(pool, &added).await?;

        AuditLog::record(
            pool,
            admin.id,
            "bulk_add",
            "project_membership",
            Some(project.id),
            json!({"added": added, "role": role}),
        )
        .await?;
        Ok(BulkResult {
            affected: added.len() as u64,
        })
    }

    pub async fn bulk_remove_members(
        pool: &PgPool,
        admin: &User,
        request: &BulkRemoveMembers,
    ) -> Result<BulkResult, AppError> {
        let project = ProjectService::get(pool, request.project_id).await?;
        let targets = match &request.user_ids {
            Selection::All => ProjectService::member_ids(pool, project.id).await?,
            Selection::Ids(ids) => ids.clone(),
        };
        let removed = ProjectService::remove_members(pool, project.id, &targets).await?;
        Counters::refresh_project(pool, project.id).await?;
        Counters::refresh_profiles(pool, &removed).await?;

        AuditLog::record(
            pool,
            admin.id,
            "bulk_remove",
            "project_membership",
            Some(project.id),
            json!({"requested": selection_json(&request.user_ids), "removed": removed}),
        )
        .await?;
        Ok(BulkResult {
            affected: removed.len() as u64,
        })
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filters: &AdminProjectFilters) {
    if let Some(status) = filters.status {
        qb.push(" AND status = ").push_bind(status);
    }
    if let Some(owner) = filters.owner {
        qb.push(" AND owner_id = ").push_bind(owner);
    }
    if let Some(search) = filters.search.as_deref().filter(|s| !s.trim().is_empty()) {
        let pattern = contains_pattern(search.trim());
        qb.push(" AND (name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR description ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("on_hold").unwrap(), ProjectStatus::OnHold);
        let err = parse_status("paused").unwrap_err();
        assert!(err.public_message().starts_with("Invalid status: paused."));
        assert!(err.public_message().contains("not_started"));
    }
}
