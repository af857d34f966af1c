//! Projects and memberships.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use planner_common::error::AppError;
use planner_common::pagination::{PageParams, Paginated};
use planner_common::types::{
    MembershipRole, NotificationType, Project, ProjectMembership, ProjectStatus, User,
};

use crate::counters::Counters;
use crate::notifications::{NewNotification, NotificationService};
use crate::query::{contains_pattern, order_by};
use crate::subscriptions::SubscriptionService;

/// Members that can be named in a single create request, owner excluded.
pub const MAX_MEMBERS_PER_REQUEST: usize = 10;

const ORDERING: &[(&str, &str)] = &[
    ("name", "name"),
    ("created_at", "created_at"),
    ("due_date", "due_date"),
    ("status", "status"),
];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectFilters {
    pub name: Option<String>,
    pub status: Option<ProjectStatus>,
    pub due_date_after: Option<DateTime<Utc>>,
    pub due_date_before: Option<DateTime<Utc>>,
    pub search: Option<String>,
    pub ordering: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateProject {
    pub name: String,
    pub description: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub status: Option<ProjectStatus>,
    #[serde(default)]
    pub members: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateProject {
    pub name: Option<String>,
    pub description: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub status: Option<ProjectStatus>,
    pub members: Option<Vec<Uuid>>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserRef {
    pub id: Uuid,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MemberSummary {
    pub membership_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    pub role: MembershipRole,
    pub joined_at: DateTime<Utc>,
    pub total_tasks: i32,
    pub completed_tasks: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectDetail {
    #[serde(flatten)]
    pub project: Project,
    pub owner: UserRef,
    pub members: Vec<MemberSummary>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MembershipUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub last_login: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MembershipDetail {
    #[serde(flatten)]
    pub membership: ProjectMembership,
    pub user: MembershipUser,
}

pub fn check_due_date(due_date: Option<DateTime<Utc>>) -> Result<(), AppError> {
    match due_date {
        Some(due) if due < Utc::now() => Err(AppError::Validation(
            "Due date cannot be in the past.".to_string(),
        )),
        _ => Ok(()),
    }
}

/// De-duplicate a member list, preserving first-seen order.
pub fn dedup(ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

/// Split a desired member set against the current one into `(added, removed)`.
pub fn diff_members(current: &[Uuid], desired: &[Uuid]) -> (Vec<Uuid>, Vec<Uuid>) {
    let current_set: HashSet<_> = current.iter().collect();
    let desired_set: HashSet<_> = desired.iter().collect();
    let added = desired
        .iter()
        .filter(|id| !current_set.contains(id))
        .copied()
        .collect();
    let removed = current
        .iter()
        .filter(|id| !desired_set.contains(id))
        .copied()
        .collect();
    (added, removed)
}

fn project_url(project_id: Uuid) -> String {
    format!("/api/v1/projects/{}/", project_id)
}

pub struct ProjectService;

impl ProjectService {
    pub async fn get(pool: &PgPool, project_id: Uuid) -> Result<Project, AppError> {
        let project: Project = sqlx::query_as("SELECT * FROM projects WHERE id = $1")
            .bind(project_id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::NotFound("Project not found".to_string()))?;
        Ok(project)
    }

    /// Projects the user owns or belongs to.
    pub async fn list(
        pool: &PgPool,
        user_id: Uuid,
        filters: &ProjectFilters,
        page: &PageParams,
    ) -> Result<Paginated<Project>, AppError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM projects p WHERE ");
        push_visible(&mut count, user_id);
        push_filters(&mut count, filters);
        let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

        let mut select = QueryBuilder::<Postgres>::new("SELECT p.* FROM projects p WHERE ");
        push_visible(&mut select, user_id);
        push_filters(&mut select, filters);
        select.push(" ORDER BY ");
        select.push(order_by(filters.ordering.as_deref(), ORDERING, "-created_at"));
        select.push(" LIMIT ").push_bind(page.limit());
        select.push(" OFFSET ").push_bind(page.offset());
        let projects: Vec<Project> = select.build_query_as().fetch_all(pool).await?;

        Ok(Paginated::new(projects, total, page))
    }

    pub async fn create(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        owner: &User,
        params: &CreateProject,
    ) -> Result<ProjectDetail, AppError> {
        if params.name.trim().is_empty() {
            return Err(AppError::Validation("Project name is required.".to_string()));
        }
        check_due_date(params.due_date)?;

        let members: Vec<Uuid> = dedup(&params.members)
            .into_iter()
            .filter(|id| *id != owner.id)
            .collect();
        if members.len() > MAX_MEMBERS_PER_REQUEST {
            return Err(AppError::Validation(format!(
                "A project can be created with at most {} members.",
                MAX_MEMBERS_PER_REQUEST
            )));
        }

        let plan = SubscriptionService::effective_plan(pool, owner.id).await?;
        let (owned,): (i32,) = sqlx::query_as(
            "SELECT COALESCE((SELECT owned_projects_count FROM profiles WHERE user_id = $1), 0)",
        )
        .bind(owner.id)
        .fetch_one(pool)
        .await?;
        if !plan.allows_projects(owned) {
            return Err(AppError::Validation(format!(
                "Your plan allows a maximum of {} projects. Upgrade your plan to create more projects.",
                plan.max_projects
            )));
        }
        if !plan.allows_members(members.len()) {
            return Err(AppError::Validation(
                "You have exceeded the maximum number of members allowed by your plan.".to_string(),
            ));
        }
        Self::ensure_users_exist(pool, &members).await?;

        let project: Project = sqlx::query_as(
            r#"
            INSERT INTO projects (id, name, description, owner_id, status, due_date)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(params.name.trim())
        .bind(&params.description)
        .bind(owner.id)
        .bind(params.status.unwrap_or_default())
        .bind(params.due_date)
        .fetch_one(pool)
        .await?;

        Self::add_member(pool, project.id, owner.id, MembershipRole::Owner).await?;
        for &member in &members {
            Self::add_member(pool, project.id, member, MembershipRole::Member).await?;
        }

        let mut touched = members.clone();
        touched.push(owner.id);
        Counters::refresh_project(pool, project.id).await?;
        Counters::refresh_profiles(pool, &touched).await?;

        let template = NewNotification::new(
            owner.id,
            NotificationType::Project,
            "New Project Assigned",
            format!("You have been added to the project '{}'.", project.name),
        )
        .from_sender(owner.id)
        .with_url(project_url(project.id))
        .about("project", project.id);
        NotificationService::notify_all(pool, redis, &members, &template).await;

        tracing::info!(project_id = %project.id, owner_id = %owner.id, members = members.len(), "Project created");
        Self::detail(pool, owner.id, project.id).await
    }

    /// Project with owner and members. Only visible to members and the owner.
    pub async fn detail(pool: &PgPool, user_id: Uuid, project_id: Uuid) -> Result<ProjectDetail, AppError> {
        let project = Self::get(pool, project_id).await?;
        if project.owner_id != user_id && !Self::is_member(pool, project_id, user_id).await? {
            return Err(AppError::NotFound("Project not found".to_string()));
        }
        Self::assemble(pool, project).await
    }

    pub async fn assemble(pool: &PgPool, project: Project) -> Result<ProjectDetail, AppError> {
        let owner: UserRef = sqlx::query_as("SELECT id, username, email FROM users WHERE id = $1")
            .bind(project.owner_id)
            .fetch_one(pool)
            .await?;
        let members = Self::members(pool, project.id).await?;
        Ok(ProjectDetail {
            project,
            owner,
            members,
        })
    }

    pub async fn members(pool: &PgPool, project_id: Uuid) -> Result<Vec<MemberSummary>, AppError> {
        let members: Vec<MemberSummary> = sqlx::query_as(
            r#"
            SELECT m.id AS membership_id, u.id AS user_id, u.username, u.email, m.role,
                   m.joined_at, m.total_tasks, m.completed_tasks
            FROM project_memberships m
            JOIN users u ON u.id = m.user_id
            WHERE m.project_id = $1
            ORDER BY m.joined_at
            "#,
        )
        .bind(project_id)
        .fetch_all(pool)
        .await?;
        Ok(members)
    }

    pub async fn update(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        user_id: Uuid,
        project_id: Uuid,
        params: &UpdateProject,
    ) -> Result<ProjectDetail, AppError> {
        let project = Self::get(pool, project_id).await?;
        if project.owner_id != user_id {
            return Err(AppError::Forbidden(
                "You do not have permission to update this project".to_string(),
            ));
        }
        if project.status.is_read_only() {
            return Err(AppError::Validation(
                "Completed projects cannot be modified.".to_string(),
            ));
        }
        check_due_date(params.due_date)?;

        let desired = params.members.as_deref().map(dedup);
        if let Some(desired) = &desired {
            if !desired.contains(&project.owner_id) {
                return Err(AppError::Validation(
                    "Owner cannot be removed from the project.".to_string(),
                ));
            }
            if !project.admin_override {
                let plan = SubscriptionService::effective_plan(pool, user_id).await?;
                let others = desired.iter().filter(|id| **id != project.owner_id).count();
                if !plan.allows_members(others) {
                    return Err(AppError::Validation(
                        "You have exceeded the maximum number of members allowed by your plan."
                            .to_string(),
                    ));
                }
            }
            Self::ensure_users_exist(pool, desired).await?;
        }

        let project: Project = sqlx::query_as(
            r#"
            UPDATE projects SET
                name = COALESCE($1, name),
                description = COALESCE($2, description),
                due_date = COALESCE($3, due_date),
                status = COALESCE($4, status),
                updated_at = now()
            WHERE id = $5
            RETURNING *
            "#,
        )
        .bind(params.name.as_deref().map(str::trim))
        .bind(&params.description)
        .bind(params.due_date)
        .bind(params.status)
        .bind(project_id)
        .fetch_one(pool)
        .await?;

        if let Some(desired) = desired {
            let current = Self::member_ids(pool, project_id).await?;
            let (added, removed) = diff_members(&current, &desired);

            for &member in &added {
                Self::add_member(pool, project_id, member, MembershipRole::Member).await?;
            }
            Self::remove_members(pool, project_id, &removed).await?;

            if !added.is_empty() || !removed.is_empty() {
                Counters::refresh_project(pool, project_id).await?;
                let touched: Vec<Uuid> = added.iter().chain(removed.iter()).copied().collect();
                Counters::refresh_profiles(pool, &touched).await?;
            }

            let added_note = NewNotification::new(
                user_id,
                NotificationType::Project,
                "New Project Assigned",
                format!("You have been added to the project '{}'.", project.name),
            )
            .from_sender(user_id)
            .with_url(project_url(project_id))
            .about("project", project_id);
            NotificationService::notify_all(pool, redis, &added, &added_note).await;

            let removed_note = NewNotification::new(
                user_id,
                NotificationType::Project,
                "Project Removed",
                format!("You have been removed from the project '{}'.", project.name),
            )
            .from_sender(user_id)
            .about("project", project_id);
            NotificationService::notify_all(pool, redis, &removed, &removed_note).await;
        }

        tracing::info!(project_id = %project_id, "Project updated");
        Self::assemble(pool, project).await
    }

    pub async fn delete(pool: &PgPool, user_id: Uuid, project_id: Uuid) -> Result<(), AppError> {
        let project = Self::get(pool, project_id).await?;
        if project.owner_id != user_id {
            return Err(AppError::Forbidden(
                "You do not have permission to delete this project".to_string(),
            ));
        }
        Self::remove(pool, project_id).await?;
        tracing::info!(project_id = %project_id, "Project deleted");
        Ok(())
    }

    /// Delete a project and refresh the counters of everyone who was in it.
    pub async fn remove(pool: &PgPool, project_id: Uuid) -> Result<(), AppError> {
        let mut affected = Self::member_ids(pool, project_id).await?;
        let project = Self::get(pool, project_id).await?;
        affected.push(project.owner_id);

        sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(project_id)
            .execute(pool)
            .await?;
        Counters::refresh_profiles(pool, &dedup(&affected)).await?;
        Ok(())
    }

    /// The caller's own membership with the member's account summary.
    pub async fn membership(
        pool: &PgPool,
        user_id: Uuid,
        membership_id: Uuid,
    ) -> Result<MembershipDetail, AppError> {
        let membership: ProjectMembership = sqlx::query_as(
            "SELECT * FROM project_memberships WHERE id = $1 AND user_id = $2",
        )
        .bind(membership_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Membership not found".to_string()))?;

        let user: MembershipUser =
            sqlx::query_as("SELECT id, username, email, last_login FROM users WHERE id = $1")
                .bind(membership.user_id)
                .fetch_one(pool)
                .await?;
        Ok(MembershipDetail { membership, user })
    }

    pub async fn is_member(pool: &PgPool, project_id: Uuid, user_id: Uuid) -> Result<bool, AppError> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM project_memberships WHERE project_id = $1 AND user_id = $2)",
        )
        .bind(project_id)
        .bind(user_id)
        .fetch_one(pool)
        .await?;
        Ok(exists)
    }

    pub async fn member_ids(pool: &PgPool, project_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        let ids: Vec<(Uuid,)> =
            sqlx::query_as("SELECT user_id FROM project_memberships WHERE project_id = $1 ORDER BY joined_at")
                .bind(project_id)
                .fetch_all(pool)
                .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Add a membership. Returns `false` if the user was already a member.
    pub async fn add_member(
        pool: &PgPool,
        project_id: Uuid,
        user_id: Uuid,
        role: MembershipRole,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO project_memberships (id, project_id, user_id, role)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (project_id, user_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(user_id)
        .bind(role)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove memberships, never the owner's. Task assignments in the project
    /// go with them. Returns the users actually removed.
    pub async fn remove_members(
        pool: &PgPool,
        project_id: Uuid,
        user_ids: &[Uuid],
    ) -> Result<Vec<Uuid>, AppError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let removed: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            DELETE FROM project_memberships
            WHERE project_id = $1 AND user_id = ANY($2) AND role <> 'owner'
            RETURNING user_id
            "#,
        )
        .bind(project_id)
        .bind(user_ids)
        .fetch_all(pool)
        .await?;
        let removed: Vec<Uuid> = removed.into_iter().map(|(id,)| id).collect();

        sqlx::query(
            r#"
            DELETE FROM task_assignments a USING tasks t
            WHERE a.task_id = t.id AND t.project_id = $1 AND a.user_id = ANY($2)
            "#,
        )
        .bind(project_id)
        .bind(&removed)
        .execute(pool)
        .await?;
        sqlx::query(
            "UPDATE tasks SET total_assignees = (SELECT COUNT(*) FROM task_assignments WHERE task_id = tasks.id) WHERE project_id = $1",
        )
        .bind(project_id)
        .execute(pool)
        .await?;

        Ok(removed)
    }

    async fn ensure_users_exist(pool: &PgPool, user_ids: &[Uuid]) -> Result<(), AppError> {
        if user_ids.is_empty() {
            return Ok(());
        }
        let (found,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users WHERE id = ANY($1)")
            .bind(user_ids)
            .fetch_one(pool)
            .await?;
        if found as usize != user_ids.len() {
            return Err(AppError::Validation("One or more members do not exist.".to_string()));
        }
        Ok(())
    }
}

fn push_visible(qb: &mut QueryBuilder<'_, Postgres>, user_id: Uuid) {
    qb.push("(p.owner_id = ")
        .push_bind(user_id)
        .push(" OR EXISTS (SELECT 1 FROM project_memberships m WHERE m.project_id = p.id AND m.user_id = ")
        .push_bind(user_id)
        .push("))");
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filters: &ProjectFilters) {
    if let Some(name) = filters.name.as_deref().filter(|s| !s.trim().is_empty()) {
        qb.push(" AND p.name ILIKE ").push_bind(contains_pattern(name.trim()));
    }
    if let Some(status) = filters.status {
        qb.push(" AND p.status = ").push_bind(status);
    }
    if let Some(after) = filters.due_date_after {
        qb.push(" AND p.due_date >= ").push_bind(after);
    }
    if let Some(before) = filters.due_date_before {
        qb.push(" AND p.due_date <= ").push_bind(before);
    }
    if let Some(search) = filters.search.as_deref().filter(|s| !s.trim().is_empty()) {
        let pattern = contains_pattern(search.trim());
        qb.push(" AND (p.name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR p.description ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_past_due_date_rejected() {
        assert!(check_due_date(Some(Utc::now() - Duration::days(1))).is_err());
        assert!(check_due_date(Some(Utc::now() + Duration::days(1))).is_ok());
        assert!(check_due_date(None).is_ok());
    }

    #[test]
    fn test_dedup_keeps_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(dedup(&[a, b, a, b]), vec![a, b]);
    }

    #[test]
    fn test_diff_members() {
        let owner = Uuid::new_v4();
        let stay = Uuid::new_v4();
        let leave = Uuid::new_v4();
        let join = Uuid::new_v4();

        let (added, removed) = diff_members(&[owner, stay, leave], &[owner, stay, join]);
        assert_eq!(added, vec![join]);
        assert_eq!(removed, vec![leave]);
    }

    #[test]
    fn test_update_body_is_partial() {
        let update: UpdateProject = serde_json::from_str(r#"{"status": "on_hold"}"#).unwrap();
        assert_eq!(update.status, Some(ProjectStatus::OnHold));
        assert!(update.members.is_none());
        assert!(update.name.is_none());
    }
}
