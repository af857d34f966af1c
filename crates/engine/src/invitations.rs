//! Emailed project invitations.

use chrono::{Duration, Utc};
use redis::aio::ConnectionManager;
use serde::Deserialize;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use planner_common::error::AppError;
use planner_common::pagination::{PageParams, Paginated};
use planner_common::types::{MembershipRole, Project, ProjectInvitation, User};

use crate::counters::Counters;
use crate::mailer::Mailer;
use crate::projects::ProjectService;
use crate::query::order_by;
use crate::users::validate_email;

pub const INVITATION_TTL_DAYS: i64 = 7;

const ORDERING: &[(&str, &str)] = &[("created_at", "created_at"), ("expires_at", "expires_at")];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvitationFilters {
    pub accepted: Option<bool>,
    pub email: Option<String>,
    pub project: Option<Uuid>,
    pub ordering: Option<String>,
}

/// Result of presenting an invitation token.
#[derive(Debug)]
pub enum AcceptOutcome {
    Accepted(ProjectInvitation),
    AlreadyMember(ProjectInvitation),
    /// The caller is anonymous and must sign in before accepting.
    LoginRequired(ProjectInvitation),
}

pub struct InvitationService;

impl InvitationService {
    pub async fn list_sent(
        pool: &PgPool,
        inviter: Uuid,
        filters: &InvitationFilters,
        page: &PageParams,
    ) -> Result<Paginated<ProjectInvitation>, AppError> {
        let mut count =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM project_invitations WHERE invited_by = ");
        count.push_bind(inviter);
        push_filters(&mut count, filters);
        let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

        let mut select =
            QueryBuilder::<Postgres>::new("SELECT * FROM project_invitations WHERE invited_by = ");
        select.push_bind(inviter);
        push_filters(&mut select, filters);
        select.push(" ORDER BY ");
        select.push(order_by(filters.ordering.as_deref(), ORDERING, "-created_at"));
        select.push(" LIMIT ").push_bind(page.limit());
        select.push(" OFFSET ").push_bind(page.offset());
        let rows: Vec<ProjectInvitation> = select.build_query_as().fetch_all(pool).await?;

        Ok(Paginated::new(rows, total, page))
    }

    /// Invite `email` to a project the caller owns and email the link.
    pub async fn invite(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        frontend_url: &str,
        inviter: &User,
        project_id: Uuid,
        email: &str,
    ) -> Result<ProjectInvitation, AppError> {
        let project = ProjectService::get(pool, project_id).await?;
        if project.owner_id != inviter.id {
            return Err(AppError::Forbidden(
                "Only the project owner can send invitations.".to_string(),
            ));
        }
        Self::invite_as(pool, redis, frontend_url, inviter, &project, email).await
    }

    /// Create or reuse an invitation without an ownership check.
    pub async fn invite_as(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        frontend_url: &str,
        inviter: &User,
        project: &Project,
        email: &str,
    ) -> Result<ProjectInvitation, AppError> {
        let email = email.trim();
        validate_email(email)?;

        if Self::is_member_email(pool, project.id, email).await? {
            return Err(AppError::Validation(
                "User is already a member of the project.".to_string(),
            ));
        }

        let invitation = match Self::active_for(pool, project.id, email).await? {
            Some(existing) => existing,
            None => {
                let invitation: ProjectInvitation = sqlx::query_as(
                    r#"
                    INSERT INTO project_invitations
                        (id, project_id, email, token, invited_by, expires_at,
                         project_name, inviter_email, inviter_name)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    RETURNING *
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(project.id)
                .bind(email)
                .bind(Uuid::new_v4())
                .bind(inviter.id)
                .bind(Utc::now() + Duration::days(INVITATION_TTL_DAYS))
                .bind(&project.name)
                .bind(&inviter.email)
                .bind(inviter.full_name())
                .fetch_one(pool)
                .await?;
                invitation
            }
        };

        Mailer::send_invitation(redis, frontend_url, &invitation).await?;
        tracing::info!(project_id = %project.id, invitation_id = %invitation.id, "Invitation sent");
        Ok(invitation)
    }

    /// An unexpired, unaccepted invitation for this project and address.
    pub async fn active_for(
        pool: &PgPool,
        project_id: Uuid,
        email: &str,
    ) -> Result<Option<ProjectInvitation>, AppError> {
        let invitation: Option<ProjectInvitation> = sqlx::query_as(
            r#"
            SELECT * FROM project_invitations
            WHERE project_id = $1 AND lower(email) = lower($2)
              AND NOT accepted AND expires_at > now()
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(project_id)
        .bind(email)
        .fetch_optional(pool)
        .await?;
        Ok(invitation)
    }

    pub async fn is_member_email(pool: &PgPool, project_id: Uuid, email: &str) -> Result<bool, AppError> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM project_memberships m JOIN users u ON u.id = m.user_id
                WHERE m.project_id = $1 AND lower(u.email) = lower($2)
            )
            "#,
        )
        .bind(project_id)
        .bind(email)
        .fetch_one(pool)
        .await?;
        Ok(exists)
    }

    /// Present an invitation token, as `caller` if signed in.
    pub async fn accept(
        pool: &PgPool,
        token: Uuid,
        caller: Option<Uuid>,
    ) -> Result<AcceptOutcome, AppError> {
        let invitation: ProjectInvitation = sqlx::query_as(
            "SELECT * FROM project_invitations WHERE token = $1 AND NOT accepted",
        )
        .bind(token)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::Validation("Invalid or already used invitation token.".to_string()))?;

        if invitation.is_expired() {
            return Err(AppError::Validation("This invitation has expired.".to_string()));
        }

        let Some(user_id) = caller else {
            return Ok(AcceptOutcome::LoginRequired(invitation));
        };

        if ProjectService::is_member(pool, invitation.project_id, user_id).await? {
            return Ok(AcceptOutcome::AlreadyMember(invitation));
        }

        ProjectService::add_member(pool, invitation.project_id, user_id, MembershipRole::Member).await?;
        let invitation: ProjectInvitation = sqlx::query_as(
            "UPDATE project_invitations SET accepted = TRUE, accepted_at = now() WHERE id = $1 RETURNING *",
        )
        .bind(invitation.id)
        .fetch_one(pool)
        .await?;

        Counters::refresh_project(pool, invitation.project_id).await?;
        Counters::refresh_profiles(pool, &[user_id]).await?;

        tracing::info!(
            project_id = %invitation.project_id,
            user_id = %user_id,
            "Invitation accepted"
        );
        Ok(AcceptOutcome::Accepted(invitation))
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filters: &InvitationFilters) {
    if let Some(accepted) = filters.accepted {
        qb.push(" AND accepted = ").push_bind(accepted);
    }
    if let Some(email) = &filters.email {
        qb.push(" AND lower(email) = lower(").push_bind(email.clone()).push(")");
    }
    if let Some(project) = filters.project {
        qb.push(" AND project_id = ").push_bind(project);
    }
}
