use redis::aio::ConnectionManager;
use serde::Deserialize;
use serde_json::json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use planner_common::error::AppError;
use planner_common::pagination::{PageParams, Paginated};
use planner_common::types::{User, UserRole};

use super::{AuditLog, BulkResult, Selection, changes};
use crate::counters::Counters;
use crate::mailer::{Mailer, escape_html};
use crate::query::{contains_pattern, order_by};
use crate::users::{UserService, validate_email};

const ORDERING: &[(&str, &str)] = &[
    ("date_joined", "date_joined"),
    ("last_login", "last_login"),
    ("username", "username"),
];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserFilters {
    pub is_active: Option<bool>,
    pub role: Option<UserRole>,
    pub email_verified: Option<bool>,
    pub search: Option<String>,
    pub ordering: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminUserUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub role: Option<UserRole>,
    pub is_active: Option<bool>,
    pub is_staff: Option<bool>,
    pub email_verified: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkUsers {
    pub user_ids: Selection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkEmail {
    pub subject: String,
    pub message: String,
    pub user_ids: Selection,
}

pub struct AdminUsers;

impl AdminUsers {
    pub async fn list(
        pool: &PgPool,
        filters: &UserFilters,
        page: &PageParams,
    ) -> Result<Paginated<User>, AppError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM users WHERE TRUE");
        push_filters(&mut count, filters);
        let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

        let mut select = QueryBuilder::<Postgres>::new("SELECT * FROM users WHERE TRUE");
        push_filters(&mut select, filters);
        select.push(" ORDER BY ");
        select.push(order_by(filters.ordering.as_deref(), ORDERING, "-date_joined"));
        select.push(" LIMIT ").push_bind(page.limit());
        select.push(" OFFSET ").push_bind(page.offset());
        let users: Vec<User> = select.build_query_as().fetch_all(pool).await?;

        Ok(Paginated::new(users, total, page))
    }

    pub async fn update(
        pool: &PgPool,
        admin: &User,
        user_id: Uuid,
        update: &AdminUserUpdate,
    ) -> Result<User, AppError> {
        let before = UserService::get(pool, user_id).await?;
        if let Some(email) = &update.email {
            validate_email(email)?;
            let (taken,): (bool,) = sqlx::query_as(
                "SELECT EXISTS (SELECT 1 FROM users WHERE lower(email) = lower($1) AND id <> $2)",
            )
            .bind(email)
            .bind(user_id)
            .fetch_one(pool)
            .await?;
            if taken {
                return Err(AppError::Validation("This email is already in use.".to_string()));
            }
        }

        let after: User = sqlx::query_as(
            r#"
            UPDATE users SET
                first_name = COALESCE($1, first_name),
                last_name = COALESCE($2, last_name),
                email = COALESCE($3, email),
                role = COALESCE($4, role),
                is_active = COALESCE($5, is_active),
                is_staff = COALESCE($6, is_staff),
                email_verified = COALESCE($7, email_verified)
            WHERE id = $8
            RETURNING *
            "#,
        )
        .bind(&update.first_name)
        .bind(&update.last_name)
        .bind(&update.email)
        .bind(update.role)
        .bind(update.is_active)
        .bind(update.is_staff)
        .bind(update.email_verified)
        .bind(user_id)
        .fetch_one(pool)
        .await?;

        AuditLog::record(pool, admin.id, "update", "user", Some(user_id), changes(&before, &after)).await?;
        Ok(after)
    }

    pub async fn delete(pool: &PgPool, admin: &User, user_id: Uuid) -> Result<(), AppError> {
        if admin.id == user_id {
            return Err(AppError::Validation("You cannot delete your own account.".to_string()));
        }
        let user = UserService::get(pool, user_id).await?;

        // Memberships in projects the user didn't own disappear with them.
        let projects: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT project_id FROM project_memberships WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(pool)
        .await?;

        AuditLog::record(pool, admin.id, "delete", "user", Some(user_id), json!({"username": user.username})).await?;
        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(user_id)
            .execute(pool)
            .await?;

        for (project_id,) in projects {
            Counters::refresh_project(pool, project_id).await?;
        }
        Ok(())
    }

    pub async fn set_active(
        pool: &PgPool,
        admin: &User,
        selection: &Selection,
        active: bool,
    ) -> Result<BulkResult, AppError> {
        if selection.is_empty() {
            return Err(AppError::Validation("No users selected.".to_string()));
        }
        // Deactivation never touches admins.
        let result = sqlx::query(
            r#"
            UPDATE users SET is_active = $1
            WHERE ($2::uuid[] IS NULL OR id = ANY($2))
              AND ($1 OR role <> 'admin')
            "#,
        )
        .bind(active)
        .bind(selection.as_filter())
        .execute(pool)
        .await?;

        let action = if active { "activate" } else { "deactivate" };
        AuditLog::record(
            pool,
            admin.id,
            action,
            "user",
            None,
            json!({"user_ids": selection_json(selection), "affected": result.rows_affected()}),
        )
        .await?;
        Ok(BulkResult {
            affected: result.rows_affected(),
        })
    }

    /// Queue a custom email to each selected active user.
    pub async fn send_email(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        admin: &User,
        request: &BulkEmail,
    ) -> Result<BulkResult, AppError> {
        if request.subject.trim().is_empty() || request.message.trim().is_empty() {
            return Err(AppError::Validation("Subject and message are required.".to_string()));
        }
        if request.user_ids.is_empty() {
            return Err(AppError::Validation("No users selected.".to_string()));
        }

        let recipients: Vec<(String,)> = sqlx::query_as(
            "SELECT email FROM users WHERE is_active AND ($1::uuid[] IS NULL OR id = ANY($1))",
        )
        .bind(request.user_ids.as_filter())
        .fetch_all(pool)
        .await?;

        let body = format!("<p>{}</p>", escape_html(&request.message).replace('\n', "<br>"));
        for (email,) in &recipients {
            Mailer::send_custom(redis, email, &request.subject, &body).await?;
        }

        AuditLog::record(
            pool,
            admin.id,
            "send_email",
            "user",
            None,
            json!({"subject": request.subject, "recipients": recipients.len()}),
        )
        .await?;
        Ok(BulkResult {
            affected: recipients.len() as u64,
        })
    }
}

pub(crate) fn selection_json(selection: &Selection) -> serde_json::Value {
    match selection {
        Selection::All => json!("all"),
        Selection::Ids(ids) => json!(ids),
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filters: &UserFilters) {
    if let Some(is_active) = filters.is_active {
        qb.push(" AND is_active = ").push_bind(is_active);
    }
    if let Some(role) = filters.role {
        qb.push(" AND role = ").push_bind(role);
    }
    if let Some(verified) = filters.email_verified {
        qb.push(" AND email_verified = ").push_bind(verified);
    }
    if let Some(search) = filters.search.as_deref().filter(|s| !s.trim().is_empty()) {
        let pattern = contains_pattern(search.trim());
        qb.push(" AND (username ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR email ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
}
