use serde::Deserialize;
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use planner_common::error::AppError;
use planner_common::pagination::{PageParams, Paginated};
use planner_common::types::AdminActionLog;

use crate::query::order_by;

const ORDERING: &[(&str, &str)] = &[("timestamp", "timestamp")];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionLogFilters {
    pub user: Option<Uuid>,
    pub action: Option<String>,
    pub content_type: Option<String>,
    pub ordering: Option<String>,
}

pub struct AuditLog;

impl AuditLog {
    pub async fn record(
        pool: &PgPool,
        admin_id: Uuid,
        action: &str,
        content_type: &str,
        object_id: Option<Uuid>,
        changes: Value,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO admin_action_logs (id, user_id, action, content_type, object_id, changes)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(admin_id)
        .bind(action)
        .bind(content_type)
        .bind(object_id)
        .bind(changes)
        .execute(pool)
        .await?;

        tracing::info!(admin_id = %admin_id, action, content_type, object_id = ?object_id, "Admin action");
        Ok(())
    }

    pub async fn list(
        pool: &PgPool,
        filters: &ActionLogFilters,
        page: &PageParams,
    ) -> Result<Paginated<AdminActionLog>, AppError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM admin_action_logs WHERE TRUE");
        push_filters(&mut count, filters);
        let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

        let mut select = QueryBuilder::<Postgres>::new("SELECT * FROM admin_action_logs WHERE TRUE");
        push_filters(&mut select, filters);
        select.push(" ORDER BY ");
        select.push(order_by(filters.ordering.as_deref(), ORDERING, "-timestamp"));
        select.push(" LIMIT ").push_bind(page.limit());
        select.push(" OFFSET ").push_bind(page.offset());
        let rows: Vec<AdminActionLog> = select.build_query_as().fetch_all(pool).await?;

        Ok(Paginated::new(rows, total, page))
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filters: &ActionLogFilters) {
    if let Some(user) = filters.user {
        qb.push(" AND user_id = ").push_bind(user);
    }
    if let Some(action) = &filters.action {
        qb.push(" AND action = ").push_bind(action.clone());
    }
    if let Some(content_type) = &filters.content_type {
        qb.push(" AND content_type = ").push_bind(content_type.clone());
    }
}
