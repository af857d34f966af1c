use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::PgPool;
use uuid::Uuid;

use planner_common::error::AppError;
use planner_common::pagination::{PageParams, Paginated};
use planner_common::types::{Payment, PaymentStatus, PlanName, Subscription, SubscriptionPlan, User};

use super::AuditLog;
use crate::subscriptions::{SubscriptionDetails, SubscriptionService};

const REVENUE_WINDOW_DAYS: i32 = 30;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminSubscriptionFilters {
    pub is_active: Option<bool>,
    pub plan: Option<PlanName>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminPaymentFilters {
    pub status: Option<PaymentStatus>,
    pub subscription: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PlanStats {
    pub plan: PlanName,
    pub price_cents: i64,
    pub active_subscribers: i64,
    pub revenue_cents: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MethodRevenue {
    pub payment_method: String,
    pub payments: i64,
    pub revenue_cents: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentStats {
    pub total_revenue_cents: i64,
    pub recent_revenue_cents: i64,
    pub period_days: i32,
    pub by_method: Vec<MethodRevenue>,
}

pub struct AdminBilling;

impl AdminBilling {
    pub async fn subscriptions(
        pool: &PgPool,
        filters: &AdminSubscriptionFilters,
        page: &PageParams,
    ) -> Result<Paginated<Subscription>, AppError> {
        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM subscriptions s JOIN subscription_plans p ON p.id = s.plan_id
            WHERE ($1::boolean IS NULL OR s.is_active = $1) AND ($2::text IS NULL OR p.name = $2)
            "#,
        )
        .bind(filters.is_active)
        .bind(filters.plan)
        .fetch_one(pool)
        .await?;

        let rows: Vec<Subscription> = sqlx::query_as(
            r#"
            SELECT s.* FROM subscriptions s JOIN subscription_plans p ON p.id = s.plan_id
            WHERE ($1::boolean IS NULL OR s.is_active = $1) AND ($2::text IS NULL OR p.name = $2)
            ORDER BY s.start_date DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filters.is_active)
        .bind(filters.plan)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(pool)
        .await?;

        Ok(Paginated::new(rows, total, page))
    }

    /// Move a subscription back to basic without touching Stripe.
    pub async fn cancel(
        pool: &PgPool,
        admin: &User,
        subscription_id: Uuid,
        request: &CancelRequest,
    ) -> Result<SubscriptionDetails, AppError> {
        let before = SubscriptionService::get(pool, subscription_id).await?;
        let after = SubscriptionService::revert_to_basic(pool, subscription_id).await?;
        AuditLog::record(
            pool,
            admin.id,
            "cancel_subscription",
            "subscription",
            Some(subscription_id),
            json!({
                "plan": {"old": before.plan.name, "new": after.plan.name},
                "reason": request.reason,
            }),
        )
        .await?;
        Ok(after)
    }

    pub async fn renew(pool: &PgPool, admin: &User, subscription_id: Uuid) -> Result<SubscriptionDetails, AppError> {
        let before = SubscriptionService::get(pool, subscription_id).await?;
        let after = SubscriptionService::renew(pool, subscription_id).await?;
        AuditLog::record(
            pool,
            admin.id,
            "renew_subscription",
            "subscription",
            Some(subscription_id),
            json!({
                "end_date": {"old": before.subscription.end_date, "new": after.subscription.end_date},
                "is_active": {"old": before.subscription.is_active, "new": true},
            }),
        )
        .await?;
        Ok(after)
    }

    pub async fn plans(pool: &PgPool) -> Result<Vec<SubscriptionPlan>, AppError> {
        SubscriptionService::list_plans(pool).await
    }

    pub async fn plan_stats(pool: &PgPool) -> Result<Vec<PlanStats>, AppError> {
        let stats: Vec<PlanStats> = sqlx::query_as(
            r#"
            SELECT
                p.name AS plan,
                p.price_cents,
                (SELECT COUNT(*) FROM subscriptions s WHERE s.plan_id = p.id AND s.is_active) AS active_subscribers,
                COALESCE((
                    SELECT SUM(pay.amount_cents) FROM payments pay
                    JOIN subscriptions s ON s.id = pay.subscription_id
                    WHERE s.plan_id = p.id AND pay.status = 'succeeded'
                ), 0)::BIGINT AS revenue_cents
            FROM subscription_plans p
            ORDER BY p.price_cents
            "#,
        )
        .fetch_all(pool)
        .await?;
        Ok(stats)
    }

    pub async fn payments(
        pool: &PgPool,
        filters: &AdminPaymentFilters,
        page: &PageParams,
    ) -> Result<Paginated<Payment>, AppError> {
        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM payments
            WHERE ($1::text IS NULL OR status = $1) AND ($2::uuid IS NULL OR subscription_id = $2)
            "#,
        )
        .bind(filters.status)
        .bind(filters.subscription)
        .fetch_one(pool)
        .await?;

        let rows: Vec<Payment> = sqlx::query_as(
            r#"
            SELECT * FROM payments
            WHERE ($1::text IS NULL OR status = $1) AND ($2::uuid IS NULL OR subscription_id = $2)
            ORDER BY date DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filters.status)
        .bind(filters.subscription)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(pool)
        .await?;

        Ok(Paginated::new(rows, total, page))
    }

    /// Revenue from succeeded payments, overall, recent and per method.
    pub async fn payment_stats(pool: &PgPool) -> Result<PaymentStats, AppError> {
        let (total, recent): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(amount_cents), 0)::BIGINT,
                COALESCE(SUM(amount_cents) FILTER (WHERE date >= now() - make_interval(days => $1)), 0)::BIGINT
            FROM payments WHERE status = 'succeeded'
            "#,
        )
        .bind(REVENUE_WINDOW_DAYS)
        .fetch_one(pool)
        .await?;

        let by_method: Vec<MethodRevenue> = sqlx::query_as(
            r#"
            SELECT payment_method, COUNT(*) AS payments, COALESCE(SUM(amount_cents), 0)::BIGINT AS revenue_cents
            FROM payments WHERE status = 'succeeded'
            GROUP BY payment_method ORDER BY revenue_cents DESC
            "#,
        )
        .fetch_all(pool)
        .await?;

        Ok(PaymentStats {
            total_revenue_cents: total,
            recent_revenue_cents: recent,
            period_days: REVENUE_WINDOW_DAYS,
            by_method,
        })
    }

    pub async fn dashboard_stats(pool: &PgPool) -> Result<Value, AppError> {
        let (total, active, paid): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE s.is_active),
                   COUNT(*) FILTER (WHERE s.is_active AND p.name <> 'basic')
            FROM subscriptions s JOIN subscription_plans p ON p.id = s.plan_id
            "#,
        )
        .fetch_one(pool)
        .await?;

        Ok(json!({
            "total_subscriptions": total,
            "active_subscriptions": active,
            "paid_subscriptions": paid,
            "plans": Self::plan_stats(pool).await?,
            "payments": Self::payment_stats(pool).await?,
        }))
    }
}
