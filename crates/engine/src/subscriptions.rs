//! Subscription service: plans, per-user subscriptions, payments and
//! Stripe-driven upgrades.

use chrono::{Duration, Utc};
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use planner_common::error::AppError;
use planner_common::types::{
    Payment, PaymentStatus, PlanName, Subscription, SubscriptionPlan, User,
};

use crate::stripe::{CheckoutRequest, StripeClient, WebhookEvent};

/// A subscription with its plan inlined.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionDetails {
    #[serde(flatten)]
    pub subscription: Subscription,
    pub plan: SubscriptionPlan,
}

pub struct SubscriptionService;

impl SubscriptionService {
    pub async fn list_plans(pool: &PgPool) -> Result<Vec<SubscriptionPlan>, AppError> {
        let plans: Vec<SubscriptionPlan> =
            sqlx::query_as("SELECT * FROM subscription_plans ORDER BY price_cents")
                .fetch_all(pool)
                .await?;
        Ok(plans)
    }

    pub async fn get_plan(pool: &PgPool, plan_id: Uuid) -> Result<SubscriptionPlan, AppError> {
        let plan: SubscriptionPlan = sqlx::query_as("SELECT * FROM subscription_plans WHERE id = $1")
            .bind(plan_id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::NotFound("Subscription plan not found.".to_string()))?;
        Ok(plan)
    }

    pub async fn plan_by_name(pool: &PgPool, name: PlanName) -> Result<SubscriptionPlan, AppError> {
        let plan: SubscriptionPlan =
            sqlx::query_as("SELECT * FROM subscription_plans WHERE name = $1")
                .bind(name)
                .fetch_optional(pool)
                .await?
                .ok_or_else(|| AppError::Config(format!("The {} plan is not seeded", name)))?;
        Ok(plan)
    }

    /// Give a new user the basic plan. A no-op if they already have a subscription.
    pub async fn assign_basic(conn: &mut PgConnection, user_id: Uuid) -> Result<(), AppError> {
        let basic: SubscriptionPlan =
            sqlx::query_as("SELECT * FROM subscription_plans WHERE name = $1")
                .bind(PlanName::Basic)
                .fetch_optional(&mut *conn)
                .await?
                .ok_or_else(|| AppError::Config("The basic plan is not seeded".to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO subscriptions (id, user_id, plan_id, start_date, end_date, is_active)
            VALUES ($1, $2, $3, now(), now() + make_interval(days => $4), TRUE)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(basic.id)
        .bind(basic.duration_days)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn for_user(pool: &PgPool, user_id: Uuid) -> Result<SubscriptionDetails, AppError> {
        let subscription: Subscription =
            sqlx::query_as("SELECT * FROM subscriptions WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(pool)
                .await?
                .ok_or_else(|| AppError::NotFound("No subscription found.".to_string()))?;
        let plan = Self::get_plan(pool, subscription.plan_id).await?;
        Ok(SubscriptionDetails { subscription, plan })
    }

    pub async fn get(pool: &PgPool, subscription_id: Uuid) -> Result<SubscriptionDetails, AppError> {
        let subscription: Subscription = sqlx::query_as("SELECT * FROM subscriptions WHERE id = $1")
            .bind(subscription_id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::NotFound("Subscription not found.".to_string()))?;
        let plan = Self::get_plan(pool, subscription.plan_id).await?;
        Ok(SubscriptionDetails { subscription, plan })
    }

    /// The plan whose limits apply to a user. Users without an active
    /// subscription fall back to basic.
    pub async fn effective_plan(pool: &PgPool, user_id: Uuid) -> Result<SubscriptionPlan, AppError> {
        let plan: Option<SubscriptionPlan> = sqlx::query_as(
            r#"
            SELECT p.* FROM subscription_plans p
            JOIN subscriptions s ON s.plan_id = p.id
            WHERE s.user_id = $1 AND s.is_active
            "#,
        )
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

        match plan {
            Some(plan) => Ok(plan),
            None => Self::plan_by_name(pool, PlanName::Basic).await,
        }
    }

    /// Start a Stripe Checkout for `plan_id` and return the hosted checkout URL.
    ///
    /// With `upgrade_only`, plans priced at or below the current one are refused.
    pub async fn start_checkout(
        pool: &PgPool,
        stripe: &StripeClient,
        user: &User,
        plan_id: Uuid,
        return_url: &str,
        upgrade_only: bool,
    ) -> Result<String, AppError> {
        let plan = Self::get_plan(pool, plan_id).await?;
        if plan.name == PlanName::Basic {
            return Err(AppError::Validation("Cannot upgrade to basic plan".to_string()));
        }

        if upgrade_only {
            let current = Self::effective_plan(pool, user.id).await?;
            if current.price_cents >= plan.price_cents {
                return Err(AppError::Validation("Cannot downgrade plan".to_string()));
            }
        }

        let price_id = plan.stripe_price_id.as_deref().ok_or_else(|| {
            AppError::Config(format!("The {} plan has no Stripe price configured", plan.name))
        })?;

        let session = stripe
            .create_checkout_session(&CheckoutRequest {
                customer_email: &user.email,
                price_id,
                success_url: return_url,
                cancel_url: return_url,
                user_id: user.id.to_string(),
                plan_id: plan.id.to_string(),
            })
            .await?;

        session
            .url
            .ok_or_else(|| AppError::Upstream("Stripe returned no checkout URL".to_string()))
    }

    /// Cancel a paid subscription at Stripe and move the user back to basic.
    pub async fn cancel(
        pool: &PgPool,
        stripe: &StripeClient,
        user_id: Uuid,
    ) -> Result<SubscriptionDetails, AppError> {
        let current = Self::for_user(pool, user_id).await?;
        if !current.subscription.is_active {
            return Err(AppError::NotFound("No active subscription found.".to_string()));
        }
        if current.plan.name == PlanName::Basic {
            return Err(AppError::Validation("Cannot cancel basic plan".to_string()));
        }

        if let Some(stripe_id) = &current.subscription.stripe_subscription_id {
            stripe.cancel_subscription(stripe_id).await?;
        }

        let details = Self::revert_to_basic(pool, current.subscription.id).await?;
        tracing::info!(user_id = %user_id, "Subscription cancelled");
        Ok(details)
    }

    pub async fn revert_to_basic(
        pool: &PgPool,
        subscription_id: Uuid,
    ) -> Result<SubscriptionDetails, AppError> {
        let basic = Self::plan_by_name(pool, PlanName::Basic).await?;
        let subscription: Subscription = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET plan_id = $1, stripe_subscription_id = NULL, is_active = TRUE,
                start_date = now(), end_date = now() + make_interval(days => $2)
            WHERE id = $3
            RETURNING *
            "#,
        )
        .bind(basic.id)
        .bind(basic.duration_days)
        .bind(subscription_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Subscription not found.".to_string()))?;

        Ok(SubscriptionDetails {
            subscription,
            plan: basic,
        })
    }

    /// Reactivate a subscription for one more period of its plan.
    pub async fn renew(pool: &PgPool, subscription_id: Uuid) -> Result<SubscriptionDetails, AppError> {
        let current = Self::get(pool, subscription_id).await?;
        let end = Utc::now() + Duration::days(current.plan.duration_days as i64);
        let subscription: Subscription = sqlx::query_as(
            "UPDATE subscriptions SET is_active = TRUE, end_date = $1 WHERE id = $2 RETURNING *",
        )
        .bind(end)
        .bind(subscription_id)
        .fetch_one(pool)
        .await?;

        tracing::info!(subscription_id = %subscription_id, end_date = %end, "Subscription renewed");
        Ok(SubscriptionDetails {
            subscription,
            plan: current.plan,
        })
    }

    /// Put a user on `plan_id` for a fresh period, creating the row if needed.
    pub async fn activate(
        pool: &PgPool,
        user_id: Uuid,
        plan_id: Uuid,
        stripe_subscription_id: Option<&str>,
    ) -> Result<SubscriptionDetails, AppError> {
        let plan = Self::get_plan(pool, plan_id).await?;
        let subscription: Subscription = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (id, user_id, plan_id, start_date, end_date, is_active, stripe_subscription_id)
            VALUES ($1, $2, $3, now(), now() + make_interval(days => $4), TRUE, $5)
            ON CONFLICT (user_id) DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                start_date = EXCLUDED.start_date,
                end_date = EXCLUDED.end_date,
                is_active = TRUE,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(plan.id)
        .bind(plan.duration_days)
        .bind(stripe_subscription_id)
        .fetch_one(pool)
        .await?;

        tracing::info!(user_id = %user_id, plan = %plan.name, "Subscription activated");
        Ok(SubscriptionDetails { subscription, plan })
    }

    pub async fn record_payment(
        pool: &PgPool,
        subscription_id: Uuid,
        amount_cents: i64,
        payment_intent_id: Option<&str>,
        status: PaymentStatus,
    ) -> Result<Payment, AppError> {
        let payment: Payment = sqlx::query_as(
            r#"
            INSERT INTO payments (id, subscription_id, amount_cents, stripe_payment_intent_id, status, payment_method)
            VALUES ($1, $2, $3, $4, $5, 'card')
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(subscription_id)
        .bind(amount_cents)
        .bind(payment_intent_id)
        .bind(status)
        .fetch_one(pool)
        .await?;
        Ok(payment)
    }

    pub async fn payments_for_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<Payment>, AppError> {
        let payments: Vec<Payment> = sqlx::query_as(
            r#"
            SELECT p.* FROM payments p
            JOIN subscriptions s ON s.id = p.subscription_id
            WHERE s.user_id = $1
            ORDER BY p.date DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await?;
        Ok(payments)
    }

    /// Apply a verified Stripe webhook event. Unhandled event types are ignored.
    pub async fn handle_webhook(pool: &PgPool, event: &WebhookEvent) -> Result<(), AppError> {
        if event.event_type != "checkout.session.completed" {
            tracing::debug!(event_id = %event.id, event_type = %event.event_type, "Ignoring Stripe event");
            return Ok(());
        }

        let session = &event.data.object;
        let metadata_id = |key: &str| {
            session["metadata"][key]
                .as_str()
                .and_then(|v| Uuid::parse_str(v).ok())
                .ok_or_else(|| AppError::Validation(format!("Checkout session missing metadata.{}", key)))
        };
        let user_id = metadata_id("user_id")?;
        let plan_id = metadata_id("plan_id")?;

        let details = Self::activate(pool, user_id, plan_id, session["subscription"].as_str()).await?;
        Self::record_payment(
            pool,
            details.subscription.id,
            details.plan.price_cents,
            session["payment_intent"].as_str(),
            PaymentStatus::Succeeded,
        )
        .await?;

        tracing::info!(
            event_id = %event.id,
            user_id = %user_id,
            plan = %details.plan.name,
            "Checkout completed"
        );
        Ok(())
    }
}
