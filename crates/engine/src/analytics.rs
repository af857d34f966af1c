//! Dashboard aggregates and the health report, cached in Redis.

use std::future::Future;

use redis::aio::ConnectionManager;
use serde_json::{Map, Value, json};
use sqlx::PgPool;

use planner_common::error::AppError;
use planner_common::queue::JobQueue;

pub const CACHE_TTL_SECONDS: u64 = 3600;
pub const HEALTH_TTL_SECONDS: u64 = 60;

/// Queued plus delayed jobs at which the worker is reported as backlogged.
pub const BACKLOG_THRESHOLD: u64 = 100;

pub const USER_ACTIVITY_KEY: &str = "analytics:user_activity";
pub const PROJECT_STATS_KEY: &str = "analytics:project_stats";
pub const TASK_STATS_KEY: &str = "analytics:task_stats";
pub const SUBSCRIPTION_STATS_KEY: &str = "analytics:subscription_stats";
pub const HEALTH_KEY: &str = "health:check";

const ACTIVITY_WINDOW_DAYS: i32 = 30;

/// Return the cached value at `key`, or compute, store and return it.
///
/// Redis failures degrade to computing on every call.
async fn cached<F, Fut>(
    redis: &mut ConnectionManager,
    key: &str,
    ttl_seconds: u64,
    compute: F,
) -> Result<Value, AppError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, AppError>>,
{
    let hit: Result<Option<String>, redis::RedisError> =
        redis::cmd("GET").arg(key).query_async(redis).await;
    match hit {
        Ok(Some(raw)) => {
            if let Ok(value) = serde_json::from_str(&raw) {
                return Ok(value);
            }
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(key, error = %e, "Cache read failed"),
    }

    let value = compute().await?;
    let stored: Result<(), redis::RedisError> = redis::cmd("SET")
        .arg(key)
        .arg(value.to_string())
        .arg("EX")
        .arg(ttl_seconds)
        .query_async(redis)
        .await;
    if let Err(e) = stored {
        tracing::warn!(key, error = %e, "Cache write failed");
    }
    Ok(value)
}

fn counts_to_map(rows: Vec<(String, i64)>) -> Value {
    rows.into_iter()
        .map(|(key, count)| (key, json!(count)))
        .collect::<Map<String, Value>>()
        .into()
}

pub struct Analytics;

impl Analytics {
    pub async fn user_activity(pool: &PgPool, redis: &mut ConnectionManager) -> Result<Value, AppError> {
        cached(redis, USER_ACTIVITY_KEY, CACHE_TTL_SECONDS, || async {
            let (active, new_users, total): (i64, i64, i64) = sqlx::query_as(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE last_login >= now() - make_interval(days => $1)),
                    COUNT(*) FILTER (WHERE date_joined >= now() - make_interval(days => $1)),
                    COUNT(*)
                FROM users
                "#,
            )
            .bind(ACTIVITY_WINDOW_DAYS)
            .fetch_one(pool)
            .await?;
            Ok(json!({
                "active_users": active,
                "new_users": new_users,
                "total_users": total,
                "period_days": ACTIVITY_WINDOW_DAYS,
            }))
        })
        .await
    }

    pub async fn project_stats(pool: &PgPool, redis: &mut ConnectionManager) -> Result<Value, AppError> {
        cached(redis, PROJECT_STATS_KEY, CACHE_TTL_SECONDS, || async {
            let rows: Vec<(String, i64)> =
                sqlx::query_as("SELECT status, COUNT(*) FROM projects GROUP BY status ORDER BY status")
                    .fetch_all(pool)
                    .await?;
            let total: i64 = rows.iter().map(|(_, n)| n).sum();
            Ok(json!({ "total_projects": total, "by_status": counts_to_map(rows) }))
        })
        .await
    }

    pub async fn task_stats(pool: &PgPool, redis: &mut ConnectionManager) -> Result<Value, AppError> {
        cached(redis, TASK_STATS_KEY, CACHE_TTL_SECONDS, || async {
            let rows: Vec<(String, i64)> =
                sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status ORDER BY status")
                    .fetch_all(pool)
                    .await?;
            let total: i64 = rows.iter().map(|(_, n)| n).sum();
            Ok(json!({ "total_tasks": total, "by_status": counts_to_map(rows) }))
        })
        .await
    }

    pub async fn subscription_stats(pool: &PgPool, redis: &mut ConnectionManager) -> Result<Value, AppError> {
        cached(redis, SUBSCRIPTION_STATS_KEY, CACHE_TTL_SECONDS, || async {
            let (total, active, revenue): (i64, i64, i64) = sqlx::query_as(
                r#"
                SELECT COUNT(*),
                       COUNT(*) FILTER (WHERE s.is_active),
                       COALESCE(SUM(p.price_cents) FILTER (WHERE s.is_active), 0)::BIGINT
                FROM subscriptions s JOIN subscription_plans p ON p.id = s.plan_id
                "#,
            )
            .fetch_one(pool)
            .await?;
            let by_plan: Vec<(String, i64)> = sqlx::query_as(
                r#"
                SELECT p.name, COUNT(s.id)
                FROM subscription_plans p LEFT JOIN subscriptions s ON s.plan_id = p.id
                GROUP BY p.name, p.price_cents ORDER BY p.price_cents
                "#,
            )
            .fetch_all(pool)
            .await?;
            Ok(json!({
                "total_subscriptions": total,
                "active_subscriptions": active,
                "revenue_cents": revenue,
                "by_plan": counts_to_map(by_plan),
            }))
        })
        .await
    }

    /// Drop cached aggregates after data they summarise has changed.
    pub async fn invalidate(redis: &mut ConnectionManager) {
        let result: Result<(), redis::RedisError> = redis::cmd("DEL")
            .arg(USER_ACTIVITY_KEY)
            .arg(PROJECT_STATS_KEY)
            .arg(TASK_STATS_KEY)
            .arg(SUBSCRIPTION_STATS_KEY)
            .query_async(redis)
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to invalidate analytics cache");
        }
    }

    /// Database, cache and worker queue status.
    pub async fn health(pool: &PgPool, redis: &mut ConnectionManager) -> Result<Value, AppError> {
        let mut checker = redis.clone();
        cached(redis, HEALTH_KEY, HEALTH_TTL_SECONDS, || async move {
            let database = match planner_common::db::ping(pool).await {
                Ok(()) => json!({"status": "healthy"}),
                Err(e) => json!({"status": "unhealthy", "error": e.to_string()}),
            };
            let cache = match planner_common::redis_pool::ping(&mut checker).await {
                Ok(()) => json!({"status": "healthy"}),
                Err(e) => json!({"status": "unhealthy", "error": e.to_string()}),
            };
            let (worker_queue, dead_letter) = match JobQueue::depth(&mut checker).await {
                Ok(depth) => {
                    let status = if depth.backlog() >= BACKLOG_THRESHOLD {
                        "backlogged"
                    } else {
                        "healthy"
                    };
                    (
                        json!({"status": status, "queued": depth.queued, "delayed": depth.delayed}),
                        json!({"count": depth.dead}),
                    )
                }
                Err(e) => (
                    json!({"status": "unhealthy", "error": e.public_message()}),
                    json!({"count": null}),
                ),
            };
            Ok(json!({
                "database": database,
                "cache": cache,
                "worker_queue": worker_queue,
                "dead_letter": dead_letter,
            }))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_to_map() {
        let map = counts_to_map(vec![("completed".into(), 3), ("overdue".into(), 1)]);
        assert_eq!(map, json!({"completed": 3, "overdue": 1}));
    }
}
