//! Last-seen tracking.
//!
//! Each authenticated request may record "now" for its user in a Redis hash.
//! A per-user throttle key limits writes to one per window, using
//! `SET key value NX EX ttl` for an atomic check-and-set. The scheduler later
//! flushes the hash into `users.last_seen` in one batch.

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use sqlx::PgPool;
use uuid::Uuid;

use planner_common::error::AppError;

pub const LAST_SEEN_KEY: &str = "presence:last_seen";

/// Minimum seconds between two recorded sightings of the same user.
pub const THROTTLE_SECONDS: u64 = 300;

/// Buffered sightings expire if the scheduler never flushes them.
pub const BUFFER_TTL_SECONDS: u64 = 3600;

fn throttle_key(user_id: Uuid) -> String {
    format!("presence:throttle:{}", user_id)
}

pub struct PresenceTracker;

impl PresenceTracker {
    /// Record a sighting of `user_id`. Returns `true` if it was written,
    /// `false` if the user was seen within the throttle window.
    pub async fn touch(redis: &mut ConnectionManager, user_id: Uuid) -> Result<bool, AppError> {
        // Some("OK") when the key was set, None when it already existed.
        let result: Option<String> = redis::cmd("SET")
            .arg(throttle_key(user_id))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(THROTTLE_SECONDS)
            .query_async(redis)
            .await?;

        if result.is_none() {
            return Ok(false);
        }

        redis::pipe()
            .cmd("HSET")
            .arg(LAST_SEEN_KEY)
            .arg(user_id.to_string())
            .arg(Utc::now().to_rfc3339())
            .ignore()
            .cmd("EXPIRE")
            .arg(LAST_SEEN_KEY)
            .arg(BUFFER_TTL_SECONDS)
            .ignore()
            .query_async::<()>(redis)
            .await?;

        tracing::trace!(user_id = %user_id, "Recorded last seen");
        Ok(true)
    }

    /// Move all buffered sightings into the database. Returns the number of users updated.
    pub async fn flush(pool: &PgPool, redis: &mut ConnectionManager) -> Result<usize, AppError> {
        // RENAME detaches the buffer so new sightings land in a fresh hash.
        let staging = format!("{}:flushing", LAST_SEEN_KEY);
        let renamed: Result<(), redis::RedisError> = redis::cmd("RENAME")
            .arg(LAST_SEEN_KEY)
            .arg(&staging)
            .query_async(redis)
            .await;
        if renamed.is_err() {
            // No buffered sightings.
            return Ok(0);
        }

        let entries: Vec<(String, String)> = redis::cmd("HGETALL")
            .arg(&staging)
            .query_async(redis)
            .await?;
        redis::cmd("DEL").arg(&staging).query_async::<()>(redis).await?;

        let (ids, seen): (Vec<Uuid>, Vec<DateTime<Utc>>) = parse_entries(entries).into_iter().unzip();
        if ids.is_empty() {
            return Ok(0);
        }

        sqlx::query(
            r#"
            UPDATE users SET last_seen = data.seen
            FROM UNNEST($1::uuid[], $2::timestamptz[]) AS data(id, seen)
            WHERE users.id = data.id
            "#,
        )
        .bind(&ids)
        .bind(&seen)
        .execute(pool)
        .await?;

        tracing::info!(users = ids.len(), "Flushed last seen timestamps");
        Ok(ids.len())
    }
}

fn parse_entries(entries: Vec<(String, String)>) -> Vec<(Uuid, DateTime<Utc>)> {
    entries
        .into_iter()
        .filter_map(|(id, seen)| {
            let id = Uuid::parse_str(&id).ok()?;
            let seen = DateTime::parse_from_rfc3339(&seen).ok()?.with_timezone(&Utc);
            Some((id, seen))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_key_is_per_user() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_ne!(throttle_key(a), throttle_key(b));
        assert!(throttle_key(a).ends_with(&a.to_string()));
    }

    #[test]
    fn test_parse_entries_skips_garbage() {
        let id = Uuid::new_v4();
        let entries = vec![
            (id.to_string(), "2025-01-02T03:04:05+00:00".to_string()),
            ("not-a-uuid".to_string(), "2025-01-02T03:04:05+00:00".to_string()),
            (Uuid::new_v4().to_string(), "yesterday".to_string()),
        ];
        let parsed = parse_entries(entries);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, id);
    }
}
