//! Redis-backed background job queue.
//!
//! Ready jobs live in a list (`LPUSH` by producers, `RPOP` by the worker).
//! Delayed jobs sit in a sorted set scored by their ready time and are moved
//! onto the list by [`JobQueue::promote_due`]. Jobs that exhaust their retries
//! are parked on a dead-letter list for inspection.

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

pub const QUEUE_KEY: &str = "queue:jobs";
pub const DELAYED_KEY: &str = "queue:jobs:delayed";
pub const DEAD_LETTER_KEY: &str = "queue:jobs:dead";

/// Maximum number of delayed jobs moved per promotion pass.
const PROMOTE_BATCH: i64 = 100;

/// Work the background worker knows how to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    SendEmail {
        recipient: String,
        subject: String,
        html: String,
    },
    RetryNotification {
        notification_id: Uuid,
    },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::SendEmail { .. } => "send_email",
            Job::RetryNotification { .. } => "retry_notification",
        }
    }
}

/// A job plus its delivery bookkeeping, as stored in Redis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: Uuid,
    pub job: Job,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl JobEnvelope {
    pub fn new(job: Job) -> Self {
        Self {
            id: Uuid::new_v4(),
            job,
            attempts: 0,
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }

    fn to_json(&self) -> Result<String, AppError> {
        serde_json::to_string(self)
            .map_err(|e| AppError::Internal(format!("Failed to encode job: {}", e)))
    }
}

/// Queue depth snapshot used by health checks.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueDepth {
    pub queued: u64,
    pub delayed: u64,
    pub dead: u64,
}

impl QueueDepth {
    pub fn backlog(&self) -> u64 {
        self.queued + self.delayed
    }
}

pub struct JobQueue;

impl JobQueue {
    /// Enqueue a job for immediate execution.
    pub async fn enqueue(redis: &mut ConnectionManager, job: Job) -> Result<Uuid, AppError> {
        let envelope = JobEnvelope::new(job);
        Self::push(redis, &envelope).await?;
        tracing::debug!(job_id = %envelope.id, kind = envelope.job.kind(), "Job enqueued");
        Ok(envelope.id)
    }

    /// Enqueue a job that becomes ready after `delay`.
    pub async fn enqueue_in(
        redis: &mut ConnectionManager,
        job: Job,
        delay: std::time::Duration,
    ) -> Result<Uuid, AppError> {
        let envelope = JobEnvelope::new(job);
        let ready_at = Utc::now()
            + chrono::Duration::from_std(delay)
                .map_err(|e| AppError::Internal(format!("Invalid job delay: {}", e)))?;
        Self::schedule(redis, &envelope, ready_at).await?;
        Ok(envelope.id)
    }

    pub async fn push(redis: &mut ConnectionManager, envelope: &JobEnvelope) -> Result<(), AppError> {
        redis::cmd("LPUSH")
            .arg(QUEUE_KEY)
            .arg(envelope.to_json()?)
            .query_async::<()>(redis)
            .await?;
        Ok(())
    }

    pub async fn schedule(
        redis: &mut ConnectionManager,
        envelope: &JobEnvelope,
        ready_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        // Scores are whole seconds; round up so a job never runs early.
        let score = ready_at.timestamp() + i64::from(ready_at.timestamp_subsec_nanos() > 0);
        redis::cmd("ZADD")
            .arg(DELAYED_KEY)
            .arg(score)
            .arg(envelope.to_json()?)
            .query_async::<()>(redis)
            .await?;
        tracing::debug!(
            job_id = %envelope.id,
            kind = envelope.job.kind(),
            ready_at = %ready_at,
            "Job scheduled"
        );
        Ok(())
    }

    /// Pop the oldest ready job. Undecodable entries are moved to the dead-letter list.
    pub async fn pop(redis: &mut ConnectionManager) -> Result<Option<JobEnvelope>, AppError> {
        let raw: Option<String> = redis::cmd("RPOP")
            .arg(QUEUE_KEY)
            .query_async(redis)
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<JobEnvelope>(&raw) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed job to dead-letter list");
                redis::cmd("LPUSH")
                    .arg(DEAD_LETTER_KEY)
                    .arg(raw)
                    .query_async::<()>(redis)
                    .await?;
                Ok(None)
            }
        }
    }

    /// Move delayed jobs whose ready time has passed onto the ready list.
    pub async fn promote_due(redis: &mut ConnectionManager) -> Result<usize, AppError> {
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(DELAYED_KEY)
            .arg("-inf")
            .arg(Utc::now().timestamp())
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(redis)
            .await?;

        let mut promoted = 0;
        for raw in due {
            // ZREM winner owns the job.
            let removed: i64 = redis::cmd("ZREM")
                .arg(DELAYED_KEY)
                .arg(&raw)
                .query_async(redis)
                .await?;
            if removed == 1 {
                redis::cmd("LPUSH")
                    .arg(QUEUE_KEY)
                    .arg(&raw)
                    .query_async::<()>(redis)
                    .await?;
                promoted += 1;
            }
        }

        if promoted > 0 {
            tracing::debug!(promoted, "Promoted delayed jobs");
        }
        Ok(promoted)
    }

    pub async fn dead_letter(
        redis: &mut ConnectionManager,
        envelope: &JobEnvelope,
    ) -> Result<(), AppError> {
        redis::cmd("LPUSH")
            .arg(DEAD_LETTER_KEY)
            .arg(envelope.to_json()?)
            .query_async::<()>(redis)
            .await?;
        tracing::warn!(
            job_id = %envelope.id,
            kind = envelope.job.kind(),
            attempts = envelope.attempts,
            "Job moved to dead-letter list"
        );
        Ok(())
    }

    pub async fn depth(redis: &mut ConnectionManager) -> Result<QueueDepth, AppError> {
        let (queued, delayed, dead): (u64, u64, u64) = redis::pipe()
            .cmd("LLEN")
            .arg(QUEUE_KEY)
            .cmd("ZCARD")
            .arg(DELAYED_KEY)
            .cmd("LLEN")
            .arg(DEAD_LETTER_KEY)
            .query_async(redis)
            .await?;
        Ok(QueueDepth {
            queued,
            delayed,
            dead,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_wire_format_is_tagged() {
        let job = Job::RetryNotification {
            notification_id: Uuid::nil(),
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["kind"], "retry_notification");
        assert_eq!(value["notification_id"], Uuid::nil().to_string());
    }

    #[test]
    fn test_envelope_tolerates_missing_last_error() {
        let raw = serde_json::json!({
            "id": Uuid::nil(),
            "job": {"kind": "send_email", "recipient": "a@b.c", "subject": "Hi", "html": "<p>x</p>"},
            "attempts": 2,
            "enqueued_at": "2025-01-01T00:00:00Z"
        });
        let envelope: JobEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(envelope.attempts, 2);
        assert!(envelope.last_error.is_none());
        assert_eq!(envelope.job.kind(), "send_email");
    }

    #[test]
    fn test_backlog_counts_ready_and_delayed() {
        let depth = QueueDepth {
            queued: 40,
            delayed: 70,
            dead: 3,
        };
        assert_eq!(depth.backlog(), 110);
    }
}
