//! Job consumer with exponential backoff and a dead-letter list.

use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use sqlx::PgPool;

use planner_common::error::AppError;
use planner_common::queue::{Job, JobEnvelope, JobQueue};
use planner_engine::notifications::{NotificationService, ResendOutcome};

use crate::email::EmailClient;

/// Attempts after which a job is parked on the dead-letter list.
pub const MAX_ATTEMPTS: u32 = 5;
/// Delay before the first retry; doubles on every further failure.
pub const BASE_BACKOFF: Duration = Duration::from_secs(30);

/// Delay before retrying a job that has failed `attempts` times so far.
pub fn backoff(attempts: u32) -> Duration {
    BASE_BACKOFF * 2u32.saturating_pow(attempts.min(16))
}

pub struct Worker {
    pool: PgPool,
    redis: ConnectionManager,
    email: EmailClient,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(pool: PgPool, redis: ConnectionManager, email: EmailClient, poll_interval_ms: u64) -> Self {
        Self {
            pool,
            redis,
            email,
            poll_interval: Duration::from_millis(poll_interval_ms),
        }
    }

    /// Consume jobs until the task is cancelled.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            email_enabled = self.email.is_configured(),
            "Job worker started"
        );

        loop {
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => {
                    tracing::error!(error = %e, "Job queue unavailable, backing off");
                    tokio::time::sleep(self.poll_interval * 5).await;
                }
            }
        }
    }

    /// Promote due jobs and execute at most one. Returns whether a job ran.
    pub async fn tick(&mut self) -> Result<bool, AppError> {
        let promoted = JobQueue::promote_due(&mut self.redis).await?;
        if promoted > 0 {
            tracing::debug!(promoted, "Promoted delayed jobs");
        }

        let Some(envelope) = JobQueue::pop(&mut self.redis).await? else {
            return Ok(false);
        };

        match self.execute(&envelope.job).await {
            Ok(None) => {
                tracing::info!(job_id = %envelope.id, kind = envelope.job.kind(), "Job completed");
            }
            Ok(Some(wait)) => self.defer(envelope, wait).await?,
            Err(e) => self.fail(envelope, e).await?,
        }
        Ok(true)
    }

    /// Run one job. `Some(wait)` means it is not due yet and must run again later.
    async fn execute(&mut self, job: &Job) -> Result<Option<Duration>, AppError> {
        match job {
            Job::SendEmail {
                recipient,
                subject,
                html,
            } => {
                self.email.send(recipient, subject, html).await?;
                Ok(None)
            }
            Job::RetryNotification { notification_id } => {
                let outcome =
                    NotificationService::retry(&self.pool, &mut self.redis, *notification_id).await?;
                match outcome {
                    ResendOutcome::TooSoon(wait) => return Ok(Some(wait)),
                    ResendOutcome::Delivered | ResendOutcome::AlreadyDelivered => {}
                    ResendOutcome::Failed | ResendOutcome::Exhausted => {
                        tracing::info!(notification_id = %notification_id, ?outcome, "Notification not resent");
                    }
                }
                Ok(None)
            }
        }
    }

    /// Put a job that ran early back on the delayed set without counting an attempt.
    async fn defer(&mut self, envelope: JobEnvelope, wait: Duration) -> Result<(), AppError> {
        tracing::debug!(
            job_id = %envelope.id,
            kind = envelope.job.kind(),
            wait_ms = wait.as_millis() as u64,
            "Job not due yet, rescheduling"
        );
        let ready_at = Utc::now() + chrono::Duration::from_std(wait).unwrap_or_default();
        JobQueue::schedule(&mut self.redis, &envelope, ready_at).await
    }

    async fn fail(&mut self, mut envelope: JobEnvelope, error: AppError) -> Result<(), AppError> {
        envelope.attempts += 1;
        envelope.last_error = Some(error.to_string());

        if envelope.attempts >= MAX_ATTEMPTS {
            return JobQueue::dead_letter(&mut self.redis, &envelope).await;
        }

        let delay = backoff(envelope.attempts - 1);
        tracing::warn!(
            job_id = %envelope.id,
            kind = envelope.job.kind(),
            attempts = envelope.attempts,
            retry_in_secs = delay.as_secs(),
            error = %error,
            "Job failed, retrying"
        );
        let ready_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        JobQueue::schedule(&mut self.redis, &envelope, ready_at).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff(0), Duration::from_secs(30));
        assert_eq!(backoff(1), Duration::from_secs(60));
        assert_eq!(backoff(3), Duration::from_secs(240));
    }

    #[test]
    fn test_backoff_saturates() {
        assert_eq!(backoff(40), backoff(16));
    }
}
