//! Periodic maintenance tasks run alongside the job consumer.

use std::time::Duration;

use redis::aio::ConnectionManager;
use sqlx::PgPool;
use tokio::time::{Interval, MissedTickBehavior};

use planner_engine::maintenance::Maintenance;

pub const OVERDUE_CHECK_EVERY: Duration = Duration::from_secs(60 * 60);
pub const PRUNE_EVERY: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const LAST_SEEN_FLUSH_EVERY: Duration = Duration::from_secs(15 * 60);
pub const OTP_CLEANUP_EVERY: Duration = Duration::from_secs(60 * 60);

fn every(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

pub struct Scheduler {
    pool: PgPool,
    redis: ConnectionManager,
}

impl Scheduler {
    pub fn new(pool: PgPool, redis: ConnectionManager) -> Self {
        Self { pool, redis }
    }

    /// Run every task on its own period until cancelled. Each fires once at startup.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut overdue = every(OVERDUE_CHECK_EVERY);
        let mut prune = every(PRUNE_EVERY);
        let mut last_seen = every(LAST_SEEN_FLUSH_EVERY);
        let mut otps = every(OTP_CLEANUP_EVERY);

        tracing::info!("Scheduler started");
        loop {
            tokio::select! {
                _ = overdue.tick() => self.check_overdue().await,
                _ = prune.tick() => self.prune_notifications().await,
                _ = last_seen.tick() => self.flush_last_seen().await,
                _ = otps.tick() => self.cleanup_otps().await,
            }
        }
    }

    async fn check_overdue(&mut self) {
        match Maintenance::check_overdue_items(&self.pool, &mut self.redis).await {
            Ok(report) => tracing::info!(?report, "Overdue check finished"),
            Err(e) => tracing::error!(error = %e, "Overdue check failed"),
        }
    }

    async fn prune_notifications(&mut self) {
        match Maintenance::prune_notifications(&self.pool).await {
            Ok(deleted) => tracing::info!(deleted, "Old notifications pruned"),
            Err(e) => tracing::error!(error = %e, "Notification pruning failed"),
        }
    }

    async fn flush_last_seen(&mut self) {
        match Maintenance::update_last_seen(&self.pool, &mut self.redis).await {
            Ok(updated) => tracing::debug!(updated, "Last-seen timestamps flushed"),
            Err(e) => tracing::error!(error = %e, "Last-seen flush failed"),
        }
    }

    async fn cleanup_otps(&mut self) {
        match Maintenance::cleanup_expired_otps(&self.pool).await {
            Ok(deleted) => tracing::debug!(deleted, "Expired OTPs removed"),
            Err(e) => tracing::error!(error = %e, "OTP cleanup failed"),
        }
    }
}
