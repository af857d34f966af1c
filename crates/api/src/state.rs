//! Shared application state for the Axum API server.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use sqlx::PgPool;

use planner_common::config::AppConfig;
use planner_engine::stripe::StripeClient;

use crate::hub::NotificationHub;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub redis: ConnectionManager,
    pub config: AppConfig,
    pub stripe: StripeClient,
    pub hub: Arc<NotificationHub>,
}

impl AppState {
    pub fn new(pool: PgPool, redis: ConnectionManager, config: AppConfig) -> Self {
        let stripe = StripeClient::from_config(&config);
        Self {
            pool,
            redis,
            config,
            stripe,
            hub: Arc::new(NotificationHub::new()),
        }
    }
}
