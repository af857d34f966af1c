//! Project Planner API server binary entrypoint.

use std::net::SocketAddr;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use planner_common::config::AppConfig;
use planner_common::db::{create_pool, run_migrations};
use planner_common::redis_pool::{create_pubsub_client, create_redis_pool};

use planner_api::routes::create_router;
use planner_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("planner_api=debug,planner_engine=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Project Planner API server...");

    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;
    tracing::info!("Database pool created, migrations applied");

    let redis = create_redis_pool(&config.redis_url).await?;
    tracing::info!("Redis connection established");

    let pubsub = create_pubsub_client(&config.redis_url)?;
    let port = config.api_port;
    let state = AppState::new(pool, redis, config);

    // Fan Redis notification messages out to local WebSocket clients
    tokio::spawn(state.hub.clone().run(pubsub));

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
