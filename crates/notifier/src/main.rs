use planner_common::config::AppConfig;
use planner_common::db;
use planner_common::redis_pool::create_redis_pool;
use planner_notifier::email::EmailClient;
use planner_notifier::scheduler::Scheduler;
use planner_notifier::worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "planner_notifier=info,planner_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Project Planner worker starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let redis = create_redis_pool(&config.redis_url).await?;

    let email = EmailClient::from_config(&config);
    let mut worker = Worker::new(
        pool.clone(),
        redis.clone(),
        email,
        config.worker_poll_interval_ms,
    );
    let mut scheduler = Scheduler::new(pool, redis);

    // Run with graceful shutdown on Ctrl+C
    tokio::select! {
        result = worker.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Job worker exited with error");
                return Err(e);
            }
        }
        result = scheduler.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Scheduler exited with error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    tracing::info!("Project Planner worker stopped.");
    Ok(())
}
