use redis::Client;
use redis::aio::ConnectionManager;

/// Create a Redis connection manager for async operations.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let manager = ConnectionManager::new(client).await?;

    tracing::info!("Connected to Redis");
    Ok(manager)
}

/// Open a dedicated client for pub/sub, which needs its own connection.
pub fn create_pubsub_client(redis_url: &str) -> anyhow::Result<Client> {
    Ok(Client::open(redis_url)?)
}

/// Round-trip a `PING`. Used by health checks.
pub async fn ping(redis: &mut ConnectionManager) -> Result<(), redis::RedisError> {
    redis::cmd("PING").query_async::<String>(redis).await?;
    Ok(())
}
