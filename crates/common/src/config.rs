use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (cache, job queue, pub/sub)
    pub redis_url: String,

    /// JWT secret for API authentication
    pub jwt_secret: String,

    /// Access token lifetime in minutes (default: 60)
    pub access_token_minutes: u64,

    /// Refresh token lifetime in hours (default: 24)
    pub refresh_token_hours: u64,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// HTTP bind port for the API server
    pub api_port: u16,

    /// Public base URL used in emailed links and notification targets
    pub frontend_url: String,

    /// Resend API key for email delivery. Emails are only logged when unset.
    pub resend_api_key: Option<String>,

    /// Email sender address
    pub email_from: String,

    /// Mail API endpoint
    pub email_api_url: String,

    /// Stripe secret API key
    pub stripe_secret_key: Option<String>,

    /// Stripe webhook signing secret
    pub stripe_webhook_secret: Option<String>,

    /// Stripe API base URL
    pub stripe_api_base: String,

    /// Requests per day allowed for an authenticated user
    pub throttle_user_per_day: u64,

    /// Requests per hour allowed for an anonymous client
    pub throttle_anon_per_hour: u64,

    /// Idle poll interval of the background job consumer in milliseconds
    pub worker_poll_interval_ms: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            jwt_secret: std::env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET environment variable is required"))?,
            access_token_minutes: std::env::var("ACCESS_TOKEN_MINUTES")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("ACCESS_TOKEN_MINUTES must be a valid u64"))?,
            refresh_token_hours: std::env::var("REFRESH_TOKEN_HOURS")
                .unwrap_or_else(|_| "24".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("REFRESH_TOKEN_HOURS must be a valid u64"))?,
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("API_PORT must be a valid u16"))?,
            frontend_url: std::env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Project Planner <noreply@projectplanner.dev>".to_string()),
            email_api_url: std::env::var("EMAIL_API_URL")
                .unwrap_or_else(|_| "https://api.resend.com/emails".to_string()),
            stripe_secret_key: std::env::var("STRIPE_SECRET_KEY").ok(),
            stripe_webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET").ok(),
            stripe_api_base: std::env::var("STRIPE_API_BASE")
                .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
            throttle_user_per_day: std::env::var("THROTTLE_USER_PER_DAY")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("THROTTLE_USER_PER_DAY must be a valid u64"))?,
            throttle_anon_per_hour: std::env::var("THROTTLE_ANON_PER_HOUR")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("THROTTLE_ANON_PER_HOUR must be a valid u64"))?,
            worker_poll_interval_ms: std::env::var("WORKER_POLL_INTERVAL_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("WORKER_POLL_INTERVAL_MS must be a valid u64"))?,
        })
    }
}
