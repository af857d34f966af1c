//! Fixed-window request quotas kept in Redis.
//!
//! Authenticated callers are counted per user per day, anonymous callers per
//! client address per hour. Redis outages fail open.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use redis::aio::ConnectionManager;

use planner_common::error::AppError;

use crate::middleware::auth::{TokenType, bearer_token, decode_typed};
use crate::state::AppState;

pub const USER_WINDOW_SECONDS: i64 = 86_400;
pub const ANON_WINDOW_SECONDS: i64 = 3_600;

const EXEMPT_PATHS: &[&str] = &["/health"];

/// Who a request is counted against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    User(String),
    Anonymous(String),
}

impl Caller {
    fn window_seconds(&self) -> i64 {
        match self {
            Caller::User(_) => USER_WINDOW_SECONDS,
            Caller::Anonymous(_) => ANON_WINDOW_SECONDS,
        }
    }
}

/// Counter key for the window containing `now`.
pub fn window_key(caller: &Caller, now: i64) -> String {
    let window = now / caller.window_seconds();
    match caller {
        Caller::User(id) => format!("throttle:user:{}:{}", id, window),
        Caller::Anonymous(addr) => format!("throttle:anon:{}:{}", addr, window),
    }
}

/// Increment the caller's counter and return the new count.
async fn hit(redis: &mut ConnectionManager, key: &str, ttl: i64) -> Result<u64, redis::RedisError> {
    let (count,): (u64,) = redis::pipe()
        .cmd("INCR")
        .arg(key)
        .cmd("EXPIRE")
        .arg(key)
        .arg(ttl)
        .ignore()
        .query_async(redis)
        .await?;
    Ok(count)
}

fn client_address(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
    {
        return forwarded.trim().to_string();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn throttle(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if EXEMPT_PATHS.contains(&request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let caller = bearer_token(request.headers())
        .and_then(|token| decode_typed(&token, &state.config.jwt_secret, TokenType::Access).ok())
        .map(|claims| Caller::User(claims.sub))
        .unwrap_or_else(|| Caller::Anonymous(client_address(&request)));
    let limit = match caller {
        Caller::User(_) => state.config.throttle_user_per_day,
        Caller::Anonymous(_) => state.config.throttle_anon_per_hour,
    };

    let key = window_key(&caller, Utc::now().timestamp());
    let mut redis = state.redis.clone();
    match hit(&mut redis, &key, caller.window_seconds()).await {
        Ok(count) if count > limit => {
            tracing::debug!(key = %key, count, limit, "Request throttled");
            return Err(AppError::TooManyRequests(
                "Request was throttled. Try again later.".to_string(),
            ));
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Throttle check failed, allowing request"),
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_window_is_daily() {
        let caller = Caller::User("u1".into());
        let morning = 1_700_006_400; // 00:00 UTC
        assert_eq!(window_key(&caller, morning), window_key(&caller, morning + 86_399));
        assert_ne!(window_key(&caller, morning), window_key(&caller, morning + 86_400));
    }

    #[test]
    fn test_anonymous_window_is_hourly() {
        let caller = Caller::Anonymous("10.0.0.1".into());
        let key = window_key(&caller, 7_200);
        assert_eq!(key, "throttle:anon:10.0.0.1:2");
        assert_ne!(key, window_key(&caller, 7_200 + 3_600));
    }
}
