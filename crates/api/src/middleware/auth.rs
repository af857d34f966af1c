//! JWT issuance and validation plus the authentication extractors.
//!
//! Access, refresh and password-reset tokens share one claim set and are told
//! apart by `token_type`. Protected routes only accept access tokens. Logged-out
//! refresh tokens are kept on a Redis blacklist until they would have expired.

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use planner_common::config::AppConfig;
use planner_common::error::AppError;
use planner_common::types::{User, UserRole};
use planner_engine::users::UserService;

use crate::state::AppState;

pub const RESET_TOKEN_MINUTES: i64 = 15;

const BLACKLIST_PREFIX: &str = "auth:blacklist:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
    Reset,
}

/// JWT claims stored in every token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject: the user's UUID
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    /// Unique token id, the blacklist key
    pub jti: String,
    pub token_type: TokenType,
    pub username: String,
    pub email: String,
    pub role: UserRole,
}

impl Claims {
    pub fn user_id(&self) -> Result<Uuid, AppError> {
        Uuid::parse_str(&self.sub).map_err(|_| AppError::Auth("Invalid user ID in token".to_string()))
    }

    /// Seconds until expiry, never negative.
    pub fn remaining_seconds(&self) -> u64 {
        (self.exp - Utc::now().timestamp()).max(0) as u64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub refresh: String,
    pub access: String,
}

pub fn encode_token(
    user: &User,
    token_type: TokenType,
    secret: &str,
    lifetime: Duration,
) -> Result<String, AppError> {
    let now = Utc::now();
    let claims = Claims {
        sub: user.id.to_string(),
        exp: (now + lifetime).timestamp(),
        iat: now.timestamp(),
        jti: Uuid::new_v4().simple().to_string(),
        token_type,
        username: user.username.clone(),
        email: user.email.clone(),
        role: user.role,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("Failed to encode JWT: {}", e)))
}

/// A fresh refresh/access pair for `user`.
pub fn issue_pair(user: &User, config: &AppConfig) -> Result<TokenPair, AppError> {
    Ok(TokenPair {
        refresh: encode_token(
            user,
            TokenType::Refresh,
            &config.jwt_secret,
            Duration::hours(config.refresh_token_hours as i64),
        )?,
        access: issue_access(user, config)?,
    })
}

pub fn issue_access(user: &User, config: &AppConfig) -> Result<String, AppError> {
    encode_token(
        user,
        TokenType::Access,
        &config.jwt_secret,
        Duration::minutes(config.access_token_minutes as i64),
    )
}

pub fn issue_reset(user: &User, config: &AppConfig) -> Result<String, AppError> {
    encode_token(
        user,
        TokenType::Reset,
        &config.jwt_secret,
        Duration::minutes(RESET_TOKEN_MINUTES),
    )
}

/// Decode and validate a JWT's signature and expiry.
pub fn decode_jwt(token: &str, secret: &str) -> Result<Claims, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| AppError::Auth(format!("Invalid token: {}", e)))?;

    Ok(token_data.claims)
}

/// Decode a token that must be of `expected` type.
pub fn decode_typed(token: &str, secret: &str, expected: TokenType) -> Result<Claims, AppError> {
    let claims = decode_jwt(token, secret)?;
    if claims.token_type != expected {
        return Err(AppError::Auth("Token has wrong type".to_string()));
    }
    Ok(claims)
}

/// Reject the token until it would have expired anyway.
pub async fn blacklist(redis: &mut ConnectionManager, claims: &Claims) -> Result<(), AppError> {
    let ttl = claims.remaining_seconds().max(1);
    redis::cmd("SET")
        .arg(format!("{}{}", BLACKLIST_PREFIX, claims.jti))
        .arg("1")
        .arg("EX")
        .arg(ttl)
        .query_async::<()>(redis)
        .await?;
    Ok(())
}

pub async fn is_blacklisted(redis: &mut ConnectionManager, claims: &Claims) -> Result<bool, AppError> {
    let exists: bool = redis::cmd("EXISTS")
        .arg(format!("{}{}", BLACKLIST_PREFIX, claims.jti))
        .query_async(redis)
        .await?;
    Ok(exists)
}

/// The bearer token from the `Authorization` header, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
}

/// Authenticated user extracted from an access token.
///
/// ```ignore
/// async fn handler(auth: AuthUser) -> impl IntoResponse {
///     // auth.user is the active account the token belongs to
/// }
/// ```
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
    pub claims: Claims,
}

impl AuthUser {
    pub fn id(&self) -> Uuid {
        self.user.id
    }

    async fn from_token(token: &str, state: &AppState) -> Result<Self, AppError> {
        let claims = decode_typed(token, &state.config.jwt_secret, TokenType::Access)?;
        let user = UserService::get(&state.pool, claims.user_id()?)
            .await
            .map_err(|_| AppError::Auth("User not found".to_string()))?;
        if !user.is_active {
            return Err(AppError::Auth("User account is disabled".to_string()));
        }
        Ok(AuthUser { user, claims })
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let token = bearer_token(&parts.headers);
        let state = state.clone();

        async move {
            let token = token.ok_or_else(|| {
                AppError::Auth("Authentication credentials were not provided.".to_string())
            })?;
            AuthUser::from_token(&token, &state).await
        }
    }
}

/// Like [`AuthUser`] but yields `None` for anonymous or invalid credentials.
#[derive(Debug, Clone)]
pub struct OptionalAuthUser(pub Option<AuthUser>);

impl FromRequestParts<AppState> for OptionalAuthUser {
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let token = bearer_token(&parts.headers);
        let state = state.clone();

        async move {
            let Some(token) = token else {
                return Ok(OptionalAuthUser(None));
            };
            Ok(OptionalAuthUser(AuthUser::from_token(&token, &state).await.ok()))
        }
    }
}

/// An authenticated user with the admin role.
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

impl AdminUser {
    pub fn user(&self) -> &User {
        &self.0.user
    }
}

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let auth = AuthUser::from_request_parts(parts, state);

        async move {
            let auth = auth.await?;
            if !auth.user.is_admin() {
                return Err(AppError::Forbidden(
                    "You do not have permission to perform this action.".to_string(),
                ));
            }
            Ok(AdminUser(auth))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &str = "test-secret-key-for-unit-tests";

    fn user() -> User {
        User {
            id: Uuid::new_v4(),
            username: "ada".into(),
            email: "ada@example.com".into(),
            pending_email: None,
            password_hash: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            role: UserRole::User,
            is_active: true,
            is_staff: false,
            email_verified: true,
            last_seen: None,
            last_login: None,
            date_joined: Utc::now(),
        }
    }

    #[test]
    fn test_encode_decode_jwt() {
        let user = user();
        let token = encode_token(&user, TokenType::Access, TEST_SECRET, Duration::minutes(60)).unwrap();
        let claims = decode_jwt(&token, TEST_SECRET).unwrap();
        assert_eq!(claims.sub, user.id.to_string());
        assert_eq!(claims.username, "ada");
        assert_eq!(claims.role, UserRole::User);
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn test_invalid_secret_rejected() {
        let token = encode_token(&user(), TokenType::Access, TEST_SECRET, Duration::minutes(60)).unwrap();
        assert!(decode_jwt(&token, "wrong-secret").is_err());
    }

    #[test]
    fn test_expired_jwt_rejected() {
        let token = encode_token(&user(), TokenType::Access, TEST_SECRET, Duration::hours(-1)).unwrap();
        assert!(decode_jwt(&token, TEST_SECRET).is_err());
    }

    #[test]
    fn test_refresh_token_is_not_an_access_token() {
        let token = encode_token(&user(), TokenType::Refresh, TEST_SECRET, Duration::hours(24)).unwrap();
        assert!(decode_typed(&token, TEST_SECRET, TokenType::Access).is_err());
        assert!(decode_typed(&token, TEST_SECRET, TokenType::Refresh).is_ok());
    }

    #[test]
    fn test_each_token_gets_its_own_jti() {
        let user = user();
        let a = encode_token(&user, TokenType::Refresh, TEST_SECRET, Duration::hours(1)).unwrap();
        let b = encode_token(&user, TokenType::Refresh, TEST_SECRET, Duration::hours(1)).unwrap();
        let a = decode_jwt(&a, TEST_SECRET).unwrap();
        let b = decode_jwt(&b, TEST_SECRET).unwrap();
        assert_ne!(a.jti, b.jti);
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert("authorization", "Bearer abc.def".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def"));
        headers.insert("authorization", "Basic xyz".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert!(decode_jwt("not.a.valid.jwt", TEST_SECRET).is_err());
    }
}
