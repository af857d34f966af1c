//! User accounts: registration with email verification, credential checks,
//! profile management and password changes.

use chrono::NaiveDate;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use planner_common::error::AppError;
use planner_common::types::{OtpPurpose, PlanName, Profile, User};

use crate::mailer::Mailer;
use crate::notifications::default_preferences;
use crate::otp::OtpService;
use crate::password;
use crate::subscriptions::SubscriptionService;

pub const MAX_USERNAME_LENGTH: usize = 150;

/// Request body for `POST /users/register/`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterParams {
    pub username: String,
    pub email: String,
    pub password: String,
    pub password2: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

pub enum RegisterOutcome {
    /// A new inactive account was created and a verification code sent.
    Created(User),
    /// An unverified account already existed; its code was re-sent.
    OtpResent(User),
}

/// What a verified code unlocked.
pub enum OtpOutcome {
    Registered(User),
    EmailChanged(User),
    ResetVerified(User),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NameUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Partial profile update. Names may be given at the top level or nested under `user`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    pub user: Option<NameUpdate>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub phone_number: Option<String>,
    pub pending_email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub email_verified: bool,
    pub plan: Option<PlanName>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileView {
    pub user: ProfileUser,
    pub address: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub phone_number: Option<String>,
    pub owned_projects_count: i32,
    pub participated_projects_count: i32,
}

pub fn validate_email(email: &str) -> Result<(), AppError> {
    let valid = email
        .split_once('@')
        .map(|(local, domain)| {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        })
        .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(AppError::Validation("Enter a valid email address.".to_string()))
    }
}

pub fn validate_username(username: &str) -> Result<(), AppError> {
    if username.is_empty() || username.len() > MAX_USERNAME_LENGTH {
        return Err(AppError::Validation(format!(
            "Username must be between 1 and {} characters.",
            MAX_USERNAME_LENGTH
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_alphanumeric() || "@.+-_".contains(c))
    {
        return Err(AppError::Validation(
            "Enter a valid username. This value may contain only letters, numbers, and @/./+/-/_ characters."
                .to_string(),
        ));
    }
    Ok(())
}

pub struct UserService;

impl UserService {
    pub async fn get(pool: &PgPool, user_id: Uuid) -> Result<User, AppError> {
        let user: User = sqlx::query_as("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
        Ok(user)
    }

    pub async fn find_by_email(pool: &PgPool, email: &str) -> Result<Option<User>, AppError> {
        let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE lower(email) = lower($1)")
            .bind(email)
            .fetch_optional(pool)
            .await?;
        Ok(user)
    }

    async fn find_by_pending_email(pool: &PgPool, email: &str) -> Result<Option<User>, AppError> {
        let user: Option<User> =
            sqlx::query_as("SELECT * FROM users WHERE lower(pending_email) = lower($1)")
                .bind(email)
                .fetch_optional(pool)
                .await?;
        Ok(user)
    }

    /// True if any account other than `except` uses `email` as its address or pending address.
    async fn email_in_use(pool: &PgPool, email: &str, except: Option<Uuid>) -> Result<bool, AppError> {
        let (taken,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM users
                WHERE (lower(email) = lower($1) OR lower(pending_email) = lower($1))
                  AND ($2::uuid IS NULL OR id <> $2)
            )
            "#,
        )
        .bind(email)
        .bind(except)
        .fetch_one(pool)
        .await?;
        Ok(taken)
    }

    /// Register a new account, or re-send the code to a matching unverified one.
    pub async fn register(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        params: &RegisterParams,
    ) -> Result<RegisterOutcome, AppError> {
        let email = params.email.trim();

        let pending: Option<User> = sqlx::query_as(
            "SELECT * FROM users WHERE username = $1 AND lower(pending_email) = lower($2) AND NOT is_active",
        )
        .bind(&params.username)
        .bind(email)
        .fetch_optional(pool)
        .await?;

        if let Some(user) = pending {
            let code = OtpService::issue(pool, user.id, email, OtpPurpose::Registration).await?;
            Mailer::send_otp(redis, email, &code).await?;
            tracing::info!(user_id = %user.id, "Registration OTP re-sent");
            return Ok(RegisterOutcome::OtpResent(user));
        }

        validate_username(&params.username)?;
        validate_email(email)?;
        if params.password != params.password2 {
            return Err(AppError::Validation(
                "Password fields didn't match.".to_string(),
            ));
        }
        password::validate(&params.password, &params.username)?;

        let (username_taken,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM users WHERE username = $1)")
                .bind(&params.username)
                .fetch_one(pool)
                .await?;
        if username_taken {
            return Err(AppError::Validation(
                "A user with that username already exists.".to_string(),
            ));
        }
        if Self::email_in_use(pool, email, None).await? {
            return Err(AppError::Validation(
                "A user with this email already exists.".to_string(),
            ));
        }

        let hashed = password::hash(&params.password)?;
        let mut tx = pool.begin().await?;
        let user: User = sqlx::query_as(
            r#"
            INSERT INTO users (id, username, email, pending_email, password_hash, first_name, last_name, is_active)
            VALUES ($1, $2, $3, $3, $4, $5, $6, FALSE)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&params.username)
        .bind(email)
        .bind(&hashed)
        .bind(params.first_name.trim())
        .bind(params.last_name.trim())
        .fetch_one(&mut *tx)
        .await?;

        Self::provision_in(&mut tx, user.id).await?;
        tx.commit().await?;

        let code = OtpService::issue(pool, user.id, email, OtpPurpose::Registration).await?;
        Mailer::send_otp(redis, email, &code).await?;

        tracing::info!(user_id = %user.id, username = %user.username, "User registered");
        Ok(RegisterOutcome::Created(user))
    }

    /// Create the rows every account owns: profile, preferences and a basic subscription.
    pub async fn provision(pool: &PgPool, user_id: Uuid) -> Result<(), AppError> {
        let mut tx = pool.begin().await?;
        Self::provision_in(&mut tx, user_id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// [`provision`](Self::provision) inside a caller's transaction.
    pub async fn provision_in(conn: &mut PgConnection, user_id: Uuid) -> Result<(), AppError> {
        sqlx::query("INSERT INTO profiles (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .execute(&mut *conn)
            .await?;
        sqlx::query(
            "INSERT INTO notification_preferences (user_id, preferences) VALUES ($1, $2) ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(default_preferences())
        .execute(&mut *conn)
        .await?;
        SubscriptionService::assign_basic(conn, user_id).await?;
        Ok(())
    }

    /// Check credentials for login. Records `last_login` on success.
    pub async fn authenticate(pool: &PgPool, username: &str, password: &str) -> Result<User, AppError> {
        let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(pool)
            .await?;

        let user = user
            .filter(|u| password::verify(password, &u.password_hash))
            .ok_or_else(|| AppError::Auth("Invalid credentials".to_string()))?;

        if !user.email_verified {
            return Err(AppError::Forbidden(
                "Please verify your email first".to_string(),
            ));
        }
        if !user.is_active {
            return Err(AppError::Forbidden("Your account is inactive".to_string()));
        }

        let user: User =
            sqlx::query_as("UPDATE users SET last_login = now() WHERE id = $1 RETURNING *")
                .bind(user.id)
                .fetch_one(pool)
                .await?;

        tracing::info!(user_id = %user.id, "User logged in");
        Ok(user)
    }

    pub async fn profile(pool: &PgPool, user_id: Uuid) -> Result<ProfileView, AppError> {
        let user = Self::get(pool, user_id).await?;
        sqlx::query("INSERT INTO profiles (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .execute(pool)
            .await?;
        let profile: Profile = sqlx::query_as("SELECT * FROM profiles WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(pool)
            .await?;
        let plan: Option<(PlanName,)> = sqlx::query_as(
            "SELECT p.name FROM subscriptions s JOIN subscription_plans p ON p.id = s.plan_id WHERE s.user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

        Ok(ProfileView {
            user: ProfileUser {
                id: user.id,
                username: user.username,
                email: user.email,
                first_name: user.first_name,
                last_name: user.last_name,
                email_verified: user.email_verified,
                plan: plan.map(|(name,)| name),
            },
            address: profile.address,
            city: profile.city,
            country: profile.country,
            date_of_birth: profile.date_of_birth,
            phone_number: profile.phone_number,
            owned_projects_count: profile.owned_projects_count,
            participated_projects_count: profile.participated_projects_count,
        })
    }

    /// Apply a profile update. A new `pending_email` starts an email-change
    /// verification and is returned so the caller can report it.
    pub async fn update_profile(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        user_id: Uuid,
        update: &ProfileUpdate,
    ) -> Result<(ProfileView, Option<String>), AppError> {
        let nested = update.user.clone().unwrap_or_default();
        let first_name = update.first_name.clone().or(nested.first_name);
        let last_name = update.last_name.clone().or(nested.last_name);

        sqlx::query(
            r#"
            UPDATE users SET
                first_name = COALESCE($1, first_name),
                last_name = COALESCE($2, last_name)
            WHERE id = $3
            "#,
        )
        .bind(first_name)
        .bind(last_name)
        .bind(user_id)
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            UPDATE profiles SET
                address = COALESCE($1, address),
                city = COALESCE($2, city),
                country = COALESCE($3, country),
                date_of_birth = COALESCE($4, date_of_birth),
                phone_number = COALESCE($5, phone_number)
            WHERE user_id = $6
            "#,
        )
        .bind(&update.address)
        .bind(&update.city)
        .bind(&update.country)
        .bind(update.date_of_birth)
        .bind(&update.phone_number)
        .bind(user_id)
        .execute(pool)
        .await?;

        let mut email_change = None;
        if let Some(new_email) = update.pending_email.as_deref().map(str::trim) {
            let user = Self::get(pool, user_id).await?;
            if !new_email.eq_ignore_ascii_case(&user.email) {
                Self::start_email_change(pool, redis, user_id, new_email).await?;
                email_change = Some(new_email.to_string());
            }
        }

        tracing::info!(user_id = %user_id, "Profile updated");
        Ok((Self::profile(pool, user_id).await?, email_change))
    }

    async fn start_email_change(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        user_id: Uuid,
        new_email: &str,
    ) -> Result<(), AppError> {
        validate_email(new_email)?;
        if Self::email_in_use(pool, new_email, Some(user_id)).await? {
            return Err(AppError::Validation("This email is already in use.".to_string()));
        }

        sqlx::query("UPDATE users SET pending_email = $1, email_verified = FALSE WHERE id = $2")
            .bind(new_email)
            .bind(user_id)
            .execute(pool)
            .await?;

        let code = OtpService::issue(pool, user_id, new_email, OtpPurpose::EmailChange).await?;
        Mailer::send_otp(redis, new_email, &code).await?;
        tracing::info!(user_id = %user_id, "Email change requested");
        Ok(())
    }

    pub async fn change_password(
        pool: &PgPool,
        user_id: Uuid,
        old_password: &str,
        new_password: &str,
        confirm_password: &str,
    ) -> Result<User, AppError> {
        let user = Self::get(pool, user_id).await?;
        if !password::verify(old_password, &user.password_hash) {
            return Err(AppError::Validation("Old password is incorrect.".to_string()));
        }
        if new_password != confirm_password {
            return Err(AppError::Validation(
                "New password and confirm password do not match.".to_string(),
            ));
        }
        Self::set_password(pool, &user, new_password).await
    }

    pub async fn set_password(pool: &PgPool, user: &User, new_password: &str) -> Result<User, AppError> {
        password::validate(new_password, &user.username)?;
        let hashed = password::hash(new_password)?;
        let user: User =
            sqlx::query_as("UPDATE users SET password_hash = $1 WHERE id = $2 RETURNING *")
                .bind(&hashed)
                .bind(user.id)
                .fetch_one(pool)
                .await?;
        tracing::info!(user_id = %user.id, "Password updated");
        Ok(user)
    }

    pub async fn request_password_reset(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        email: &str,
    ) -> Result<(), AppError> {
        let user = Self::find_by_email(pool, email.trim())
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
        let code = OtpService::issue(pool, user.id, &user.email, OtpPurpose::PasswordReset).await?;
        Mailer::send_otp(redis, &user.email, &code).await?;
        Ok(())
    }

    /// Issue and email a code for `purpose`. Returns the confirmation message.
    pub async fn send_otp(
        pool: &PgPool,
        redis: &mut ConnectionManager,
        email: &str,
        purpose: OtpPurpose,
        requester: Option<Uuid>,
    ) -> Result<String, AppError> {
        let email = email.trim();
        validate_email(email)?;

        let user_id = match purpose {
            OtpPurpose::Registration => {
                let user = Self::find_by_pending_email(pool, email).await?.ok_or_else(|| {
                    AppError::Validation("No pending registration found for this email.".to_string())
                })?;
                if user.is_active && user.email_verified {
                    return Err(AppError::Validation(
                        "This email is already verified.".to_string(),
                    ));
                }
                user.id
            }
            OtpPurpose::PasswordReset => {
                let user = Self::find_by_email(pool, email)
                    .await?
                    .filter(|u| u.is_active)
                    .ok_or_else(|| {
                        AppError::Validation("No active user found with this email.".to_string())
                    })?;
                user.id
            }
            OtpPurpose::EmailChange => {
                let user_id = requester.ok_or_else(|| {
                    AppError::Auth("Authentication is required to change your email.".to_string())
                })?;
                if Self::email_in_use(pool, email, Some(user_id)).await? {
                    return Err(AppError::Validation("This email is already in use.".to_string()));
                }
                sqlx::query("UPDATE users SET pending_email = $1 WHERE id = $2")
                    .bind(email)
                    .bind(user_id)
                    .execute(pool)
                    .await?;
                user_id
            }
        };

        let code = OtpService::issue(pool, user_id, email, purpose).await?;
        Mailer::send_otp(redis, email, &code).await?;
        Ok(format!("OTP sent to {} for {}.", email, purpose.describe()))
    }

    /// Check a code and apply what it confirms.
    pub async fn verify_otp(
        pool: &PgPool,
        email: &str,
        purpose: OtpPurpose,
        code: &str,
    ) -> Result<OtpOutcome, AppError> {
        let email = email.trim();
        let user = match purpose {
            OtpPurpose::Registration | OtpPurpose::EmailChange => {
                Self::find_by_pending_email(pool, email).await?.ok_or_else(|| {
                    AppError::Validation("No pending registration found for this email.".to_string())
                })?
            }
            OtpPurpose::PasswordReset => Self::find_by_email(pool, email)
                .await?
                .ok_or_else(|| AppError::Validation("No user found with this email.".to_string()))?,
        };

        OtpService::verify(pool, user.id, email, purpose, code).await?;

        match purpose {
            OtpPurpose::Registration | OtpPurpose::EmailChange => {
                let user: User = sqlx::query_as(
                    r#"
                    UPDATE users SET
                        email = $1, pending_email = NULL, email_verified = TRUE,
                        is_active = CASE WHEN $2 THEN TRUE ELSE is_active END
                    WHERE id = $3
                    RETURNING *
                    "#,
                )
                .bind(email)
                .bind(purpose == OtpPurpose::Registration)
                .bind(user.id)
                .fetch_one(pool)
                .await?;

                if purpose == OtpPurpose::Registration {
                    tracing::info!(user_id = %user.id, "Email verified, account activated");
                    Ok(OtpOutcome::Registered(user))
                } else {
                    tracing::info!(user_id = %user.id, "Email address changed");
                    Ok(OtpOutcome::EmailChanged(user))
                }
            }
            OtpPurpose::PasswordReset => Ok(OtpOutcome::ResetVerified(user)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_validation() {
        assert!(validate_email("ada@example.com").is_ok());
        assert!(validate_email("ada@localhost").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("ada example@x.com").is_err());
        assert!(validate_email("ada@.com").is_err());
    }

    #[test]
    fn test_username_validation() {
        assert!(validate_username("ada.lovelace+1").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("ada lovelace").is_err());
        assert!(validate_username(&"a".repeat(151)).is_err());
    }

    #[test]
    fn test_profile_update_accepts_nested_names() {
        let update: ProfileUpdate = serde_json::from_value(serde_json::json!({
            "user": {"first_name": "Ada"},
            "city": "London"
        }))
        .unwrap();
        assert_eq!(update.user.unwrap().first_name.as_deref(), Some("Ada"));
        assert_eq!(update.city.as_deref(), Some("London"));
        assert!(update.pending_email.is_none());
    }
}
