//! Emailed one-time passwords.
//!
//! A code is six random digits. Only its SHA-256 digest is persisted, keyed by
//! `(user, email, purpose)`, so issuing a new code replaces the previous one
//! and resets its attempt counter.

use chrono::{Duration, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use planner_common::error::AppError;
use planner_common::types::{OtpPurpose, OtpVerification};

/// Codes are valid for five minutes after issue.
pub const OTP_EXPIRY_MINUTES: i64 = 5;

/// Wrong guesses allowed before a new code must be requested.
pub const MAX_OTP_ATTEMPTS: i32 = 5;

/// Records older than this are purged by the scheduler.
pub const OTP_RETENTION_HOURS: i64 = 2;

pub fn generate_code() -> String {
    let code: u32 = rand::rng().random_range(0..1_000_000);
    format!("{:06}", code)
}

pub fn hash_code(code: &str) -> String {
    hex::encode(Sha256::digest(code.trim().as_bytes()))
}

pub struct OtpService;

impl OtpService {
    /// Issue a fresh code and return it in plain text for emailing.
    pub async fn issue(
        pool: &PgPool,
        user_id: Uuid,
        email: &str,
        purpose: OtpPurpose,
    ) -> Result<String, AppError> {
        let code = generate_code();

        sqlx::query(
            r#"
            INSERT INTO otp_verifications (id, user_id, email, code_hash, purpose, attempt_count, created_at)
            VALUES ($1, $2, $3, $4, $5, 0, now())
            ON CONFLICT (user_id, email, purpose)
            DO UPDATE SET code_hash = EXCLUDED.code_hash, attempt_count = 0, created_at = now()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(email)
        .bind(hash_code(&code))
        .bind(purpose)
        .execute(pool)
        .await?;

        tracing::info!(user_id = %user_id, purpose = %purpose, "OTP issued");
        Ok(code)
    }

    /// Check a submitted code. The record is consumed on success.
    pub async fn verify(
        pool: &PgPool,
        user_id: Uuid,
        email: &str,
        purpose: OtpPurpose,
        code: &str,
    ) -> Result<(), AppError> {
        let record: OtpVerification = sqlx::query_as(
            "SELECT * FROM otp_verifications WHERE user_id = $1 AND email = $2 AND purpose = $3",
        )
        .bind(user_id)
        .bind(email)
        .bind(purpose)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::Validation("No pending verification found.".to_string()))?;

        if record.created_at < Utc::now() - Duration::minutes(OTP_EXPIRY_MINUTES) {
            return Err(AppError::Validation("OTP has expired.".to_string()));
        }

        if record.attempt_count >= MAX_OTP_ATTEMPTS {
            return Err(AppError::Validation(
                "Maximum OTP attempts reached. Please request a new OTP.".to_string(),
            ));
        }

        if record.code_hash != hash_code(code) {
            sqlx::query(
                "UPDATE otp_verifications SET attempt_count = attempt_count + 1 WHERE id = $1",
            )
            .bind(record.id)
            .execute(pool)
            .await?;
            tracing::debug!(user_id = %user_id, attempts = record.attempt_count + 1, "OTP mismatch");
            return Err(AppError::Validation("Invalid OTP.".to_string()));
        }

        sqlx::query("DELETE FROM otp_verifications WHERE id = $1")
            .bind(record.id)
            .execute(pool)
            .await?;

        tracing::info!(user_id = %user_id, purpose = %purpose, "OTP verified");
        Ok(())
    }

    /// Delete records past the retention window. Returns the number removed.
    pub async fn purge_expired(pool: &PgPool) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM otp_verifications WHERE created_at < $1")
            .bind(Utc::now() - Duration::hours(OTP_RETENTION_HOURS))
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_is_six_digits() {
        for _ in 0..50 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_hash_ignores_surrounding_whitespace() {
        assert_eq!(hash_code("042917"), hash_code(" 042917\n"));
        assert_ne!(hash_code("042917"), hash_code("042918"));
        assert_eq!(hash_code("000000").len(), 64);
    }
}
