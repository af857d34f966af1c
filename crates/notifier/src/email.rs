//! Transactional email delivery over the Resend HTTP API.

use std::time::Duration;

use serde::Serialize;

use planner_common::config::AppConfig;
use planner_common::error::AppError;

#[derive(Debug, Serialize)]
struct OutgoingEmail<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

/// Sends rendered emails. Without an API key every message is logged instead
/// of sent, which keeps local development free of mail credentials.
#[derive(Clone)]
pub struct EmailClient {
    http: reqwest::Client,
    api_key: Option<String>,
    api_url: String,
    from: String,
}

impl EmailClient {
    pub fn new(api_key: Option<String>, api_url: impl Into<String>, from: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            http,
            api_key,
            api_url: api_url.into(),
            from: from.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.resend_api_key.clone(),
            config.email_api_url.clone(),
            config.email_from.clone(),
        )
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    pub async fn send(&self, recipient: &str, subject: &str, html: &str) -> Result<(), AppError> {
        let Some(key) = self.api_key.as_deref() else {
            tracing::info!(recipient, subject, "Email delivery disabled, logging instead");
            return Ok(());
        };

        let body = OutgoingEmail {
            from: &self.from,
            to: [recipient],
            subject,
            html,
        };
        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("Mail API request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "Mail API returned {}: {}",
                status, detail
            )));
        }

        tracing::info!(recipient, subject, "Email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_email_shape() {
        let email = OutgoingEmail {
            from: "noreply@example.com",
            to: ["ada@example.com"],
            subject: "Your OTP Code",
            html: "<p>123456</p>",
        };
        assert_eq!(
            serde_json::to_value(&email).unwrap(),
            serde_json::json!({
                "from": "noreply@example.com",
                "to": ["ada@example.com"],
                "subject": "Your OTP Code",
                "html": "<p>123456</p>",
            })
        );
    }

    #[tokio::test]
    async fn test_unconfigured_client_logs_instead_of_sending() {
        let client = EmailClient::new(None, "http://127.0.0.1:9/unreachable", "noreply@example.com");
        assert!(!client.is_configured());
        client.send("ada@example.com", "Hello", "<p>hi</p>").await.unwrap();
    }
}
