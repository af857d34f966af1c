//! Minimal Stripe client: Checkout sessions, subscription cancellation and
//! webhook signature verification.

use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use planner_common::config::AppConfig;
use planner_common::error::AppError;

/// Webhooks older than this are rejected as replays.
pub const SIGNATURE_TOLERANCE_SECONDS: i64 = 300;

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

/// Parameters for a subscription-mode Checkout session.
#[derive(Debug, Clone)]
pub struct CheckoutRequest<'a> {
    pub customer_email: &'a str,
    pub price_id: &'a str,
    pub success_url: &'a str,
    pub cancel_url: &'a str,
    pub user_id: String,
    pub plan_id: String,
}

/// A webhook event envelope. Only the fields the handlers read are typed.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookData {
    pub object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
}

#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    secret_key: Option<String>,
    api_base: String,
}

impl StripeClient {
    pub fn new(secret_key: Option<String>, api_base: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            http,
            secret_key,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.stripe_secret_key.clone(), config.stripe_api_base.clone())
    }

    fn key(&self) -> Result<&str, AppError> {
        self.secret_key
            .as_deref()
            .ok_or_else(|| AppError::Config("Stripe is not configured".to_string()))
    }

    pub async fn create_checkout_session(
        &self,
        request: &CheckoutRequest<'_>,
    ) -> Result<CheckoutSession, AppError> {
        let form = [
            ("customer_email", request.customer_email),
            ("payment_method_types[0]", "card"),
            ("line_items[0][price]", request.price_id),
            ("line_items[0][quantity]", "1"),
            ("mode", "subscription"),
            ("success_url", request.success_url),
            ("cancel_url", request.cancel_url),
            ("metadata[user_id]", request.user_id.as_str()),
            ("metadata[plan_id]", request.plan_id.as_str()),
        ];

        let response = self
            .http
            .post(format!("{}/v1/checkout/sessions", self.api_base))
            .bearer_auth(self.key()?)
            .form(&form)
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("Stripe request failed: {}", e)))?;

        let session: CheckoutSession = parse_response(response).await?;
        tracing::info!(session_id = %session.id, plan_id = %request.plan_id, "Stripe checkout session created");
        Ok(session)
    }

    pub async fn cancel_subscription(&self, stripe_subscription_id: &str) -> Result<(), AppError> {
        let response = self
            .http
            .delete(format!(
                "{}/v1/subscriptions/{}",
                self.api_base, stripe_subscription_id
            ))
            .bearer_auth(self.key()?)
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("Stripe request failed: {}", e)))?;

        let _: serde_json::Value = parse_response(response).await?;
        tracing::info!(stripe_subscription_id, "Stripe subscription cancelled");
        Ok(())
    }
}

async fn parse_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, AppError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| AppError::Upstream(format!("Stripe response unreadable: {}", e)))?;

    if status.is_success() {
        return serde_json::from_str(&body)
            .map_err(|e| AppError::Upstream(format!("Unexpected Stripe response: {}", e)));
    }

    let message = serde_json::from_str::<StripeErrorBody>(&body)
        .ok()
        .and_then(|b| b.error.message)
        .unwrap_or_else(|| format!("Stripe returned {}", status));

    if status.is_client_error() {
        Err(AppError::Validation(message))
    } else {
        Err(AppError::Upstream(message))
    }
}

/// Verify a `Stripe-Signature` header (`t=<ts>,v1=<hex>[,v1=<hex>...]`) against
/// the raw request body.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: i64,
) -> Result<(), AppError> {
    let invalid = || AppError::Validation("Invalid webhook signature".to_string());

    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(invalid)?;
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECONDS {
        return Err(AppError::Validation(
            "Webhook timestamp outside tolerance".to_string(),
        ));
    }

    let verified = signatures.iter().any(|sig| {
        let Ok(expected) = hex::decode(sig) else {
            return false;
        };
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    });

    if verified { Ok(()) } else { Err(invalid()) }
}

/// Produce a `Stripe-Signature` header for a payload.
pub fn sign(payload: &[u8], secret: &str, timestamp: i64) -> Result<String, AppError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Internal(format!("Invalid webhook secret: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const BODY: &[u8] = br#"{"id":"evt_1","type":"checkout.session.completed"}"#;

    #[test]
    fn test_valid_signature_accepted() {
        let header = sign(BODY, SECRET, 1_700_000_000).unwrap();
        assert!(verify_signature(BODY, &header, SECRET, 1_700_000_010).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let header = sign(BODY, SECRET, 1_700_000_000).unwrap();
        let result = verify_signature(b"{}", &header, SECRET, 1_700_000_000);
        assert!(result.is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let header = sign(BODY, "whsec_other", 1_700_000_000).unwrap();
        assert!(verify_signature(BODY, &header, SECRET, 1_700_000_000).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let header = sign(BODY, SECRET, 1_700_000_000).unwrap();
        assert!(verify_signature(BODY, &header, SECRET, 1_700_000_000 + 301).is_err());
    }

    #[test]
    fn test_any_matching_v1_is_enough() {
        let header = sign(BODY, SECRET, 1_700_000_000).unwrap();
        let rotated = format!("{},v1=deadbeef", header.replacen("v1=", "v1=00,v1=", 1));
        assert!(verify_signature(BODY, &rotated, SECRET, 1_700_000_000).is_ok());
    }

    #[test]
    fn test_malformed_header_rejected() {
        assert!(verify_signature(BODY, "garbage", SECRET, 0).is_err());
    }

    #[test]
    fn test_event_envelope_parses() {
        let event: WebhookEvent = serde_json::from_str(
            r#"{"id":"evt_1","type":"checkout.session.completed","data":{"object":{"subscription":"sub_1"}}}"#,
        )
        .unwrap();
        assert_eq!(event.event_type, "checkout.session.completed");
        assert_eq!(event.data.object["subscription"], "sub_1");
    }
}
