use crate::error::SettlementError;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-mishwar-signature";

const MAX_RETRIES: u32 = 3;
const BASE_DELAY_MS: u64 = 100;
const MAX_DELAY_MS: u64 = 2_000;

/// Closed set of terminal outcomes an external event can carry. Raw payloads
/// never cross this boundary; the settlement layer only sees these variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Succeeded,
    Failed,
    Canceled,
    Unknown,
}

impl EventOutcome {
    pub fn from_event(event_type: &str, outcome: Option<&str>) -> Self {
        if let Some(parsed) = outcome.map(str::trim).filter(|s| !s.is_empty()).map(Self::parse) {
            if parsed != EventOutcome::Unknown {
                return parsed;
            }
        }
        // Fall back to the event-type suffix ("payment_intent.succeeded").
        let suffix = event_type.rsplit('.').next().unwrap_or("");
        Self::parse(suffix)
    }

    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "succeeded" | "paid" => EventOutcome::Succeeded,
            "failed" => EventOutcome::Failed,
            "canceled" | "cancelled" => EventOutcome::Canceled,
            _ => EventOutcome::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Succeeded => "succeeded",
            EventOutcome::Failed => "failed",
            EventOutcome::Canceled => "canceled",
            EventOutcome::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CardEvent {
    pub event_id: String,
    pub event_type: String,
    pub intent_id: String,
    #[serde(default)]
    pub outcome: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PayoutEvent {
    pub event_id: String,
    pub event_type: String,
    pub payout_id: String,
    #[serde(default)]
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentOut {
    pub intent_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayoutOut {
    pub payout_id: String,
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("malformed signature header")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("signature mismatch")]
    Mismatch,
}

/// Verify an HMAC-SHA256 webhook signature of the form
/// `t=<unix>,v1=<hex>` computed over `"{t}.{payload}"`.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now_unix: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        let Some((k, v)) = part.trim().split_once('=') else {
            continue;
        };
        match k {
            "t" => timestamp = v.parse().ok(),
            "v1" => signatures.push(v),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if (now_unix - timestamp).abs() > tolerance_secs {
        return Err(SignatureError::Expired);
    }

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Malformed)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());

    let valid = signatures
        .iter()
        .any(|sig| expected.as_bytes().ct_eq(sig.as_bytes()).unwrap_u8() == 1);
    if !valid {
        return Err(SignatureError::Mismatch);
    }
    Ok(())
}

async fn post_json_with_retries<T, F>(desc: &'static str, build: F) -> Result<T, SettlementError>
where
    T: DeserializeOwned,
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut attempt: u32 = 0;
    loop {
        match build().send().await {
            Ok(resp) if resp.status().is_success() => {
                return resp.json::<T>().await.map_err(|e| {
                    tracing::error!(error = %e, desc, "gateway response decode failed");
                    SettlementError::GatewayUnavailable
                });
            }
            Ok(resp) => {
                let status = resp.status();
                let retryable = status.is_server_error() || status.as_u16() == 429;
                let body = resp.text().await.unwrap_or_default();
                tracing::warn!(%status, body = %body, desc, "gateway request rejected");
                if !retryable || attempt >= MAX_RETRIES {
                    return Err(SettlementError::GatewayUnavailable);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, desc, "gateway request error");
                if attempt >= MAX_RETRIES {
                    return Err(SettlementError::GatewayUnavailable);
                }
            }
        }

        let delay = BASE_DELAY_MS.saturating_mul(1u64 << attempt).min(MAX_DELAY_MS);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        attempt += 1;
    }
}

/// Client for the external card-payment gateway. Only the intent-creation
/// call is needed here; confirmation arrives through webhooks.
#[derive(Clone)]
pub struct CardGatewayClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl CardGatewayClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// The idempotency key makes a client retry of the same booking reuse
    /// the gateway-side intent instead of charging twice.
    pub async fn create_payment_intent(
        &self,
        amount_cents: i64,
        currency: &str,
        booking_id: &str,
        idempotency_key: &str,
    ) -> Result<PaymentIntentOut, SettlementError> {
        let url = format!("{}/v1/payment_intents", self.base_url);
        post_json_with_retries("create payment intent", || {
            self.http
                .post(&url)
                .bearer_auth(&self.api_key)
                .header("Idempotency-Key", idempotency_key)
                .json(&serde_json::json!({
                    "amount_cents": amount_cents,
                    "currency": currency,
                    "metadata": { "booking_id": booking_id },
                }))
        })
        .await
    }
}

/// Client for the external bank-payout processor.
#[derive(Clone)]
pub struct PayoutClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl PayoutClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub async fn create_payout(
        &self,
        amount_cents: i64,
        destination: &str,
        idempotency_key: &str,
    ) -> Result<PayoutOut, SettlementError> {
        let url = format!("{}/v1/payouts", self.base_url);
        post_json_with_retries("create payout", || {
            self.http
                .post(&url)
                .bearer_auth(&self.api_key)
                .header("Idempotency-Key", idempotency_key)
                .json(&serde_json::json!({
                    "amount_cents": amount_cents,
                    "destination": destination,
                }))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &[u8], secret: &str, ts: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(ts.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        format!("t={ts},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_is_accepted() {
        let payload = br#"{"event_id":"evt_1"}"#;
        let header = sign(payload, "whsec_test", 1_700_000_000);
        assert!(verify_signature(payload, &header, "whsec_test", 300, 1_700_000_100).is_ok());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let payload = b"payload";
        let header = sign(payload, "whsec_a", 1_700_000_000);
        assert!(matches!(
            verify_signature(payload, &header, "whsec_b", 300, 1_700_000_000),
            Err(SignatureError::Mismatch)
        ));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let payload = b"payload";
        let header = sign(payload, "whsec_test", 1_000);
        assert!(matches!(
            verify_signature(payload, &header, "whsec_test", 300, 1_700_000_000),
            Err(SignatureError::Expired)
        ));
    }

    #[test]
    fn malformed_header_is_rejected() {
        assert!(matches!(
            verify_signature(b"x", "nonsense", "whsec_test", 300, 0),
            Err(SignatureError::Malformed)
        ));
        assert!(matches!(
            verify_signature(b"x", "t=123", "whsec_test", 300, 123),
            Err(SignatureError::Malformed)
        ));
    }

    #[test]
    fn second_v1_candidate_is_tried() {
        let payload = b"payload";
        let good = sign(payload, "whsec_test", 42);
        let sig = good.split_once("v1=").unwrap().1.to_string();
        let header = format!("t=42,v1=deadbeef,v1={sig}");
        assert!(verify_signature(payload, &header, "whsec_test", 300, 42).is_ok());
    }

    #[test]
    fn outcome_parsing_prefers_explicit_field() {
        assert_eq!(
            EventOutcome::from_event("payment_intent.succeeded", None),
            EventOutcome::Succeeded
        );
        assert_eq!(
            EventOutcome::from_event("payment_intent.updated", Some("failed")),
            EventOutcome::Failed
        );
        assert_eq!(
            EventOutcome::from_event("payout.paid", None),
            EventOutcome::Succeeded
        );
        assert_eq!(
            EventOutcome::from_event("payment_intent.canceled", Some("")),
            EventOutcome::Canceled
        );
        assert_eq!(
            EventOutcome::from_event("something.else", Some("weird")),
            EventOutcome::Unknown
        );
    }
}
