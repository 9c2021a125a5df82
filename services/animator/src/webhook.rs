//! Signed webhook verification and event parsing.
//!
//! Signature header format: `t=<unix seconds>,v1=<hex hmac>[,v1=...]` where the
//! HMAC-SHA256 is computed over `"{t}.{raw body}"` with the endpoint secret.

use crate::payments::JOB_ID_METADATA_KEY;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature
pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Missing signature header")]
    MissingSignature,

    #[error("Malformed signature header")]
    MalformedHeader,

    #[error("Timestamp outside the {0:?} tolerance")]
    StaleTimestamp(Duration),

    #[error("No signature matches the payload")]
    SignatureMismatch,

    #[error("Webhook secret is not configured")]
    NotConfigured,

    #[error("Invalid event payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Verifies webhook signatures with a shared secret
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance: Duration,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    fn mac(&self, timestamp: &str, payload: &[u8]) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac
    }

    /// Hex signature for `payload` at `timestamp`
    pub fn sign(&self, timestamp: i64, payload: &[u8]) -> String {
        hex::encode(self.mac(&timestamp.to_string(), payload).finalize().into_bytes())
    }

    /// Check `header` against `payload`; `now` is unix seconds
    pub fn verify(&self, payload: &[u8], header: &str, now: i64) -> Result<(), WebhookError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for item in header.split(',') {
            match item.trim().split_once('=') {
                Some(("t", value)) => timestamp = Some(value),
                Some(("v1", value)) => signatures.push(value),
                Some(_) => {}
                None => return Err(WebhookError::MalformedHeader),
            }
        }

        let timestamp = timestamp.ok_or(WebhookError::MalformedHeader)?;
        let issued: i64 = timestamp
            .parse()
            .map_err(|_| WebhookError::MalformedHeader)?;
        if signatures.is_empty() {
            return Err(WebhookError::MissingSignature);
        }

        if (now - issued).unsigned_abs() > self.tolerance.as_secs() {
            return Err(WebhookError::StaleTimestamp(self.tolerance));
        }

        let mac = self.mac(timestamp, payload);
        let matched = signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
                .unwrap_or(false)
        });

        if matched {
            Ok(())
        } else {
            Err(WebhookError::SignatureMismatch)
        }
    }
}

/// Intent named by a payment event. Status and amount are re-fetched from
/// the processor before anything is unlocked.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventIntent {
    pub id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl EventIntent {
    pub fn job_id(&self) -> Option<&str> {
        self.metadata.get(JOB_ID_METADATA_KEY).map(String::as_str)
    }
}

/// Events the service acts on
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    PaymentSucceeded(EventIntent),
    PaymentFailed(EventIntent),
    Ignored { event_type: String },
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

/// Parse a verified payload
pub fn parse_event(payload: &[u8]) -> Result<WebhookEvent, WebhookError> {
    let raw: RawEvent = serde_json::from_slice(payload)?;

    let event = match raw.event_type.as_str() {
        "payment_intent.succeeded" => {
            WebhookEvent::PaymentSucceeded(serde_json::from_value(raw.data.object)?)
        }
        "payment_intent.payment_failed" => {
            WebhookEvent::PaymentFailed(serde_json::from_value(raw.data.object)?)
        }
        _ => WebhookEvent::Ignored {
            event_type: raw.event_type,
        },
    };
    Ok(event)
}
