//! Payment processor adapter (Stripe-compatible REST API).

use crate::config::PaymentsConfig;
use crate::job::JobId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Product type recorded on every charge
pub const PRODUCT_TYPE: &str = "animation_unlock";

/// Metadata key holding the job being paid for
pub const JOB_ID_METADATA_KEY: &str = "job_id";

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("Payment processor request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Payment processor returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Price {0} has no fixed unit amount")]
    MissingAmount(String),
}

/// Current price of one unlock
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Price {
    pub id: String,
    /// Minor currency units
    pub unit_amount: Option<i64>,
    pub currency: String,
    #[serde(default)]
    pub product: Option<String>,
}

impl Price {
    pub fn amount(&self) -> Result<i64, PaymentError> {
        self.unit_amount
            .ok_or_else(|| PaymentError::MissingAmount(self.id.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Succeeded,
    Canceled,
    #[serde(other)]
    Unknown,
}

impl IntentStatus {
    /// The intent can still be confirmed by the payment UI as-is
    pub fn is_awaitable(&self) -> bool {
        matches!(self, IntentStatus::RequiresPaymentMethod)
    }
}

/// Processor-side charge intent
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChargeIntent {
    pub id: String,
    pub status: IntentStatus,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ChargeIntent {
    /// Job id attached at creation time
    pub fn job_id(&self) -> Option<&str> {
        self.metadata.get(JOB_ID_METADATA_KEY).map(String::as_str)
    }
}

/// Parameters for a new charge intent
#[derive(Debug, Clone, PartialEq)]
pub struct NewChargeIntent {
    pub job_id: JobId,
    pub owner_id: Option<String>,
    pub price: Price,
}

impl NewChargeIntent {
    fn form(&self) -> Result<Vec<(String, String)>, PaymentError> {
        let mut form = vec![
            ("amount".to_string(), self.price.amount()?.to_string()),
            ("currency".to_string(), self.price.currency.clone()),
            (
                "automatic_payment_methods[enabled]".to_string(),
                "true".to_string(),
            ),
            (
                format!("metadata[{}]", JOB_ID_METADATA_KEY),
                self.job_id.to_string(),
            ),
            (
                "metadata[owner_id]".to_string(),
                self.owner_id.clone().unwrap_or_else(|| "anonymous".to_string()),
            ),
            ("metadata[product_type]".to_string(), PRODUCT_TYPE.to_string()),
            ("metadata[price_id]".to_string(), self.price.id.clone()),
        ];
        if let Some(ref product) = self.price.product {
            form.push(("metadata[product_id]".to_string(), product.clone()));
        }
        Ok(form)
    }
}

/// Payment processor seam
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Fetch the configured price; never cached
    async fn fetch_price(&self) -> Result<Price, PaymentError>;

    async fn create_intent(&self, request: &NewChargeIntent) -> Result<ChargeIntent, PaymentError>;

    async fn retrieve_intent(&self, intent_id: &str) -> Result<ChargeIntent, PaymentError>;
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// REST client for a Stripe-compatible processor
pub struct StripeClient {
    http: reqwest::Client,
    config: PaymentsConfig,
}

impl StripeClient {
    pub fn new(config: &PaymentsConfig) -> Result<Self, PaymentError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        info!(api_base = %config.api_base, price_id = %config.price_id, "Payment client initialized");

        Ok(Self {
            http,
            config: config.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, PaymentError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|b| b.error.message)
            .unwrap_or(body);
        Err(PaymentError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    #[instrument(skip(self))]
    async fn fetch_price(&self) -> Result<Price, PaymentError> {
        let response = self
            .http
            .get(self.url(&format!("prices/{}", self.config.price_id)))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await?;

        let price: Price = Self::parse(response).await?;
        debug!(price_id = %price.id, unit_amount = ?price.unit_amount, "Fetched price");
        Ok(price)
    }

    #[instrument(skip(self, request), fields(job_id = %request.job_id))]
    async fn create_intent(&self, request: &NewChargeIntent) -> Result<ChargeIntent, PaymentError> {
        let idempotency_key = format!("{}:{}", request.job_id, Uuid::new_v4());

        let response = self
            .http
            .post(self.url("payment_intents"))
            .bearer_auth(&self.config.secret_key)
            .header("Idempotency-Key", idempotency_key)
            .form(&request.form()?)
            .send()
            .await?;

        let intent: ChargeIntent = Self::parse(response).await?;
        info!(intent_id = %intent.id, amount = intent.amount, "Charge intent created");
        Ok(intent)
    }

    #[instrument(skip(self))]
    async fn retrieve_intent(&self, intent_id: &str) -> Result<ChargeIntent, PaymentError> {
        let response = self
            .http
            .get(self.url(&format!("payment_intents/{}", intent_id)))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await?;

        Self::parse(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price() -> Price {
        Price {
            id: "price_123".to_string(),
            unit_amount: Some(299),
            currency: "usd".to_string(),
            product: Some("prod_9".to_string()),
        }
    }

    #[test]
    fn test_intent_deserializes_with_unknown_status() {
        let raw = serde_json::json!({
            "id": "pi_1",
            "object": "payment_intent",
            "status": "some_future_status",
            "amount": 299,
            "currency": "usd",
            "client_secret": "pi_1_secret",
            "metadata": { "job_id": "abc" }
        });

        let intent: ChargeIntent = serde_json::from_value(raw).unwrap();
        assert_eq!(intent.status, IntentStatus::Unknown);
        assert_eq!(intent.job_id(), Some("abc"));
        assert!(!intent.status.is_awaitable());
    }

    #[test]
    fn test_intent_form_carries_metadata() {
        let request = NewChargeIntent {
            job_id: JobId::parse("abc").unwrap(),
            owner_id: None,
            price: price(),
        };
        let form: HashMap<String, String> = request.form().unwrap().into_iter().collect();

        assert_eq!(form["amount"], "299");
        assert_eq!(form["metadata[job_id]"], "abc");
        assert_eq!(form["metadata[owner_id]"], "anonymous");
        assert_eq!(form["metadata[product_type]"], PRODUCT_TYPE);
        assert_eq!(form["metadata[price_id]"], "price_123");
        assert_eq!(form["metadata[product_id]"], "prod_9");
    }

    #[test]
    fn test_price_without_amount_is_rejected() {
        let mut metered = price();
        metered.unit_amount = None;
        assert!(matches!(metered.amount(), Err(PaymentError::MissingAmount(_))));
    }
}
