//! Payment gateway client
//!
//! Thin typed wrapper over the gateway's REST API (Paystack-shaped:
//! bearer-authenticated JSON with a `{status, message, data}` envelope).
//! Calls are not retried here; the gateway is treated as a possibly-slow,
//! possibly-failing collaborator and failures surface as
//! [`BillingError::Gateway`] for the caller to handle.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

const DEFAULT_BASE_URL: &str = "https://api.paystack.co";

/// Gateway connection settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Secret API key; also the HMAC key for webhook signatures.
    pub secret_key: String,
    pub base_url: String,
}

impl GatewayConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("GATEWAY_SECRET_KEY")
            .map_err(|_| BillingError::Config("GATEWAY_SECRET_KEY not set".to_string()))?;
        let base_url =
            std::env::var("GATEWAY_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        Ok(Self {
            secret_key,
            base_url,
        })
    }
}

/// Response envelope the gateway wraps every payload in.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    message: Option<String>,
    data: Option<T>,
}

/// Hosted checkout session returned by `initialize`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckoutSession {
    pub authorization_url: String,
    pub access_code: String,
    pub reference: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayCustomer {
    pub email: String,
}

/// A transaction record as the gateway reports it from `verify`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayTransaction {
    pub reference: String,
    pub amount: i64,
    /// Gateway-side status string ("success", "failed", "abandoned", ..).
    pub status: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    pub customer: GatewayCustomer,
}

impl GatewayTransaction {
    pub fn is_successful(&self) -> bool {
        self.status == "success"
    }
}

/// Outbound payout request (`transfer`).
#[derive(Debug, Clone, Serialize)]
pub struct TransferRequest {
    pub source: String,
    pub amount: i64,
    pub recipient: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransferRecord {
    pub transfer_code: String,
    pub amount: i64,
    pub status: String,
}

/// Outbound interface to the payment gateway.
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(GatewayConfig::from_env()?))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Start a hosted checkout for an email/amount pair.
    pub async fn initialize(&self, email: &str, amount: i64) -> BillingResult<CheckoutSession> {
        let url = format!("{}/transaction/initialize", self.config.base_url);
        let body = serde_json::json!({ "email": email, "amount": amount });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.secret_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        unwrap_envelope(response).await
    }

    /// Fetch the gateway's record for a transaction reference.
    pub async fn verify(&self, reference: &str) -> BillingResult<GatewayTransaction> {
        let url = format!("{}/transaction/verify/{reference}", self.config.base_url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.secret_key)
            .send()
            .await
            .map_err(transport_error)?;

        unwrap_envelope(response).await
    }

    /// Initiate an outbound payout.
    pub async fn transfer(&self, request: &TransferRequest) -> BillingResult<TransferRecord> {
        let url = format!("{}/transfer", self.config.base_url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.secret_key)
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        unwrap_envelope(response).await
    }
}

fn transport_error(e: reqwest::Error) -> BillingError {
    BillingError::Gateway {
        message: format!("gateway request failed: {e}"),
    }
}

/// Map a gateway response to its data payload, surfacing the gateway's own
/// message on failure when one is available.
async fn unwrap_envelope<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> BillingResult<T> {
    let http_status = response.status();
    let body = response.text().await.map_err(transport_error)?;

    if !http_status.is_success() {
        let message = serde_json::from_str::<Envelope<serde_json::Value>>(&body)
            .ok()
            .and_then(|envelope| envelope.message)
            .unwrap_or_else(|| format!("gateway returned {http_status}"));
        return Err(BillingError::Gateway { message });
    }

    let envelope: Envelope<T> = serde_json::from_str(&body).map_err(|e| BillingError::Gateway {
        message: format!("unparseable gateway response: {e}"),
    })?;

    if !envelope.status {
        return Err(BillingError::Gateway {
            message: envelope
                .message
                .unwrap_or_else(|| "gateway reported failure".to_string()),
        });
    }

    envelope.data.ok_or_else(|| BillingError::Gateway {
        message: envelope
            .message
            .unwrap_or_else(|| "gateway returned no data".to_string()),
    })
}
