//! Payment pass-through endpoints
//!
//! Thin adapters between the portal frontend and the gateway: validate the
//! input, forward the call, echo the result. A successful verify also feeds
//! the reconciler, so a subscriber returning from checkout gets their access
//! activated even when the webhook is still in flight.

use axum::extract::{Path, State};
use axum::Json;
use netpass_billing::EmailAddress;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct InitializeRequest {
    pub email: String,
    pub amount: i64,
}

#[derive(Debug, Serialize)]
pub struct InitializeResponse {
    pub authorization_url: String,
    pub access_code: String,
    pub reference: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub reference: String,
    pub amount: i64,
    pub status: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
}

pub async fn initialize(
    State(state): State<AppState>,
    Json(request): Json<InitializeRequest>,
) -> ApiResult<Json<InitializeResponse>> {
    let email = EmailAddress::parse(&request.email)?;
    if request.amount <= 0 {
        return Err(ApiError::Validation(format!(
            "amount must be positive, got {}",
            request.amount
        )));
    }

    let session = state
        .billing
        .gateway
        .initialize(email.as_str(), request.amount)
        .await?;

    tracing::info!(
        email = %email,
        amount = request.amount,
        reference = %session.reference,
        "Checkout session created"
    );

    Ok(Json(InitializeResponse {
        authorization_url: session.authorization_url,
        access_code: session.access_code,
        reference: session.reference,
    }))
}

pub async fn verify(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> ApiResult<Json<VerifyResponse>> {
    if reference.trim().is_empty() {
        return Err(ApiError::Validation("reference must not be empty".to_string()));
    }

    let record = state.billing.gateway.verify(&reference).await?;

    if record.is_successful() {
        // Same reconciliation path (and dedup key space) as the webhook.
        let outcome = state.billing.webhooks.reconcile_verified(&record).await;
        tracing::debug!(reference = %reference, outcome = ?outcome, "Verified payment reconciled");
    }

    Ok(Json(VerifyResponse {
        reference: record.reference.clone(),
        amount: record.amount,
        status: record.status.clone(),
        paid_at: record.paid_at,
    }))
}
