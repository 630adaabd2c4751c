//! Subscription status and history endpoints
//!
//! Expiry is lazy: there is no reaper flipping rows to expired, the status
//! check just compares the stored window against now.

use axum::extract::{Path, State};
use axum::Json;
use netpass_billing::EmailAddress;
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub email: String,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_on: Option<OffsetDateTime>,
}

#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    pub reference: String,
    pub amount: i64,
    pub service: String,
    #[serde(with = "time::serde::rfc3339")]
    pub paid_on: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_on: OffsetDateTime,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub email: String,
    pub payments: Vec<HistoryEntry>,
}

pub async fn status(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let email = EmailAddress::parse(&email)?;
    let now = OffsetDateTime::now_utc();

    let subscription = state.billing.store.get_active_subscription(&email).await?;

    let response = match subscription {
        Some(sub) if sub.is_active_at(now) => StatusResponse {
            email: email.as_str().to_string(),
            active: true,
            service: Some(sub.service),
            expires_on: Some(sub.expires_on),
        },
        // Expired or never subscribed both read as "no active
        // subscription"; the portal offers the plan picker either way.
        _ => StatusResponse {
            email: email.as_str().to_string(),
            active: false,
            service: None,
            expires_on: None,
        },
    };

    Ok(Json(response))
}

pub async fn history(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> ApiResult<Json<HistoryResponse>> {
    let email = EmailAddress::parse(&email)?;

    let payments = state
        .billing
        .store
        .list_transactions(&email)
        .await?
        .into_iter()
        .map(|tx| HistoryEntry {
            reference: tx.gateway_reference,
            amount: tx.amount,
            service: tx.service,
            paid_on: tx.paid_on,
            expires_on: tx.expires_on,
        })
        .collect();

    Ok(Json(HistoryResponse {
        email: email.as_str().to_string(),
        payments,
    }))
}
