//! Gateway webhook endpoint
//!
//! The contract with the gateway: once a delivery is authentic and
//! syntactically valid it gets a 200, whatever happens inside
//! reconciliation; a non-2xx here would trigger redelivery storms for
//! failures that redelivery cannot fix. Only a bad signature (401) or an
//! unparseable body (400) is rejected.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use netpass_billing::{ReconcileOutcome, SIGNATURE_HEADER};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let handler = &state.billing.webhooks;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    handler.verify_signature(&body, signature)?;

    let payload = std::str::from_utf8(&body)
        .map_err(|_| ApiError::Validation("webhook body is not valid UTF-8".to_string()))?;
    let event = handler.parse_event(payload)?;

    let event_type = event.event.clone();
    match handler.process_event(event).await {
        ReconcileOutcome::StepsFailed { failed_steps } => {
            // Acknowledged anyway; the audit row and the worker's replay own
            // this failure now.
            tracing::warn!(
                event_type = %event_type,
                failed_steps = ?failed_steps,
                "Webhook acknowledged with failed reconciliation steps"
            );
        }
        outcome => {
            tracing::debug!(event_type = %event_type, outcome = ?outcome, "Webhook processed");
        }
    }

    Ok(Json(serde_json::json!({ "status": true })))
}
