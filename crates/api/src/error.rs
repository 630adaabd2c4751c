//! API error type and HTTP status mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use netpass_billing::BillingError;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    /// Upstream gateway failure; surfaced as 502 with the gateway's message.
    #[error("{0}")]
    Gateway(String),

    /// Anything internal. The detail is logged, never sent to the client.
    #[error("internal error")]
    Internal(String),
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::Validation(message) => ApiError::Validation(message),
            BillingError::MalformedEvent(message) => ApiError::Validation(message),
            BillingError::NotFound => ApiError::NotFound,
            BillingError::WebhookSignatureInvalid => ApiError::Unauthorized,
            BillingError::Gateway { message } => ApiError::Gateway(message),
            BillingError::Database(message) | BillingError::Config(message) => {
                ApiError::Internal(message)
            }
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Gateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let message = match &self {
            ApiError::Internal(detail) => {
                tracing::error!(detail = %detail, "Internal error");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_errors_map_to_expected_statuses() {
        let cases: Vec<(BillingError, StatusCode)> = vec![
            (
                BillingError::Validation("bad email".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (
                BillingError::MalformedEvent("missing event".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (BillingError::NotFound, StatusCode::NOT_FOUND),
            (
                BillingError::WebhookSignatureInvalid,
                StatusCode::UNAUTHORIZED,
            ),
            (
                BillingError::Gateway {
                    message: "declined".to_string(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                BillingError::Database("connection refused".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (billing_error, expected) in cases {
            let api_error: ApiError = billing_error.into();
            assert_eq!(api_error.status(), expected);
        }
    }

    #[test]
    fn internal_detail_is_not_leaked() {
        let error = ApiError::Internal("password=hunter2".to_string());
        assert_eq!(error.to_string(), "internal error");
    }
}
