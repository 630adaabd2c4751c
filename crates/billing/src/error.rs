//! Billing error taxonomy

use thiserror::Error;

/// Result alias used throughout the billing crate
pub type BillingResult<T> = Result<T, BillingError>;

/// Errors produced by the billing crate.
///
/// Duplicate-key conflicts are deliberately absent: every write that can
/// collide uses an atomic `ON CONFLICT` upsert, so "already exists" is a
/// normal branch of the operation, never an error the caller sees.
#[derive(Debug, Error)]
pub enum BillingError {
    /// Malformed input rejected at the boundary before any mutation
    /// (invalid email, non-positive amount, bad event shape).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The payment gateway returned a non-2xx response or the call failed
    /// in transit. Carries the gateway's own message when one was parseable.
    #[error("gateway error: {message}")]
    Gateway { message: String },

    /// A durable-store failure unrelated to uniqueness. Fatal to the current
    /// reconciliation step; recorded in the event audit trail rather than
    /// propagated to the webhook response.
    #[error("database error: {0}")]
    Database(String),

    #[error("not found")]
    NotFound,

    /// Required environment/configuration is missing at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// The webhook signature header did not match the payload.
    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// The webhook body could not be parsed into an event envelope.
    #[error("malformed webhook event: {0}")]
    MalformedEvent(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => BillingError::NotFound,
            other => BillingError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::MalformedEvent(e.to_string())
    }
}
