//! Core entity types
//!
//! Entities are validated at construction, so the store layer and the
//! database constraints only ever see well-formed data. Rows read back from
//! the store carry plain `String` emails; [`EmailAddress`] is the
//! parse-don't-validate gate on the way in.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// A syntactically valid email address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EmailAddress(String);

impl EmailAddress {
    /// Parse and normalize (lowercase) an email address.
    pub fn parse(raw: &str) -> BillingResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return Err(BillingError::Validation(format!(
                "'{raw}' is not a valid email address"
            )));
        }

        let mut parts = trimmed.splitn(2, '@');
        let local = parts.next().unwrap_or_default();
        let domain = parts.next().unwrap_or_default();
        if local.is_empty() || domain.is_empty() || !domain.contains('.') || domain.contains('@') {
            return Err(BillingError::Validation(format!(
                "'{raw}' is not a valid email address"
            )));
        }

        Ok(Self(trimmed.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for EmailAddress {
    type Error = BillingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EmailAddress> for String {
    fn from(value: EmailAddress) -> Self {
        value.0
    }
}

/// Identity anchor: one row per subscriber email.
///
/// `created_at` is write-once; `updated_at` advances on every touch.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Customer {
    pub id: Uuid,
    pub email: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Append-only ledger entry: one row per successful payment, never mutated.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub email: String,
    /// Provider-assigned reference; the ledger's dedup key.
    pub gateway_reference: String,
    /// Amount paid, in minor currency units.
    pub amount: i64,
    pub service: String,
    #[serde(with = "time::serde::rfc3339")]
    pub paid_on: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_on: OffsetDateTime,
}

impl Transaction {
    /// Build a ledger entry, enforcing a forward entitlement window.
    pub fn record(
        email: &EmailAddress,
        gateway_reference: &str,
        amount: i64,
        service: &str,
        paid_on: OffsetDateTime,
        expires_on: OffsetDateTime,
    ) -> BillingResult<Self> {
        if amount < 0 {
            return Err(BillingError::Validation(format!(
                "amount must be non-negative, got {amount}"
            )));
        }
        if expires_on <= paid_on {
            return Err(BillingError::Validation(format!(
                "expires_on ({expires_on}) must be after paid_on ({paid_on})"
            )));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            email: email.as_str().to_string(),
            gateway_reference: gateway_reference.to_string(),
            amount,
            service: service.to_string(),
            paid_on,
            expires_on,
        })
    }
}

/// Current-entitlement projection: "the most recent payment's access
/// window", not a history. Zero or one row per email.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ActiveSubscription {
    pub id: Uuid,
    pub email: String,
    pub service: String,
    #[serde(with = "time::serde::rfc3339")]
    pub paid_on: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_on: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ActiveSubscription {
    /// Whether the entitlement window covers the given instant.
    pub fn is_active_at(&self, now: OffsetDateTime) -> bool {
        self.expires_on > now
    }
}

/// The entitlement window derived from one successful payment, ready to be
/// applied to the projection.
#[derive(Debug, Clone)]
pub struct Entitlement {
    pub email: EmailAddress,
    pub service: String,
    pub paid_on: OffsetDateTime,
    pub expires_on: OffsetDateTime,
}

impl Entitlement {
    pub fn new(
        email: EmailAddress,
        service: &str,
        paid_on: OffsetDateTime,
        expires_on: OffsetDateTime,
    ) -> BillingResult<Self> {
        if expires_on <= paid_on {
            return Err(BillingError::Validation(format!(
                "expires_on ({expires_on}) must be after paid_on ({paid_on})"
            )));
        }
        Ok(Self {
            email,
            service: service.to_string(),
            paid_on,
            expires_on,
        })
    }
}

/// A gateway-confirmed successful charge, validated before reconciliation.
#[derive(Debug, Clone)]
pub struct PaidCharge {
    pub email: EmailAddress,
    pub amount: i64,
    pub reference: String,
    pub paid_on: OffsetDateTime,
}

impl PaidCharge {
    pub fn new(
        email: EmailAddress,
        amount: i64,
        reference: &str,
        paid_on: OffsetDateTime,
    ) -> BillingResult<Self> {
        if amount < 0 {
            return Err(BillingError::Validation(format!(
                "amount must be non-negative, got {amount}"
            )));
        }
        if reference.trim().is_empty() {
            return Err(BillingError::Validation(
                "gateway reference must not be empty".to_string(),
            ));
        }
        Ok(Self {
            email,
            amount,
            reference: reference.trim().to_string(),
            paid_on,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn parses_and_normalizes_email() {
        let email = EmailAddress::parse(" Subscriber@Example.COM ").unwrap();
        assert_eq!(email.as_str(), "subscriber@example.com");
    }

    #[test]
    fn rejects_bad_emails() {
        for raw in ["", "no-at-sign", "@example.com", "user@", "user@nodot", "a b@example.com"] {
            assert!(EmailAddress::parse(raw).is_err(), "accepted {raw:?}");
        }
    }

    #[test]
    fn transaction_requires_forward_window() {
        let email = EmailAddress::parse("user@example.com").unwrap();
        let paid = datetime!(2024-01-02 00:00 UTC);
        let result = Transaction::record(&email, "ref_1", 500, "day-pass", paid, paid);
        assert!(matches!(result, Err(BillingError::Validation(_))));
    }

    #[test]
    fn paid_charge_rejects_negative_amount_and_blank_reference() {
        let email = EmailAddress::parse("user@example.com").unwrap();
        let paid = datetime!(2024-01-01 00:00 UTC);
        assert!(PaidCharge::new(email.clone(), -1, "ref", paid).is_err());
        assert!(PaidCharge::new(email, 500, "  ", paid).is_err());
    }
}
