//! Record store abstraction
//!
//! The reconciler and the API surface talk to the three collections through
//! this trait, never through a connection handle directly. [`PgStore`] is
//! the durable implementation; [`MemoryStore`] backs tests.
//!
//! [`PgStore`]: crate::postgres::PgStore
//! [`MemoryStore`]: crate::memory::MemoryStore

use async_trait::async_trait;

use crate::error::BillingResult;
use crate::models::{ActiveSubscription, Customer, EmailAddress, Entitlement, Transaction};

/// Terminal processing state of a webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// All reconciliation steps applied (or were already applied).
    Success,
    /// At least one step failed; the event is eligible for replay.
    Error,
    /// Event kind carries no entitlement semantics (transfers, unknown).
    Ignored,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Success => "success",
            EventOutcome::Error => "error",
            EventOutcome::Ignored => "ignored",
        }
    }
}

impl std::fmt::Display for EventOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A webhook event as persisted in the claim/audit table.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub dedup_key: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Durable mapping over the three entity collections plus the webhook event
/// claim table.
///
/// Semantics every implementation must uphold:
///
/// - `upsert_customer`: insert stamps `created_at == updated_at`; an
///   existing row keeps `created_at` and only advances `updated_at`.
///   A uniqueness conflict is the "already exists" branch, not an error.
/// - `record_transaction`: blind append, deduplicated on the gateway
///   reference; returns whether a row was actually inserted.
/// - `apply_entitlement`: insert-or-overwrite keyed by email, gated so an
///   older `paid_on` never replaces a newer one; returns whether the
///   projection changed. This conditional write is what makes out-of-order
///   delivery safe without per-email locks.
/// - `claim_event`: atomic claim on the dedup key; exactly one concurrent
///   caller wins. Errored and stuck claims may be re-won for replay.
#[async_trait]
pub trait SubscriberStore: Send + Sync {
    async fn upsert_customer(&self, email: &EmailAddress) -> BillingResult<Customer>;

    async fn record_transaction(&self, tx: &Transaction) -> BillingResult<bool>;

    async fn apply_entitlement(&self, entitlement: &Entitlement) -> BillingResult<bool>;

    async fn get_customer(&self, email: &EmailAddress) -> BillingResult<Option<Customer>>;

    async fn get_active_subscription(
        &self,
        email: &EmailAddress,
    ) -> BillingResult<Option<ActiveSubscription>>;

    /// Ledger entries for an email, most recent payment first.
    async fn list_transactions(&self, email: &EmailAddress) -> BillingResult<Vec<Transaction>>;

    /// Returns true when this caller won exclusive processing rights for the
    /// event, false when it was already processed or is being processed.
    async fn claim_event(
        &self,
        dedup_key: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<bool>;

    async fn mark_event_outcome(
        &self,
        dedup_key: &str,
        outcome: EventOutcome,
        error: Option<&str>,
    ) -> BillingResult<()>;

    /// Events whose last processing attempt errored, oldest first.
    async fn list_failed_events(&self, limit: i64) -> BillingResult<Vec<StoredEvent>>;
}
