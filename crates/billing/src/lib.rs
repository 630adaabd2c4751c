// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Netpass Billing Module
//!
//! Handles payment-gateway integration for the captive portal: plan tiers,
//! the subscriber record store, and webhook reconciliation.
//!
//! ## Features
//!
//! - **Plan Tiers**: Fixed price-to-duration table driving expiry dates
//! - **Record Store**: Customers, the append-only payment ledger, and the
//!   active-subscription projection, behind an injectable trait
//! - **Webhook Reconciliation**: Idempotent, order-tolerant application of
//!   gateway events, with per-step failure capture and replay
//! - **Gateway Client**: initialize / verify / transfer against the
//!   payment gateway's REST API
//! - **Invariants**: Runnable consistency checks for the worker's sweep

pub mod client;
pub mod error;
pub mod invariants;
pub mod memory;
pub mod models;
pub mod plans;
pub mod postgres;
pub mod store;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{
    CheckoutSession, GatewayClient, GatewayConfig, GatewayCustomer, GatewayTransaction,
    TransferRecord, TransferRequest,
};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Models
pub use models::{ActiveSubscription, Customer, EmailAddress, Entitlement, PaidCharge, Transaction};

// Plans
pub use plans::{compute_expiry, service_for_amount, tier_for_amount, PlanTier, PLAN_TIERS};

// Store
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{EventOutcome, StoredEvent, SubscriberStore};

// Webhooks
pub use webhooks::{
    GatewayEvent, ReconcileOutcome, WebhookHandler, WebhookReplayResult, SIGNATURE_HEADER,
};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines gateway access, the record store, and
/// webhook reconciliation.
pub struct BillingService {
    pub gateway: GatewayClient,
    pub store: Arc<dyn SubscriberStore>,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(GatewayConfig::from_env()?, pool))
    }

    /// Create a billing service with explicit config
    pub fn new(config: GatewayConfig, pool: PgPool) -> Self {
        let secret_key = config.secret_key.clone();
        let gateway = GatewayClient::new(config);
        let store: Arc<dyn SubscriberStore> = Arc::new(PgStore::new(pool));
        let webhooks = WebhookHandler::new(store.clone(), secret_key);

        Self {
            gateway,
            store,
            webhooks,
        }
    }
}
