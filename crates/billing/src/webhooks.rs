//! Gateway webhook handling
//!
//! Verifies webhook authenticity, classifies gateway events, and drives the
//! three-step reconciliation (customer upsert, ledger append, entitlement
//! overwrite) against the record store.
//!
//! The gateway delivers at-least-once, so everything here is built to be
//! re-run: an atomic per-event claim short-circuits duplicate deliveries,
//! and the ledger's unique gateway reference is an independent second guard.
//! The three writes are not one transaction: each step's failure is caught,
//! logged, and recorded on the event so the worker can replay it later,
//! while the HTTP layer still acknowledges receipt.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha512;
use time::OffsetDateTime;

use crate::client::GatewayTransaction;
use crate::error::{BillingError, BillingResult};
use crate::models::{EmailAddress, Entitlement, PaidCharge, Transaction};
use crate::plans::{compute_expiry, service_for_amount, tier_for_amount};
use crate::store::{EventOutcome, SubscriberStore};

/// Header the gateway puts the body signature in.
pub const SIGNATURE_HEADER: &str = "x-paystack-signature";

type HmacSha512 = Hmac<Sha512>;

/// Raw event envelope as delivered by the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEvent {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Charge payload carried by `charge.success` / `charge.failed` events.
#[derive(Debug, Deserialize)]
struct ChargeEventData {
    reference: String,
    amount: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    paid_at: Option<OffsetDateTime>,
    customer: ChargeEventCustomer,
}

#[derive(Debug, Deserialize)]
struct ChargeEventCustomer {
    email: String,
}

/// What one event ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Entitlement state reflects this payment.
    Applied { email: String, service: String },
    /// Another delivery of the same event already holds or held the claim.
    Duplicate,
    /// One or more reconciliation steps failed; recorded for replay.
    StepsFailed { failed_steps: Vec<String> },
    /// Event acknowledged and logged; no entitlement semantics.
    LoggedOnly { event: String },
    /// Unrecognized event kind; acknowledged so the gateway stops retrying.
    Unhandled { event: String },
    /// Event data did not yield a valid charge; nothing was written.
    Invalid { reason: String },
}

/// Summary of a failed-event replay pass.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WebhookReplayResult {
    pub attempted: usize,
    pub recovered: usize,
    pub still_failing: usize,
}

/// Consumes gateway events and applies them to the record store.
pub struct WebhookHandler {
    store: Arc<dyn SubscriberStore>,
    secret_key: String,
}

impl WebhookHandler {
    pub fn new(store: Arc<dyn SubscriberStore>, secret_key: String) -> Self {
        Self { store, secret_key }
    }

    /// Check the HMAC-SHA512 body signature the gateway sends with every
    /// delivery.
    pub fn verify_signature(&self, payload: &[u8], signature: &str) -> BillingResult<()> {
        let mut mac = HmacSha512::new_from_slice(self.secret_key.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(payload);
        let computed = hex::encode(mac.finalize().into_bytes());

        if !computed.eq_ignore_ascii_case(signature.trim()) {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }
        Ok(())
    }

    /// Parse the raw body into an event envelope. Malformed payloads are the
    /// one case the webhook endpoint rejects with a non-2xx.
    pub fn parse_event(&self, payload: &str) -> BillingResult<GatewayEvent> {
        let event: GatewayEvent = serde_json::from_str(payload)?;
        Ok(event)
    }

    /// Apply one event. Never fails outward: internal errors are logged and
    /// recorded on the event, and the caller acknowledges receipt
    /// regardless.
    pub async fn process_event(&self, event: GatewayEvent) -> ReconcileOutcome {
        match event.event.as_str() {
            "charge.success" => self.handle_charge_success(&event).await,
            "charge.failed" => {
                self.acknowledge_only(&event, "charge failed; no entitlement change")
                    .await;
                ReconcileOutcome::LoggedOnly {
                    event: event.event.clone(),
                }
            }
            "transfer.success" | "transfer.failed" | "transfer.reversed" => {
                // Outbound payouts are not subscriber-facing.
                self.acknowledge_only(&event, "transfer event; out of entitlement scope")
                    .await;
                ReconcileOutcome::LoggedOnly {
                    event: event.event.clone(),
                }
            }
            other => {
                // Log so new gateway event kinds that may need handlers are
                // visible in one place.
                tracing::info!(event_type = %other, "Received unhandled gateway event type");
                self.acknowledge_only(&event, "no handler configured").await;
                ReconcileOutcome::Unhandled {
                    event: other.to_string(),
                }
            }
        }
    }

    /// Feed a gateway-verified transaction through the same reconciliation
    /// path the webhook takes. Shares the webhook's dedup key space, so a
    /// verify call and a webhook delivery of the same payment reconcile
    /// exactly once between them.
    pub async fn reconcile_verified(&self, record: &GatewayTransaction) -> ReconcileOutcome {
        if !record.is_successful() {
            tracing::info!(
                reference = %record.reference,
                status = %record.status,
                "Verified transaction not successful; nothing to reconcile"
            );
            return ReconcileOutcome::LoggedOnly {
                event: format!("verify:{}", record.status),
            };
        }

        let email = match EmailAddress::parse(&record.customer.email) {
            Ok(email) => email,
            Err(e) => return invalid(format!("verified transaction has bad email: {e}")),
        };
        let paid_on = record.paid_at.unwrap_or_else(OffsetDateTime::now_utc);
        let charge = match PaidCharge::new(email, record.amount, &record.reference, paid_on) {
            Ok(charge) => charge,
            Err(e) => return invalid(format!("verified transaction rejected: {e}")),
        };

        let payload = serde_json::json!({
            "event": "charge.success",
            "data": {
                "reference": record.reference,
                "amount": record.amount,
                "paid_at": record
                    .paid_at
                    .and_then(|t| t.format(&time::format_description::well_known::Rfc3339).ok()),
                "customer": { "email": record.customer.email },
            },
        });

        self.reconcile_charge(charge, "charge.success", payload)
            .await
    }

    /// Re-drive events whose last attempt errored.
    pub async fn replay_failed_events(&self, limit: i64) -> WebhookReplayResult {
        let failed = match self.store.list_failed_events(limit).await {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list errored webhook events");
                return WebhookReplayResult {
                    attempted: 0,
                    recovered: 0,
                    still_failing: 0,
                };
            }
        };

        let mut result = WebhookReplayResult {
            attempted: failed.len(),
            recovered: 0,
            still_failing: 0,
        };

        for stored in failed {
            let event: GatewayEvent = match serde_json::from_value(stored.payload.clone()) {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(
                        dedup_key = %stored.dedup_key,
                        error = %e,
                        "Stored webhook payload no longer parses; skipping replay"
                    );
                    result.still_failing += 1;
                    continue;
                }
            };

            match self.process_event(event).await {
                ReconcileOutcome::StepsFailed { .. } | ReconcileOutcome::Invalid { .. } => {
                    result.still_failing += 1
                }
                _ => result.recovered += 1,
            }
        }

        result
    }

    async fn handle_charge_success(&self, event: &GatewayEvent) -> ReconcileOutcome {
        let data: ChargeEventData = match serde_json::from_value(event.data.clone()) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(error = %e, "charge.success event with unusable data");
                return invalid(format!("charge.success data rejected: {e}"));
            }
        };

        let email = match EmailAddress::parse(&data.customer.email) {
            Ok(email) => email,
            Err(e) => {
                tracing::warn!(reference = %data.reference, error = %e, "charge.success with invalid email");
                return invalid(format!("charge.success email rejected: {e}"));
            }
        };

        let paid_on = data.paid_at.unwrap_or_else(|| {
            tracing::warn!(reference = %data.reference, "charge.success without paid_at; using receipt time");
            OffsetDateTime::now_utc()
        });

        let charge = match PaidCharge::new(email, data.amount, &data.reference, paid_on) {
            Ok(charge) => charge,
            Err(e) => {
                tracing::warn!(reference = %data.reference, error = %e, "charge.success rejected");
                return invalid(format!("charge.success rejected: {e}"));
            }
        };

        let payload = serde_json::json!({ "event": event.event, "data": event.data });
        self.reconcile_charge(charge, &event.event, payload).await
    }

    /// The three-step write sequence behind every successful charge.
    async fn reconcile_charge(
        &self,
        charge: PaidCharge,
        event_type: &str,
        payload: serde_json::Value,
    ) -> ReconcileOutcome {
        let dedup_key = format!("{event_type}:{}", charge.reference);

        match self
            .store
            .claim_event(&dedup_key, event_type, &payload)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(
                    dedup_key = %dedup_key,
                    "Duplicate gateway event; already processed or in flight"
                );
                return ReconcileOutcome::Duplicate;
            }
            Err(e) => {
                // Without a claim we cannot dedup; leave the event to the
                // gateway's redelivery rather than risk a double apply.
                tracing::error!(dedup_key = %dedup_key, error = %e, "Could not claim webhook event");
                return ReconcileOutcome::StepsFailed {
                    failed_steps: vec![format!("claim: {e}")],
                };
            }
        }

        if tier_for_amount(charge.amount).is_none() {
            tracing::warn!(
                amount = charge.amount,
                reference = %charge.reference,
                "No price tier matches amount; defaulting to shortest access window"
            );
        }

        let expires_on = compute_expiry(charge.amount, charge.paid_on);
        let service = service_for_amount(charge.amount);
        let mut failed_steps: Vec<String> = Vec::new();

        // Step 1: customer identity.
        if let Err(e) = self.store.upsert_customer(&charge.email).await {
            tracing::error!(
                step = "customer_upsert",
                email = %charge.email,
                error = %e,
                "Reconciliation step failed"
            );
            failed_steps.push(format!("customer_upsert: {e}"));
        }

        // Step 2: append to the ledger (reference-deduplicated).
        match Transaction::record(
            &charge.email,
            &charge.reference,
            charge.amount,
            service,
            charge.paid_on,
            expires_on,
        ) {
            Ok(tx) => match self.store.record_transaction(&tx).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(
                        reference = %charge.reference,
                        "Ledger entry already present for reference"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        step = "ledger_append",
                        reference = %charge.reference,
                        error = %e,
                        "Reconciliation step failed"
                    );
                    failed_steps.push(format!("ledger_append: {e}"));
                }
            },
            Err(e) => {
                tracing::error!(step = "ledger_append", error = %e, "Ledger entry rejected");
                failed_steps.push(format!("ledger_append: {e}"));
            }
        }

        // Step 3: overwrite the entitlement projection (older paid_on never
        // wins).
        match Entitlement::new(charge.email.clone(), service, charge.paid_on, expires_on) {
            Ok(entitlement) => match self.store.apply_entitlement(&entitlement).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(
                        email = %charge.email,
                        paid_on = %charge.paid_on,
                        "Stored entitlement is newer; projection unchanged"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        step = "entitlement_apply",
                        email = %charge.email,
                        error = %e,
                        "Reconciliation step failed"
                    );
                    failed_steps.push(format!("entitlement_apply: {e}"));
                }
            },
            Err(e) => {
                tracing::error!(step = "entitlement_apply", error = %e, "Entitlement rejected");
                failed_steps.push(format!("entitlement_apply: {e}"));
            }
        }

        if failed_steps.is_empty() {
            self.finish_event(&dedup_key, EventOutcome::Success, None)
                .await;
            tracing::info!(
                email = %charge.email,
                service = %service,
                expires_on = %expires_on,
                "Payment reconciled"
            );
            ReconcileOutcome::Applied {
                email: charge.email.as_str().to_string(),
                service: service.to_string(),
            }
        } else {
            let message = failed_steps.join("; ");
            self.finish_event(&dedup_key, EventOutcome::Error, Some(&message))
                .await;
            ReconcileOutcome::StepsFailed { failed_steps }
        }
    }

    /// Record receipt of a non-entitlement event when it carries a usable
    /// dedup key; otherwise just log it.
    async fn acknowledge_only(&self, event: &GatewayEvent, note: &str) {
        let reference = event
            .data
            .get("reference")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        tracing::info!(
            event_type = %event.event,
            reference = reference.as_deref().unwrap_or("(none)"),
            "{note}"
        );

        let Some(reference) = reference else {
            return;
        };
        let dedup_key = format!("{}:{reference}", event.event);
        let payload = serde_json::json!({ "event": event.event, "data": event.data });

        match self
            .store
            .claim_event(&dedup_key, &event.event, &payload)
            .await
        {
            Ok(true) => {
                self.finish_event(&dedup_key, EventOutcome::Ignored, None)
                    .await
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(dedup_key = %dedup_key, error = %e, "Failed to record ignored event")
            }
        }
    }

    /// Persist the processing outcome; the audit row is what replay and the
    /// invariant sweep read, so retry once before giving up.
    async fn finish_event(&self, dedup_key: &str, outcome: EventOutcome, error: Option<&str>) {
        if let Err(first) = self
            .store
            .mark_event_outcome(dedup_key, outcome, error)
            .await
        {
            tracing::warn!(
                dedup_key = %dedup_key,
                error = %first,
                "First attempt to record event outcome failed, retrying"
            );
            if let Err(retry) = self
                .store
                .mark_event_outcome(dedup_key, outcome, error)
                .await
            {
                tracing::error!(
                    dedup_key = %dedup_key,
                    outcome = %outcome,
                    first_error = %first,
                    retry_error = %retry,
                    "Failed to record event outcome after retry; event may appear stuck"
                );
            }
        }
    }
}

fn invalid(reason: String) -> ReconcileOutcome {
    ReconcileOutcome::Invalid { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn handler() -> WebhookHandler {
        WebhookHandler::new(Arc::new(MemoryStore::new()), "sk_test_secret".to_string())
    }

    fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha512::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_matching_signature() {
        let handler = handler();
        let payload = br#"{"event":"charge.success","data":{}}"#;
        let signature = sign("sk_test_secret", payload);
        assert!(handler.verify_signature(payload, &signature).is_ok());
        // Hex case must not matter.
        assert!(handler
            .verify_signature(payload, &signature.to_uppercase())
            .is_ok());
    }

    #[test]
    fn rejects_wrong_signature() {
        let handler = handler();
        let payload = br#"{"event":"charge.success","data":{}}"#;
        let signature = sign("some_other_secret", payload);
        assert!(matches!(
            handler.verify_signature(payload, &signature),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn parse_requires_event_field() {
        let handler = handler();
        assert!(matches!(
            handler.parse_event(r#"{"data":{"reference":"r"}}"#),
            Err(BillingError::MalformedEvent(_))
        ));
        assert!(handler.parse_event("not json at all").is_err());
        // data is optional on the wire.
        assert!(handler.parse_event(r#"{"event":"charge.failed"}"#).is_ok());
    }

    #[tokio::test]
    async fn unknown_event_is_acknowledged_not_failed() {
        let handler = handler();
        let event = handler
            .parse_event(r#"{"event":"subscription.create","data":{"reference":"sub_1"}}"#)
            .unwrap();
        let outcome = handler.process_event(event).await;
        assert_eq!(
            outcome,
            ReconcileOutcome::Unhandled {
                event: "subscription.create".to_string()
            }
        );
    }
}
