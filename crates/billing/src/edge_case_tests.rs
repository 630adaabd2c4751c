// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Webhook Reconciliation
//!
//! Tests critical boundary conditions and race conditions in:
//! - Duplicate delivery (RECON-D01 to RECON-D04)
//! - Out-of-order delivery (RECON-O01 to RECON-O02)
//! - Partial failure and replay (RECON-F01 to RECON-F03)
//! - Boundary validation (RECON-V01 to RECON-V03)

#[cfg(test)]
mod reconciler_tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;
    use time::macros::datetime;
    use time::OffsetDateTime;

    use crate::memory::MemoryStore;
    use crate::models::{ActiveSubscription, Customer, EmailAddress, Entitlement, Transaction};
    use crate::store::{EventOutcome, StoredEvent, SubscriberStore};
    use crate::webhooks::{GatewayEvent, ReconcileOutcome, WebhookHandler};
    use crate::{BillingError, BillingResult};

    const SECRET: &str = "sk_test_secret";

    fn email() -> EmailAddress {
        EmailAddress::parse("subscriber@example.com").unwrap()
    }

    fn charge_event(reference: &str, amount: i64, paid_at: &str) -> GatewayEvent {
        GatewayEvent {
            event: "charge.success".to_string(),
            data: json!({
                "reference": reference,
                "amount": amount,
                "paid_at": paid_at,
                "customer": { "email": "subscriber@example.com" },
            }),
        }
    }

    /// Store wrapper that can be told to fail the entitlement write,
    /// simulating a crash between the ledger append and the projection
    /// overwrite.
    struct FlakyStore {
        inner: MemoryStore,
        fail_entitlement: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_entitlement: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl SubscriberStore for FlakyStore {
        async fn upsert_customer(&self, email: &EmailAddress) -> BillingResult<Customer> {
            self.inner.upsert_customer(email).await
        }

        async fn record_transaction(&self, tx: &Transaction) -> BillingResult<bool> {
            self.inner.record_transaction(tx).await
        }

        async fn apply_entitlement(&self, entitlement: &Entitlement) -> BillingResult<bool> {
            if self.fail_entitlement.load(Ordering::SeqCst) {
                return Err(BillingError::Database("connection reset".to_string()));
            }
            self.inner.apply_entitlement(entitlement).await
        }

        async fn get_customer(&self, email: &EmailAddress) -> BillingResult<Option<Customer>> {
            self.inner.get_customer(email).await
        }

        async fn get_active_subscription(
            &self,
            email: &EmailAddress,
        ) -> BillingResult<Option<ActiveSubscription>> {
            self.inner.get_active_subscription(email).await
        }

        async fn list_transactions(&self, email: &EmailAddress) -> BillingResult<Vec<Transaction>> {
            self.inner.list_transactions(email).await
        }

        async fn claim_event(
            &self,
            dedup_key: &str,
            event_type: &str,
            payload: &serde_json::Value,
        ) -> BillingResult<bool> {
            self.inner.claim_event(dedup_key, event_type, payload).await
        }

        async fn mark_event_outcome(
            &self,
            dedup_key: &str,
            outcome: EventOutcome,
            error: Option<&str>,
        ) -> BillingResult<()> {
            self.inner.mark_event_outcome(dedup_key, outcome, error).await
        }

        async fn list_failed_events(&self, limit: i64) -> BillingResult<Vec<StoredEvent>> {
            self.inner.list_failed_events(limit).await
        }
    }

    // =========================================================================
    // RECON-D01: Identical delivery replayed - one ledger row, one projection
    // =========================================================================
    #[tokio::test]
    async fn replayed_delivery_writes_ledger_once() {
        let store = Arc::new(MemoryStore::new());
        let handler = WebhookHandler::new(store.clone(), SECRET.to_string());
        let event = charge_event("ref_1", 11_000, "2024-01-01T00:00:00Z");

        let first = handler.process_event(event.clone()).await;
        assert!(matches!(first, ReconcileOutcome::Applied { .. }));

        let second = handler.process_event(event).await;
        assert_eq!(second, ReconcileOutcome::Duplicate);

        assert_eq!(store.transaction_count().await, 1);
        let sub = store
            .get_active_subscription(&email())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sub.paid_on, datetime!(2024-01-01 00:00 UTC));
        assert_eq!(sub.expires_on, datetime!(2024-01-31 00:00 UTC));
    }

    // =========================================================================
    // RECON-D02: Two concurrent deliveries of the same event - one winner
    // =========================================================================
    #[tokio::test]
    async fn concurrent_duplicate_deliveries_apply_once() {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(WebhookHandler::new(store.clone(), SECRET.to_string()));
        let event = charge_event("ref_race", 500, "2024-01-01T00:00:00Z");

        let mut handles = Vec::new();
        for _ in 0..4 {
            let handler = Arc::clone(&handler);
            let event = event.clone();
            handles.push(tokio::spawn(
                async move { handler.process_event(event).await },
            ));
        }

        let mut applied = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), ReconcileOutcome::Applied { .. }) {
                applied += 1;
            }
        }

        assert_eq!(applied, 1, "exactly one delivery should win the claim");
        assert_eq!(store.transaction_count().await, 1);
    }

    // =========================================================================
    // RECON-D03: Verify path and webhook path share the dedup key space
    // =========================================================================
    #[tokio::test]
    async fn verify_then_webhook_reconciles_once() {
        use crate::client::{GatewayCustomer, GatewayTransaction};

        let store = Arc::new(MemoryStore::new());
        let handler = WebhookHandler::new(store.clone(), SECRET.to_string());

        let record = GatewayTransaction {
            reference: "ref_verify".to_string(),
            amount: 25_000,
            status: "success".to_string(),
            paid_at: Some(datetime!(2024-01-01 00:00 UTC)),
            customer: GatewayCustomer {
                email: "subscriber@example.com".to_string(),
            },
        };

        let first = handler.reconcile_verified(&record).await;
        assert!(matches!(first, ReconcileOutcome::Applied { .. }));

        let second = handler
            .process_event(charge_event("ref_verify", 25_000, "2024-01-01T00:00:00Z"))
            .await;
        assert_eq!(second, ReconcileOutcome::Duplicate);
        assert_eq!(store.transaction_count().await, 1);
    }

    // =========================================================================
    // RECON-D04: Distinct references for the same email both land in the
    // ledger
    // =========================================================================
    #[tokio::test]
    async fn distinct_payments_both_recorded() {
        let store = Arc::new(MemoryStore::new());
        let handler = WebhookHandler::new(store.clone(), SECRET.to_string());

        handler
            .process_event(charge_event("ref_a", 500, "2024-01-01T00:00:00Z"))
            .await;
        handler
            .process_event(charge_event("ref_b", 500, "2024-01-02T00:00:00Z"))
            .await;

        assert_eq!(store.transaction_count().await, 2);
        assert_eq!(store.list_transactions(&email()).await.unwrap().len(), 2);
    }

    // =========================================================================
    // RECON-O01/O02: T1 < T2 applied in either order - projection holds T2
    // =========================================================================
    #[tokio::test]
    async fn projection_holds_latest_payment_regardless_of_arrival_order() {
        let older = ("ref_t1", "2024-01-01T00:00:00Z");
        let newer = ("ref_t2", "2024-02-01T00:00:00Z");

        for (first, second) in [(older, newer), (newer, older)] {
            let store = Arc::new(MemoryStore::new());
            let handler = WebhookHandler::new(store.clone(), SECRET.to_string());

            handler
                .process_event(charge_event(first.0, 11_000, first.1))
                .await;
            handler
                .process_event(charge_event(second.0, 11_000, second.1))
                .await;

            let sub = store
                .get_active_subscription(&email())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(
                sub.paid_on,
                datetime!(2024-02-01 00:00 UTC),
                "projection must reflect the latest paid_on"
            );
            assert_eq!(store.transaction_count().await, 2, "both payments ledgered");
        }
    }

    // =========================================================================
    // RECON-F01: Entitlement step fails - event acked, recorded as error,
    // ledger intact
    // =========================================================================
    #[tokio::test]
    async fn step_failure_is_recorded_not_raised() {
        let store = Arc::new(FlakyStore::new());
        store.fail_entitlement.store(true, Ordering::SeqCst);
        let handler = WebhookHandler::new(store.clone(), SECRET.to_string());

        let outcome = handler
            .process_event(charge_event("ref_fail", 11_000, "2024-01-01T00:00:00Z"))
            .await;

        match outcome {
            ReconcileOutcome::StepsFailed { failed_steps } => {
                assert_eq!(failed_steps.len(), 1);
                assert!(failed_steps[0].starts_with("entitlement_apply"));
            }
            other => panic!("expected StepsFailed, got {other:?}"),
        }

        // The ledger append succeeded; only the projection is behind.
        assert_eq!(store.inner.transaction_count().await, 1);
        assert!(store
            .get_active_subscription(&email())
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            store.inner.event_result("charge.success:ref_fail").await,
            Some("error".to_string())
        );
        let recorded = store
            .inner
            .event_error("charge.success:ref_fail")
            .await
            .unwrap();
        assert!(recorded.contains("entitlement_apply"));
    }

    // =========================================================================
    // RECON-F02: Replay after the failure clears converges the projection
    // =========================================================================
    #[tokio::test]
    async fn replay_converges_projection_after_failure() {
        let store = Arc::new(FlakyStore::new());
        store.fail_entitlement.store(true, Ordering::SeqCst);
        let handler = WebhookHandler::new(store.clone(), SECRET.to_string());

        handler
            .process_event(charge_event("ref_replay", 500, "2024-01-01T00:00:00Z"))
            .await;

        store.fail_entitlement.store(false, Ordering::SeqCst);
        let result = handler.replay_failed_events(10).await;
        assert_eq!(result.attempted, 1);
        assert_eq!(result.recovered, 1);
        assert_eq!(result.still_failing, 0);

        // Replay went through the full path again: ledger stayed
        // deduplicated and the projection caught up.
        assert_eq!(store.inner.transaction_count().await, 1);
        let sub = store
            .get_active_subscription(&email())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sub.expires_on, datetime!(2024-01-02 00:00 UTC));
        assert_eq!(
            store.inner.event_result("charge.success:ref_replay").await,
            Some("success".to_string())
        );
    }

    // =========================================================================
    // RECON-F03: Replay with nothing queued is a no-op
    // =========================================================================
    #[tokio::test]
    async fn replay_with_no_failures_is_noop() {
        let handler = WebhookHandler::new(Arc::new(MemoryStore::new()), SECRET.to_string());
        let result = handler.replay_failed_events(10).await;
        assert_eq!(result.attempted, 0);
        assert_eq!(result.recovered, 0);
    }

    // =========================================================================
    // RECON-V01: charge.failed and transfer events never touch entitlement
    // =========================================================================
    #[tokio::test]
    async fn non_success_events_do_not_mutate() {
        let store = Arc::new(MemoryStore::new());
        let handler = WebhookHandler::new(store.clone(), SECRET.to_string());

        for event_type in ["charge.failed", "transfer.success", "transfer.failed"] {
            let outcome = handler
                .process_event(GatewayEvent {
                    event: event_type.to_string(),
                    data: json!({
                        "reference": format!("{event_type}_ref"),
                        "amount": 11_000,
                        "customer": { "email": "subscriber@example.com" },
                    }),
                })
                .await;
            assert!(matches!(outcome, ReconcileOutcome::LoggedOnly { .. }));
        }

        assert_eq!(store.transaction_count().await, 0);
        assert!(store.get_customer(&email()).await.unwrap().is_none());
        assert!(store
            .get_active_subscription(&email())
            .await
            .unwrap()
            .is_none());
        // The events were still acknowledged into the audit trail.
        assert_eq!(
            store.event_result("charge.failed:charge.failed_ref").await,
            Some("ignored".to_string())
        );
    }

    // =========================================================================
    // RECON-V02: charge.success with an invalid email writes nothing
    // =========================================================================
    #[tokio::test]
    async fn invalid_email_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let handler = WebhookHandler::new(store.clone(), SECRET.to_string());

        let outcome = handler
            .process_event(GatewayEvent {
                event: "charge.success".to_string(),
                data: json!({
                    "reference": "ref_bad_email",
                    "amount": 500,
                    "paid_at": "2024-01-01T00:00:00Z",
                    "customer": { "email": "not-an-email" },
                }),
            })
            .await;

        assert!(matches!(outcome, ReconcileOutcome::Invalid { .. }));
        assert_eq!(store.transaction_count().await, 0);
        assert_eq!(store.event_result("charge.success:ref_bad_email").await, None);
    }

    // =========================================================================
    // RECON-V03: Unmatched amount defaults into a one-day pass
    // =========================================================================
    #[tokio::test]
    async fn unmatched_amount_buys_a_day() {
        let store = Arc::new(MemoryStore::new());
        let handler = WebhookHandler::new(store.clone(), SECRET.to_string());

        let outcome = handler
            .process_event(charge_event("ref_odd", 999, "2024-01-01T00:00:00Z"))
            .await;
        assert!(matches!(outcome, ReconcileOutcome::Applied { .. }));

        let sub = store
            .get_active_subscription(&email())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sub.expires_on, datetime!(2024-01-02 00:00 UTC));
        assert_eq!(sub.service, "day-pass");
    }

    // =========================================================================
    // Customer lifecycle across payments
    // =========================================================================
    #[tokio::test]
    async fn second_payment_touches_customer_without_rewriting_identity() {
        let store = Arc::new(MemoryStore::new());
        let handler = WebhookHandler::new(store.clone(), SECRET.to_string());

        handler
            .process_event(charge_event("ref_first", 500, "2024-01-01T00:00:00Z"))
            .await;
        let created = store.get_customer(&email()).await.unwrap().unwrap();
        assert_eq!(created.created_at, created.updated_at);

        handler
            .process_event(charge_event("ref_second", 11_000, "2024-02-01T00:00:00Z"))
            .await;
        let touched = store.get_customer(&email()).await.unwrap().unwrap();
        assert_eq!(touched.id, created.id);
        assert_eq!(touched.created_at, created.created_at);
        assert!(touched.updated_at >= created.updated_at);
    }

    // Entitlement check helper behavior used by the status endpoint.
    #[tokio::test]
    async fn entitlement_check_is_lazy_against_now() {
        let store = Arc::new(MemoryStore::new());
        let handler = WebhookHandler::new(store.clone(), SECRET.to_string());

        handler
            .process_event(charge_event("ref_expired", 500, "2024-01-01T00:00:00Z"))
            .await;

        let sub = store
            .get_active_subscription(&email())
            .await
            .unwrap()
            .unwrap();
        assert!(sub.is_active_at(datetime!(2024-01-01 12:00 UTC)));
        assert!(!sub.is_active_at(datetime!(2024-01-03 00:00 UTC)));
        assert!(!sub.is_active_at(OffsetDateTime::now_utc()));
    }
}
