//! In-memory implementation of the record store
//!
//! Mirrors the Postgres semantics exactly (conditional entitlement write,
//! reference-deduplicated ledger, atomic event claims) so the reconciler can
//! be exercised without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{ActiveSubscription, Customer, EmailAddress, Entitlement, Transaction};
use crate::store::{EventOutcome, StoredEvent, SubscriberStore};

#[derive(Debug, Clone)]
struct EventRecord {
    event_type: String,
    payload: serde_json::Value,
    result: String,
    error: Option<String>,
    received_seq: u64,
}

#[derive(Default)]
struct Inner {
    customers: HashMap<String, Customer>,
    transactions: Vec<Transaction>,
    subscriptions: HashMap<String, ActiveSubscription>,
    events: HashMap<String, EventRecord>,
    event_seq: u64,
}

/// In-memory store; the test double for [`PgStore`].
///
/// [`PgStore`]: crate::postgres::PgStore
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total ledger rows across all emails (test assertions).
    pub async fn transaction_count(&self) -> usize {
        self.inner.lock().await.transactions.len()
    }

    /// Processing result recorded for an event, if any (test assertions).
    pub async fn event_result(&self, dedup_key: &str) -> Option<String> {
        self.inner
            .lock()
            .await
            .events
            .get(dedup_key)
            .map(|e| e.result.clone())
    }

    /// Error message recorded for an event, if any (test assertions).
    pub async fn event_error(&self, dedup_key: &str) -> Option<String> {
        self.inner
            .lock()
            .await
            .events
            .get(dedup_key)
            .and_then(|e| e.error.clone())
    }
}

#[async_trait]
impl SubscriberStore for MemoryStore {
    async fn upsert_customer(&self, email: &EmailAddress) -> BillingResult<Customer> {
        let mut inner = self.inner.lock().await;
        let now = OffsetDateTime::now_utc();

        let customer = inner
            .customers
            .entry(email.as_str().to_string())
            .and_modify(|existing| {
                // Touch only; created_at is write-once.
                if now > existing.updated_at {
                    existing.updated_at = now;
                }
            })
            .or_insert_with(|| Customer {
                id: Uuid::new_v4(),
                email: email.as_str().to_string(),
                created_at: now,
                updated_at: now,
            });

        Ok(customer.clone())
    }

    async fn record_transaction(&self, tx: &Transaction) -> BillingResult<bool> {
        let mut inner = self.inner.lock().await;
        if inner
            .transactions
            .iter()
            .any(|existing| existing.gateway_reference == tx.gateway_reference)
        {
            return Ok(false);
        }
        inner.transactions.push(tx.clone());
        Ok(true)
    }

    async fn apply_entitlement(&self, entitlement: &Entitlement) -> BillingResult<bool> {
        let mut inner = self.inner.lock().await;
        let now = OffsetDateTime::now_utc();

        match inner.subscriptions.get_mut(entitlement.email.as_str()) {
            Some(existing) if existing.paid_on >= entitlement.paid_on => Ok(false),
            Some(existing) => {
                existing.service = entitlement.service.clone();
                existing.paid_on = entitlement.paid_on;
                existing.expires_on = entitlement.expires_on;
                existing.updated_at = now;
                Ok(true)
            }
            None => {
                inner.subscriptions.insert(
                    entitlement.email.as_str().to_string(),
                    ActiveSubscription {
                        id: Uuid::new_v4(),
                        email: entitlement.email.as_str().to_string(),
                        service: entitlement.service.clone(),
                        paid_on: entitlement.paid_on,
                        expires_on: entitlement.expires_on,
                        updated_at: now,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn get_customer(&self, email: &EmailAddress) -> BillingResult<Option<Customer>> {
        let inner = self.inner.lock().await;
        Ok(inner.customers.get(email.as_str()).cloned())
    }

    async fn get_active_subscription(
        &self,
        email: &EmailAddress,
    ) -> BillingResult<Option<ActiveSubscription>> {
        let inner = self.inner.lock().await;
        Ok(inner.subscriptions.get(email.as_str()).cloned())
    }

    async fn list_transactions(&self, email: &EmailAddress) -> BillingResult<Vec<Transaction>> {
        let inner = self.inner.lock().await;
        let mut transactions: Vec<Transaction> = inner
            .transactions
            .iter()
            .filter(|tx| tx.email == email.as_str())
            .cloned()
            .collect();
        transactions.sort_by(|a, b| b.paid_on.cmp(&a.paid_on));
        Ok(transactions)
    }

    async fn claim_event(
        &self,
        dedup_key: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<bool> {
        let mut inner = self.inner.lock().await;
        inner.event_seq += 1;
        let seq = inner.event_seq;

        match inner.events.get_mut(dedup_key) {
            Some(existing) if existing.result == "error" => {
                existing.result = "processing".to_string();
                existing.error = None;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                inner.events.insert(
                    dedup_key.to_string(),
                    EventRecord {
                        event_type: event_type.to_string(),
                        payload: payload.clone(),
                        result: "processing".to_string(),
                        error: None,
                        received_seq: seq,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn mark_event_outcome(
        &self,
        dedup_key: &str,
        outcome: EventOutcome,
        error: Option<&str>,
    ) -> BillingResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(event) = inner.events.get_mut(dedup_key) {
            event.result = outcome.as_str().to_string();
            event.error = error.map(str::to_string);
        }
        Ok(())
    }

    async fn list_failed_events(&self, limit: i64) -> BillingResult<Vec<StoredEvent>> {
        let inner = self.inner.lock().await;
        let mut failed: Vec<(&String, &EventRecord)> = inner
            .events
            .iter()
            .filter(|(_, event)| event.result == "error")
            .collect();
        failed.sort_by_key(|(_, event)| event.received_seq);

        Ok(failed
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(key, event)| StoredEvent {
                dedup_key: key.clone(),
                event_type: event.event_type.clone(),
                payload: event.payload.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn email() -> EmailAddress {
        EmailAddress::parse("subscriber@example.com").unwrap()
    }

    #[tokio::test]
    async fn customer_upsert_preserves_created_at() {
        let store = MemoryStore::new();
        let first = store.upsert_customer(&email()).await.unwrap();
        assert_eq!(first.created_at, first.updated_at);

        let second = store.upsert_customer(&email()).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn ledger_deduplicates_on_reference() {
        let store = MemoryStore::new();
        let tx = Transaction::record(
            &email(),
            "ref_abc",
            500,
            "day-pass",
            datetime!(2024-01-01 00:00 UTC),
            datetime!(2024-01-02 00:00 UTC),
        )
        .unwrap();

        assert!(store.record_transaction(&tx).await.unwrap());
        assert!(!store.record_transaction(&tx).await.unwrap());
        assert_eq!(store.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn older_entitlement_never_overwrites_newer() {
        let store = MemoryStore::new();
        let newer = Entitlement::new(
            email(),
            "monthly",
            datetime!(2024-02-01 00:00 UTC),
            datetime!(2024-03-02 00:00 UTC),
        )
        .unwrap();
        let older = Entitlement::new(
            email(),
            "day-pass",
            datetime!(2024-01-01 00:00 UTC),
            datetime!(2024-01-02 00:00 UTC),
        )
        .unwrap();

        assert!(store.apply_entitlement(&newer).await.unwrap());
        assert!(!store.apply_entitlement(&older).await.unwrap());

        let current = store
            .get_active_subscription(&email())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.paid_on, datetime!(2024-02-01 00:00 UTC));
        assert_eq!(current.service, "monthly");
    }

    #[tokio::test]
    async fn event_claim_is_exclusive_until_error() {
        let store = MemoryStore::new();
        let payload = serde_json::json!({"event": "charge.success"});

        assert!(store
            .claim_event("charge.success:ref_1", "charge.success", &payload)
            .await
            .unwrap());
        // Second delivery loses the claim while the first is in flight.
        assert!(!store
            .claim_event("charge.success:ref_1", "charge.success", &payload)
            .await
            .unwrap());

        store
            .mark_event_outcome("charge.success:ref_1", EventOutcome::Error, Some("boom"))
            .await
            .unwrap();
        // Errored events can be re-claimed for replay.
        assert!(store
            .claim_event("charge.success:ref_1", "charge.success", &payload)
            .await
            .unwrap());
    }
}
