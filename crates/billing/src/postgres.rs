//! Postgres implementation of the record store
//!
//! Every write that can collide is a single atomic statement: `ON CONFLICT`
//! upserts for customers and the entitlement projection, `ON CONFLICT DO
//! NOTHING` for the ledger append, and an `INSERT .. ON CONFLICT .. DO
//! UPDATE .. RETURNING` claim for webhook events. There is no reactive
//! insert-then-catch-then-update path anywhere.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{ActiveSubscription, Customer, EmailAddress, Entitlement, Transaction};
use crate::store::{EventOutcome, StoredEvent, SubscriberStore};

/// Claims stuck in 'processing' longer than this are assumed abandoned
/// (worker crash mid-reconciliation) and may be re-won.
const STUCK_CLAIM_TIMEOUT_MINUTES: i32 = 30;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct StoredEventRow {
    dedup_key: String,
    event_type: String,
    payload: serde_json::Value,
}

#[async_trait]
impl SubscriberStore for PgStore {
    async fn upsert_customer(&self, email: &EmailAddress) -> BillingResult<Customer> {
        // The conflict branch touches only updated_at; email and created_at
        // are write-once.
        let customer: Customer = sqlx::query_as(
            r#"
            INSERT INTO customers (id, email, created_at, updated_at)
            VALUES ($1, $2, NOW(), NOW())
            ON CONFLICT (email) DO UPDATE SET
                updated_at = NOW()
            RETURNING id, email, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(email.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(customer)
    }

    async fn record_transaction(&self, tx: &Transaction) -> BillingResult<bool> {
        // Duplicate gateway references are expected under at-least-once
        // delivery; rows_affected() == 0 is the dedup branch.
        let result = sqlx::query(
            r#"
            INSERT INTO transactions
                (id, email, gateway_reference, amount, service, paid_on, expires_on)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (gateway_reference) DO NOTHING
            "#,
        )
        .bind(tx.id)
        .bind(&tx.email)
        .bind(&tx.gateway_reference)
        .bind(tx.amount)
        .bind(&tx.service)
        .bind(tx.paid_on)
        .bind(tx.expires_on)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn apply_entitlement(&self, entitlement: &Entitlement) -> BillingResult<bool> {
        // Last-writer-wins gated by paid_on: an event carrying an older
        // payment never clobbers a newer window, whatever order the gateway
        // delivered them in.
        let result = sqlx::query(
            r#"
            INSERT INTO active_subscriptions
                (id, email, service, paid_on, expires_on, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (email) DO UPDATE SET
                service = EXCLUDED.service,
                paid_on = EXCLUDED.paid_on,
                expires_on = EXCLUDED.expires_on,
                updated_at = NOW()
            WHERE active_subscriptions.paid_on < EXCLUDED.paid_on
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entitlement.email.as_str())
        .bind(&entitlement.service)
        .bind(entitlement.paid_on)
        .bind(entitlement.expires_on)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_customer(&self, email: &EmailAddress) -> BillingResult<Option<Customer>> {
        let customer = sqlx::query_as(
            "SELECT id, email, created_at, updated_at FROM customers WHERE email = $1",
        )
        .bind(email.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(customer)
    }

    async fn get_active_subscription(
        &self,
        email: &EmailAddress,
    ) -> BillingResult<Option<ActiveSubscription>> {
        let subscription = sqlx::query_as(
            r#"
            SELECT id, email, service, paid_on, expires_on, updated_at
            FROM active_subscriptions
            WHERE email = $1
            "#,
        )
        .bind(email.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn list_transactions(&self, email: &EmailAddress) -> BillingResult<Vec<Transaction>> {
        let transactions = sqlx::query_as(
            r#"
            SELECT id, email, gateway_reference, amount, service, paid_on, expires_on
            FROM transactions
            WHERE email = $1
            ORDER BY paid_on DESC
            "#,
        )
        .bind(email.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(transactions)
    }

    async fn claim_event(
        &self,
        dedup_key: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<bool> {
        // Atomic claim: only one concurrent delivery gets a row back. The
        // conflict branch re-wins claims that previously errored (replay) or
        // have been stuck in 'processing' past the timeout.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO gateway_webhook_events
                (id, dedup_key, event_type, payload, processing_result, processing_started_at)
            VALUES ($1, $2, $3, $4, 'processing', NOW())
            ON CONFLICT (dedup_key) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE gateway_webhook_events.processing_result = 'error'
               OR (gateway_webhook_events.processing_result = 'processing'
                   AND gateway_webhook_events.processing_started_at
                       < NOW() - ($5 || ' minutes')::INTERVAL)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(dedup_key)
        .bind(event_type)
        .bind(payload)
        .bind(STUCK_CLAIM_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(dedup_key = %dedup_key, error = %e, "Failed to claim webhook event");
            BillingError::Database(e.to_string())
        })?;

        Ok(claimed.is_some())
    }

    async fn mark_event_outcome(
        &self,
        dedup_key: &str,
        outcome: EventOutcome,
        error: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE gateway_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE dedup_key = $3
            "#,
        )
        .bind(outcome.as_str())
        .bind(error)
        .bind(dedup_key)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_failed_events(&self, limit: i64) -> BillingResult<Vec<StoredEvent>> {
        let rows: Vec<StoredEventRow> = sqlx::query_as(
            r#"
            SELECT dedup_key, event_type, payload
            FROM gateway_webhook_events
            WHERE processing_result = 'error'
            ORDER BY received_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| StoredEvent {
                dedup_key: row.dedup_key,
                event_type: row.event_type,
                payload: row.payload,
            })
            .collect())
    }
}
