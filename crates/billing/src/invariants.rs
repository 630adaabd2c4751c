//! Subscription invariants
//!
//! Runnable consistency checks over the three collections and the webhook
//! audit trail. The worker runs these after-the-fact because the three
//! reconciliation writes are deliberately not one transaction; a violation
//! here is the observable signal that out-of-band repair is needed.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Subscriber email(s) affected (empty when not email-scoped)
    pub emails: Vec<String>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - entitlement or ledger correctness is broken
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for duplicate projection violation
#[derive(Debug, sqlx::FromRow)]
struct DuplicateProjectionRow {
    email: String,
    row_count: i64,
}

/// Row type for inverted entitlement window violation
#[derive(Debug, sqlx::FromRow)]
struct InvertedWindowRow {
    source: String,
    email: String,
    paid_on: OffsetDateTime,
    expires_on: OffsetDateTime,
}

/// Row type for projection/ledger divergence violation
#[derive(Debug, sqlx::FromRow)]
struct ProjectionBehindRow {
    email: String,
    projection_paid_on: OffsetDateTime,
    ledger_paid_on: OffsetDateTime,
}

/// Row type for duplicate ledger reference violation
#[derive(Debug, sqlx::FromRow)]
struct DuplicateReferenceRow {
    gateway_reference: String,
    row_count: i64,
}

/// Row type for stuck or unreplayed webhook events
#[derive(Debug, sqlx::FromRow)]
struct StaleEventRow {
    dedup_key: String,
    event_type: String,
    processing_started_at: OffsetDateTime,
    error_message: Option<String>,
}

/// Service for running subscription invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_active_subscription().await?);
        violations.extend(self.check_entitlement_window_valid().await?);
        violations.extend(self.check_projection_not_behind_ledger().await?);
        violations.extend(self.check_ledger_reference_unique().await?);
        violations.extend(self.check_no_stuck_webhook_events().await?);
        violations.extend(self.check_no_unreplayed_failures().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: At most one active subscription per email
    ///
    /// More than one projection row would make "is this customer entitled"
    /// ambiguous. The unique index makes this structurally impossible; a
    /// violation means the schema itself has been tampered with.
    async fn check_single_active_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateProjectionRow> = sqlx::query_as(
            r#"
            SELECT email, COUNT(*) as row_count
            FROM active_subscriptions
            GROUP BY email
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_subscription".to_string(),
                emails: vec![row.email],
                description: format!(
                    "Email has {} active subscription rows (expected at most 1)",
                    row.row_count
                ),
                context: serde_json::json!({
                    "row_count": row.row_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Entitlement windows run forward
    ///
    /// `expires_on` must be strictly after `paid_on` in both the ledger and
    /// the projection.
    async fn check_entitlement_window_valid(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<InvertedWindowRow> = sqlx::query_as(
            r#"
            SELECT 'transactions' AS source, email, paid_on, expires_on
            FROM transactions
            WHERE expires_on <= paid_on
            UNION ALL
            SELECT 'active_subscriptions' AS source, email, paid_on, expires_on
            FROM active_subscriptions
            WHERE expires_on <= paid_on
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "entitlement_window_valid".to_string(),
                emails: vec![row.email],
                description: format!(
                    "{} row has expires_on ({}) at or before paid_on ({})",
                    row.source, row.expires_on, row.paid_on
                ),
                context: serde_json::json!({
                    "source": row.source,
                    "paid_on": row.paid_on.to_string(),
                    "expires_on": row.expires_on.to_string(),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: Projection reflects the newest ledger entry
    ///
    /// A projection row older than the ledger's latest payment for the same
    /// email means a reconciliation died between the ledger append and the
    /// entitlement overwrite; replay should converge it.
    async fn check_projection_not_behind_ledger(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ProjectionBehindRow> = sqlx::query_as(
            r#"
            SELECT
                s.email,
                s.paid_on AS projection_paid_on,
                t.max_paid_on AS ledger_paid_on
            FROM active_subscriptions s
            JOIN (
                SELECT email, MAX(paid_on) AS max_paid_on
                FROM transactions
                GROUP BY email
            ) t ON t.email = s.email
            WHERE s.paid_on < t.max_paid_on
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "projection_not_behind_ledger".to_string(),
                emails: vec![row.email],
                description: format!(
                    "Active subscription paid_on ({}) is behind the ledger's newest payment ({})",
                    row.projection_paid_on, row.ledger_paid_on
                ),
                context: serde_json::json!({
                    "projection_paid_on": row.projection_paid_on.to_string(),
                    "ledger_paid_on": row.ledger_paid_on.to_string(),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: Gateway references are unique in the ledger
    ///
    /// A duplicate means the dedup guard was bypassed and a payment was
    /// double-recorded.
    async fn check_ledger_reference_unique(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateReferenceRow> = sqlx::query_as(
            r#"
            SELECT gateway_reference, COUNT(*) as row_count
            FROM transactions
            GROUP BY gateway_reference
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "ledger_reference_unique".to_string(),
                emails: vec![],
                description: format!(
                    "Gateway reference '{}' appears {} times in the ledger",
                    row.gateway_reference, row.row_count
                ),
                context: serde_json::json!({
                    "gateway_reference": row.gateway_reference,
                    "row_count": row.row_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: No webhook events stuck in 'processing'
    ///
    /// A claim older than the stuck threshold means a reconciliation died
    /// without recording an outcome.
    async fn check_no_stuck_webhook_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleEventRow> = sqlx::query_as(
            r#"
            SELECT dedup_key, event_type, processing_started_at, error_message
            FROM gateway_webhook_events
            WHERE processing_result = 'processing'
              AND processing_started_at < NOW() - INTERVAL '30 minutes'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_webhook_events".to_string(),
                emails: vec![],
                description: format!(
                    "Event '{}' has been in 'processing' since {}",
                    row.dedup_key, row.processing_started_at
                ),
                context: serde_json::json!({
                    "dedup_key": row.dedup_key,
                    "event_type": row.event_type,
                    "processing_started_at": row.processing_started_at.to_string(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 6: Errored events get replayed
    ///
    /// Errors are expected under partial failure; errors that sit for over
    /// an hour mean the replay job is not keeping up (or keeps failing).
    async fn check_no_unreplayed_failures(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleEventRow> = sqlx::query_as(
            r#"
            SELECT dedup_key, event_type, processing_started_at, error_message
            FROM gateway_webhook_events
            WHERE processing_result = 'error'
              AND processing_started_at < NOW() - INTERVAL '1 hour'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_unreplayed_failures".to_string(),
                emails: vec![],
                description: format!(
                    "Event '{}' has been in 'error' for over an hour: {}",
                    row.dedup_key,
                    row.error_message.as_deref().unwrap_or("(no message)")
                ),
                context: serde_json::json!({
                    "dedup_key": row.dedup_key,
                    "event_type": row.event_type,
                    "error_message": row.error_message,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_active_subscription" => self.check_single_active_subscription().await,
            "entitlement_window_valid" => self.check_entitlement_window_valid().await,
            "projection_not_behind_ledger" => self.check_projection_not_behind_ledger().await,
            "ledger_reference_unique" => self.check_ledger_reference_unique().await,
            "no_stuck_webhook_events" => self.check_no_stuck_webhook_events().await,
            "no_unreplayed_failures" => self.check_no_unreplayed_failures().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_active_subscription",
            "entitlement_window_valid",
            "projection_not_behind_ledger",
            "ledger_reference_unique",
            "no_stuck_webhook_events",
            "no_unreplayed_failures",
        ]
    }
}
