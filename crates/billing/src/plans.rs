//! Price tiers and expiry calculation

use time::{Duration, OffsetDateTime};

/// One price-to-duration mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PlanTier {
    /// Exact amount in minor currency units that buys this tier.
    pub amount: i64,
    /// Access window length in days.
    pub duration_days: i64,
    /// Category label recorded on the ledger and the entitlement projection.
    pub label: &'static str,
}

impl PlanTier {
    pub fn duration(&self) -> Duration {
        Duration::days(self.duration_days)
    }
}

/// The fixed price table. Extending the catalog means adding a row here;
/// no caller logic changes.
///
/// Amounts that match no tier fall back to the shortest duration rather than
/// erroring. This is intentional fail-safe-short behavior: an unrecognized
/// payment still buys a day of access instead of being dropped on the floor.
/// TODO(product): confirm whether unmatched amounts should instead be
/// rejected and refunded, or whether a tier is missing from this table.
pub const PLAN_TIERS: &[PlanTier] = &[
    PlanTier {
        amount: 500,
        duration_days: 1,
        label: "day-pass",
    },
    PlanTier {
        amount: 11_000,
        duration_days: 30,
        label: "monthly",
    },
    PlanTier {
        amount: 25_000,
        duration_days: 90,
        label: "quarterly",
    },
];

/// Fallback window for amounts matching no tier.
const DEFAULT_DURATION_DAYS: i64 = 1;

/// Look up the tier an amount buys, if any.
pub fn tier_for_amount(amount: i64) -> Option<&'static PlanTier> {
    PLAN_TIERS.iter().find(|tier| tier.amount == amount)
}

/// The service label recorded for a paid amount.
///
/// Unmatched amounts are labelled as the shortest tier they default into.
pub fn service_for_amount(amount: i64) -> &'static str {
    tier_for_amount(amount).map_or(PLAN_TIERS[0].label, |tier| tier.label)
}

/// Map a paid amount to the end of its access window.
///
/// Pure and deterministic: `paid_on + tier duration`, with unmatched amounts
/// defaulting to a single day (see [`PLAN_TIERS`]).
pub fn compute_expiry(amount: i64, paid_on: OffsetDateTime) -> OffsetDateTime {
    let duration = tier_for_amount(amount)
        .map(PlanTier::duration)
        .unwrap_or_else(|| Duration::days(DEFAULT_DURATION_DAYS));
    paid_on + duration
}
