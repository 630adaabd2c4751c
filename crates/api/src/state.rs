//! Application state

use std::sync::Arc;

use netpass_billing::BillingService;
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let billing = Arc::new(BillingService::new(config.gateway.clone(), pool.clone()));
        tracing::info!("Billing service initialized");

        Self {
            pool,
            config,
            billing,
        }
    }
}
