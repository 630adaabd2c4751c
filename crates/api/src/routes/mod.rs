//! HTTP routes

pub mod payments;
pub mod subscriptions;
pub mod webhooks;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/webhooks/gateway", post(webhooks::gateway_webhook))
        .route("/api/payments/initialize", post(payments::initialize))
        .route("/api/payments/verify/{reference}", get(payments::verify))
        .route(
            "/api/subscriptions/{email}/status",
            get(subscriptions::status),
        )
        .route(
            "/api/subscriptions/{email}/history",
            get(subscriptions::history),
        )
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let database_up = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    Json(serde_json::json!({
        "status": if database_up { "ok" } else { "degraded" },
        "database": database_up,
    }))
}
