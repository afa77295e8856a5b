//! HTTP routes

mod dashboard;
mod health;
mod webhook;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub use dashboard::{
    get_invariants, get_payment, get_stats, list_payments, retry_payment, PaymentsQuery,
    RetryRequest, StatsQuery,
};
pub use health::health_check;
pub use webhook::stripe_webhook;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/webhook/stripe", post(stripe_webhook))
        .route("/api/stats", get(get_stats))
        .route("/api/payments", get(list_payments))
        .route("/api/payments/{id}", get(get_payment))
        .route("/api/retry", post(retry_payment))
        .route("/api/invariants", get(get_invariants))
        .with_state(state)
}
