//! Dashboard JSON endpoints

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, Query, State,
    },
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use winback_recovery::{
    DispatchOutcome, InvariantCheckSummary, PaymentDetail, PaymentWithMessageCount, StatsSummary,
    DEFAULT_SUMMARY_DAYS,
};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const MAX_SUMMARY_DAYS: i64 = 365;
const DEFAULT_PAYMENTS_LIMIT: i64 = 50;
const MAX_PAYMENTS_LIMIT: i64 = 200;

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PaymentsQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RetryRequest {
    pub payment_id: Uuid,
}

#[derive(Serialize)]
pub struct PaymentsResponse {
    payments: Vec<PaymentWithMessageCount>,
}

#[derive(Serialize)]
pub struct RetryResponse {
    success: bool,
    outcome: DispatchOutcome,
}

/// Per-day rollup plus totals for the last `days` days
pub async fn get_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<StatsSummary>> {
    let days = query
        .days
        .unwrap_or(DEFAULT_SUMMARY_DAYS)
        .clamp(1, MAX_SUMMARY_DAYS);
    Ok(Json(state.recovery.summary(days).await?))
}

/// Most recent failed payments, newest first
pub async fn list_payments(
    State(state): State<AppState>,
    Query(query): Query<PaymentsQuery>,
) -> ApiResult<Json<PaymentsResponse>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAYMENTS_LIMIT)
        .clamp(1, MAX_PAYMENTS_LIMIT);
    let payments = state.recovery.list_recent(limit).await?;
    Ok(Json(PaymentsResponse { payments }))
}

pub async fn get_payment(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<PaymentDetail>> {
    let Path(id) = id?;
    Ok(Json(state.recovery.payment_detail(id).await?))
}

/// Manually re-send the recovery message for a payment
pub async fn retry_payment(
    State(state): State<AppState>,
    request: Result<Json<RetryRequest>, JsonRejection>,
) -> ApiResult<Json<RetryResponse>> {
    let Json(request) = request?;
    let outcome = state.recovery.retry(request.payment_id).await?;
    Ok(Json(RetryResponse {
        success: true,
        outcome,
    }))
}

pub async fn get_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let checker = state.invariants.as_ref().ok_or_else(|| {
        ApiError::ServiceUnavailable("Invariant checks require a Postgres database".to_string())
    })?;
    Ok(Json(checker.run_all_checks().await?))
}
