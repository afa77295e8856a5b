//! Stripe webhook receiver
//!
//! Acknowledges every well-formed event with 200, including skipped ones;
//! Stripe retries anything else.

use axum::{body::Bytes, extract::State, Json};
use serde::Serialize;
use winback_recovery::{WebhookHandler, WebhookOutcome};

use crate::{error::ApiResult, state::AppState};

#[derive(Serialize)]
pub struct WebhookAck {
    received: bool,
    outcome: WebhookOutcome,
}

pub async fn stripe_webhook(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let event = WebhookHandler::parse_event(&body).inspect_err(|e| {
        tracing::warn!(error = %e, payload_len = body.len(), "Rejected webhook payload");
    })?;

    let outcome = state.recovery.handle_event(&event).await?;

    Ok(Json(WebhookAck {
        received: true,
        outcome,
    }))
}
