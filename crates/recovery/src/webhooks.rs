//! Stripe webhook handling
//!
//! Turns `invoice.payment_failed` and `invoice.payment_succeeded` events into
//! record store writes, stats deltas and recovery messages. Every other event
//! type is acknowledged and ignored.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classifier::{classify_optional, DeclineType, UNKNOWN_FAILURE_CODE};
use crate::collaborators::AccountActivity;
use crate::dispatcher::{DispatchOutcome, NotificationDispatcher};
use crate::error::{RecoveryError, RecoveryResult};
use crate::records::{CountedEvent, NewFailedPayment, RecordStore};
use crate::stats::StatsAggregator;

pub const PAYMENT_FAILED: &str = "invoice.payment_failed";
pub const PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";

/// Webhook envelope. Only the fields the pipeline reads are modelled.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: InvoiceObject,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceObject {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_phone: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub amount_due: Option<i64>,
    #[serde(default)]
    pub amount_paid: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub charge: Option<ChargeRef>,
}

/// The invoice's charge, either expanded or as a bare ID
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChargeRef {
    Expanded(ChargeDetails),
    Id(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChargeDetails {
    #[serde(default)]
    pub failure_code: Option<String>,
    #[serde(default)]
    pub failure_message: Option<String>,
}

impl InvoiceObject {
    fn charge_details(&self) -> Option<&ChargeDetails> {
        match self.charge.as_ref()? {
            ChargeRef::Expanded(details) => Some(details),
            ChargeRef::Id(_) => None,
        }
    }

    pub fn failure_code(&self) -> Option<&str> {
        self.charge_details()?.failure_code.as_deref()
    }

    pub fn failure_message(&self) -> Option<&str> {
        self.charge_details()?.failure_message.as_deref()
    }
}

fn required<'a>(value: &'a Option<String>, field: &str) -> RecoveryResult<&'a str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RecoveryError::Validation(format!("Missing required field: {}", field)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IgnoreReason {
    HardDecline { failure_code: String },
    InactiveAccount,
    DuplicateFailure { payment_id: Uuid },
    /// Success event for an invoice with no open failed payment
    NothingToResolve,
    UnhandledEventType { event_type: String },
}

/// What a webhook event led to. Every variant is acknowledged with 200.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    PaymentRecorded {
        payment_id: Uuid,
        dispatch: Option<DispatchOutcome>,
        /// Set when dispatch failed; the payment stays pending
        dispatch_error: Option<String>,
    },
    PaymentRecovered {
        provider_invoice_id: String,
        amount_cents: i64,
    },
    Ignored {
        reason: IgnoreReason,
    },
}

impl WebhookOutcome {
    fn ignored(reason: IgnoreReason) -> Self {
        Self::Ignored { reason }
    }
}

/// Webhook handler for Stripe invoice events
pub struct WebhookHandler {
    records: Arc<dyn RecordStore>,
    stats: StatsAggregator,
    dispatcher: Arc<NotificationDispatcher>,
    activity: Arc<dyn AccountActivity>,
}

impl WebhookHandler {
    pub fn new(
        records: Arc<dyn RecordStore>,
        stats: StatsAggregator,
        dispatcher: Arc<NotificationDispatcher>,
        activity: Arc<dyn AccountActivity>,
    ) -> Self {
        Self {
            records,
            stats,
            dispatcher,
            activity,
        }
    }

    /// Parse a raw webhook body
    pub fn parse_event(payload: &[u8]) -> RecoveryResult<WebhookEvent> {
        serde_json::from_slice(payload)
            .map_err(|e| RecoveryError::Validation(format!("Malformed webhook payload: {}", e)))
    }

    /// Handle a parsed event
    ///
    /// Only validation and storage failures are returned as errors (plus an
    /// unreachable account-activity service); everything else is reported
    /// through the outcome.
    pub async fn handle_event(&self, event: &WebhookEvent) -> RecoveryResult<WebhookOutcome> {
        tracing::info!(
            event_type = %event.event_type,
            event_id = ?event.id,
            invoice_id = ?event.data.object.id,
            "Processing webhook event"
        );

        match event.event_type.as_str() {
            PAYMENT_FAILED => self.handle_payment_failed(&event.data.object).await,
            PAYMENT_SUCCEEDED => self.handle_payment_succeeded(&event.data.object).await,
            other => {
                tracing::debug!(event_type = %other, "Unhandled webhook event type");
                Ok(WebhookOutcome::ignored(IgnoreReason::UnhandledEventType {
                    event_type: other.to_string(),
                }))
            }
        }
    }

    async fn handle_payment_failed(&self, invoice: &InvoiceObject) -> RecoveryResult<WebhookOutcome> {
        let invoice_id = required(&invoice.id, "id")?;
        let failure_code = invoice.failure_code();

        if classify_optional(failure_code) == DeclineType::Hard {
            let code = failure_code.unwrap_or(UNKNOWN_FAILURE_CODE);
            tracing::info!(
                invoice_id = %invoice_id,
                failure_code = %code,
                "Hard decline - not attempting recovery"
            );
            return Ok(WebhookOutcome::ignored(IgnoreReason::HardDecline {
                failure_code: code.to_string(),
            }));
        }

        let customer_id = required(&invoice.customer, "customer")?;
        let new_payment = NewFailedPayment {
            provider_invoice_id: invoice_id.to_string(),
            provider_customer_id: customer_id.to_string(),
            customer_email: required(&invoice.customer_email, "customer_email")?.to_string(),
            customer_name: invoice.customer_name.clone(),
            customer_phone: invoice.customer_phone.clone(),
            amount_cents: invoice.amount_due.ok_or_else(|| {
                RecoveryError::Validation("Missing required field: amount_due".to_string())
            })?,
            currency: required(&invoice.currency, "currency")?.to_string(),
            failure_code: failure_code.unwrap_or(UNKNOWN_FAILURE_CODE).to_string(),
            failure_message: invoice.failure_message().unwrap_or_default().to_string(),
            decline_type: DeclineType::Soft,
            account_active: true,
        };
        new_payment.validate()?;

        if !self.activity.is_active(customer_id).await? {
            tracing::info!(
                invoice_id = %invoice_id,
                customer_id = %customer_id,
                "Customer account inactive - not attempting recovery"
            );
            return Ok(WebhookOutcome::ignored(IgnoreReason::InactiveAccount));
        }

        // Redeliveries find the claim taken unless an earlier stats write failed
        let inserted = self.records.insert(&new_payment).await?;
        if !self
            .count_once(inserted.id, CountedEvent::SoftDecline, 0)
            .await?
        {
            tracing::info!(
                invoice_id = %invoice_id,
                payment_id = %inserted.id,
                "Failed payment already recorded - duplicate event"
            );
            return Ok(WebhookOutcome::ignored(IgnoreReason::DuplicateFailure {
                payment_id: inserted.id,
            }));
        }
        if !inserted.created {
            tracing::info!(
                invoice_id = %invoice_id,
                payment_id = %inserted.id,
                "Resuming failed payment left incomplete by an earlier delivery"
            );
        }

        tracing::warn!(
            invoice_id = %invoice_id,
            payment_id = %inserted.id,
            amount = new_payment.amount_cents,
            failure_code = %new_payment.failure_code,
            "Soft decline recorded"
        );

        let payment = self.records.get(inserted.id).await?.ok_or_else(|| {
            RecoveryError::Database(format!("Payment {} vanished after insert", inserted.id))
        })?;

        match self.dispatcher.dispatch(&payment).await {
            Ok(outcome) => Ok(WebhookOutcome::PaymentRecorded {
                payment_id: inserted.id,
                dispatch: Some(outcome),
                dispatch_error: None,
            }),
            Err(e) if e.is_storage() => Err(e),
            Err(e) => {
                tracing::warn!(
                    payment_id = %inserted.id,
                    error = %e,
                    "Recovery message not sent - acknowledging webhook anyway"
                );
                Ok(WebhookOutcome::PaymentRecorded {
                    payment_id: inserted.id,
                    dispatch: None,
                    dispatch_error: Some(e.to_string()),
                })
            }
        }
    }

    async fn handle_payment_succeeded(
        &self,
        invoice: &InvoiceObject,
    ) -> RecoveryResult<WebhookOutcome> {
        let invoice_id = required(&invoice.id, "id")?;
        let amount_paid = invoice.amount_paid.unwrap_or(0);
        if amount_paid < 0 {
            return Err(RecoveryError::Validation(format!(
                "amount_paid must be >= 0, got {}",
                amount_paid
            )));
        }

        let transitioned = self.records.mark_resolved(invoice_id).await?;
        let payment = match self.records.find_by_invoice(invoice_id).await? {
            Some(payment) => payment,
            None => {
                tracing::debug!(
                    invoice_id = %invoice_id,
                    "No failed payment for invoice - nothing to resolve"
                );
                return Ok(WebhookOutcome::ignored(IgnoreReason::NothingToResolve));
            }
        };

        if !self
            .count_once(payment.id, CountedEvent::Recovery, amount_paid)
            .await?
        {
            tracing::debug!(
                invoice_id = %invoice_id,
                "Failed payment already resolved and counted - nothing to resolve"
            );
            return Ok(WebhookOutcome::ignored(IgnoreReason::NothingToResolve));
        }
        if !transitioned {
            tracing::info!(
                invoice_id = %invoice_id,
                payment_id = %payment.id,
                "Counting recovery left uncounted by an earlier delivery"
            );
        }

        tracing::info!(
            invoice_id = %invoice_id,
            amount = amount_paid,
            "Payment recovered"
        );

        Ok(WebhookOutcome::PaymentRecovered {
            provider_invoice_id: invoice_id.to_string(),
            amount_cents: amount_paid,
        })
    }

    /// Count `event` for a payment at most once.
    ///
    /// The claim is released when the stats write fails, so the error
    /// surfaces to the provider and its redelivery can count the event.
    async fn count_once(
        &self,
        payment_id: Uuid,
        event: CountedEvent,
        amount_cents: i64,
    ) -> RecoveryResult<bool> {
        if !self.records.claim_count(payment_id, event).await? {
            return Ok(false);
        }

        if let Err(e) = self.stats.record_event(event.stats_kind(), amount_cents).await {
            if let Err(release_err) = self.records.release_count(payment_id, event).await {
                tracing::error!(
                    payment_id = %payment_id,
                    event = event.stats_kind().as_str(),
                    error = %release_err,
                    "Failed to release stats claim - event stays uncounted"
                );
            }
            return Err(e);
        }

        Ok(true)
    }
}
