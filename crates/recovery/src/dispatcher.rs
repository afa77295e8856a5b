//! Notification dispatcher
//!
//! Resolves a phone number, composes the message, delivers it and records
//! the result. Holds no state of its own; every mutation goes through the
//! record store and the stats aggregator.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::collaborators::{
    ComposeRequest, CustomerDirectory, DeliveryError, DeliveryReceipt, MessageComposer,
    MessageDelivery,
};
use crate::composer::fallback_message;
use crate::error::{RecoveryError, RecoveryResult};
use crate::records::{Channel, FailedPayment, NewMessage, RecordStore};
use crate::stats::{StatsAggregator, StatsEventKind};

/// Composer name reported when the fixed template was used
pub const TEMPLATE_SOURCE: &str = "template";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No phone on the event and none in the directory
    NoContactMethod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Sent {
        channel: Channel,
        provider_message_id: Option<String>,
        composed_by: String,
        /// False when the payment was already contacted or resolved
        status_changed: bool,
    },
    Skipped {
        reason: SkipReason,
    },
}

pub struct NotificationDispatcher {
    records: Arc<dyn RecordStore>,
    stats: StatsAggregator,
    composer: Arc<dyn MessageComposer>,
    delivery: Arc<dyn MessageDelivery>,
    directory: Arc<dyn CustomerDirectory>,
    composer_timeout: Duration,
    payment_update_url: String,
}

impl NotificationDispatcher {
    pub fn new(
        records: Arc<dyn RecordStore>,
        stats: StatsAggregator,
        composer: Arc<dyn MessageComposer>,
        delivery: Arc<dyn MessageDelivery>,
        directory: Arc<dyn CustomerDirectory>,
        composer_timeout: Duration,
        payment_update_url: String,
    ) -> Self {
        Self {
            records,
            stats,
            composer,
            delivery,
            directory,
            composer_timeout,
            payment_update_url,
        }
    }

    /// Compose and deliver a recovery message for `payment`.
    ///
    /// A total delivery failure is returned as an error and leaves the
    /// payment untouched, so it stays eligible for a manual retry.
    pub async fn dispatch(&self, payment: &FailedPayment) -> RecoveryResult<DispatchOutcome> {
        let Some(phone) = self.resolve_phone(payment).await else {
            tracing::info!(
                payment_id = %payment.id,
                customer_id = %payment.provider_customer_id,
                "No phone number available - skipping recovery message"
            );
            return Ok(DispatchOutcome::Skipped {
                reason: SkipReason::NoContactMethod,
            });
        };

        let request = ComposeRequest::new(
            &payment.display_name(),
            payment.amount_cents,
            &payment.currency,
        );
        let (text, composed_by) = self.compose(&request).await;

        let receipt = self.deliver(&phone, &text).await.inspect_err(|e| {
            tracing::error!(
                payment_id = %payment.id,
                error = %e,
                "Recovery message delivery failed - payment left for manual retry"
            );
        })?;

        let status_changed = self
            .records
            .mark_contacted(
                payment.id,
                &NewMessage {
                    channel: receipt.channel,
                    content: text,
                    provider_message_id: receipt.provider_message_id.clone(),
                },
            )
            .await?;

        self.stats.record_event(StatsEventKind::MessageSent, 0).await?;

        tracing::info!(
            payment_id = %payment.id,
            channel = %receipt.channel,
            composed_by = %composed_by,
            status_changed = status_changed,
            "Recovery message sent"
        );

        Ok(DispatchOutcome::Sent {
            channel: receipt.channel,
            provider_message_id: receipt.provider_message_id,
            composed_by,
            status_changed,
        })
    }

    /// Manually re-run dispatch for an existing payment
    pub async fn retry(&self, payment_id: Uuid) -> RecoveryResult<DispatchOutcome> {
        let payment = self
            .records
            .get(payment_id)
            .await?
            .ok_or_else(|| RecoveryError::NotFound(format!("Payment {} not found", payment_id)))?;

        tracing::info!(
            payment_id = %payment.id,
            status = %payment.status,
            "Manual retry of recovery message"
        );

        self.dispatch(&payment).await
    }

    async fn resolve_phone(&self, payment: &FailedPayment) -> Option<String> {
        if let Some(phone) = payment
            .customer_phone
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            return Some(phone.to_string());
        }

        match self
            .directory
            .lookup_phone(&payment.provider_customer_id)
            .await
        {
            Ok(phone) => phone,
            Err(e) => {
                tracing::warn!(
                    customer_id = %payment.provider_customer_id,
                    error = %e,
                    "Customer directory lookup failed - treating as no phone"
                );
                None
            }
        }
    }

    async fn compose(&self, request: &ComposeRequest) -> (String, String) {
        let composer = self.composer.name();

        match tokio::time::timeout(self.composer_timeout, self.composer.compose(request)).await {
            Ok(Ok(text)) => return (text, composer.to_string()),
            Ok(Err(e)) => {
                tracing::warn!(composer, error = %e, "Message composer failed - using template");
            }
            Err(_) => {
                tracing::warn!(
                    composer,
                    timeout_ms = self.composer_timeout.as_millis() as u64,
                    "Message composer timed out - using template"
                );
            }
        }

        (
            fallback_message(request, &self.payment_update_url),
            TEMPLATE_SOURCE.to_string(),
        )
    }

    /// WhatsApp first; SMS only when WhatsApp was rejected by the provider
    async fn deliver(&self, phone: &str, text: &str) -> RecoveryResult<DeliveryReceipt> {
        match self.delivery.send(phone, text, Channel::Whatsapp).await {
            Ok(receipt) => return Ok(receipt),
            Err(DeliveryError::Transport(e)) => return Err(RecoveryError::DeliveryTransport(e)),
            Err(rejected) => {
                tracing::info!(error = %rejected, "WhatsApp rejected - falling back to SMS");
            }
        }

        match self.delivery.send(phone, text, Channel::Sms).await {
            Ok(receipt) => Ok(receipt),
            Err(DeliveryError::Transport(e)) => Err(RecoveryError::DeliveryTransport(e)),
            Err(rejected) => Err(RecoveryError::Delivery(rejected.to_string())),
        }
    }
}
