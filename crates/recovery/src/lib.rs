// Recovery crate clippy configuration
#![allow(clippy::too_many_arguments)] // Dispatcher wiring takes every collaborator
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Winback Recovery Module
//!
//! Detects failed subscription payments from Stripe webhooks and tries to
//! win them back with a friendly message.
//!
//! ## Features
//!
//! - **Classification**: soft declines are recovered, hard declines ignored
//! - **Records**: failed payments and the messages sent for them
//! - **Stats**: per-day rollup updated with atomic deltas
//! - **Dispatch**: AI-composed message, template fallback, WhatsApp then SMS
//! - **Webhooks**: `invoice.payment_failed` and `invoice.payment_succeeded`
//! - **Invariants**: read-only consistency checks

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

pub mod classifier;
pub mod collaborators;
pub mod composer;
pub mod config;
pub mod delivery;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod invariants;
pub mod memory;
pub mod records;
pub mod stats;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;
#[cfg(test)]
mod test_support;

// Classification
pub use classifier::{classify, classify_optional, DeclineType, SOFT_DECLINE_CODES};

// Collaborators
pub use collaborators::{
    AccountActivity, AssumeActive, ComposeError, ComposeRequest, CustomerDirectory,
    DeliveryError, DeliveryReceipt, MessageComposer, MessageDelivery, NoDirectory,
};
pub use composer::{AnthropicComposer, OpenAiComposer, TemplateComposer};
pub use delivery::TwilioDelivery;
pub use directory::StripeCustomerDirectory;

// Config
pub use config::{ComposerConfig, RecoveryConfig, TwilioConfig};

// Dispatch
pub use dispatcher::{DispatchOutcome, NotificationDispatcher, SkipReason};

// Error
pub use error::{RecoveryError, RecoveryResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Stores
pub use memory::{InMemoryRecordStore, InMemoryStatsStore};
pub use records::{
    Channel, CountedEvent, FailedPayment, InsertResult, MessageSent, NewFailedPayment,
    NewMessage, PaymentStatus, PaymentWithMessageCount, PgRecordStore, RecordStore,
};
pub use stats::{
    DailyStats, PgStatsStore, StatsAggregator, StatsDelta, StatsEventKind, StatsStore,
    StatsSummary, StatsTotals, DEFAULT_SUMMARY_DAYS,
};

// Webhooks
pub use webhooks::{IgnoreReason, WebhookEvent, WebhookHandler, WebhookOutcome};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// A payment with every message sent for it
#[derive(Debug, Clone, Serialize)]
pub struct PaymentDetail {
    pub payment: FailedPayment,
    pub messages: Vec<MessageSent>,
}

/// The wired recovery pipeline
pub struct RecoveryService {
    records: Arc<dyn RecordStore>,
    stats: StatsAggregator,
    dispatcher: Arc<NotificationDispatcher>,
    webhooks: WebhookHandler,
}

impl RecoveryService {
    pub fn builder(
        records: Arc<dyn RecordStore>,
        stats: Arc<dyn StatsStore>,
    ) -> RecoveryServiceBuilder {
        RecoveryServiceBuilder::new(records, stats)
    }

    /// Real collaborators from configuration over the given stores
    pub fn from_config(
        config: &RecoveryConfig,
        records: Arc<dyn RecordStore>,
        stats: Arc<dyn StatsStore>,
    ) -> RecoveryResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| RecoveryError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let composer =
            composer::build_composer(&config.composer, client.clone(), &config.payment_update_url);
        let delivery = Arc::new(TwilioDelivery::new(client, config.twilio.clone()));

        let mut builder = Self::builder(records, stats)
            .composer(composer)
            .delivery(delivery)
            .composer_timeout(config.composer_timeout)
            .payment_update_url(config.payment_update_url.clone());

        if let Some(key) = config.stripe_secret_key.as_deref() {
            builder = builder.directory(Arc::new(StripeCustomerDirectory::new(key)));
        }

        tracing::info!(
            composer = config.composer.name(),
            customer_directory = config.stripe_secret_key.is_some(),
            composer_timeout_ms = config.composer_timeout.as_millis() as u64,
            "Recovery pipeline configured"
        );

        builder.build()
    }

    /// Postgres-backed stores with real collaborators
    pub fn postgres(config: &RecoveryConfig, pool: PgPool) -> RecoveryResult<Self> {
        Self::from_config(
            config,
            Arc::new(PgRecordStore::new(pool.clone())),
            Arc::new(PgStatsStore::new(pool)),
        )
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    pub fn webhooks(&self) -> &WebhookHandler {
        &self.webhooks
    }

    pub async fn handle_event(&self, event: &WebhookEvent) -> RecoveryResult<WebhookOutcome> {
        self.webhooks.handle_event(event).await
    }

    pub async fn retry(&self, payment_id: Uuid) -> RecoveryResult<DispatchOutcome> {
        self.dispatcher.retry(payment_id).await
    }

    pub async fn summary(&self, days: i64) -> RecoveryResult<StatsSummary> {
        self.stats.summary(days).await
    }

    pub async fn list_recent(&self, limit: i64) -> RecoveryResult<Vec<PaymentWithMessageCount>> {
        self.records.list_recent(limit).await
    }

    pub async fn payment_detail(&self, payment_id: Uuid) -> RecoveryResult<PaymentDetail> {
        let payment = self
            .records
            .get(payment_id)
            .await?
            .ok_or_else(|| RecoveryError::NotFound(format!("Payment {} not found", payment_id)))?;
        let messages = self.records.list_messages(payment_id).await?;
        Ok(PaymentDetail { payment, messages })
    }
}

/// Builder for [`RecoveryService`]
///
/// Delivery is required. Everything else defaults to the pass-through
/// collaborators: template composer, no directory, every account active.
pub struct RecoveryServiceBuilder {
    records: Arc<dyn RecordStore>,
    stats: Arc<dyn StatsStore>,
    composer: Option<Arc<dyn MessageComposer>>,
    delivery: Option<Arc<dyn MessageDelivery>>,
    directory: Arc<dyn CustomerDirectory>,
    activity: Arc<dyn AccountActivity>,
    composer_timeout: Duration,
    payment_update_url: String,
}

impl RecoveryServiceBuilder {
    fn new(records: Arc<dyn RecordStore>, stats: Arc<dyn StatsStore>) -> Self {
        Self {
            records,
            stats,
            composer: None,
            delivery: None,
            directory: Arc::new(NoDirectory),
            activity: Arc::new(AssumeActive),
            composer_timeout: Duration::from_millis(config::DEFAULT_COMPOSER_TIMEOUT_MS),
            payment_update_url: config::DEFAULT_PAYMENT_UPDATE_URL.to_string(),
        }
    }

    pub fn composer(mut self, composer: Arc<dyn MessageComposer>) -> Self {
        self.composer = Some(composer);
        self
    }

    pub fn delivery(mut self, delivery: Arc<dyn MessageDelivery>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn CustomerDirectory>) -> Self {
        self.directory = directory;
        self
    }

    pub fn activity(mut self, activity: Arc<dyn AccountActivity>) -> Self {
        self.activity = activity;
        self
    }

    pub fn composer_timeout(mut self, timeout: Duration) -> Self {
        self.composer_timeout = timeout;
        self
    }

    pub fn payment_update_url(mut self, url: impl Into<String>) -> Self {
        self.payment_update_url = url.into();
        self
    }

    pub fn build(self) -> RecoveryResult<RecoveryService> {
        let delivery = self
            .delivery
            .ok_or_else(|| RecoveryError::Config("A message delivery provider is required".into()))?;
        let composer = self
            .composer
            .unwrap_or_else(|| Arc::new(TemplateComposer::new(self.payment_update_url.clone())));

        let stats = StatsAggregator::new(self.stats);
        let dispatcher = Arc::new(NotificationDispatcher::new(
            self.records.clone(),
            stats.clone(),
            composer,
            delivery,
            self.directory,
            self.composer_timeout,
            self.payment_update_url,
        ));
        let webhooks = WebhookHandler::new(
            self.records.clone(),
            stats.clone(),
            dispatcher.clone(),
            self.activity,
        );

        Ok(RecoveryService {
            records: self.records,
            stats,
            dispatcher,
            webhooks,
        })
    }
}
