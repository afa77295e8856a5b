//! In-memory stores
//!
//! Used by tests and local development. Each operation takes the single lock
//! for its whole duration, which gives the same per-operation atomicity the
//! Postgres statements provide.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use time::{Date, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{RecoveryError, RecoveryResult};
use crate::records::{
    CountedEvent, FailedPayment, InsertResult, MessageSent, NewFailedPayment, NewMessage,
    PaymentStatus, PaymentWithMessageCount, RecordStore,
};
use crate::stats::{DailyStats, StatsDelta, StatsStore};

#[derive(Debug, Default)]
struct RecordTables {
    payments: HashMap<Uuid, FailedPayment>,
    by_invoice: HashMap<String, Uuid>,
    messages: Vec<MessageSent>,
    counted: HashSet<(Uuid, CountedEvent)>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryRecordStore {
    tables: Arc<Mutex<RecordTables>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored payments
    pub async fn len(&self) -> usize {
        self.tables.lock().await.payments.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert(&self, payment: &NewFailedPayment) -> RecoveryResult<InsertResult> {
        let currency = payment.validate()?;
        let mut tables = self.tables.lock().await;

        if let Some(existing) = tables.by_invoice.get(&payment.provider_invoice_id) {
            return Ok(InsertResult {
                id: *existing,
                created: false,
            });
        }

        let id = Uuid::new_v4();
        let row = FailedPayment {
            id,
            provider_invoice_id: payment.provider_invoice_id.clone(),
            provider_customer_id: payment.provider_customer_id.clone(),
            customer_email: payment.customer_email.clone(),
            customer_name: payment.customer_name.clone(),
            customer_phone: payment.customer_phone.clone(),
            amount_cents: payment.amount_cents,
            currency,
            failure_code: payment.failure_code.clone(),
            failure_message: payment.failure_message.clone(),
            decline_type: payment.decline_type,
            account_active: payment.account_active,
            status: PaymentStatus::Pending,
            created_at: OffsetDateTime::now_utc(),
            resolved_at: None,
        };

        tables
            .by_invoice
            .insert(payment.provider_invoice_id.clone(), id);
        tables.payments.insert(id, row);

        Ok(InsertResult { id, created: true })
    }

    async fn mark_contacted(&self, id: Uuid, message: &NewMessage) -> RecoveryResult<bool> {
        let mut tables = self.tables.lock().await;

        let status = tables
            .payments
            .get(&id)
            .map(|p| p.status)
            .ok_or_else(|| RecoveryError::NotFound(format!("Failed payment {} not found", id)))?;

        tables.messages.push(MessageSent {
            id: Uuid::new_v4(),
            failed_payment_id: id,
            channel: message.channel,
            content: message.content.clone(),
            provider_message_id: message.provider_message_id.clone(),
            sent_at: OffsetDateTime::now_utc(),
            status: "sent".to_string(),
        });

        if !status.can_transition_to(PaymentStatus::Contacted) {
            return Ok(false);
        }
        if let Some(payment) = tables.payments.get_mut(&id) {
            payment.status = PaymentStatus::Contacted;
        }
        Ok(true)
    }

    async fn mark_resolved(&self, provider_invoice_id: &str) -> RecoveryResult<bool> {
        let mut tables = self.tables.lock().await;

        let Some(id) = tables.by_invoice.get(provider_invoice_id).copied() else {
            return Ok(false);
        };
        let Some(payment) = tables.payments.get_mut(&id) else {
            return Ok(false);
        };
        if !payment.status.can_transition_to(PaymentStatus::Resolved) {
            return Ok(false);
        }

        payment.status = PaymentStatus::Resolved;
        payment.resolved_at = Some(OffsetDateTime::now_utc());
        Ok(true)
    }

    async fn claim_count(&self, id: Uuid, event: CountedEvent) -> RecoveryResult<bool> {
        let mut tables = self.tables.lock().await;
        if !tables.payments.contains_key(&id) {
            return Ok(false);
        }
        Ok(tables.counted.insert((id, event)))
    }

    async fn release_count(&self, id: Uuid, event: CountedEvent) -> RecoveryResult<()> {
        self.tables.lock().await.counted.remove(&(id, event));
        Ok(())
    }

    async fn get(&self, id: Uuid) -> RecoveryResult<Option<FailedPayment>> {
        Ok(self.tables.lock().await.payments.get(&id).cloned())
    }

    async fn find_by_invoice(
        &self,
        provider_invoice_id: &str,
    ) -> RecoveryResult<Option<FailedPayment>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .by_invoice
            .get(provider_invoice_id)
            .and_then(|id| tables.payments.get(id))
            .cloned())
    }

    async fn list_recent(&self, limit: i64) -> RecoveryResult<Vec<PaymentWithMessageCount>> {
        let tables = self.tables.lock().await;

        let mut payments: Vec<&FailedPayment> = tables.payments.values().collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(payments
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|payment| PaymentWithMessageCount {
                message_count: tables
                    .messages
                    .iter()
                    .filter(|m| m.failed_payment_id == payment.id)
                    .count() as i64,
                payment: payment.clone(),
            })
            .collect())
    }

    async fn list_messages(&self, payment_id: Uuid) -> RecoveryResult<Vec<MessageSent>> {
        Ok(self
            .tables
            .lock()
            .await
            .messages
            .iter()
            .filter(|m| m.failed_payment_id == payment_id)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStatsStore {
    days: Arc<Mutex<BTreeMap<Date, DailyStats>>>,
}

impl InMemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatsStore for InMemoryStatsStore {
    async fn apply_delta(&self, date: Date, delta: StatsDelta) -> RecoveryResult<()> {
        self.days
            .lock()
            .await
            .entry(date)
            .or_insert_with(|| DailyStats::empty(date))
            .apply(&delta);
        Ok(())
    }

    async fn days_since(&self, since: Date) -> RecoveryResult<Vec<DailyStats>> {
        Ok(self
            .days
            .lock()
            .await
            .range(since..)
            .map(|(_, day)| day.clone())
            .collect())
    }

    async fn get_day(&self, date: Date) -> RecoveryResult<Option<DailyStats>> {
        Ok(self.days.lock().await.get(&date).cloned())
    }
}
