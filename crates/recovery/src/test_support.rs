//! Fake collaborators shared by the unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use time::Date;
use tokio::sync::Mutex;

use crate::classifier::DeclineType;
use crate::collaborators::{
    AccountActivity, ComposeError, ComposeRequest, CustomerDirectory, DeliveryError,
    DeliveryReceipt, MessageComposer, MessageDelivery,
};
use crate::error::{RecoveryError, RecoveryResult};
use crate::memory::InMemoryStatsStore;
use crate::records::{Channel, NewFailedPayment};
use crate::stats::{DailyStats, StatsDelta, StatsStore};

pub fn new_soft_payment(invoice: &str) -> NewFailedPayment {
    NewFailedPayment {
        provider_invoice_id: invoice.to_string(),
        provider_customer_id: "cus_1".to_string(),
        customer_email: "test@example.com".to_string(),
        customer_name: None,
        customer_phone: Some("+15551234567".to_string()),
        amount_cents: 4999,
        currency: "usd".to_string(),
        failure_code: "insufficient_funds".to_string(),
        failure_message: "Your card has insufficient funds.".to_string(),
        decline_type: DeclineType::Soft,
        account_active: true,
    }
}

/// Returns the same text, or the same failure, every time
pub struct FixedComposer {
    text: Option<String>,
}

impl FixedComposer {
    pub fn ok(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
        }
    }

    pub fn failing() -> Self {
        Self { text: None }
    }
}

#[async_trait]
impl MessageComposer for FixedComposer {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn compose(&self, _request: &ComposeRequest) -> Result<String, ComposeError> {
        self.text
            .clone()
            .ok_or_else(|| ComposeError::Http("connection reset".to_string()))
    }
}

/// Never answers inside any sane timeout
pub struct SlowComposer(pub Duration);

#[async_trait]
impl MessageComposer for SlowComposer {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn compose(&self, _request: &ComposeRequest) -> Result<String, ComposeError> {
        tokio::time::sleep(self.0).await;
        Ok("too late".to_string())
    }
}

#[derive(Default)]
struct DeliveryLog {
    attempts: Vec<Channel>,
    phones: Vec<String>,
}

/// Accepts or rejects per channel and records every attempt
pub struct ScriptedDelivery {
    rejected: Vec<Channel>,
    unreachable: bool,
    log: Mutex<DeliveryLog>,
}

impl ScriptedDelivery {
    pub fn accepting() -> Self {
        Self::rejecting(&[])
    }

    pub fn rejecting(channels: &[Channel]) -> Self {
        Self {
            rejected: channels.to_vec(),
            unreachable: false,
            log: Mutex::new(DeliveryLog::default()),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            rejected: Vec::new(),
            unreachable: true,
            log: Mutex::new(DeliveryLog::default()),
        }
    }

    pub async fn attempts(&self) -> Vec<Channel> {
        self.log.lock().await.attempts.clone()
    }

    pub async fn phones(&self) -> Vec<String> {
        self.log.lock().await.phones.clone()
    }
}

#[async_trait]
impl MessageDelivery for ScriptedDelivery {
    async fn send(
        &self,
        phone: &str,
        _text: &str,
        channel: Channel,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        {
            let mut log = self.log.lock().await;
            log.attempts.push(channel);
            log.phones.push(phone.to_string());
        }

        if self.unreachable {
            return Err(DeliveryError::Transport("connection refused".to_string()));
        }
        if self.rejected.contains(&channel) {
            return Err(DeliveryError::Rejected {
                channel,
                status: 400,
                message: "not deliverable".to_string(),
            });
        }
        Ok(DeliveryReceipt {
            channel,
            provider_message_id: Some(format!("SM-{}", channel)),
        })
    }
}

pub struct StaticDirectory {
    phone: Option<String>,
    fail: bool,
}

impl StaticDirectory {
    pub fn found(phone: &str) -> Self {
        Self {
            phone: Some(phone.to_string()),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            phone: None,
            fail: true,
        }
    }
}

#[async_trait]
impl CustomerDirectory for StaticDirectory {
    async fn lookup_phone(&self, _customer_id: &str) -> RecoveryResult<Option<String>> {
        if self.fail {
            return Err(RecoveryError::Collaborator("directory unavailable".to_string()));
        }
        Ok(self.phone.clone())
    }
}

/// Fixed answer for every customer, or an error
pub enum StaticActivity {
    Active,
    Inactive,
    Failing,
}

#[async_trait]
impl AccountActivity for StaticActivity {
    async fn is_active(&self, _customer_id: &str) -> RecoveryResult<bool> {
        match self {
            Self::Active => Ok(true),
            Self::Inactive => Ok(false),
            Self::Failing => Err(RecoveryError::Collaborator(
                "activity service unavailable".to_string(),
            )),
        }
    }
}

/// In-memory rollup whose next `n` writes fail
#[derive(Default)]
pub struct FlakyStats {
    inner: InMemoryStatsStore,
    failures_left: AtomicUsize,
}

impl FlakyStats {
    pub fn failing_next(n: usize) -> Self {
        Self {
            inner: InMemoryStatsStore::new(),
            failures_left: AtomicUsize::new(n),
        }
    }

    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl StatsStore for FlakyStats {
    async fn apply_delta(&self, date: Date, delta: StatsDelta) -> RecoveryResult<()> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RecoveryError::Database("connection reset".to_string()));
        }
        self.inner.apply_delta(date, delta).await
    }

    async fn days_since(&self, since: Date) -> RecoveryResult<Vec<DailyStats>> {
        self.inner.days_since(since).await
    }

    async fn get_day(&self, date: Date) -> RecoveryResult<Option<DailyStats>> {
        self.inner.get_day(date).await
    }
}
