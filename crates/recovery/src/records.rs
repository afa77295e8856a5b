//! Recovery record store
//!
//! Owns the `failed_payments` and `messages_sent` tables. A failed payment
//! moves `pending -> contacted -> resolved` or straight `pending -> resolved`;
//! `resolved` is terminal. Both mutating operations are conditional so that
//! duplicate webhook deliveries and dispatch retries are harmless.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::classifier::DeclineType;
use crate::error::{RecoveryError, RecoveryResult};
use crate::stats::StatsEventKind;

/// ISO 4217 codes accepted for `amount_cents`, lowercase as providers send them
const CURRENCY_CODES: &[&str] = &[
    "aed", "afn", "all", "amd", "ang", "aoa", "ars", "aud", "awg", "azn", "bam", "bbd", "bdt",
    "bgn", "bhd", "bif", "bmd", "bnd", "bob", "brl", "bsd", "btn", "bwp", "byn", "bzd", "cad",
    "cdf", "chf", "clp", "cny", "cop", "crc", "cup", "cve", "czk", "djf", "dkk", "dop", "dzd",
    "egp", "ern", "etb", "eur", "fjd", "fkp", "gbp", "gel", "ghs", "gip", "gmd", "gnf", "gtq",
    "gyd", "hkd", "hnl", "htg", "huf", "idr", "ils", "inr", "iqd", "irr", "isk", "jmd", "jod",
    "jpy", "kes", "kgs", "khr", "kmf", "kpw", "krw", "kwd", "kyd", "kzt", "lak", "lbp", "lkr",
    "lrd", "lsl", "lyd", "mad", "mdl", "mga", "mkd", "mmk", "mnt", "mop", "mru", "mur", "mvr",
    "mwk", "mxn", "myr", "mzn", "nad", "ngn", "nio", "nok", "npr", "nzd", "omr", "pab", "pen",
    "pgk", "php", "pkr", "pln", "pyg", "qar", "ron", "rsd", "rub", "rwf", "sar", "sbd", "scr",
    "sdg", "sek", "sgd", "shp", "sle", "sll", "sos", "srd", "ssp", "stn", "svc", "syp", "szl",
    "thb", "tjs", "tmt", "tnd", "top", "try", "ttd", "twd", "tzs", "uah", "ugx", "usd", "uyu",
    "uzs", "ves", "vnd", "vuv", "wst", "xaf", "xcd", "xof", "xpf", "yer", "zar", "zmw", "zwl",
];

/// Normalise and check a currency code
pub fn normalize_currency(code: &str) -> RecoveryResult<String> {
    let lower = code.trim().to_ascii_lowercase();
    if CURRENCY_CODES.contains(&lower.as_str()) {
        Ok(lower)
    } else {
        Err(RecoveryError::Validation(format!(
            "Unrecognized currency code: '{}'",
            code
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Contacted,
    Resolved,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Contacted => "contacted",
            PaymentStatus::Resolved => "resolved",
        }
    }

    /// Allowed lifecycle edges. Nothing leaves `resolved`.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (PaymentStatus::Pending, PaymentStatus::Contacted)
                | (PaymentStatus::Pending, PaymentStatus::Resolved)
                | (PaymentStatus::Contacted, PaymentStatus::Resolved)
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = RecoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "contacted" => Ok(PaymentStatus::Contacted),
            "resolved" => Ok(PaymentStatus::Resolved),
            other => Err(RecoveryError::Database(format!(
                "Unknown payment status in storage: {}",
                other
            ))),
        }
    }
}

/// Outbound messaging channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Rich channel, tried first
    Whatsapp,
    /// Plain channel
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Whatsapp => "whatsapp",
            Channel::Sms => "sms",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = RecoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "whatsapp" => Ok(Channel::Whatsapp),
            "sms" => Ok(Channel::Sms),
            other => Err(RecoveryError::Database(format!(
                "Unknown channel in storage: {}",
                other
            ))),
        }
    }
}

/// A failed payment about to be recorded
#[derive(Debug, Clone)]
pub struct NewFailedPayment {
    pub provider_invoice_id: String,
    pub provider_customer_id: String,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub failure_code: String,
    pub failure_message: String,
    pub decline_type: DeclineType,
    pub account_active: bool,
}

impl NewFailedPayment {
    /// Check the row before anything is written; returns the normalised currency
    pub fn validate(&self) -> RecoveryResult<String> {
        if self.provider_invoice_id.trim().is_empty() {
            return Err(RecoveryError::Validation(
                "provider_invoice_id must not be empty".to_string(),
            ));
        }
        if self.amount_cents < 0 {
            return Err(RecoveryError::Validation(format!(
                "amount_cents must be >= 0, got {}",
                self.amount_cents
            )));
        }
        normalize_currency(&self.currency)
    }
}

/// Stored failed payment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedPayment {
    pub id: Uuid,
    pub provider_invoice_id: String,
    pub provider_customer_id: String,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub failure_code: String,
    pub failure_message: String,
    pub decline_type: DeclineType,
    pub account_active: bool,
    pub status: PaymentStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
}

impl FailedPayment {
    /// Name used to address the customer: stored name, else the email local part
    pub fn display_name(&self) -> String {
        match self.customer_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => email_local_part(&self.customer_email),
        }
    }
}

pub(crate) fn email_local_part(email: &str) -> String {
    email.split('@').next().unwrap_or(email).to_string()
}

/// One dispatch attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageSent {
    pub id: Uuid,
    pub failed_payment_id: Uuid,
    pub channel: Channel,
    pub content: String,
    pub provider_message_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
    pub status: String,
}

/// Message to append when marking a payment contacted
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub channel: Channel,
    pub content: String,
    pub provider_message_id: Option<String>,
}

/// Listing row for the dashboard
#[derive(Debug, Clone, Serialize)]
pub struct PaymentWithMessageCount {
    #[serde(flatten)]
    pub payment: FailedPayment,
    pub message_count: i64,
}

/// Result of [`RecordStore::insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertResult {
    pub id: Uuid,
    /// False when a row for the same invoice already existed
    pub created: bool,
}

/// Per-payment stats events that must be counted exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CountedEvent {
    SoftDecline,
    Recovery,
}

impl CountedEvent {
    pub fn stats_kind(&self) -> StatsEventKind {
        match self {
            CountedEvent::SoftDecline => StatsEventKind::SoftDecline,
            CountedEvent::Recovery => StatsEventKind::Recovery,
        }
    }

    fn column(&self) -> &'static str {
        match self {
            CountedEvent::SoftDecline => "soft_decline_counted",
            CountedEvent::Recovery => "recovery_counted",
        }
    }
}

/// Persistence for failed payments and their messages
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Record a failed payment in `pending`. Idempotent per invoice id.
    async fn insert(&self, payment: &NewFailedPayment) -> RecoveryResult<InsertResult>;

    /// Append a message and move `pending -> contacted`.
    ///
    /// Returns whether the status changed; an already contacted or resolved
    /// payment still gets the message row.
    async fn mark_contacted(&self, id: Uuid, message: &NewMessage) -> RecoveryResult<bool>;

    /// Move the invoice's payment to `resolved` unless it already is.
    ///
    /// Returns whether a transition happened, which is what decides whether
    /// a recovery gets counted.
    async fn mark_resolved(&self, provider_invoice_id: &str) -> RecoveryResult<bool>;

    /// Claim the right to count `event` for this payment.
    ///
    /// Only one caller ever gets `true` until the claim is released. A
    /// missing payment yields `false`.
    async fn claim_count(&self, id: Uuid, event: CountedEvent) -> RecoveryResult<bool>;

    /// Give a claim back after the stats write failed, so a redelivered
    /// event can count it.
    async fn release_count(&self, id: Uuid, event: CountedEvent) -> RecoveryResult<()>;

    async fn get(&self, id: Uuid) -> RecoveryResult<Option<FailedPayment>>;

    async fn find_by_invoice(&self, provider_invoice_id: &str)
        -> RecoveryResult<Option<FailedPayment>>;

    /// Most recent `created_at` first
    async fn list_recent(&self, limit: i64) -> RecoveryResult<Vec<PaymentWithMessageCount>>;

    /// Messages for one payment, oldest first
    async fn list_messages(&self, payment_id: Uuid) -> RecoveryResult<Vec<MessageSent>>;
}

// ============ POSTGRES ============

#[derive(Debug, sqlx::FromRow)]
struct FailedPaymentRow {
    id: Uuid,
    provider_invoice_id: String,
    provider_customer_id: String,
    customer_email: String,
    customer_name: Option<String>,
    customer_phone: Option<String>,
    amount_cents: i64,
    currency: String,
    failure_code: String,
    failure_message: String,
    decline_type: String,
    account_active: bool,
    status: String,
    created_at: OffsetDateTime,
    resolved_at: Option<OffsetDateTime>,
}

impl TryFrom<FailedPaymentRow> for FailedPayment {
    type Error = RecoveryError;

    fn try_from(row: FailedPaymentRow) -> Result<Self, Self::Error> {
        Ok(FailedPayment {
            id: row.id,
            provider_invoice_id: row.provider_invoice_id,
            provider_customer_id: row.provider_customer_id,
            customer_email: row.customer_email,
            customer_name: row.customer_name,
            customer_phone: row.customer_phone,
            amount_cents: row.amount_cents,
            currency: row.currency,
            failure_code: row.failure_code,
            failure_message: row.failure_message,
            decline_type: row
                .decline_type
                .parse()
                .map_err(|_| RecoveryError::Database(format!(
                    "Unknown decline type in storage: {}",
                    row.decline_type
                )))?,
            account_active: row.account_active,
            status: row.status.parse()?,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentListRow {
    #[sqlx(flatten)]
    payment: FailedPaymentRow,
    message_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct MessageSentRow {
    id: Uuid,
    failed_payment_id: Uuid,
    channel: String,
    content: String,
    provider_message_id: Option<String>,
    sent_at: OffsetDateTime,
    status: String,
}

impl TryFrom<MessageSentRow> for MessageSent {
    type Error = RecoveryError;

    fn try_from(row: MessageSentRow) -> Result<Self, Self::Error> {
        Ok(MessageSent {
            id: row.id,
            failed_payment_id: row.failed_payment_id,
            channel: row.channel.parse()?,
            content: row.content,
            provider_message_id: row.provider_message_id,
            sent_at: row.sent_at,
            status: row.status,
        })
    }
}

const PAYMENT_COLUMNS: &str = r#"
    fp.id, fp.provider_invoice_id, fp.provider_customer_id, fp.customer_email,
    fp.customer_name, fp.customer_phone, fp.amount_cents, fp.currency,
    fp.failure_code, fp.failure_message, fp.decline_type, fp.account_active,
    fp.status, fp.created_at, fp.resolved_at
"#;

/// Postgres-backed record store
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn insert(&self, payment: &NewFailedPayment) -> RecoveryResult<InsertResult> {
        let currency = payment.validate()?;
        let id = Uuid::new_v4();

        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO failed_payments
                (id, provider_invoice_id, provider_customer_id, customer_email,
                 customer_name, customer_phone, amount_cents, currency,
                 failure_code, failure_message, decline_type, account_active,
                 status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 'pending', NOW())
            ON CONFLICT (provider_invoice_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(&payment.provider_invoice_id)
        .bind(&payment.provider_customer_id)
        .bind(&payment.customer_email)
        .bind(&payment.customer_name)
        .bind(&payment.customer_phone)
        .bind(payment.amount_cents)
        .bind(&currency)
        .bind(&payment.failure_code)
        .bind(&payment.failure_message)
        .bind(payment.decline_type.as_str())
        .bind(payment.account_active)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = inserted {
            return Ok(InsertResult { id, created: true });
        }

        let (existing,): (Uuid,) =
            sqlx::query_as("SELECT id FROM failed_payments WHERE provider_invoice_id = $1")
                .bind(&payment.provider_invoice_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(InsertResult {
            id: existing,
            created: false,
        })
    }

    async fn mark_contacted(&self, id: Uuid, message: &NewMessage) -> RecoveryResult<bool> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM failed_payments WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let status: PaymentStatus = current
            .ok_or_else(|| RecoveryError::NotFound(format!("Failed payment {} not found", id)))?
            .0
            .parse()?;

        sqlx::query(
            r#"
            INSERT INTO messages_sent
                (id, failed_payment_id, channel, content, provider_message_id, sent_at, status)
            VALUES ($1, $2, $3, $4, $5, NOW(), 'sent')
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(id)
        .bind(message.channel.as_str())
        .bind(&message.content)
        .bind(&message.provider_message_id)
        .execute(&mut *tx)
        .await?;

        let transitioned = if status.can_transition_to(PaymentStatus::Contacted) {
            sqlx::query(
                "UPDATE failed_payments SET status = 'contacted' WHERE id = $1 AND status = 'pending'",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected()
                > 0
        } else {
            false
        };

        tx.commit().await?;
        Ok(transitioned)
    }

    async fn mark_resolved(&self, provider_invoice_id: &str) -> RecoveryResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE failed_payments
            SET status = 'resolved', resolved_at = NOW()
            WHERE provider_invoice_id = $1
              AND status <> 'resolved'
            "#,
        )
        .bind(provider_invoice_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_count(&self, id: Uuid, event: CountedEvent) -> RecoveryResult<bool> {
        let result = sqlx::query(&format!(
            "UPDATE failed_payments SET {col} = TRUE WHERE id = $1 AND {col} = FALSE",
            col = event.column()
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_count(&self, id: Uuid, event: CountedEvent) -> RecoveryResult<()> {
        sqlx::query(&format!(
            "UPDATE failed_payments SET {} = FALSE WHERE id = $1",
            event.column()
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> RecoveryResult<Option<FailedPayment>> {
        let row: Option<FailedPaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM failed_payments fp WHERE fp.id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(FailedPayment::try_from).transpose()
    }

    async fn find_by_invoice(
        &self,
        provider_invoice_id: &str,
    ) -> RecoveryResult<Option<FailedPayment>> {
        let row: Option<FailedPaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM failed_payments fp WHERE fp.provider_invoice_id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(provider_invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(FailedPayment::try_from).transpose()
    }

    async fn list_recent(&self, limit: i64) -> RecoveryResult<Vec<PaymentWithMessageCount>> {
        let rows: Vec<PaymentListRow> = sqlx::query_as(&format!(
            r#"
            SELECT {},
                   (SELECT COUNT(*) FROM messages_sent ms WHERE ms.failed_payment_id = fp.id)
                       AS message_count
            FROM failed_payments fp
            ORDER BY fp.created_at DESC
            LIMIT $1
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(PaymentWithMessageCount {
                    payment: row.payment.try_into()?,
                    message_count: row.message_count,
                })
            })
            .collect()
    }

    async fn list_messages(&self, payment_id: Uuid) -> RecoveryResult<Vec<MessageSent>> {
        let rows: Vec<MessageSentRow> = sqlx::query_as(
            r#"
            SELECT id, failed_payment_id, channel, content, provider_message_id, sent_at, status
            FROM messages_sent
            WHERE failed_payment_id = $1
            ORDER BY sent_at ASC
            "#,
        )
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MessageSent::try_from).collect()
    }
}
