//! Daily recovery statistics
//!
//! One row per UTC calendar date. Every event is applied as a delta through
//! a single atomic upsert, never as read-modify-write, so concurrent webhook
//! deliveries on the same day cannot lose increments.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Date, Duration, OffsetDateTime};

use crate::error::{RecoveryError, RecoveryResult};

/// Default dashboard window
pub const DEFAULT_SUMMARY_DAYS: i64 = 30;

/// Event kinds that move the rollup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsEventKind {
    SoftDecline,
    MessageSent,
    Recovery,
}

impl StatsEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatsEventKind::SoftDecline => "soft_decline",
            StatsEventKind::MessageSent => "message_sent",
            StatsEventKind::Recovery => "recovery",
        }
    }
}

/// Per-counter increments for one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsDelta {
    pub total_failures: i64,
    pub soft_declines: i64,
    pub messages_sent: i64,
    pub recoveries: i64,
    pub recovered_amount_cents: i64,
}

impl StatsDelta {
    /// Build the delta for an event. `amount_cents` only counts for recoveries.
    pub fn for_event(kind: StatsEventKind, amount_cents: i64) -> RecoveryResult<Self> {
        if amount_cents < 0 {
            return Err(RecoveryError::Validation(format!(
                "amount_cents must be >= 0, got {}",
                amount_cents
            )));
        }

        Ok(match kind {
            StatsEventKind::SoftDecline => StatsDelta {
                total_failures: 1,
                soft_declines: 1,
                ..Default::default()
            },
            StatsEventKind::MessageSent => StatsDelta {
                messages_sent: 1,
                ..Default::default()
            },
            StatsEventKind::Recovery => StatsDelta {
                recoveries: 1,
                recovered_amount_cents: amount_cents,
                ..Default::default()
            },
        })
    }
}

/// Rollup row for one day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct DailyStats {
    pub date: Date,
    pub total_failures: i64,
    pub soft_declines: i64,
    pub messages_sent: i64,
    pub recoveries: i64,
    pub recovered_amount_cents: i64,
}

impl DailyStats {
    pub fn empty(date: Date) -> Self {
        Self {
            date,
            total_failures: 0,
            soft_declines: 0,
            messages_sent: 0,
            recoveries: 0,
            recovered_amount_cents: 0,
        }
    }

    pub fn apply(&mut self, delta: &StatsDelta) {
        self.total_failures += delta.total_failures;
        self.soft_declines += delta.soft_declines;
        self.messages_sent += delta.messages_sent;
        self.recoveries += delta.recoveries;
        self.recovered_amount_cents += delta.recovered_amount_cents;
    }
}

/// Plain sums across a summary window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsTotals {
    pub total_failures: i64,
    pub soft_declines: i64,
    pub messages_sent: i64,
    pub recoveries: i64,
    pub recovered_amount_cents: i64,
    /// Percentage with one decimal; 0 when there were no soft declines
    pub recovery_rate: f64,
}

impl StatsTotals {
    pub fn from_days(days: &[DailyStats]) -> Self {
        let mut totals = days.iter().fold(StatsTotals::default(), |mut acc, day| {
            acc.total_failures += day.total_failures;
            acc.soft_declines += day.soft_declines;
            acc.messages_sent += day.messages_sent;
            acc.recoveries += day.recoveries;
            acc.recovered_amount_cents += day.recovered_amount_cents;
            acc
        });
        totals.recovery_rate = recovery_rate(totals.recoveries, totals.soft_declines);
        totals
    }
}

/// `recoveries / soft_declines * 100`, rounded to one decimal
pub fn recovery_rate(recoveries: i64, soft_declines: i64) -> f64 {
    if soft_declines <= 0 {
        return 0.0;
    }
    let rate = recoveries as f64 / soft_declines as f64 * 100.0;
    (rate * 10.0).round() / 10.0
}

/// Dashboard summary: newest day first plus window totals
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    #[serde(rename = "stats")]
    pub per_day: Vec<DailyStats>,
    pub totals: StatsTotals,
}

impl StatsSummary {
    pub fn from_days(mut per_day: Vec<DailyStats>) -> Self {
        per_day.sort_by(|a, b| b.date.cmp(&a.date));
        let totals = StatsTotals::from_days(&per_day);
        Self { per_day, totals }
    }
}

/// Current UTC calendar date
pub fn today_utc() -> Date {
    OffsetDateTime::now_utc().date()
}

/// First date included in a window of `days` days ending on `today`
pub fn window_start(today: Date, days: i64) -> Date {
    today.saturating_sub(Duration::days(days.max(1) - 1))
}

/// Storage for the daily rollup
#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Atomically add `delta` to the row for `date`, creating it if absent
    async fn apply_delta(&self, date: Date, delta: StatsDelta) -> RecoveryResult<()>;

    /// Rows with `date >= since`, any order
    async fn days_since(&self, since: Date) -> RecoveryResult<Vec<DailyStats>>;

    async fn get_day(&self, date: Date) -> RecoveryResult<Option<DailyStats>>;
}

/// Aggregator over a [`StatsStore`]
#[derive(Clone)]
pub struct StatsAggregator {
    store: std::sync::Arc<dyn StatsStore>,
}

impl StatsAggregator {
    pub fn new(store: std::sync::Arc<dyn StatsStore>) -> Self {
        Self { store }
    }

    /// Record one event against today's row
    pub async fn record_event(&self, kind: StatsEventKind, amount_cents: i64) -> RecoveryResult<()> {
        self.record_event_on(kind, amount_cents, today_utc()).await
    }

    /// Record one event against an explicit date
    pub async fn record_event_on(
        &self,
        kind: StatsEventKind,
        amount_cents: i64,
        date: Date,
    ) -> RecoveryResult<()> {
        let delta = StatsDelta::for_event(kind, amount_cents)?;
        self.store.apply_delta(date, delta).await?;

        tracing::debug!(
            event = kind.as_str(),
            date = %date,
            amount_cents = amount_cents,
            "Recorded stats event"
        );
        Ok(())
    }

    /// Last `days` calendar days (today included)
    pub async fn summary(&self, days: i64) -> RecoveryResult<StatsSummary> {
        self.summary_as_of(days, today_utc()).await
    }

    pub async fn summary_as_of(&self, days: i64, today: Date) -> RecoveryResult<StatsSummary> {
        let since = window_start(today, days);
        let rows = self.store.days_since(since).await?;
        Ok(StatsSummary::from_days(
            rows.into_iter().filter(|d| d.date <= today).collect(),
        ))
    }

    pub async fn day(&self, date: Date) -> RecoveryResult<Option<DailyStats>> {
        self.store.get_day(date).await
    }
}

/// Postgres-backed rollup
#[derive(Clone)]
pub struct PgStatsStore {
    pool: PgPool,
}

impl PgStatsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StatsStore for PgStatsStore {
    async fn apply_delta(&self, date: Date, delta: StatsDelta) -> RecoveryResult<()> {
        // Single statement: the conflict branch adds to whatever is stored now
        sqlx::query(
            r#"
            INSERT INTO daily_stats
                (date, total_failures, soft_declines, messages_sent, recoveries, recovered_amount_cents)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (date) DO UPDATE SET
                total_failures = daily_stats.total_failures + EXCLUDED.total_failures,
                soft_declines = daily_stats.soft_declines + EXCLUDED.soft_declines,
                messages_sent = daily_stats.messages_sent + EXCLUDED.messages_sent,
                recoveries = daily_stats.recoveries + EXCLUDED.recoveries,
                recovered_amount_cents = daily_stats.recovered_amount_cents + EXCLUDED.recovered_amount_cents
            "#,
        )
        .bind(date)
        .bind(delta.total_failures)
        .bind(delta.soft_declines)
        .bind(delta.messages_sent)
        .bind(delta.recoveries)
        .bind(delta.recovered_amount_cents)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn days_since(&self, since: Date) -> RecoveryResult<Vec<DailyStats>> {
        let rows: Vec<DailyStats> = sqlx::query_as(
            r#"
            SELECT date, total_failures, soft_declines, messages_sent, recoveries, recovered_amount_cents
            FROM daily_stats
            WHERE date >= $1
            ORDER BY date DESC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn get_day(&self, date: Date) -> RecoveryResult<Option<DailyStats>> {
        let row: Option<DailyStats> = sqlx::query_as(
            r#"
            SELECT date, total_failures, soft_declines, messages_sent, recoveries, recovered_amount_cents
            FROM daily_stats
            WHERE date = $1
            "#,
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}
