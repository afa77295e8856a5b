//! Recovery invariants
//!
//! Read-only consistency checks over the three recovery tables. They can be
//! run after a webhook replay or a manual repair to confirm the rows still
//! agree with each other.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::{RecoveryError, RecoveryResult};

const RESOLVED_HAS_TIMESTAMP: &str = "resolved_has_timestamp";
const CONTACTED_HAS_MESSAGE: &str = "contacted_has_message";
const DAILY_FAILURES_COVER_SOFT_DECLINES: &str = "daily_failures_cover_soft_declines";

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    /// Failed payments affected; empty for stats violations
    pub payment_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Counters or lifecycle state are wrong
    High,
    /// Inconsistent but harmless to customers
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentIdRow {
    id: Uuid,
    provider_invoice_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct StatsDayRow {
    date: Date,
    total_failures: i64,
    soft_declines: i64,
}

/// Runs the recovery invariant checks against Postgres
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> RecoveryResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_resolved_has_timestamp().await?);
        violations.extend(self.check_contacted_has_message().await?);
        violations.extend(self.check_daily_failures_cover_soft_declines().await?);

        let summary =
            InvariantCheckSummary::from_violations(now, Self::available_checks().len(), violations);

        if !summary.healthy {
            tracing::warn!(
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Recovery invariant violations found"
            );
        }

        Ok(summary)
    }

    /// Resolved rows carry `resolved_at`; nothing else does
    async fn check_resolved_has_timestamp(&self) -> RecoveryResult<Vec<InvariantViolation>> {
        let rows: Vec<PaymentIdRow> = sqlx::query_as(
            r#"
            SELECT id, provider_invoice_id
            FROM failed_payments
            WHERE (status = 'resolved') <> (resolved_at IS NOT NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: RESOLVED_HAS_TIMESTAMP.to_string(),
                payment_ids: vec![row.id],
                description: "Payment status and resolved_at disagree".to_string(),
                context: serde_json::json!({ "provider_invoice_id": row.provider_invoice_id }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// A contacted payment has at least one message row
    async fn check_contacted_has_message(&self) -> RecoveryResult<Vec<InvariantViolation>> {
        let rows: Vec<PaymentIdRow> = sqlx::query_as(
            r#"
            SELECT fp.id, fp.provider_invoice_id
            FROM failed_payments fp
            WHERE fp.status = 'contacted'
              AND NOT EXISTS (
                  SELECT 1 FROM messages_sent ms WHERE ms.failed_payment_id = fp.id
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: CONTACTED_HAS_MESSAGE.to_string(),
                payment_ids: vec![row.id],
                description: "Payment is contacted but has no sent message".to_string(),
                context: serde_json::json!({ "provider_invoice_id": row.provider_invoice_id }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Every soft decline is also counted as a failure
    async fn check_daily_failures_cover_soft_declines(
        &self,
    ) -> RecoveryResult<Vec<InvariantViolation>> {
        let rows: Vec<StatsDayRow> = sqlx::query_as(
            r#"
            SELECT date, total_failures, soft_declines
            FROM daily_stats
            WHERE total_failures < soft_declines
            ORDER BY date
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: DAILY_FAILURES_COVER_SOFT_DECLINES.to_string(),
                payment_ids: Vec::new(),
                description: format!(
                    "Day has {} soft declines but only {} failures",
                    row.soft_declines, row.total_failures
                ),
                context: serde_json::json!({
                    "date": row.date.to_string(),
                    "total_failures": row.total_failures,
                    "soft_declines": row.soft_declines,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> RecoveryResult<Vec<InvariantViolation>> {
        match name {
            RESOLVED_HAS_TIMESTAMP => self.check_resolved_has_timestamp().await,
            CONTACTED_HAS_MESSAGE => self.check_contacted_has_message().await,
            DAILY_FAILURES_COVER_SOFT_DECLINES => {
                self.check_daily_failures_cover_soft_declines().await
            }
            other => Err(RecoveryError::NotFound(format!(
                "Unknown invariant check '{}'",
                other
            ))),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            RESOLVED_HAS_TIMESTAMP,
            CONTACTED_HAS_MESSAGE,
            DAILY_FAILURES_COVER_SOFT_DECLINES,
        ]
    }
}
