// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Recovery Pipeline
//!
//! Drives whole webhook events through an in-memory [`RecoveryService`]:
//! - Payment failed / succeeded lifecycle
//! - Skips that must leave no trace (hard decline, inactive account)
//! - Redelivered and concurrent events

#[cfg(test)]
mod pipeline_tests {
    use std::sync::Arc;

    use serde_json::{json, Value};

    use crate::dispatcher::SkipReason;
    use crate::memory::{InMemoryRecordStore, InMemoryStatsStore};
    use crate::records::{Channel, PaymentStatus, RecordStore};
    use crate::stats::{today_utc, DailyStats};
    use crate::test_support::{FlakyStats, ScriptedDelivery, StaticActivity};
    use crate::webhooks::{IgnoreReason, WebhookEvent, WebhookOutcome};
    use crate::{DispatchOutcome, RecoveryError, RecoveryService};

    struct Pipeline {
        service: RecoveryService,
        records: Arc<InMemoryRecordStore>,
    }

    fn pipeline_with(delivery: ScriptedDelivery, activity: StaticActivity) -> Pipeline {
        let records = Arc::new(InMemoryRecordStore::new());
        let service = RecoveryService::builder(records.clone(), Arc::new(InMemoryStatsStore::new()))
            .delivery(Arc::new(delivery))
            .activity(Arc::new(activity))
            .payment_update_url("https://pay.example.com")
            .build()
            .unwrap();
        Pipeline { service, records }
    }

    fn pipeline() -> Pipeline {
        pipeline_with(ScriptedDelivery::accepting(), StaticActivity::Active)
    }

    fn event(event_type: &str, object: Value) -> WebhookEvent {
        serde_json::from_value(json!({
            "id": "evt_test",
            "type": event_type,
            "data": { "object": object }
        }))
        .unwrap()
    }

    fn failed(invoice: &str, failure_code: Option<&str>) -> WebhookEvent {
        let mut object = json!({
            "id": invoice,
            "customer": "cus_1",
            "customer_email": "a@b.com",
            "customer_phone": "+15551234567",
            "amount_due": 4999,
            "currency": "usd",
        });
        if let Some(code) = failure_code {
            object["charge"] = json!({ "failure_code": code });
        }
        event("invoice.payment_failed", object)
    }

    fn succeeded(invoice: &str, amount_paid: i64) -> WebhookEvent {
        event(
            "invoice.payment_succeeded",
            json!({ "id": invoice, "customer": "cus_1", "amount_paid": amount_paid, "currency": "usd" }),
        )
    }

    async fn today(service: &RecoveryService) -> DailyStats {
        service
            .stats()
            .day(today_utc())
            .await
            .unwrap()
            .unwrap_or_else(|| DailyStats::empty(today_utc()))
    }

    // =========================================================================
    // Soft decline is recorded, messaged, then recovered
    // =========================================================================
    #[tokio::test]
    async fn test_soft_decline_lifecycle() {
        let p = pipeline();

        let outcome = p
            .service
            .handle_event(&failed("in_1", Some("insufficient_funds")))
            .await
            .unwrap();
        let payment_id = match outcome {
            WebhookOutcome::PaymentRecorded {
                payment_id,
                dispatch: Some(DispatchOutcome::Sent { channel, .. }),
                dispatch_error: None,
            } => {
                assert_eq!(channel, Channel::Whatsapp);
                payment_id
            }
            other => panic!("unexpected outcome: {:?}", other),
        };

        let payment = p.records.get(payment_id).await.unwrap().unwrap();
        assert_eq!(payment.decline_type, crate::DeclineType::Soft);
        assert_eq!(payment.status, PaymentStatus::Contacted);
        assert_eq!(payment.currency, "usd");

        let stats = today(&p.service).await;
        assert_eq!(stats.total_failures, 1);
        assert_eq!(stats.soft_declines, 1);
        assert_eq!(stats.messages_sent, 1);

        let outcome = p.service.handle_event(&succeeded("in_1", 4999)).await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::PaymentRecovered {
                provider_invoice_id: "in_1".into(),
                amount_cents: 4999,
            }
        );

        let payment = p.records.get(payment_id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Resolved);
        assert!(payment.resolved_at.is_some());

        let stats = today(&p.service).await;
        assert_eq!(stats.recoveries, 1);
        assert_eq!(stats.recovered_amount_cents, 4999);
    }

    // =========================================================================
    // Second success event for the same invoice changes nothing
    // =========================================================================
    #[tokio::test]
    async fn test_duplicate_success_is_noop() {
        let p = pipeline();
        p.service
            .handle_event(&failed("in_1", Some("insufficient_funds")))
            .await
            .unwrap();
        p.service.handle_event(&succeeded("in_1", 4999)).await.unwrap();

        let payment = p.records.list_recent(1).await.unwrap().remove(0).payment;
        let first_resolved_at = payment.resolved_at;

        let outcome = p.service.handle_event(&succeeded("in_1", 4999)).await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Ignored {
                reason: IgnoreReason::NothingToResolve
            }
        );

        let payment = p.records.get(payment.id).await.unwrap().unwrap();
        assert_eq!(payment.resolved_at, first_resolved_at);
        let stats = today(&p.service).await;
        assert_eq!(stats.recoveries, 1);
        assert_eq!(stats.recovered_amount_cents, 4999);
    }

    // =========================================================================
    // Hard declines leave no rows and no stats
    // =========================================================================
    #[tokio::test]
    async fn test_hard_decline_writes_nothing() {
        let p = pipeline();

        let outcome = p
            .service
            .handle_event(&failed("in_1", Some("stolen_card")))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Ignored {
                reason: IgnoreReason::HardDecline {
                    failure_code: "stolen_card".into()
                }
            }
        );
        assert!(p.records.is_empty().await);
        assert!(p.service.stats().day(today_utc()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_failure_code_is_hard_decline() {
        let p = pipeline();

        let outcome = p.service.handle_event(&failed("in_1", None)).await.unwrap();
        assert!(matches!(
            outcome,
            WebhookOutcome::Ignored {
                reason: IgnoreReason::HardDecline { ref failure_code }
            } if failure_code == "unknown"
        ));
        assert!(p.records.is_empty().await);
    }

    // =========================================================================
    // Inactive accounts are not chased
    // =========================================================================
    #[tokio::test]
    async fn test_inactive_account_writes_nothing() {
        let p = pipeline_with(ScriptedDelivery::accepting(), StaticActivity::Inactive);

        let outcome = p
            .service
            .handle_event(&failed("in_1", Some("insufficient_funds")))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Ignored {
                reason: IgnoreReason::InactiveAccount
            }
        );
        assert!(p.records.is_empty().await);
        assert!(p.service.stats().day(today_utc()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_activity_failure_is_surfaced_before_writes() {
        let p = pipeline_with(ScriptedDelivery::accepting(), StaticActivity::Failing);

        let err = p
            .service
            .handle_event(&failed("in_1", Some("insufficient_funds")))
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::Collaborator(_)));
        assert!(p.records.is_empty().await);
    }

    // =========================================================================
    // Malformed events are rejected without partial writes
    // =========================================================================
    #[tokio::test]
    async fn test_missing_email_is_validation_error() {
        let p = pipeline();
        let mut ev = failed("in_1", Some("insufficient_funds"));
        ev.data.object.customer_email = None;

        let err = p.service.handle_event(&ev).await.unwrap_err();
        assert!(matches!(err, RecoveryError::Validation(_)));
        assert!(p.records.is_empty().await);
        assert!(p.service.stats().day(today_utc()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_negative_amount_is_validation_error() {
        let p = pipeline();
        let mut ev = failed("in_1", Some("insufficient_funds"));
        ev.data.object.amount_due = Some(-1);

        let err = p.service.handle_event(&ev).await.unwrap_err();
        assert!(matches!(err, RecoveryError::Validation(_)));
        assert!(p.records.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_currency_is_validation_error() {
        let p = pipeline();
        let mut ev = failed("in_1", Some("insufficient_funds"));
        ev.data.object.currency = Some("zzz".into());

        let err = p.service.handle_event(&ev).await.unwrap_err();
        assert!(matches!(err, RecoveryError::Validation(_)));
        assert!(p.records.is_empty().await);
    }

    // =========================================================================
    // Redelivered failure event does not double count or double message
    // =========================================================================
    #[tokio::test]
    async fn test_duplicate_failure_event_is_ignored() {
        let p = pipeline();
        let ev = failed("in_1", Some("insufficient_funds"));

        let first = p.service.handle_event(&ev).await.unwrap();
        let WebhookOutcome::PaymentRecorded { payment_id, .. } = first else {
            panic!("expected a recorded payment, got {:?}", first);
        };

        let second = p.service.handle_event(&ev).await.unwrap();
        assert_eq!(
            second,
            WebhookOutcome::Ignored {
                reason: IgnoreReason::DuplicateFailure { payment_id }
            }
        );

        assert_eq!(p.records.len().await, 1);
        assert_eq!(p.records.list_messages(payment_id).await.unwrap().len(), 1);
        let stats = today(&p.service).await;
        assert_eq!(stats.soft_declines, 1);
        assert_eq!(stats.messages_sent, 1);
    }

    // =========================================================================
    // A stats write failure is repaired by the provider's redelivery
    // =========================================================================
    #[tokio::test]
    async fn test_redelivery_after_stats_failure_resumes_recovery() {
        let records = Arc::new(InMemoryRecordStore::new());
        let stats = Arc::new(FlakyStats::failing_next(1));
        let delivery = Arc::new(ScriptedDelivery::accepting());
        let service = RecoveryService::builder(records.clone(), stats.clone())
            .delivery(delivery.clone())
            .build()
            .unwrap();
        let ev = failed("in_1", Some("insufficient_funds"));

        let err = service.handle_event(&ev).await.unwrap_err();
        assert!(err.is_storage());
        assert!(delivery.attempts().await.is_empty());

        let outcome = service.handle_event(&ev).await.unwrap();
        let WebhookOutcome::PaymentRecorded {
            payment_id,
            dispatch: Some(DispatchOutcome::Sent { .. }),
            dispatch_error: None,
        } = outcome
        else {
            panic!("expected the redelivery to contact the customer, got {:?}", outcome);
        };

        let payment = records.get(payment_id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Contacted);
        assert_eq!(records.list_messages(payment_id).await.unwrap().len(), 1);

        let day = today(&service).await;
        assert_eq!(day.total_failures, 1);
        assert_eq!(day.soft_declines, 1);
        assert_eq!(day.messages_sent, 1);

        let again = service.handle_event(&ev).await.unwrap();
        assert_eq!(
            again,
            WebhookOutcome::Ignored {
                reason: IgnoreReason::DuplicateFailure { payment_id }
            }
        );
        assert_eq!(today(&service).await.soft_declines, 1);
    }

    #[tokio::test]
    async fn test_redelivered_success_counts_recovery_after_stats_failure() {
        let records = Arc::new(InMemoryRecordStore::new());
        let stats = Arc::new(FlakyStats::default());
        let service = RecoveryService::builder(records.clone(), stats.clone())
            .delivery(Arc::new(ScriptedDelivery::accepting()))
            .build()
            .unwrap();
        service
            .handle_event(&failed("in_1", Some("insufficient_funds")))
            .await
            .unwrap();

        stats.fail_next(1);
        let err = service.handle_event(&succeeded("in_1", 4999)).await.unwrap_err();
        assert!(err.is_storage());
        assert_eq!(today(&service).await.recoveries, 0);

        let outcome = service.handle_event(&succeeded("in_1", 4999)).await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::PaymentRecovered {
                provider_invoice_id: "in_1".to_string(),
                amount_cents: 4999,
            }
        );

        let outcome = service.handle_event(&succeeded("in_1", 4999)).await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Ignored {
                reason: IgnoreReason::NothingToResolve
            }
        );

        let day = today(&service).await;
        assert_eq!(day.recoveries, 1);
        assert_eq!(day.recovered_amount_cents, 4999);
        let payment = records.find_by_invoice("in_1").await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Resolved);
    }

    // =========================================================================
    // Dispatch failures are acknowledged and leave the payment pending
    // =========================================================================
    #[tokio::test]
    async fn test_total_delivery_failure_keeps_record_pending() {
        let p = pipeline_with(
            ScriptedDelivery::rejecting(&[Channel::Whatsapp, Channel::Sms]),
            StaticActivity::Active,
        );

        let outcome = p
            .service
            .handle_event(&failed("in_1", Some("insufficient_funds")))
            .await
            .unwrap();
        let WebhookOutcome::PaymentRecorded {
            payment_id,
            dispatch: None,
            dispatch_error: Some(_),
        } = outcome
        else {
            panic!("expected failed dispatch, got {:?}", outcome);
        };

        let payment = p.records.get(payment_id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        let stats = today(&p.service).await;
        assert_eq!(stats.soft_declines, 1);
        assert_eq!(stats.messages_sent, 0);
    }

    #[tokio::test]
    async fn test_no_phone_is_recorded_but_skipped() {
        let p = pipeline();
        let mut ev = failed("in_1", Some("card_velocity_exceeded"));
        ev.data.object.customer_phone = None;

        let outcome = p.service.handle_event(&ev).await.unwrap();
        let WebhookOutcome::PaymentRecorded {
            payment_id,
            dispatch: Some(DispatchOutcome::Skipped { reason }),
            ..
        } = outcome
        else {
            panic!("expected skipped dispatch, got {:?}", outcome);
        };
        assert_eq!(reason, SkipReason::NoContactMethod);

        let payment = p.records.get(payment_id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(today(&p.service).await.messages_sent, 0);
    }

    #[tokio::test]
    async fn test_success_without_failure_is_ignored() {
        let p = pipeline();

        let outcome = p.service.handle_event(&succeeded("in_never_failed", 1000)).await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Ignored {
                reason: IgnoreReason::NothingToResolve
            }
        );
        assert!(p.service.stats().day(today_utc()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unhandled_event_type_is_ignored() {
        let p = pipeline();

        let outcome = p
            .service
            .handle_event(&event("customer.created", json!({ "id": "cus_1" })))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            WebhookOutcome::Ignored {
                reason: IgnoreReason::UnhandledEventType { .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_payment_detail_lists_messages() {
        let p = pipeline();
        let outcome = p
            .service
            .handle_event(&failed("in_1", Some("processing_error")))
            .await
            .unwrap();
        let WebhookOutcome::PaymentRecorded { payment_id, .. } = outcome else {
            panic!("expected a recorded payment");
        };

        p.service.retry(payment_id).await.unwrap();

        let detail = p.service.payment_detail(payment_id).await.unwrap();
        assert_eq!(detail.payment.id, payment_id);
        assert_eq!(detail.messages.len(), 2);

        let recent = p.service.list_recent(50).await.unwrap();
        assert_eq!(recent[0].message_count, 2);
    }

    #[tokio::test]
    async fn test_builder_requires_delivery() {
        let result = RecoveryService::builder(
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(InMemoryStatsStore::new()),
        )
        .build();
        assert!(matches!(result, Err(RecoveryError::Config(_))));
    }
}

#[cfg(test)]
mod concurrency_tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::Barrier;

    use crate::memory::{InMemoryRecordStore, InMemoryStatsStore};
    use crate::stats::{today_utc, StatsAggregator, StatsEventKind};
    use crate::test_support::ScriptedDelivery;
    use crate::webhooks::{WebhookEvent, WebhookOutcome};
    use crate::RecoveryService;

    fn service() -> Arc<RecoveryService> {
        Arc::new(
            RecoveryService::builder(
                Arc::new(InMemoryRecordStore::new()),
                Arc::new(InMemoryStatsStore::new()),
            )
            .delivery(Arc::new(ScriptedDelivery::accepting()))
            .build()
            .unwrap(),
        )
    }

    fn event(value: serde_json::Value) -> WebhookEvent {
        serde_json::from_value(value).unwrap()
    }

    // =========================================================================
    // N concurrent soft-decline increments on one day are all kept
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_stats_increments_not_lost() {
        const N: usize = 50;
        let stats = StatsAggregator::new(Arc::new(InMemoryStatsStore::new()));
        let barrier = Arc::new(Barrier::new(N));
        let mut handles = Vec::with_capacity(N);

        for _ in 0..N {
            let stats = stats.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                stats.record_event(StatsEventKind::SoftDecline, 0).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let day = stats.day(today_utc()).await.unwrap().unwrap();
        assert_eq!(day.soft_declines, N as i64);
        assert_eq!(day.total_failures, N as i64);
    }

    // =========================================================================
    // Concurrent success events for one invoice count one recovery
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_duplicate_success_counts_once() {
        const N: usize = 10;
        let service = service();
        service
            .handle_event(&event(json!({
                "type": "invoice.payment_failed",
                "data": {"object": {
                    "id": "in_race", "customer": "cus_1", "customer_email": "a@b.com",
                    "customer_phone": "+15551234567", "amount_due": 2500, "currency": "eur",
                    "charge": {"failure_code": "try_again_later"}
                }}
            })))
            .await
            .unwrap();

        let success = event(json!({
            "type": "invoice.payment_succeeded",
            "data": {"object": {"id": "in_race", "amount_paid": 2500}}
        }));
        let barrier = Arc::new(Barrier::new(N));
        let mut handles = Vec::with_capacity(N);

        for _ in 0..N {
            let service = service.clone();
            let barrier = barrier.clone();
            let success = success.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                service.handle_event(&success).await
            }));
        }

        let mut recovered = 0;
        for handle in handles {
            if matches!(
                handle.await.unwrap().unwrap(),
                WebhookOutcome::PaymentRecovered { .. }
            ) {
                recovered += 1;
            }
        }
        assert_eq!(recovered, 1);

        let day = service.stats().day(today_utc()).await.unwrap().unwrap();
        assert_eq!(day.recoveries, 1);
        assert_eq!(day.recovered_amount_cents, 2500);
    }

    // =========================================================================
    // No soft declines in the window means a zero rate, not a division error
    // =========================================================================
    #[tokio::test]
    async fn test_recovery_rate_zero_without_soft_declines() {
        let service = service();
        let summary = service.summary(30).await.unwrap();
        assert!(summary.per_day.is_empty());
        assert_eq!(summary.totals.recovery_rate, 0.0);

        service
            .stats()
            .record_event(StatsEventKind::Recovery, 100)
            .await
            .unwrap();
        let summary = service.summary(30).await.unwrap();
        assert_eq!(summary.totals.recoveries, 1);
        assert_eq!(summary.totals.recovery_rate, 0.0);
    }
}
