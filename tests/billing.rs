mod common;

use async_trait::async_trait;
use bank_recon_rust::db::{BillingRepository, InMemoryBilling};
use bank_recon_rust::gateway::{
    ChargeOutcome, ChargeRequest, EventOutcome, GatewayError, GatewayEvent, PaymentGateway,
};
use bank_recon_rust::models::{
    CycleStatus, PaymentStatus, ReconcileOutcome, SubscriptionStatus, SubscriptionUpdate,
    MAX_CHARGE_ATTEMPTS,
};
use bank_recon_rust::service::BillingEngine;
use bank_recon_rust::AppError;
use chrono::Utc;
use common::{date, declined, subscription, ScriptedGateway};
use std::sync::Arc;

struct Harness {
    repo: Arc<InMemoryBilling>,
    gateway: Arc<ScriptedGateway>,
    engine: BillingEngine,
}

fn harness(gateway: ScriptedGateway) -> Harness {
    let repo = Arc::new(InMemoryBilling::new());
    let gateway = Arc::new(gateway);
    let engine = BillingEngine::new(repo.clone(), gateway.clone());
    Harness {
        repo,
        gateway,
        engine,
    }
}

/// 在第 `cancel_on_call` 次扣款等待网关期间取消订阅
struct CancelDuringCharge {
    inner: ScriptedGateway,
    repo: Arc<InMemoryBilling>,
    subscription_id: i64,
    cancel_on_call: usize,
}

#[async_trait]
impl PaymentGateway for CancelDuringCharge {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, GatewayError> {
        let outcome = self.inner.charge(request).await;
        if self.inner.calls() == self.cancel_on_call {
            let cancel = SubscriptionUpdate {
                status: Some(SubscriptionStatus::Canceled),
                canceled_at: Some(Utc::now()),
                ..Default::default()
            };
            let applied = self
                .repo
                .update_subscription(self.subscription_id, &cancel)
                .await
                .unwrap();
            assert!(applied);
        }
        outcome
    }
}

fn cancel_during_charge(
    inner: ScriptedGateway,
    cancel_on_call: usize,
) -> (Arc<InMemoryBilling>, Arc<CancelDuringCharge>, BillingEngine) {
    let repo = Arc::new(InMemoryBilling::new());
    let gateway = Arc::new(CancelDuringCharge {
        inner,
        repo: repo.clone(),
        subscription_id: 1,
        cancel_on_call,
    });
    let engine = BillingEngine::new(repo.clone(), gateway.clone());
    (repo, gateway, engine)
}

fn event(charge_ref: &str, outcome: EventOutcome) -> GatewayEvent {
    GatewayEvent {
        charge_ref: charge_ref.to_string(),
        outcome,
        failure_code: None,
        failure_message: None,
    }
}

#[tokio::test]
async fn successful_charge_advances_the_period() {
    let h = harness(ScriptedGateway::succeeding());
    h.repo.insert_subscription(subscription(1, 11, date(2024, 1, 1))).unwrap();

    let stats = h.engine.process_monthly_billing(date(2024, 1, 1)).await.unwrap();

    assert_eq!(stats.charged, 1);
    assert_eq!(stats.failed, 0);
    let sub = h.repo.subscription(1).unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.current_period_start, date(2024, 1, 1));
    assert_eq!(sub.current_period_end, date(2024, 2, 1));
    assert_eq!(sub.next_payment_date, date(2024, 2, 1));
    assert_eq!(sub.consecutive_failed_attempts, 0);

    let cycles = h.repo.cycles_for(1);
    assert_eq!(cycles.len(), 1);
    assert_eq!(cycles[0].status, CycleStatus::Paid);
    assert!(cycles[0].paid_at.is_some());

    let payments = h.repo.payments_for(1);
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Succeeded);
    assert_eq!(payments[0].charge_ref, "sub1-20240101-a1");
    assert_eq!(h.gateway.requests()[0].charge_ref, "sub1-20240101-a1");
    assert_eq!(h.gateway.requests()[0].amount, 2_900);
}

#[tokio::test]
async fn subscriptions_not_yet_due_are_left_alone() {
    let h = harness(ScriptedGateway::succeeding());
    h.repo.insert_subscription(subscription(1, 11, date(2024, 1, 2))).unwrap();

    let stats = h.engine.process_monthly_billing(date(2024, 1, 1)).await.unwrap();

    assert_eq!(stats.charged + stats.failed + stats.skipped, 0);
    assert_eq!(h.gateway.calls(), 0);
}

#[tokio::test]
async fn ended_trial_is_charged() {
    let h = harness(ScriptedGateway::succeeding());
    let mut trial = subscription(1, 11, date(2024, 1, 1));
    trial.status = SubscriptionStatus::Trialing;
    h.repo.insert_subscription(trial).unwrap();

    let stats = h.engine.process_monthly_billing(date(2024, 1, 3)).await.unwrap();

    assert_eq!(stats.charged, 1);
    assert_eq!(h.repo.subscription(1).unwrap().status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn five_consecutive_failures_suspend_the_subscription() {
    let h = harness(ScriptedGateway::declining());
    h.repo.insert_subscription(subscription(1, 11, date(2024, 1, 1))).unwrap();

    let stats = h.engine.process_monthly_billing(date(2024, 1, 1)).await.unwrap();
    assert_eq!(stats.failed, 1);
    let sub = h.repo.subscription(1).unwrap();
    assert_eq!(sub.status, SubscriptionStatus::PastDue);
    assert_eq!(sub.consecutive_failed_attempts, 1);
    assert_eq!(sub.last_failure_reason.as_deref(), Some("card_declined"));

    for day in 2..=4 {
        let retry = h.engine.process_payment_retries(date(2024, 1, day)).await.unwrap();
        assert_eq!(retry.retried, 1);
        assert_eq!(retry.suspended, 0);
        let sub = h.repo.subscription(1).unwrap();
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        assert_eq!(sub.consecutive_failed_attempts, day);
    }

    let retry = h.engine.process_payment_retries(date(2024, 1, 5)).await.unwrap();
    assert_eq!(retry.retried, 1);
    assert_eq!(retry.suspended, 1);
    let sub = h.repo.subscription(1).unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Suspended);
    assert_eq!(sub.consecutive_failed_attempts, MAX_CHARGE_ATTEMPTS);
    assert!(sub.suspended_at.is_some());

    // 暂停后不再自动重试
    let retry = h.engine.process_payment_retries(date(2024, 1, 6)).await.unwrap();
    assert_eq!(retry.retried, 0);
    assert_eq!(h.gateway.calls(), 5);
    assert!(!h.engine.check_subscription_features(11).await.unwrap());

    let cycles = h.repo.cycles_for(1);
    assert_eq!(cycles.len(), 1);
    assert_eq!(cycles[0].attempt_count, 5);
    assert_eq!(cycles[0].status, CycleStatus::Failed);
    assert_eq!(h.repo.payments_for(1).len(), 5);
}

#[tokio::test]
async fn success_on_third_attempt_resets_the_counter() {
    let h = harness(ScriptedGateway::scripted(
        vec![declined(), declined()],
        Ok(ChargeOutcome::Succeeded),
    ));
    h.repo.insert_subscription(subscription(1, 11, date(2024, 1, 1))).unwrap();

    h.engine.process_monthly_billing(date(2024, 1, 1)).await.unwrap();
    h.engine.process_payment_retries(date(2024, 1, 2)).await.unwrap();
    assert_eq!(h.repo.subscription(1).unwrap().consecutive_failed_attempts, 2);

    let retry = h.engine.process_payment_retries(date(2024, 1, 3)).await.unwrap();
    assert_eq!(retry.succeeded, 1);

    let sub = h.repo.subscription(1).unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.consecutive_failed_attempts, 0);
    assert_eq!(sub.next_payment_date, date(2024, 2, 1));
    assert_eq!(sub.last_failure_reason, None);

    let cycles = h.repo.cycles_for(1);
    assert_eq!(cycles[0].attempt_count, 3);
    assert_eq!(cycles[0].status, CycleStatus::Paid);
    let refs: Vec<String> = h
        .repo
        .payments_for(1)
        .into_iter()
        .map(|p| p.charge_ref)
        .collect();
    assert_eq!(
        refs,
        vec!["sub1-20240101-a1", "sub1-20240101-a2", "sub1-20240101-a3"]
    );
}

#[tokio::test]
async fn rerunning_the_same_day_never_charges_twice() {
    let h = harness(ScriptedGateway::succeeding());
    let mut behind = subscription(1, 11, date(2023, 12, 1));
    behind.current_period_end = date(2023, 12, 1);
    h.repo.insert_subscription(behind).unwrap();

    let first = h.engine.process_monthly_billing(date(2024, 1, 1)).await.unwrap();
    assert_eq!(first.charged, 1);

    // 仍落后一个周期，但当天已尝试过
    let second = h.engine.process_monthly_billing(date(2024, 1, 1)).await.unwrap();
    assert_eq!(second.charged, 0);
    assert_eq!(second.skipped, 1);
    assert_eq!(h.gateway.calls(), 1);
    assert_eq!(h.repo.payments_for(1).len(), 1);
}

#[tokio::test]
async fn retry_is_skipped_on_the_day_of_the_failure() {
    let h = harness(ScriptedGateway::declining());
    h.repo.insert_subscription(subscription(1, 11, date(2024, 1, 1))).unwrap();

    h.engine.process_monthly_billing(date(2024, 1, 1)).await.unwrap();
    let again = h.engine.process_monthly_billing(date(2024, 1, 1)).await.unwrap();
    let retry = h.engine.process_payment_retries(date(2024, 1, 1)).await.unwrap();

    assert_eq!(again.failed, 0);
    assert_eq!(retry.retried, 0);
    assert_eq!(retry.skipped, 1);
    assert_eq!(h.gateway.calls(), 1);
    assert_eq!(h.repo.subscription(1).unwrap().consecutive_failed_attempts, 1);
}

#[tokio::test]
async fn exhausted_past_due_subscription_is_suspended_without_charging() {
    let h = harness(ScriptedGateway::succeeding());
    let mut sub = subscription(1, 11, date(2024, 1, 1));
    sub.status = SubscriptionStatus::PastDue;
    sub.consecutive_failed_attempts = MAX_CHARGE_ATTEMPTS;
    h.repo.insert_subscription(sub).unwrap();

    let retry = h.engine.process_payment_retries(date(2024, 1, 9)).await.unwrap();

    assert_eq!(retry.suspended, 1);
    assert_eq!(retry.retried, 0);
    assert_eq!(h.gateway.calls(), 0);
    assert_eq!(h.repo.subscription(1).unwrap().status, SubscriptionStatus::Suspended);
}

#[tokio::test]
async fn gateway_outage_counts_as_failed_attempt() {
    let h = harness(ScriptedGateway::always(Err(GatewayError(
        "connection refused".to_string(),
    ))));
    h.repo.insert_subscription(subscription(1, 11, date(2024, 1, 1))).unwrap();
    h.repo.insert_subscription(subscription(2, 12, date(2024, 1, 1))).unwrap();

    let stats = h.engine.process_monthly_billing(date(2024, 1, 1)).await.unwrap();

    assert_eq!(stats.failed, 2);
    assert_eq!(stats.gateway_errors, 2);
    let sub = h.repo.subscription(1).unwrap();
    assert_eq!(sub.status, SubscriptionStatus::PastDue);
    assert_eq!(sub.last_failure_reason.as_deref(), Some("gateway_error"));
    let payment = &h.repo.payments_for(1)[0];
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(payment.failure_code.as_deref(), Some("gateway_error"));
}

#[tokio::test]
async fn timeout_is_a_failure_until_the_webhook_confirms() {
    let h = harness(ScriptedGateway::always(Ok(ChargeOutcome::TimedOut)));
    h.repo.insert_subscription(subscription(1, 11, date(2024, 1, 1))).unwrap();

    let stats = h.engine.process_monthly_billing(date(2024, 1, 1)).await.unwrap();
    assert_eq!(stats.failed, 1);

    let payment = h.repo.payments_for(1).remove(0);
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.failure_code.as_deref(), Some("timeout"));
    assert_eq!(h.repo.subscription(1).unwrap().status, SubscriptionStatus::PastDue);

    let outcome = h
        .engine
        .apply_gateway_event(&event(&payment.charge_ref, EventOutcome::Succeeded))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Applied);

    let sub = h.repo.subscription(1).unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.consecutive_failed_attempts, 0);
    assert_eq!(sub.next_payment_date, date(2024, 2, 1));
    assert_eq!(h.repo.cycles_for(1)[0].status, CycleStatus::Paid);

    let replay = h
        .engine
        .apply_gateway_event(&event(&payment.charge_ref, EventOutcome::Succeeded))
        .await
        .unwrap();
    assert_eq!(replay, ReconcileOutcome::AlreadyApplied);

    // 成功之后的失败回调不能覆盖
    let late_failure = h
        .engine
        .apply_gateway_event(&event(&payment.charge_ref, EventOutcome::Failed))
        .await
        .unwrap();
    assert_eq!(late_failure, ReconcileOutcome::Ignored);
    assert_eq!(h.repo.payments_for(1)[0].status, PaymentStatus::Succeeded);
}

#[tokio::test]
async fn webhook_success_overrides_a_recorded_decline() {
    let h = harness(ScriptedGateway::declining());
    h.repo.insert_subscription(subscription(1, 11, date(2024, 1, 1))).unwrap();
    h.engine.process_monthly_billing(date(2024, 1, 1)).await.unwrap();

    let outcome = h
        .engine
        .apply_gateway_event(&event("sub1-20240101-a1", EventOutcome::Succeeded))
        .await
        .unwrap();

    assert_eq!(outcome, ReconcileOutcome::Applied);
    assert_eq!(h.repo.payments_for(1)[0].status, PaymentStatus::Succeeded);
    let sub = h.repo.subscription(1).unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.consecutive_failed_attempts, 0);
}

#[tokio::test]
async fn failure_webhook_completes_a_pending_charge() {
    let h = harness(ScriptedGateway::always(Ok(ChargeOutcome::TimedOut)));
    h.repo.insert_subscription(subscription(1, 11, date(2024, 1, 1))).unwrap();
    h.engine.process_monthly_billing(date(2024, 1, 1)).await.unwrap();

    let mut failed = event("sub1-20240101-a1", EventOutcome::Failed);
    failed.failure_code = Some("expired_card".to_string());
    let outcome = h.engine.apply_gateway_event(&failed).await.unwrap();

    assert_eq!(outcome, ReconcileOutcome::Applied);
    let payment = &h.repo.payments_for(1)[0];
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(payment.failure_code.as_deref(), Some("expired_card"));
    // 超时时已计过一次失败，不重复计数
    assert_eq!(h.repo.subscription(1).unwrap().consecutive_failed_attempts, 1);

    let replay = h.engine.apply_gateway_event(&failed).await.unwrap();
    assert_eq!(replay, ReconcileOutcome::AlreadyApplied);
}

#[tokio::test]
async fn webhook_for_unknown_charge_is_reported() {
    let h = harness(ScriptedGateway::succeeding());
    let outcome = h
        .engine
        .apply_gateway_event(&event("sub9-20240101-a1", EventOutcome::Succeeded))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::UnknownCharge);
}

#[tokio::test]
async fn feature_access_follows_status() {
    let h = harness(ScriptedGateway::succeeding());
    let cases = [
        (SubscriptionStatus::Trialing, true),
        (SubscriptionStatus::Active, true),
        (SubscriptionStatus::PastDue, true),
        (SubscriptionStatus::Suspended, false),
        (SubscriptionStatus::Canceled, false),
    ];
    for (i, (status, _)) in cases.iter().enumerate() {
        let mut sub = subscription(i as i64 + 1, 100 + i as i64, date(2024, 1, 1));
        sub.status = *status;
        h.repo.insert_subscription(sub).unwrap();
    }

    for (i, (status, expected)) in cases.iter().enumerate() {
        let allowed = h
            .engine
            .check_subscription_features(100 + i as i64)
            .await
            .unwrap();
        assert_eq!(allowed, *expected, "status {status}");
    }
    assert!(!h.engine.check_subscription_features(999).await.unwrap());
}

#[tokio::test]
async fn summary_reports_grace_period_and_missing_subscription() {
    let h = harness(ScriptedGateway::declining());
    h.repo.insert_subscription(subscription(1, 11, date(2024, 1, 1))).unwrap();
    h.engine.process_monthly_billing(date(2024, 1, 1)).await.unwrap();

    let summary = h.engine.get_subscription_status_summary(11).await.unwrap();
    assert_eq!(summary.status, SubscriptionStatus::PastDue);
    assert_eq!(summary.attempts_used, 1);
    assert_eq!(summary.attempts_remaining, 4);
    assert!(summary.can_access_features);
    assert_eq!(
        summary.warning.as_deref(),
        Some("Payment failed. 4 attempts left before account suspension.")
    );

    assert!(matches!(
        h.engine.get_subscription_status_summary(404).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn canceled_subscription_is_terminal() {
    let h = harness(ScriptedGateway::always(Ok(ChargeOutcome::TimedOut)));
    h.repo.insert_subscription(subscription(1, 11, date(2024, 1, 1))).unwrap();
    h.engine.process_monthly_billing(date(2024, 1, 1)).await.unwrap();

    let canceled = h.engine.cancel_subscription(1).await.unwrap();
    assert_eq!(canceled.status, SubscriptionStatus::Canceled);
    assert!(canceled.canceled_at.is_some());
    // 重复取消是幂等的
    let again = h.engine.cancel_subscription(1).await.unwrap();
    assert_eq!(again.canceled_at, canceled.canceled_at);

    // 迟到的成功回调只更新扣款记录，不会重新激活
    let outcome = h
        .engine
        .apply_gateway_event(&event("sub1-20240101-a1", EventOutcome::Succeeded))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Applied);
    assert_eq!(h.repo.subscription(1).unwrap().status, SubscriptionStatus::Canceled);

    let retry = h.engine.process_payment_retries(date(2024, 1, 2)).await.unwrap();
    let monthly = h.engine.process_monthly_billing(date(2024, 2, 1)).await.unwrap();
    assert_eq!(retry.retried + monthly.charged + monthly.failed, 0);

    assert!(matches!(
        h.engine.reactivate_subscription(1, None, date(2024, 2, 1)).await,
        Err(AppError::Conflict(_))
    ));
    assert!(matches!(
        h.engine.cancel_subscription(404).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn decline_does_not_revive_a_subscription_canceled_mid_charge() {
    let (repo, gateway, engine) = cancel_during_charge(ScriptedGateway::declining(), 1);
    repo.insert_subscription(subscription(1, 11, date(2024, 1, 1))).unwrap();

    let stats = engine.process_monthly_billing(date(2024, 1, 1)).await.unwrap();
    assert_eq!(stats.charged, 0);
    assert_eq!(stats.suspended, 0);

    let sub = repo.subscription(1).unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Canceled);
    assert_eq!(sub.consecutive_failed_attempts, 0);
    assert_eq!(repo.payments_for(1)[0].status, PaymentStatus::Failed);

    // 已取消的订阅不再重试
    let retry = engine.process_payment_retries(date(2024, 1, 2)).await.unwrap();
    assert_eq!(retry.retried, 0);
    assert_eq!(gateway.inner.calls(), 1);
}

#[tokio::test]
async fn success_does_not_revive_a_subscription_canceled_mid_charge() {
    let (repo, gateway, engine) = cancel_during_charge(ScriptedGateway::succeeding(), 1);
    repo.insert_subscription(subscription(1, 11, date(2024, 1, 1))).unwrap();

    engine.process_monthly_billing(date(2024, 1, 1)).await.unwrap();

    // 钱已收到：扣款与周期记为已付，但订阅保持取消
    assert_eq!(repo.payments_for(1)[0].status, PaymentStatus::Succeeded);
    assert_eq!(repo.cycles_for(1)[0].status, CycleStatus::Paid);
    let sub = repo.subscription(1).unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Canceled);
    assert_eq!(sub.next_payment_date, date(2024, 1, 1));

    let monthly = engine.process_monthly_billing(date(2024, 2, 1)).await.unwrap();
    assert_eq!(monthly.charged + monthly.failed, 0);
    assert_eq!(gateway.inner.calls(), 1);
}

#[tokio::test]
async fn final_retry_canceled_mid_charge_is_not_suspended() {
    let (repo, gateway, engine) = cancel_during_charge(ScriptedGateway::declining(), 1);
    let mut sub = subscription(1, 11, date(2024, 1, 1));
    sub.status = SubscriptionStatus::PastDue;
    sub.consecutive_failed_attempts = MAX_CHARGE_ATTEMPTS - 1;
    sub.last_attempt_on = Some(date(2024, 1, 4));
    repo.insert_subscription(sub).unwrap();

    let retry = engine.process_payment_retries(date(2024, 1, 5)).await.unwrap();

    assert_eq!(retry.retried, 1);
    assert_eq!(retry.suspended, 0);
    assert_eq!(gateway.inner.calls(), 1);
    let sub = repo.subscription(1).unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Canceled);
    assert!(sub.suspended_at.is_none());
    assert_eq!(sub.consecutive_failed_attempts, MAX_CHARGE_ATTEMPTS - 1);
}

#[tokio::test]
async fn webhook_after_mid_charge_cancel_keeps_subscription_canceled() {
    let (repo, _gateway, engine) =
        cancel_during_charge(ScriptedGateway::always(Ok(ChargeOutcome::TimedOut)), 1);
    repo.insert_subscription(subscription(1, 11, date(2024, 1, 1))).unwrap();

    engine.process_monthly_billing(date(2024, 1, 1)).await.unwrap();
    assert_eq!(repo.subscription(1).unwrap().status, SubscriptionStatus::Canceled);
    let payment = repo.payments_for(1).remove(0);
    assert_eq!(payment.status, PaymentStatus::Pending);

    let outcome = engine
        .apply_gateway_event(&event(&payment.charge_ref, EventOutcome::Succeeded))
        .await
        .unwrap();

    assert_eq!(outcome, ReconcileOutcome::Applied);
    assert_eq!(repo.payments_for(1)[0].status, PaymentStatus::Succeeded);
    let sub = repo.subscription(1).unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Canceled);
    assert_eq!(sub.next_payment_date, date(2024, 1, 1));
}

#[tokio::test]
async fn late_success_settles_a_suspended_subscription() {
    let h = harness(ScriptedGateway::always(Ok(ChargeOutcome::TimedOut)));
    let mut sub = subscription(1, 11, date(2024, 1, 1));
    sub.status = SubscriptionStatus::PastDue;
    sub.consecutive_failed_attempts = MAX_CHARGE_ATTEMPTS - 1;
    sub.last_attempt_on = Some(date(2024, 1, 4));
    h.repo.insert_subscription(sub).unwrap();

    let retry = h.engine.process_payment_retries(date(2024, 1, 5)).await.unwrap();
    assert_eq!(retry.suspended, 1);
    assert_eq!(h.repo.subscription(1).unwrap().status, SubscriptionStatus::Suspended);

    let payment = h.repo.payments_for(1).remove(0);
    h.engine
        .apply_gateway_event(&event(&payment.charge_ref, EventOutcome::Succeeded))
        .await
        .unwrap();

    let sub = h.repo.subscription(1).unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert!(sub.suspended_at.is_none());
    assert_eq!(sub.next_payment_date, date(2024, 2, 1));
}

#[tokio::test]
async fn reactivation_charges_the_outstanding_period() {
    let h = harness(ScriptedGateway::scripted(
        vec![declined(), declined(), declined(), declined(), declined(), declined()],
        Ok(ChargeOutcome::Succeeded),
    ));
    h.repo.insert_subscription(subscription(1, 11, date(2024, 1, 1))).unwrap();

    h.engine.process_monthly_billing(date(2024, 1, 1)).await.unwrap();
    for day in 2..=5 {
        h.engine.process_payment_retries(date(2024, 1, day)).await.unwrap();
    }
    assert_eq!(h.repo.subscription(1).unwrap().status, SubscriptionStatus::Suspended);

    // 第 6 次仍被拒：保持暂停
    let still = h
        .engine
        .reactivate_subscription(1, None, date(2024, 1, 10))
        .await
        .unwrap();
    assert_eq!(still.status, SubscriptionStatus::Suspended);
    assert_eq!(still.last_failure_reason.as_deref(), Some("card_declined"));

    let active = h
        .engine
        .reactivate_subscription(1, Some("pm_new".to_string()), date(2024, 1, 10))
        .await
        .unwrap();
    assert_eq!(active.status, SubscriptionStatus::Active);
    assert_eq!(active.consecutive_failed_attempts, 0);
    assert_eq!(active.payment_method_ref.as_deref(), Some("pm_new"));
    assert_eq!(active.next_payment_date, date(2024, 2, 1));
    assert!(active.suspended_at.is_none());

    let last = h.gateway.requests().pop().unwrap();
    assert_eq!(last.payment_method_ref.as_deref(), Some("pm_new"));
    assert_eq!(last.charge_ref, "sub1-20240101-a7");

    assert!(matches!(
        h.engine.reactivate_subscription(1, None, date(2024, 1, 11)).await,
        Err(AppError::Conflict(_))
    ));
}

#[tokio::test]
async fn repository_failure_aborts_the_batch_after_in_flight_work() {
    let h = harness(ScriptedGateway::succeeding());
    let engine = BillingEngine::new(h.repo.clone(), h.gateway.clone()).with_concurrency(1);
    for id in 1..=3 {
        h.repo
            .insert_subscription(subscription(id, 10 + id, date(2024, 1, 1)))
            .unwrap();
    }
    // 一次成功扣款共 6 次写入
    h.repo.fail_writes_after(6).unwrap();

    let err = engine.process_monthly_billing(date(2024, 1, 1)).await.unwrap_err();

    match err {
        AppError::BatchAborted { processed, source } => {
            assert_eq!(processed, 1);
            assert!(matches!(*source, AppError::Repository(_)));
        }
        other => panic!("expected BatchAborted, got {other:?}"),
    }
    assert_eq!(h.gateway.calls(), 1);
    assert_eq!(h.repo.subscription(1).unwrap().next_payment_date, date(2024, 2, 1));
    assert_eq!(h.repo.subscription(2).unwrap().next_payment_date, date(2024, 1, 1));
}
