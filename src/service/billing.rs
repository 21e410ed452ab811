//! 订阅计费与失败重试
//!
//! 每个订阅在一个计费周期内最多扣款 5 次 (首次 + 4 次按日重试)，用尽后暂停。
//! 同一订阅同一天最多一次尝试，由仓库的 `claim_billing_attempt` 条件更新保证，
//! 因此两个批处理任务都可以在同一天安全重跑。

use chrono::{NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::db::BillingRepository;
use crate::error::{AppError, AppResult};
use crate::gateway::{ChargeOutcome, ChargeRequest, PaymentGateway};
use crate::models::{
    BillingCycle, BillingStats, CycleStatus, NewPaymentTransaction, PaymentStatus, RetryStats,
    Subscription, SubscriptionStatus, SubscriptionSummary, SubscriptionUpdate,
    MAX_CHARGE_ATTEMPTS,
};

pub const REASON_TIMEOUT: &str = "timeout";
pub const REASON_GATEWAY_ERROR: &str = "gateway_error";
pub const DEFAULT_CONCURRENCY: usize = 4;

/// 网关幂等键：订阅 + 周期起始日 + 周期内第几次尝试
pub fn charge_reference(subscription_id: i64, period_start: NaiveDate, attempt: u32) -> String {
    format!(
        "sub{}-{}-a{}",
        subscription_id,
        period_start.format("%Y%m%d"),
        attempt
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptKind {
    Scheduled,
    Retry,
    /// 暂停后的人工恢复；不受每日一次限制，失败不累加计数
    Reactivation,
}

/// 单次扣款尝试的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Paid,
    Failed {
        reason: String,
        suspended: bool,
        gateway_error: bool,
    },
    /// 当天已尝试过或订阅已不在该周期
    Skipped,
}

/// 计费引擎
pub struct BillingEngine {
    repo: Arc<dyn BillingRepository>,
    gateway: Arc<dyn PaymentGateway>,
    concurrency: usize,
}

impl BillingEngine {
    pub fn new(repo: Arc<dyn BillingRepository>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            repo,
            gateway,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// 对到期的 active / trialing 订阅各扣款一次
    pub async fn process_monthly_billing(&self, run_date: NaiveDate) -> AppResult<BillingStats> {
        let started = Instant::now();
        let due = self
            .repo
            .get_due_subscriptions(run_date)
            .await
            .map_err(|e| AppError::aborted(0, e))?;
        tracing::info!(%run_date, due = due.len(), "monthly billing started");

        let outcomes = self.run_batch(due, run_date, AttemptKind::Scheduled).await?;

        let mut stats = BillingStats {
            run_date: Some(run_date),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                AttemptOutcome::Paid => stats.charged += 1,
                AttemptOutcome::Failed {
                    suspended,
                    gateway_error,
                    ..
                } => {
                    stats.failed += 1;
                    stats.gateway_errors += usize::from(gateway_error);
                    stats.suspended += usize::from(suspended);
                }
                AttemptOutcome::Skipped => stats.skipped += 1,
            }
        }

        tracing::info!(
            %run_date,
            charged = stats.charged,
            failed = stats.failed,
            skipped = stats.skipped,
            gateway_errors = stats.gateway_errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "monthly billing finished"
        );
        Ok(stats)
    }

    /// 对 past_due 订阅按日重试；已用尽次数的直接暂停
    pub async fn process_payment_retries(&self, run_date: NaiveDate) -> AppResult<RetryStats> {
        let started = Instant::now();
        let past_due = self
            .repo
            .get_past_due_subscriptions()
            .await
            .map_err(|e| AppError::aborted(0, e))?;
        tracing::info!(%run_date, past_due = past_due.len(), "payment retries started");

        let mut stats = RetryStats {
            run_date: Some(run_date),
            ..Default::default()
        };

        let mut retryable = Vec::with_capacity(past_due.len());
        let mut processed = 0;
        for subscription in past_due {
            if subscription.consecutive_failed_attempts >= MAX_CHARGE_ATTEMPTS {
                let suspended = self
                    .suspend_exhausted(&subscription)
                    .await
                    .map_err(|e| AppError::aborted(processed, e))?;
                processed += 1;
                if suspended {
                    stats.suspended += 1;
                } else {
                    stats.skipped += 1;
                }
            } else if subscription.attempted_on(run_date) {
                processed += 1;
                stats.skipped += 1;
            } else {
                retryable.push(subscription);
            }
        }

        let outcomes = self
            .run_batch(retryable, run_date, AttemptKind::Retry)
            .await
            .map_err(|e| match e {
                AppError::BatchAborted { processed: done, source } => {
                    AppError::BatchAborted {
                        processed: processed + done,
                        source,
                    }
                }
                other => other,
            })?;

        for outcome in outcomes {
            match outcome {
                AttemptOutcome::Paid => {
                    stats.retried += 1;
                    stats.succeeded += 1;
                }
                AttemptOutcome::Failed {
                    suspended,
                    gateway_error,
                    ..
                } => {
                    stats.retried += 1;
                    stats.gateway_errors += usize::from(gateway_error);
                    stats.suspended += usize::from(suspended);
                }
                AttemptOutcome::Skipped => stats.skipped += 1,
            }
        }

        tracing::info!(
            %run_date,
            retried = stats.retried,
            succeeded = stats.succeeded,
            suspended = stats.suspended,
            skipped = stats.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "payment retries finished"
        );
        Ok(stats)
    }

    /// 有界并发地处理一批订阅
    ///
    /// 出现存储错误后不再启动新的订阅，已在途的扣款照常完成，最后返回 `BatchAborted`。
    async fn run_batch(
        &self,
        subscriptions: Vec<Subscription>,
        run_date: NaiveDate,
        kind: AttemptKind,
    ) -> AppResult<Vec<AttemptOutcome>> {
        let aborted = AtomicBool::new(false);

        let results: Vec<Option<AppResult<AttemptOutcome>>> = stream::iter(subscriptions)
            .map(|subscription| {
                let aborted = &aborted;
                async move {
                    if aborted.load(Ordering::SeqCst) {
                        return None;
                    }
                    let result = self.attempt_charge(&subscription, run_date, kind).await;
                    if let Err(e) = &result {
                        tracing::error!(
                            subscription_id = subscription.id,
                            error = %e,
                            "billing attempt failed, stopping batch"
                        );
                        aborted.store(true, Ordering::SeqCst);
                    }
                    Some(result)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut outcomes = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results.into_iter().flatten() {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(AppError::aborted(outcomes.len(), e)),
            None => Ok(outcomes),
        }
    }

    /// 对订阅当前待付周期尝试一次扣款
    async fn attempt_charge(
        &self,
        subscription: &Subscription,
        run_date: NaiveDate,
        kind: AttemptKind,
    ) -> AppResult<AttemptOutcome> {
        let period_start = subscription.next_payment_date;
        let period_end = subscription.billing_interval.advance(period_start)?;

        if kind != AttemptKind::Reactivation
            && !self
                .repo
                .claim_billing_attempt(subscription.id, period_start, run_date)
                .await?
        {
            tracing::debug!(
                subscription_id = subscription.id,
                %period_start,
                "already attempted today, skipping"
            );
            return Ok(AttemptOutcome::Skipped);
        }

        let existing = self
            .repo
            .get_billing_cycle(subscription.id, period_start)
            .await?;
        if existing.as_ref().map_or(false, BillingCycle::is_paid) {
            tracing::warn!(
                subscription_id = subscription.id,
                %period_start,
                "period already paid, skipping charge"
            );
            return Ok(AttemptOutcome::Skipped);
        }

        let attempt = existing.as_ref().map_or(0, |c| c.attempt_count) + 1;
        let mut cycle = existing.unwrap_or_else(|| BillingCycle {
            id: 0,
            subscription_id: subscription.id,
            period_start,
            period_end,
            amount: subscription.amount,
            currency: subscription.currency.clone(),
            status: CycleStatus::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            paid_at: None,
        });
        cycle.status = if attempt > 1 {
            CycleStatus::Retrying
        } else {
            CycleStatus::Pending
        };
        cycle.attempt_count = attempt;
        cycle.last_attempt_at = Some(Utc::now());
        let mut cycle = self.repo.record_billing_cycle(&cycle).await?;

        let charge_ref = charge_reference(subscription.id, period_start, attempt);
        self.repo
            .record_payment_transaction(NewPaymentTransaction {
                subscription_id: subscription.id,
                billing_cycle_id: cycle.id,
                charge_ref: charge_ref.clone(),
                amount: cycle.amount,
                currency: cycle.currency.clone(),
                status: PaymentStatus::Pending,
                failure_code: None,
                failure_message: None,
            })
            .await?;

        let request = ChargeRequest {
            customer_ref: subscription.gateway_customer_ref.clone(),
            amount: cycle.amount,
            currency: cycle.currency.clone(),
            payment_method_ref: subscription.payment_method_ref.clone(),
            charge_ref: charge_ref.clone(),
            description: format!(
                "{} {} {} - {}",
                subscription.plan_id, subscription.billing_interval, period_start, period_end
            ),
        };

        let (reason, gateway_error) = match self.gateway.charge(&request).await {
            Ok(ChargeOutcome::Succeeded) => {
                self.repo
                    .update_payment_transaction(
                        &charge_ref,
                        PaymentStatus::Pending,
                        PaymentStatus::Succeeded,
                        None,
                        None,
                    )
                    .await?;
                cycle.status = CycleStatus::Paid;
                cycle.paid_at = Some(Utc::now());
                self.repo.record_billing_cycle(&cycle).await?;

                let settled = SubscriptionUpdate::settled(period_start, cycle.period_end)
                    .only_if_next_payment_on(period_start)
                    .only_if_status(subscription.status);
                if !self.repo.update_subscription(subscription.id, &settled).await? {
                    tracing::warn!(
                        subscription_id = subscription.id,
                        %period_start,
                        "subscription changed during charge, settlement not applied"
                    );
                }
                tracing::info!(
                    subscription_id = subscription.id,
                    %charge_ref,
                    attempt,
                    amount = cycle.amount,
                    "charge succeeded"
                );
                return Ok(AttemptOutcome::Paid);
            }
            Ok(ChargeOutcome::Declined { code, message }) => {
                self.repo
                    .update_payment_transaction(
                        &charge_ref,
                        PaymentStatus::Pending,
                        PaymentStatus::Failed,
                        Some(code.clone()),
                        message,
                    )
                    .await?;
                (code, false)
            }
            Ok(ChargeOutcome::TimedOut) => {
                // 结果未知：保持 pending，等待 webhook
                self.repo
                    .update_payment_transaction(
                        &charge_ref,
                        PaymentStatus::Pending,
                        PaymentStatus::Pending,
                        Some(REASON_TIMEOUT.to_string()),
                        Some("gateway did not answer in time".to_string()),
                    )
                    .await?;
                (REASON_TIMEOUT.to_string(), false)
            }
            Err(e) => {
                tracing::error!(
                    subscription_id = subscription.id,
                    %charge_ref,
                    error = %e,
                    "payment gateway error"
                );
                self.repo
                    .update_payment_transaction(
                        &charge_ref,
                        PaymentStatus::Pending,
                        PaymentStatus::Failed,
                        Some(REASON_GATEWAY_ERROR.to_string()),
                        Some(e.to_string()),
                    )
                    .await?;
                (REASON_GATEWAY_ERROR.to_string(), true)
            }
        };

        cycle.status = CycleStatus::Failed;
        self.repo.record_billing_cycle(&cycle).await?;

        let suspended = self
            .record_failure(subscription, period_start, &reason, kind)
            .await?;
        Ok(AttemptOutcome::Failed {
            reason,
            suspended,
            gateway_error,
        })
    }

    /// 记录失败：计数 +1，进入 past_due，第 5 次失败后暂停。返回是否因此暂停。
    async fn record_failure(
        &self,
        subscription: &Subscription,
        period_start: NaiveDate,
        reason: &str,
        kind: AttemptKind,
    ) -> AppResult<bool> {
        if kind == AttemptKind::Reactivation {
            let update = SubscriptionUpdate {
                last_failure_reason: Some(Some(reason.to_string())),
                ..Default::default()
            }
            .only_if_next_payment_on(period_start)
            .only_if_status(subscription.status);
            self.repo.update_subscription(subscription.id, &update).await?;
            tracing::warn!(
                subscription_id = subscription.id,
                reason,
                "reactivation charge failed, subscription stays suspended"
            );
            return Ok(false);
        }

        let attempts = (subscription.consecutive_failed_attempts + 1).min(MAX_CHARGE_ATTEMPTS);
        let exhausted = attempts >= MAX_CHARGE_ATTEMPTS;
        let next = if exhausted {
            SubscriptionStatus::Suspended
        } else {
            SubscriptionStatus::PastDue
        };
        ensure_transition(subscription, next)?;

        let update = SubscriptionUpdate {
            status: Some(next),
            consecutive_failed_attempts: Some(attempts),
            suspended_at: exhausted.then(|| Some(Utc::now())),
            last_failure_reason: Some(Some(reason.to_string())),
            ..Default::default()
        }
        .only_if_next_payment_on(period_start)
        .only_if_status(subscription.status);
        let applied = self.repo.update_subscription(subscription.id, &update).await?;

        if !applied {
            tracing::warn!(
                subscription_id = subscription.id,
                reason,
                "subscription changed during charge, failure not counted"
            );
            return Ok(false);
        }
        if exhausted {
            tracing::warn!(
                subscription_id = subscription.id,
                user_id = subscription.user_id,
                attempts,
                reason,
                "subscription suspended after exhausting payment attempts"
            );
        } else {
            tracing::info!(
                subscription_id = subscription.id,
                attempts,
                remaining = MAX_CHARGE_ATTEMPTS - attempts,
                reason,
                "charge failed, retry scheduled for next day"
            );
        }
        Ok(exhausted)
    }

    /// 计数已满却仍为 past_due 的订阅直接暂停，不再扣款
    async fn suspend_exhausted(&self, subscription: &Subscription) -> AppResult<bool> {
        ensure_transition(subscription, SubscriptionStatus::Suspended)?;
        let update = SubscriptionUpdate {
            status: Some(SubscriptionStatus::Suspended),
            suspended_at: Some(Some(Utc::now())),
            ..Default::default()
        }
        .only_if_next_payment_on(subscription.next_payment_date)
        .only_if_status(subscription.status);
        let applied = self.repo.update_subscription(subscription.id, &update).await?;
        if applied {
            tracing::warn!(
                subscription_id = subscription.id,
                user_id = subscription.user_id,
                "subscription suspended without further charge"
            );
        }
        Ok(applied)
    }

    /// trialing / active / past_due 可以使用付费功能
    pub async fn check_subscription_features(&self, user_id: i64) -> AppResult<bool> {
        let subscription = self.repo.get_subscription_by_user(user_id).await?;
        Ok(subscription.map_or(false, |s| s.status.grants_access()))
    }

    pub async fn get_subscription_status_summary(
        &self,
        user_id: i64,
    ) -> AppResult<SubscriptionSummary> {
        let subscription = self
            .repo
            .get_subscription_by_user(user_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("subscription for user {user_id}")))?;
        Ok(SubscriptionSummary::from(&subscription))
    }

    /// 取消订阅；已取消时直接返回
    pub async fn cancel_subscription(&self, subscription_id: i64) -> AppResult<Subscription> {
        let mut subscription = self.load(subscription_id).await?;
        if subscription.status == SubscriptionStatus::Canceled {
            return Ok(subscription);
        }

        let update = SubscriptionUpdate {
            status: Some(SubscriptionStatus::Canceled),
            canceled_at: Some(Utc::now()),
            ..Default::default()
        };
        if !self.repo.update_subscription(subscription_id, &update).await? {
            return Err(AppError::not_found(format!("subscription {subscription_id}")));
        }
        update.apply_to(&mut subscription);
        tracing::info!(
            subscription_id,
            user_id = subscription.user_id,
            "subscription canceled"
        );
        Ok(subscription)
    }

    /// 恢复已暂停的订阅：可替换支付方式，立即对未付周期扣款
    ///
    /// 扣款失败时订阅保持 suspended，并记录失败原因。
    pub async fn reactivate_subscription(
        &self,
        subscription_id: i64,
        payment_method_ref: Option<String>,
        run_date: NaiveDate,
    ) -> AppResult<Subscription> {
        let mut subscription = self.load(subscription_id).await?;
        if subscription.status != SubscriptionStatus::Suspended {
            return Err(AppError::conflict(format!(
                "subscription {} is {}, only suspended subscriptions can be reactivated",
                subscription_id, subscription.status
            )));
        }

        if let Some(method) = payment_method_ref {
            let update = SubscriptionUpdate {
                payment_method_ref: Some(method),
                ..Default::default()
            };
            self.repo.update_subscription(subscription_id, &update).await?;
            update.apply_to(&mut subscription);
        }

        let outcome = self
            .attempt_charge(&subscription, run_date, AttemptKind::Reactivation)
            .await?;
        tracing::info!(subscription_id, ?outcome, "reactivation attempted");

        self.load(subscription_id).await
    }

    async fn load(&self, subscription_id: i64) -> AppResult<Subscription> {
        self.repo
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("subscription {subscription_id}")))
    }

    pub(crate) fn repo(&self) -> &Arc<dyn BillingRepository> {
        &self.repo
    }
}

fn ensure_transition(subscription: &Subscription, next: SubscriptionStatus) -> AppResult<()> {
    if subscription.status == next || subscription.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(AppError::conflict(format!(
            "subscription {} cannot move from {} to {}",
            subscription.id, subscription.status, next
        )))
    }
}
