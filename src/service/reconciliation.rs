use chrono::Utc;

use super::billing::BillingEngine;
use crate::error::AppResult;
use crate::gateway::{EventOutcome, GatewayEvent};
use crate::models::{
    CycleStatus, PaymentStatus, PaymentTransaction, ReconcileOutcome, SubscriptionStatus,
    SubscriptionUpdate,
};

impl BillingEngine {
    /// 处理网关 webhook
    ///
    /// 以 charge_ref 为键做条件更新：成功回调总能覆盖本地记录的失败，
    /// 失败回调不会覆盖已成功的扣款。已取消的订阅不会被重新激活。
    pub async fn apply_gateway_event(&self, event: &GatewayEvent) -> AppResult<ReconcileOutcome> {
        let repo = self.repo();
        let Some(payment) = repo
            .get_payment_transaction_by_charge_ref(&event.charge_ref)
            .await?
        else {
            tracing::warn!(charge_ref = %event.charge_ref, "webhook for unknown charge");
            return Ok(ReconcileOutcome::UnknownCharge);
        };

        let outcome = match event.outcome {
            EventOutcome::Succeeded => self.confirm_success(&payment).await?,
            EventOutcome::Failed => self.confirm_failure(&payment, event).await?,
        };

        tracing::info!(
            charge_ref = %event.charge_ref,
            subscription_id = payment.subscription_id,
            event = ?event.outcome,
            ?outcome,
            "gateway event reconciled"
        );
        Ok(outcome)
    }

    async fn confirm_success(&self, payment: &PaymentTransaction) -> AppResult<ReconcileOutcome> {
        let repo = self.repo();
        if payment.status == PaymentStatus::Succeeded {
            return Ok(ReconcileOutcome::AlreadyApplied);
        }

        let updated = repo
            .update_payment_transaction(
                &payment.charge_ref,
                payment.status,
                PaymentStatus::Succeeded,
                None,
                None,
            )
            .await?;
        if !updated {
            // 并发回调抢先一步
            let current = repo
                .get_payment_transaction_by_charge_ref(&payment.charge_ref)
                .await?;
            return Ok(match current {
                Some(p) if p.status == PaymentStatus::Succeeded => ReconcileOutcome::AlreadyApplied,
                _ => ReconcileOutcome::Ignored,
            });
        }

        let Some(mut cycle) = repo.get_billing_cycle_by_id(payment.billing_cycle_id).await? else {
            tracing::warn!(
                charge_ref = %payment.charge_ref,
                billing_cycle_id = payment.billing_cycle_id,
                "confirmed charge has no billing cycle"
            );
            return Ok(ReconcileOutcome::Applied);
        };
        if !cycle.is_paid() {
            cycle.status = CycleStatus::Paid;
            cycle.paid_at = Some(Utc::now());
            cycle = repo.record_billing_cycle(&cycle).await?;
        }

        let Some(subscription) = repo.get_subscription(payment.subscription_id).await? else {
            return Ok(ReconcileOutcome::Applied);
        };
        if subscription.status == SubscriptionStatus::Canceled {
            tracing::info!(
                subscription_id = subscription.id,
                "payment confirmed for canceled subscription, status unchanged"
            );
            return Ok(ReconcileOutcome::Applied);
        }

        // 只有订阅仍停留在该周期时才推进
        if subscription.next_payment_date == cycle.period_start {
            let settled = SubscriptionUpdate::settled(cycle.period_start, cycle.period_end)
                .only_if_next_payment_on(cycle.period_start)
                .only_if_status(subscription.status);
            if !repo.update_subscription(subscription.id, &settled).await? {
                tracing::info!(
                    subscription_id = subscription.id,
                    "subscription changed while reconciling, status unchanged"
                );
            } else if subscription.status == SubscriptionStatus::Suspended {
                // 唯一一条不经显式恢复就离开 suspended 的路径
                tracing::warn!(
                    subscription_id = subscription.id,
                    charge_ref = %payment.charge_ref,
                    period_start = %cycle.period_start,
                    "late success reactivated a suspended subscription"
                );
            } else {
                tracing::info!(
                    subscription_id = subscription.id,
                    previous_status = %subscription.status,
                    period_start = %cycle.period_start,
                    "late success settled the billing period"
                );
            }
        }
        Ok(ReconcileOutcome::Applied)
    }

    async fn confirm_failure(
        &self,
        payment: &PaymentTransaction,
        event: &GatewayEvent,
    ) -> AppResult<ReconcileOutcome> {
        match payment.status {
            PaymentStatus::Succeeded => {
                tracing::warn!(
                    charge_ref = %payment.charge_ref,
                    "failure event after recorded success, ignoring"
                );
                return Ok(ReconcileOutcome::Ignored);
            }
            PaymentStatus::Failed => return Ok(ReconcileOutcome::AlreadyApplied),
            PaymentStatus::Pending => {}
        }

        // 本地超时已计为一次失败，这里只补全扣款记录
        let updated = self
            .repo()
            .update_payment_transaction(
                &payment.charge_ref,
                PaymentStatus::Pending,
                PaymentStatus::Failed,
                event
                    .failure_code
                    .clone()
                    .or_else(|| payment.failure_code.clone()),
                event.failure_message.clone(),
            )
            .await?;

        Ok(if updated {
            ReconcileOutcome::Applied
        } else {
            ReconcileOutcome::Ignored
        })
    }
}
