use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::AppResult;
use crate::models::{
    BankTransaction, BillingCycle, CommitOutcome, Invoice, NewMatch, NewPaymentTransaction,
    PaymentMatch, PaymentStatus, PaymentTransaction, Subscription, SubscriptionUpdate,
};

/// key: ledger-repository -> transactions, invoices, matches
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn get_unmatched_transactions(&self, organization_id: i64)
        -> AppResult<Vec<BankTransaction>>;

    /// 待收且没有有效匹配的发票
    async fn get_outstanding_invoices(&self, organization_id: i64) -> AppResult<Vec<Invoice>>;

    async fn get_transaction(&self, transaction_id: i64) -> AppResult<Option<BankTransaction>>;

    async fn get_invoice(&self, invoice_id: i64) -> AppResult<Option<Invoice>>;

    async fn get_active_match(&self, transaction_id: i64) -> AppResult<Option<PaymentMatch>>;

    /// compare-and-commit：流水仍为 unmatched 且发票未被占用时才写入
    async fn commit_match(&self, new_match: NewMatch) -> AppResult<CommitOutcome>;

    /// 软删除匹配并把流水恢复为 unmatched；匹配不存在或已撤销时返回 false
    async fn revert_match(&self, match_id: i64) -> AppResult<bool>;
}

/// key: billing-repository -> subscriptions, cycles, payment attempts
#[async_trait]
pub trait BillingRepository: Send + Sync {
    /// status 为 active/trialing 且 next_payment_date <= date
    async fn get_due_subscriptions(&self, date: NaiveDate) -> AppResult<Vec<Subscription>>;

    async fn get_past_due_subscriptions(&self) -> AppResult<Vec<Subscription>>;

    async fn get_subscription(&self, subscription_id: i64) -> AppResult<Option<Subscription>>;

    async fn get_subscription_by_user(&self, user_id: i64) -> AppResult<Option<Subscription>>;

    /// 条件更新：仅当 next_payment_date == period_start 且当天尚未尝试过时，
    /// 把 last_attempt_on 置为 run_date。返回是否抢到本次尝试。
    async fn claim_billing_attempt(
        &self,
        subscription_id: i64,
        period_start: NaiveDate,
        run_date: NaiveDate,
    ) -> AppResult<bool>;

    async fn get_billing_cycle(
        &self,
        subscription_id: i64,
        period_start: NaiveDate,
    ) -> AppResult<Option<BillingCycle>>;

    async fn get_billing_cycle_by_id(&self, cycle_id: i64) -> AppResult<Option<BillingCycle>>;

    /// 按 (subscription_id, period_start) upsert；已 paid 的周期不会被改写
    async fn record_billing_cycle(&self, cycle: &BillingCycle) -> AppResult<BillingCycle>;

    async fn record_payment_transaction(
        &self,
        payment: NewPaymentTransaction,
    ) -> AppResult<PaymentTransaction>;

    async fn get_payment_transaction_by_charge_ref(
        &self,
        charge_ref: &str,
    ) -> AppResult<Option<PaymentTransaction>>;

    /// 条件更新：仅当当前状态等于 expected 时生效
    async fn update_payment_transaction(
        &self,
        charge_ref: &str,
        expected: PaymentStatus,
        status: PaymentStatus,
        failure_code: Option<String>,
        failure_message: Option<String>,
    ) -> AppResult<bool>;

    /// 部分更新订阅；带 expected_next_payment_date 时为条件更新
    async fn update_subscription(
        &self,
        subscription_id: i64,
        update: &SubscriptionUpdate,
    ) -> AppResult<bool>;
}
