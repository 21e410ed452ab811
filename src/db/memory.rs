//! 内存仓库实现，供测试和本地演示使用。
//!
//! 每个操作在一把锁内完成，因此 compare-and-commit 与条件更新的语义与 Postgres 实现一致。

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::repository::{BillingRepository, LedgerRepository};
use crate::error::{AppError, AppResult};
use crate::models::{
    BankTransaction, BillingCycle, CommitOutcome, Invoice, MatchStatus, NewMatch,
    NewPaymentTransaction, PaymentMatch, PaymentStatus, PaymentTransaction, Subscription,
    SubscriptionStatus, SubscriptionUpdate,
};

/// 故障注入：模拟存储不可用
#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    /// 还允许成功的写操作次数，用尽后返回 Repository 错误
    writes_before_failure: Option<usize>,
}

impl Faults {
    fn check_read(&self) -> AppResult<()> {
        if self.unavailable {
            return Err(AppError::Repository("store unavailable".into()));
        }
        Ok(())
    }

    fn check_write(&mut self) -> AppResult<()> {
        self.check_read()?;
        match self.writes_before_failure {
            Some(0) => Err(AppError::Repository("store unavailable".into())),
            Some(ref mut remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> AppResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| AppError::Repository("in-memory store lock poisoned".into()))
}

#[derive(Debug, Default)]
struct LedgerState {
    transactions: BTreeMap<i64, BankTransaction>,
    invoices: BTreeMap<i64, Invoice>,
    matches: BTreeMap<i64, PaymentMatch>,
    next_match_id: i64,
    faults: Faults,
}

impl LedgerState {
    fn invoice_claimed(&self, invoice_id: i64) -> bool {
        self.matches
            .values()
            .any(|m| m.invoice_id == invoice_id && m.is_active())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_transaction(&self, transaction: BankTransaction) -> AppResult<()> {
        lock(&self.state)?
            .transactions
            .insert(transaction.id, transaction);
        Ok(())
    }

    pub fn insert_invoice(&self, invoice: Invoice) -> AppResult<()> {
        lock(&self.state)?.invoices.insert(invoice.id, invoice);
        Ok(())
    }

    pub fn transaction(&self, transaction_id: i64) -> Option<BankTransaction> {
        lock(&self.state)
            .ok()
            .and_then(|s| s.transactions.get(&transaction_id).cloned())
    }

    pub fn active_matches(&self) -> Vec<PaymentMatch> {
        lock(&self.state)
            .map(|s| s.matches.values().filter(|m| m.is_active()).cloned().collect())
            .unwrap_or_default()
    }

    pub fn all_matches(&self) -> Vec<PaymentMatch> {
        lock(&self.state)
            .map(|s| s.matches.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_unavailable(&self, unavailable: bool) -> AppResult<()> {
        lock(&self.state)?.faults.unavailable = unavailable;
        Ok(())
    }

    /// 前 n 次写入成功，之后所有写入失败
    pub fn fail_writes_after(&self, writes: usize) -> AppResult<()> {
        lock(&self.state)?.faults.writes_before_failure = Some(writes);
        Ok(())
    }
}

#[async_trait]
impl LedgerRepository for InMemoryLedger {
    async fn get_unmatched_transactions(
        &self,
        organization_id: i64,
    ) -> AppResult<Vec<BankTransaction>> {
        let state = lock(&self.state)?;
        state.faults.check_read()?;
        Ok(state
            .transactions
            .values()
            .filter(|t| t.organization_id == organization_id && t.is_unmatched())
            .cloned()
            .collect())
    }

    async fn get_outstanding_invoices(&self, organization_id: i64) -> AppResult<Vec<Invoice>> {
        let state = lock(&self.state)?;
        state.faults.check_read()?;
        Ok(state
            .invoices
            .values()
            .filter(|i| {
                i.organization_id == organization_id
                    && i.outstanding
                    && !state.invoice_claimed(i.id)
            })
            .cloned()
            .collect())
    }

    async fn get_transaction(&self, transaction_id: i64) -> AppResult<Option<BankTransaction>> {
        let state = lock(&self.state)?;
        state.faults.check_read()?;
        Ok(state.transactions.get(&transaction_id).cloned())
    }

    async fn get_invoice(&self, invoice_id: i64) -> AppResult<Option<Invoice>> {
        let state = lock(&self.state)?;
        state.faults.check_read()?;
        Ok(state.invoices.get(&invoice_id).cloned())
    }

    async fn get_active_match(&self, transaction_id: i64) -> AppResult<Option<PaymentMatch>> {
        let state = lock(&self.state)?;
        state.faults.check_read()?;
        Ok(state
            .matches
            .values()
            .find(|m| m.transaction_id == transaction_id && m.is_active())
            .cloned())
    }

    async fn commit_match(&self, new_match: NewMatch) -> AppResult<CommitOutcome> {
        let mut state = lock(&self.state)?;
        state.faults.check_write()?;

        let transaction_open = state
            .transactions
            .get(&new_match.transaction_id)
            .map_or(false, BankTransaction::is_unmatched);
        if !transaction_open {
            return Ok(CommitOutcome::TransactionClaimed);
        }
        let invoice_open = state
            .invoices
            .get(&new_match.invoice_id)
            .map_or(false, |i| i.outstanding);
        if !invoice_open || state.invoice_claimed(new_match.invoice_id) {
            return Ok(CommitOutcome::InvoiceClaimed);
        }

        state.next_match_id += 1;
        let record = PaymentMatch {
            id: state.next_match_id,
            organization_id: new_match.organization_id,
            transaction_id: new_match.transaction_id,
            invoice_id: new_match.invoice_id,
            voucher_id: new_match.voucher_id,
            score: new_match.score,
            matched_by: new_match.matched_by,
            user_id: new_match.user_id,
            notes: new_match.notes,
            created_at: Utc::now(),
            deleted_at: None,
        };
        if let Some(tx) = state.transactions.get_mut(&record.transaction_id) {
            tx.match_status = MatchStatus::Matched;
            tx.match_id = Some(record.id);
        }
        state.matches.insert(record.id, record.clone());
        Ok(CommitOutcome::Committed(record))
    }

    async fn revert_match(&self, match_id: i64) -> AppResult<bool> {
        let mut state = lock(&self.state)?;
        state.faults.check_write()?;

        let Some(record) = state.matches.get_mut(&match_id) else {
            return Ok(false);
        };
        if !record.is_active() {
            return Ok(false);
        }
        record.deleted_at = Some(Utc::now());
        let transaction_id = record.transaction_id;

        if let Some(tx) = state.transactions.get_mut(&transaction_id) {
            if tx.match_id == Some(match_id) {
                tx.match_status = MatchStatus::Unmatched;
                tx.match_id = None;
            }
        }
        Ok(true)
    }
}

#[derive(Debug, Default)]
struct BillingState {
    subscriptions: BTreeMap<i64, Subscription>,
    cycles: BTreeMap<i64, BillingCycle>,
    payments: BTreeMap<i64, PaymentTransaction>,
    next_cycle_id: i64,
    next_payment_id: i64,
    faults: Faults,
}

#[derive(Debug, Default)]
pub struct InMemoryBilling {
    state: Mutex<BillingState>,
}

impl InMemoryBilling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_subscription(&self, subscription: Subscription) -> AppResult<()> {
        lock(&self.state)?
            .subscriptions
            .insert(subscription.id, subscription);
        Ok(())
    }

    pub fn subscription(&self, subscription_id: i64) -> Option<Subscription> {
        lock(&self.state)
            .ok()
            .and_then(|s| s.subscriptions.get(&subscription_id).cloned())
    }

    pub fn cycles_for(&self, subscription_id: i64) -> Vec<BillingCycle> {
        lock(&self.state)
            .map(|s| {
                s.cycles
                    .values()
                    .filter(|c| c.subscription_id == subscription_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn payments_for(&self, subscription_id: i64) -> Vec<PaymentTransaction> {
        lock(&self.state)
            .map(|s| {
                s.payments
                    .values()
                    .filter(|p| p.subscription_id == subscription_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_unavailable(&self, unavailable: bool) -> AppResult<()> {
        lock(&self.state)?.faults.unavailable = unavailable;
        Ok(())
    }

    pub fn fail_writes_after(&self, writes: usize) -> AppResult<()> {
        lock(&self.state)?.faults.writes_before_failure = Some(writes);
        Ok(())
    }
}

#[async_trait]
impl BillingRepository for InMemoryBilling {
    async fn get_due_subscriptions(&self, date: NaiveDate) -> AppResult<Vec<Subscription>> {
        let state = lock(&self.state)?;
        state.faults.check_read()?;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| {
                matches!(
                    s.status,
                    SubscriptionStatus::Active | SubscriptionStatus::Trialing
                ) && s.next_payment_date <= date
            })
            .cloned()
            .collect())
    }

    async fn get_past_due_subscriptions(&self) -> AppResult<Vec<Subscription>> {
        let state = lock(&self.state)?;
        state.faults.check_read()?;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::PastDue)
            .cloned()
            .collect())
    }

    async fn get_subscription(&self, subscription_id: i64) -> AppResult<Option<Subscription>> {
        let state = lock(&self.state)?;
        state.faults.check_read()?;
        Ok(state.subscriptions.get(&subscription_id).cloned())
    }

    async fn get_subscription_by_user(&self, user_id: i64) -> AppResult<Option<Subscription>> {
        let state = lock(&self.state)?;
        state.faults.check_read()?;
        // 同一用户多条订阅时取最新 (id 最大)
        Ok(state
            .subscriptions
            .values()
            .rev()
            .find(|s| s.user_id == user_id)
            .cloned())
    }

    async fn claim_billing_attempt(
        &self,
        subscription_id: i64,
        period_start: NaiveDate,
        run_date: NaiveDate,
    ) -> AppResult<bool> {
        let mut state = lock(&self.state)?;
        state.faults.check_write()?;

        let Some(subscription) = state.subscriptions.get_mut(&subscription_id) else {
            return Ok(false);
        };
        let billable = matches!(
            subscription.status,
            SubscriptionStatus::Trialing | SubscriptionStatus::Active | SubscriptionStatus::PastDue
        );
        if !billable
            || subscription.next_payment_date != period_start
            || subscription.attempted_on(run_date)
        {
            return Ok(false);
        }
        subscription.last_attempt_on = Some(run_date);
        Ok(true)
    }

    async fn get_billing_cycle(
        &self,
        subscription_id: i64,
        period_start: NaiveDate,
    ) -> AppResult<Option<BillingCycle>> {
        let state = lock(&self.state)?;
        state.faults.check_read()?;
        Ok(state
            .cycles
            .values()
            .find(|c| c.subscription_id == subscription_id && c.period_start == period_start)
            .cloned())
    }

    async fn get_billing_cycle_by_id(&self, cycle_id: i64) -> AppResult<Option<BillingCycle>> {
        let state = lock(&self.state)?;
        state.faults.check_read()?;
        Ok(state.cycles.get(&cycle_id).cloned())
    }

    async fn record_billing_cycle(&self, cycle: &BillingCycle) -> AppResult<BillingCycle> {
        let mut state = lock(&self.state)?;
        state.faults.check_write()?;

        let existing = state
            .cycles
            .values()
            .find(|c| {
                c.subscription_id == cycle.subscription_id && c.period_start == cycle.period_start
            })
            .cloned();

        match existing {
            Some(existing) if existing.is_paid() => Ok(existing),
            Some(existing) => {
                let mut updated = cycle.clone();
                updated.id = existing.id;
                state.cycles.insert(updated.id, updated.clone());
                Ok(updated)
            }
            None => {
                state.next_cycle_id += 1;
                let mut created = cycle.clone();
                created.id = state.next_cycle_id;
                state.cycles.insert(created.id, created.clone());
                Ok(created)
            }
        }
    }

    async fn record_payment_transaction(
        &self,
        payment: NewPaymentTransaction,
    ) -> AppResult<PaymentTransaction> {
        let mut state = lock(&self.state)?;
        state.faults.check_write()?;

        if state.payments.values().any(|p| p.charge_ref == payment.charge_ref) {
            return Err(AppError::conflict(format!(
                "charge reference {} already recorded",
                payment.charge_ref
            )));
        }

        state.next_payment_id += 1;
        let now = Utc::now();
        let record = PaymentTransaction {
            id: state.next_payment_id,
            subscription_id: payment.subscription_id,
            billing_cycle_id: payment.billing_cycle_id,
            charge_ref: payment.charge_ref,
            amount: payment.amount,
            currency: payment.currency,
            status: payment.status,
            failure_code: payment.failure_code,
            failure_message: payment.failure_message,
            created_at: now,
            updated_at: now,
        };
        state.payments.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_payment_transaction_by_charge_ref(
        &self,
        charge_ref: &str,
    ) -> AppResult<Option<PaymentTransaction>> {
        let state = lock(&self.state)?;
        state.faults.check_read()?;
        Ok(state
            .payments
            .values()
            .find(|p| p.charge_ref == charge_ref)
            .cloned())
    }

    async fn update_payment_transaction(
        &self,
        charge_ref: &str,
        expected: PaymentStatus,
        status: PaymentStatus,
        failure_code: Option<String>,
        failure_message: Option<String>,
    ) -> AppResult<bool> {
        let mut state = lock(&self.state)?;
        state.faults.check_write()?;

        let Some(payment) = state
            .payments
            .values_mut()
            .find(|p| p.charge_ref == charge_ref)
        else {
            return Ok(false);
        };
        if payment.status != expected {
            return Ok(false);
        }
        payment.status = status;
        payment.failure_code = failure_code;
        payment.failure_message = failure_message;
        payment.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_subscription(
        &self,
        subscription_id: i64,
        update: &SubscriptionUpdate,
    ) -> AppResult<bool> {
        let mut state = lock(&self.state)?;
        state.faults.check_write()?;

        let Some(subscription) = state.subscriptions.get_mut(&subscription_id) else {
            return Ok(false);
        };
        if !update.precondition_holds(subscription) {
            return Ok(false);
        }
        update.apply_to(subscription);
        Ok(true)
    }
}
