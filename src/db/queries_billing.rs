use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool};

use super::money::{from_minor, to_minor};
use super::repository::BillingRepository;
use crate::error::{AppError, AppResult};
use crate::models::{
    BillingCycle, NewPaymentTransaction, PaymentStatus, PaymentTransaction, Subscription,
    SubscriptionUpdate,
};

const SUBSCRIPTION_COLUMNS: &str = "id, organization_id, user_id, plan_id, status, \
     billing_interval, amount, currency, current_period_start, current_period_end, \
     next_payment_date, consecutive_failed_attempts, last_attempt_on, gateway_customer_ref, \
     payment_method_ref, suspended_at, canceled_at, last_failure_reason";

const CYCLE_COLUMNS: &str = "id, subscription_id, period_start, period_end, amount, currency, \
     status, attempt_count, last_attempt_at, paid_at";

const PAYMENT_COLUMNS: &str = "id, subscription_id, billing_cycle_id, charge_ref, amount, \
     currency, status, failure_code, failure_message, created_at, updated_at";

#[derive(Debug, Clone, FromRow)]
struct SubscriptionRow {
    id: i64,
    organization_id: i64,
    user_id: i64,
    plan_id: String,
    status: String,
    billing_interval: String,
    amount: BigDecimal,
    currency: String,
    current_period_start: NaiveDate,
    current_period_end: NaiveDate,
    next_payment_date: NaiveDate,
    consecutive_failed_attempts: i32,
    last_attempt_on: Option<NaiveDate>,
    gateway_customer_ref: Option<String>,
    payment_method_ref: Option<String>,
    suspended_at: Option<DateTime<Utc>>,
    canceled_at: Option<DateTime<Utc>>,
    last_failure_reason: Option<String>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = AppError;

    fn try_from(row: SubscriptionRow) -> AppResult<Self> {
        Ok(Self {
            id: row.id,
            organization_id: row.organization_id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            status: row.status.parse()?,
            billing_interval: row.billing_interval.parse()?,
            amount: to_minor(&row.amount)?,
            currency: row.currency.trim().to_string(),
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            next_payment_date: row.next_payment_date,
            consecutive_failed_attempts: non_negative(row.consecutive_failed_attempts)?,
            last_attempt_on: row.last_attempt_on,
            gateway_customer_ref: row.gateway_customer_ref,
            payment_method_ref: row.payment_method_ref,
            suspended_at: row.suspended_at,
            canceled_at: row.canceled_at,
            last_failure_reason: row.last_failure_reason,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct CycleRow {
    id: i64,
    subscription_id: i64,
    period_start: NaiveDate,
    period_end: NaiveDate,
    amount: BigDecimal,
    currency: String,
    status: String,
    attempt_count: i32,
    last_attempt_at: Option<DateTime<Utc>>,
    paid_at: Option<DateTime<Utc>>,
}

impl TryFrom<CycleRow> for BillingCycle {
    type Error = AppError;

    fn try_from(row: CycleRow) -> AppResult<Self> {
        Ok(Self {
            id: row.id,
            subscription_id: row.subscription_id,
            period_start: row.period_start,
            period_end: row.period_end,
            amount: to_minor(&row.amount)?,
            currency: row.currency.trim().to_string(),
            status: row.status.parse()?,
            attempt_count: non_negative(row.attempt_count)?,
            last_attempt_at: row.last_attempt_at,
            paid_at: row.paid_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct PaymentRow {
    id: i64,
    subscription_id: i64,
    billing_cycle_id: i64,
    charge_ref: String,
    amount: BigDecimal,
    currency: String,
    status: String,
    failure_code: Option<String>,
    failure_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for PaymentTransaction {
    type Error = AppError;

    fn try_from(row: PaymentRow) -> AppResult<Self> {
        Ok(Self {
            id: row.id,
            subscription_id: row.subscription_id,
            billing_cycle_id: row.billing_cycle_id,
            charge_ref: row.charge_ref,
            amount: to_minor(&row.amount)?,
            currency: row.currency.trim().to_string(),
            status: row.status.parse()?,
            failure_code: row.failure_code,
            failure_message: row.failure_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn non_negative(value: i32) -> AppResult<u32> {
    u32::try_from(value).map_err(|_| AppError::validation(format!("negative counter {value}")))
}

fn counter(value: u32) -> AppResult<i32> {
    i32::try_from(value).map_err(|_| AppError::validation(format!("counter {value} overflows")))
}

/// Postgres 计费仓库
#[derive(Clone)]
pub struct PgBillingRepository {
    pool: PgPool,
}

impl PgBillingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillingRepository for PgBillingRepository {
    async fn get_due_subscriptions(&self, date: NaiveDate) -> AppResult<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE status IN ('active', 'trialing') AND next_payment_date <= $1 \
             ORDER BY id ASC"
        ))
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn get_past_due_subscriptions(&self) -> AppResult<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE status = 'past_due' ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn get_subscription(&self, subscription_id: i64) -> AppResult<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn get_subscription_by_user(&self, user_id: i64) -> AppResult<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE user_id = $1 ORDER BY id DESC LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn claim_billing_attempt(
        &self,
        subscription_id: i64,
        period_start: NaiveDate,
        run_date: NaiveDate,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET last_attempt_on = $3, updated_at = NOW()
            WHERE id = $1
              AND status IN ('trialing', 'active', 'past_due')
              AND next_payment_date = $2
              AND (last_attempt_on IS NULL OR last_attempt_on < $3)
            "#,
        )
        .bind(subscription_id)
        .bind(period_start)
        .bind(run_date)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_billing_cycle(
        &self,
        subscription_id: i64,
        period_start: NaiveDate,
    ) -> AppResult<Option<BillingCycle>> {
        let row = sqlx::query_as::<_, CycleRow>(&format!(
            "SELECT {CYCLE_COLUMNS} FROM billing_cycles \
             WHERE subscription_id = $1 AND period_start = $2"
        ))
        .bind(subscription_id)
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BillingCycle::try_from).transpose()
    }

    async fn get_billing_cycle_by_id(&self, cycle_id: i64) -> AppResult<Option<BillingCycle>> {
        let row = sqlx::query_as::<_, CycleRow>(&format!(
            "SELECT {CYCLE_COLUMNS} FROM billing_cycles WHERE id = $1"
        ))
        .bind(cycle_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BillingCycle::try_from).transpose()
    }

    async fn record_billing_cycle(&self, cycle: &BillingCycle) -> AppResult<BillingCycle> {
        // 已 paid 的周期不被覆盖：冲突更新不生效时 RETURNING 为空，再读回现有行
        let row = sqlx::query_as::<_, CycleRow>(&format!(
            r#"
            INSERT INTO billing_cycles (
                subscription_id, period_start, period_end, amount, currency,
                status, attempt_count, last_attempt_at, paid_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (subscription_id, period_start) DO UPDATE SET
                period_end = EXCLUDED.period_end,
                amount = EXCLUDED.amount,
                currency = EXCLUDED.currency,
                status = EXCLUDED.status,
                attempt_count = EXCLUDED.attempt_count,
                last_attempt_at = EXCLUDED.last_attempt_at,
                paid_at = EXCLUDED.paid_at
            WHERE billing_cycles.status <> 'paid'
            RETURNING {CYCLE_COLUMNS}
            "#
        ))
        .bind(cycle.subscription_id)
        .bind(cycle.period_start)
        .bind(cycle.period_end)
        .bind(from_minor(cycle.amount))
        .bind(&cycle.currency)
        .bind(cycle.status.as_str())
        .bind(counter(cycle.attempt_count)?)
        .bind(cycle.last_attempt_at)
        .bind(cycle.paid_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => BillingCycle::try_from(row),
            None => self
                .get_billing_cycle(cycle.subscription_id, cycle.period_start)
                .await?
                .ok_or_else(|| {
                    AppError::not_found(format!(
                        "billing cycle {} / {}",
                        cycle.subscription_id, cycle.period_start
                    ))
                }),
        }
    }

    async fn record_payment_transaction(
        &self,
        payment: NewPaymentTransaction,
    ) -> AppResult<PaymentTransaction> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            r#"
            INSERT INTO payment_transactions (
                subscription_id, billing_cycle_id, charge_ref, amount, currency,
                status, failure_code, failure_message
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (charge_ref) DO NOTHING
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(payment.subscription_id)
        .bind(payment.billing_cycle_id)
        .bind(&payment.charge_ref)
        .bind(from_minor(payment.amount))
        .bind(&payment.currency)
        .bind(payment.status.as_str())
        .bind(&payment.failure_code)
        .bind(&payment.failure_message)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => PaymentTransaction::try_from(row),
            None => Err(AppError::conflict(format!(
                "charge reference {} already recorded",
                payment.charge_ref
            ))),
        }
    }

    async fn get_payment_transaction_by_charge_ref(
        &self,
        charge_ref: &str,
    ) -> AppResult<Option<PaymentTransaction>> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_transactions WHERE charge_ref = $1"
        ))
        .bind(charge_ref)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PaymentTransaction::try_from).transpose()
    }

    async fn update_payment_transaction(
        &self,
        charge_ref: &str,
        expected: PaymentStatus,
        status: PaymentStatus,
        failure_code: Option<String>,
        failure_message: Option<String>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payment_transactions
            SET status = $3, failure_code = $4, failure_message = $5, updated_at = NOW()
            WHERE charge_ref = $1 AND status = $2
            "#,
        )
        .bind(charge_ref)
        .bind(expected.as_str())
        .bind(status.as_str())
        .bind(failure_code)
        .bind(failure_message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_subscription(
        &self,
        subscription_id: i64,
        update: &SubscriptionUpdate,
    ) -> AppResult<bool> {
        let attempts = update
            .consecutive_failed_attempts
            .map(counter)
            .transpose()?;

        // Option<Option<_>> 字段拆成 "是否写入" + "写入值" 两个参数
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = COALESCE($2, status),
                current_period_start = COALESCE($3, current_period_start),
                current_period_end = COALESCE($4, current_period_end),
                next_payment_date = COALESCE($5, next_payment_date),
                consecutive_failed_attempts = COALESCE($6, consecutive_failed_attempts),
                payment_method_ref = COALESCE($7, payment_method_ref),
                suspended_at = CASE WHEN $8 THEN $9 ELSE suspended_at END,
                canceled_at = COALESCE($10, canceled_at),
                last_failure_reason = CASE WHEN $11 THEN $12 ELSE last_failure_reason END,
                updated_at = NOW()
            WHERE id = $1
              AND ($13::date IS NULL OR next_payment_date = $13::date)
              AND ($14::text IS NULL OR status = $14::text)
            "#,
        )
        .bind(subscription_id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.current_period_start)
        .bind(update.current_period_end)
        .bind(update.next_payment_date)
        .bind(attempts)
        .bind(&update.payment_method_ref)
        .bind(update.suspended_at.is_some())
        .bind(update.suspended_at.flatten())
        .bind(update.canceled_at)
        .bind(update.last_failure_reason.is_some())
        .bind(update.last_failure_reason.clone().flatten())
        .bind(update.expected_next_payment_date)
        .bind(update.expected_status.map(|s| s.as_str()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
