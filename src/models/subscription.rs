use crate::error::AppError;
use chrono::{DateTime, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 单个计费周期内最多扣款次数 (首次失败 + 4 次按日重试)
pub const MAX_CHARGE_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Suspended,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// 允许的状态流转
    ///
    /// trialing -> active -> past_due -> (active | suspended)，任意状态可取消，canceled 为终态。
    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        match (self, next) {
            (Canceled, _) => false,
            (_, Canceled) => true,
            (Trialing, Active | PastDue) => true,
            (Active, Active | PastDue) => true,
            (PastDue, PastDue | Active | Suspended) => true,
            (Suspended, Active) => true,
            _ => false,
        }
    }

    /// 过期未付 (past_due) 仍属宽限期，保留功能访问
    pub fn grants_access(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trialing | SubscriptionStatus::Active | SubscriptionStatus::PastDue
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "suspended" => Ok(SubscriptionStatus::Suspended),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            other => Err(AppError::validation(format!(
                "unknown subscription status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Monthly,
    Quarterly,
    Yearly,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "monthly",
            BillingInterval::Quarterly => "quarterly",
            BillingInterval::Yearly => "yearly",
        }
    }

    fn months(&self) -> u32 {
        match self {
            BillingInterval::Monthly => 1,
            BillingInterval::Quarterly => 3,
            BillingInterval::Yearly => 12,
        }
    }

    /// 顺延一个计费间隔 (月末日期按 chrono 规则截断)
    pub fn advance(&self, from: NaiveDate) -> Result<NaiveDate, AppError> {
        from.checked_add_months(Months::new(self.months()))
            .ok_or_else(|| AppError::validation(format!("cannot advance {from} by {self}")))
    }
}

impl fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingInterval {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(BillingInterval::Monthly),
            "quarterly" => Ok(BillingInterval::Quarterly),
            "yearly" | "annual" => Ok(BillingInterval::Yearly),
            other => Err(AppError::validation(format!(
                "unknown billing interval '{other}'"
            ))),
        }
    }
}

/// 用户订阅
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub organization_id: i64,
    pub user_id: i64,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub billing_interval: BillingInterval,
    /// 每期金额，最小货币单位
    pub amount: i64,
    pub currency: String,
    pub current_period_start: NaiveDate,
    pub current_period_end: NaiveDate,
    pub next_payment_date: NaiveDate,
    pub consecutive_failed_attempts: u32,
    pub last_attempt_on: Option<NaiveDate>,
    pub gateway_customer_ref: Option<String>,
    pub payment_method_ref: Option<String>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
}

impl Subscription {
    pub fn attempts_remaining(&self) -> u32 {
        MAX_CHARGE_ATTEMPTS.saturating_sub(self.consecutive_failed_attempts)
    }

    /// 当天是否已尝试过扣款
    pub fn attempted_on(&self, date: NaiveDate) -> bool {
        self.last_attempt_on.map_or(false, |last| last >= date)
    }
}

/// 订阅字段的部分更新；`expected_*` 字段存在时为条件更新
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionUpdate {
    pub status: Option<SubscriptionStatus>,
    pub current_period_start: Option<NaiveDate>,
    pub current_period_end: Option<NaiveDate>,
    pub next_payment_date: Option<NaiveDate>,
    pub consecutive_failed_attempts: Option<u32>,
    pub payment_method_ref: Option<String>,
    pub suspended_at: Option<Option<DateTime<Utc>>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<Option<String>>,
    pub expected_next_payment_date: Option<NaiveDate>,
    pub expected_status: Option<SubscriptionStatus>,
}

impl SubscriptionUpdate {
    /// 扣款成功：回到 active，计数清零，进入已付周期
    pub fn settled(period_start: NaiveDate, period_end: NaiveDate) -> Self {
        Self {
            status: Some(SubscriptionStatus::Active),
            current_period_start: Some(period_start),
            current_period_end: Some(period_end),
            next_payment_date: Some(period_end),
            consecutive_failed_attempts: Some(0),
            suspended_at: Some(None),
            last_failure_reason: Some(None),
            ..Default::default()
        }
    }

    pub fn only_if_next_payment_on(mut self, date: NaiveDate) -> Self {
        self.expected_next_payment_date = Some(date);
        self
    }

    /// 扣款期间订阅可能被取消，写回结果前要求状态未变
    pub fn only_if_status(mut self, status: SubscriptionStatus) -> Self {
        self.expected_status = Some(status);
        self
    }

    /// 条件是否仍成立
    pub fn precondition_holds(&self, subscription: &Subscription) -> bool {
        self.expected_next_payment_date
            .map_or(true, |date| subscription.next_payment_date == date)
            && self
                .expected_status
                .map_or(true, |status| subscription.status == status)
    }

    /// 把更新应用到内存中的订阅 (内存仓库与测试使用)
    pub fn apply_to(&self, subscription: &mut Subscription) {
        if let Some(status) = self.status {
            subscription.status = status;
        }
        if let Some(start) = self.current_period_start {
            subscription.current_period_start = start;
        }
        if let Some(end) = self.current_period_end {
            subscription.current_period_end = end;
        }
        if let Some(next) = self.next_payment_date {
            subscription.next_payment_date = next;
        }
        if let Some(attempts) = self.consecutive_failed_attempts {
            subscription.consecutive_failed_attempts = attempts;
        }
        if let Some(method) = &self.payment_method_ref {
            subscription.payment_method_ref = Some(method.clone());
        }
        if let Some(suspended_at) = self.suspended_at {
            subscription.suspended_at = suspended_at;
        }
        if let Some(canceled_at) = self.canceled_at {
            subscription.canceled_at = Some(canceled_at);
        }
        if let Some(reason) = &self.last_failure_reason {
            subscription.last_failure_reason = reason.clone();
        }
    }
}

/// 订阅状态摘要 (只读投影)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSummary {
    pub subscription_id: i64,
    pub status: SubscriptionStatus,
    pub plan_id: String,
    pub billing_interval: BillingInterval,
    pub amount: i64,
    pub currency: String,
    pub next_payment_date: NaiveDate,
    pub attempts_used: u32,
    pub attempts_remaining: u32,
    pub can_access_features: bool,
    pub last_failure_reason: Option<String>,
    pub warning: Option<String>,
    pub suspended_at: Option<DateTime<Utc>>,
}

impl From<&Subscription> for SubscriptionSummary {
    fn from(subscription: &Subscription) -> Self {
        let warning = match subscription.status {
            SubscriptionStatus::PastDue => Some(format!(
                "Payment failed. {} attempts left before account suspension.",
                subscription.attempts_remaining()
            )),
            SubscriptionStatus::Suspended => Some(format!(
                "Account suspended after {} failed payment attempts.",
                subscription.consecutive_failed_attempts
            )),
            _ => None,
        };

        Self {
            subscription_id: subscription.id,
            status: subscription.status,
            plan_id: subscription.plan_id.clone(),
            billing_interval: subscription.billing_interval,
            amount: subscription.amount,
            currency: subscription.currency.clone(),
            next_payment_date: subscription.next_payment_date,
            attempts_used: subscription.consecutive_failed_attempts,
            attempts_remaining: subscription.attempts_remaining(),
            can_access_features: subscription.status.grants_access(),
            last_failure_reason: subscription.last_failure_reason.clone(),
            warning,
            suspended_at: subscription.suspended_at,
        }
    }
}
