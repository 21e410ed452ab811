use crate::error::AppError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 计费周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Pending,
    Paid,
    Failed,
    Retrying,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Pending => "pending",
            CycleStatus::Paid => "paid",
            CycleStatus::Failed => "failed",
            CycleStatus::Retrying => "retrying",
        }
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CycleStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CycleStatus::Pending),
            "paid" => Ok(CycleStatus::Paid),
            "failed" => Ok(CycleStatus::Failed),
            "retrying" => Ok(CycleStatus::Retrying),
            other => Err(AppError::validation(format!("unknown cycle status '{other}'"))),
        }
    }
}

/// 一个订阅的一个计费周期，(subscription_id, period_start) 唯一
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingCycle {
    /// 尚未落库时为 0
    pub id: i64,
    pub subscription_id: i64,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub amount: i64,
    pub currency: String,
    pub status: CycleStatus,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl BillingCycle {
    pub fn is_paid(&self) -> bool {
        self.status == CycleStatus::Paid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "succeeded" => Ok(PaymentStatus::Succeeded),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(AppError::validation(format!("unknown payment status '{other}'"))),
        }
    }
}

/// 每次扣款尝试一条记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: i64,
    pub subscription_id: i64,
    pub billing_cycle_id: i64,
    /// 提交给网关的幂等键，webhook 以此回传
    pub charge_ref: String,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPaymentTransaction {
    pub subscription_id: i64,
    pub billing_cycle_id: i64,
    pub charge_ref: String,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
}

/// 每月扣款任务统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingStats {
    pub run_date: Option<NaiveDate>,
    pub charged: usize,
    pub failed: usize,
    pub skipped: usize,
    /// 失败中由网关故障 (而非拒付) 导致的次数
    pub gateway_errors: usize,
    pub suspended: usize,
}

/// 重试任务统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStats {
    pub run_date: Option<NaiveDate>,
    pub retried: usize,
    pub succeeded: usize,
    pub suspended: usize,
    pub skipped: usize,
    pub gateway_errors: usize,
}

/// webhook 对账结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied,
    AlreadyApplied,
    /// 与本地记录冲突且本地结果更权威 (例如成功后又收到失败)
    Ignored,
    UnknownCharge,
}
