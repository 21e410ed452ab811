use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::BankTransaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    Auto,
    Manual,
}

impl MatchedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchedBy::Auto => "auto",
            MatchedBy::Manual => "manual",
        }
    }
}

impl fmt::Display for MatchedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 流水与发票的匹配记录 (撤销时软删除)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMatch {
    pub id: i64,
    pub organization_id: i64,
    pub transaction_id: i64,
    pub invoice_id: i64,
    pub voucher_id: Option<i64>,
    pub score: u8,
    pub matched_by: MatchedBy,
    pub user_id: Option<i64>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl PaymentMatch {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// 待提交的匹配
#[derive(Debug, Clone, PartialEq)]
pub struct NewMatch {
    pub organization_id: i64,
    pub transaction_id: i64,
    pub invoice_id: i64,
    pub voucher_id: Option<i64>,
    pub score: u8,
    pub matched_by: MatchedBy,
    pub user_id: Option<i64>,
    pub notes: Option<String>,
}

impl NewMatch {
    pub fn manual(
        transaction: &BankTransaction,
        invoice_id: i64,
        voucher_id: Option<i64>,
        user_id: i64,
        notes: Option<String>,
    ) -> Self {
        Self {
            organization_id: transaction.organization_id,
            transaction_id: transaction.id,
            invoice_id,
            voucher_id,
            score: 100,
            matched_by: MatchedBy::Manual,
            user_id: Some(user_id),
            notes: Some(notes.unwrap_or_else(|| "Manually matched by user".to_string())),
        }
    }
}

/// compare-and-commit 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed(PaymentMatch),
    /// 流水已不是 unmatched (被并发匹配或忽略)
    TransactionClaimed,
    /// 发票已有有效匹配或不再待收
    InvoiceClaimed,
}

/// 四项评分明细，总分为各项之和
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub amount: u8,
    pub reference: u8,
    pub counterparty: u8,
    pub date: u8,
}

impl ScoreBreakdown {
    pub fn total(&self) -> u8 {
        self.amount + self.reference + self.counterparty + self.date
    }
}

impl fmt::Display for ScoreBreakdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "amount={} reference={} counterparty={} date={}",
            self.amount, self.reference, self.counterparty, self.date
        )
    }
}

/// 某条流水的一个候选发票
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub invoice_id: i64,
    pub voucher_id: Option<i64>,
    pub score: ScoreBreakdown,
    pub days_apart: i64,
}

/// 需人工复核的流水 (最佳候选落在复核区间)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewCandidate {
    pub transaction_id: i64,
    pub invoice_id: i64,
    pub score: u8,
    pub breakdown: ScoreBreakdown,
}

/// 匹配统计信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchStats {
    pub organization_id: i64,
    pub processed: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub ambiguous: usize,
    /// 提交时发现流水已被并发处理
    pub skipped: usize,
    pub review: Vec<ReviewCandidate>,
}

impl MatchStats {
    pub fn new(organization_id: i64) -> Self {
        Self {
            organization_id,
            ..Default::default()
        }
    }
}
