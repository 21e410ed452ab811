use crate::error::AppError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 银行流水匹配状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Unmatched,
    Matched,
    PartiallyMatched,
    Ignored,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Unmatched => "unmatched",
            MatchStatus::Matched => "matched",
            MatchStatus::PartiallyMatched => "partially_matched",
            MatchStatus::Ignored => "ignored",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unmatched" => Ok(MatchStatus::Unmatched),
            "matched" => Ok(MatchStatus::Matched),
            "partially_matched" => Ok(MatchStatus::PartiallyMatched),
            "ignored" => Ok(MatchStatus::Ignored),
            other => Err(AppError::validation(format!("unknown match status '{other}'"))),
        }
    }
}

/// 银行流水 (由对账单导入产生，只允许状态流转，不删除)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankTransaction {
    pub id: i64,
    pub organization_id: i64,
    pub account_id: i64,
    /// 有符号金额，最小货币单位 (分)
    pub amount: i64,
    pub currency: String,
    pub value_date: NaiveDate,
    pub description: String,
    pub counterparty: Option<String>,
    pub match_status: MatchStatus,
    pub match_id: Option<i64>,
}

impl BankTransaction {
    pub fn is_unmatched(&self) -> bool {
        self.match_status == MatchStatus::Unmatched
    }
}
