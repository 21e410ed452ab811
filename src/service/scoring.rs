//! 流水-发票候选评分
//!
//! 四项信号相互独立、直接相加：金额 40、参考号 30、对方名称 20、日期 10。

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::config::MatchingConfig;
use crate::error::{AppError, AppResult};
use crate::models::{BankTransaction, Invoice, ScoreBreakdown, ScoredCandidate};

/// 自动匹配阈值，固定
pub const ACCEPTANCE_THRESHOLD: u8 = 70;
/// 复核区间下限的默认值，[50, 70) 视为 ambiguous
pub const DEFAULT_REVIEW_FLOOR: u8 = 50;
pub const DEFAULT_DATE_WINDOW_DAYS: i64 = 30;
/// 金额容差：1 分
pub const AMOUNT_TOLERANCE_MINOR: i64 = 1;

pub const AMOUNT_WEIGHT: u8 = 40;
pub const REFERENCE_WEIGHT: u8 = 30;
pub const REFERENCE_PARTIAL: u8 = 15;
pub const COUNTERPARTY_WEIGHT: u8 = 20;
pub const COUNTERPARTY_PARTIAL: u8 = 10;
pub const DATE_WEIGHT: u8 = 10;

/// 数字序列部分匹配所需的最少位数
const MIN_REFERENCE_DIGITS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchingPolicy {
    pub review_floor: u8,
    pub date_window_days: i64,
}

impl Default for MatchingPolicy {
    fn default() -> Self {
        Self {
            review_floor: DEFAULT_REVIEW_FLOOR,
            date_window_days: DEFAULT_DATE_WINDOW_DAYS,
        }
    }
}

impl From<&MatchingConfig> for MatchingPolicy {
    fn from(config: &MatchingConfig) -> Self {
        Self {
            review_floor: config.review_floor,
            date_window_days: config.date_window_days,
        }
    }
}

impl MatchingPolicy {
    pub fn validate(&self) -> AppResult<()> {
        if self.review_floor >= ACCEPTANCE_THRESHOLD {
            return Err(AppError::validation(format!(
                "review floor {} must be below the acceptance threshold {}",
                self.review_floor, ACCEPTANCE_THRESHOLD
            )));
        }
        if self.date_window_days <= 0 {
            return Err(AppError::validation("date window must be at least one day"));
        }
        Ok(())
    }

    pub fn is_auto_match(&self, score: u8) -> bool {
        score >= ACCEPTANCE_THRESHOLD
    }

    pub fn needs_review(&self, score: u8) -> bool {
        score >= self.review_floor && score < ACCEPTANCE_THRESHOLD
    }
}

/// 计算一对 (流水, 发票) 的评分
pub fn score_pair(
    transaction: &BankTransaction,
    invoice: &Invoice,
    policy: &MatchingPolicy,
) -> ScoreBreakdown {
    ScoreBreakdown {
        amount: amount_score(transaction, invoice),
        reference: reference_score(&transaction.description, &invoice.reference),
        counterparty: counterparty_score(
            transaction.counterparty.as_deref(),
            invoice.counterparty.as_deref(),
        ),
        date: date_score(days_apart(transaction, invoice), policy.date_window_days),
    }
}

/// 对所有候选发票评分并排序：总分降序 -> 日期更近 -> 发票ID更小
pub fn rank_candidates(
    transaction: &BankTransaction,
    invoices: &[Invoice],
    policy: &MatchingPolicy,
) -> Vec<ScoredCandidate> {
    let mut ranked: Vec<ScoredCandidate> = invoices
        .iter()
        .filter(|inv| inv.outstanding && inv.organization_id == transaction.organization_id)
        .map(|inv| ScoredCandidate {
            invoice_id: inv.id,
            voucher_id: inv.voucher_id,
            score: score_pair(transaction, inv, policy),
            days_apart: days_apart(transaction, inv),
        })
        .collect();

    ranked.sort_by(compare_candidates);
    ranked
}

fn compare_candidates(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.score
        .total()
        .cmp(&a.score.total())
        .then_with(|| a.days_apart.cmp(&b.days_apart))
        .then_with(|| a.invoice_id.cmp(&b.invoice_id))
}

fn days_apart(transaction: &BankTransaction, invoice: &Invoice) -> i64 {
    (transaction.value_date - invoice.due_date).num_days().abs()
}

/// 出账流水为负数，按绝对值与应付金额比较
fn amount_score(transaction: &BankTransaction, invoice: &Invoice) -> u8 {
    if !transaction.currency.eq_ignore_ascii_case(&invoice.currency) {
        return 0;
    }
    let diff = (transaction.amount.abs() - invoice.amount_due.abs()).abs();
    if diff <= AMOUNT_TOLERANCE_MINOR {
        AMOUNT_WEIGHT
    } else {
        0
    }
}

fn reference_score(description: &str, reference: &str) -> u8 {
    let reference_norm = normalize_reference(reference);
    if reference_norm.is_empty() {
        return 0;
    }
    if normalize_reference(description).contains(&reference_norm) {
        return REFERENCE_WEIGHT;
    }

    let reference_digits = digits(reference);
    if reference_digits.len() >= MIN_REFERENCE_DIGITS
        && digits(description).contains(&reference_digits)
    {
        return REFERENCE_PARTIAL;
    }
    0
}

fn counterparty_score(transaction_name: Option<&str>, invoice_name: Option<&str>) -> u8 {
    let (Some(left), Some(right)) = (transaction_name, invoice_name) else {
        return 0;
    };
    let left = name_tokens(left);
    let right = name_tokens(right);
    if left.is_empty() || right.is_empty() {
        return 0;
    }
    if left == right {
        return COUNTERPARTY_WEIGHT;
    }

    let left: HashSet<&str> = left.iter().map(String::as_str).collect();
    let right: HashSet<&str> = right.iter().map(String::as_str).collect();
    let shared = left.intersection(&right).count();
    let union = left.union(&right).count();
    // Jaccard >= 0.5
    if shared > 0 && shared * 2 >= union {
        COUNTERPARTY_PARTIAL
    } else {
        0
    }
}

/// 从满分线性衰减到窗口边界的 0 分，向下取整
fn date_score(days: i64, window: i64) -> u8 {
    if window <= 0 || days > window {
        return 0;
    }
    (i64::from(DATE_WEIGHT) * (window - days) / window) as u8
}

/// 大写并去掉所有空白
pub fn normalize_reference(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

fn digits(value: &str) -> String {
    value.chars().filter(char::is_ascii_digit).collect()
}

/// 名称分词：小写字母数字片段
pub fn name_tokens(value: &str) -> Vec<String> {
    value
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}
