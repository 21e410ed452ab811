use indexmap::IndexSet;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;

use super::scoring::{rank_candidates, MatchingPolicy};
use crate::db::LedgerRepository;
use crate::error::{AppError, AppResult};
use crate::models::{
    BankTransaction, CommitOutcome, MatchStats, MatchedBy, NewMatch, PaymentMatch,
    ReviewCandidate, ScoredCandidate,
};

/// 人工匹配请求
#[derive(Debug, Clone)]
pub struct ManualMatch {
    pub transaction_id: i64,
    pub invoice_id: i64,
    pub user_id: i64,
    pub voucher_id: Option<i64>,
    pub notes: Option<String>,
}

/// 单条流水的处理结果
enum Decision {
    Matched,
    Ambiguous(ReviewCandidate),
    Unmatched,
    /// 提交时发现流水已被并发处理
    Skipped,
}

/// 流水-发票匹配引擎
///
/// 候选评分用 rayon 并行计算；提交按流水ID顺序串行进行，
/// 依靠仓库的 compare-and-commit 保证 1:1 不变量。
pub struct MatchingEngine {
    repo: Arc<dyn LedgerRepository>,
    policy: MatchingPolicy,
}

impl MatchingEngine {
    pub fn new(repo: Arc<dyn LedgerRepository>, policy: MatchingPolicy) -> AppResult<Self> {
        policy.validate()?;
        Ok(Self { repo, policy })
    }

    pub fn policy(&self) -> &MatchingPolicy {
        &self.policy
    }

    /// 对组织内所有未匹配流水执行自动匹配
    ///
    /// 存储故障时返回 `BatchAborted`，此前已提交的匹配保持不变。
    pub async fn match_all(&self, organization_id: i64) -> AppResult<MatchStats> {
        let started = Instant::now();
        let mut stats = MatchStats::new(organization_id);

        let mut transactions = self
            .repo
            .get_unmatched_transactions(organization_id)
            .await
            .map_err(|e| AppError::aborted(0, e))?;
        let invoices = self
            .repo
            .get_outstanding_invoices(organization_id)
            .await
            .map_err(|e| AppError::aborted(0, e))?;

        transactions.sort_by_key(|t| t.id);
        tracing::info!(
            organization_id,
            transactions = transactions.len(),
            invoices = invoices.len(),
            "auto-match started"
        );

        let policy = self.policy;
        let ranked: Vec<Vec<ScoredCandidate>> = transactions
            .par_iter()
            .map(|tx| rank_candidates(tx, &invoices, &policy))
            .collect();

        // 本轮已被占用的发票 (保序去重)
        let mut claimed: IndexSet<i64> = IndexSet::new();

        for (tx, candidates) in transactions.iter().zip(ranked.iter()) {
            let decision = self
                .decide(tx, candidates, &mut claimed)
                .await
                .map_err(|e| {
                    tracing::error!(
                        organization_id,
                        transaction_id = tx.id,
                        processed = stats.processed,
                        error = %e,
                        "auto-match aborted"
                    );
                    AppError::aborted(stats.processed, e)
                })?;

            stats.processed += 1;
            match decision {
                Decision::Matched => stats.matched += 1,
                Decision::Ambiguous(candidate) => {
                    stats.ambiguous += 1;
                    stats.review.push(candidate);
                }
                Decision::Unmatched => stats.unmatched += 1,
                Decision::Skipped => stats.skipped += 1,
            }
        }

        tracing::info!(
            organization_id,
            processed = stats.processed,
            matched = stats.matched,
            ambiguous = stats.ambiguous,
            unmatched = stats.unmatched,
            skipped = stats.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "auto-match finished"
        );
        Ok(stats)
    }

    async fn decide(
        &self,
        tx: &BankTransaction,
        candidates: &[ScoredCandidate],
        claimed: &mut IndexSet<i64>,
    ) -> AppResult<Decision> {
        for candidate in candidates {
            let total = candidate.score.total();
            if !self.policy.is_auto_match(total) {
                break;
            }
            if claimed.contains(&candidate.invoice_id) {
                continue;
            }

            let new_match = NewMatch {
                organization_id: tx.organization_id,
                transaction_id: tx.id,
                invoice_id: candidate.invoice_id,
                voucher_id: candidate.voucher_id,
                score: total,
                matched_by: MatchedBy::Auto,
                user_id: None,
                notes: Some(format!("Auto-matched ({})", candidate.score)),
            };

            match self.repo.commit_match(new_match).await? {
                CommitOutcome::Committed(record) => {
                    claimed.insert(candidate.invoice_id);
                    tracing::debug!(
                        transaction_id = tx.id,
                        invoice_id = candidate.invoice_id,
                        match_id = record.id,
                        score = total,
                        "transaction auto-matched"
                    );
                    return Ok(Decision::Matched);
                }
                CommitOutcome::TransactionClaimed => {
                    tracing::debug!(
                        transaction_id = tx.id,
                        "transaction claimed concurrently, skipping"
                    );
                    return Ok(Decision::Skipped);
                }
                CommitOutcome::InvoiceClaimed => {
                    // 发票被并发占用，换下一个候选
                    claimed.insert(candidate.invoice_id);
                }
            }
        }

        let best = candidates
            .iter()
            .find(|c| !claimed.contains(&c.invoice_id));
        match best {
            Some(best) if self.policy.needs_review(best.score.total()) => {
                tracing::debug!(
                    transaction_id = tx.id,
                    invoice_id = best.invoice_id,
                    score = best.score.total(),
                    "best candidate needs review"
                );
                Ok(Decision::Ambiguous(ReviewCandidate {
                    transaction_id: tx.id,
                    invoice_id: best.invoice_id,
                    score: best.score.total(),
                    breakdown: best.score,
                }))
            }
            _ => Ok(Decision::Unmatched),
        }
    }

    /// 人工匹配，跳过评分
    pub async fn manual_match(&self, request: ManualMatch) -> AppResult<PaymentMatch> {
        let transaction = self
            .repo
            .get_transaction(request.transaction_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("transaction {}", request.transaction_id)))?;
        let invoice = self
            .repo
            .get_invoice(request.invoice_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("invoice {}", request.invoice_id)))?;

        if transaction.organization_id != invoice.organization_id {
            return Err(AppError::validation(format!(
                "transaction {} and invoice {} belong to different organizations",
                transaction.id, invoice.id
            )));
        }
        if self.repo.get_active_match(transaction.id).await?.is_some()
            || !transaction.is_unmatched()
        {
            return Err(AppError::conflict(format!(
                "transaction {} is already {}",
                transaction.id, transaction.match_status
            )));
        }
        if !invoice.outstanding {
            return Err(AppError::conflict(format!(
                "invoice {} is not outstanding",
                invoice.id
            )));
        }

        let new_match = NewMatch::manual(
            &transaction,
            invoice.id,
            request.voucher_id.or(invoice.voucher_id),
            request.user_id,
            request.notes,
        );

        match self.repo.commit_match(new_match).await? {
            CommitOutcome::Committed(record) => {
                tracing::info!(
                    transaction_id = transaction.id,
                    invoice_id = invoice.id,
                    user_id = request.user_id,
                    match_id = record.id,
                    "manual match committed"
                );
                Ok(record)
            }
            CommitOutcome::TransactionClaimed => Err(AppError::conflict(format!(
                "transaction {} was matched concurrently",
                transaction.id
            ))),
            CommitOutcome::InvoiceClaimed => Err(AppError::conflict(format!(
                "invoice {} is already matched",
                invoice.id
            ))),
        }
    }

    /// 撤销流水的有效匹配；没有有效匹配时返回 false
    pub async fn unmatch(&self, transaction_id: i64) -> AppResult<bool> {
        let Some(active) = self.repo.get_active_match(transaction_id).await? else {
            return Ok(false);
        };

        let reverted = self.repo.revert_match(active.id).await?;
        if reverted {
            tracing::info!(
                transaction_id,
                invoice_id = active.invoice_id,
                match_id = active.id,
                "match reverted"
            );
        }
        Ok(reverted)
    }
}

/// 复核队列导出为 CSV
pub fn export_review_csv(stats: &MatchStats) -> AppResult<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "organization_id",
        "transaction_id",
        "invoice_id",
        "score",
        "amount",
        "reference",
        "counterparty",
        "date",
    ])?;

    for candidate in &stats.review {
        writer.write_record(&[
            stats.organization_id.to_string(),
            candidate.transaction_id.to_string(),
            candidate.invoice_id.to_string(),
            candidate.score.to_string(),
            candidate.breakdown.amount.to_string(),
            candidate.breakdown.reference.to_string(),
            candidate.breakdown.counterparty.to_string(),
            candidate.breakdown.date.to_string(),
        ])?;
    }

    writer.flush().map_err(|e| AppError::Export(e.to_string()))?;
    writer
        .into_inner()
        .map_err(|e| AppError::Export(e.to_string()))
}
