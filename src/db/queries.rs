use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool};

use super::money::to_minor;
use super::repository::LedgerRepository;
use crate::error::{AppError, AppResult};
use crate::models::{
    BankTransaction, CommitOutcome, Invoice, MatchedBy, NewMatch, PaymentMatch,
};

/// 流水表行
#[derive(Debug, Clone, FromRow)]
struct TransactionRow {
    id: i64,
    organization_id: i64,
    account_id: i64,
    amount: BigDecimal,
    currency: String,
    value_date: NaiveDate,
    description: String,
    counterparty: Option<String>,
    match_status: String,
    match_id: Option<i64>,
}

impl TryFrom<TransactionRow> for BankTransaction {
    type Error = AppError;

    fn try_from(row: TransactionRow) -> AppResult<Self> {
        Ok(Self {
            id: row.id,
            organization_id: row.organization_id,
            account_id: row.account_id,
            amount: to_minor(&row.amount)?,
            currency: row.currency.trim().to_string(),
            value_date: row.value_date,
            description: row.description,
            counterparty: row.counterparty,
            match_status: row.match_status.parse()?,
            match_id: row.match_id,
        })
    }
}

/// 发票表行
#[derive(Debug, Clone, FromRow)]
struct InvoiceRow {
    id: i64,
    organization_id: i64,
    voucher_id: Option<i64>,
    amount_due: BigDecimal,
    currency: String,
    reference: String,
    counterparty: Option<String>,
    due_date: NaiveDate,
    outstanding: bool,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = AppError;

    fn try_from(row: InvoiceRow) -> AppResult<Self> {
        Ok(Self {
            id: row.id,
            organization_id: row.organization_id,
            voucher_id: row.voucher_id,
            amount_due: to_minor(&row.amount_due)?,
            currency: row.currency.trim().to_string(),
            reference: row.reference,
            counterparty: row.counterparty,
            due_date: row.due_date,
            outstanding: row.outstanding,
        })
    }
}

/// 匹配表行
#[derive(Debug, Clone, FromRow)]
struct MatchRow {
    id: i64,
    organization_id: i64,
    transaction_id: i64,
    invoice_id: i64,
    voucher_id: Option<i64>,
    score: i16,
    matched_by: String,
    user_id: Option<i64>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<MatchRow> for PaymentMatch {
    type Error = AppError;

    fn try_from(row: MatchRow) -> AppResult<Self> {
        let matched_by = match row.matched_by.as_str() {
            "auto" => MatchedBy::Auto,
            "manual" => MatchedBy::Manual,
            other => {
                return Err(AppError::validation(format!("unknown matched_by '{other}'")));
            }
        };
        let score = u8::try_from(row.score)
            .map_err(|_| AppError::validation(format!("score {} out of range", row.score)))?;

        Ok(Self {
            id: row.id,
            organization_id: row.organization_id,
            transaction_id: row.transaction_id,
            invoice_id: row.invoice_id,
            voucher_id: row.voucher_id,
            score,
            matched_by,
            user_id: row.user_id,
            notes: row.notes,
            created_at: row.created_at,
            deleted_at: row.deleted_at,
        })
    }
}

const MATCH_COLUMNS: &str = "id, organization_id, transaction_id, invoice_id, voucher_id, score, \
     matched_by, user_id, notes, created_at, deleted_at";

/// Postgres 账本仓库
#[derive(Clone)]
pub struct PgLedgerRepository {
    pool: PgPool,
}

impl PgLedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerRepository for PgLedgerRepository {
    async fn get_unmatched_transactions(
        &self,
        organization_id: i64,
    ) -> AppResult<Vec<BankTransaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT id, organization_id, account_id, amount, currency, value_date,
                   description, counterparty, match_status, match_id
            FROM bank_transactions
            WHERE organization_id = $1
              AND match_status = 'unmatched'
            ORDER BY id ASC
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BankTransaction::try_from).collect()
    }

    async fn get_outstanding_invoices(&self, organization_id: i64) -> AppResult<Vec<Invoice>> {
        let rows = sqlx::query_as::<_, InvoiceRow>(
            r#"
            SELECT i.id, i.organization_id, i.voucher_id, i.amount_due, i.currency,
                   i.reference, i.counterparty, i.due_date, i.outstanding
            FROM invoices i
            WHERE i.organization_id = $1
              AND i.outstanding
              AND NOT EXISTS (
                  SELECT 1 FROM payment_matches m
                  WHERE m.invoice_id = i.id AND m.deleted_at IS NULL
              )
            ORDER BY i.id ASC
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Invoice::try_from).collect()
    }

    async fn get_transaction(&self, transaction_id: i64) -> AppResult<Option<BankTransaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT id, organization_id, account_id, amount, currency, value_date,
                   description, counterparty, match_status, match_id
            FROM bank_transactions
            WHERE id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BankTransaction::try_from).transpose()
    }

    async fn get_invoice(&self, invoice_id: i64) -> AppResult<Option<Invoice>> {
        let row = sqlx::query_as::<_, InvoiceRow>(
            r#"
            SELECT id, organization_id, voucher_id, amount_due, currency,
                   reference, counterparty, due_date, outstanding
            FROM invoices
            WHERE id = $1
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Invoice::try_from).transpose()
    }

    async fn get_active_match(&self, transaction_id: i64) -> AppResult<Option<PaymentMatch>> {
        let row = sqlx::query_as::<_, MatchRow>(&format!(
            "SELECT {MATCH_COLUMNS} FROM payment_matches \
             WHERE transaction_id = $1 AND deleted_at IS NULL"
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PaymentMatch::try_from).transpose()
    }

    async fn commit_match(&self, new_match: NewMatch) -> AppResult<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        // 1. 抢占流水：只有仍是 unmatched 的才会被更新
        let claimed = sqlx::query(
            r#"
            UPDATE bank_transactions
            SET match_status = 'matched', updated_at = NOW()
            WHERE id = $1 AND match_status = 'unmatched'
            "#,
        )
        .bind(new_match.transaction_id)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(CommitOutcome::TransactionClaimed);
        }

        let outstanding: Option<bool> =
            sqlx::query_scalar("SELECT outstanding FROM invoices WHERE id = $1")
                .bind(new_match.invoice_id)
                .fetch_optional(&mut *tx)
                .await?;
        if outstanding != Some(true) {
            tx.rollback().await?;
            return Ok(CommitOutcome::InvoiceClaimed);
        }

        // 2. 部分唯一索引保证发票只有一条有效匹配
        let row = sqlx::query_as::<_, MatchRow>(&format!(
            r#"
            INSERT INTO payment_matches (
                organization_id, transaction_id, invoice_id, voucher_id,
                score, matched_by, user_id, notes
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT DO NOTHING
            RETURNING {MATCH_COLUMNS}
            "#
        ))
        .bind(new_match.organization_id)
        .bind(new_match.transaction_id)
        .bind(new_match.invoice_id)
        .bind(new_match.voucher_id)
        .bind(i16::from(new_match.score))
        .bind(new_match.matched_by.as_str())
        .bind(new_match.user_id)
        .bind(&new_match.notes)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(CommitOutcome::InvoiceClaimed);
        };

        sqlx::query("UPDATE bank_transactions SET match_id = $2 WHERE id = $1")
            .bind(new_match.transaction_id)
            .bind(row.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(CommitOutcome::Committed(PaymentMatch::try_from(row)?))
    }

    async fn revert_match(&self, match_id: i64) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;

        let transaction_id: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE payment_matches
            SET deleted_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING transaction_id
            "#,
        )
        .bind(match_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(transaction_id) = transaction_id else {
            tx.rollback().await?;
            return Ok(false);
        };

        sqlx::query(
            r#"
            UPDATE bank_transactions
            SET match_status = 'unmatched', match_id = NULL, updated_at = NOW()
            WHERE id = $1 AND match_id = $2
            "#,
        )
        .bind(transaction_id)
        .bind(match_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}
