use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// 待收款发票/凭证 (外部实体，对匹配引擎只读)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: i64,
    pub organization_id: i64,
    pub voucher_id: Option<i64>,
    /// 应收金额，最小货币单位
    pub amount_due: i64,
    pub currency: String,
    pub reference: String,
    pub counterparty: Option<String>,
    pub due_date: NaiveDate,
    pub outstanding: bool,
}
