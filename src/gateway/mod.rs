pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HttpPaymentGateway;

/// 单次扣款请求
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChargeRequest {
    pub customer_ref: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub payment_method_ref: Option<String>,
    /// 幂等键；网关在响应与 webhook 中原样回传
    pub charge_ref: String,
    pub description: String,
}

/// 网关给出的确定性结果。拒付是正常业务结果，不是错误。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    Succeeded,
    Declined { code: String, message: Option<String> },
    /// 本地超时，结果未知，等待 webhook 对账
    TimedOut,
}

/// 网关本身不可用 (连接失败、5xx、响应无法解析)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct GatewayError(pub String);

/// key: payment-gateway -> charge capability consumed by the billing engine
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, GatewayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Succeeded,
    Failed,
}

/// 网关异步回调 (webhook)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub charge_ref: String,
    pub outcome: EventOutcome,
    #[serde(default)]
    pub failure_code: Option<String>,
    #[serde(default)]
    pub failure_message: Option<String>,
}
