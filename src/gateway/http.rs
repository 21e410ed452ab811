use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use super::{ChargeOutcome, ChargeRequest, GatewayError, PaymentGateway};
use crate::config::GatewayConfig;

/// 基于 HTTP 的支付网关适配器
///
/// `POST {base_url}/charges`，`Idempotency-Key` 头使用 charge_ref，
/// 因此本地超时后重发不会重复扣款。
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    status: String,
    #[serde(default)]
    failure_code: Option<String>,
    #[serde(default)]
    failure_message: Option<String>,
}

impl HttpPaymentGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn parse_outcome(body: ChargeResponse) -> Result<ChargeOutcome, GatewayError> {
        match body.status.as_str() {
            "succeeded" => Ok(ChargeOutcome::Succeeded),
            "declined" | "failed" => Ok(ChargeOutcome::Declined {
                code: body.failure_code.unwrap_or_else(|| "card_declined".to_string()),
                message: body.failure_message,
            }),
            other => Err(GatewayError(format!("unexpected charge status '{other}'"))),
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, GatewayError> {
        let url = format!("{}/charges", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Idempotency-Key", &request.charge_ref)
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                tracing::warn!(charge_ref = %request.charge_ref, "gateway charge timed out");
                return Ok(ChargeOutcome::TimedOut);
            }
            Err(err) => return Err(GatewayError(format!("charge request failed: {err}"))),
        };

        let status = response.status();
        if status.is_server_error() {
            return Err(GatewayError(format!("gateway responded with {status}")));
        }
        if !status.is_success() && status != StatusCode::PAYMENT_REQUIRED {
            return Err(GatewayError(format!("gateway rejected request with {status}")));
        }

        let body = match response.json::<ChargeResponse>().await {
            Ok(body) => body,
            Err(err) if err.is_timeout() => return Ok(ChargeOutcome::TimedOut),
            Err(err) => return Err(GatewayError(format!("invalid charge response: {err}"))),
        };

        Self::parse_outcome(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declined_without_code_defaults_to_card_declined() {
        let outcome = HttpPaymentGateway::parse_outcome(ChargeResponse {
            status: "declined".into(),
            failure_code: None,
            failure_message: Some("insufficient funds".into()),
        })
        .unwrap();
        assert_eq!(
            outcome,
            ChargeOutcome::Declined {
                code: "card_declined".into(),
                message: Some("insufficient funds".into()),
            }
        );
    }

    #[test]
    fn unknown_status_is_gateway_error() {
        let result = HttpPaymentGateway::parse_outcome(ChargeResponse {
            status: "requires_action".into(),
            failure_code: None,
            failure_message: None,
        });
        assert!(result.is_err());
    }
}
