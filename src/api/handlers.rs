use axum::{
    extract::{Json, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::AppResult;
use crate::gateway::GatewayEvent;
use crate::service::{export_review_csv, ManualMatch};

/// 通用响应体
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
}

fn ok<T: Serialize>(message: impl Into<String>, data: T) -> Response {
    let body = ApiResponse {
        success: true,
        message: message.into(),
        data: Some(data),
    };
    (StatusCode::OK, Json(body)).into_response()
}

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug, Default, Deserialize)]
pub struct MatchRunQuery {
    /// `csv` 时返回复核队列 CSV
    pub format: Option<String>,
}

/// 对组织执行自动匹配
pub async fn run_match(
    State(state): State<AppState>,
    Path(organization_id): Path<i64>,
    Query(query): Query<MatchRunQuery>,
) -> AppResult<Response> {
    let stats = state.matching.match_all(organization_id).await?;

    if query.format.as_deref() == Some("csv") {
        let body = export_review_csv(&stats)?;
        return Ok((
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"review-{organization_id}.csv\""),
                ),
            ],
            body,
        )
            .into_response());
    }

    Ok(ok(
        format!(
            "Matched {} of {} transactions, {} need review",
            stats.matched, stats.processed, stats.ambiguous
        ),
        stats,
    ))
}

#[derive(Debug, Deserialize)]
pub struct ManualMatchRequest {
    pub transaction_id: i64,
    pub invoice_id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub voucher_id: Option<i64>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// 人工匹配
pub async fn manual_match(
    State(state): State<AppState>,
    Json(req): Json<ManualMatchRequest>,
) -> AppResult<Response> {
    let record = state
        .matching
        .manual_match(ManualMatch {
            transaction_id: req.transaction_id,
            invoice_id: req.invoice_id,
            user_id: req.user_id,
            voucher_id: req.voucher_id,
            notes: req.notes,
        })
        .await?;
    Ok(ok("Transaction matched", record))
}

/// 撤销匹配
pub async fn unmatch(
    State(state): State<AppState>,
    Path(transaction_id): Path<i64>,
) -> AppResult<Response> {
    let reverted = state.matching.unmatch(transaction_id).await?;
    let message = if reverted {
        "Match removed"
    } else {
        "Transaction had no active match"
    };
    Ok(ok(message, reverted))
}

#[derive(Debug, Default, Deserialize)]
pub struct RunDateRequest {
    /// 缺省为当天 (UTC)
    #[serde(default)]
    pub run_date: Option<NaiveDate>,
}

fn run_date_of(req: Option<Json<RunDateRequest>>) -> NaiveDate {
    req.and_then(|Json(r)| r.run_date)
        .unwrap_or_else(|| Utc::now().date_naive())
}

pub async fn run_monthly_billing(
    State(state): State<AppState>,
    req: Option<Json<RunDateRequest>>,
) -> AppResult<Response> {
    let stats = state.billing.process_monthly_billing(run_date_of(req)).await?;
    Ok(ok(
        format!("Charged {}, failed {}", stats.charged, stats.failed),
        stats,
    ))
}

pub async fn run_payment_retries(
    State(state): State<AppState>,
    req: Option<Json<RunDateRequest>>,
) -> AppResult<Response> {
    let stats = state.billing.process_payment_retries(run_date_of(req)).await?;
    Ok(ok(
        format!(
            "Retried {}, recovered {}, suspended {}",
            stats.retried, stats.succeeded, stats.suspended
        ),
        stats,
    ))
}

#[derive(Debug, Serialize)]
pub struct FeatureAccess {
    pub user_id: i64,
    pub can_access_features: bool,
}

pub async fn check_features(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> AppResult<Response> {
    let allowed = state.billing.check_subscription_features(user_id).await?;
    Ok(ok(
        if allowed { "Access granted" } else { "Access denied" },
        FeatureAccess {
            user_id,
            can_access_features: allowed,
        },
    ))
}

pub async fn subscription_summary(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> AppResult<Response> {
    let summary = state.billing.get_subscription_status_summary(user_id).await?;
    Ok(ok(format!("Subscription is {}", summary.status), summary))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(subscription_id): Path<i64>,
) -> AppResult<Response> {
    let subscription = state.billing.cancel_subscription(subscription_id).await?;
    Ok(ok("Subscription canceled", subscription))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReactivateRequest {
    #[serde(default)]
    pub payment_method_ref: Option<String>,
    #[serde(default)]
    pub run_date: Option<NaiveDate>,
}

pub async fn reactivate_subscription(
    State(state): State<AppState>,
    Path(subscription_id): Path<i64>,
    req: Option<Json<ReactivateRequest>>,
) -> AppResult<Response> {
    let Json(req) = req.unwrap_or_default();
    let run_date = req.run_date.unwrap_or_else(|| Utc::now().date_naive());
    let subscription = state
        .billing
        .reactivate_subscription(subscription_id, req.payment_method_ref, run_date)
        .await?;
    Ok(ok(
        format!("Subscription is {}", subscription.status),
        subscription,
    ))
}

/// 支付网关回调
pub async fn gateway_webhook(
    State(state): State<AppState>,
    Json(event): Json<GatewayEvent>,
) -> AppResult<Response> {
    let outcome = state.billing.apply_gateway_event(&event).await?;
    Ok(ok(format!("Event {:?}", outcome), outcome))
}

/// 对账单导入完成通知，异步触发匹配
pub async fn import_completed(
    State(state): State<AppState>,
    Path(organization_id): Path<i64>,
) -> AppResult<Response> {
    state.jobs.dispatch(organization_id).await?;
    let body = ApiResponse::<()> {
        success: true,
        message: format!("Matching scheduled for organization {organization_id}"),
        data: None,
    };
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}
