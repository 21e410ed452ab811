pub mod handlers;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

pub use handlers::*;

use crate::scheduler::MatchJobHandle;
use crate::service::{BillingEngine, MatchingEngine};

/// 共享状态：两个引擎 + 匹配任务队列
#[derive(Clone)]
pub struct AppState {
    pub matching: Arc<MatchingEngine>,
    pub billing: Arc<BillingEngine>,
    pub jobs: MatchJobHandle,
}

pub fn router(state: AppState) -> Router {
    let matching_routes = Router::new()
        .route("/api/match/:organization_id/run", post(handlers::run_match))
        .route("/api/match/manual", post(handlers::manual_match))
        .route(
            "/api/match/transactions/:transaction_id",
            delete(handlers::unmatch),
        )
        .route(
            "/api/imports/:organization_id/completed",
            post(handlers::import_completed),
        );

    let billing_routes = Router::new()
        .route("/api/billing/run-monthly", post(handlers::run_monthly_billing))
        .route("/api/billing/run-retries", post(handlers::run_payment_retries))
        .route(
            "/api/billing/users/:user_id/features",
            get(handlers::check_features),
        )
        .route(
            "/api/billing/users/:user_id/summary",
            get(handlers::subscription_summary),
        )
        .route(
            "/api/billing/subscriptions/:subscription_id/cancel",
            post(handlers::cancel_subscription),
        )
        .route(
            "/api/billing/subscriptions/:subscription_id/reactivate",
            post(handlers::reactivate_subscription),
        )
        .route("/api/billing/webhook", post(handlers::gateway_webhook));

    Router::new()
        .route("/health", get(handlers::health_check))
        .merge(matching_routes)
        .merge(billing_routes)
        .with_state(state)
}
