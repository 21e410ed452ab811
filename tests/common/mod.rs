#![allow(dead_code)]

use async_trait::async_trait;
use bank_recon_rust::gateway::{ChargeOutcome, ChargeRequest, GatewayError, PaymentGateway};
use bank_recon_rust::models::{
    BankTransaction, BillingInterval, Invoice, MatchStatus, Subscription, SubscriptionStatus,
};
use chrono::NaiveDate;
use std::collections::VecDeque;
use std::sync::Mutex;

pub const ORG: i64 = 1;

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn transaction(
    id: i64,
    amount: i64,
    description: &str,
    counterparty: &str,
    value_date: NaiveDate,
) -> BankTransaction {
    BankTransaction {
        id,
        organization_id: ORG,
        account_id: 10,
        amount,
        currency: "EUR".to_string(),
        value_date,
        description: description.to_string(),
        counterparty: Some(counterparty.to_string()),
        match_status: MatchStatus::Unmatched,
        match_id: None,
    }
}

pub fn invoice(
    id: i64,
    amount_due: i64,
    reference: &str,
    counterparty: &str,
    due_date: NaiveDate,
) -> Invoice {
    Invoice {
        id,
        organization_id: ORG,
        voucher_id: Some(id * 100),
        amount_due,
        currency: "EUR".to_string(),
        reference: reference.to_string(),
        counterparty: Some(counterparty.to_string()),
        due_date,
        outstanding: true,
    }
}

pub fn subscription(id: i64, user_id: i64, next_payment_date: NaiveDate) -> Subscription {
    Subscription {
        id,
        organization_id: ORG,
        user_id,
        plan_id: "pro".to_string(),
        status: SubscriptionStatus::Active,
        billing_interval: BillingInterval::Monthly,
        amount: 2_900,
        currency: "EUR".to_string(),
        current_period_start: date(2023, 12, 1),
        current_period_end: next_payment_date,
        next_payment_date,
        consecutive_failed_attempts: 0,
        last_attempt_on: None,
        gateway_customer_ref: Some(format!("cus_{user_id}")),
        payment_method_ref: Some(format!("pm_{user_id}")),
        suspended_at: None,
        canceled_at: None,
        last_failure_reason: None,
    }
}

pub fn declined() -> Result<ChargeOutcome, GatewayError> {
    Ok(ChargeOutcome::Declined {
        code: "card_declined".to_string(),
        message: Some("insufficient funds".to_string()),
    })
}

/// 按脚本依次返回结果的网关；脚本用尽后返回默认结果
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Result<ChargeOutcome, GatewayError>>>,
    fallback: Result<ChargeOutcome, GatewayError>,
    requests: Mutex<Vec<ChargeRequest>>,
}

impl ScriptedGateway {
    pub fn always(outcome: Result<ChargeOutcome, GatewayError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: outcome,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::always(Ok(ChargeOutcome::Succeeded))
    }

    pub fn declining() -> Self {
        Self::always(declined())
    }

    pub fn scripted(
        outcomes: Vec<Result<ChargeOutcome, GatewayError>>,
        fallback: Result<ChargeOutcome, GatewayError>,
    ) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ChargeRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, GatewayError> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}
