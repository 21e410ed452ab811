pub mod billing;
pub mod matcher;
pub mod reconciliation;
pub mod scoring;

pub use billing::{charge_reference, AttemptOutcome, BillingEngine};
pub use matcher::{export_review_csv, ManualMatch, MatchingEngine};
pub use scoring::{MatchingPolicy, ACCEPTANCE_THRESHOLD};
