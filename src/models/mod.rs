pub mod billing;
pub mod invoice;
pub mod payment_match;
pub mod subscription;
pub mod transaction;

pub use billing::{
    BillingCycle, BillingStats, CycleStatus, NewPaymentTransaction, PaymentStatus,
    PaymentTransaction, ReconcileOutcome, RetryStats,
};
pub use invoice::Invoice;
pub use payment_match::{
    CommitOutcome, MatchStats, MatchedBy, NewMatch, PaymentMatch, ReviewCandidate,
    ScoreBreakdown, ScoredCandidate,
};
pub use subscription::{
    BillingInterval, Subscription, SubscriptionStatus, SubscriptionSummary, SubscriptionUpdate,
    MAX_CHARGE_ATTEMPTS,
};
pub use transaction::{BankTransaction, MatchStatus};
