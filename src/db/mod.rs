pub mod memory;
pub mod money;
pub mod pool;
pub mod queries;
pub mod queries_billing;
pub mod repository;

pub use memory::{InMemoryBilling, InMemoryLedger};
pub use pool::create_pool;
pub use queries::PgLedgerRepository;
pub use queries_billing::PgBillingRepository;
pub use repository::{BillingRepository, LedgerRepository};
