//! The database-backed retry pipeline: row model, repository, and manager.

pub mod manager;
pub mod model;
pub mod repository;

pub use manager::RetryManager;
pub use model::{DbRetries, DbTopicRetry, Retry, RetryState};
pub use repository::{PgRetryRepository, RetryRepository, RETRY_BATCH_SIZE, STALE_LEASE_THRESHOLD};
