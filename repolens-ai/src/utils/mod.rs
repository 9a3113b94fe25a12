//! Utility modules for repolens-ai

pub mod backoff;
pub mod db_retry;

pub use backoff::BackoffPolicy;
pub use db_retry::retry_on_lock;
