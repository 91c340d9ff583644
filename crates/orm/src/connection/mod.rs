//! Connection Management
//!
//! Bounded session pool over a `DatabaseBackend`, with acquisition
//! timeouts, connect retries and usage statistics.

pub mod pool;
pub mod statistics;

pub use pool::ConnectionPool;
pub use statistics::PoolStats;
