//! Database connectivity shared by the run-key store and the rate limiter.

pub mod connection;

pub use connection::{DatabaseConnection, DatabasePool, PoolStatistics};
