//! Worker pool.

pub mod pool;

pub use pool::{PoolHealth, WorkerLease, WorkerPool, WorkerSnapshot, WorkerStatus};
