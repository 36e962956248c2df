//! Error types for the enrichment engine.

use std::time::Duration;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::session::StageKind;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// Durable-store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open store: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job-queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Session {session_id} already has an active enrichment job {job_id}")]
    DuplicateActiveJob { session_id: String, job_id: Uuid },

    #[error("Job {id} not found")]
    JobNotFound { id: Uuid },

    #[error("Job {id} cannot transition from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Queue is shutting down")]
    ShuttingDown,
}

/// Worker-pool errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("No worker became available within {waited:?}")]
    AcquireTimeout { waited: Duration },

    #[error("Worker pool is shut down")]
    PoolShutdown,

    #[error("Worker {id} not found in pool")]
    UnknownWorker { id: Uuid },
}

/// Artifact/memo cache errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Cache value serialization failed: {0}")]
    Serialization(String),
}

/// Checkpoint / incremental-processing errors.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Checkpoint for session {session_id} would rewind stream {stream} ({from} -> {to})")]
    Rewind {
        session_id: String,
        stream: String,
        from: usize,
        to: usize,
    },
}

/// Backend-only cost diagnostics attached to budget failures.
///
/// Deliberately excluded from all `Display` output — this payload is for
/// logs, never for user-facing messages.
#[derive(Debug, Clone)]
pub struct CostDetail {
    /// Cost accumulated so far for the session.
    pub spent: Decimal,
    /// Configured ceiling that was hit.
    pub limit: Decimal,
}

/// Failures reported by the enrichment executor collaborator.
///
/// Variants carry explicit kinds so classification never has to guess from
/// message text; `Other` is the only variant classified by text heuristics.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Enrichment timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("Enrichment provider rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Enrichment provider unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Enrichment provider rejected credentials")]
    AuthFailed,

    #[error("Enrichment input rejected: {reason}")]
    InvalidInput { reason: String },

    // Display stays cost-free; the detail is logged backend-side only.
    #[error("Enrichment usage limit reached")]
    BudgetExceeded { detail: CostDetail },

    #[error("Enrichment stage {stage} failed: {reason}")]
    StageFailed { stage: StageKind, reason: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
