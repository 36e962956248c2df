//! Backend-agnostic durable store trait.
//!
//! One async trait fronts everything the engine persists: job records with
//! their three lookup paths (status, session, priority+creation order),
//! checkpoints, the durable cache tier, and job-duration history for ETA
//! estimation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::cache::CacheEntry;
use crate::error::StoreError;
use crate::incremental::Checkpoint;
use crate::jobs::{Job, JobStatus, Priority};

/// Durable persistence for the enrichment engine.
#[async_trait]
pub trait EnrichmentStore: Send + Sync {
    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a new job record.
    async fn put_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Get the non-terminal job for a session, if one exists.
    async fn get_active_job_for_session(
        &self,
        session_id: &str,
    ) -> Result<Option<Job>, StoreError>;

    /// Persist the full state of an existing job.
    async fn update_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Delete a job record. Returns whether a row was removed.
    async fn delete_job(&self, id: Uuid) -> Result<bool, StoreError>;

    /// The next claimable pending job: highest priority tier first, FIFO by
    /// creation time within a tier, skipping jobs deferred past `now`.
    async fn next_pending_job(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError>;

    /// Crash recovery: flip every `processing` job back to `pending`
    /// without touching its attempt count. Returns how many were reset.
    async fn reset_processing_jobs(&self) -> Result<usize, StoreError>;

    /// Job counts grouped by status.
    async fn counts_by_status(&self) -> Result<BTreeMap<JobStatus, usize>, StoreError>;

    /// Job counts grouped by priority.
    async fn counts_by_priority(&self) -> Result<BTreeMap<Priority, usize>, StoreError>;

    /// Jobs in a given status, oldest first.
    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    // ── Checkpoints ─────────────────────────────────────────────────

    async fn get_checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    async fn delete_checkpoint(&self, session_id: &str) -> Result<bool, StoreError>;

    // ── Durable cache tier ──────────────────────────────────────────

    async fn get_cache_entry(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

    async fn put_cache_entry(&self, entry: &CacheEntry) -> Result<(), StoreError>;

    async fn delete_cache_entry(&self, key: &str) -> Result<bool, StoreError>;

    /// Remove entries whose key contains `pattern`. Returns count removed.
    async fn invalidate_cache_entries(&self, pattern: &str) -> Result<usize, StoreError>;

    /// Bump access statistics for a cache hit.
    async fn touch_cache_entry(&self, key: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    // ── Duration history (ETA source) ───────────────────────────────

    async fn record_job_duration(
        &self,
        session_id: &str,
        duration_secs: f64,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Most recent completed-job durations, newest first.
    async fn recent_job_durations(&self, limit: usize) -> Result<Vec<f64>, StoreError>;
}
