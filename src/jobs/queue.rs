//! Persistent job queue — enqueue, claim, cancel, and crash recovery.
//!
//! Every state transition is persisted before it is acted upon; the
//! in-memory picture never diverges from the durable record.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, QueueError};
use crate::session::{EnrichmentOptions, EnrichmentResult};
use crate::store::EnrichmentStore;

use super::job::{Job, JobStatus, Priority};

/// Queue counts for host polling.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStatus {
    pub by_status: BTreeMap<JobStatus, usize>,
    pub by_priority: BTreeMap<Priority, usize>,
    pub total: usize,
}

/// Priority job queue over the durable store.
pub struct JobQueue {
    store: Arc<dyn EnrichmentStore>,
    /// Serializes claim attempts so two dispatch passes can't grab the
    /// same job (claim-then-persist).
    claim_lock: Mutex<()>,
    default_max_attempts: u32,
}

impl JobQueue {
    pub fn new(store: Arc<dyn EnrichmentStore>, default_max_attempts: u32) -> Self {
        Self {
            store,
            claim_lock: Mutex::new(()),
            default_max_attempts,
        }
    }

    pub fn store(&self) -> &Arc<dyn EnrichmentStore> {
        &self.store
    }

    /// Enqueue a new job for a session.
    ///
    /// Fails with [`QueueError::DuplicateActiveJob`] while the session
    /// already has a pending or processing job.
    pub async fn enqueue(
        &self,
        session_id: &str,
        options: EnrichmentOptions,
        priority: Priority,
    ) -> Result<Job, Error> {
        if let Some(existing) = self.store.get_active_job_for_session(session_id).await? {
            return Err(QueueError::DuplicateActiveJob {
                session_id: session_id.to_string(),
                job_id: existing.id,
            }
            .into());
        }

        let job = Job::new(session_id, options, priority, self.default_max_attempts);
        // The store's unique active-session index backstops the check above.
        self.store.put_job(&job).await.map_err(|e| {
            if matches!(e, crate::error::StoreError::Constraint(_)) {
                Error::Queue(QueueError::DuplicateActiveJob {
                    session_id: session_id.to_string(),
                    job_id: job.id,
                })
            } else {
                Error::Store(e)
            }
        })?;

        info!(
            job_id = %job.id,
            session_id = %session_id,
            priority = %priority,
            "Enrichment job enqueued"
        );
        Ok(job)
    }

    /// Claim the next eligible pending job, if any.
    ///
    /// The job is marked processing and persisted *before* it is returned,
    /// so a concurrent claim can never hand out the same job twice.
    pub async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, Error> {
        let _guard = self.claim_lock.lock().await;

        let Some(mut job) = self.store.next_pending_job(now).await? else {
            return Ok(None);
        };

        job.transition_to(JobStatus::Processing)?;
        job.eligible_at = None;
        self.store.update_job(&job).await?;

        Ok(Some(job))
    }

    /// Cancel a job. Only pending jobs can be cancelled; anything else is
    /// a warned no-op. Returns whether the job was cancelled.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool, Error> {
        let Some(mut job) = self.store.get_job(job_id).await? else {
            warn!(job_id = %job_id, "Cancel requested for unknown job");
            return Ok(false);
        };

        if job.status != JobStatus::Pending {
            warn!(
                job_id = %job_id,
                status = %job.status,
                "Cancel requested for non-pending job; claimed jobs run to completion"
            );
            return Ok(false);
        }

        job.transition_to(JobStatus::Cancelled)?;
        self.store.update_job(&job).await?;
        info!(job_id = %job_id, session_id = %job.session_id, "Job cancelled");
        Ok(true)
    }

    /// Persist a successful completion.
    pub async fn complete(&self, job: &mut Job, result: EnrichmentResult) -> Result<(), Error> {
        job.transition_to(JobStatus::Completed)?;
        job.progress = 100;
        job.stage = None;
        job.result = Some(result);
        job.error = None;
        self.store.update_job(job).await?;
        Ok(())
    }

    /// Persist a terminal failure with a user-safe message.
    pub async fn fail(&self, job: &mut Job, user_message: &str) -> Result<(), Error> {
        job.transition_to(JobStatus::Failed)?;
        job.error = Some(user_message.to_string());
        self.store.update_job(job).await?;
        Ok(())
    }

    /// Persist a scheduled retry: the job goes back to pending with a
    /// future `eligible_at`, and the normal dispatch loop picks it up.
    pub async fn schedule_retry(
        &self,
        job: &mut Job,
        eligible_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        job.schedule_retry(eligible_at)?;
        self.store.update_job(job).await?;
        Ok(())
    }

    /// Persist in-run progress/stage updates.
    pub async fn update(&self, job: &Job) -> Result<(), Error> {
        self.store.update_job(job).await?;
        Ok(())
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>, Error> {
        Ok(self.store.get_job(id).await?)
    }

    pub async fn get_job_for_session(&self, session_id: &str) -> Result<Option<Job>, Error> {
        Ok(self.store.get_active_job_for_session(session_id).await?)
    }

    pub async fn delete_job(&self, id: Uuid) -> Result<bool, Error> {
        Ok(self.store.delete_job(id).await?)
    }

    /// Counts by status and priority.
    pub async fn status(&self) -> Result<QueueStatus, Error> {
        let by_status = self.store.counts_by_status().await?;
        let by_priority = self.store.counts_by_priority().await?;
        let total = by_status.values().sum();
        Ok(QueueStatus {
            by_status,
            by_priority,
            total,
        })
    }

    /// Startup recovery: jobs left `processing` by a crash go back to
    /// `pending` with attempts untouched — a crash is not a failure.
    pub async fn recover_interrupted(&self) -> Result<usize, Error> {
        let reset = self.store.reset_processing_jobs().await?;
        if reset > 0 {
            info!(count = reset, "Recovered interrupted jobs");
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlStore;

    async fn queue() -> JobQueue {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        JobQueue::new(store, 3)
    }

    #[tokio::test]
    async fn enqueue_rejects_second_active_job_for_session() {
        let q = queue().await;
        q.enqueue("sess_1", EnrichmentOptions::default(), Priority::Normal)
            .await
            .unwrap();

        let err = q
            .enqueue("sess_1", EnrichmentOptions::default(), Priority::High)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Queue(QueueError::DuplicateActiveJob { .. })
        ));
    }

    #[tokio::test]
    async fn enqueue_allowed_again_after_terminal() {
        let q = queue().await;
        let job = q
            .enqueue("sess_1", EnrichmentOptions::default(), Priority::Normal)
            .await
            .unwrap();

        assert!(q.cancel(job.id).await.unwrap());
        q.enqueue("sess_1", EnrichmentOptions::default(), Priority::Normal)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn claim_marks_processing_and_persists() {
        let q = queue().await;
        let job = q
            .enqueue("sess_1", EnrichmentOptions::default(), Priority::Normal)
            .await
            .unwrap();

        let claimed = q.claim_next(Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Processing);

        // The durable record already reflects the claim.
        let stored = q.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);

        // Nothing left to claim.
        assert!(q.claim_next(Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_order_is_priority_then_fifo() {
        let q = queue().await;
        q.enqueue("sess_low", EnrichmentOptions::default(), Priority::Low)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        q.enqueue("sess_normal", EnrichmentOptions::default(), Priority::Normal)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        q.enqueue("sess_high", EnrichmentOptions::default(), Priority::High)
            .await
            .unwrap();

        let order: Vec<String> = [
            q.claim_next(Utc::now()).await.unwrap().unwrap(),
            q.claim_next(Utc::now()).await.unwrap().unwrap(),
            q.claim_next(Utc::now()).await.unwrap().unwrap(),
        ]
        .into_iter()
        .map(|j| j.session_id)
        .collect();

        assert_eq!(order, vec!["sess_high", "sess_normal", "sess_low"]);
    }

    #[tokio::test]
    async fn cancel_only_works_while_pending() {
        let q = queue().await;
        let job = q
            .enqueue("sess_1", EnrichmentOptions::default(), Priority::Normal)
            .await
            .unwrap();

        let claimed = q.claim_next(Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);

        // Already claimed — cancel is a no-op.
        assert!(!q.cancel(job.id).await.unwrap());
        let stored = q.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_noop() {
        let q = queue().await;
        assert!(!q.cancel(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn retry_defers_until_eligible() {
        let q = queue().await;
        q.enqueue("sess_1", EnrichmentOptions::default(), Priority::Normal)
            .await
            .unwrap();

        let now = Utc::now();
        let mut claimed = q.claim_next(now).await.unwrap().unwrap();
        let eligible_at = now + chrono::Duration::seconds(30);
        q.schedule_retry(&mut claimed, eligible_at).await.unwrap();

        assert!(q.claim_next(now).await.unwrap().is_none());
        let reclaimed = q
            .claim_next(eligible_at + chrono::Duration::seconds(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.attempts, 1);
    }

    #[tokio::test]
    async fn recover_resets_processing_without_attempt_increment() {
        let q = queue().await;
        q.enqueue("sess_1", EnrichmentOptions::default(), Priority::Normal)
            .await
            .unwrap();
        let claimed = q.claim_next(Utc::now()).await.unwrap().unwrap();

        // Simulate a crash: the process restarts and recovers.
        let recovered = q.recover_interrupted().await.unwrap();
        assert_eq!(recovered, 1);

        let job = q.get_job(claimed.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn queue_status_counts() {
        let q = queue().await;
        q.enqueue("s1", EnrichmentOptions::default(), Priority::High)
            .await
            .unwrap();
        q.enqueue("s2", EnrichmentOptions::default(), Priority::Normal)
            .await
            .unwrap();
        q.claim_next(Utc::now()).await.unwrap();

        let status = q.status().await.unwrap();
        assert_eq!(status.total, 2);
        assert_eq!(status.by_status[&JobStatus::Pending], 1);
        assert_eq!(status.by_status[&JobStatus::Processing], 1);
        assert_eq!(status.by_priority[&Priority::High], 1);
    }
}
