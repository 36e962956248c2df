//! The orchestrator façade.
//!
//! `EnrichmentEngine` wires the store, queue, worker pool, caches,
//! incremental processor, classifier, and progress tracker together behind
//! the public API the host application uses. All collaborators are explicit
//! constructor arguments — no global singletons.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{ArtifactCache, CacheStats, MemoCache, MemoStats};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::executor::EnrichmentExecutor;
use crate::faults::ErrorClassifier;
use crate::incremental::IncrementalProcessor;
use crate::jobs::{Job, JobQueue, JobStatus, Priority, QueueStatus, Scheduler, SchedulerDeps};
use crate::progress::{BatchProgress, ProgressTracker, SessionProgress};
use crate::session::{EnrichmentOptions, SessionSource};
use crate::store::EnrichmentStore;
use crate::worker::{PoolHealth, WorkerPool};

/// Background enrichment engine.
pub struct EnrichmentEngine {
    queue: Arc<JobQueue>,
    pool: Arc<WorkerPool>,
    cache: Arc<ArtifactCache>,
    memo: Arc<MemoCache>,
    progress: Arc<ProgressTracker>,
    events: Arc<EventBus>,
    scheduler: Arc<Scheduler>,
    dispatch_handle: Mutex<Option<JoinHandle<()>>>,
    health_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EnrichmentEngine {
    /// Start the engine: run crash recovery, seed the ETA history, and
    /// spawn the dispatch loop and pool health task.
    pub async fn start(
        config: EngineConfig,
        store: Arc<dyn EnrichmentStore>,
        sessions: Arc<dyn SessionSource>,
        executor: Arc<dyn EnrichmentExecutor>,
    ) -> Result<Arc<Self>> {
        let queue = Arc::new(JobQueue::new(Arc::clone(&store), config.max_attempts));
        let recovered = queue.recover_interrupted().await?;

        let pool = Arc::new(WorkerPool::new(config.worker.clone()));
        let cache = Arc::new(ArtifactCache::new(
            Arc::clone(&store),
            config.cache.clone(),
            executor.version(),
        ));
        let memo = Arc::new(MemoCache::new(
            config.cache.memo_max_entries,
            config.cache.memo_ttl,
        ));
        let incremental = Arc::new(IncrementalProcessor::new(
            executor.version(),
            config.schema_version,
        ));
        let classifier = Arc::new(ErrorClassifier::new(
            config.retry.clone(),
            config.breaker.clone(),
        ));
        let events = Arc::new(EventBus::new());

        let progress = Arc::new(ProgressTracker::new());
        match store.recent_job_durations(50).await {
            Ok(durations) => progress.seed_history(durations),
            Err(e) => warn!(error = %e, "Could not seed ETA history"),
        }

        let scheduler = Arc::new(Scheduler::new(
            SchedulerDeps {
                queue: Arc::clone(&queue),
                pool: Arc::clone(&pool),
                cache: Arc::clone(&cache),
                memo: Arc::clone(&memo),
                incremental,
                classifier,
                progress: Arc::clone(&progress),
                events: Arc::clone(&events),
                executor,
                sessions,
            },
            config.clone(),
        ));

        let dispatch_handle = Arc::clone(&scheduler).spawn();
        let health_handle = Arc::clone(&pool).start_health_task();

        info!(
            max_concurrency = config.max_concurrency,
            recovered, "Enrichment engine started"
        );
        if recovered > 0 {
            scheduler.wake();
        }

        Ok(Arc::new(Self {
            queue,
            pool,
            cache,
            memo,
            progress,
            events,
            scheduler,
            dispatch_handle: Mutex::new(Some(dispatch_handle)),
            health_handle: Mutex::new(Some(health_handle)),
        }))
    }

    /// Enqueue an enrichment job for a session.
    ///
    /// Fails with `QueueError::DuplicateActiveJob` while the session already
    /// has a non-terminal job.
    pub async fn enqueue(
        &self,
        session_id: &str,
        options: EnrichmentOptions,
        priority: Priority,
    ) -> Result<Uuid> {
        let job = self.queue.enqueue(session_id, options, priority).await?;
        self.events.emit(EngineEvent::Enqueued {
            job_id: job.id,
            session_id: session_id.to_string(),
            priority,
        });
        self.scheduler.wake();
        Ok(job.id)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.queue.get_job(job_id).await
    }

    /// The active (non-terminal) job for a session, if any.
    pub async fn get_job_for_session(&self, session_id: &str) -> Result<Option<Job>> {
        self.queue.get_job_for_session(session_id).await
    }

    pub async fn queue_status(&self) -> Result<QueueStatus> {
        self.queue.status().await
    }

    pub async fn count_by_status(&self, status: JobStatus) -> Result<usize> {
        let counts = self.queue.status().await?;
        Ok(counts.by_status.get(&status).copied().unwrap_or(0))
    }

    /// Cancel a pending job. Claimed jobs run to completion; cancelling
    /// them is a warned no-op. Returns whether the job was cancelled.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<bool> {
        let job = self.queue.get_job(job_id).await?;
        let cancelled = self.queue.cancel(job_id).await?;
        if cancelled {
            if let Some(job) = job {
                self.events.emit(EngineEvent::Cancelled {
                    job_id,
                    session_id: job.session_id,
                });
            }
        }
        Ok(cancelled)
    }

    /// Remove a job record (caller retention policy). Returns whether a
    /// record was removed.
    pub async fn delete_job(&self, job_id: Uuid) -> Result<bool> {
        self.queue.delete_job(job_id).await
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Subscribe to engine events as a `Stream`.
    pub fn event_stream(&self) -> BroadcastStream<EngineEvent> {
        self.events.stream()
    }

    pub async fn progress(&self, session_id: &str) -> Option<SessionProgress> {
        self.progress.get(session_id).await
    }

    pub async fn eta(&self, session_id: &str) -> Option<std::time::Duration> {
        self.progress.eta(session_id).await
    }

    pub async fn batch_progress(&self) -> BatchProgress {
        self.progress.batch_progress().await
    }

    /// Artifact cache counters (backend diagnostics).
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Memoizer counters (backend diagnostics).
    pub fn memo_stats(&self) -> MemoStats {
        self.memo.stats()
    }

    /// Drop cached artifacts whose key contains `pattern`.
    pub async fn invalidate_cache(&self, pattern: &str) -> Result<usize> {
        Ok(self.cache.invalidate(pattern).await?)
    }

    pub async fn pool_health(&self) -> PoolHealth {
        self.pool.health_check().await
    }

    /// Graceful shutdown: stop claiming, wait (bounded) for in-flight jobs,
    /// then release everything.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;

        if let Some(handle) = self.dispatch_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.health_handle.lock().await.take() {
            handle.abort();
        }
        info!("Enrichment engine stopped");
    }
}
