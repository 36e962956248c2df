//! Dispatch loop and per-job pipeline.
//!
//! A cooperative scheduler: enqueue and worker-release wake it via `Notify`,
//! with a periodic fallback tick. Each pass claims eligible pending jobs
//! (claim-then-persist) while worker slots are free and runs each claimed
//! job as its own task: delta detection, cache consultation, executor
//! invocation, retry/failure resolution, checkpoint advancement.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{ArtifactCache, MemoCache, generate_key};
use crate::config::EngineConfig;
use crate::error::ExecutorError;
use crate::events::{EngineEvent, EventBus};
use crate::executor::{EnrichmentExecutor, EnrichmentRequest, ProgressFn};
use crate::faults::{ErrorClassifier, ErrorContext, OperationClass, RecommendedAction};
use crate::incremental::{Delta, IncrementalProcessor};
use crate::progress::ProgressTracker;
use crate::session::{
    EnrichmentResult, SessionSource, StageKind, StageResult, StageStatus,
};
use crate::worker::{WorkerLease, WorkerPool};

use super::job::{Job, JobStatus};
use super::queue::JobQueue;

/// Shared dependencies for the scheduler.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub queue: Arc<JobQueue>,
    pub pool: Arc<WorkerPool>,
    pub cache: Arc<ArtifactCache>,
    pub memo: Arc<MemoCache>,
    pub incremental: Arc<IncrementalProcessor>,
    pub classifier: Arc<ErrorClassifier>,
    pub progress: Arc<ProgressTracker>,
    pub events: Arc<EventBus>,
    pub executor: Arc<dyn EnrichmentExecutor>,
    pub sessions: Arc<dyn SessionSource>,
}

/// Outcome of one execution attempt.
enum RunOutcome {
    Completed {
        result: EnrichmentResult,
        from_cache: bool,
    },
    Retry {
        delay: Duration,
        user_message: String,
    },
    Failed {
        user_message: String,
    },
}

/// The dispatch loop.
pub struct Scheduler {
    deps: SchedulerDeps,
    config: EngineConfig,
    wake: Notify,
    shutting_down: AtomicBool,
    active: AtomicUsize,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(deps: SchedulerDeps, config: EngineConfig) -> Self {
        Self {
            deps,
            config,
            wake: Notify::new(),
            shutting_down: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Wake the dispatch loop (called on enqueue and worker release).
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Spawn the dispatch loop task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!("Dispatch loop started");
            loop {
                if self.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                Arc::clone(&self).dispatch_pass().await;

                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(self.config.dispatch_interval) => {}
                }
            }
            debug!("Dispatch loop stopped");
        })
    }

    /// Fill free worker slots with claimed jobs.
    async fn dispatch_pass(self: Arc<Self>) {
        // Prune finished job tasks.
        self.in_flight.lock().await.retain(|h| !h.is_finished());

        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            if self.active.load(Ordering::SeqCst) >= self.config.max_concurrency {
                return;
            }

            let claimed = match self.deps.queue.claim_next(Utc::now()).await {
                Ok(Some(job)) => job,
                Ok(None) => return,
                Err(e) => {
                    error!(error = %e, "Claim failed, skipping dispatch pass");
                    return;
                }
            };

            let lease = match self.deps.pool.acquire(claimed.id).await {
                Ok(lease) => lease,
                Err(e) => {
                    warn!(job_id = %claimed.id, error = %e, "No worker available, unclaiming job");
                    let mut job = claimed;
                    if job.transition_to(JobStatus::Pending).is_ok() {
                        if let Err(e) = self.deps.queue.update(&job).await {
                            error!(job_id = %job.id, error = %e, "Failed to unclaim job");
                        }
                    }
                    return;
                }
            };

            self.active.fetch_add(1, Ordering::SeqCst);

            let scheduler = Arc::clone(&self);
            let handle = tokio::spawn(async move {
                scheduler.run_job(claimed, lease).await;
            });
            self.in_flight.lock().await.push(handle);
        }
    }

    /// Run one claimed job to a terminal state (or a scheduled retry).
    async fn run_job(self: Arc<Self>, mut job: Job, lease: WorkerLease) {
        let session_id = job.session_id.clone();
        let start = Instant::now();

        info!(job_id = %job.id, session_id = %session_id, attempt = job.attempts + 1, "Job started");
        self.deps.events.emit(EngineEvent::Started {
            job_id: job.id,
            session_id: session_id.clone(),
        });
        self.deps
            .progress
            .begin(&session_id, job.id, &job.options.effective_stages())
            .await;

        let outcome = self.execute(&mut job).await;

        match outcome {
            RunOutcome::Completed { result, from_cache } => {
                let partial = result.partial;
                let duration = start.elapsed();

                if let Err(e) = self.deps.queue.complete(&mut job, result).await {
                    error!(job_id = %job.id, error = %e, "Failed to persist completion");
                }

                self.deps.progress.complete(&session_id, duration).await;
                // Cache hits finish in microseconds; feeding them into the
                // duration history would wreck the ETA average.
                if !from_cache {
                    if let Err(e) = self
                        .deps
                        .queue
                        .store()
                        .record_job_duration(&session_id, duration.as_secs_f64(), Utc::now())
                        .await
                    {
                        warn!(error = %e, "Failed to record job duration");
                    }
                }

                info!(
                    job_id = %job.id,
                    session_id = %session_id,
                    duration_ms = duration.as_millis() as u64,
                    partial,
                    from_cache,
                    "Job completed"
                );
                self.deps.events.emit(EngineEvent::Completed {
                    job_id: job.id,
                    session_id: session_id.clone(),
                    duration_secs: duration.as_secs_f64(),
                    partial,
                    from_cache,
                });
                self.deps.pool.release(lease, None).await;
            }
            RunOutcome::Retry {
                delay,
                user_message,
            } => {
                let eligible_at = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                if let Err(e) = self.deps.queue.schedule_retry(&mut job, eligible_at).await {
                    error!(job_id = %job.id, error = %e, "Failed to schedule retry");
                }

                info!(
                    job_id = %job.id,
                    session_id = %session_id,
                    attempt = job.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Job scheduled for retry"
                );
                self.deps.events.emit(EngineEvent::Retry {
                    job_id: job.id,
                    session_id: session_id.clone(),
                    attempt: job.attempts,
                    delay_ms: delay.as_millis() as u64,
                    message: user_message.clone(),
                });
                self.deps.progress.update(&session_id, 0, user_message).await;
                self.deps.pool.release(lease, Some("retry scheduled")).await;
            }
            RunOutcome::Failed { user_message } => {
                if let Err(e) = self.deps.queue.fail(&mut job, &user_message).await {
                    error!(job_id = %job.id, error = %e, "Failed to persist failure");
                }

                warn!(job_id = %job.id, session_id = %session_id, "Job failed");
                self.deps.progress.fail(&session_id, user_message.clone()).await;
                self.deps.events.emit(EngineEvent::Failed {
                    job_id: job.id,
                    session_id: session_id.clone(),
                    message: user_message.clone(),
                });
                self.deps.pool.release(lease, Some(&user_message)).await;
            }
        }

        self.active.fetch_sub(1, Ordering::SeqCst);

        let batch = self.deps.progress.batch_progress().await;
        self.deps.events.emit(EngineEvent::BatchUpdate {
            summary: batch.summary,
            pending: batch.pending,
            processing: batch.processing,
            completed: batch.completed,
            failed: batch.failed,
        });

        self.wake.notify_one();
    }

    /// One execution attempt: snapshot, delta, cache, executor, resolution.
    async fn execute(&self, job: &mut Job) -> RunOutcome {
        let session_id = job.session_id.clone();

        let snapshot = match self.deps.sessions.load(&session_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Snapshot load failed");
                return RunOutcome::Failed {
                    user_message: "This session couldn't be loaded for enrichment.".to_string(),
                };
            }
        };

        let checkpoint = match self.deps.queue.store().get_checkpoint(&session_id).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Checkpoint read failed");
                return RunOutcome::Failed {
                    user_message: "Enrichment failed. Please try again later.".to_string(),
                };
            }
        };

        let mut delta = self
            .deps
            .incremental
            .detect_delta(&snapshot, checkpoint.as_ref());
        if job.options.force_full {
            delta = full_delta(&snapshot);
        }

        let savings = self.deps.incremental.estimate_savings(&snapshot, &delta);
        if savings.skipped_items > 0 {
            debug!(
                session_id = %session_id,
                skipped = savings.skipped_items,
                fraction = savings.fraction,
                "Incremental run"
            );
        }

        let cache_key = generate_key(&json!({
            "streams": snapshot.fingerprints(),
            "prompt": job.options.prompt,
            "model": job.options.model,
            "stages": job.options.effective_stages(),
            "executor": self.deps.executor.version(),
        }));

        match self.deps.cache.get(&cache_key).await {
            Ok(Some(value)) => {
                if let Ok(mut result) = serde_json::from_value::<EnrichmentResult>(value) {
                    debug!(session_id = %session_id, "Artifact cache hit, skipping executor");
                    result.from_cache = true;
                    result.completed_at = Utc::now();
                    self.persist_checkpoint(checkpoint, &snapshot, &delta, rust_decimal::Decimal::ZERO)
                        .await;
                    return RunOutcome::Completed {
                        result,
                        from_cache: true,
                    };
                }
            }
            Ok(None) => {}
            Err(e) => {
                // A broken cache must not block enrichment.
                warn!(error = %e, "Artifact cache read failed");
            }
        }

        let now = Utc::now();
        if self
            .deps
            .classifier
            .breakers()
            .is_open(OperationClass::Enrichment, now)
        {
            warn!(session_id = %session_id, "Circuit open, aborting without executor call");
            return RunOutcome::Failed {
                user_message:
                    "Enrichment is paused while the service recovers. It will resume automatically."
                        .to_string(),
            };
        }

        let request = EnrichmentRequest {
            snapshot: snapshot.clone(),
            delta: delta.clone(),
            options: job.options.clone(),
            memo: Arc::clone(&self.deps.memo),
            progress: self.progress_callback(job),
        };

        match self.deps.executor.enrich(request).await {
            Ok(output) => {
                self.deps.classifier.record_success(OperationClass::Enrichment);
                let now = Utc::now();
                for (stage, result) in &output.stage_results {
                    match result.status {
                        StageStatus::Completed => self
                            .deps
                            .classifier
                            .record_success(OperationClass::Stage(*stage)),
                        StageStatus::Failed => self
                            .deps
                            .classifier
                            .breakers()
                            .record_failure(OperationClass::Stage(*stage), now),
                        _ => {}
                    }
                }

                let partial = output.has_failed_stage();
                let result = EnrichmentResult {
                    stage_results: output.stage_results,
                    partial,
                    completed_at: now,
                    from_cache: false,
                };

                // Partial output would poison the cache for future hits.
                if !partial {
                    match serde_json::to_value(&result) {
                        Ok(value) => {
                            if let Err(e) = self.deps.cache.set(&cache_key, value).await {
                                warn!(error = %e, "Artifact cache write failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "Result serialization for cache failed"),
                    }
                }

                self.persist_checkpoint(checkpoint, &snapshot, &delta, output.cost)
                    .await;

                RunOutcome::Completed {
                    result,
                    from_cache: false,
                }
            }
            Err(err) => self.resolve_failure(job, err),
        }
    }

    /// Translate an executor failure into the next scheduling step.
    fn resolve_failure(&self, job: &Job, err: ExecutorError) -> RunOutcome {
        let class = match &err {
            ExecutorError::StageFailed { stage, .. } => OperationClass::Stage(*stage),
            _ => OperationClass::Enrichment,
        };
        let resolution = self.deps.classifier.handle_error(
            &err,
            &ErrorContext {
                class,
                attempt: job.attempts + 1,
                max_attempts: job.max_attempts,
                now: Utc::now(),
            },
        );

        match resolution.recommended_action {
            RecommendedAction::Retry => RunOutcome::Retry {
                delay: resolution
                    .retry_delay
                    .unwrap_or(self.config.retry.base_delay),
                user_message: resolution.user_message,
            },
            RecommendedAction::ContinuePartial => {
                // The run degrades: the failing stage is flagged, the rest
                // are recorded as skipped, and the job completes overall.
                let failed_stage = match &err {
                    ExecutorError::StageFailed { stage, .. } => Some(*stage),
                    _ => None,
                };
                let stage_results = job
                    .options
                    .effective_stages()
                    .into_iter()
                    .map(|stage| {
                        let result = if Some(stage) == failed_stage {
                            StageResult {
                                stage,
                                status: StageStatus::Failed,
                                artifact: None,
                                error: Some(resolution.user_message.clone()),
                            }
                        } else {
                            StageResult {
                                stage,
                                status: StageStatus::Skipped,
                                artifact: None,
                                error: None,
                            }
                        };
                        (stage, result)
                    })
                    .collect();

                RunOutcome::Completed {
                    result: EnrichmentResult {
                        stage_results,
                        partial: true,
                        completed_at: Utc::now(),
                        from_cache: false,
                    },
                    from_cache: false,
                }
            }
            RecommendedAction::Abort | RecommendedAction::Skip => RunOutcome::Failed {
                user_message: resolution.user_message,
            },
        }
    }

    /// Advance and persist the session checkpoint after a successful run.
    async fn persist_checkpoint(
        &self,
        current: Option<crate::incremental::Checkpoint>,
        snapshot: &crate::session::SessionSnapshot,
        delta: &Delta,
        cost: rust_decimal::Decimal,
    ) {
        let full_reset = delta.requires_full_regeneration;
        match self.deps.incremental.advance_checkpoint(
            current,
            snapshot,
            cost,
            delta.total_new_items as u64,
            full_reset,
        ) {
            Ok(checkpoint) => {
                if let Err(e) = self.deps.queue.store().put_checkpoint(&checkpoint).await {
                    error!(session_id = %snapshot.session_id, error = %e, "Checkpoint write failed");
                }
            }
            Err(e) => {
                error!(session_id = %snapshot.session_id, error = %e, "Checkpoint advance rejected");
            }
        }
    }

    /// Build the executor's progress callback: emits progress/stage events
    /// and updates the tracker without blocking the executor.
    fn progress_callback(&self, job: &Job) -> ProgressFn {
        let events = Arc::clone(&self.deps.events);
        let progress = Arc::clone(&self.deps.progress);
        let job_id = job.id;
        let session_id = job.session_id.clone();
        let last_stage: std::sync::Mutex<Option<StageKind>> = std::sync::Mutex::new(None);

        Arc::new(move |stage, percent, message| {
            let stage_changed = {
                let mut last = last_stage.lock().expect("stage mutex poisoned");
                if *last != Some(stage) {
                    *last = Some(stage);
                    true
                } else {
                    false
                }
            };

            if stage_changed {
                events.emit(EngineEvent::Stage {
                    job_id,
                    session_id: session_id.clone(),
                    stage,
                });
            }
            events.emit(EngineEvent::Progress {
                job_id,
                session_id: session_id.clone(),
                progress: percent.min(100),
                message: message.to_string(),
            });

            // Tracker updates are fire-and-forget; event emission above is
            // already synchronous and ordered.
            let progress = Arc::clone(&progress);
            let session_id = session_id.clone();
            let message = message.to_string();
            tokio::spawn(async move {
                if stage_changed {
                    progress.advance_stage(&session_id, stage).await;
                }
                progress.update(&session_id, percent.min(100), message).await;
            });
        })
    }

    /// Stop claiming, wait (bounded) for in-flight jobs, shut the pool down.
    pub async fn shutdown(&self) {
        info!("Scheduler shutting down");
        self.shutting_down.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();

        let handles: Vec<JoinHandle<()>> = self.in_flight.lock().await.drain(..).collect();
        if !handles.is_empty() {
            let drained =
                tokio::time::timeout(self.config.shutdown_grace, join_all(handles)).await;
            if drained.is_err() {
                warn!("In-flight jobs exceeded shutdown grace period");
            }
        }

        self.deps.pool.shutdown(self.config.shutdown_grace).await;
        info!("Scheduler shut down");
    }
}

/// A delta covering every item in the snapshot (forced full regeneration).
fn full_delta(snapshot: &crate::session::SessionSnapshot) -> Delta {
    let streams: std::collections::BTreeMap<_, _> = snapshot
        .streams
        .iter()
        .map(|(k, s)| (*k, s.items.clone()))
        .collect();
    let total_new_items = streams.values().map(Vec::len).sum();
    Delta {
        streams,
        requires_full_regeneration: true,
        reasons: Vec::new(),
        total_new_items,
        total_items: snapshot.total_items(),
    }
}
