//! Worker pool — a fixed set of logical execution slots with health
//! accounting and auto-restart.
//!
//! Workers are bookkeeping identities, not OS threads: each claimed job runs
//! as its own tokio task while holding a lease on one slot. The pool bounds
//! concurrency, tracks per-worker health, and replaces workers that fail
//! too often.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, oneshot};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WorkerPoolConfig;
use crate::error::WorkerError;

/// Status of one worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Active,
    Error,
    Shutdown,
}

/// One logical worker slot.
#[derive(Debug, Clone)]
struct WorkerSlot {
    id: Uuid,
    status: WorkerStatus,
    current_job: Option<Uuid>,
    error_count: u32,
    total_completed: u64,
    total_processing_time: Duration,
    restart_count: u32,
    started_at: Instant,
}

impl WorkerSlot {
    fn new(restart_count: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: WorkerStatus::Idle,
            current_job: None,
            error_count: 0,
            total_completed: 0,
            total_processing_time: Duration::ZERO,
            restart_count,
            started_at: Instant::now(),
        }
    }
}

/// Read-only view of a worker slot for diagnostics.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub id: Uuid,
    pub status: WorkerStatus,
    pub current_job: Option<Uuid>,
    pub error_count: u32,
    pub total_completed: u64,
    pub total_processing_time: Duration,
    pub restart_count: u32,
}

/// A claim on one worker slot. Must be handed back via [`WorkerPool::release`].
#[derive(Debug)]
pub struct WorkerLease {
    pub worker_id: Uuid,
    pub job_id: Uuid,
    acquired_at: Instant,
}

/// Aggregate pool health computed by the periodic check.
#[derive(Debug, Clone)]
pub struct PoolHealth {
    /// Failed executions / total executions.
    pub error_rate: f64,
    pub avg_job_duration: Option<Duration>,
    /// Fraction of wall time no worker was down for restart.
    pub uptime_pct: f64,
    pub idle: usize,
    pub active: usize,
    pub errored: usize,
    pub total_completed: u64,
    pub total_errors: u64,
    pub restarts: u32,
}

struct PoolState {
    workers: HashMap<Uuid, WorkerSlot>,
    /// Callers waiting for a free worker, FIFO.
    waiters: VecDeque<(Uuid, oneshot::Sender<WorkerLease>)>,
    accepting: bool,
    downtime: Duration,
}

/// Fixed-size worker pool.
pub struct WorkerPool {
    state: Arc<Mutex<PoolState>>,
    config: WorkerPoolConfig,
    total_errors: AtomicU64,
    created_at: Instant,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let workers = (0..config.pool_size.max(1))
            .map(|_| {
                let slot = WorkerSlot::new(0);
                (slot.id, slot)
            })
            .collect();

        Self {
            state: Arc::new(Mutex::new(PoolState {
                workers,
                waiters: VecDeque::new(),
                accepting: true,
                downtime: Duration::ZERO,
            })),
            config,
            total_errors: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }

    /// Acquire a worker for a job.
    ///
    /// Resolves immediately when an idle worker exists; otherwise the caller
    /// queues FIFO and fails with [`WorkerError::AcquireTimeout`] if nothing
    /// frees up within the configured window.
    pub async fn acquire(&self, job_id: Uuid) -> Result<WorkerLease, WorkerError> {
        let rx = {
            let mut st = self.state.lock().await;
            if !st.accepting {
                return Err(WorkerError::PoolShutdown);
            }

            if let Some(slot) = st
                .workers
                .values_mut()
                .find(|w| w.status == WorkerStatus::Idle)
            {
                slot.status = WorkerStatus::Active;
                slot.current_job = Some(job_id);
                debug!(worker_id = %slot.id, job_id = %job_id, "Worker acquired");
                return Ok(WorkerLease {
                    worker_id: slot.id,
                    job_id,
                    acquired_at: Instant::now(),
                });
            }

            let (tx, rx) = oneshot::channel();
            st.waiters.push_back((job_id, tx));
            rx
        };

        match tokio::time::timeout(self.config.acquire_timeout, rx).await {
            Ok(Ok(lease)) => Ok(lease),
            Ok(Err(_)) => Err(WorkerError::PoolShutdown),
            Err(_) => Err(WorkerError::AcquireTimeout {
                waited: self.config.acquire_timeout,
            }),
        }
    }

    /// Return a worker after a job finished.
    ///
    /// `error` carries the failure description when the job failed. Crossing
    /// the error threshold flips the worker to error state and triggers an
    /// auto-restart with a fresh identity.
    pub async fn release(&self, lease: WorkerLease, error: Option<&str>) {
        let duration = lease.acquired_at.elapsed();
        let mut st = self.state.lock().await;

        let Some(slot) = st.workers.get_mut(&lease.worker_id) else {
            // The worker was force-cleared during shutdown.
            debug!(worker_id = %lease.worker_id, "Released lease for removed worker");
            return;
        };

        slot.current_job = None;
        slot.total_processing_time += duration;

        match error {
            None => {
                slot.total_completed += 1;
                slot.status = WorkerStatus::Idle;
                debug!(
                    worker_id = %lease.worker_id,
                    duration_ms = duration.as_millis() as u64,
                    "Worker released after success"
                );
                Self::serve_waiters(&mut st);
            }
            Some(message) => {
                slot.error_count += 1;
                self.total_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    worker_id = %lease.worker_id,
                    errors = slot.error_count,
                    error = %message,
                    "Worker released after failure"
                );

                if slot.error_count >= self.config.error_threshold {
                    slot.status = WorkerStatus::Error;
                    let restart_count = slot.restart_count;
                    let id = slot.id;
                    drop(st);
                    self.schedule_restart(id, restart_count).await;
                } else {
                    slot.status = WorkerStatus::Idle;
                    Self::serve_waiters(&mut st);
                }
            }
        }
    }

    /// Replace an errored worker with a fresh identity after a short,
    /// tracked downtime.
    async fn schedule_restart(&self, worker_id: Uuid, restart_count: u32) {
        let state = Arc::clone(&self.state);
        let delay = self.config.restart_delay;

        tokio::spawn(async move {
            sleep(delay).await;
            let mut st = state.lock().await;
            st.downtime += delay;
            if st.workers.remove(&worker_id).is_none() {
                return;
            }
            if !st.accepting {
                return;
            }
            let fresh = WorkerSlot::new(restart_count + 1);
            info!(
                old_worker = %worker_id,
                new_worker = %fresh.id,
                restarts = fresh.restart_count,
                "Worker restarted"
            );
            st.workers.insert(fresh.id, fresh);
            Self::serve_waiters(&mut st);
        });
    }

    /// Hand idle workers to queued acquirers, FIFO. Waiters that already
    /// timed out are skipped.
    fn serve_waiters(st: &mut PoolState) {
        loop {
            let Some(idle_id) = st
                .workers
                .values()
                .find(|w| w.status == WorkerStatus::Idle)
                .map(|w| w.id)
            else {
                break;
            };
            let Some((job_id, tx)) = st.waiters.pop_front() else {
                break;
            };

            if let Some(slot) = st.workers.get_mut(&idle_id) {
                slot.status = WorkerStatus::Active;
                slot.current_job = Some(job_id);
            }

            let lease = WorkerLease {
                worker_id: idle_id,
                job_id,
                acquired_at: Instant::now(),
            };
            if tx.send(lease).is_err() {
                // Waiter gave up; undo the claim and try the next one.
                if let Some(slot) = st.workers.get_mut(&idle_id) {
                    slot.status = WorkerStatus::Idle;
                    slot.current_job = None;
                }
            }
        }
    }

    /// Recompute aggregate health and proactively restart errored workers.
    pub async fn health_check(&self) -> PoolHealth {
        let errored_ids: Vec<(Uuid, u32)> = {
            let st = self.state.lock().await;
            st.workers
                .values()
                .filter(|w| w.status == WorkerStatus::Error)
                .map(|w| (w.id, w.restart_count))
                .collect()
        };
        for (id, restarts) in errored_ids {
            self.schedule_restart(id, restarts).await;
        }

        let st = self.state.lock().await;
        let total_completed: u64 = st.workers.values().map(|w| w.total_completed).sum();
        let total_errors = self.total_errors.load(Ordering::Relaxed);
        let total_runs = total_completed + total_errors;
        let busy_time: Duration = st.workers.values().map(|w| w.total_processing_time).sum();

        let elapsed = self.created_at.elapsed();
        let uptime_pct = if elapsed.is_zero() {
            1.0
        } else {
            1.0 - (st.downtime.as_secs_f64() / elapsed.as_secs_f64()).min(1.0)
        };

        PoolHealth {
            error_rate: if total_runs == 0 {
                0.0
            } else {
                total_errors as f64 / total_runs as f64
            },
            avg_job_duration: if total_runs == 0 {
                None
            } else {
                Some(busy_time / total_runs as u32)
            },
            uptime_pct,
            idle: st
                .workers
                .values()
                .filter(|w| w.status == WorkerStatus::Idle)
                .count(),
            active: st
                .workers
                .values()
                .filter(|w| w.status == WorkerStatus::Active)
                .count(),
            errored: st
                .workers
                .values()
                .filter(|w| w.status == WorkerStatus::Error)
                .count(),
            total_completed,
            total_errors,
            restarts: st.workers.values().map(|w| w.restart_count).sum(),
        }
    }

    /// Spawn the periodic health-check task.
    pub fn start_health_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.health_check_interval;
        let pool = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let health = pool.health_check().await;
                debug!(
                    error_rate = health.error_rate,
                    idle = health.idle,
                    active = health.active,
                    uptime_pct = health.uptime_pct,
                    "Worker pool health"
                );
            }
        })
    }

    /// Stop accepting acquisitions, wait (bounded) for active workers to
    /// drain, then force-clear the rest.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let mut st = self.state.lock().await;
            st.accepting = false;
            // Dropping the senders fails every queued acquire with PoolShutdown.
            st.waiters.clear();
        }

        let deadline = Instant::now() + grace;
        loop {
            {
                let st = self.state.lock().await;
                let active = st
                    .workers
                    .values()
                    .any(|w| w.status == WorkerStatus::Active);
                if !active {
                    break;
                }
            }
            if Instant::now() >= deadline {
                warn!("Worker pool drain exceeded grace period, force-clearing");
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }

        let mut st = self.state.lock().await;
        for slot in st.workers.values_mut() {
            slot.status = WorkerStatus::Shutdown;
            slot.current_job = None;
        }
        info!("Worker pool shut down");
    }

    pub async fn idle_count(&self) -> usize {
        self.state
            .lock()
            .await
            .workers
            .values()
            .filter(|w| w.status == WorkerStatus::Idle)
            .count()
    }

    pub async fn active_count(&self) -> usize {
        self.state
            .lock()
            .await
            .workers
            .values()
            .filter(|w| w.status == WorkerStatus::Active)
            .count()
    }

    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.state
            .lock()
            .await
            .workers
            .values()
            .map(|w| WorkerSnapshot {
                id: w.id,
                status: w.status,
                current_job: w.current_job,
                error_count: w.error_count,
                total_completed: w.total_completed,
                total_processing_time: w.total_processing_time,
                restart_count: w.restart_count,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pool_size: usize, acquire_ms: u64) -> WorkerPoolConfig {
        WorkerPoolConfig {
            pool_size,
            acquire_timeout: Duration::from_millis(acquire_ms),
            error_threshold: 2,
            health_check_interval: Duration::from_secs(60),
            restart_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn acquire_is_immediate_when_idle_worker_exists() {
        let pool = WorkerPool::new(config(1, 1000));
        let start = Instant::now();
        let lease = pool.acquire(Uuid::new_v4()).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
        pool.release(lease, None).await;
    }

    #[tokio::test]
    async fn acquire_times_out_when_no_worker_frees() {
        let pool = WorkerPool::new(config(1, 50));
        let _held = pool.acquire(Uuid::new_v4()).await.unwrap();

        let err = pool.acquire(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, WorkerError::AcquireTimeout { .. }));
    }

    #[tokio::test]
    async fn waiter_gets_worker_on_release() {
        let pool = Arc::new(WorkerPool::new(config(1, 1000)));
        let held = pool.acquire(Uuid::new_v4()).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Uuid::new_v4()).await })
        };
        // Give the waiter time to queue.
        sleep(Duration::from_millis(20)).await;
        pool.release(held, None).await;

        let lease = waiter.await.unwrap().unwrap();
        pool.release(lease, None).await;
    }

    #[tokio::test]
    async fn success_release_records_completion() {
        let pool = WorkerPool::new(config(1, 1000));
        let lease = pool.acquire(Uuid::new_v4()).await.unwrap();
        pool.release(lease, None).await;

        let snap = pool.snapshot().await;
        assert_eq!(snap[0].total_completed, 1);
        assert_eq!(snap[0].status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn error_threshold_triggers_restart_with_fresh_identity() {
        let pool = WorkerPool::new(config(1, 1000));
        let original_id = pool.snapshot().await[0].id;

        for _ in 0..2 {
            let lease = pool.acquire(Uuid::new_v4()).await.unwrap();
            pool.release(lease, Some("executor crashed")).await;
        }

        // Wait past the restart delay.
        sleep(Duration::from_millis(50)).await;
        let snap = pool.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert_ne!(snap[0].id, original_id);
        assert_eq!(snap[0].error_count, 0);
        assert_eq!(snap[0].restart_count, 1);
        assert_eq!(snap[0].status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn health_reports_error_rate_and_averages() {
        let pool = WorkerPool::new(config(2, 1000));

        let lease = pool.acquire(Uuid::new_v4()).await.unwrap();
        pool.release(lease, None).await;
        let lease = pool.acquire(Uuid::new_v4()).await.unwrap();
        pool.release(lease, Some("boom")).await;

        let health = pool.health_check().await;
        assert_eq!(health.total_completed, 1);
        assert_eq!(health.total_errors, 1);
        assert!((health.error_rate - 0.5).abs() < f64::EPSILON);
        assert!(health.avg_job_duration.is_some());
        assert!(health.uptime_pct > 0.0);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_acquisitions() {
        let pool = WorkerPool::new(config(2, 1000));
        pool.shutdown(Duration::from_millis(50)).await;

        let err = pool.acquire(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, WorkerError::PoolShutdown));
    }

    #[tokio::test]
    async fn shutdown_waits_for_active_then_force_clears() {
        let pool = Arc::new(WorkerPool::new(config(1, 1000)));
        let lease = pool.acquire(Uuid::new_v4()).await.unwrap();

        let releaser = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                sleep(Duration::from_millis(30)).await;
                pool.release(lease, None).await;
            })
        };

        pool.shutdown(Duration::from_millis(200)).await;
        releaser.await.unwrap();

        let snap = pool.snapshot().await;
        assert!(snap.iter().all(|w| w.status == WorkerStatus::Shutdown));
    }
}
