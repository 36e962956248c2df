//! End-to-end engine tests with scripted mock collaborators.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal_macros::dec;
use tokio::sync::{Mutex, Semaphore};

use session_enrich::config::{EngineConfig, RetryConfig, WorkerPoolConfig};
use session_enrich::engine::EnrichmentEngine;
use session_enrich::error::{ExecutorError, StoreError};
use session_enrich::events::EngineEvent;
use session_enrich::executor::{EnrichmentExecutor, EnrichmentOutput, EnrichmentRequest};
use session_enrich::jobs::{JobStatus, Priority};
use session_enrich::session::{
    EnrichmentOptions, SessionSnapshot, SessionSource, StageResult, StageStatus, StreamItem,
    StreamKind, StreamState,
};
use session_enrich::store::{EnrichmentStore, LibSqlStore};

// ── Mock collaborators ──────────────────────────────────────────────

/// In-memory session source.
struct MemorySessions {
    sessions: Mutex<HashMap<String, SessionSnapshot>>,
}

impl MemorySessions {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
        })
    }

    async fn insert(&self, snapshot: SessionSnapshot) {
        self.sessions
            .lock()
            .await
            .insert(snapshot.session_id.clone(), snapshot);
    }
}

#[async_trait]
impl SessionSource for MemorySessions {
    async fn load(&self, session_id: &str) -> Result<SessionSnapshot, StoreError> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "session".to_string(),
                id: session_id.to_string(),
            })
    }
}

/// Executor that pops scripted failures, then succeeds. Optionally gated on
/// a semaphore so tests can hold jobs in flight.
struct ScriptedExecutor {
    calls: AtomicU32,
    failures: Mutex<VecDeque<ExecutorError>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedExecutor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            failures: Mutex::new(VecDeque::new()),
            gate: None,
        })
    }

    fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            failures: Mutex::new(VecDeque::new()),
            gate: Some(gate),
        })
    }

    async fn script_failures(&self, failures: impl IntoIterator<Item = ExecutorError>) {
        self.failures.lock().await.extend(failures);
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnrichmentExecutor for ScriptedExecutor {
    fn version(&self) -> &str {
        "exec-test-1"
    }

    async fn enrich(&self, request: EnrichmentRequest) -> Result<EnrichmentOutput, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.map_err(|_| {
                ExecutorError::Other("gate closed".to_string())
            })?;
            permit.forget();
        }

        if let Some(failure) = self.failures.lock().await.pop_front() {
            return Err(failure);
        }

        let stages = request.options.effective_stages();
        let total = stages.len().max(1);
        let mut stage_results = BTreeMap::new();
        for (i, stage) in stages.iter().enumerate() {
            let percent = (((i + 1) * 100) / total) as u8;
            (request.progress)(*stage, percent, &format!("Running {stage}"));

            // Memoize per-item work so repeated runs are cheap.
            for item in request.delta.new_items(StreamKind::Screenshots) {
                let memo_key = format!("{stage}:{}", item.id);
                request
                    .memo
                    .get_or_insert_with(&memo_key, || serde_json::json!({"analyzed": item.id}));
            }

            stage_results.insert(
                *stage,
                StageResult {
                    stage: *stage,
                    status: StageStatus::Completed,
                    artifact: Some(serde_json::json!({"stage": stage.as_str(), "ok": true})),
                    error: None,
                },
            );
        }

        Ok(EnrichmentOutput {
            stage_results,
            cost: dec!(0.05),
            duration: Duration::from_millis(5),
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn snapshot(session_id: &str, item_count: usize) -> SessionSnapshot {
    let items: Vec<StreamItem> = (0..item_count)
        .map(|i| StreamItem {
            id: format!("{session_id}-shot-{i}"),
            index: i,
            timestamp_secs: i as f64 * 10.0,
            payload: serde_json::Value::Null,
        })
        .collect();
    let mut streams = BTreeMap::new();
    streams.insert(StreamKind::Screenshots, StreamState::new(items));
    SessionSnapshot {
        session_id: session_id.to_string(),
        name: format!("Session {session_id}"),
        recorded_at: Utc::now(),
        duration_secs: item_count as f64 * 10.0,
        streams,
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        max_concurrency: 2,
        dispatch_interval: Duration::from_millis(25),
        max_attempts: 3,
        shutdown_grace: Duration::from_secs(5),
        retry: RetryConfig {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            rate_limit_multiplier: 3.0,
            jitter: 0.2,
        },
        worker: WorkerPoolConfig {
            pool_size: 2,
            acquire_timeout: Duration::from_secs(2),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn wait_for_event(
    rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>,
    mut pred: impl FnMut(&EngineEvent) -> bool,
) -> EngineEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn enqueue_runs_to_completion_and_checkpoints() -> Result<()> {
    let store: Arc<dyn EnrichmentStore> = Arc::new(LibSqlStore::new_memory().await?);
    let sessions = MemorySessions::new();
    sessions.insert(snapshot("sess_1", 4)).await;
    let executor = ScriptedExecutor::new();

    let engine = EnrichmentEngine::start(
        fast_config(),
        Arc::clone(&store),
        sessions,
        executor.clone(),
    )
    .await?;
    let mut rx = engine.subscribe();

    let job_id = engine
        .enqueue("sess_1", EnrichmentOptions::default(), Priority::Normal)
        .await?;

    let event = wait_for_event(&mut rx, |e| matches!(e, EngineEvent::Completed { .. })).await;
    match event {
        EngineEvent::Completed {
            partial, from_cache, ..
        } => {
            assert!(!partial);
            assert!(!from_cache);
        }
        _ => unreachable!(),
    }

    let job = engine.get_job(job_id).await?.expect("job exists");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    let result = job.result.expect("result recorded");
    assert_eq!(result.stage_results.len(), 4);

    // Checkpoint advanced to cover the whole stream; cost stays backend-only.
    let checkpoint = store.get_checkpoint("sess_1").await?.expect("checkpoint");
    assert_eq!(
        checkpoint.streams[&StreamKind::Screenshots].last_processed_index,
        Some(3)
    );
    assert_eq!(checkpoint.cumulative_cost, dec!(0.05));
    assert_eq!(executor.call_count(), 1);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn second_active_enqueue_for_same_session_is_rejected() -> Result<()> {
    let store: Arc<dyn EnrichmentStore> = Arc::new(LibSqlStore::new_memory().await?);
    let sessions = MemorySessions::new();
    sessions.insert(snapshot("sess_1", 2)).await;

    // Gate with no permits: the first job stays in flight.
    let gate = Arc::new(Semaphore::new(0));
    let executor = ScriptedExecutor::gated(Arc::clone(&gate));

    let engine =
        EnrichmentEngine::start(fast_config(), store, sessions, executor.clone()).await?;

    engine
        .enqueue("sess_1", EnrichmentOptions::default(), Priority::Normal)
        .await?;
    let err = engine
        .enqueue("sess_1", EnrichmentOptions::default(), Priority::High)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already has an active enrichment job"));

    gate.add_permits(8);
    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn high_priority_claims_next_free_slot() -> Result<()> {
    let store: Arc<dyn EnrichmentStore> = Arc::new(LibSqlStore::new_memory().await?);
    let sessions = MemorySessions::new();
    for id in ["sess_a", "sess_b", "sess_c", "sess_d"] {
        sessions.insert(snapshot(id, 2)).await;
    }

    let gate = Arc::new(Semaphore::new(0));
    let executor = ScriptedExecutor::gated(Arc::clone(&gate));
    let engine = EnrichmentEngine::start(
        fast_config(),
        store,
        sessions,
        executor.clone(),
    )
    .await?;
    let mut rx = engine.subscribe();

    // Two normal jobs occupy both slots.
    engine
        .enqueue("sess_a", EnrichmentOptions::default(), Priority::Normal)
        .await?;
    engine
        .enqueue("sess_b", EnrichmentOptions::default(), Priority::Normal)
        .await?;
    wait_for_event(&mut rx, |e| {
        matches!(e, EngineEvent::Started { session_id, .. } if session_id == "sess_a")
    })
    .await;
    wait_for_event(&mut rx, |e| {
        matches!(e, EngineEvent::Started { session_id, .. } if session_id == "sess_b")
    })
    .await;

    // A normal job is queued first, then a high-priority one.
    engine
        .enqueue("sess_c", EnrichmentOptions::default(), Priority::Normal)
        .await?;
    engine
        .enqueue("sess_d", EnrichmentOptions::default(), Priority::High)
        .await?;

    // Free one slot: the high-priority job must start before the normal one.
    gate.add_permits(1);
    let started = wait_for_event(&mut rx, |e| matches!(e, EngineEvent::Started { .. })).await;
    match started {
        EngineEvent::Started { session_id, .. } => assert_eq!(session_id, "sess_d"),
        _ => unreachable!(),
    }

    gate.add_permits(16);
    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn rate_limited_attempts_retry_then_succeed() -> Result<()> {
    let store: Arc<dyn EnrichmentStore> = Arc::new(LibSqlStore::new_memory().await?);
    let sessions = MemorySessions::new();
    sessions.insert(snapshot("sess_1", 2)).await;

    let executor = ScriptedExecutor::new();
    executor
        .script_failures([
            ExecutorError::RateLimited { retry_after: None },
            ExecutorError::RateLimited { retry_after: None },
        ])
        .await;

    let engine = EnrichmentEngine::start(
        fast_config(),
        store,
        sessions,
        executor.clone(),
    )
    .await?;
    let mut rx = engine.subscribe();

    let job_id = engine
        .enqueue("sess_1", EnrichmentOptions::default(), Priority::Normal)
        .await?;

    let mut retry_delays = Vec::new();
    loop {
        let event = wait_for_event(&mut rx, |e| {
            matches!(e, EngineEvent::Retry { .. } | EngineEvent::Completed { .. })
        })
        .await;
        match event {
            EngineEvent::Retry {
                attempt,
                delay_ms,
                message,
                ..
            } => {
                assert_eq!(attempt, retry_delays.len() as u32 + 1);
                assert!(!message.contains('$'));
                retry_delays.push(delay_ms);
            }
            EngineEvent::Completed { .. } => break,
            _ => unreachable!(),
        }
    }

    assert_eq!(retry_delays.len(), 2);
    // Jittered, but the second delay (rate-limit backoff) strictly exceeds
    // the first: 50ms*3^0 vs 50ms*3^1, ±20%.
    assert!(retry_delays[1] > retry_delays[0]);

    let job = engine.get_job(job_id).await?.expect("job exists");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);
    assert_eq!(executor.call_count(), 3);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn identical_inputs_resolve_from_cache_without_executor() -> Result<()> {
    let store: Arc<dyn EnrichmentStore> = Arc::new(LibSqlStore::new_memory().await?);
    let sessions = MemorySessions::new();
    sessions.insert(snapshot("sess_1", 3)).await;
    let executor = ScriptedExecutor::new();

    let engine = EnrichmentEngine::start(
        fast_config(),
        Arc::clone(&store),
        sessions,
        executor.clone(),
    )
    .await?;
    let mut rx = engine.subscribe();

    engine
        .enqueue("sess_1", EnrichmentOptions::default(), Priority::Normal)
        .await?;
    wait_for_event(&mut rx, |e| matches!(e, EngineEvent::Completed { .. })).await;
    assert_eq!(executor.call_count(), 1);

    // Same session, unchanged content: the artifact cache answers.
    engine
        .enqueue("sess_1", EnrichmentOptions::default(), Priority::Normal)
        .await?;
    let event = wait_for_event(&mut rx, |e| matches!(e, EngineEvent::Completed { .. })).await;
    match event {
        EngineEvent::Completed { from_cache, .. } => assert!(from_cache),
        _ => unreachable!(),
    }

    assert_eq!(executor.call_count(), 1);
    let stats = engine.cache_stats();
    assert!(stats.l1_hits + stats.l2_hits >= 1);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn permanent_failure_fails_fast_with_cost_free_message() -> Result<()> {
    let store: Arc<dyn EnrichmentStore> = Arc::new(LibSqlStore::new_memory().await?);
    let sessions = MemorySessions::new();
    sessions.insert(snapshot("sess_1", 2)).await;

    let executor = ScriptedExecutor::new();
    executor
        .script_failures([ExecutorError::AuthFailed])
        .await;

    let engine = EnrichmentEngine::start(
        fast_config(),
        store,
        sessions,
        executor.clone(),
    )
    .await?;
    let mut rx = engine.subscribe();

    let job_id = engine
        .enqueue("sess_1", EnrichmentOptions::default(), Priority::Normal)
        .await?;

    let event = wait_for_event(&mut rx, |e| matches!(e, EngineEvent::Failed { .. })).await;
    match event {
        EngineEvent::Failed { message, .. } => {
            assert!(!message.contains('$'));
            assert!(!message.to_lowercase().contains("token"));
        }
        _ => unreachable!(),
    }

    let job = engine.get_job(job_id).await?.expect("job exists");
    assert_eq!(job.status, JobStatus::Failed);
    // No retries for permanent failures.
    assert_eq!(executor.call_count(), 1);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn stage_failure_completes_with_partial_result() -> Result<()> {
    let store: Arc<dyn EnrichmentStore> = Arc::new(LibSqlStore::new_memory().await?);
    let sessions = MemorySessions::new();
    sessions.insert(snapshot("sess_1", 2)).await;

    let executor = ScriptedExecutor::new();
    executor
        .script_failures([ExecutorError::StageFailed {
            stage: session_enrich::session::StageKind::Chapters,
            reason: "layout model rejected input".to_string(),
        }])
        .await;

    let engine = EnrichmentEngine::start(
        fast_config(),
        store,
        sessions,
        executor.clone(),
    )
    .await?;
    let mut rx = engine.subscribe();

    let job_id = engine
        .enqueue("sess_1", EnrichmentOptions::default(), Priority::Normal)
        .await?;

    let event = wait_for_event(&mut rx, |e| matches!(e, EngineEvent::Completed { .. })).await;
    match event {
        EngineEvent::Completed { partial, .. } => assert!(partial),
        _ => unreachable!(),
    }

    let job = engine.get_job(job_id).await?.expect("job exists");
    assert_eq!(job.status, JobStatus::Completed);
    let result = job.result.expect("result recorded");
    assert!(result.partial);
    assert_eq!(
        result.stage_results[&session_enrich::session::StageKind::Chapters].status,
        StageStatus::Failed
    );

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn pending_job_can_be_cancelled_claimed_cannot() -> Result<()> {
    let store: Arc<dyn EnrichmentStore> = Arc::new(LibSqlStore::new_memory().await?);
    let sessions = MemorySessions::new();
    sessions.insert(snapshot("sess_a", 2)).await;
    sessions.insert(snapshot("sess_b", 2)).await;

    let gate = Arc::new(Semaphore::new(0));
    let executor = ScriptedExecutor::gated(Arc::clone(&gate));
    let mut config = fast_config();
    config.max_concurrency = 1;
    config.worker.pool_size = 1;

    let engine = EnrichmentEngine::start(config, store, sessions, executor.clone()).await?;
    let mut rx = engine.subscribe();

    let job_a = engine
        .enqueue("sess_a", EnrichmentOptions::default(), Priority::Normal)
        .await?;
    wait_for_event(&mut rx, |e| matches!(e, EngineEvent::Started { .. })).await;

    let job_b = engine
        .enqueue("sess_b", EnrichmentOptions::default(), Priority::Normal)
        .await?;

    // The claimed job runs to completion; the queued one cancels.
    assert!(!engine.cancel_job(job_a).await?);
    assert!(engine.cancel_job(job_b).await?);

    let job = engine.get_job(job_b).await?.expect("job exists");
    assert_eq!(job.status, JobStatus::Cancelled);

    gate.add_permits(8);
    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn interrupted_jobs_recover_and_complete_on_restart() -> Result<()> {
    let store: Arc<dyn EnrichmentStore> = Arc::new(LibSqlStore::new_memory().await?);

    // Simulate a crash: a job is left in `processing` by a previous run.
    let mut job = session_enrich::jobs::Job::new(
        "sess_1",
        EnrichmentOptions::default(),
        Priority::Normal,
        3,
    );
    job.transition_to(JobStatus::Processing).unwrap();
    store.put_job(&job).await?;

    let sessions = MemorySessions::new();
    sessions.insert(snapshot("sess_1", 2)).await;
    let executor = ScriptedExecutor::new();

    let engine = EnrichmentEngine::start(
        fast_config(),
        Arc::clone(&store),
        sessions,
        executor.clone(),
    )
    .await?;
    let mut rx = engine.subscribe();

    wait_for_event(&mut rx, |e| matches!(e, EngineEvent::Completed { .. })).await;

    let recovered = engine.get_job(job.id).await?.expect("job exists");
    assert_eq!(recovered.status, JobStatus::Completed);
    // The crash consumed no attempt.
    assert_eq!(recovered.attempts, 0);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn queue_status_and_batch_updates_are_cost_free() -> Result<()> {
    let store: Arc<dyn EnrichmentStore> = Arc::new(LibSqlStore::new_memory().await?);
    let sessions = MemorySessions::new();
    sessions.insert(snapshot("sess_1", 2)).await;
    let executor = ScriptedExecutor::new();

    let engine = EnrichmentEngine::start(
        fast_config(),
        store,
        sessions,
        executor.clone(),
    )
    .await?;
    let mut rx = engine.subscribe();

    engine
        .enqueue("sess_1", EnrichmentOptions::default(), Priority::High)
        .await?;

    let event = wait_for_event(&mut rx, |e| matches!(e, EngineEvent::BatchUpdate { .. })).await;
    match event {
        EngineEvent::BatchUpdate { summary, .. } => {
            assert!(!summary.contains('$'));
            assert!(!summary.to_lowercase().contains("cost"));
        }
        _ => unreachable!(),
    }

    let status = engine.queue_status().await?;
    assert_eq!(status.total, 1);
    assert_eq!(engine.count_by_status(JobStatus::Completed).await?, 1);

    // The executor exercised the memoizer.
    assert!(engine.memo_stats().entries > 0);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn grown_session_reprocesses_only_the_delta() -> Result<()> {
    let store: Arc<dyn EnrichmentStore> = Arc::new(LibSqlStore::new_memory().await?);
    let sessions = MemorySessions::new();
    sessions.insert(snapshot("sess_1", 2)).await;
    let executor = ScriptedExecutor::new();

    let engine = EnrichmentEngine::start(
        fast_config(),
        Arc::clone(&store),
        Arc::clone(&sessions) as Arc<dyn SessionSource>,
        executor.clone(),
    )
    .await?;
    let mut rx = engine.subscribe();

    engine
        .enqueue("sess_1", EnrichmentOptions::default(), Priority::Normal)
        .await?;
    wait_for_event(&mut rx, |e| matches!(e, EngineEvent::Completed { .. })).await;

    // The session grows by two screenshots; content hash changes, so the
    // cache misses and the executor runs again — but the checkpoint only
    // advances over the new items.
    sessions.insert(snapshot("sess_1", 4)).await;
    engine
        .enqueue("sess_1", EnrichmentOptions::default(), Priority::Normal)
        .await?;
    let event = wait_for_event(&mut rx, |e| matches!(e, EngineEvent::Completed { .. })).await;
    match event {
        EngineEvent::Completed { from_cache, .. } => assert!(!from_cache),
        _ => unreachable!(),
    }

    assert_eq!(executor.call_count(), 2);
    let checkpoint = store.get_checkpoint("sess_1").await?.expect("checkpoint");
    assert_eq!(
        checkpoint.streams[&StreamKind::Screenshots].last_processed_index,
        Some(3)
    );
    // Two runs, two new-item batches: 2 + 2.
    assert_eq!(checkpoint.items_processed, 4);
    assert_eq!(checkpoint.cumulative_cost, dec!(0.10));

    engine.shutdown().await;
    Ok(())
}
