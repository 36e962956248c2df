//! Progress and ETA tracking.
//!
//! Keeps a per-session record of the current stage, overall progress, and
//! per-stage sub-status, and derives ETAs by blending elapsed-time
//! extrapolation with a rolling average of recent completed-job durations.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::session::{StageKind, StageStatus};

/// How many historical run durations feed the ETA average.
const HISTORY_LIMIT: usize = 50;

/// Progress record for one session's enrichment run.
#[derive(Debug, Clone, Serialize)]
pub struct SessionProgress {
    pub session_id: String,
    pub job_id: Uuid,
    /// Stage currently processing, if any.
    pub stage: Option<StageKind>,
    /// Overall progress, 0–100.
    pub progress: u8,
    /// Human-readable status line (cost-free).
    pub message: String,
    pub stages: BTreeMap<StageKind, StageStatus>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub terminal: bool,
    pub failed: bool,
}

/// Aggregate progress across all tracked sessions.
#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    /// Blended remaining time across active sessions, if estimable.
    pub eta: Option<Duration>,
    /// Human-readable summary (cost-free).
    pub summary: String,
}

/// Tracks per-session and batch progress.
pub struct ProgressTracker {
    sessions: RwLock<HashMap<String, SessionProgress>>,
    history: Mutex<VecDeque<f64>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Seed the duration history (e.g. from the durable store at startup).
    pub fn seed_history(&self, durations_secs: impl IntoIterator<Item = f64>) {
        let mut history = self.history.lock().expect("history mutex poisoned");
        for d in durations_secs {
            history.push_back(d);
            if history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }
    }

    /// Start tracking a session run. All stages begin pending.
    pub async fn begin(&self, session_id: &str, job_id: Uuid, stages: &[StageKind]) {
        let now = Utc::now();
        let record = SessionProgress {
            session_id: session_id.to_string(),
            job_id,
            stage: None,
            progress: 0,
            message: "Starting enrichment".to_string(),
            stages: stages.iter().map(|s| (*s, StageStatus::Pending)).collect(),
            started_at: now,
            updated_at: now,
            terminal: false,
            failed: false,
        };
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), record);
    }

    /// Update overall progress and message.
    pub async fn update(&self, session_id: &str, progress: u8, message: impl Into<String>) {
        let mut sessions = self.sessions.write().await;
        if let Some(record) = sessions.get_mut(session_id) {
            record.progress = progress.min(100);
            record.message = message.into();
            record.updated_at = Utc::now();
        }
    }

    /// Move to a new stage: the previous one is marked completed, the new
    /// one processing.
    pub async fn advance_stage(&self, session_id: &str, stage: StageKind) {
        let mut sessions = self.sessions.write().await;
        if let Some(record) = sessions.get_mut(session_id) {
            if let Some(previous) = record.stage.take() {
                if record.stages.get(&previous) == Some(&StageStatus::Processing) {
                    record.stages.insert(previous, StageStatus::Completed);
                }
            }
            record.stage = Some(stage);
            record.stages.insert(stage, StageStatus::Processing);
            record.updated_at = Utc::now();
            debug!(session_id = %session_id, stage = %stage, "Stage advanced");
        }
    }

    /// Override one stage's sub-status (failed, skipped).
    pub async fn mark_stage(&self, session_id: &str, stage: StageKind, status: StageStatus) {
        let mut sessions = self.sessions.write().await;
        if let Some(record) = sessions.get_mut(session_id) {
            record.stages.insert(stage, status);
            if record.stage == Some(stage) && status != StageStatus::Processing {
                record.stage = None;
            }
            record.updated_at = Utc::now();
        }
    }

    /// Mark a run complete and feed its duration into the rolling history.
    pub async fn complete(&self, session_id: &str, duration: Duration) {
        {
            let mut sessions = self.sessions.write().await;
            if let Some(record) = sessions.get_mut(session_id) {
                if let Some(current) = record.stage.take() {
                    if record.stages.get(&current) == Some(&StageStatus::Processing) {
                        record.stages.insert(current, StageStatus::Completed);
                    }
                }
                record.progress = 100;
                record.message = "Enrichment complete".to_string();
                record.terminal = true;
                record.updated_at = Utc::now();
            }
        }

        let mut history = self.history.lock().expect("history mutex poisoned");
        history.push_back(duration.as_secs_f64());
        if history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
    }

    /// Mark a run failed with a user-safe message.
    pub async fn fail(&self, session_id: &str, message: impl Into<String>) {
        let mut sessions = self.sessions.write().await;
        if let Some(record) = sessions.get_mut(session_id) {
            if let Some(current) = record.stage.take() {
                record.stages.insert(current, StageStatus::Failed);
            }
            record.message = message.into();
            record.terminal = true;
            record.failed = true;
            record.updated_at = Utc::now();
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionProgress> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Estimated time remaining for a session.
    ///
    /// Blends elapsed/progress extrapolation with the rolling average of
    /// recent run durations, weighted by how far along the run is. Returns
    /// `None` when there is no historical data, and zero once terminal.
    pub async fn eta(&self, session_id: &str) -> Option<Duration> {
        let sessions = self.sessions.read().await;
        let record = sessions.get(session_id)?;

        if record.terminal {
            return Some(Duration::ZERO);
        }

        let historical_avg = {
            let history = self.history.lock().expect("history mutex poisoned");
            if history.is_empty() {
                return None;
            }
            history.iter().sum::<f64>() / history.len() as f64
        };

        let fraction = (record.progress as f64 / 100.0).clamp(0.0, 1.0);
        let historical_remaining = historical_avg * (1.0 - fraction);

        // Early on, extrapolating from elapsed time is pure noise; lean on
        // history until the run has made real progress.
        let blended = if fraction >= 0.05 {
            let elapsed = (Utc::now() - record.started_at)
                .num_milliseconds()
                .max(0) as f64
                / 1000.0;
            let extrapolated = elapsed * (1.0 - fraction) / fraction;
            fraction * extrapolated + (1.0 - fraction) * historical_remaining
        } else {
            historical_remaining
        };

        Some(Duration::from_secs_f64(blended.max(0.0)))
    }

    /// Aggregate progress across all tracked sessions.
    pub async fn batch_progress(&self) -> BatchProgress {
        let sessions = self.sessions.read().await;

        let total = sessions.len();
        let completed = sessions
            .values()
            .filter(|s| s.terminal && !s.failed)
            .count();
        let failed = sessions.values().filter(|s| s.terminal && s.failed).count();
        let processing = sessions
            .values()
            .filter(|s| !s.terminal && s.progress > 0)
            .count();
        let pending = total - completed - failed - processing;

        drop(sessions);

        // Weighted blend of the active sessions' ETAs, weighting sessions
        // with more work left more heavily.
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        let active_ids: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| !s.terminal)
                .map(|s| s.session_id.clone())
                .collect()
        };
        for id in &active_ids {
            if let Some(eta) = self.eta(id).await {
                let progress = self
                    .sessions
                    .read()
                    .await
                    .get(id)
                    .map(|s| s.progress)
                    .unwrap_or(0);
                let weight = ((100 - progress.min(100)) as f64 / 100.0).max(0.01);
                weighted_sum += eta.as_secs_f64() * weight;
                weight_total += weight;
            }
        }
        let eta = if weight_total > 0.0 {
            Some(Duration::from_secs_f64(weighted_sum / weight_total))
        } else {
            None
        };

        let summary = if total == 0 {
            "No sessions queued for enrichment".to_string()
        } else if completed + failed == total {
            if failed == 0 {
                format!("All {total} sessions enriched")
            } else {
                format!("{completed} of {total} sessions enriched, {failed} couldn't finish")
            }
        } else {
            let mut parts = vec![format!("{completed} of {total} sessions enriched")];
            if processing > 0 {
                parts.push(format!("{processing} in progress"));
            }
            if pending > 0 {
                parts.push(format!("{pending} waiting"));
            }
            if failed > 0 {
                parts.push(format!("{failed} couldn't finish"));
            }
            parts.join(", ")
        };

        BatchProgress {
            total,
            pending,
            processing,
            completed,
            failed,
            eta,
            summary,
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}
