//! Job records and the job state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;
use crate::session::{EnrichmentOptions, EnrichmentResult, StageKind};

/// Status of an enrichment job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed by the dispatcher.
    Pending,
    /// Claimed and running on a worker.
    Processing,
    /// Finished successfully (possibly with a partial result).
    Completed,
    /// Failed and out of retries.
    Failed,
    /// Cancelled before it was claimed.
    Cancelled,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Processing) | (Pending, Cancelled) |
            // From Processing: terminal outcomes, plus back to Pending for
            // scheduled retries and crash recovery
            (Processing, Completed) | (Processing, Failed) | (Processing, Pending)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the job is active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dispatch priority. Three tiers, FIFO within a tier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Sort rank persisted in the store; lower dispatches first.
    pub fn rank(&self) -> i64 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Priority {
        match rank {
            0 => Self::High,
            2 => Self::Low,
            _ => Self::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of enrichment work, tied to a single session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub session_id: String,
    pub status: JobStatus,
    pub priority: Priority,
    /// Overall progress, 0–100.
    pub progress: u8,
    /// Stage currently running, if any.
    pub stage: Option<StageKind>,
    pub options: EnrichmentOptions,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Execution attempts that have failed so far.
    pub attempts: u32,
    /// Total execution attempts allowed.
    pub max_attempts: u32,
    /// A pending job is not claimable before this instant (retry backoff).
    pub eligible_at: Option<DateTime<Utc>>,
    /// User-safe failure message for failed jobs.
    pub error: Option<String>,
    pub result: Option<EnrichmentResult>,
}

impl Job {
    pub fn new(
        session_id: impl Into<String>,
        options: EnrichmentOptions,
        priority: Priority,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            status: JobStatus::Pending,
            priority,
            progress: 0,
            stage: None,
            options,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            eligible_at: None,
            error: None,
            result: None,
        }
    }

    /// Transition to a new status, updating timestamps.
    pub fn transition_to(&mut self, target: JobStatus) -> Result<(), QueueError> {
        if !self.status.can_transition_to(target) {
            return Err(QueueError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }

        self.status = target;
        match target {
            JobStatus::Processing if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        Ok(())
    }

    /// Re-queue for a retry: back to pending, not claimable before
    /// `eligible_at`, with the failed attempt counted.
    pub fn schedule_retry(
        &mut self,
        eligible_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.transition_to(JobStatus::Pending)?;
        self.attempts += 1;
        self.eligible_at = Some(eligible_at);
        self.progress = 0;
        self.stage = None;
        Ok(())
    }

    /// Crash recovery: back to pending with attempts untouched.
    pub fn reset_after_crash(&mut self) -> Result<(), QueueError> {
        self.transition_to(JobStatus::Pending)?;
        self.eligible_at = None;
        self.progress = 0;
        self.stage = None;
        Ok(())
    }

    /// Whether the dispatcher may claim this job right now.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self.eligible_at.map(|at| at <= now).unwrap_or(true)
    }

    /// Duration from first start to completion, if both are known.
    pub fn run_duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end.signed_duration_since(start)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn job() -> Job {
        Job::new("sess_1", EnrichmentOptions::default(), Priority::Normal, 3)
    }

    #[test]
    fn status_transitions_valid() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn status_transitions_invalid() {
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Pending.is_active());
        assert!(JobStatus::Processing.is_active());
    }

    #[test]
    fn transition_updates_timestamps() {
        let mut j = job();
        j.transition_to(JobStatus::Processing).unwrap();
        assert!(j.started_at.is_some());
        assert!(j.completed_at.is_none());

        j.transition_to(JobStatus::Completed).unwrap();
        assert!(j.completed_at.is_some());
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut j = job();
        j.transition_to(JobStatus::Processing).unwrap();
        j.transition_to(JobStatus::Completed).unwrap();
        assert!(j.transition_to(JobStatus::Processing).is_err());
    }

    #[test]
    fn schedule_retry_counts_attempt_and_defers() {
        let mut j = job();
        j.transition_to(JobStatus::Processing).unwrap();

        let eligible = Utc::now() + ChronoDuration::seconds(30);
        j.schedule_retry(eligible).unwrap();

        assert_eq!(j.status, JobStatus::Pending);
        assert_eq!(j.attempts, 1);
        assert!(!j.is_claimable(Utc::now()));
        assert!(j.is_claimable(eligible + ChronoDuration::seconds(1)));
    }

    #[test]
    fn crash_reset_leaves_attempts_unchanged() {
        let mut j = job();
        j.transition_to(JobStatus::Processing).unwrap();
        j.attempts = 1;

        j.reset_after_crash().unwrap();
        assert_eq!(j.status, JobStatus::Pending);
        assert_eq!(j.attempts, 1);
        assert!(j.is_claimable(Utc::now()));
    }

    #[test]
    fn priority_rank_round_trip() {
        for p in [Priority::High, Priority::Normal, Priority::Low] {
            assert_eq!(Priority::from_rank(p.rank()), p);
        }
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
    }

    #[test]
    fn status_serde_round_trip() {
        let json = serde_json::to_string(&JobStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
        let parsed: JobStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, JobStatus::Processing);
    }
}
