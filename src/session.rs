//! Session domain types — snapshots of recorded sessions and the enrichment
//! vocabulary built on top of them.
//!
//! A session is a recorded work period with several parallel data streams
//! (screenshots, audio segments, video frames). The engine never touches the
//! raw media; it works from lightweight snapshots the host hands it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::key::sha256_hex;
use crate::error::StoreError;

/// An enrichment stage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Speech-to-text over the audio streams.
    Transcription,
    /// Narrative summary of the session.
    Summary,
    /// Key moments, work patterns, and other derived observations.
    Insights,
    /// Chapter boundaries for the session timeline.
    Chapters,
}

impl StageKind {
    /// All stages in pipeline order.
    pub const ALL: [StageKind; 4] = [
        StageKind::Transcription,
        StageKind::Summary,
        StageKind::Insights,
        StageKind::Chapters,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcription => "transcription",
            Self::Summary => "summary",
            Self::Insights => "insights",
            Self::Chapters => "chapters",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sub-status of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

/// A data stream recorded during a session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Screenshots,
    AudioSegments,
    VideoFrames,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Screenshots => "screenshots",
            Self::AudioSegments => "audio_segments",
            Self::VideoFrames => "video_frames",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One item in a stream (a screenshot, an audio segment, ...).
///
/// The payload is host-defined reference data (attachment ids, paths);
/// the engine only relies on `id`, `index`, and `timestamp_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamItem {
    pub id: String,
    /// Position within the stream, 0-based and append-only.
    pub index: usize,
    /// Offset from session start, in seconds.
    pub timestamp_secs: f64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// The current state of one stream: its items plus a content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamState {
    pub items: Vec<StreamItem>,
    /// Hash over the ordered item ids; a mismatch against a checkpoint means
    /// historical data was mutated.
    pub content_hash: String,
}

impl StreamState {
    /// Build a stream state from items, computing the content hash.
    pub fn new(items: Vec<StreamItem>) -> Self {
        let content_hash = hash_stream_items(&items);
        Self {
            items,
            content_hash,
        }
    }
}

/// Hash the ordered item ids of a stream.
pub fn hash_stream_items(items: &[StreamItem]) -> String {
    let joined = items
        .iter()
        .map(|i| i.id.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    sha256_hex(joined.as_bytes())
}

/// Lightweight snapshot of a recorded session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub name: String,
    pub recorded_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub streams: BTreeMap<StreamKind, StreamState>,
}

impl SessionSnapshot {
    pub fn stream(&self, kind: StreamKind) -> Option<&StreamState> {
        self.streams.get(&kind)
    }

    /// Total item count across all streams.
    pub fn total_items(&self) -> usize {
        self.streams.values().map(|s| s.items.len()).sum()
    }

    /// Content fingerprints per stream, for cache-key derivation.
    pub fn fingerprints(&self) -> BTreeMap<StreamKind, String> {
        self.streams
            .iter()
            .map(|(k, s)| (*k, s.content_hash.clone()))
            .collect()
    }
}

/// Per-job enrichment options supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentOptions {
    /// Stages to run, in order. Empty means all.
    #[serde(default)]
    pub stages: Vec<StageKind>,
    /// Optional extra prompt context from the user.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Model identifier forwarded to the executor.
    #[serde(default)]
    pub model: Option<String>,
    /// Skip delta detection and regenerate everything.
    #[serde(default)]
    pub force_full: bool,
}

impl Default for EnrichmentOptions {
    fn default() -> Self {
        Self {
            stages: StageKind::ALL.to_vec(),
            prompt: None,
            model: None,
            force_full: false,
        }
    }
}

impl EnrichmentOptions {
    /// Effective stage list (empty list falls back to all stages).
    pub fn effective_stages(&self) -> Vec<StageKind> {
        if self.stages.is_empty() {
            StageKind::ALL.to_vec()
        } else {
            self.stages.clone()
        }
    }
}

/// Outcome of one stage of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageKind,
    pub status: StageStatus,
    /// The produced artifact (chapter list, summary text, ...), if any.
    #[serde(default)]
    pub artifact: Option<serde_json::Value>,
    /// User-safe failure description for failed stages.
    #[serde(default)]
    pub error: Option<String>,
}

/// Final result attached to a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub stage_results: BTreeMap<StageKind, StageResult>,
    /// True when at least one stage failed but the run completed overall.
    pub partial: bool,
    pub completed_at: DateTime<Utc>,
    /// True when the result came from the artifact cache without running
    /// the executor.
    #[serde(default)]
    pub from_cache: bool,
}

impl EnrichmentResult {
    pub fn is_degraded(&self) -> bool {
        self.partial
    }
}

/// Host collaborator that loads session snapshots on demand.
#[async_trait]
pub trait SessionSource: Send + Sync {
    /// Load the current snapshot for a session.
    async fn load(&self, session_id: &str) -> Result<SessionSnapshot, StoreError>;
}
