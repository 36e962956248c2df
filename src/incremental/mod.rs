//! Incremental reprocessing — checkpoints, delta detection, and the
//! decision between incremental and full regeneration.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CheckpointError;
use crate::session::{SessionSnapshot, StreamItem, StreamKind};

/// Per-stream progress recorded in a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamCheckpoint {
    /// Index of the last item already processed; `None` means none yet.
    pub last_processed_index: Option<usize>,
    /// Content hash of the stream at checkpoint time.
    pub content_hash: String,
}

/// Durable record of what has already been enriched for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub streams: BTreeMap<StreamKind, StreamCheckpoint>,
    /// Executor version stamped when this checkpoint was written.
    pub executor_version: String,
    pub schema_version: u32,
    /// Total cost accumulated across all runs. Backend-only.
    pub cumulative_cost: Decimal,
    pub items_processed: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Why a full regeneration is required instead of an incremental run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RegenerationReason {
    /// Historical items changed under the checkpoint (hash mismatch).
    StreamHashChanged { stream: StreamKind },
    ExecutorVersionChanged { from: String, to: String },
    SchemaVersionChanged { from: u32, to: u32 },
}

impl std::fmt::Display for RegenerationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StreamHashChanged { stream } => {
                write!(f, "{stream} content changed since last run")
            }
            Self::ExecutorVersionChanged { from, to } => {
                write!(f, "executor updated ({from} -> {to})")
            }
            Self::SchemaVersionChanged { from, to } => {
                write!(f, "result schema updated (v{from} -> v{to})")
            }
        }
    }
}

/// The subset of a session's data newer than its checkpoint.
#[derive(Debug, Clone)]
pub struct Delta {
    /// New items per stream, in index order.
    pub streams: BTreeMap<StreamKind, Vec<StreamItem>>,
    pub requires_full_regeneration: bool,
    pub reasons: Vec<RegenerationReason>,
    pub total_new_items: usize,
    /// Total item count in the current snapshot.
    pub total_items: usize,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.total_new_items == 0 && !self.requires_full_regeneration
    }

    pub fn new_items(&self, kind: StreamKind) -> &[StreamItem] {
        self.streams.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Estimated work avoided by processing incrementally.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Savings {
    /// Items that do not need reprocessing.
    pub skipped_items: usize,
    /// Fraction of the snapshot skipped, 0.0–1.0.
    pub fraction: f64,
}

impl Savings {
    pub const NONE: Savings = Savings {
        skipped_items: 0,
        fraction: 0.0,
    };
}

/// Computes deltas and advances checkpoints.
#[derive(Debug, Clone)]
pub struct IncrementalProcessor {
    executor_version: String,
    schema_version: u32,
}

impl IncrementalProcessor {
    pub fn new(executor_version: impl Into<String>, schema_version: u32) -> Self {
        Self {
            executor_version: executor_version.into(),
            schema_version,
        }
    }

    /// Compare a snapshot against its checkpoint.
    ///
    /// With no checkpoint everything is new (first run) — that is not a
    /// regeneration *reason*, just an empty baseline.
    pub fn detect_delta(&self, snapshot: &SessionSnapshot, checkpoint: Option<&Checkpoint>) -> Delta {
        let total_items = snapshot.total_items();

        let Some(checkpoint) = checkpoint else {
            let streams: BTreeMap<StreamKind, Vec<StreamItem>> = snapshot
                .streams
                .iter()
                .map(|(k, s)| (*k, s.items.clone()))
                .collect();
            let total_new_items = streams.values().map(Vec::len).sum();
            return Delta {
                streams,
                requires_full_regeneration: false,
                reasons: Vec::new(),
                total_new_items,
                total_items,
            };
        };

        let mut reasons = Vec::new();

        if checkpoint.executor_version != self.executor_version {
            reasons.push(RegenerationReason::ExecutorVersionChanged {
                from: checkpoint.executor_version.clone(),
                to: self.executor_version.clone(),
            });
        }
        if checkpoint.schema_version != self.schema_version {
            reasons.push(RegenerationReason::SchemaVersionChanged {
                from: checkpoint.schema_version,
                to: self.schema_version,
            });
        }

        let mut streams = BTreeMap::new();
        for (kind, state) in &snapshot.streams {
            match checkpoint.streams.get(kind) {
                Some(cp) => {
                    // Hash over the already-processed prefix must still match;
                    // comparing full-stream hashes would flag every append.
                    let processed = match cp.last_processed_index {
                        Some(last) => &state.items[..state.items.len().min(last + 1)],
                        None => &state.items[..0],
                    };
                    let prefix_hash = crate::session::hash_stream_items(processed);
                    if prefix_hash != cp.content_hash {
                        reasons.push(RegenerationReason::StreamHashChanged { stream: *kind });
                    }

                    let new_items: Vec<StreamItem> = state
                        .items
                        .iter()
                        .filter(|item| match cp.last_processed_index {
                            Some(last) => item.index > last,
                            None => true,
                        })
                        .cloned()
                        .collect();
                    streams.insert(*kind, new_items);
                }
                None => {
                    // Stream appeared after the checkpoint — all items are new.
                    streams.insert(*kind, state.items.clone());
                }
            }
        }

        let requires_full_regeneration = !reasons.is_empty();
        let streams = if requires_full_regeneration {
            // Full regeneration reprocesses everything.
            snapshot
                .streams
                .iter()
                .map(|(k, s)| (*k, s.items.clone()))
                .collect()
        } else {
            streams
        };
        let total_new_items = streams.values().map(Vec::len).sum();

        if requires_full_regeneration {
            debug!(
                session_id = %snapshot.session_id,
                reasons = reasons.len(),
                "Full regeneration required"
            );
        }

        Delta {
            streams,
            requires_full_regeneration,
            reasons,
            total_new_items,
            total_items,
        }
    }

    /// True iff a checkpoint exists and no full-regeneration condition holds.
    pub fn can_process_incrementally(
        &self,
        snapshot: &SessionSnapshot,
        checkpoint: Option<&Checkpoint>,
    ) -> bool {
        match checkpoint {
            Some(cp) => !self.detect_delta(snapshot, Some(cp)).requires_full_regeneration,
            None => false,
        }
    }

    /// Proportional estimate of the work skipped by an incremental run.
    pub fn estimate_savings(&self, snapshot: &SessionSnapshot, delta: &Delta) -> Savings {
        if delta.requires_full_regeneration {
            return Savings::NONE;
        }
        let total = snapshot.total_items();
        if total == 0 {
            return Savings::NONE;
        }
        let skipped = total.saturating_sub(delta.total_new_items);
        Savings {
            skipped_items: skipped,
            fraction: skipped as f64 / total as f64,
        }
    }

    /// Advance a checkpoint to cover the current snapshot.
    ///
    /// Indices and hashes only move forward; a rewind is an error unless
    /// `full_reset` is set (which rebuilds the checkpoint from scratch).
    pub fn advance_checkpoint(
        &self,
        current: Option<Checkpoint>,
        snapshot: &SessionSnapshot,
        run_cost: Decimal,
        items_processed: u64,
        full_reset: bool,
    ) -> Result<Checkpoint, CheckpointError> {
        let now = Utc::now();

        let mut streams = BTreeMap::new();
        for (kind, state) in &snapshot.streams {
            let last = state.items.last().map(|i| i.index);
            streams.insert(
                *kind,
                StreamCheckpoint {
                    last_processed_index: last,
                    content_hash: state.content_hash.clone(),
                },
            );
        }

        match current {
            Some(mut existing) if !full_reset => {
                for (kind, new_cp) in &streams {
                    if let Some(old_cp) = existing.streams.get(kind) {
                        let old = old_cp.last_processed_index;
                        let new = new_cp.last_processed_index;
                        if let (Some(old_idx), new_idx) = (old, new) {
                            let new_idx = new_idx.unwrap_or(0);
                            if new_idx < old_idx {
                                return Err(CheckpointError::Rewind {
                                    session_id: snapshot.session_id.clone(),
                                    stream: kind.to_string(),
                                    from: old_idx,
                                    to: new_idx,
                                });
                            }
                        }
                    }
                }
                existing.streams = streams;
                existing.executor_version = self.executor_version.clone();
                existing.schema_version = self.schema_version;
                existing.cumulative_cost += run_cost;
                existing.items_processed += items_processed;
                existing.updated_at = now;
                Ok(existing)
            }
            maybe_existing => {
                // First run, or an explicit reset: prior cost still accumulates.
                let prior_cost = maybe_existing
                    .map(|cp| cp.cumulative_cost)
                    .unwrap_or(Decimal::ZERO);
                Ok(Checkpoint {
                    session_id: snapshot.session_id.clone(),
                    streams,
                    executor_version: self.executor_version.clone(),
                    schema_version: self.schema_version,
                    cumulative_cost: prior_cost + run_cost,
                    items_processed,
                    created_at: now,
                    updated_at: now,
                })
            }
        }
    }
}
