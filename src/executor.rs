//! The enrichment executor seam.
//!
//! The engine never performs AI inference itself. It hands the executor a
//! session snapshot, the delta to process, a memoizer for per-item work, and
//! a progress callback; the executor does the real work and reports per-stage
//! results plus cost and duration.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::cache::MemoCache;
use crate::error::ExecutorError;
use crate::incremental::Delta;
use crate::session::{EnrichmentOptions, SessionSnapshot, StageKind, StageResult};

/// Progress callback invoked by the executor during a run:
/// `(stage, percent 0–100, message)`.
pub type ProgressFn = Arc<dyn Fn(StageKind, u8, &str) + Send + Sync>;

/// Everything an executor needs for one enrichment run.
pub struct EnrichmentRequest {
    pub snapshot: SessionSnapshot,
    pub delta: Delta,
    pub options: EnrichmentOptions,
    /// Memoizer for fine-grained sub-computations (per-item analysis).
    pub memo: Arc<MemoCache>,
    pub progress: ProgressFn,
}

/// What an executor returns from one run.
pub struct EnrichmentOutput {
    pub stage_results: BTreeMap<StageKind, StageResult>,
    /// Cost of this run. Backend-only; never surfaced to users.
    pub cost: Decimal,
    pub duration: Duration,
}

impl EnrichmentOutput {
    /// True when at least one stage failed.
    pub fn has_failed_stage(&self) -> bool {
        self.stage_results
            .values()
            .any(|r| r.status == crate::session::StageStatus::Failed)
    }
}

/// Collaborator that performs the actual AI enrichment.
#[async_trait]
pub trait EnrichmentExecutor: Send + Sync {
    /// Version identifier stamped on checkpoints and cache entries.
    /// Bumping it invalidates both.
    fn version(&self) -> &str;

    /// Run enrichment for one session.
    async fn enrich(&self, request: EnrichmentRequest) -> Result<EnrichmentOutput, ExecutorError>;
}
