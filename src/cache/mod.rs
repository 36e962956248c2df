//! Caching — two-tier content-addressable artifact cache plus a small
//! generic memoizer for sub-computations.

pub mod artifact;
pub mod key;
pub mod memo;

pub use artifact::{ArtifactCache, CacheStats};
pub use key::generate_key;
pub use memo::{MemoCache, MemoStats};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cached enrichment artifact, as persisted in the durable tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Content hash of the normalized inputs.
    pub key: String,
    pub value: serde_json::Value,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Executor version that produced the value; a mismatch at read time
    /// invalidates the entry.
    pub executor_version: String,
    pub size_bytes: u64,
    pub access_count: u64,
    pub last_accessed_at: DateTime<Utc>,
}
