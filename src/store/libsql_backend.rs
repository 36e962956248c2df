//! libSQL backend — async `EnrichmentStore` implementation.
//!
//! Local file or in-memory databases via libsql's native async API.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::CacheEntry;
use crate::error::StoreError;
use crate::incremental::{Checkpoint, StreamCheckpoint};
use crate::jobs::{Job, JobStatus, Priority};
use crate::session::{EnrichmentOptions, EnrichmentResult, StageKind, StreamKind};
use crate::store::migrations;
use crate::store::traits::EnrichmentStore;

/// libSQL store backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("Failed to create store directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Enrichment store opened");

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn str_to_stage(s: &str) -> Option<StageKind> {
    match s {
        "transcription" => Some(StageKind::Transcription),
        "summary" => Some(StageKind::Summary),
        "insights" => Some(StageKind::Insights),
        "chapters" => Some(StageKind::Chapters),
        _ => None,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row to a Job.
///
/// Column order matches JOB_COLUMNS:
/// 0:id, 1:session_id, 2:status, 3:priority, 4:progress, 5:stage,
/// 6:options, 7:created_at, 8:started_at, 9:completed_at, 10:attempts,
/// 11:max_attempts, 12:eligible_at, 13:error, 14:result
fn row_to_job(row: &libsql::Row) -> Result<Job, libsql::Error> {
    let id_str: String = row.get(0)?;
    let status_str: String = row.get(2)?;
    let priority_rank: i64 = row.get(3)?;
    let progress: i64 = row.get(4)?;
    let stage_str: Option<String> = row.get(5).ok();
    let options_str: String = row.get(6)?;
    let created_str: String = row.get(7)?;
    let started_str: Option<String> = row.get(8).ok();
    let completed_str: Option<String> = row.get(9).ok();
    let attempts: i64 = row.get(10)?;
    let max_attempts: i64 = row.get(11)?;
    let eligible_str: Option<String> = row.get(12).ok();
    let error: Option<String> = row.get(13).ok();
    let result_str: Option<String> = row.get(14).ok();

    let options: EnrichmentOptions =
        serde_json::from_str(&options_str).unwrap_or_default();
    let result: Option<EnrichmentResult> = result_str
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok());

    Ok(Job {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        session_id: row.get(1)?,
        status: JobStatus::parse(&status_str).unwrap_or(JobStatus::Pending),
        priority: Priority::from_rank(priority_rank),
        progress: progress.clamp(0, 100) as u8,
        stage: stage_str.as_deref().and_then(str_to_stage),
        options,
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(&started_str),
        completed_at: parse_optional_datetime(&completed_str),
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(1) as u32,
        eligible_at: parse_optional_datetime(&eligible_str),
        error,
        result,
    })
}

/// Map a libsql Row to a Checkpoint.
fn row_to_checkpoint(row: &libsql::Row) -> Result<Checkpoint, libsql::Error> {
    let streams_str: String = row.get(1)?;
    let schema_version: i64 = row.get(3)?;
    let cost_str: String = row.get(4)?;
    let items_processed: i64 = row.get(5)?;
    let created_str: String = row.get(6)?;
    let updated_str: String = row.get(7)?;

    let streams: BTreeMap<StreamKind, StreamCheckpoint> =
        serde_json::from_str(&streams_str).unwrap_or_default();

    Ok(Checkpoint {
        session_id: row.get(0)?,
        streams,
        executor_version: row.get(2)?,
        schema_version: schema_version.max(0) as u32,
        cumulative_cost: cost_str.parse::<Decimal>().unwrap_or(Decimal::ZERO),
        items_processed: items_processed.max(0) as u64,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a CacheEntry.
fn row_to_cache_entry(row: &libsql::Row) -> Result<CacheEntry, libsql::Error> {
    let value_str: String = row.get(1)?;
    let cached_str: String = row.get(2)?;
    let expires_str: String = row.get(3)?;
    let size_bytes: i64 = row.get(5)?;
    let access_count: i64 = row.get(6)?;
    let accessed_str: String = row.get(7)?;

    Ok(CacheEntry {
        key: row.get(0)?,
        value: serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null),
        cached_at: parse_datetime(&cached_str),
        expires_at: parse_datetime(&expires_str),
        executor_version: row.get(4)?,
        size_bytes: size_bytes.max(0) as u64,
        access_count: access_count.max(0) as u64,
        last_accessed_at: parse_datetime(&accessed_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, session_id, status, priority, progress, stage, options, created_at, started_at, completed_at, attempts, max_attempts, eligible_at, error, result";

const CHECKPOINT_COLUMNS: &str = "session_id, streams, executor_version, schema_version, cumulative_cost, items_processed, created_at, updated_at";

const CACHE_COLUMNS: &str =
    "key, value, cached_at, expires_at, executor_version, size_bytes, access_count, last_accessed_at";

#[async_trait]
impl EnrichmentStore for LibSqlStore {
    // ── Jobs ────────────────────────────────────────────────────────

    async fn put_job(&self, job: &Job) -> Result<(), StoreError> {
        let conn = self.conn();

        let options_json = serde_json::to_string(&job.options)
            .map_err(|e| StoreError::Serialization(format!("job options: {e}")))?;
        let result_json = job
            .result
            .as_ref()
            .map(|r| serde_json::to_string(r))
            .transpose()
            .map_err(|e| StoreError::Serialization(format!("job result: {e}")))?;

        conn.execute(
            "INSERT INTO jobs (id, session_id, status, priority, progress, stage, options, created_at, started_at, completed_at, attempts, max_attempts, eligible_at, error, result) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                job.id.to_string(),
                job.session_id.clone(),
                job.status.as_str(),
                job.priority.rank(),
                job.progress as i64,
                opt_text_owned(job.stage.map(|s| s.as_str().to_string())),
                options_json,
                job.created_at.to_rfc3339(),
                opt_text_owned(job.started_at.map(|t| t.to_rfc3339())),
                opt_text_owned(job.completed_at.map(|t| t.to_rfc3339())),
                job.attempts as i64,
                job.max_attempts as i64,
                opt_text_owned(job.eligible_at.map(|t| t.to_rfc3339())),
                opt_text_owned(job.error.clone()),
                opt_text_owned(result_json),
            ],
        )
        .await
        .map_err(|e| {
            let msg = e.to_string();
            if msg.contains("UNIQUE") {
                StoreError::Constraint(format!("active job already exists for session {}", job.session_id))
            } else {
                StoreError::Query(format!("put_job: {msg}"))
            }
        })?;

        debug!(job_id = %job.id, session_id = %job.session_id, "Job inserted");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let job = row_to_job(&row)
                    .map_err(|e| StoreError::Query(format!("get_job row parse: {e}")))?;
                Ok(Some(job))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_job: {e}"))),
        }
    }

    async fn get_active_job_for_session(
        &self,
        session_id: &str,
    ) -> Result<Option<Job>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE session_id = ?1 AND status IN ('pending', 'processing') LIMIT 1"
                ),
                params![session_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_active_job_for_session: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let job = row_to_job(&row).map_err(|e| {
                    StoreError::Query(format!("get_active_job_for_session row parse: {e}"))
                })?;
                Ok(Some(job))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_active_job_for_session: {e}"))),
        }
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let conn = self.conn();

        let options_json = serde_json::to_string(&job.options)
            .map_err(|e| StoreError::Serialization(format!("job options: {e}")))?;
        let result_json = job
            .result
            .as_ref()
            .map(|r| serde_json::to_string(r))
            .transpose()
            .map_err(|e| StoreError::Serialization(format!("job result: {e}")))?;

        let changed = conn
            .execute(
                "UPDATE jobs SET session_id = ?2, status = ?3, priority = ?4, progress = ?5, stage = ?6, options = ?7, created_at = ?8, started_at = ?9, completed_at = ?10, attempts = ?11, max_attempts = ?12, eligible_at = ?13, error = ?14, result = ?15 WHERE id = ?1",
                params![
                    job.id.to_string(),
                    job.session_id.clone(),
                    job.status.as_str(),
                    job.priority.rank(),
                    job.progress as i64,
                    opt_text_owned(job.stage.map(|s| s.as_str().to_string())),
                    options_json,
                    job.created_at.to_rfc3339(),
                    opt_text_owned(job.started_at.map(|t| t.to_rfc3339())),
                    opt_text_owned(job.completed_at.map(|t| t.to_rfc3339())),
                    job.attempts as i64,
                    job.max_attempts as i64,
                    opt_text_owned(job.eligible_at.map(|t| t.to_rfc3339())),
                    opt_text_owned(job.error.clone()),
                    opt_text_owned(result_json),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("update_job: {e}")))?;

        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "job".to_string(),
                id: job.id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| StoreError::Query(format!("delete_job: {e}")))?;
        Ok(changed > 0)
    }

    async fn next_pending_job(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'pending' AND (eligible_at IS NULL OR eligible_at <= ?1) ORDER BY priority ASC, created_at ASC LIMIT 1"
                ),
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("next_pending_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let job = row_to_job(&row)
                    .map_err(|e| StoreError::Query(format!("next_pending_job row parse: {e}")))?;
                Ok(Some(job))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("next_pending_job: {e}"))),
        }
    }

    async fn reset_processing_jobs(&self) -> Result<usize, StoreError> {
        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE jobs SET status = 'pending', eligible_at = NULL, progress = 0, stage = NULL WHERE status = 'processing'",
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("reset_processing_jobs: {e}")))?;

        if changed > 0 {
            warn!(count = changed, "Reset interrupted jobs to pending");
        }
        Ok(changed as usize)
    }

    async fn counts_by_status(&self) -> Result<BTreeMap<JobStatus, usize>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT status, COUNT(*) FROM jobs GROUP BY status", ())
            .await
            .map_err(|e| StoreError::Query(format!("counts_by_status: {e}")))?;

        let mut counts = BTreeMap::new();
        while let Ok(Some(row)) = rows.next().await {
            let status_str: String = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("counts_by_status: {e}")))?;
            let count: i64 = row
                .get(1)
                .map_err(|e| StoreError::Query(format!("counts_by_status: {e}")))?;
            if let Some(status) = JobStatus::parse(&status_str) {
                counts.insert(status, count.max(0) as usize);
            }
        }
        Ok(counts)
    }

    async fn counts_by_priority(&self) -> Result<BTreeMap<Priority, usize>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT priority, COUNT(*) FROM jobs GROUP BY priority", ())
            .await
            .map_err(|e| StoreError::Query(format!("counts_by_priority: {e}")))?;

        let mut counts = BTreeMap::new();
        while let Ok(Some(row)) = rows.next().await {
            let rank: i64 = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("counts_by_priority: {e}")))?;
            let count: i64 = row
                .get(1)
                .map_err(|e| StoreError::Query(format!("counts_by_priority: {e}")))?;
            counts.insert(Priority::from_rank(rank), count.max(0) as usize);
        }
        Ok(counts)
    }

    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY created_at ASC LIMIT ?2"
                ),
                params![status.as_str(), limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_jobs_by_status: {e}")))?;

        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    warn!("Skipping job row: {e}");
                }
            }
        }
        Ok(jobs)
    }

    // ── Checkpoints ─────────────────────────────────────────────────

    async fn get_checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE session_id = ?1"),
                params![session_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_checkpoint: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let checkpoint = row_to_checkpoint(&row)
                    .map_err(|e| StoreError::Query(format!("get_checkpoint row parse: {e}")))?;
                Ok(Some(checkpoint))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_checkpoint: {e}"))),
        }
    }

    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let conn = self.conn();
        let streams_json = serde_json::to_string(&checkpoint.streams)
            .map_err(|e| StoreError::Serialization(format!("checkpoint streams: {e}")))?;

        conn.execute(
            "INSERT OR REPLACE INTO checkpoints (session_id, streams, executor_version, schema_version, cumulative_cost, items_processed, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                checkpoint.session_id.clone(),
                streams_json,
                checkpoint.executor_version.clone(),
                checkpoint.schema_version as i64,
                checkpoint.cumulative_cost.to_string(),
                checkpoint.items_processed as i64,
                checkpoint.created_at.to_rfc3339(),
                checkpoint.updated_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("put_checkpoint: {e}")))?;

        debug!(session_id = %checkpoint.session_id, "Checkpoint persisted");
        Ok(())
    }

    async fn delete_checkpoint(&self, session_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = conn
            .execute(
                "DELETE FROM checkpoints WHERE session_id = ?1",
                params![session_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("delete_checkpoint: {e}")))?;
        Ok(changed > 0)
    }

    // ── Durable cache tier ──────────────────────────────────────────

    async fn get_cache_entry(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {CACHE_COLUMNS} FROM cache_entries WHERE key = ?1"),
                params![key],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_cache_entry: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let entry = row_to_cache_entry(&row)
                    .map_err(|e| StoreError::Query(format!("get_cache_entry row parse: {e}")))?;
                Ok(Some(entry))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_cache_entry: {e}"))),
        }
    }

    async fn put_cache_entry(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        let conn = self.conn();
        let value_json = serde_json::to_string(&entry.value)
            .map_err(|e| StoreError::Serialization(format!("cache value: {e}")))?;

        conn.execute(
            "INSERT OR REPLACE INTO cache_entries (key, value, cached_at, expires_at, executor_version, size_bytes, access_count, last_accessed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.key.clone(),
                value_json,
                entry.cached_at.to_rfc3339(),
                entry.expires_at.to_rfc3339(),
                entry.executor_version.clone(),
                entry.size_bytes as i64,
                entry.access_count as i64,
                entry.last_accessed_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("put_cache_entry: {e}")))?;
        Ok(())
    }

    async fn delete_cache_entry(&self, key: &str) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = conn
            .execute("DELETE FROM cache_entries WHERE key = ?1", params![key])
            .await
            .map_err(|e| StoreError::Query(format!("delete_cache_entry: {e}")))?;
        Ok(changed > 0)
    }

    async fn invalidate_cache_entries(&self, pattern: &str) -> Result<usize, StoreError> {
        let conn = self.conn();
        // instr() sidesteps LIKE wildcard escaping for substring matches.
        let changed = conn
            .execute(
                "DELETE FROM cache_entries WHERE instr(key, ?1) > 0",
                params![pattern],
            )
            .await
            .map_err(|e| StoreError::Query(format!("invalidate_cache_entries: {e}")))?;
        Ok(changed as usize)
    }

    async fn touch_cache_entry(&self, key: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE cache_entries SET access_count = access_count + 1, last_accessed_at = ?2 WHERE key = ?1",
            params![key, at.to_rfc3339()],
        )
        .await
        .map_err(|e| StoreError::Query(format!("touch_cache_entry: {e}")))?;
        Ok(())
    }

    // ── Duration history ────────────────────────────────────────────

    async fn record_job_duration(
        &self,
        session_id: &str,
        duration_secs: f64,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO job_durations (session_id, duration_secs, finished_at) VALUES (?1, ?2, ?3)",
            params![session_id, duration_secs, finished_at.to_rfc3339()],
        )
        .await
        .map_err(|e| StoreError::Query(format!("record_job_duration: {e}")))?;
        Ok(())
    }

    async fn recent_job_durations(&self, limit: usize) -> Result<Vec<f64>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT duration_secs FROM job_durations ORDER BY finished_at DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("recent_job_durations: {e}")))?;

        let mut durations = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let secs: f64 = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("recent_job_durations: {e}")))?;
            durations.push(secs);
        }
        Ok(durations)
    }
}
