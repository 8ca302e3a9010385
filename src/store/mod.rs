//! Durable job storage.
//!
//! The job store is the only shared mutable resource in the engine; all
//! coordination between workers and the watchdog is expressed through it.
//! Two backends implement the same contract:
//!
//! - `PgJobStore`: PostgreSQL via sqlx, used in production. The claim
//!   operation is a single atomic statement and the watchdog lock maps to a
//!   Postgres advisory lock.
//! - `MemoryJobStore`: in-process map with equivalent semantics, used by
//!   tests and local development.

pub mod job;
pub mod memory;
pub mod postgres;
pub mod schema;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub use job::{
    merge_metadata, Job, JobStatus, JobUpdate, PipelineType, Turn, TurnRole, META_DELEGATED_JOB_ID,
    META_PARENT_JOB_ID, META_RESUME_STEP, META_USE_FALLBACK,
};
pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the backing database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// No job with the given id exists.
    #[error("Job {0} not found")]
    NotFound(Uuid),

    /// A stored column held a value the engine does not recognize.
    #[error("Corrupt record for job {id}: {reason}")]
    CorruptRecord { id: Uuid, reason: String },

    /// Serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable records of pipeline instances.
///
/// No behavior beyond atomic read/update/claim: workers and the watchdog own
/// all state-machine logic.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new job with `status = pending` and returns it.
    async fn create(
        &self,
        pipeline_type: PipelineType,
        initial_metadata: Value,
    ) -> Result<Job, StoreError>;

    /// Fetches a job by id.
    async fn get(&self, id: Uuid) -> Result<Job, StoreError>;

    /// Applies a partial update. Metadata patches are shallow-merged
    /// (last-writer-wins per key); `updated_at` is always bumped.
    async fn update(&self, id: Uuid, update: JobUpdate) -> Result<Job, StoreError>;

    /// Atomically transitions exactly one pending job of the given type to
    /// `claimed` and returns it. Safe under concurrent callers: a single
    /// atomic statement in the backing store, never read-then-write.
    async fn claim_next(&self, pipeline_type: PipelineType) -> Result<Option<Job>, StoreError>;

    /// Returns active jobs (pending/claimed/processing) of the given type
    /// whose `updated_at` is older than `threshold`.
    async fn find_stale(
        &self,
        pipeline_type: PipelineType,
        threshold: Duration,
    ) -> Result<Vec<Job>, StoreError>;

    /// Returns all jobs of the given type in the given status. Used by the
    /// watchdog's delegation and escalation scans.
    async fn find_by_status(
        &self,
        pipeline_type: PipelineType,
        status: JobStatus,
    ) -> Result<Vec<Job>, StoreError>;

    /// Appends turns to a planner job's history (append-only) and bumps
    /// `updated_at`.
    async fn append_history(&self, id: Uuid, turns: Vec<Turn>) -> Result<Job, StoreError>;

    /// Tries to acquire a process-wide advisory lock without blocking.
    /// Returns `false` if another holder has it.
    async fn try_advisory_lock(&self, key: i64) -> Result<bool, StoreError>;

    /// Releases a previously acquired advisory lock.
    async fn advisory_unlock(&self, key: i64) -> Result<(), StoreError>;
}
