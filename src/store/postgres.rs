//! PostgreSQL job store.
//!
//! All coordination-sensitive operations are single atomic statements:
//! claims use `FOR UPDATE SKIP LOCKED`, metadata patches use a server-side
//! JSONB merge, and the watchdog lock maps onto Postgres advisory locks.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::job::{Job, JobStatus, JobUpdate, PipelineType, Turn};
use super::{schema, JobStore, StoreError};

/// PostgreSQL-backed job store.
pub struct PgJobStore {
    pool: PgPool,
    /// Advisory locks are session-scoped, so the holding connection must be
    /// pinned for the lock's lifetime. Keyed by lock key.
    lock_connections: Mutex<std::collections::HashMap<i64, PoolConnection<Postgres>>>,
}

impl PgJobStore {
    /// Connects to the database and returns a new store.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            pool,
            lock_connections: Mutex::new(std::collections::HashMap::new()),
        })
    }

    /// Creates a store from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            lock_connections: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the schema. Idempotent: every statement is rerunnable.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        for statement in schema::all_schema_statements() {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn row_to_job(row: &PgRow) -> Result<Job, StoreError> {
        let id: Uuid = row.try_get("id")?;

        let pipeline_type: String = row.try_get("pipeline_type")?;
        let pipeline_type =
            PipelineType::parse(&pipeline_type).ok_or_else(|| StoreError::CorruptRecord {
                id,
                reason: format!("unknown pipeline type '{}'", pipeline_type),
            })?;

        let status: String = row.try_get("status")?;
        let status = JobStatus::parse(&status).ok_or_else(|| StoreError::CorruptRecord {
            id,
            reason: format!("unknown status '{}'", status),
        })?;

        let history: Value = row.try_get("history")?;
        let history: Vec<Turn> = serde_json::from_value(history)?;

        Ok(Job {
            id,
            pipeline_type,
            status,
            step: row.try_get("step")?,
            metadata: row.try_get("metadata")?,
            history,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(
        &self,
        pipeline_type: PipelineType,
        initial_metadata: Value,
    ) -> Result<Job, StoreError> {
        let job = Job::new(pipeline_type, initial_metadata);

        let row = sqlx::query(
            r#"
            INSERT INTO jobs (id, pipeline_type, status, step, metadata, history, error_message, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, '[]'::jsonb, NULL, $6, $6)
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(job.pipeline_type.as_str())
        .bind(job.status.as_str())
        .bind(&job.step)
        .bind(&job.metadata)
        .bind(job.created_at)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_job(&row)
    }

    async fn get(&self, id: Uuid) -> Result<Job, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;

        Self::row_to_job(&row)
    }

    async fn update(&self, id: Uuid, update: JobUpdate) -> Result<Job, StoreError> {
        // One statement so concurrent patches interleave per-field rather
        // than clobbering whole rows; the JSONB || keeps metadata merges
        // last-writer-wins per key.
        let row = sqlx::query(
            r#"
            UPDATE jobs SET
                status = COALESCE($2, status),
                step = CASE WHEN $3 THEN $4 ELSE step END,
                metadata = CASE WHEN $5::jsonb IS NULL THEN metadata ELSE metadata || $5 END,
                error_message = CASE WHEN $6 THEN $7 ELSE error_message END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.step.is_some())
        .bind(update.step.flatten())
        .bind(update.metadata_patch)
        .bind(update.error_message.is_some())
        .bind(update.error_message.flatten())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        Self::row_to_job(&row)
    }

    async fn claim_next(&self, pipeline_type: PipelineType) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs SET status = 'claimed', updated_at = NOW()
            WHERE id = (
                SELECT id FROM jobs
                WHERE pipeline_type = $1 AND status = 'pending'
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(pipeline_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn find_stale(
        &self,
        pipeline_type: PipelineType,
        threshold: Duration,
    ) -> Result<Vec<Job>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());

        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE pipeline_type = $1
              AND status IN ('pending', 'claimed', 'processing')
              AND updated_at < $2
            ORDER BY updated_at
            "#,
        )
        .bind(pipeline_type.as_str())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn find_by_status(
        &self,
        pipeline_type: PipelineType,
        status: JobStatus,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE pipeline_type = $1 AND status = $2
            ORDER BY created_at
            "#,
        )
        .bind(pipeline_type.as_str())
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn append_history(&self, id: Uuid, turns: Vec<Turn>) -> Result<Job, StoreError> {
        let turns = serde_json::to_value(turns)?;

        let row = sqlx::query(
            r#"
            UPDATE jobs SET history = history || $2::jsonb, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(turns)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        Self::row_to_job(&row)
    }

    async fn try_advisory_lock(&self, key: i64) -> Result<bool, StoreError> {
        let mut held = self.lock_connections.lock().await;
        if held.contains_key(&key) {
            return Ok(false);
        }

        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query("SELECT pg_try_advisory_lock($1) AS acquired")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        let acquired: bool = row.try_get("acquired")?;

        if acquired {
            held.insert(key, conn);
        }
        Ok(acquired)
    }

    async fn advisory_unlock(&self, key: i64) -> Result<(), StoreError> {
        let mut held = self.lock_connections.lock().await;
        if let Some(mut conn) = held.remove(&key) {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(key)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }
}
