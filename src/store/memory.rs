//! In-memory job store for tests and local development.
//!
//! Mirrors the semantics of the Postgres backend, including the atomic
//! claim (compare-and-swap held under the map mutex) and a non-blocking
//! advisory lock keyed by integer.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::job::{Job, JobStatus, JobUpdate, PipelineType, Turn};
use super::{JobStore, StoreError};

/// In-process job store backed by a mutex-held map.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    locks: Mutex<HashSet<i64>>,
}

impl MemoryJobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewinds a job's `updated_at` by the given duration.
    ///
    /// Test hook for exercising staleness recovery without sleeping.
    pub async fn age_job(&self, id: Uuid, by: Duration) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        job.updated_at -= chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(
        &self,
        pipeline_type: PipelineType,
        initial_metadata: Value,
    ) -> Result<Job, StoreError> {
        let job = Job::new(pipeline_type, initial_metadata);
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Job, StoreError> {
        self.jobs
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update(&self, id: Uuid, update: JobUpdate) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        update.apply(job);
        Ok(job.clone())
    }

    async fn claim_next(&self, pipeline_type: PipelineType) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.lock().await;

        // Oldest pending job of the type wins, matching the SQL ORDER BY.
        let candidate = jobs
            .values()
            .filter(|j| j.pipeline_type == pipeline_type && j.status == JobStatus::Pending)
            .min_by_key(|j| j.created_at)
            .map(|j| j.id);

        match candidate {
            Some(id) => {
                let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
                job.status = JobStatus::Claimed;
                job.updated_at = Utc::now();
                Ok(Some(job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn find_stale(
        &self,
        pipeline_type: PipelineType,
        threshold: Duration,
    ) -> Result<Vec<Job>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());
        let jobs = self.jobs.lock().await;

        let mut stale: Vec<Job> = jobs
            .values()
            .filter(|j| {
                j.pipeline_type == pipeline_type
                    && j.status.is_stale_eligible()
                    && j.updated_at < cutoff
            })
            .cloned()
            .collect();
        stale.sort_by_key(|j| j.updated_at);
        Ok(stale)
    }

    async fn find_by_status(
        &self,
        pipeline_type: PipelineType,
        status: JobStatus,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().await;
        let mut found: Vec<Job> = jobs
            .values()
            .filter(|j| j.pipeline_type == pipeline_type && j.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|j| j.created_at);
        Ok(found)
    }

    async fn append_history(&self, id: Uuid, turns: Vec<Turn>) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        job.history.extend(turns);
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn try_advisory_lock(&self, key: i64) -> Result<bool, StoreError> {
        Ok(self.locks.lock().await.insert(key))
    }

    async fn advisory_unlock(&self, key: i64) -> Result<(), StoreError> {
        self.locks.lock().await.remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::super::job::TurnRole;
    use super::*;

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryJobStore::new();
        let job = store
            .create(PipelineType::TryOnComposite, json!({"subject_url": "s.png"}))
            .await
            .expect("create");

        let fetched = store.get(job.id).await.expect("get");
        assert_eq!(fetched.status, JobStatus::Pending);
        assert_eq!(fetched.meta_str("subject_url"), Some("s.png"));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = MemoryJobStore::new();
        let err = store.get(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_merges_metadata() {
        let store = MemoryJobStore::new();
        let job = store
            .create(PipelineType::TryOnComposite, json!({"a": 1}))
            .await
            .expect("create");

        let updated = store
            .update(
                job.id,
                JobUpdate::new()
                    .with_status(JobStatus::Processing)
                    .with_metadata_patch(json!({"b": 2})),
            )
            .await
            .expect("update");

        assert_eq!(updated.metadata, json!({"a": 1, "b": 2}));
        assert_eq!(updated.status, JobStatus::Processing);
        assert!(updated.updated_at >= job.updated_at);
    }

    #[tokio::test]
    async fn test_claim_next_oldest_first() {
        let store = MemoryJobStore::new();
        let first = store
            .create(PipelineType::BatchRefine, json!({}))
            .await
            .expect("create");
        // Backdate the first job so creation order is unambiguous.
        {
            let mut jobs = store.jobs.lock().await;
            jobs.get_mut(&first.id).expect("job").created_at -= chrono::Duration::seconds(5);
        }
        store
            .create(PipelineType::BatchRefine, json!({}))
            .await
            .expect("create");

        let claimed = store
            .claim_next(PipelineType::BatchRefine)
            .await
            .expect("claim")
            .expect("job available");
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Claimed);
    }

    #[tokio::test]
    async fn test_claim_next_ignores_other_types_and_statuses() {
        let store = MemoryJobStore::new();
        store
            .create(PipelineType::Reframe, json!({}))
            .await
            .expect("create");
        let done = store
            .create(PipelineType::BatchRefine, json!({}))
            .await
            .expect("create");
        store
            .update(done.id, JobUpdate::new().with_status(JobStatus::Complete))
            .await
            .expect("update");

        let claimed = store
            .claim_next(PipelineType::BatchRefine)
            .await
            .expect("claim");
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_claim_exclusivity_under_concurrency() {
        let store = Arc::new(MemoryJobStore::new());
        let mut pending = Vec::new();
        for _ in 0..3 {
            let job = store
                .create(PipelineType::BatchRefine, json!({}))
                .await
                .expect("create");
            pending.push(job.id);
        }

        // More claimants than pending jobs.
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.claim_next(PipelineType::BatchRefine).await
            }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(job) = handle.await.expect("join").expect("claim") {
                claimed.push(job.id);
            }
        }

        claimed.sort();
        claimed.dedup();
        assert_eq!(claimed.len(), 3, "exactly K distinct jobs claimed");
    }

    #[tokio::test]
    async fn test_find_stale_excludes_awaiting_and_terminal() {
        let store = MemoryJobStore::new();
        let active = store
            .create(PipelineType::TryOnComposite, json!({}))
            .await
            .expect("create");
        let awaiting = store
            .create(PipelineType::TryOnComposite, json!({}))
            .await
            .expect("create");
        store
            .update(
                awaiting.id,
                JobUpdate::new().with_status(JobStatus::AwaitingReframe),
            )
            .await
            .expect("update");

        store
            .age_job(active.id, Duration::from_secs(120))
            .await
            .expect("age");
        store
            .age_job(awaiting.id, Duration::from_secs(120))
            .await
            .expect("age");

        let stale = store
            .find_stale(PipelineType::TryOnComposite, Duration::from_secs(60))
            .await
            .expect("find_stale");
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, active.id);
    }

    #[tokio::test]
    async fn test_append_history_is_append_only() {
        let store = MemoryJobStore::new();
        let job = store
            .create(PipelineType::AgentConversation, json!({}))
            .await
            .expect("create");

        store
            .append_history(job.id, vec![Turn::user("hi")])
            .await
            .expect("append");
        let after = store
            .append_history(job.id, vec![Turn::tool_call("finish", json!({}))])
            .await
            .expect("append");

        assert_eq!(after.history.len(), 2);
        assert_eq!(after.history[0].role, TurnRole::User);
    }

    #[tokio::test]
    async fn test_advisory_lock_is_exclusive() {
        let store = MemoryJobStore::new();
        assert!(store.try_advisory_lock(7).await.expect("lock"));
        assert!(!store.try_advisory_lock(7).await.expect("lock"));
        store.advisory_unlock(7).await.expect("unlock");
        assert!(store.try_advisory_lock(7).await.expect("lock"));
    }
}
