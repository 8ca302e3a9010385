//! Scheduler/watchdog cycle.
//!
//! A fixed-period sweep over the job table that makes every liveness
//! guarantee hold without any in-process state: stale jobs are re-invoked,
//! slot-limited intake admits new work, parked parents are progressed when
//! their delegated children finish, and `pending_fallback` jobs get their
//! fallback child dispatched.
//!
//! The whole cycle runs under a non-blocking advisory lock, so overlapping
//! schedulers (or a slow previous cycle) no-op instead of double-driving
//! jobs. Every task is best-effort: a failure is logged and the rest of the
//! cycle continues.

use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::planner::tools::TOOL_START_TRY_ON;
use crate::store::{
    Job, JobStatus, JobStore, JobUpdate, PipelineType, StoreError, Turn, META_DELEGATED_JOB_ID,
    META_PARENT_JOB_ID, META_RESUME_STEP, META_USE_FALLBACK,
};
use crate::worker::Invoker;

/// Advisory lock key guarding the watchdog cycle, shared by every scheduler
/// instance pointed at the same database.
pub const WATCHDOG_LOCK_KEY: i64 = 0x7374_796c;

/// Errors that can occur during a watchdog cycle.
#[derive(Debug, Error)]
pub enum WatchdogError {
    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Counters summarizing one watchdog cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// The cycle no-opped because another holder had the lock.
    pub skipped: bool,
    /// Stale jobs re-invoked.
    pub recovered: usize,
    /// Jobs admitted through slot-limited intake.
    pub claimed: usize,
    /// Parked parents progressed from finished children.
    pub delegations_propagated: usize,
    /// Fallback children dispatched.
    pub escalations_dispatched: usize,
}

/// Periodic scheduler over the job store.
pub struct Watchdog {
    store: Arc<dyn JobStore>,
    invoker: Arc<dyn Invoker>,
    config: Arc<EngineConfig>,
}

impl Watchdog {
    /// Creates a watchdog over the given collaborators.
    pub fn new(
        store: Arc<dyn JobStore>,
        invoker: Arc<dyn Invoker>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            invoker,
            config,
        }
    }

    /// Runs cycles forever at the configured period.
    pub async fn run_forever(&self) {
        let mut ticker = tokio::time::interval(self.config.watchdog_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.run_cycle().await {
                Ok(report) if !report.skipped => {
                    debug!(
                        recovered = report.recovered,
                        claimed = report.claimed,
                        delegations = report.delegations_propagated,
                        escalations = report.escalations_dispatched,
                        "Watchdog cycle complete"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Watchdog cycle failed"),
            }
        }
    }

    /// Runs one cycle. Returns a skipped report if another holder has the
    /// advisory lock.
    pub async fn run_cycle(&self) -> Result<CycleReport, WatchdogError> {
        let mut report = CycleReport::default();
        if !self.store.try_advisory_lock(WATCHDOG_LOCK_KEY).await? {
            debug!("Watchdog lock held elsewhere, skipping cycle");
            report.skipped = true;
            return Ok(report);
        }

        for pipeline_type in PipelineType::ALL {
            if let Err(e) = self.recover_stale(pipeline_type, &mut report).await {
                warn!(pipeline = %pipeline_type, error = %e, "Stale recovery failed");
            }
            if self.config.is_slot_limited(pipeline_type) {
                if let Err(e) = self.intake(pipeline_type, &mut report).await {
                    warn!(pipeline = %pipeline_type, error = %e, "Intake failed");
                }
            }
            if let Err(e) = self.propagate_delegations(pipeline_type, &mut report).await {
                warn!(pipeline = %pipeline_type, error = %e, "Delegation propagation failed");
            }
            if let Err(e) = self.propagate_escalations(pipeline_type, &mut report).await {
                warn!(pipeline = %pipeline_type, error = %e, "Escalation propagation failed");
            }
        }

        if let Err(e) = self.store.advisory_unlock(WATCHDOG_LOCK_KEY).await {
            warn!(error = %e, "Failed to release watchdog lock");
        }
        Ok(report)
    }

    /// Re-invokes active jobs whose staleness clock ran past the per-type
    /// threshold. At-least-once handlers make the duplicate dispatch safe.
    async fn recover_stale(
        &self,
        pipeline_type: PipelineType,
        report: &mut CycleReport,
    ) -> Result<(), WatchdogError> {
        let threshold = self.config.staleness_for(pipeline_type);
        for job in self.store.find_stale(pipeline_type, threshold).await? {
            info!(
                job_id = %job.id,
                pipeline = %pipeline_type,
                status = %job.status,
                "Recovering stale job"
            );
            match self.invoker.invoke(job.id).await {
                Ok(()) => report.recovered += 1,
                Err(e) => warn!(job_id = %job.id, error = %e, "Stale recovery dispatch failed"),
            }
        }
        Ok(())
    }

    /// Admits at most one job for a concurrency-capped pipeline type, and
    /// only while no other job of that type is active.
    async fn intake(
        &self,
        pipeline_type: PipelineType,
        report: &mut CycleReport,
    ) -> Result<(), WatchdogError> {
        for status in [JobStatus::Claimed, JobStatus::Processing] {
            if !self.store.find_by_status(pipeline_type, status).await?.is_empty() {
                debug!(pipeline = %pipeline_type, "Slot occupied, deferring intake");
                return Ok(());
            }
        }

        let Some(job) = self.store.claim_next(pipeline_type).await? else {
            return Ok(());
        };
        info!(job_id = %job.id, pipeline = %pipeline_type, "Claimed job for execution");

        if let Err(e) = self.invoker.invoke(job.id).await {
            warn!(job_id = %job.id, error = %e, "Intake dispatch failed, reverting claim");
            self.store
                .update(job.id, JobUpdate::new().with_status(JobStatus::Pending))
                .await?;
            return Ok(());
        }
        report.claimed += 1;
        Ok(())
    }

    /// Progresses parents parked on delegated children.
    async fn propagate_delegations(
        &self,
        pipeline_type: PipelineType,
        report: &mut CycleReport,
    ) -> Result<(), WatchdogError> {
        for status in [
            JobStatus::AwaitingReframe,
            JobStatus::AwaitingGeneration,
            JobStatus::AwaitingFallback,
        ] {
            for parent in self.store.find_by_status(pipeline_type, status).await? {
                if let Err(e) = self.propagate_one(&parent, status, report).await {
                    warn!(
                        job_id = %parent.id,
                        error = %e,
                        "Delegation propagation failed for job"
                    );
                }
            }
        }
        Ok(())
    }

    async fn propagate_one(
        &self,
        parent: &Job,
        status: JobStatus,
        report: &mut CycleReport,
    ) -> Result<(), WatchdogError> {
        let Some(child_id) = parent.delegated_job_id() else {
            self.fail_parent(parent, "delegation state carries no child job id".to_string())
                .await?;
            report.delegations_propagated += 1;
            return Ok(());
        };

        let child = match self.store.get(child_id).await {
            Ok(child) => child,
            Err(StoreError::NotFound(_)) => {
                self.fail_parent(parent, format!("delegated job {} does not exist", child_id))
                    .await?;
                report.delegations_propagated += 1;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match child.status {
            JobStatus::Complete => {
                self.propagate_success(parent, &child, status).await?;
                report.delegations_propagated += 1;
            }
            JobStatus::Failed | JobStatus::PermanentlyFailed => {
                let child_error = child
                    .error_message
                    .as_deref()
                    .unwrap_or("no error recorded");
                if status == JobStatus::AwaitingFallback {
                    // Both providers are exhausted for this job.
                    self.store
                        .update(
                            parent.id,
                            JobUpdate::new()
                                .with_status(JobStatus::PermanentlyFailed)
                                .with_error(format!(
                                    "primary and fallback providers failed: {}",
                                    child_error
                                )),
                        )
                        .await?;
                } else {
                    self.fail_parent(
                        parent,
                        format!("delegated job {} failed: {}", child_id, child_error),
                    )
                    .await?;
                }
                report.delegations_propagated += 1;
            }
            _ => {
                debug!(job_id = %parent.id, child_id = %child_id, child_status = %child.status, "Child still running");
            }
        }
        Ok(())
    }

    /// Copies a finished child's result onto its parent and resumes it.
    async fn propagate_success(
        &self,
        parent: &Job,
        child: &Job,
        status: JobStatus,
    ) -> Result<(), WatchdogError> {
        let result_url = child
            .meta_str("result_url")
            .or_else(|| child.meta_str("final_url"))
            .map(str::to_string);

        if parent.pipeline_type == PipelineType::AgentConversation {
            let result = match &result_url {
                Some(url) => json!({ "image_url": url }),
                None => Value::Null,
            };
            self.store
                .append_history(parent.id, vec![Turn::tool_result(TOOL_START_TRY_ON, result)])
                .await?;
            let mut patch = json!({});
            if let Some(url) = &result_url {
                patch["last_image_url"] = Value::String(url.clone());
            }
            self.store
                .update(
                    parent.id,
                    JobUpdate::new()
                        .with_status(JobStatus::Processing)
                        .with_metadata_patch(patch),
                )
                .await?;
            self.dispatch(parent.id).await;
            return Ok(());
        }

        let Some(url) = result_url else {
            self.fail_parent(
                parent,
                format!("delegated job {} produced no result", child.id),
            )
            .await?;
            return Ok(());
        };

        // A fallback child ran the remainder of the pipeline itself, and a
        // parent parked at `done` has no steps left either way; finish
        // directly instead of resuming a step.
        if status == JobStatus::AwaitingFallback || parent.step.as_deref() == Some("done") {
            self.store
                .update(
                    parent.id,
                    JobUpdate::new()
                        .with_status(JobStatus::Complete)
                        .with_metadata_patch(json!({ "final_url": url }))
                        .clear_error(),
                )
                .await?;
            info!(job_id = %parent.id, child_id = %child.id, "Delegation complete, parent finished");
        } else {
            self.store
                .update(
                    parent.id,
                    JobUpdate::new()
                        .with_status(JobStatus::Processing)
                        .with_metadata_patch(json!({ "final_url": url })),
                )
                .await?;
            self.dispatch(parent.id).await;
        }
        Ok(())
    }

    /// Builds and dispatches the fallback child for escalated jobs.
    async fn propagate_escalations(
        &self,
        pipeline_type: PipelineType,
        report: &mut CycleReport,
    ) -> Result<(), WatchdogError> {
        for parent in self
            .store
            .find_by_status(pipeline_type, JobStatus::PendingFallback)
            .await?
        {
            // The child inherits the parent's full metadata, so prepared
            // assets and quality state carry across provider boundaries.
            let mut child_meta = parent.metadata.clone();
            if let Some(map) = child_meta.as_object_mut() {
                map.insert(META_USE_FALLBACK.to_string(), Value::Bool(true));
                map.insert(
                    META_PARENT_JOB_ID.to_string(),
                    Value::String(parent.id.to_string()),
                );
                map.remove(META_DELEGATED_JOB_ID);
            }
            let resume_step = parent
                .meta_str(META_RESUME_STEP)
                .unwrap_or("start")
                .to_string();

            let child = self.store.create(pipeline_type, child_meta).await?;
            self.store
                .update(child.id, JobUpdate::new().with_step(&resume_step))
                .await?;
            self.store
                .update(
                    parent.id,
                    JobUpdate::new()
                        .with_status(JobStatus::AwaitingFallback)
                        .with_metadata_patch(
                            json!({ META_DELEGATED_JOB_ID: child.id.to_string() }),
                        ),
                )
                .await?;
            info!(
                job_id = %parent.id,
                child_id = %child.id,
                resume_step = %resume_step,
                "Dispatching fallback job"
            );

            self.dispatch(child.id).await;
            report.escalations_dispatched += 1;
        }
        Ok(())
    }

    async fn fail_parent(&self, parent: &Job, message: String) -> Result<(), WatchdogError> {
        warn!(job_id = %parent.id, error = %message, "Failing parked parent");
        self.store
            .update(
                parent.id,
                JobUpdate::new()
                    .with_status(JobStatus::Failed)
                    .with_error(message),
            )
            .await?;
        Ok(())
    }

    /// Fire-and-forget dispatch; lost invocations are recovered by the next
    /// cycle's staleness scan.
    async fn dispatch(&self, job_id: uuid::Uuid) {
        if let Err(e) = self.invoker.invoke(job_id).await {
            warn!(job_id = %job_id, error = %e, "Watchdog dispatch failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use uuid::Uuid;

    use crate::store::{MemoryJobStore, TurnRole};
    use crate::worker::InvokeError;

    use super::*;

    #[derive(Default)]
    struct RecordingInvoker {
        calls: Mutex<Vec<Uuid>>,
        fail: bool,
    }

    impl RecordingInvoker {
        fn failing() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn calls(&self) -> Vec<Uuid> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Invoker for RecordingInvoker {
        async fn invoke(&self, job_id: Uuid) -> Result<(), InvokeError> {
            self.calls.lock().unwrap().push(job_id);
            if self.fail {
                return Err(InvokeError::TargetGone);
            }
            Ok(())
        }
    }

    struct Harness {
        watchdog: Watchdog,
        store: Arc<MemoryJobStore>,
        invoker: Arc<RecordingInvoker>,
    }

    fn harness_with(invoker: RecordingInvoker) -> Harness {
        let store = Arc::new(MemoryJobStore::new());
        let invoker = Arc::new(invoker);
        let watchdog = Watchdog::new(
            store.clone(),
            invoker.clone(),
            Arc::new(EngineConfig::default()),
        );
        Harness {
            watchdog,
            store,
            invoker,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingInvoker::default())
    }

    #[tokio::test]
    async fn test_cycle_skips_when_lock_held() {
        let h = harness();
        assert!(h.store.try_advisory_lock(WATCHDOG_LOCK_KEY).await.expect("lock"));

        let report = h.watchdog.run_cycle().await.expect("cycle");
        assert!(report.skipped);
        assert!(h.invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_lock_released_after_cycle() {
        let h = harness();
        let first = h.watchdog.run_cycle().await.expect("cycle");
        assert!(!first.skipped);
        let second = h.watchdog.run_cycle().await.expect("cycle");
        assert!(!second.skipped, "lock must be released between cycles");
    }

    #[tokio::test]
    async fn test_stale_job_recovered_once_per_cycle() {
        let h = harness();
        let job = h
            .store
            .create(PipelineType::TryOnComposite, json!({}))
            .await
            .expect("create");
        h.store
            .update(job.id, JobUpdate::new().with_status(JobStatus::Processing))
            .await
            .expect("update");
        h.store
            .age_job(job.id, Duration::from_secs(300))
            .await
            .expect("age");

        let report = h.watchdog.run_cycle().await.expect("cycle");
        assert_eq!(report.recovered, 1);
        assert_eq!(h.invoker.calls(), vec![job.id]);
    }

    #[tokio::test]
    async fn test_fresh_job_not_recovered() {
        let h = harness();
        let job = h
            .store
            .create(PipelineType::TryOnComposite, json!({}))
            .await
            .expect("create");
        h.store
            .update(job.id, JobUpdate::new().with_status(JobStatus::Processing))
            .await
            .expect("update");

        let report = h.watchdog.run_cycle().await.expect("cycle");
        assert_eq!(report.recovered, 0);
    }

    #[tokio::test]
    async fn test_slot_limited_intake_admits_one() {
        let h = harness();
        h.store
            .create(PipelineType::BatchRefine, json!({"items": ["a"]}))
            .await
            .expect("create");
        h.store
            .create(PipelineType::BatchRefine, json!({"items": ["b"]}))
            .await
            .expect("create");

        let report = h.watchdog.run_cycle().await.expect("cycle");
        assert_eq!(report.claimed, 1);

        // The claimed job occupies the slot; the second stays pending.
        let report = h.watchdog.run_cycle().await.expect("cycle");
        assert_eq!(report.claimed, 0);
    }

    #[tokio::test]
    async fn test_intake_reverts_on_dispatch_failure() {
        let h = harness_with(RecordingInvoker::failing());
        let job = h
            .store
            .create(PipelineType::BatchRefine, json!({"items": ["a"]}))
            .await
            .expect("create");

        let report = h.watchdog.run_cycle().await.expect("cycle");
        assert_eq!(report.claimed, 0);
        let job = h.store.get(job.id).await.expect("get");
        assert_eq!(job.status, JobStatus::Pending, "failed dispatch reverts the claim");
    }

    async fn parked_parent(h: &Harness, child_meta: Value, child_status: JobStatus) -> (Job, Job) {
        let child = h
            .store
            .create(PipelineType::Reframe, child_meta)
            .await
            .expect("create child");
        h.store
            .update(child.id, JobUpdate::new().with_status(child_status))
            .await
            .expect("update child");
        let parent = h
            .store
            .create(
                PipelineType::TryOnComposite,
                json!({ META_DELEGATED_JOB_ID: child.id.to_string() }),
            )
            .await
            .expect("create parent");
        let parent = h
            .store
            .update(
                parent.id,
                JobUpdate::new()
                    .with_status(JobStatus::AwaitingReframe)
                    .with_step("done"),
            )
            .await
            .expect("update parent");
        (parent, child)
    }

    #[tokio::test]
    async fn test_complete_child_finishes_parked_parent() {
        let h = harness();
        let (parent, _child) = parked_parent(
            &h,
            json!({"result_url": "blob://reframed.png"}),
            JobStatus::Complete,
        )
        .await;

        let report = h.watchdog.run_cycle().await.expect("cycle");
        assert_eq!(report.delegations_propagated, 1);

        let parent = h.store.get(parent.id).await.expect("get");
        assert_eq!(parent.status, JobStatus::Complete);
        assert_eq!(parent.meta_str("final_url"), Some("blob://reframed.png"));
    }

    #[tokio::test]
    async fn test_failed_child_fails_parent() {
        let h = harness();
        let (parent, child) = parked_parent(&h, json!({}), JobStatus::Pending).await;
        h.store
            .update(
                child.id,
                JobUpdate::new()
                    .with_status(JobStatus::Failed)
                    .with_error("reframe exploded"),
            )
            .await
            .expect("fail child");

        h.watchdog.run_cycle().await.expect("cycle");

        let parent = h.store.get(parent.id).await.expect("get");
        assert_eq!(parent.status, JobStatus::Failed);
        let message = parent.error_message.expect("message");
        assert!(message.contains(&child.id.to_string()));
        assert!(message.contains("reframe exploded"));
    }

    #[tokio::test]
    async fn test_running_child_leaves_parent_parked() {
        let h = harness();
        let (parent, _child) = parked_parent(&h, json!({}), JobStatus::Processing).await;

        let report = h.watchdog.run_cycle().await.expect("cycle");
        assert_eq!(report.delegations_propagated, 0);
        let parent = h.store.get(parent.id).await.expect("get");
        assert_eq!(parent.status, JobStatus::AwaitingReframe);
    }

    #[tokio::test]
    async fn test_missing_child_fails_parent() {
        let h = harness();
        let parent = h
            .store
            .create(
                PipelineType::TryOnComposite,
                json!({ META_DELEGATED_JOB_ID: Uuid::new_v4().to_string() }),
            )
            .await
            .expect("create");
        h.store
            .update(
                parent.id,
                JobUpdate::new().with_status(JobStatus::AwaitingReframe),
            )
            .await
            .expect("park");

        h.watchdog.run_cycle().await.expect("cycle");

        let parent = h.store.get(parent.id).await.expect("get");
        assert_eq!(parent.status, JobStatus::Failed);
        assert!(parent.error_message.expect("message").contains("does not exist"));
    }

    #[tokio::test]
    async fn test_complete_child_resumes_conversation_parent() {
        let h = harness();
        let child = h
            .store
            .create(
                PipelineType::TryOnComposite,
                json!({"final_url": "blob://composited.png"}),
            )
            .await
            .expect("create child");
        h.store
            .update(child.id, JobUpdate::new().with_status(JobStatus::Complete))
            .await
            .expect("complete child");
        let parent = h
            .store
            .create(
                PipelineType::AgentConversation,
                json!({ META_DELEGATED_JOB_ID: child.id.to_string() }),
            )
            .await
            .expect("create parent");
        h.store
            .update(
                parent.id,
                JobUpdate::new().with_status(JobStatus::AwaitingGeneration),
            )
            .await
            .expect("park");

        h.watchdog.run_cycle().await.expect("cycle");

        let parent = h.store.get(parent.id).await.expect("get");
        assert_eq!(parent.status, JobStatus::Processing);
        assert_eq!(parent.meta_str("last_image_url"), Some("blob://composited.png"));
        assert_eq!(parent.history.len(), 1);
        assert_eq!(parent.history[0].role, TurnRole::ToolResult);
        assert!(h.invoker.calls().contains(&parent.id), "parent loop resumed");
    }

    #[tokio::test]
    async fn test_escalation_dispatches_fallback_child() {
        let h = harness();
        let parent = h
            .store
            .create(
                PipelineType::TryOnComposite,
                json!({
                    "subject_url": "blob://s.png",
                    "reference_url": "blob://r.png",
                    "prepared_subject_url": "blob://ps.png",
                    "prepared_reference_url": "blob://pr.png",
                    META_RESUME_STEP: "generate_candidate"
                }),
            )
            .await
            .expect("create");
        h.store
            .update(
                parent.id,
                JobUpdate::new()
                    .with_status(JobStatus::PendingFallback)
                    .with_error("primary provider failed at generate_candidate: 404"),
            )
            .await
            .expect("escalate");

        let report = h.watchdog.run_cycle().await.expect("cycle");
        assert_eq!(report.escalations_dispatched, 1);

        let parent = h.store.get(parent.id).await.expect("get");
        assert_eq!(parent.status, JobStatus::AwaitingFallback);
        let child_id = parent.delegated_job_id().expect("child recorded");

        let child = h.store.get(child_id).await.expect("child exists");
        assert!(child.uses_fallback_provider());
        assert_eq!(child.step.as_deref(), Some("generate_candidate"));
        assert_eq!(child.meta_str("prepared_subject_url"), Some("blob://ps.png"));
        assert_eq!(child.parent_job_id(), Some(parent.id));
        assert!(h.invoker.calls().contains(&child_id));
    }

    #[tokio::test]
    async fn test_fallback_child_failure_is_permanent() {
        let h = harness();
        let child = h
            .store
            .create(PipelineType::TryOnComposite, json!({ META_USE_FALLBACK: true }))
            .await
            .expect("create child");
        h.store
            .update(
                child.id,
                JobUpdate::new()
                    .with_status(JobStatus::Failed)
                    .with_error("fallback also 404"),
            )
            .await
            .expect("fail child");
        let parent = h
            .store
            .create(
                PipelineType::TryOnComposite,
                json!({ META_DELEGATED_JOB_ID: child.id.to_string() }),
            )
            .await
            .expect("create parent");
        h.store
            .update(
                parent.id,
                JobUpdate::new().with_status(JobStatus::AwaitingFallback),
            )
            .await
            .expect("park");

        h.watchdog.run_cycle().await.expect("cycle");

        let parent = h.store.get(parent.id).await.expect("get");
        assert_eq!(parent.status, JobStatus::PermanentlyFailed);
        let message = parent.error_message.expect("message");
        assert!(message.contains("primary and fallback"));
        assert!(message.contains("fallback also 404"));
    }
}
