//! Step-machine worker.
//!
//! Executes exactly one step of a named pipeline per invocation: load the
//! job, dispatch on its persisted step to the matching handler, persist the
//! result and the next step name, then fire-and-forget the next invocation.
//! The worker never loops in-process across steps — "suspension" between
//! steps is persisted state plus a new invocation.
//!
//! Execution is at-least-once: the worker re-reads the job immediately
//! before dispatch and runs the handler for the *persisted* step, so a
//! duplicate invocation for an already-advanced job executes the newer step
//! (or no-ops on a terminal job) rather than repeating old work.

pub mod composite;
pub mod invoker;
pub mod refine;

use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::blob::{BlobError, BlobStore};
use crate::config::EngineConfig;
use crate::provider::{GenerationProvider, ProviderError};
use crate::store::{
    Job, JobStatus, JobStore, JobUpdate, PipelineType, StoreError, META_RESUME_STEP,
};

pub use invoker::{InvokeError, Invoker, SpawnInvoker};

/// Errors that can occur during a worker invocation.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Provider call failed after in-step retries.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Blob read/write failed.
    #[error("Blob error: {0}")]
    Blob(#[from] BlobError),

    /// A step requires a metadata key the job does not carry.
    #[error("Step '{step}' requires metadata key '{key}'")]
    MissingMetadata { step: String, key: String },

    /// The persisted step name is not part of this pipeline's DAG.
    #[error("Unknown step '{step}' for pipeline {pipeline}")]
    UnknownStep { pipeline: PipelineType, step: String },

    /// The job belongs to a different execution loop.
    #[error("Pipeline {0} is not handled by the step worker")]
    WrongPipeline(PipelineType),

    /// A provider response failed validation.
    #[error("Invalid step result: {0}")]
    InvalidResult(String),
}

impl WorkerError {
    /// Whether this failure should escalate to the fallback provider
    /// instead of failing the job.
    fn is_structural(&self) -> bool {
        matches!(self, WorkerError::Provider(p) if p.is_structural())
    }
}

/// What a step handler decided: the update to persist and whether to
/// self-invoke for the next step.
#[derive(Debug)]
pub struct StepOutcome {
    /// Partial update persisted after the handler returns.
    pub update: JobUpdate,
    /// Whether to fire-and-forget the next invocation.
    pub invoke_next: bool,
}

impl StepOutcome {
    /// Persist the update and chain to the next step.
    pub fn advance(update: JobUpdate) -> Self {
        Self {
            update,
            invoke_next: true,
        }
    }

    /// Persist the update and stop; something external drives the job next
    /// (watchdog propagation, user input, or the job is terminal).
    pub fn pause(update: JobUpdate) -> Self {
        Self {
            update,
            invoke_next: false,
        }
    }
}

/// Executes one step of a step-machine pipeline per invocation.
pub struct StepWorker {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) primary: Arc<dyn GenerationProvider>,
    pub(crate) fallback: Arc<dyn GenerationProvider>,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) invoker: Arc<dyn Invoker>,
}

impl StepWorker {
    /// Creates a worker over the given collaborators.
    pub fn new(
        store: Arc<dyn JobStore>,
        primary: Arc<dyn GenerationProvider>,
        fallback: Arc<dyn GenerationProvider>,
        blobs: Arc<dyn BlobStore>,
        config: Arc<EngineConfig>,
        invoker: Arc<dyn Invoker>,
    ) -> Self {
        Self {
            store,
            primary,
            fallback,
            blobs,
            config,
            invoker,
        }
    }

    /// Selects the provider for a job: fallback jobs carry a marker set
    /// during escalation.
    pub(crate) fn provider_for(&self, job: &Job) -> &Arc<dyn GenerationProvider> {
        if job.uses_fallback_provider() {
            &self.fallback
        } else {
            &self.primary
        }
    }

    /// Runs one step of the given job.
    ///
    /// Every failure path persists an outcome onto the job: `failed` with a
    /// message, or `pending_fallback` for structural provider errors on
    /// escalatable steps. Only store-level faults propagate to the caller.
    pub async fn run(&self, job_id: Uuid) -> Result<(), WorkerError> {
        let job = self.store.get(job_id).await?;

        if job.status.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "Job already terminal, ignoring invocation");
            return Ok(());
        }
        if job.status.is_awaiting_delegation() || job.status == JobStatus::PendingFallback {
            debug!(job_id = %job_id, status = %job.status, "Job is watchdog-driven, ignoring invocation");
            return Ok(());
        }
        if job.status == JobStatus::AwaitingFeedback && job.metadata.get("user_choice").is_none() {
            debug!(job_id = %job_id, "Awaiting user input, nothing to do");
            return Ok(());
        }

        let job = self
            .store
            .update(
                job_id,
                JobUpdate::new()
                    .with_status(JobStatus::Processing)
                    .clear_error(),
            )
            .await?;

        let step = job.step.clone().unwrap_or_else(|| "start".to_string());
        info!(
            job_id = %job_id,
            pipeline = %job.pipeline_type,
            step = %step,
            "Executing step"
        );

        let result = match job.pipeline_type {
            PipelineType::TryOnComposite => composite::execute_step(self, &job, &step).await,
            PipelineType::BatchRefine => refine::execute_refine_step(self, &job, &step).await,
            PipelineType::Reframe => refine::execute_reframe_step(self, &job, &step).await,
            PipelineType::AgentConversation => {
                return Err(WorkerError::WrongPipeline(job.pipeline_type))
            }
        };

        match result {
            Ok(outcome) => {
                self.store.update(job_id, outcome.update).await?;
                if outcome.invoke_next {
                    if let Err(e) = self.invoker.invoke(job_id).await {
                        // The step is persisted; staleness recovery resumes it.
                        warn!(job_id = %job_id, error = %e, "Self-invocation dispatch failed");
                    }
                }
                Ok(())
            }
            Err(e) => self.handle_step_failure(&job, &step, e).await,
        }
    }

    /// Routes a step failure: structural provider errors on escalatable
    /// steps transition to `pending_fallback` (the watchdog dispatches the
    /// fallback job); everything else fails the job with a message.
    async fn handle_step_failure(
        &self,
        job: &Job,
        step: &str,
        err: WorkerError,
    ) -> Result<(), WorkerError> {
        if err.is_structural()
            && !job.uses_fallback_provider()
            && is_escalatable_step(job.pipeline_type, step)
        {
            warn!(
                job_id = %job.id,
                step = %step,
                error = %err,
                "Primary provider structurally failed, queueing fallback"
            );
            self.store
                .update(
                    job.id,
                    JobUpdate::new()
                        .with_status(JobStatus::PendingFallback)
                        .with_error(format!("primary provider failed at {}: {}", step, err))
                        .with_metadata_patch(json!({ META_RESUME_STEP: step })),
                )
                .await?;
            return Ok(());
        }

        error!(job_id = %job.id, step = %step, error = %err, "Step failed");
        self.store
            .update(
                job.id,
                JobUpdate::new()
                    .with_status(JobStatus::Failed)
                    .with_error(format!("step {} failed: {}", step, err)),
            )
            .await?;
        Ok(())
    }
}

/// Steps whose structural provider failures escalate to the fallback
/// provider rather than failing the job.
fn is_escalatable_step(pipeline: PipelineType, step: &str) -> bool {
    match pipeline {
        PipelineType::TryOnComposite => {
            matches!(step, composite::STEP_GENERATE | composite::STEP_QUALITY)
        }
        _ => false,
    }
}

/// Pulls a required string key out of job metadata or fails the step with a
/// validation error.
pub(crate) fn require_meta_str(job: &Job, step: &str, key: &str) -> Result<String, WorkerError> {
    job.meta_str(key)
        .map(str::to_string)
        .ok_or_else(|| WorkerError::MissingMetadata {
            step: step.to_string(),
            key: key.to_string(),
        })
}
