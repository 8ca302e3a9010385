//! Batch refine and reframe pipelines.
//!
//! Batch refine walks an item list one provider call per invocation with a
//! cursor in metadata, so a crash mid-batch loses at most one item's work.
//! Reframe is a single-shot transform, usually run as a delegated child of a
//! composite job.

use serde_json::{json, Value};
use tracing::info;

use crate::provider::{retry_transient, GenerateRequest};
use crate::store::{Job, JobStatus, JobUpdate};

use super::{require_meta_str, StepOutcome, StepWorker, WorkerError};

pub const STEP_START: &str = "start";
pub const STEP_REFINE_ITEM: &str = "refine_item";
pub const STEP_GENERATE_REFRAME: &str = "generate_reframe";
pub const STEP_DONE: &str = "done";

/// Dispatches one batch-refine step.
pub(crate) async fn execute_refine_step(
    worker: &StepWorker,
    job: &Job,
    step: &str,
) -> Result<StepOutcome, WorkerError> {
    match step {
        STEP_START => refine_start(job),
        STEP_REFINE_ITEM => refine_item(worker, job).await,
        STEP_DONE => Ok(done(job)),
        other => Err(WorkerError::UnknownStep {
            pipeline: job.pipeline_type,
            step: other.to_string(),
        }),
    }
}

/// Dispatches one reframe step.
pub(crate) async fn execute_reframe_step(
    worker: &StepWorker,
    job: &Job,
    step: &str,
) -> Result<StepOutcome, WorkerError> {
    match step {
        STEP_START => reframe_start(job),
        STEP_GENERATE_REFRAME => generate_reframe(worker, job).await,
        STEP_DONE => Ok(done(job)),
        other => Err(WorkerError::UnknownStep {
            pipeline: job.pipeline_type,
            step: other.to_string(),
        }),
    }
}

fn batch_items(job: &Job) -> Result<Vec<String>, WorkerError> {
    job.metadata
        .get("items")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .ok_or_else(|| WorkerError::MissingMetadata {
            step: STEP_START.to_string(),
            key: "items".to_string(),
        })
}

/// Validates the item list and seeds the cursor.
fn refine_start(job: &Job) -> Result<StepOutcome, WorkerError> {
    let items = batch_items(job)?;
    if items.is_empty() {
        return Err(WorkerError::InvalidResult(
            "batch refine requires at least one item".to_string(),
        ));
    }

    Ok(StepOutcome::advance(
        JobUpdate::new()
            .with_step(STEP_REFINE_ITEM)
            .with_metadata_patch(json!({ "cursor": 0, "refined": {} })),
    ))
}

/// Refines the item under the cursor. One provider call per invocation;
/// re-entry at the same cursor simply redoes that one item.
async fn refine_item(worker: &StepWorker, job: &Job) -> Result<StepOutcome, WorkerError> {
    let items = batch_items(job)?;
    let cursor = job.meta_u64("cursor").unwrap_or(0) as usize;
    if cursor >= items.len() {
        // The cursor already ran off the end; nothing left to refine.
        return Ok(StepOutcome::advance(JobUpdate::new().with_step(STEP_DONE)));
    }

    let provider = worker.provider_for(job);
    let mut params = json!({ "item_index": cursor });
    if let Some(instructions) = job.meta_str("instructions") {
        params["instructions"] = Value::String(instructions.to_string());
    }
    let request = GenerateRequest::new(vec![items[cursor].clone()]).with_params(params);
    let response = retry_transient(
        worker.config.provider_max_retries,
        worker.config.provider_retry_delay,
        || provider.generate(request.clone()),
    )
    .await?;
    let refined_url = response
        .candidates
        .first()
        .cloned()
        .ok_or_else(|| WorkerError::InvalidResult("provider returned no candidates".to_string()))?;

    let mut refined = job
        .metadata
        .get("refined")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    refined.insert(cursor.to_string(), Value::String(refined_url));

    let next_cursor = cursor + 1;
    let next_step = if next_cursor >= items.len() {
        STEP_DONE
    } else {
        STEP_REFINE_ITEM
    };
    info!(
        job_id = %job.id,
        item = cursor,
        total = items.len(),
        "Refined batch item"
    );

    Ok(StepOutcome::advance(
        JobUpdate::new()
            .with_step(next_step)
            .with_metadata_patch(json!({ "cursor": next_cursor, "refined": refined })),
    ))
}

fn reframe_start(job: &Job) -> Result<StepOutcome, WorkerError> {
    require_meta_str(job, STEP_START, "source_url")?;
    Ok(StepOutcome::advance(
        JobUpdate::new().with_step(STEP_GENERATE_REFRAME),
    ))
}

/// Runs the single reframe transform and records the result URL the parent's
/// delegation propagation copies across.
async fn generate_reframe(worker: &StepWorker, job: &Job) -> Result<StepOutcome, WorkerError> {
    let source = require_meta_str(job, STEP_GENERATE_REFRAME, "source_url")?;
    let provider = worker.provider_for(job);

    let mut params = json!({ "transform": "reframe" });
    if let Some(aspect) = job.meta_str("target_aspect") {
        params["target_aspect"] = Value::String(aspect.to_string());
    }
    let request = GenerateRequest::new(vec![source]).with_params(params);
    let response = retry_transient(
        worker.config.provider_max_retries,
        worker.config.provider_retry_delay,
        || provider.generate(request.clone()),
    )
    .await?;
    let result_url = response
        .candidates
        .first()
        .cloned()
        .ok_or_else(|| WorkerError::InvalidResult("provider returned no candidates".to_string()))?;

    Ok(StepOutcome::advance(
        JobUpdate::new()
            .with_step(STEP_DONE)
            .with_metadata_patch(json!({ "result_url": result_url })),
    ))
}

fn done(job: &Job) -> StepOutcome {
    info!(job_id = %job.id, pipeline = %job.pipeline_type, "Pipeline complete");
    StepOutcome::pause(JobUpdate::new().with_status(JobStatus::Complete))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use uuid::Uuid;

    use crate::blob::LocalBlobStore;
    use crate::config::EngineConfig;
    use crate::provider::{
        AnalyzeRequest, GenerateResponse, GenerationProvider, ProviderError, ScoreRequest,
        ScoreResponse,
    };
    use crate::store::{MemoryJobStore, PipelineType};
    use crate::worker::{InvokeError, Invoker};

    use super::*;

    #[derive(Default)]
    struct GenerateScript {
        responses: Mutex<VecDeque<Result<GenerateResponse, ProviderError>>>,
    }

    impl GenerateScript {
        fn push_candidates(&self, urls: &[&str]) {
            self.responses.lock().unwrap().push_back(Ok(GenerateResponse {
                candidates: urls.iter().map(|s| s.to_string()).collect(),
            }));
        }
    }

    #[async_trait]
    impl GenerationProvider for GenerateScript {
        async fn generate(
            &self,
            _request: GenerateRequest,
        ) -> Result<GenerateResponse, ProviderError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::Validation("script exhausted".into())))
        }

        async fn analyze(&self, _request: AnalyzeRequest) -> Result<Value, ProviderError> {
            Err(ProviderError::Validation("unused".into()))
        }

        async fn score(&self, _request: ScoreRequest) -> Result<ScoreResponse, ProviderError> {
            Err(ProviderError::Validation("unused".into()))
        }
    }

    struct NullInvoker;

    #[async_trait]
    impl Invoker for NullInvoker {
        async fn invoke(&self, _job_id: Uuid) -> Result<(), InvokeError> {
            Ok(())
        }
    }

    fn worker_with(provider: Arc<GenerateScript>) -> (StepWorker, tempfile::TempDir) {
        let blob_dir = tempfile::tempdir().expect("tempdir");
        let worker = StepWorker::new(
            Arc::new(MemoryJobStore::new()),
            provider.clone(),
            provider,
            Arc::new(LocalBlobStore::new(blob_dir.path())),
            Arc::new(EngineConfig::default().with_provider_retry_delay(Duration::from_millis(1))),
            Arc::new(NullInvoker),
        );
        (worker, blob_dir)
    }

    #[tokio::test]
    async fn test_refine_start_requires_items() {
        let (worker, _dir) = worker_with(Arc::new(GenerateScript::default()));
        let job = Job::new(PipelineType::BatchRefine, json!({}));

        let err = execute_refine_step(&worker, &job, STEP_START).await.unwrap_err();
        assert!(matches!(err, WorkerError::MissingMetadata { ref key, .. } if key == "items"));

        let job = Job::new(PipelineType::BatchRefine, json!({"items": []}));
        let err = execute_refine_step(&worker, &job, STEP_START).await.unwrap_err();
        assert!(matches!(err, WorkerError::InvalidResult(_)));
    }

    #[tokio::test]
    async fn test_refine_item_advances_cursor() {
        let provider = Arc::new(GenerateScript::default());
        provider.push_candidates(&["blob://refined_0.png"]);
        let (worker, _dir) = worker_with(provider);
        let job = Job::new(
            PipelineType::BatchRefine,
            json!({
                "items": ["blob://a.png", "blob://b.png"],
                "cursor": 0,
                "refined": {}
            }),
        );

        let outcome = execute_refine_step(&worker, &job, STEP_REFINE_ITEM)
            .await
            .expect("refine");
        assert_eq!(outcome.update.step, Some(Some(STEP_REFINE_ITEM.to_string())));
        let patch = outcome.update.metadata_patch.expect("patch");
        assert_eq!(patch["cursor"], 1);
        assert_eq!(patch["refined"]["0"], "blob://refined_0.png");
    }

    #[tokio::test]
    async fn test_refine_last_item_moves_to_done() {
        let provider = Arc::new(GenerateScript::default());
        provider.push_candidates(&["blob://refined_1.png"]);
        let (worker, _dir) = worker_with(provider);
        let job = Job::new(
            PipelineType::BatchRefine,
            json!({
                "items": ["blob://a.png", "blob://b.png"],
                "cursor": 1,
                "refined": {"0": "blob://refined_0.png"}
            }),
        );

        let outcome = execute_refine_step(&worker, &job, STEP_REFINE_ITEM)
            .await
            .expect("refine");
        assert_eq!(outcome.update.step, Some(Some(STEP_DONE.to_string())));
        let patch = outcome.update.metadata_patch.expect("patch");
        assert_eq!(patch["refined"]["0"], "blob://refined_0.png");
        assert_eq!(patch["refined"]["1"], "blob://refined_1.png");
    }

    #[tokio::test]
    async fn test_refine_done_completes() {
        let (worker, _dir) = worker_with(Arc::new(GenerateScript::default()));
        let job = Job::new(PipelineType::BatchRefine, json!({"items": ["blob://a.png"]}));

        let outcome = execute_refine_step(&worker, &job, STEP_DONE).await.expect("done");
        assert!(!outcome.invoke_next);
        assert_eq!(outcome.update.status, Some(JobStatus::Complete));
    }

    #[tokio::test]
    async fn test_reframe_records_result_url() {
        let provider = Arc::new(GenerateScript::default());
        provider.push_candidates(&["blob://reframed.png"]);
        let (worker, _dir) = worker_with(provider);
        let job = Job::new(
            PipelineType::Reframe,
            json!({"source_url": "blob://src.png", "target_aspect": "1:1"}),
        );

        let outcome = execute_reframe_step(&worker, &job, STEP_GENERATE_REFRAME)
            .await
            .expect("reframe");
        assert_eq!(outcome.update.step, Some(Some(STEP_DONE.to_string())));
        let patch = outcome.update.metadata_patch.expect("patch");
        assert_eq!(patch["result_url"], "blob://reframed.png");
    }

    #[tokio::test]
    async fn test_unknown_step_rejected() {
        let (worker, _dir) = worker_with(Arc::new(GenerateScript::default()));
        let job = Job::new(PipelineType::Reframe, json!({"source_url": "blob://s.png"}));

        let err = execute_reframe_step(&worker, &job, "quality_check").await.unwrap_err();
        assert!(matches!(err, WorkerError::UnknownStep { .. }));
    }
}
