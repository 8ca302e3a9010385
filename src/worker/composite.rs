//! Try-on composite pipeline.
//!
//! The canonical step machine:
//!
//! ```text
//! start → locate_subject_region → prepare_subject_asset →
//! prepare_reference_asset → generate_candidate → quality_check →
//! completeness_check → [await_user_choice | reframe] → done
//! ```
//!
//! The generate/quality loop is bounded by `max_quality_retries`; once the
//! pass counter exceeds the bound the scorer's verdict is overridden to
//! `select` and the override is recorded in `qa_history`. Candidate buffers
//! are cleared between passes so metadata does not accumulate stale URLs.

use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CompletenessFailurePolicy;
use crate::provider::{
    retry_transient, AnalyzeRequest, GenerateRequest, ScoreAction, ScoreRequest,
};
use crate::store::{Job, JobStatus, JobUpdate, PipelineType, META_DELEGATED_JOB_ID, META_PARENT_JOB_ID};

use super::{require_meta_str, StepOutcome, StepWorker, WorkerError};

pub const STEP_START: &str = "start";
pub const STEP_LOCATE: &str = "locate_subject_region";
pub const STEP_PREP_SUBJECT: &str = "prepare_subject_asset";
pub const STEP_PREP_REFERENCE: &str = "prepare_reference_asset";
pub const STEP_GENERATE: &str = "generate_candidate";
pub const STEP_QUALITY: &str = "quality_check";
pub const STEP_COMPLETENESS: &str = "completeness_check";
pub const STEP_AWAIT_CHOICE: &str = "await_user_choice";
pub const STEP_REFRAME: &str = "reframe";
pub const STEP_DONE: &str = "done";

/// Dispatches one composite step. Each handler is re-entry tolerant: inputs
/// come from persisted metadata and outputs go to fresh blob paths, so a
/// duplicate execution overwrites nothing and converges to the same state.
pub(crate) async fn execute_step(
    worker: &StepWorker,
    job: &Job,
    step: &str,
) -> Result<StepOutcome, WorkerError> {
    match step {
        STEP_START => start(job),
        STEP_LOCATE => locate_subject_region(worker, job).await,
        STEP_PREP_SUBJECT => prepare_asset(worker, job, step, "subject_url", "prepared_subject_url", STEP_PREP_REFERENCE).await,
        STEP_PREP_REFERENCE => prepare_asset(worker, job, step, "reference_url", "prepared_reference_url", STEP_GENERATE).await,
        STEP_GENERATE => generate_candidate(worker, job).await,
        STEP_QUALITY => quality_check(worker, job).await,
        STEP_COMPLETENESS => completeness_check(worker, job).await,
        STEP_AWAIT_CHOICE => await_user_choice(job),
        STEP_REFRAME => reframe(worker, job).await,
        STEP_DONE => Ok(done(job)),
        other => Err(WorkerError::UnknownStep {
            pipeline: job.pipeline_type,
            step: other.to_string(),
        }),
    }
}

/// Validates required inputs and seeds the quality pass counter.
fn start(job: &Job) -> Result<StepOutcome, WorkerError> {
    require_meta_str(job, STEP_START, "subject_url")?;
    require_meta_str(job, STEP_START, "reference_url")?;

    Ok(StepOutcome::advance(
        JobUpdate::new()
            .with_step(STEP_LOCATE)
            .with_metadata_patch(json!({ "qa_pass": 1 })),
    ))
}

/// Asks the analysis provider for the subject's bounding region.
async fn locate_subject_region(
    worker: &StepWorker,
    job: &Job,
) -> Result<StepOutcome, WorkerError> {
    let subject_url = require_meta_str(job, STEP_LOCATE, "subject_url")?;
    let provider = worker.provider_for(job);

    let request = AnalyzeRequest {
        image: subject_url,
        question_schema: json!({
            "type": "object",
            "properties": {
                "x": { "type": "number" },
                "y": { "type": "number" },
                "width": { "type": "number" },
                "height": { "type": "number" }
            },
            "required": ["x", "y", "width", "height"]
        }),
    };
    let region = retry_transient(
        worker.config.provider_max_retries,
        worker.config.provider_retry_delay,
        || provider.analyze(request.clone()),
    )
    .await?;

    Ok(StepOutcome::advance(
        JobUpdate::new()
            .with_step(STEP_PREP_SUBJECT)
            .with_metadata_patch(json!({ "subject_region": region })),
    ))
}

/// Stages an input asset into engine-owned storage under a fresh per-attempt
/// path and records the resulting URL.
async fn prepare_asset(
    worker: &StepWorker,
    job: &Job,
    step: &str,
    source_key: &str,
    target_key: &str,
    next_step: &str,
) -> Result<StepOutcome, WorkerError> {
    let source_url = require_meta_str(job, step, source_key)?;
    let data = worker.blobs.get(&source_url).await?;

    let path = format!("jobs/{}/{}_{}.png", job.id, source_key.trim_end_matches("_url"), Uuid::new_v4());
    let url = worker.blobs.put(&path, &data).await?;

    Ok(StepOutcome::advance(
        JobUpdate::new()
            .with_step(next_step)
            .with_metadata_patch(json!({ target_key: url })),
    ))
}

/// Generates candidate composites from the prepared assets. Carries the pass
/// counter and any scorer feedback from the previous pass.
async fn generate_candidate(worker: &StepWorker, job: &Job) -> Result<StepOutcome, WorkerError> {
    let subject = require_meta_str(job, STEP_GENERATE, "prepared_subject_url")?;
    let reference = require_meta_str(job, STEP_GENERATE, "prepared_reference_url")?;
    let provider = worker.provider_for(job);

    let pass = job.meta_u64("qa_pass").unwrap_or(1);
    let mut params = json!({ "pass": pass });
    if let Some(feedback) = job.meta_str("qa_feedback") {
        params["feedback"] = Value::String(feedback.to_string());
    }
    if let Some(region) = job.metadata.get("subject_region") {
        params["subject_region"] = region.clone();
    }

    let request = GenerateRequest::new(vec![subject, reference]).with_params(params);
    let response = retry_transient(
        worker.config.provider_max_retries,
        worker.config.provider_retry_delay,
        || provider.generate(request.clone()),
    )
    .await?;

    if response.candidates.is_empty() {
        return Err(WorkerError::InvalidResult(
            "provider returned no candidates".to_string(),
        ));
    }

    Ok(StepOutcome::advance(
        JobUpdate::new()
            .with_step(STEP_QUALITY)
            .with_metadata_patch(json!({ "candidates": response.candidates })),
    ))
}

/// Scores the current candidates and either loops back to generation or
/// selects a winner. The scorer's verdict is overridden to `select` once the
/// pass counter exceeds the retry bound; the override is recorded alongside
/// the original verdict in `qa_history`.
async fn quality_check(worker: &StepWorker, job: &Job) -> Result<StepOutcome, WorkerError> {
    let candidates: Vec<String> = job
        .metadata
        .get("candidates")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if candidates.is_empty() {
        return Err(WorkerError::InvalidResult(
            "no candidates available to score".to_string(),
        ));
    }

    let original = job
        .meta_str("prepared_subject_url")
        .or_else(|| job.meta_str("subject_url"))
        .map(str::to_string)
        .ok_or_else(|| WorkerError::MissingMetadata {
            step: STEP_QUALITY.to_string(),
            key: "subject_url".to_string(),
        })?;
    let reference = job
        .meta_str("prepared_reference_url")
        .or_else(|| job.meta_str("reference_url"))
        .map(str::to_string)
        .ok_or_else(|| WorkerError::MissingMetadata {
            step: STEP_QUALITY.to_string(),
            key: "reference_url".to_string(),
        })?;

    let provider = worker.provider_for(job);
    let request = ScoreRequest {
        original,
        reference,
        candidates: candidates.clone(),
    };
    let verdict = retry_transient(
        worker.config.provider_max_retries,
        worker.config.provider_retry_delay,
        || provider.score(request.clone()),
    )
    .await?;

    let pass = job.meta_u64("qa_pass").unwrap_or(1);
    let forced = verdict.action == ScoreAction::Retry
        && pass > u64::from(worker.config.max_quality_retries);
    let action = if forced { ScoreAction::Select } else { verdict.action };

    let mut qa_history = job
        .metadata
        .get("qa_history")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    qa_history.push(json!({
        "pass": pass,
        "action": action.to_string(),
        "provider_action": verdict.action.to_string(),
        "forced": forced,
        "best_index": verdict.best_index,
        "reasoning": verdict.reasoning,
    }));

    match action {
        ScoreAction::Retry => {
            info!(
                job_id = %job.id,
                pass = pass,
                "Quality check requested another generation pass"
            );
            Ok(StepOutcome::advance(
                JobUpdate::new().with_step(STEP_GENERATE).with_metadata_patch(json!({
                    "qa_history": qa_history,
                    "qa_feedback": verdict.reasoning,
                    "qa_pass": pass + 1,
                    "candidates": [],
                })),
            ))
        }
        ScoreAction::Select => {
            if verdict.best_index >= candidates.len() {
                return Err(WorkerError::InvalidResult(format!(
                    "best_index {} out of range for {} candidates",
                    verdict.best_index,
                    candidates.len()
                )));
            }
            if forced {
                warn!(
                    job_id = %job.id,
                    pass = pass,
                    "Quality retry bound exhausted, forcing selection"
                );
            }
            let selected = candidates[verdict.best_index].clone();
            Ok(StepOutcome::advance(
                JobUpdate::new().with_step(STEP_COMPLETENESS).with_metadata_patch(json!({
                    "qa_history": qa_history,
                    "selected_url": selected,
                    "candidates": [],
                })),
            ))
        }
    }
}

/// Optional post-selection check that the composite retained the subject
/// fully. Gated by the per-job `completeness_check` flag; analysis failures
/// follow the configured policy.
async fn completeness_check(worker: &StepWorker, job: &Job) -> Result<StepOutcome, WorkerError> {
    let selected = require_meta_str(job, STEP_COMPLETENESS, "selected_url")?;

    if !job.meta_flag("completeness_check") {
        return Ok(route_after_selection(job, &selected, Value::Null));
    }

    let provider = worker.provider_for(job);
    let request = AnalyzeRequest {
        image: selected.clone(),
        question_schema: json!({
            "type": "object",
            "properties": {
                "complete": { "type": "boolean" },
                "missing_regions": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["complete"]
        }),
    };
    let analysis = retry_transient(
        worker.config.provider_max_retries,
        worker.config.provider_retry_delay,
        || provider.analyze(request.clone()),
    )
    .await;

    match analysis {
        Ok(result) => Ok(route_after_selection(
            job,
            &selected,
            json!({ "completeness_result": result }),
        )),
        Err(e) => match worker.config.completeness_failure_policy {
            CompletenessFailurePolicy::Skip => {
                warn!(job_id = %job.id, error = %e, "Completeness analysis failed, continuing");
                Ok(route_after_selection(
                    job,
                    &selected,
                    json!({ "completeness_error": e.to_string() }),
                ))
            }
            CompletenessFailurePolicy::Fail => Err(e.into()),
        },
    }
}

/// Routes a selected composite onward: pause for user choice if requested,
/// delegate a reframe if a target aspect is set, otherwise finish.
fn route_after_selection(job: &Job, selected: &str, extra: Value) -> StepOutcome {
    let mut update = JobUpdate::new();
    if extra.is_object() {
        update = update.with_metadata_patch(extra);
    }

    if job.meta_flag("await_user_choice") {
        return StepOutcome::pause(
            update
                .with_status(JobStatus::AwaitingFeedback)
                .with_step(STEP_AWAIT_CHOICE),
        );
    }
    if job.meta_str("target_aspect").is_some() {
        return StepOutcome::advance(update.with_step(STEP_REFRAME));
    }
    StepOutcome::advance(
        update
            .with_step(STEP_DONE)
            .with_metadata_patch(json!({ "final_url": selected })),
    )
}

/// Resolves the user's verdict on the selected composite. Without input the
/// job stays parked; the next invocation after input resolves it.
fn await_user_choice(job: &Job) -> Result<StepOutcome, WorkerError> {
    let selected = require_meta_str(job, STEP_AWAIT_CHOICE, "selected_url")?;

    match job.meta_str("user_choice") {
        None => Ok(StepOutcome::pause(
            JobUpdate::new().with_status(JobStatus::AwaitingFeedback),
        )),
        Some("accept") => Ok(StepOutcome::advance(
            JobUpdate::new()
                .with_step(STEP_DONE)
                .with_metadata_patch(json!({ "final_url": selected })),
        )),
        Some("reframe") => Ok(StepOutcome::advance(
            JobUpdate::new().with_step(STEP_REFRAME),
        )),
        Some(other) => Err(WorkerError::InvalidResult(format!(
            "unrecognized user choice '{}'",
            other
        ))),
    }
}

/// Delegates the reframe to a child job and parks the parent. The parent
/// advances to `done` now; the watchdog copies the child's result across and
/// re-invokes once the child finishes.
async fn reframe(worker: &StepWorker, job: &Job) -> Result<StepOutcome, WorkerError> {
    let selected = require_meta_str(job, STEP_REFRAME, "selected_url")?;
    let aspect = require_meta_str(job, STEP_REFRAME, "target_aspect")?;

    let child = worker
        .store
        .create(
            PipelineType::Reframe,
            json!({
                "source_url": selected,
                "target_aspect": aspect,
                META_PARENT_JOB_ID: job.id.to_string(),
            }),
        )
        .await?;
    info!(job_id = %job.id, child_id = %child.id, "Delegating reframe to child job");

    if let Err(e) = worker.invoker.invoke(child.id).await {
        // Child is persisted as pending; staleness recovery dispatches it.
        warn!(job_id = %job.id, child_id = %child.id, error = %e, "Child dispatch failed");
    }

    Ok(StepOutcome::pause(
        JobUpdate::new()
            .with_status(JobStatus::AwaitingReframe)
            .with_step(STEP_DONE)
            .with_metadata_patch(json!({ META_DELEGATED_JOB_ID: child.id.to_string() })),
    ))
}

fn done(job: &Job) -> StepOutcome {
    info!(job_id = %job.id, "Composite pipeline complete");
    StepOutcome::pause(JobUpdate::new().with_status(JobStatus::Complete))
}
