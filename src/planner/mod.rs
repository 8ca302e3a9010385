//! Agent planner loop.
//!
//! One planner decision per invocation: reconstruct the conversation from
//! persisted history, offer the dynamically-filtered toolset, demand exactly
//! one tool call, and execute it. The tool-call turn is appended to history
//! BEFORE the tool executes, so a crash mid-tool leaves a transcript the next
//! invocation can resume from instead of silently replaying the decision.

pub mod tools;

use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::provider::{
    retry_transient, AnalyzeRequest, GenerateRequest, GenerationProvider, PlannerProvider,
    PlannerRequest, ProviderError, ToolCall,
};
use crate::store::{
    Job, JobStatus, JobStore, JobUpdate, PipelineType, StoreError, Turn, META_DELEGATED_JOB_ID,
    META_PARENT_JOB_ID,
};
use crate::worker::Invoker;

pub use tools::{PlannerContext, ToolRegistry};

const SYSTEM_PROMPT: &str = "You are a creative production assistant. Work toward \
the user's goal one tool call at a time. Always respond with exactly one tool \
call from the offered set; call `finish` when the goal is met.";

/// Errors that can occur during a planner turn.
#[derive(Debug, Error)]
pub enum PlannerError {
    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Provider call failed after retries.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// The planner answered without a tool call.
    #[error("Planner returned no tool call")]
    NoToolCall,

    /// The planner chose a tool outside the offered set.
    #[error("Tool '{0}' is not available for this job")]
    UnavailableTool(String),

    /// A tool call is missing a required argument or context value.
    #[error("Tool '{tool}' requires '{key}'")]
    MissingArgument { tool: String, key: String },

    /// The job belongs to the step worker, not the planner.
    #[error("Pipeline {0} is not a planner pipeline")]
    WrongPipeline(PipelineType),
}

/// Drives one planner decision per invocation for agent conversation jobs.
pub struct PlannerLoop {
    store: Arc<dyn JobStore>,
    planner: Arc<dyn PlannerProvider>,
    generation: Arc<dyn GenerationProvider>,
    tools: Arc<ToolRegistry>,
    config: Arc<EngineConfig>,
    invoker: Arc<dyn Invoker>,
}

impl PlannerLoop {
    /// Creates a planner loop over the given collaborators.
    pub fn new(
        store: Arc<dyn JobStore>,
        planner: Arc<dyn PlannerProvider>,
        generation: Arc<dyn GenerationProvider>,
        tools: Arc<ToolRegistry>,
        config: Arc<EngineConfig>,
        invoker: Arc<dyn Invoker>,
    ) -> Self {
        Self {
            store,
            planner,
            generation,
            tools,
            config,
            invoker,
        }
    }

    /// Runs one planner turn, persisting any turn-level failure onto the job.
    /// Only store-level faults propagate to the caller.
    pub async fn run(&self, job_id: Uuid) -> Result<(), PlannerError> {
        match self.turn(job_id).await {
            Ok(()) => Ok(()),
            // Routing and store faults are caller bugs/outages, not job
            // failures; do not mark the job on them.
            Err(e @ (PlannerError::Store(_) | PlannerError::WrongPipeline(_))) => Err(e),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Planner turn failed");
                self.store
                    .update(
                        job_id,
                        JobUpdate::new()
                            .with_status(JobStatus::Failed)
                            .with_error(format!("planner turn failed: {}", e)),
                    )
                    .await?;
                Ok(())
            }
        }
    }

    async fn turn(&self, job_id: Uuid) -> Result<(), PlannerError> {
        let job = self.store.get(job_id).await?;
        if job.pipeline_type != PipelineType::AgentConversation {
            return Err(PlannerError::WrongPipeline(job.pipeline_type));
        }
        if job.status.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "Job already terminal, ignoring invocation");
            return Ok(());
        }
        if job.status.is_awaiting_delegation() || job.status == JobStatus::PendingFallback {
            debug!(job_id = %job_id, status = %job.status, "Job is watchdog-driven, ignoring invocation");
            return Ok(());
        }

        // A parked clarification resumes only once the user has replied.
        if job.status == JobStatus::AwaitingFeedback {
            match job.meta_str("user_reply") {
                Some(reply) => {
                    let reply = reply.to_string();
                    self.store
                        .append_history(job_id, vec![Turn::user(reply)])
                        .await?;
                    self.store
                        .update(
                            job_id,
                            JobUpdate::new().with_metadata_patch(json!({ "user_reply": null })),
                        )
                        .await?;
                }
                None => {
                    debug!(job_id = %job_id, "Awaiting user reply, nothing to do");
                    return Ok(());
                }
            }
        }

        let mut job = self
            .store
            .update(
                job_id,
                JobUpdate::new()
                    .with_status(JobStatus::Processing)
                    .clear_error(),
            )
            .await?;

        // First invocation: seed the transcript from the submitted goal.
        if job.history.is_empty() {
            match job.meta_str("user_input") {
                Some(input) => {
                    let input = input.to_string();
                    job = self.store.append_history(job_id, vec![Turn::user(input)]).await?;
                }
                None => {
                    return Err(PlannerError::MissingArgument {
                        tool: "conversation".to_string(),
                        key: "user_input".to_string(),
                    })
                }
            }
        }

        let ctx = PlannerContext::from_job(&job);
        let offered = self.tools.available(&ctx);
        let request = PlannerRequest {
            system: SYSTEM_PROMPT.to_string(),
            history: job.history.clone(),
            tools: offered,
        };
        let response = retry_transient(
            self.config.planner_max_retries,
            self.config.planner_retry_delay,
            || self.planner.plan(request.clone()),
        )
        .await?;

        let call = response.tool_call.ok_or(PlannerError::NoToolCall)?;
        if !self.tools.is_available(&call.name, &ctx) {
            return Err(PlannerError::UnavailableTool(call.name));
        }
        info!(job_id = %job_id, tool = %call.name, "Planner chose tool");

        // Persist the decision before acting on it.
        self.store
            .append_history(job_id, vec![Turn::tool_call(&call.name, call.arguments.clone())])
            .await?;

        self.execute_tool(&job, &ctx, call).await
    }

    async fn execute_tool(
        &self,
        job: &Job,
        ctx: &PlannerContext,
        call: ToolCall,
    ) -> Result<(), PlannerError> {
        match call.name.as_str() {
            tools::TOOL_FINISH => {
                let summary = require_arg(&call, "summary")?;
                self.store
                    .update(
                        job.id,
                        JobUpdate::new()
                            .with_status(JobStatus::Complete)
                            .with_metadata_patch(json!({ "final_result": summary })),
                    )
                    .await?;
                info!(job_id = %job.id, "Conversation finished");
                Ok(())
            }
            tools::TOOL_ASK_USER => {
                let question = require_arg(&call, "question")?;
                self.store
                    .update(
                        job.id,
                        JobUpdate::new()
                            .with_status(JobStatus::AwaitingFeedback)
                            .with_metadata_patch(json!({ "pending_question": question })),
                    )
                    .await?;
                Ok(())
            }
            tools::TOOL_ANALYZE_BRAND => {
                let asset = ctx.brand_asset.clone().ok_or_else(|| {
                    PlannerError::MissingArgument {
                        tool: call.name.clone(),
                        key: "brand_asset_url".to_string(),
                    }
                })?;
                let request = AnalyzeRequest {
                    image: asset,
                    question_schema: json!({
                        "type": "object",
                        "properties": {
                            "palette": { "type": "array", "items": { "type": "string" } },
                            "style": { "type": "string" }
                        }
                    }),
                };
                let profile = retry_transient(
                    self.config.provider_max_retries,
                    self.config.provider_retry_delay,
                    || self.generation.analyze(request.clone()),
                )
                .await?;

                self.store
                    .append_history(job.id, vec![Turn::tool_result(&call.name, profile.clone())])
                    .await?;
                self.store
                    .update(
                        job.id,
                        JobUpdate::new().with_metadata_patch(json!({ "brand_profile": profile })),
                    )
                    .await?;
                self.continue_loop(job.id).await;
                Ok(())
            }
            tools::TOOL_GENERATE_IMAGE => {
                let prompt = require_arg(&call, "prompt")?;
                let url = self
                    .generate_one(vec![], json!({ "prompt": prompt }))
                    .await?;
                self.record_image(job.id, &call.name, &url).await?;
                self.continue_loop(job.id).await;
                Ok(())
            }
            tools::TOOL_REFINE_IMAGE => {
                let instructions = require_arg(&call, "instructions")?;
                let source = ctx.last_image_url.clone().ok_or_else(|| {
                    PlannerError::MissingArgument {
                        tool: call.name.clone(),
                        key: "last_image_url".to_string(),
                    }
                })?;
                let url = self
                    .generate_one(vec![source], json!({ "instructions": instructions }))
                    .await?;
                self.record_image(job.id, &call.name, &url).await?;
                self.continue_loop(job.id).await;
                Ok(())
            }
            tools::TOOL_START_TRY_ON => {
                let subject = call
                    .arguments
                    .get("subject_url")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| ctx.last_image_url.clone())
                    .ok_or_else(|| PlannerError::MissingArgument {
                        tool: call.name.clone(),
                        key: "subject_url".to_string(),
                    })?;
                let reference = ctx.reference_asset.clone().ok_or_else(|| {
                    PlannerError::MissingArgument {
                        tool: call.name.clone(),
                        key: "reference_url".to_string(),
                    }
                })?;

                let child = self
                    .store
                    .create(
                        PipelineType::TryOnComposite,
                        json!({
                            "subject_url": subject,
                            "reference_url": reference,
                            META_PARENT_JOB_ID: job.id.to_string(),
                        }),
                    )
                    .await?;
                self.store
                    .update(
                        job.id,
                        JobUpdate::new()
                            .with_status(JobStatus::AwaitingGeneration)
                            .with_metadata_patch(
                                json!({ META_DELEGATED_JOB_ID: child.id.to_string() }),
                            ),
                    )
                    .await?;
                info!(job_id = %job.id, child_id = %child.id, "Delegating try-on to child job");

                if let Err(e) = self.invoker.invoke(child.id).await {
                    // Child is persisted as pending; staleness recovery
                    // dispatches it.
                    warn!(job_id = %job.id, child_id = %child.id, error = %e, "Child dispatch failed");
                }
                Ok(())
            }
            other => Err(PlannerError::UnavailableTool(other.to_string())),
        }
    }

    async fn generate_one(
        &self,
        assets: Vec<String>,
        params: Value,
    ) -> Result<String, PlannerError> {
        let request = GenerateRequest::new(assets).with_params(params);
        let response = retry_transient(
            self.config.provider_max_retries,
            self.config.provider_retry_delay,
            || self.generation.generate(request.clone()),
        )
        .await?;
        response
            .candidates
            .first()
            .cloned()
            .ok_or_else(|| {
                PlannerError::Provider(ProviderError::Validation(
                    "provider returned no candidates".to_string(),
                ))
            })
    }

    async fn record_image(
        &self,
        job_id: Uuid,
        tool: &str,
        url: &str,
    ) -> Result<(), PlannerError> {
        self.store
            .append_history(job_id, vec![Turn::tool_result(tool, json!({ "image_url": url }))])
            .await?;
        self.store
            .update(
                job_id,
                JobUpdate::new().with_metadata_patch(json!({ "last_image_url": url })),
            )
            .await?;
        Ok(())
    }

    /// Fires the next planner turn. Dispatch failures are left to staleness
    /// recovery; the tool's result is already persisted.
    async fn continue_loop(&self, job_id: Uuid) {
        if let Err(e) = self.invoker.invoke(job_id).await {
            warn!(job_id = %job_id, error = %e, "Self-invocation dispatch failed");
        }
    }
}

fn require_arg(call: &ToolCall, key: &str) -> Result<String, PlannerError> {
    call.arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| PlannerError::MissingArgument {
            tool: call.name.clone(),
            key: key.to_string(),
        })
}
