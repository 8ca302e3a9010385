//! Job definitions for the orchestration engine.
//!
//! This module defines the central `Job` entity and its supporting types:
//!
//! - `Job`: One row per pipeline instance, polymorphic over pipeline type
//! - `PipelineType`: Tag selecting which step-machine definition applies
//! - `JobStatus`: Lifecycle status including awaiting/terminal states
//! - `Turn`: A single conversation turn for planner-loop jobs
//! - `JobUpdate`: Partial-field update applied by the store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Metadata key holding the id of a delegated child job.
pub const META_DELEGATED_JOB_ID: &str = "delegated_job_id";

/// Metadata key holding the id of the parent that delegated to this job.
pub const META_PARENT_JOB_ID: &str = "parent_job_id";

/// Metadata key marking a job that must use the fallback provider.
pub const META_USE_FALLBACK: &str = "use_fallback_provider";

/// Metadata key recording the step a fallback job should resume from.
pub const META_RESUME_STEP: &str = "resume_step";

/// Category of job defining its step DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    /// Multi-stage virtual try-on compositing pipeline.
    TryOnComposite,
    /// Conversational agent planner loop.
    AgentConversation,
    /// Sequential per-item image refinement.
    BatchRefine,
    /// Single-shot reframe transform, usually run as a delegated child.
    Reframe,
}

impl PipelineType {
    /// All registered pipeline types, in watchdog scan order.
    pub const ALL: [PipelineType; 4] = [
        PipelineType::TryOnComposite,
        PipelineType::AgentConversation,
        PipelineType::BatchRefine,
        PipelineType::Reframe,
    ];

    /// Returns the wire/database representation of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineType::TryOnComposite => "try_on_composite",
            PipelineType::AgentConversation => "agent_conversation",
            PipelineType::BatchRefine => "batch_refine",
            PipelineType::Reframe => "reframe",
        }
    }

    /// Parses a pipeline type from its wire representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "try_on_composite" => Some(PipelineType::TryOnComposite),
            "agent_conversation" => Some(PipelineType::AgentConversation),
            "batch_refine" => Some(PipelineType::BatchRefine),
            "reframe" => Some(PipelineType::Reframe),
            _ => None,
        }
    }
}

impl std::fmt::Display for PipelineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a job.
///
/// `Awaiting*` statuses mean the job is blocked on a delegated child job or
/// external input and is progressed by the watchdog rather than by its own
/// worker. Terminal statuses are never re-claimed or re-scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, waiting for intake.
    Pending,
    /// Atomically claimed for execution, worker not yet started.
    Claimed,
    /// A worker is actively progressing this job.
    Processing,
    /// Blocked on a delegated reframe child job.
    AwaitingReframe,
    /// Blocked on a delegated generation child job (planner loop).
    AwaitingGeneration,
    /// Blocked on user input.
    AwaitingFeedback,
    /// Blocked on a dispatched fallback child job.
    AwaitingFallback,
    /// Primary provider structurally failed; fallback dispatch pending.
    PendingFallback,
    /// Finished successfully.
    Complete,
    /// Finished with an error.
    Failed,
    /// Failed on both primary and fallback paths.
    PermanentlyFailed,
}

impl JobStatus {
    /// Returns whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::PermanentlyFailed
        )
    }

    /// Returns whether this status means the job is blocked on a child job.
    pub fn is_awaiting_delegation(&self) -> bool {
        matches!(
            self,
            JobStatus::AwaitingReframe | JobStatus::AwaitingGeneration | JobStatus::AwaitingFallback
        )
    }

    /// Statuses eligible for stale-job recovery.
    ///
    /// Awaiting states are excluded: they are progressed by delegation
    /// propagation or user input, not by re-invoking the worker.
    pub fn is_stale_eligible(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Claimed | JobStatus::Processing
        )
    }

    /// Returns the wire/database representation of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Processing => "processing",
            JobStatus::AwaitingReframe => "awaiting_reframe",
            JobStatus::AwaitingGeneration => "awaiting_generation",
            JobStatus::AwaitingFeedback => "awaiting_feedback",
            JobStatus::AwaitingFallback => "awaiting_fallback",
            JobStatus::PendingFallback => "pending_fallback",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
            JobStatus::PermanentlyFailed => "permanently_failed",
        }
    }

    /// Parses a status from its wire representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "claimed" => Some(JobStatus::Claimed),
            "processing" => Some(JobStatus::Processing),
            "awaiting_reframe" => Some(JobStatus::AwaitingReframe),
            "awaiting_generation" => Some(JobStatus::AwaitingGeneration),
            "awaiting_feedback" => Some(JobStatus::AwaitingFeedback),
            "awaiting_fallback" => Some(JobStatus::AwaitingFallback),
            "pending_fallback" => Some(JobStatus::PendingFallback),
            "complete" => Some(JobStatus::Complete),
            "failed" => Some(JobStatus::Failed),
            "permanently_failed" => Some(JobStatus::PermanentlyFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Role of a conversation turn in a planner-loop job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    /// Input from the user.
    User,
    /// A tool call chosen by the planner.
    ToolCall,
    /// The result of executing a tool.
    ToolResult,
}

/// A single conversation turn. History is append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Who produced this turn.
    pub role: TurnRole,
    /// Turn payload. Shape depends on the role: plain text for user turns,
    /// `{name, arguments}` for tool calls, `{name, result}` for tool results.
    pub content: Value,
    /// When the turn was recorded.
    pub at: DateTime<Utc>,
}

impl Turn {
    /// Creates a user input turn.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: Value::String(text.into()),
            at: Utc::now(),
        }
    }

    /// Creates a planner tool-call turn.
    pub fn tool_call(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            role: TurnRole::ToolCall,
            content: json!({ "name": name.into(), "arguments": arguments }),
            at: Utc::now(),
        }
    }

    /// Creates a tool-result turn.
    pub fn tool_result(name: impl Into<String>, result: Value) -> Self {
        Self {
            role: TurnRole::ToolResult,
            content: json!({ "name": name.into(), "result": result }),
            at: Utc::now(),
        }
    }
}

/// The central entity: one row per pipeline instance.
///
/// Mutated exclusively through worker invocations and the watchdog's
/// claim/propagation logic. Never deleted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, assigned at creation, immutable.
    pub id: Uuid,
    /// Which step-machine definition applies.
    pub pipeline_type: PipelineType,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Name of the next step for step-machines; `None` for planner jobs.
    pub step: Option<String>,
    /// Open, pipeline-specific state bag (always a JSON object). Steps read
    /// the keys they need and write back a merged superset.
    pub metadata: Value,
    /// Conversation history for planner jobs, append-only.
    #[serde(default)]
    pub history: Vec<Turn>,
    /// Set on failure, cleared on successful retry.
    pub error_message: Option<String>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// Staleness clock: every successful write bumps this.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Creates a new pending job.
    ///
    /// Non-object metadata is replaced with an empty object so step handlers
    /// can always merge into it.
    pub fn new(pipeline_type: PipelineType, metadata: Value) -> Self {
        let metadata = if metadata.is_object() {
            metadata
        } else {
            json!({})
        };
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            pipeline_type,
            status: JobStatus::Pending,
            step: None,
            metadata,
            history: Vec::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns a string-valued metadata key, if present.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Returns an unsigned-integer metadata key, if present.
    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(Value::as_u64)
    }

    /// Returns a boolean metadata key, defaulting to `false`.
    pub fn meta_flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Returns the id of the delegated child job, if one is recorded.
    pub fn delegated_job_id(&self) -> Option<Uuid> {
        self.meta_str(META_DELEGATED_JOB_ID)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Returns the parent job id, if this job was delegated.
    pub fn parent_job_id(&self) -> Option<Uuid> {
        self.meta_str(META_PARENT_JOB_ID)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Whether this job must use the fallback provider.
    pub fn uses_fallback_provider(&self) -> bool {
        self.meta_flag(META_USE_FALLBACK)
    }
}

/// Shallow-merges a JSON object patch into a target object.
///
/// Keys present in the patch overwrite the target (last-writer-wins); keys
/// absent from the patch are left untouched. Used by both store backends so
/// steps never truncate unrelated metadata.
pub fn merge_metadata(target: &mut Value, patch: &Value) {
    if !target.is_object() {
        *target = json!({});
    }
    if let (Some(target_map), Some(patch_map)) = (target.as_object_mut(), patch.as_object()) {
        for (key, value) in patch_map {
            target_map.insert(key.clone(), value.clone());
        }
    }
}

/// Partial-field update applied atomically by the store.
///
/// Unset fields are left unchanged. `updated_at` is always bumped.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    /// New status, if changing.
    pub status: Option<JobStatus>,
    /// New step, if changing. `Some(None)` clears the step.
    pub step: Option<Option<String>>,
    /// Object shallow-merged into `metadata`.
    pub metadata_patch: Option<Value>,
    /// New error message. `Some(None)` clears it.
    pub error_message: Option<Option<String>>,
}

impl JobUpdate {
    /// Creates an empty update (bumps `updated_at` only).
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the status.
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the step name.
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(Some(step.into()));
        self
    }

    /// Clears the step name.
    pub fn clear_step(mut self) -> Self {
        self.step = Some(None);
        self
    }

    /// Merges the given object into the job's metadata.
    pub fn with_metadata_patch(mut self, patch: Value) -> Self {
        self.metadata_patch = Some(patch);
        self
    }

    /// Sets the error message.
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(Some(message.into()));
        self
    }

    /// Clears the error message.
    pub fn clear_error(mut self) -> Self {
        self.error_message = Some(None);
        self
    }

    /// Applies this update to an in-memory job, bumping `updated_at`.
    pub fn apply(&self, job: &mut Job) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(ref step) = self.step {
            job.step = step.clone();
        }
        if let Some(ref patch) = self.metadata_patch {
            merge_metadata(&mut job.metadata, patch);
        }
        if let Some(ref error) = self.error_message {
            job.error_message = error.clone();
        }
        job.updated_at = Utc::now();
    }
}
