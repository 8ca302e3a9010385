//! Dynamic toolset for the agent planner.
//!
//! The planner never sees a fixed tool list: each turn the registry filters
//! its tools through capability predicates over the job's current context, so
//! the model cannot choose an action the job cannot honor (e.g. try-on
//! without a reference asset).

use serde_json::json;

use crate::provider::ToolDef;
use crate::store::Job;

pub const TOOL_FINISH: &str = "finish";
pub const TOOL_ASK_USER: &str = "ask_user";
pub const TOOL_GENERATE_IMAGE: &str = "generate_image";
pub const TOOL_ANALYZE_BRAND: &str = "analyze_brand";
pub const TOOL_REFINE_IMAGE: &str = "refine_image";
pub const TOOL_START_TRY_ON: &str = "start_try_on";

/// Typed view of the job state the capability predicates inspect.
#[derive(Debug, Clone, Default)]
pub struct PlannerContext {
    /// Reference asset for try-on delegation, if the job carries one.
    pub reference_asset: Option<String>,
    /// Whether the selected model accepts a reference image.
    pub model_supports_reference: bool,
    /// Most recently produced image, target of refinement.
    pub last_image_url: Option<String>,
    /// Brand asset available for analysis.
    pub brand_asset: Option<String>,
}

impl PlannerContext {
    /// Builds the context from job metadata.
    pub fn from_job(job: &Job) -> Self {
        Self {
            reference_asset: job.meta_str("reference_url").map(str::to_string),
            model_supports_reference: job.meta_flag("model_supports_reference"),
            last_image_url: job.meta_str("last_image_url").map(str::to_string),
            brand_asset: job.meta_str("brand_asset_url").map(str::to_string),
        }
    }
}

struct RegisteredTool {
    def: ToolDef,
    available: fn(&PlannerContext) -> bool,
}

/// Registry of planner tools with per-turn capability filtering.
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Builds the standard registry.
    pub fn new() -> Self {
        let tools = vec![
            RegisteredTool {
                def: ToolDef::new(
                    TOOL_FINISH,
                    "Finish the conversation with a final result summary.",
                    json!({
                        "type": "object",
                        "properties": {
                            "summary": { "type": "string" }
                        },
                        "required": ["summary"]
                    }),
                ),
                available: |_| true,
            },
            RegisteredTool {
                def: ToolDef::new(
                    TOOL_ASK_USER,
                    "Ask the user a clarifying question and wait for their reply.",
                    json!({
                        "type": "object",
                        "properties": {
                            "question": { "type": "string" }
                        },
                        "required": ["question"]
                    }),
                ),
                available: |_| true,
            },
            RegisteredTool {
                def: ToolDef::new(
                    TOOL_GENERATE_IMAGE,
                    "Generate a new image from a text prompt.",
                    json!({
                        "type": "object",
                        "properties": {
                            "prompt": { "type": "string" }
                        },
                        "required": ["prompt"]
                    }),
                ),
                available: |_| true,
            },
            RegisteredTool {
                def: ToolDef::new(
                    TOOL_ANALYZE_BRAND,
                    "Extract palette and style cues from the job's brand asset.",
                    json!({
                        "type": "object",
                        "properties": {}
                    }),
                ),
                available: |ctx| ctx.brand_asset.is_some(),
            },
            RegisteredTool {
                def: ToolDef::new(
                    TOOL_REFINE_IMAGE,
                    "Refine the most recently generated image with new instructions.",
                    json!({
                        "type": "object",
                        "properties": {
                            "instructions": { "type": "string" }
                        },
                        "required": ["instructions"]
                    }),
                ),
                available: |ctx| ctx.last_image_url.is_some(),
            },
            RegisteredTool {
                def: ToolDef::new(
                    TOOL_START_TRY_ON,
                    "Run the virtual try-on pipeline against the reference asset.",
                    json!({
                        "type": "object",
                        "properties": {
                            "subject_url": { "type": "string" }
                        }
                    }),
                ),
                available: |ctx| ctx.reference_asset.is_some() && ctx.model_supports_reference,
            },
        ];
        Self { tools }
    }

    /// Returns the tools available in the given context.
    pub fn available(&self, ctx: &PlannerContext) -> Vec<ToolDef> {
        self.tools
            .iter()
            .filter(|t| (t.available)(ctx))
            .map(|t| t.def.clone())
            .collect()
    }

    /// Whether a tool is available in the given context.
    pub fn is_available(&self, name: &str, ctx: &PlannerContext) -> bool {
        self.tools
            .iter()
            .any(|t| t.def.name == name && (t.available)(ctx))
    }
}
