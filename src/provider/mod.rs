//! Generation Provider contracts.
//!
//! Every external AI model (image generation, segmentation/analysis,
//! quality scoring, planning) is abstracted behind a uniform
//! request/response contract:
//!
//! - `GenerationProvider`: generate / analyze / score
//! - `PlannerProvider`: one tool-calling planner decision per call
//!
//! Provider failures are classified as *transient* (retry within the same
//! step), *structural* (the provider is unusable; trigger escalation to a
//! fallback), or *validation* (malformed response; fail immediately, since
//! retrying would reproduce the same input).

pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::store::Turn;

pub use http::{HttpGenerationProvider, HttpPlannerProvider};

/// Errors that can occur during provider calls.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Temporary failure: rate limit, 5xx, connection reset. Retry in-step.
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// The provider is unusable for this request. Triggers escalation.
    #[error("Structural provider error: {0}")]
    Structural(String),

    /// The provider answered, but the response is malformed. No retry.
    #[error("Invalid provider response: {0}")]
    Validation(String),

    /// The call exceeded its bounded timeout. Treated as transient.
    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    /// Whether this error should be retried within the same step.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_) | ProviderError::Timeout(_))
    }

    /// Whether this error should escalate to the fallback provider.
    pub fn is_structural(&self) -> bool {
        matches!(self, ProviderError::Structural(_))
    }
}

/// Request to generate candidate outputs from input assets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// URLs of input assets (subject, reference, source image).
    pub input_assets: Vec<String>,
    /// Provider-specific generation parameters.
    pub params: Value,
}

impl GenerateRequest {
    /// Creates a request from input asset URLs.
    pub fn new(input_assets: Vec<String>) -> Self {
        Self {
            input_assets,
            params: Value::Object(serde_json::Map::new()),
        }
    }

    /// Sets generation parameters.
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// Candidate outputs produced by a generate call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    /// URLs of the generated candidates.
    pub candidates: Vec<String>,
}

/// Request to analyze an image against a structured question schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    /// URL of the image to analyze.
    pub image: String,
    /// Schema describing the structured answer expected back.
    pub question_schema: Value,
}

/// Decision returned by the quality scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreAction {
    /// Regenerate with adjusted parameters.
    Retry,
    /// Accept the candidate at `best_index`.
    Select,
}

impl std::fmt::Display for ScoreAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScoreAction::Retry => write!(f, "retry"),
            ScoreAction::Select => write!(f, "select"),
        }
    }
}

/// Request to score candidates against the originals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRequest {
    /// URL of the original subject asset.
    pub original: String,
    /// URL of the reference asset.
    pub reference: String,
    /// Candidate URLs to score.
    pub candidates: Vec<String>,
}

/// Scoring verdict for a set of candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreResponse {
    /// Whether to retry generation or select a candidate.
    pub action: ScoreAction,
    /// Index of the best candidate.
    pub best_index: usize,
    /// Scorer's explanation, persisted for audit.
    pub reasoning: String,
}

/// External collaborator performing AI inference behind a uniform contract.
///
/// All calls are synchronous from within a single step and carry a bounded
/// timeout in the implementation.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Generates candidate outputs from the given assets.
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, ProviderError>;

    /// Analyzes an image and returns a structured result matching the schema.
    async fn analyze(&self, request: AnalyzeRequest) -> Result<Value, ProviderError>;

    /// Scores candidates against the originals.
    async fn score(&self, request: ScoreRequest) -> Result<ScoreResponse, ProviderError>;
}

/// A tool the planner may call this turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    /// Tool name, matched by the dispatch table.
    pub name: String,
    /// Natural-language description shown to the planner.
    pub description: String,
    /// JSON schema of the tool's arguments.
    pub parameters: Value,
}

impl ToolDef {
    /// Creates a tool definition.
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A tool call chosen by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Name of the chosen tool.
    pub name: String,
    /// Arguments for the call.
    pub arguments: Value,
}

/// Request for one planner decision.
#[derive(Debug, Clone, Serialize)]
pub struct PlannerRequest {
    /// System instructions for the planner.
    pub system: String,
    /// Full conversation history.
    pub history: Vec<Turn>,
    /// Tools available this turn.
    pub tools: Vec<ToolDef>,
}

/// One planner decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerResponse {
    /// The tool call, if the planner made one. Exactly one is required by
    /// the loop; its absence is planner non-compliance.
    pub tool_call: Option<ToolCall>,
    /// Free-text commentary alongside the call, if any.
    pub text: Option<String>,
}

/// Planner model behind a tool-calling contract.
#[async_trait]
pub trait PlannerProvider: Send + Sync {
    /// Asks the planner for its next tool call.
    async fn plan(&self, request: PlannerRequest) -> Result<PlannerResponse, ProviderError>;
}

/// Retries an operation on transient errors with a fixed delay.
///
/// Non-transient errors return immediately. Exhausting `max_attempts`
/// returns the last transient error to the caller, which escalates or fails
/// per its own policy.
pub async fn retry_transient<T, F, Fut>(
    max_attempts: u32,
    delay: Duration,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                tracing::warn!(
                    attempt = attempt,
                    max_attempts = max_attempts,
                    error = %e,
                    "Transient provider error, retrying"
                );
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ProviderError::Transient("429".into()).is_transient());
        assert!(ProviderError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(!ProviderError::Structural("model gone".into()).is_transient());
        assert!(ProviderError::Structural("model gone".into()).is_structural());
        assert!(!ProviderError::Validation("bad json".into()).is_transient());
        assert!(!ProviderError::Validation("bad json".into()).is_structural());
    }

    #[test]
    fn test_score_action_serde() {
        let json = serde_json::to_string(&ScoreAction::Retry).expect("serialize");
        assert_eq!(json, "\"retry\"");
        let parsed: ScoreAction = serde_json::from_str("\"select\"").expect("deserialize");
        assert_eq!(parsed, ScoreAction::Select);
    }

    #[test]
    fn test_generate_request_builder() {
        let request = GenerateRequest::new(vec!["a.png".to_string()])
            .with_params(serde_json::json!({"pass": 2}));
        assert_eq!(request.input_assets, vec!["a.png"]);
        assert_eq!(request.params["pass"], 2);
    }

    #[tokio::test]
    async fn test_retry_transient_recovers() {
        let mut calls = 0u32;
        let result = retry_transient(3, Duration::from_millis(1), || {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt < 3 {
                    Err(ProviderError::Transient("flaky".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.expect("should recover"), 3);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_retry_transient_exhausts_bound() {
        let mut calls = 0u32;
        let result: Result<(), _> = retry_transient(2, Duration::from_millis(1), || {
            calls += 1;
            async { Err(ProviderError::Timeout(Duration::from_secs(1))) }
        })
        .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_retry_transient_stops_on_structural() {
        let mut calls = 0u32;
        let result: Result<(), _> = retry_transient(5, Duration::from_millis(1), || {
            calls += 1;
            async { Err(ProviderError::Structural("gone".into())) }
        })
        .await;

        assert!(result.unwrap_err().is_structural());
        assert_eq!(calls, 1, "structural errors are never retried in-step");
    }
}
