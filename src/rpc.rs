//! Transport-agnostic RPC surface over the job store.
//!
//! A method-name + JSON-body dispatcher: whatever carries the bytes (HTTP
//! handler, message queue consumer, CLI) calls `JobRpc::handle` and relays
//! the JSON result. Unknown methods and malformed bodies produce typed
//! errors instead of panics or silent nulls.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::store::{JobStatus, JobStore, JobUpdate, PipelineType, StoreError};

/// Errors that can occur while handling an RPC call.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The method name is not part of the surface.
    #[error("Unknown method '{0}'")]
    UnknownMethod(String),

    /// The request body is missing or malformed.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Result serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// RPC dispatcher over the job store.
pub struct JobRpc {
    store: Arc<dyn JobStore>,
}

impl JobRpc {
    /// Creates a dispatcher over the given store.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Handles one call and returns its JSON result.
    pub async fn handle(&self, method: &str, body: Value) -> Result<Value, RpcError> {
        match method {
            "CreateJob" => self.create_job(body).await,
            "GetJob" => self.get_job(body).await,
            "UpdateJob" => self.update_job(body).await,
            "ClaimNextJob" => self.claim_next_job(body).await,
            "ListStaleJobs" => self.list_stale_jobs(body).await,
            other => Err(RpcError::UnknownMethod(other.to_string())),
        }
    }

    async fn create_job(&self, body: Value) -> Result<Value, RpcError> {
        let pipeline_type = parse_pipeline(&body)?;
        let metadata = body.get("metadata").cloned().unwrap_or_else(|| json!({}));
        if !metadata.is_object() {
            return Err(RpcError::BadRequest(
                "'metadata' must be an object".to_string(),
            ));
        }

        let job = self.store.create(pipeline_type, metadata).await?;
        info!(job_id = %job.id, pipeline = %pipeline_type, "Job created");
        Ok(json!({ "id": job.id }))
    }

    async fn get_job(&self, body: Value) -> Result<Value, RpcError> {
        let id = parse_id(&body)?;
        let job = self.store.get(id).await?;
        Ok(serde_json::to_value(job)?)
    }

    async fn update_job(&self, body: Value) -> Result<Value, RpcError> {
        let id = parse_id(&body)?;
        let mut update = JobUpdate::new();

        if let Some(status) = body.get("status") {
            let status = status
                .as_str()
                .and_then(JobStatus::parse)
                .ok_or_else(|| RpcError::BadRequest(format!("invalid status: {}", status)))?;
            update = update.with_status(status);
        }
        // Presence with a null value clears the field; absence leaves it.
        if let Some(step) = body.get("step") {
            update = match step {
                Value::Null => update.clear_step(),
                Value::String(s) => update.with_step(s.clone()),
                other => {
                    return Err(RpcError::BadRequest(format!(
                        "'step' must be a string or null, got {}",
                        other
                    )))
                }
            };
        }
        if let Some(metadata) = body.get("metadata") {
            if !metadata.is_object() {
                return Err(RpcError::BadRequest(
                    "'metadata' must be an object".to_string(),
                ));
            }
            update = update.with_metadata_patch(metadata.clone());
        }
        if let Some(error_message) = body.get("error_message") {
            update = match error_message {
                Value::Null => update.clear_error(),
                Value::String(s) => update.with_error(s.clone()),
                other => {
                    return Err(RpcError::BadRequest(format!(
                        "'error_message' must be a string or null, got {}",
                        other
                    )))
                }
            };
        }

        let job = self.store.update(id, update).await?;
        Ok(serde_json::to_value(job)?)
    }

    async fn claim_next_job(&self, body: Value) -> Result<Value, RpcError> {
        let pipeline_type = parse_pipeline(&body)?;
        match self.store.claim_next(pipeline_type).await? {
            Some(job) => Ok(serde_json::to_value(job)?),
            None => Ok(Value::Null),
        }
    }

    async fn list_stale_jobs(&self, body: Value) -> Result<Value, RpcError> {
        let pipeline_type = parse_pipeline(&body)?;
        let threshold_seconds = body
            .get("threshold_seconds")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                RpcError::BadRequest("'threshold_seconds' must be a positive integer".to_string())
            })?;

        let stale = self
            .store
            .find_stale(pipeline_type, Duration::from_secs(threshold_seconds))
            .await?;
        Ok(serde_json::to_value(stale)?)
    }
}

fn parse_pipeline(body: &Value) -> Result<PipelineType, RpcError> {
    let raw = body
        .get("pipeline_type")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::BadRequest("'pipeline_type' is required".to_string()))?;
    PipelineType::parse(raw)
        .ok_or_else(|| RpcError::BadRequest(format!("unknown pipeline type '{}'", raw)))
}

fn parse_id(body: &Value) -> Result<Uuid, RpcError> {
    let raw = body
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::BadRequest("'id' is required".to_string()))?;
    Uuid::parse_str(raw).map_err(|_| RpcError::BadRequest(format!("invalid job id '{}'", raw)))
}
