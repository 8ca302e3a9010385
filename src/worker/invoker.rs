//! Fire-and-forget worker invocation.
//!
//! `Invoker::invoke` acknowledges dispatch, never completion: the spawned
//! execution persists its own outcome onto the job. Callers must reflect
//! dispatch errors back onto the job (revert to pending, log) rather than
//! drop them; a lost dispatch is recovered by the watchdog's staleness scan.

use std::sync::Weak;

use async_trait::async_trait;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::engine::Engine;

/// Errors that can occur while dispatching an invocation.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The dispatch target has shut down.
    #[error("Dispatch target is no longer available")]
    TargetGone,
}

/// Fire-and-forget invocation of a job's worker or planner loop.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Dispatches one invocation for the given job. Returns once the
    /// invocation is scheduled, not when it completes.
    async fn invoke(&self, job_id: Uuid) -> Result<(), InvokeError>;
}

/// Invoker that spawns each invocation as an independent tokio task.
///
/// Holds the engine weakly so self-invocations cannot keep a shut-down
/// engine alive.
pub struct SpawnInvoker {
    engine: Weak<Engine>,
}

impl SpawnInvoker {
    pub(crate) fn new(engine: Weak<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Invoker for SpawnInvoker {
    async fn invoke(&self, job_id: Uuid) -> Result<(), InvokeError> {
        let engine = self.engine.upgrade().ok_or(InvokeError::TargetGone)?;

        tokio::spawn(async move {
            if let Err(e) = engine.run_job(job_id).await {
                // Execution-level failures are persisted onto the job by the
                // worker itself; anything surfacing here is a store-level
                // fault, left for staleness recovery.
                error!(job_id = %job_id, error = %e, "Invocation failed");
            }
        });

        Ok(())
    }
}
