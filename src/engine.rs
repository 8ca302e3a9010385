//! Engine wiring.
//!
//! Owns the shared collaborators (store, providers, blob storage, config)
//! and routes invocations to the right execution loop: step-machine
//! pipelines go to the worker, agent conversations to the planner. The
//! engine hands each component a `SpawnInvoker` holding a weak reference to
//! itself, which is how fire-and-forget self-invocation closes the loop
//! without a reference cycle.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::blob::{BlobStore, LocalBlobStore};
use crate::config::{ConfigError, EngineConfig};
use crate::planner::{PlannerError, PlannerLoop, ToolRegistry};
use crate::provider::{
    GenerationProvider, HttpGenerationProvider, HttpPlannerProvider, PlannerProvider, ProviderError,
};
use crate::rpc::JobRpc;
use crate::store::{JobStore, PgJobStore, PipelineType, StoreError};
use crate::watchdog::Watchdog;
use crate::worker::{Invoker, SpawnInvoker, StepWorker, WorkerError};

/// Errors that can occur at the engine boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Step worker failed.
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Planner loop failed.
    #[error("Planner error: {0}")]
    Planner(#[from] PlannerError),

    /// Provider construction failed.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Configuration is invalid.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Top-level orchestration engine.
pub struct Engine {
    store: Arc<dyn JobStore>,
    primary: Arc<dyn GenerationProvider>,
    fallback: Arc<dyn GenerationProvider>,
    planner: Arc<dyn PlannerProvider>,
    blobs: Arc<dyn BlobStore>,
    config: Arc<EngineConfig>,
    tools: Arc<ToolRegistry>,
    invoker: Arc<dyn Invoker>,
}

impl Engine {
    /// Wires an engine from its collaborators.
    pub fn new(
        store: Arc<dyn JobStore>,
        primary: Arc<dyn GenerationProvider>,
        fallback: Arc<dyn GenerationProvider>,
        planner: Arc<dyn PlannerProvider>,
        blobs: Arc<dyn BlobStore>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            primary,
            fallback,
            planner,
            blobs,
            config: Arc::new(config),
            tools: Arc::new(ToolRegistry::new()),
            invoker: Arc::new(SpawnInvoker::new(weak.clone())),
        })
    }

    /// Builds the production engine: Postgres store, HTTP providers, local
    /// blob storage.
    pub async fn from_config(config: EngineConfig) -> Result<Arc<Self>, EngineError> {
        config.validate()?;

        let store = PgJobStore::connect(&config.database_url).await?;
        store.run_migrations().await?;
        info!(database_url = %config.database_url, "Connected to job store");

        let primary =
            HttpGenerationProvider::new(&config.primary_provider_url, config.provider_timeout)?;
        let fallback =
            HttpGenerationProvider::new(&config.fallback_provider_url, config.provider_timeout)?;
        let planner =
            HttpPlannerProvider::new(&config.planner_provider_url, config.provider_timeout)?;
        let blobs = LocalBlobStore::new(config.blob_root.clone());

        Ok(Self::new(
            Arc::new(store),
            Arc::new(primary),
            Arc::new(fallback),
            Arc::new(planner),
            Arc::new(blobs),
            config,
        ))
    }

    /// Runs one invocation for a job, routed by its pipeline type.
    pub async fn run_job(&self, job_id: Uuid) -> Result<(), EngineError> {
        let job = self.store.get(job_id).await?;
        match job.pipeline_type {
            PipelineType::AgentConversation => self.planner_loop().run(job_id).await?,
            _ => self.step_worker().run(job_id).await?,
        }
        Ok(())
    }

    /// The step-machine worker over this engine's collaborators.
    pub fn step_worker(&self) -> StepWorker {
        StepWorker::new(
            self.store.clone(),
            self.primary.clone(),
            self.fallback.clone(),
            self.blobs.clone(),
            self.config.clone(),
            self.invoker.clone(),
        )
    }

    /// The planner loop over this engine's collaborators.
    pub fn planner_loop(&self) -> PlannerLoop {
        PlannerLoop::new(
            self.store.clone(),
            self.planner.clone(),
            self.primary.clone(),
            self.tools.clone(),
            self.config.clone(),
            self.invoker.clone(),
        )
    }

    /// The watchdog over this engine's collaborators.
    pub fn watchdog(&self) -> Watchdog {
        Watchdog::new(self.store.clone(), self.invoker.clone(), self.config.clone())
    }

    /// The RPC dispatcher over this engine's store.
    pub fn rpc(&self) -> JobRpc {
        JobRpc::new(self.store.clone())
    }

    /// The job store.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use crate::provider::{
        AnalyzeRequest, GenerateRequest, GenerateResponse, PlannerRequest, PlannerResponse,
        ScoreRequest, ScoreResponse, ToolCall,
    };
    use crate::store::{JobStatus, MemoryJobStore};

    use super::*;

    struct NoProvider;

    #[async_trait]
    impl GenerationProvider for NoProvider {
        async fn generate(
            &self,
            _request: GenerateRequest,
        ) -> Result<GenerateResponse, ProviderError> {
            Err(ProviderError::Structural("no provider".into()))
        }

        async fn analyze(&self, _request: AnalyzeRequest) -> Result<Value, ProviderError> {
            Err(ProviderError::Structural("no provider".into()))
        }

        async fn score(&self, _request: ScoreRequest) -> Result<ScoreResponse, ProviderError> {
            Err(ProviderError::Structural("no provider".into()))
        }
    }

    struct FinishPlanner;

    #[async_trait]
    impl PlannerProvider for FinishPlanner {
        async fn plan(&self, _request: PlannerRequest) -> Result<PlannerResponse, ProviderError> {
            Ok(PlannerResponse {
                tool_call: Some(ToolCall {
                    name: "finish".to_string(),
                    arguments: json!({"summary": "done"}),
                }),
                text: None,
            })
        }
    }

    fn engine() -> (Arc<Engine>, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new());
        let blob_dir = std::env::temp_dir().join(format!("styleforge-test-{}", Uuid::new_v4()));
        let engine = Engine::new(
            store.clone(),
            Arc::new(NoProvider),
            Arc::new(NoProvider),
            Arc::new(FinishPlanner),
            Arc::new(LocalBlobStore::new(blob_dir)),
            EngineConfig::default(),
        );
        (engine, store)
    }

    #[tokio::test]
    async fn test_run_job_routes_conversations_to_planner() {
        let (engine, store) = engine();
        let job = store
            .create(
                PipelineType::AgentConversation,
                json!({"user_input": "hello"}),
            )
            .await
            .expect("create");

        engine.run_job(job.id).await.expect("run");

        let job = store.get(job.id).await.expect("get");
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.meta_str("final_result"), Some("done"));
    }

    #[tokio::test]
    async fn test_run_job_routes_pipelines_to_worker() {
        let (engine, store) = engine();
        // Missing reference_url: the start step fails the job, proving the
        // worker handled it.
        let job = store
            .create(
                PipelineType::TryOnComposite,
                json!({"subject_url": "blob://s.png"}),
            )
            .await
            .expect("create");

        engine.run_job(job.id).await.expect("run");

        let job = store.get(job.id).await.expect("get");
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.expect("message").contains("reference_url"));
    }

    #[tokio::test]
    async fn test_run_job_unknown_id_errors() {
        let (engine, _store) = engine();
        let err = engine.run_job(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::NotFound(_))));
    }
}
