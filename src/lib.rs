//! styleforge: Crash-resilient orchestration engine for multi-step AI
//! generation pipelines.
//!
//! This library provides the job store, step-machine worker, agent planner
//! loop, and scheduler/watchdog that together drive long-running generation
//! pipelines across process restarts.

// Core modules
pub mod blob;
pub mod cli;
pub mod config;
pub mod engine;
pub mod planner;
pub mod provider;
pub mod rpc;
pub mod store;
pub mod watchdog;
pub mod worker;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, EngineError};
pub use store::{Job, JobStatus, JobStore, JobUpdate, PipelineType, StoreError};
