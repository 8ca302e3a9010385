//! Command-line interface for styleforge.
//!
//! Provides commands for running the watchdog host, submitting jobs,
//! inspecting job status, and applying the database schema.

use clap::Parser;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::store::{PgJobStore, PipelineType};

/// Job orchestration engine for multi-step AI generation pipelines.
#[derive(Parser)]
#[command(name = "styleforge")]
#[command(about = "Orchestrate crash-resilient AI generation pipelines")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the scheduler/watchdog host. This process drives intake, stale
    /// recovery, delegation and escalation, and executes the jobs it
    /// dispatches.
    Watchdog(WatchdogArgs),

    /// Submit a new job.
    Submit(SubmitArgs),

    /// Print a job's current state as JSON.
    Status(StatusArgs),

    /// Apply the database schema and exit.
    Migrate,
}

/// Arguments for `styleforge watchdog`.
#[derive(Parser, Debug)]
pub struct WatchdogArgs {
    /// Run a single cycle and exit instead of looping.
    #[arg(long)]
    pub once: bool,
}

/// Arguments for `styleforge submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Pipeline type (try_on_composite, agent_conversation, batch_refine,
    /// reframe).
    pub pipeline_type: String,

    /// Initial job metadata as a JSON object.
    #[arg(short, long, default_value = "{}")]
    pub metadata: String,

    /// Run the first invocation immediately instead of waiting for the
    /// watchdog to pick the job up.
    #[arg(long)]
    pub dispatch: bool,
}

/// Arguments for `styleforge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Job id.
    pub id: String,
}

/// Parses CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the command from parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = EngineConfig::from_env()?;

    match cli.command {
        Commands::Migrate => {
            let store = PgJobStore::connect(&config.database_url).await?;
            store.run_migrations().await?;
            info!("Schema applied");
            Ok(())
        }
        Commands::Watchdog(args) => {
            let engine = Engine::from_config(config).await?;
            let watchdog = engine.watchdog();
            if args.once {
                let report = watchdog.run_cycle().await?;
                info!(
                    skipped = report.skipped,
                    recovered = report.recovered,
                    claimed = report.claimed,
                    delegations = report.delegations_propagated,
                    escalations = report.escalations_dispatched,
                    "Cycle complete"
                );
            } else {
                info!(period = ?engine.config().watchdog_period, "Starting watchdog");
                watchdog.run_forever().await;
            }
            Ok(())
        }
        Commands::Submit(args) => {
            let pipeline_type = PipelineType::parse(&args.pipeline_type).ok_or_else(|| {
                anyhow::anyhow!("unknown pipeline type '{}'", args.pipeline_type)
            })?;
            let metadata: serde_json::Value = serde_json::from_str(&args.metadata)?;
            if !metadata.is_object() {
                anyhow::bail!("--metadata must be a JSON object");
            }

            let engine = Engine::from_config(config).await?;
            let result = engine
                .rpc()
                .handle(
                    "CreateJob",
                    json!({
                        "pipeline_type": pipeline_type.as_str(),
                        "metadata": metadata,
                    }),
                )
                .await?;
            println!("{}", result["id"].as_str().unwrap_or_default());

            if args.dispatch {
                let id = Uuid::parse_str(result["id"].as_str().unwrap_or_default())?;
                engine.run_job(id).await?;
            }
            Ok(())
        }
        Commands::Status(args) => {
            let id = Uuid::parse_str(&args.id)?;
            let engine = Engine::from_config(config).await?;
            let job = engine
                .rpc()
                .handle("GetJob", json!({ "id": id.to_string() }))
                .await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
    }
}
