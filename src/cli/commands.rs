//! CLI command definitions for evalforge.
//!
//! `run` executes a run end to end against LLM-backed collaborators; the
//! other commands inspect or repair runs already in the store.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use uuid::Uuid;

use crate::collaborators::{LlmGenerator, LlmJudge};
use crate::llm::{LiteLlmClient, LlmProvider, OPENROUTER_API_BASE};
use crate::orchestrator::{RecoveryManager, RunOrchestrator, RunService, RunView};
use crate::pipeline::EngineConfig;
use crate::run::{PhaseProgress, RunConfig, RunPhase};
use crate::storage::{RunStore, SqliteRunStore};
use crate::timeline::TimelineEvent;

/// Multi-model generation and evaluation pipeline.
#[derive(Parser)]
#[command(name = "evalforge")]
#[command(about = "Generate, judge and combine documents across LLM providers")]
#[command(version)]
#[command(
    long_about = "evalforge generates one candidate per document and model, scores every candidate \
with a panel of judges, ranks them head to head with Elo ratings, merges the best into a combined \
document and checks that the merge actually beats the original winner.\n\nExample usage:\n  \
evalforge run --config run.yaml\n  evalforge status <run-id>\n  evalforge timeline <run-id> --json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Run store location (overrides EVALFORGE_DATABASE_URL).
    #[arg(long, global = true)]
    pub database: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Execute a run described by a YAML configuration file.
    Run(RunArgs),

    /// Show the status, progress and winner of a run.
    Status(StatusArgs),

    /// Print the timeline of a run.
    Timeline(TimelineArgs),

    /// Mark runs interrupted by a previous process as failed.
    Recover,
}

/// Arguments for `evalforge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Run configuration file (YAML).
    #[arg(short, long)]
    pub config: PathBuf,

    /// API key for the chat-completions endpoint.
    #[arg(long, env = "OPENROUTER_API_KEY")]
    pub api_key: Option<String>,

    /// Output the final run view as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `evalforge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    pub run_id: Uuid,

    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `evalforge timeline`.
#[derive(Parser, Debug)]
pub struct TimelineArgs {
    pub run_id: Uuid,

    /// Output events as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut engine = EngineConfig::from_env()?;
    if let Some(url) = cli.database {
        engine = engine.with_database_url(url);
    }
    engine.validate()?;

    match cli.command {
        Commands::Run(args) => run_run_command(engine, args).await,
        Commands::Status(args) => run_status_command(engine, args).await,
        Commands::Timeline(args) => run_timeline_command(engine, args).await,
        Commands::Recover => run_recover_command(engine).await,
    }
}

async fn open_store(engine: &EngineConfig) -> anyhow::Result<Arc<dyn RunStore>> {
    let store = SqliteRunStore::connect(&engine.database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open run store '{}': {}", engine.database_url, e))?;
    Ok(Arc::new(store))
}

fn llm_client(api_key: Option<String>) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let client = match api_key {
        Some(key) if std::env::var("LITELLM_API_BASE").is_err() => {
            info!(api_base = OPENROUTER_API_BASE, "Using OpenRouter with provided API key");
            LiteLlmClient::new_with_defaults(key)?
        }
        _ => LiteLlmClient::from_env().map_err(|e| {
            anyhow::anyhow!(
                "{}\nProvide --api-key <KEY> or set OPENROUTER_API_KEY / LITELLM_API_KEY.",
                e
            )
        })?,
    };
    Ok(Arc::new(client))
}

// ============================================================================
// Run Command Implementation
// ============================================================================

async fn run_run_command(engine: EngineConfig, args: RunArgs) -> anyhow::Result<()> {
    let config = RunConfig::from_yaml_file(&args.config)?;
    config.validate()?;

    if let Err(e) = crate::metrics::init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }
    let store = open_store(&engine).await?;
    let client = llm_client(args.api_key)?;

    let orchestrator = RunOrchestrator::new(
        store,
        Arc::new(engine),
        Arc::new(LlmGenerator::new(client.clone())),
        Arc::new(LlmJudge::new(client.clone())),
    )
    .with_merger(client);
    let service = RunService::startup(orchestrator).await;

    let run_id = service.create_run(config).await?;
    info!(run_id = %run_id, config = %args.config.display(), "Run created");
    service.start_run(run_id).await?;

    let wait = service.wait(run_id);
    tokio::pin!(wait);
    let outcome = tokio::select! {
        outcome = &mut wait => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!(run_id = %run_id, "Interrupt received, cancelling run");
            service.cancel_run(run_id, "interrupted by user").await?;
            wait.await
        }
    };

    let view = service.get_run(run_id).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print_view(&view);
    }

    if let Err(err) = outcome {
        anyhow::bail!("Run {} failed: {}", run_id, err);
    }
    Ok(())
}

// ============================================================================
// Inspection Commands
// ============================================================================

async fn run_status_command(engine: EngineConfig, args: StatusArgs) -> anyhow::Result<()> {
    let store = open_store(&engine).await?;
    let run = store.get_run(args.run_id).await?;
    let view = RunView::from(&run);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print_view(&view);
    }
    Ok(())
}

async fn run_timeline_command(engine: EngineConfig, args: TimelineArgs) -> anyhow::Result<()> {
    let store = open_store(&engine).await?;
    store.get_run(args.run_id).await?;
    let events = store.list_timeline(args.run_id).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }

    for event in &events {
        println!("{}", format_event(event));
    }
    println!("({} events)", events.len());
    Ok(())
}

async fn run_recover_command(engine: EngineConfig) -> anyhow::Result<()> {
    let store = open_store(&engine).await?;
    let report = RecoveryManager::new(store).recover().await?;

    println!("Recovered {} interrupted run(s)", report.recovered.len());
    for run_id in &report.recovered {
        println!("  {}", run_id);
    }
    if !report.failures.is_empty() {
        for (run_id, err) in &report.failures {
            println!("  failed to recover {}: {}", run_id, err);
        }
        anyhow::bail!("{} run(s) could not be recovered", report.failures.len());
    }
    Ok(())
}

// ============================================================================
// Output helpers
// ============================================================================

fn print_view(view: &RunView) {
    println!("Run {}", view.id);
    if let Some(name) = &view.name {
        println!("  Name:        {}", name);
    }
    match view.phase {
        Some(phase) => println!("  Status:      {} ({})", view.status, phase),
        None => println!("  Status:      {}", view.status),
    }
    println!("  Winner:      {}", view.winner.as_deref().unwrap_or("-"));
    println!(
        "  Pre-combine: {}",
        view.pre_combine_winner.as_deref().unwrap_or("-")
    );
    println!("  Total cost:  ${:.4}", view.total_cost);
    println!("  Progress:");
    for phase in RunPhase::all() {
        let progress = view.progress.phase(phase);
        if *progress != PhaseProgress::default() {
            println!(
                "    {:<24} {}/{} done, {} failed, {} skipped",
                phase.as_str(),
                progress.completed,
                progress.total,
                progress.failed,
                progress.skipped
            );
        }
    }
    if let Some(summary) = &view.summary {
        println!("  Summary:     {}", summary);
    }
}

fn format_event(event: &TimelineEvent) -> String {
    let mut line = format!(
        "{} [{:<17}] {:<15} {}",
        event.started_at.format("%Y-%m-%d %H:%M:%S%.3f"),
        event.phase.as_str(),
        event.event_type.as_str(),
        event.description
    );
    if let Some(actor) = &event.actor {
        line.push_str(&format!(" (by {})", actor));
    }
    if let Some(ms) = event.duration_ms {
        line.push_str(&format!(" in {}ms", ms));
    }
    if let Some(error) = &event.error {
        line.push_str(&format!(" ! {}", error));
    }
    line
}
