//! AGS CLI - reliability layer for the content agent pipeline
//!
//! Usage:
//!   ags init                    Write default .ags/config.toml
//!   ags run [--once]            Supervise pipeline runs
//!   ags status                  Show system and agent health
//!   ags circuits                Show circuit breaker state
//!   ags improvements            Show the improvement log
//!   ags reset                   Clear the health ledger
//!   ags artifact import|export  Sync the ledger with a CI artifact

use ags_agent::HealthMonitor;
use ags_core::fail_open::fail_open;
use ags_core::AgsConfig;
use ags_ledger::artifact::{export_artifact, import_artifact, running_in_ci};
use ags_ledger::{FileLedgerStorage, HealthLedger};
use ags_orchestrator::{CommandAgent, RunController, Shutdown, Stage, Supervisor};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "ags")]
#[command(author, version, about = "Agent reliability for the content pipeline")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Repository root holding .ags/config.toml
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Explicit config file (overrides <repo>/.ags/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration
    Init,

    /// Supervise pipeline runs until interrupted
    Run {
        /// Execute a single run and exit
        #[arg(long)]
        once: bool,

        /// Stop after this many runs
        #[arg(long, conflicts_with = "once")]
        max_runs: Option<usize>,
    },

    /// Show system and per-agent health
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Show circuit breaker state as a fresh process would see it
    Circuits {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Show the improvement log, newest last
    Improvements {
        /// Only the last N entries
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Clear the health ledger
    Reset {
        /// Required; the ledger cannot be recovered afterwards
        #[arg(long)]
        yes: bool,
    },

    /// CI artifact sync
    Artifact {
        #[command(subcommand)]
        action: ArtifactCommands,
    },
}

#[derive(Subcommand)]
enum ArtifactCommands {
    /// Seed the ledger from the artifact file
    Import {
        /// Artifact path (defaults to ledger.artifact_path)
        path: Option<PathBuf>,
    },
    /// Write the ledger to the artifact file
    Export {
        /// Artifact path (defaults to ledger.artifact_path)
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    match cli.command {
        Commands::Init => cmd_init(&cli.repo),
        Commands::Run { once, max_runs } => {
            let mut workspace = Workspace::load(&cli.repo, cli.config.as_deref())?;
            if once {
                workspace.config.run.max_runs = 1;
            } else if let Some(max_runs) = max_runs {
                workspace.config.run.max_runs = max_runs;
            }
            cmd_run(&workspace).await
        }
        Commands::Status { json } => {
            cmd_status(&Workspace::load(&cli.repo, cli.config.as_deref())?, json).await
        }
        Commands::Circuits { json } => {
            cmd_circuits(&Workspace::load(&cli.repo, cli.config.as_deref())?, json).await
        }
        Commands::Improvements { limit } => {
            let workspace = Workspace::load(&cli.repo, cli.config.as_deref())?;
            cmd_improvements(&workspace.ledger_path, limit).await
        }
        Commands::Reset { yes } => {
            let workspace = Workspace::load(&cli.repo, cli.config.as_deref())?;
            cmd_reset(&workspace.ledger_path, yes).await
        }
        Commands::Artifact { action } => {
            let workspace = Workspace::load(&cli.repo, cli.config.as_deref())?;
            match action {
                ArtifactCommands::Import { path } => {
                    let artifact = path.unwrap_or(workspace.artifact_path);
                    cmd_artifact_import(&workspace.ledger_path, &artifact).await
                }
                ArtifactCommands::Export { path } => {
                    let artifact = path.unwrap_or(workspace.artifact_path);
                    cmd_artifact_export(&workspace.ledger_path, &artifact).await
                }
            }
        }
    }
}

/// Loaded configuration with its paths resolved against the repo root
struct Workspace {
    config: AgsConfig,
    ledger_path: PathBuf,
    artifact_path: PathBuf,
}

impl Workspace {
    fn load(repo: &Path, config_file: Option<&Path>) -> Result<Self> {
        let config = match config_file {
            Some(path) => AgsConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => AgsConfig::load_or_default(repo).context("Failed to load .ags/config.toml")?,
        };
        Ok(Self {
            ledger_path: repo.join(&config.ledger.path),
            artifact_path: repo.join(&config.ledger.artifact_path),
            config,
        })
    }
}

async fn open_ledger(path: &Path) -> Result<HealthLedger<FileLedgerStorage>> {
    HealthLedger::open(FileLedgerStorage::new(path))
        .await
        .with_context(|| format!("Failed to open ledger at {}", path.display()))
}

fn cmd_init(repo: &Path) -> Result<()> {
    let config_path = repo.join(".ags/config.toml");
    if config_path.exists() {
        bail!("{} already exists", config_path.display());
    }

    let path = AgsConfig::write_default(repo).context("Failed to write default config")?;
    println!("Initialized AGS in {}", repo.display());
    println!("Created:");
    println!("  {}", path.display());
    println!();
    println!("Next: add [pipeline.source] and [[pipeline.stages]] entries, then `ags run`.");
    Ok(())
}

async fn cmd_run(workspace: &Workspace) -> Result<()> {
    let config = &workspace.config;
    let ledger_path = workspace.ledger_path.as_path();
    let artifact_path = workspace.artifact_path.as_path();
    let Some(source) = config.pipeline.source.as_ref() else {
        bail!("No [pipeline.source] configured; nothing to run");
    };

    let ci = running_in_ci();
    if ci {
        let storage = FileLedgerStorage::new(ledger_path);
        fail_open("ledger artifact import", || import_artifact(artifact_path, &storage)).await;
    }

    let ledger = open_ledger(ledger_path).await?;
    let monitor = HealthMonitor::new(ledger, config);

    let stages = config
        .pipeline
        .stages
        .iter()
        .map(|spec| Stage::new(Box::new(CommandAgent::from_stage(spec)), spec.role))
        .collect::<Vec<_>>();
    info!(
        "Pipeline: {} -> {}",
        source.name,
        config
            .pipeline
            .stages
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    );

    let shutdown = Shutdown::new();
    let controller = RunController::new(
        monitor,
        Box::new(CommandAgent::from_source(source)),
        stages,
        shutdown.clone(),
        config.run.clone(),
    );
    let mut supervisor = Supervisor::new(controller, config.run.clone());

    let result = {
        let run = supervisor.run();
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => result,
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down, waiting for in-flight work...");
                shutdown.trigger();
                run.await
            }
        }
    };

    if ci {
        let data = supervisor.controller().monitor().ledger().data();
        fail_open("ledger artifact export", || export_artifact(data, artifact_path)).await;
    }

    let stats = result.context("Supervisor stopped")?;
    println!(
        "Finished {} run(s): {} failed, {} restart(s)",
        stats.runs, stats.failed_runs, stats.restarts
    );
    Ok(())
}

async fn cmd_status(workspace: &Workspace, json: bool) -> Result<()> {
    let ledger = open_ledger(&workspace.ledger_path).await?;
    let monitor = HealthMonitor::new(ledger, &workspace.config);
    let check = monitor.health_check();
    let restart = monitor.should_restart();

    if json {
        let value = serde_json::json!({
            "health": check,
            "restart": restart,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("AGS Status");
    println!("==========");
    println!("System: {}", check.status);
    println!();
    println!("{:<20} {:>8} {:>8}  HEALTHY", "AGENT", "RATE", "STREAK");
    for (agent, entry) in &check.agents {
        println!(
            "{:<20} {:>7.1}% {:>8}  {}",
            agent,
            entry.success_rate * 100.0,
            entry.consecutive_failures,
            if entry.healthy { "yes" } else { "no" }
        );
    }
    if !check.recommendations.is_empty() {
        println!("\nRecommendations:");
        for recommendation in &check.recommendations {
            println!("  - {}", recommendation);
        }
    }
    if restart.should_restart {
        println!("\nRestart advised: {}", restart.reason);
    }
    Ok(())
}

async fn cmd_circuits(workspace: &Workspace, json: bool) -> Result<()> {
    let ledger = open_ledger(&workspace.ledger_path).await?;
    let mut monitor = HealthMonitor::new(ledger, &workspace.config);
    for agent in &workspace.config.run.tracked_agents {
        monitor.circuit_status(agent);
    }
    let summary = monitor.circuit_summary();

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("{:<20} {:<10} {:>8}  NEXT RETRY", "AGENT", "STATE", "FAILURES");
    for (agent, status) in &summary {
        let next_retry = status
            .next_retry_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<10} {:>8}  {}",
            agent,
            status.state.to_string(),
            status.failures,
            next_retry
        );
    }
    Ok(())
}

async fn cmd_improvements(ledger_path: &Path, limit: Option<usize>) -> Result<()> {
    let ledger = open_ledger(ledger_path).await?;
    let improvements = ledger.improvements();
    let skip = limit.map_or(0, |n| improvements.len().saturating_sub(n));

    if improvements.is_empty() {
        println!("No improvements recorded");
        return Ok(());
    }
    for entry in &improvements[skip..] {
        println!(
            "{}  {:<8}  {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.impact.to_string(),
            entry.change
        );
    }
    Ok(())
}

async fn cmd_reset(ledger_path: &Path, yes: bool) -> Result<()> {
    if !yes {
        bail!("Refusing to clear {} without --yes", ledger_path.display());
    }
    let mut ledger = open_ledger(ledger_path).await?;
    ledger.reset().await.context("Failed to reset ledger")?;
    println!("Cleared health ledger at {}", ledger_path.display());
    Ok(())
}

async fn cmd_artifact_import(ledger_path: &Path, artifact_path: &Path) -> Result<()> {
    let storage = FileLedgerStorage::new(ledger_path);
    match import_artifact(artifact_path, &storage)
        .await
        .with_context(|| format!("Failed to import {}", artifact_path.display()))?
    {
        Some(data) => println!(
            "Imported {} agent record(s) from {}",
            data.agent_health.len(),
            artifact_path.display()
        ),
        None => {
            warn!("No artifact found");
            println!("No artifact at {}; ledger unchanged", artifact_path.display());
        }
    }
    Ok(())
}

async fn cmd_artifact_export(ledger_path: &Path, artifact_path: &Path) -> Result<()> {
    let ledger = open_ledger(ledger_path).await?;
    export_artifact(ledger.data(), artifact_path)
        .await
        .with_context(|| format!("Failed to export {}", artifact_path.display()))?;
    println!("Exported ledger to {}", artifact_path.display());
    Ok(())
}
