use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::level_filters::LevelFilter;

use knowledge_agent::agents::{run_agents_list, run_agents_show};
use knowledge_agent::checkpoint::format_checkpoint_summary;
use knowledge_agent::cli::{
    AgentCommands, CheckpointCommands, Cli, Commands, PluginCommands, TelemetryCommands,
    command_label,
};
use knowledge_agent::config::{AgentConfig, ConfigSource, load_config};
use knowledge_agent::doctor::run_doctor;
use knowledge_agent::error::{categorize_error, format_cli_error};
use knowledge_agent::manager::{AgentManager, Registration, RunOnce, format_status};
use knowledge_agent::plugins::PluginRegistry;
use knowledge_agent::telemetry::run_telemetry_report;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err));
        tracing::error!(category = %categorize_error(&err).code(), error = %err, "command failed");
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let level = log_filter
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(log_filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}

fn print_registrations(registrations: &[Registration]) {
    for registration in registrations {
        println!(
            "Agent '{}' registered flows: {}",
            registration.agent,
            if registration.flows.is_empty() {
                "<none>".to_string()
            } else {
                registration.flows.join(", ")
            }
        );
        for issue in &registration.unresolved {
            println!("  flow '{}' skipped: {}", issue.flow, issue.error);
        }
    }
}

/// Runs registered schedules until ctrl-c, then drains in-flight cycles.
async fn serve(manager: AgentManager, registrations: Vec<Registration>) -> Result<()> {
    print_registrations(&registrations);
    println!("Running. Press ctrl-c to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    println!("Shutting down; waiting for in-flight gaps to finish.");
    manager.shutdown().await;
    Ok(())
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    tracing::debug!(command = %command_label(&cli.command), "dispatching command");

    // Telemetry reports can be read without any configuration on disk.
    if let Commands::Telemetry {
        command: TelemetryCommands::Report {
            path: Some(path),
            limit,
        },
    } = &cli.command
    {
        return run_telemetry_report(&PathBuf::from(path), *limit);
    }

    let registry = PluginRegistry::with_builtins()?;
    let source = ConfigSource::new(&cli.config_dir).with_env(cli.env.clone());
    let config = load_config(&source, &registry)?;
    tracing::info!(
        layers = %config.layers.join(" -> "),
        agents = config.agents.len(),
        "configuration loaded"
    );

    dispatch(cli.command, config, registry).await
}

async fn dispatch(command: Commands, config: AgentConfig, registry: PluginRegistry) -> Result<()> {
    match command {
        Commands::Start { agent } => {
            let manager = AgentManager::new(config, registry);
            let registrations = manager.start_agents(&agent)?;
            serve(manager, registrations).await
        }
        Commands::Resume { agent } => {
            let manager = AgentManager::new(config, registry);
            let registrations = manager.start_agents(std::slice::from_ref(&agent))?;
            serve(manager, registrations).await
        }
        Commands::Status { json } => {
            let manager = AgentManager::new(config, registry);
            let snapshot = manager.status();
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print!("{}", format_status(&snapshot));
            }
            Ok(())
        }
        Commands::RunOnce { agent, flow } => {
            let manager = AgentManager::new(config, registry);
            match manager.run_once(&agent, &flow, true).await? {
                RunOnce::Completed(report) => {
                    println!("{}", report.summary());
                    for path in &report.artifact_paths {
                        println!("  wrote {}", path.display());
                    }
                    for failure in &report.failed {
                        println!(
                            "  gap {} failed at {}: {}",
                            failure.gap_id, failure.stage, failure.error
                        );
                    }
                }
                RunOnce::Started => println!("Cycle started."),
            }
            Ok(())
        }
        Commands::Reset { agent, force } => {
            if !force {
                anyhow::bail!(
                    "reset deletes the checkpoint for agent '{agent}'; re-run with --force to confirm"
                );
            }
            let manager = AgentManager::new(config, registry);
            manager.reset(&agent)?;
            println!("Checkpoint for agent '{agent}' deleted.");
            Ok(())
        }
        Commands::Checkpoint { command } => match command {
            CheckpointCommands::Show { agent, json } => {
                if config.agent(&agent).is_none() {
                    anyhow::bail!("agent '{agent}' is not configured");
                }
                let manager = AgentManager::new(config, registry);
                let checkpoint = manager.store().load(&agent);
                if json {
                    println!("{}", serde_json::to_string_pretty(&checkpoint)?);
                } else {
                    print!("{}", format_checkpoint_summary(&agent, &checkpoint));
                }
                Ok(())
            }
        },
        Commands::Agents { command } => match command {
            AgentCommands::List => run_agents_list(&config),
            AgentCommands::Show { name } => run_agents_show(&config, &name),
        },
        Commands::Plugins { command } => match command {
            PluginCommands::List => {
                for (capability, name) in registry.list() {
                    println!("{:<16} {name}", capability.as_str());
                }
                Ok(())
            }
        },
        Commands::Doctor => run_doctor(&config, &registry),
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { path, limit } => {
                let path = path
                    .map(PathBuf::from)
                    .unwrap_or_else(|| config.core.telemetry_path.clone());
                run_telemetry_report(&path, limit)
            }
        },
    }
}
