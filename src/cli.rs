use clap::{Parser, Subcommand};

#[derive(Debug, Subcommand)]
pub enum AgentCommands {
    #[command(about = "List configured agents with their flows and schedules")]
    List,
    #[command(about = "Show one agent's resolved flows, stages and plugins")]
    Show {
        #[arg(long)]
        name: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum CheckpointCommands {
    #[command(about = "Show an agent's checkpoint summary")]
    Show {
        #[arg(long)]
        agent: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum PluginCommands {
    #[command(about = "List registered plugins by capability")]
    List,
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize cycle and gap events from the JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  knowledge-agent start\n\
  knowledge-agent --env prod start --agent mcp-research\n\
  knowledge-agent status\n\
  knowledge-agent run-once --agent mcp-research --flow research\n\
  knowledge-agent resume --agent mcp-research\n\
  knowledge-agent reset --agent mcp-research --force\n\
  knowledge-agent checkpoint show --agent mcp-research\n\
  knowledge-agent agents show --name mcp-research\n\
  knowledge-agent plugins list\n\
  knowledge-agent telemetry report --limit 2000\n\
\n\
Configuration layers:\n\
  - <config-dir>/config.toml is required.\n\
  - <config-dir>/config.<env>.toml is applied when --env is set and the file exists.\n\
  - KA_<SECTION>__<KEY> environment variables override both, for example KA_CORE__TICK_INTERVAL_MS=500.";

#[derive(Debug, Parser)]
#[command(name = "knowledge-agent")]
#[command(about = "Durable background agent that fills knowledge gaps on a schedule")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "KNOWLEDGE_AGENT_CONFIG_DIR", default_value = "config")]
    pub config_dir: String,
    #[arg(long, env = "KNOWLEDGE_AGENT_ENV")]
    pub env: Option<String>,
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Register enabled agents and run their schedules until interrupted")]
    Start {
        /// Limit the run to these agents.
        #[arg(long)]
        agent: Vec<String>,
    },
    #[command(about = "Show per-agent checkpoint state and per-flow schedule state")]
    Status {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    #[command(about = "Run one cycle of a flow now, outside its schedule")]
    RunOnce {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        flow: String,
    },
    #[command(about = "Resume one agent from its checkpoint and run its schedules")]
    Resume {
        #[arg(long)]
        agent: String,
    },
    #[command(about = "Delete an agent checkpoint (requires --force)")]
    Reset {
        #[arg(long)]
        agent: String,
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    #[command(about = "Inspect stored checkpoints")]
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    #[command(about = "Inspect configured agents")]
    Agents {
        #[command(subcommand)]
        command: AgentCommands,
    },
    #[command(about = "Inspect the plugin registry")]
    Plugins {
        #[command(subcommand)]
        command: PluginCommands,
    },
    #[command(about = "Validate configuration layers, plugins and writable paths")]
    Doctor,
    #[command(about = "Telemetry utilities and reporting")]
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Start { .. } => "start".to_string(),
        Commands::Status { .. } => "status".to_string(),
        Commands::RunOnce { .. } => "run-once".to_string(),
        Commands::Resume { .. } => "resume".to_string(),
        Commands::Reset { .. } => "reset".to_string(),
        Commands::Checkpoint { command } => match command {
            CheckpointCommands::Show { .. } => "checkpoint.show".to_string(),
        },
        Commands::Agents { command } => match command {
            AgentCommands::List => "agents.list".to_string(),
            AgentCommands::Show { .. } => "agents.show".to_string(),
        },
        Commands::Plugins { command } => match command {
            PluginCommands::List => "plugins.list".to_string(),
        },
        Commands::Doctor => "doctor".to_string(),
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { .. } => "telemetry.report".to_string(),
        },
    }
}
