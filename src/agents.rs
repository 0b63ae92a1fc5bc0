use anyhow::Result;

use crate::config::{AgentConfig, AgentDefinition};

pub fn format_agents_list(config: &AgentConfig) -> String {
    let mut out = String::new();
    out.push_str(&format!("Configured agents ({}):\n", config.agents.len()));
    for agent in &config.agents {
        let marker = if agent.enabled { "*" } else { " " };
        out.push_str(&format!(
            "{marker} {} - {}\n",
            agent.name,
            agent.description.as_deref().unwrap_or("<no description>")
        ));
        for flow in &agent.flows {
            let state = if flow.is_schedulable() { "" } else { " (disabled)" };
            out.push_str(&format!("    {} [{}]{state}\n", flow.name, flow.schedule));
        }
    }
    out
}

pub fn format_agent_details(agent: &AgentDefinition) -> String {
    let mut out = String::new();
    out.push_str(&format!("Agent: {} (enabled={})\n", agent.name, agent.enabled));
    out.push_str(&format!(
        "Description: {}\n",
        agent.description.as_deref().unwrap_or("<none>")
    ));
    for flow in &agent.flows {
        out.push_str(&format!(
            "Flow '{}': schedule={} enabled={}\n",
            flow.name, flow.schedule, flow.enabled
        ));
        out.push_str(&format!(
            "  batch: max_gaps={} max_gaps_to_process={} gap_concurrency={} dedup_similarity={}\n",
            flow.settings.max_gaps,
            flow.settings.max_gaps_to_process,
            flow.settings.gap_concurrency,
            flow.settings.dedup_similarity
        ));
        if let Some(prompt) = &flow.prompt {
            out.push_str(&format!("  prompt: {prompt}\n"));
        }
        for (index, stage) in flow.stages.iter().enumerate() {
            out.push_str(&format!(
                "  {}. {} ({}) plugin={} retries={} timeout={}s\n",
                index + 1,
                stage.name,
                stage.kind,
                stage.plugin.name,
                stage.retries,
                stage.timeout_secs
            ));
        }
    }
    out
}

pub fn run_agents_list(config: &AgentConfig) -> Result<()> {
    print!("{}", format_agents_list(config));
    Ok(())
}

pub fn run_agents_show(config: &AgentConfig, name: &str) -> Result<()> {
    let agent = config.agent(name).ok_or_else(|| {
        let names = config
            .agents
            .iter()
            .map(|agent| agent.name.as_str())
            .collect::<Vec<&str>>();
        anyhow::anyhow!(
            "agent '{}' not found. Available agents: {}",
            name,
            names.join(", ")
        )
    })?;
    print!("{}", format_agent_details(agent));
    Ok(())
}
