use std::path::Path;

use anyhow::Result;

use crate::config::AgentConfig;
use crate::pipeline::ResolvedFlow;
use crate::plugins::{Capability, PluginRegistry};

pub fn env_present(key: &str) -> bool {
    std::env::var(key)
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false)
}

/// Creates `dir` if needed and proves a file can be written there.
fn probe_writable(dir: &Path) -> std::result::Result<(), String> {
    std::fs::create_dir_all(dir).map_err(|err| err.to_string())?;
    let probe = dir.join(format!(".doctor-probe-{}", std::process::id()));
    std::fs::write(&probe, b"ok").map_err(|err| err.to_string())?;
    std::fs::remove_file(&probe).map_err(|err| err.to_string())
}

#[derive(Debug, Default)]
pub struct DoctorReport {
    pub lines: Vec<String>,
    pub problems: usize,
}

impl DoctorReport {
    fn ok(&mut self, line: String) {
        self.lines.push(line);
    }

    fn problem(&mut self, line: String) {
        self.problems += 1;
        self.lines.push(format!("PROBLEM: {line}"));
    }
}

pub fn doctor_report(config: &AgentConfig, registry: &PluginRegistry) -> DoctorReport {
    let mut report = DoctorReport::default();

    report.ok(format!("Config layers: {}", config.layers.join(" -> ")));
    for capability in Capability::ALL {
        report.ok(format!(
            "Plugins [{capability}]: {}",
            registry.names(capability).join(", ")
        ));
    }

    for (key, purpose) in [
        ("OPENROUTER_API_KEY", "openrouter llm plugin"),
        ("MCP_SERVER_URL", "mcp search plugin"),
    ] {
        let status = if env_present(key) { "set" } else { "missing" };
        report.ok(format!("- {key}: {status} ({purpose})"));
    }

    for (label, dir) in [
        ("knowledge_dir", &config.core.knowledge_dir),
        ("checkpoint_dir", &config.core.checkpoint_dir),
    ] {
        match probe_writable(dir) {
            Ok(()) => report.ok(format!("{label}: {} (writable)", dir.display())),
            Err(err) => report.problem(format!("{label}: {} is not writable: {err}", dir.display())),
        }
    }
    report.ok(format!(
        "Telemetry: enabled={} path={}",
        config.core.telemetry_enabled,
        config.core.telemetry_path.display()
    ));

    if config.agents.is_empty() {
        report.problem("no agents configured".to_string());
    }
    for agent in &config.agents {
        report.ok(format!(
            "Agent '{}' (enabled={}, flows={})",
            agent.name,
            agent.enabled,
            agent.flows.len()
        ));
        for flow in &agent.flows {
            match ResolvedFlow::resolve(&agent.name, flow, registry) {
                Ok(_) => report.ok(format!(
                    "  flow '{}': schedule={} enabled={} stages={}",
                    flow.name,
                    flow.schedule,
                    flow.enabled,
                    flow.stages.len()
                )),
                Err(err) => report.problem(format!("  flow '{}': {err}", flow.name)),
            }
        }
    }
    report
}

pub fn run_doctor(config: &AgentConfig, registry: &PluginRegistry) -> Result<()> {
    let report = doctor_report(config, registry);
    for line in &report.lines {
        println!("{line}");
    }
    if report.problems == 0 {
        println!("No problems found.");
    } else {
        println!("Problems: {}", report.problems);
    }
    Ok(())
}
