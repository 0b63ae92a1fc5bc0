use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ResolutionError};
use crate::plugins::{Capability, PluginParams, PluginRegistry};
use crate::schedule::ScheduleSpec;

pub const BASE_CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_ENV_PREFIX: &str = "KA_";

// ---------------------------------------------------------------------------
// File schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct CoreSettings {
    pub knowledge_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub tick_interval_ms: u64,
    pub history_limit: usize,
    pub telemetry_enabled: bool,
    pub telemetry_path: PathBuf,
    pub log_level: Option<String>,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            knowledge_dir: PathBuf::from("knowledge"),
            checkpoint_dir: PathBuf::from(".knowledge-agent/checkpoints"),
            tick_interval_ms: 1000,
            history_limit: 50,
            telemetry_enabled: true,
            telemetry_path: PathBuf::from(".knowledge-agent/telemetry/events.jsonl"),
            log_level: None,
        }
    }
}

/// Flow-level LLM defaults shared by every llm-backed stage.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct LlmSettings {
    pub plugin: String,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            plugin: "template".to_string(),
            model: None,
            temperature: None,
            max_tokens: None,
            timeout_secs: None,
            base_url: None,
            api_key: None,
        }
    }
}

impl LlmSettings {
    pub fn params(&self) -> PluginParams {
        let mut params = PluginParams::new();
        if let Some(model) = &self.model {
            params.insert("model", model.clone());
        }
        if let Some(temperature) = self.temperature {
            params.insert("temperature", temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            params.insert("max_tokens", max_tokens);
        }
        if let Some(timeout_secs) = self.timeout_secs {
            params.insert("timeout_secs", timeout_secs);
        }
        if let Some(base_url) = &self.base_url {
            params.insert("base_url", base_url.clone());
        }
        if let Some(api_key) = &self.api_key {
            params.insert("api_key", api_key.clone());
        }
        params
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelineSettings {
    /// Upper bound on gaps requested from the identifier per cycle.
    pub max_gaps: usize,
    pub max_gaps_to_process: usize,
    pub max_search_terms: usize,
    pub results_per_term: usize,
    pub dedup_similarity: f64,
    pub gap_concurrency: usize,
    pub stage_timeout_secs: u64,
    pub retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_gaps: 5,
            max_gaps_to_process: 3,
            max_search_terms: 3,
            results_per_term: 3,
            dedup_similarity: 0.85,
            gap_concurrency: 1,
            stage_timeout_secs: 60,
            retries: 2,
            retry_delay_ms: 500,
        }
    }
}

const PIPELINE_KEYS: &[&str] = &[
    "max_gaps",
    "max_gaps_to_process",
    "max_search_terms",
    "results_per_term",
    "dedup_similarity",
    "gap_concurrency",
    "stage_timeout_secs",
    "retries",
    "retry_delay_ms",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    IdentifyGaps,
    GenerateSearchTerms,
    WebSearch,
    CompileKnowledge,
    WriteKnowledge,
}

impl TaskKind {
    /// Canonical execution order.
    pub const ORDER: [TaskKind; 5] = [
        TaskKind::IdentifyGaps,
        TaskKind::GenerateSearchTerms,
        TaskKind::WebSearch,
        TaskKind::CompileKnowledge,
        TaskKind::WriteKnowledge,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::IdentifyGaps => "identify_gaps",
            TaskKind::GenerateSearchTerms => "generate_search_terms",
            TaskKind::WebSearch => "web_search",
            TaskKind::CompileKnowledge => "compile_knowledge",
            TaskKind::WriteKnowledge => "write_knowledge",
        }
    }

    pub fn capability(self) -> Capability {
        match self {
            TaskKind::IdentifyGaps => Capability::GapIdentifier,
            TaskKind::GenerateSearchTerms | TaskKind::CompileKnowledge => Capability::Llm,
            TaskKind::WebSearch => Capability::Search,
            TaskKind::WriteKnowledge => Capability::DocumentWriter,
        }
    }

    pub fn is_required(self) -> bool {
        matches!(
            self,
            TaskKind::IdentifyGaps | TaskKind::CompileKnowledge | TaskKind::WriteKnowledge
        )
    }

    fn default_plugin(self, llm: &LlmSettings) -> String {
        match self {
            TaskKind::IdentifyGaps => "topics".to_string(),
            TaskKind::GenerateSearchTerms | TaskKind::CompileKnowledge => llm.plugin.clone(),
            TaskKind::WebSearch => "none".to_string(),
            TaskKind::WriteKnowledge => "markdown".to_string(),
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSection {
    pub kind: TaskKind,
    pub plugin: Option<String>,
    #[serde(default)]
    pub params: toml::Table,
    pub retries: Option<u32>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FlowSection {
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub tasks: Vec<String>,
    #[serde(default)]
    pub params: toml::Table,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub flows: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConfigFile {
    pub core: CoreSettings,
    pub llm: LlmSettings,
    pub pipeline: PipelineSettings,
    pub tasks: BTreeMap<String, TaskSection>,
    pub flows: BTreeMap<String, FlowSection>,
    pub agents: BTreeMap<String, AgentSection>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PluginRef {
    pub name: String,
    pub params: PluginParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageDefinition {
    /// Task name from the `[tasks]` table.
    pub name: String,
    pub kind: TaskKind,
    pub plugin: PluginRef,
    pub retries: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowDefinition {
    pub name: String,
    pub schedule: ScheduleSpec,
    pub enabled: bool,
    pub stages: Vec<StageDefinition>,
    pub settings: PipelineSettings,
    pub prompt: Option<String>,
    /// LLM handed to the gap identifier.
    pub llm: PluginRef,
}

impl FlowDefinition {
    pub fn stage(&self, kind: TaskKind) -> Option<&StageDefinition> {
        self.stages.iter().find(|stage| stage.kind == kind)
    }

    /// Enabled and carrying a schedule that can fire.
    pub fn is_schedulable(&self) -> bool {
        self.enabled && !self.schedule.is_disabled()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentDefinition {
    pub name: String,
    pub enabled: bool,
    pub description: Option<String>,
    pub flows: Vec<FlowDefinition>,
}

impl AgentDefinition {
    pub fn flow(&self, name: &str) -> Option<&FlowDefinition> {
        self.flows.iter().find(|flow| flow.name == name)
    }
}

/// Immutable process configuration folded from every layer.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub core: CoreSettings,
    pub llm: LlmSettings,
    pub pipeline: PipelineSettings,
    pub agents: Vec<AgentDefinition>,
    /// Layers applied, in order, for diagnostics.
    pub layers: Vec<String>,
}

impl AgentConfig {
    pub fn agent(&self, name: &str) -> Option<&AgentDefinition> {
        self.agents.iter().find(|agent| agent.name == name)
    }
}

// ---------------------------------------------------------------------------
// Layer loading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub dir: PathBuf,
    pub env: Option<String>,
    pub env_prefix: String,
}

impl ConfigSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            env: None,
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
        }
    }

    pub fn with_env(mut self, env: Option<String>) -> Self {
        self.env = env
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        self
    }

    pub fn base_path(&self) -> PathBuf {
        self.dir.join(BASE_CONFIG_FILE)
    }

    pub fn env_path(&self) -> Option<PathBuf> {
        self.env
            .as_ref()
            .map(|env| self.dir.join(format!("config.{env}.toml")))
    }
}

/// Loads the config from disk and the process environment.
pub fn load_config(
    source: &ConfigSource,
    registry: &PluginRegistry,
) -> Result<AgentConfig, ConfigError> {
    load_config_with_vars(source, registry, std::env::vars())
}

pub fn load_config_with_vars<I>(
    source: &ConfigSource,
    registry: &PluginRegistry,
    vars: I,
) -> Result<AgentConfig, ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut layers = Vec::new();
    let base_path = source.base_path();
    let mut merged = read_layer(&base_path)?;
    layers.push(base_path.display().to_string());

    if let Some(env_path) = source.env_path() {
        if env_path.exists() {
            deep_merge(&mut merged, read_layer(&env_path)?);
            layers.push(env_path.display().to_string());
        } else {
            tracing::debug!(path = %env_path.display(), "environment config layer absent");
        }
    }

    let overrides = env_overrides(&source.env_prefix, vars);
    if !overrides.is_empty() {
        layers.push(format!("env:{}*", source.env_prefix));
        deep_merge(&mut merged, overrides);
    }

    let file = toml::Value::Table(merged)
        .try_into::<ConfigFile>()
        .map_err(|err| ConfigError::Invalid(err.to_string()))?;
    let mut config = resolve_config(file, registry)?;
    config.layers = layers;
    Ok(config)
}

fn read_layer(path: &Path) -> Result<toml::Table, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|err| ConfigError::Layer {
        path: path.display().to_string(),
        message: err.to_string(),
    })?;
    content
        .parse::<toml::Table>()
        .map_err(|err| ConfigError::Layer {
            path: path.display().to_string(),
            message: err.to_string(),
        })
}

/// Tables merge key by key; any other value in `overlay` replaces the base.
pub fn deep_merge(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(incoming) => match base.get_mut(&key) {
                Some(toml::Value::Table(existing)) => deep_merge(existing, incoming),
                _ => {
                    base.insert(key, toml::Value::Table(incoming));
                }
            },
            other => {
                base.insert(key, other);
            }
        }
    }
}

/// `KA_CORE__TICK_INTERVAL_MS=500` becomes `core.tick_interval_ms = 500`.
pub fn env_overrides<I>(prefix: &str, vars: I) -> toml::Table
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut table = toml::Table::new();
    for (key, value) in vars {
        let Some(path) = key.strip_prefix(prefix) else {
            continue;
        };
        let segments = path
            .split("__")
            .map(|segment| segment.trim().to_ascii_lowercase())
            .collect::<Vec<String>>();
        if segments.len() < 2 || segments.iter().any(String::is_empty) {
            tracing::debug!(key, "ignoring environment override without a section");
            continue;
        }
        insert_path(&mut table, &segments, coerce_env_value(&value));
    }
    table
}

fn insert_path(table: &mut toml::Table, segments: &[String], value: toml::Value) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut cursor = table;
    for segment in parents {
        let entry = cursor
            .entry(segment.clone())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        if !entry.is_table() {
            *entry = toml::Value::Table(toml::Table::new());
        }
        let toml::Value::Table(next) = entry else {
            return;
        };
        cursor = next;
    }
    cursor.insert(last.clone(), value);
}

pub fn coerce_env_value(raw: &str) -> toml::Value {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => return toml::Value::Boolean(true),
        "false" => return toml::Value::Boolean(false),
        _ => {}
    }
    if let Ok(integer) = trimmed.parse::<i64>() {
        return toml::Value::Integer(integer);
    }
    if let Ok(float) = trimmed.parse::<f64>()
        && float.is_finite()
    {
        return toml::Value::Float(float);
    }
    toml::Value::String(raw.to_string())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

pub fn resolve_config(
    file: ConfigFile,
    registry: &PluginRegistry,
) -> Result<AgentConfig, ConfigError> {
    validate_pipeline(&file.pipeline, "pipeline")?;
    if file.core.tick_interval_ms == 0 {
        return Err(ConfigError::Invalid(
            "core.tick_interval_ms must be positive".to_string(),
        ));
    }
    if !registry.contains(Capability::Llm, &file.llm.plugin) {
        return Err(ConfigError::Resolution(ResolutionError::UnknownPlugin {
            capability: Capability::Llm,
            name: file.llm.plugin.clone(),
        }));
    }

    let mut flows = BTreeMap::new();
    for (name, section) in &file.flows {
        flows.insert(name.clone(), resolve_flow(name, section, &file, registry)?);
    }

    let mut agents = Vec::new();
    for (name, section) in &file.agents {
        let mut seen = BTreeSet::new();
        let mut agent_flows = Vec::new();
        for flow_name in &section.flows {
            if !seen.insert(flow_name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "agent '{name}' lists flow '{flow_name}' twice"
                )));
            }
            let flow = flows
                .get(flow_name)
                .ok_or_else(|| ConfigError::UnknownFlow {
                    agent: name.clone(),
                    flow: flow_name.clone(),
                })?;
            agent_flows.push(flow.clone());
        }
        agents.push(AgentDefinition {
            name: name.clone(),
            enabled: section.enabled,
            description: section.description.clone(),
            flows: agent_flows,
        });
    }

    Ok(AgentConfig {
        core: file.core,
        llm: file.llm,
        pipeline: file.pipeline,
        agents,
        layers: Vec::new(),
    })
}

fn validate_pipeline(settings: &PipelineSettings, scope: &str) -> Result<(), ConfigError> {
    if settings.dedup_similarity.is_nan() || settings.dedup_similarity < 0.0 {
        return Err(ConfigError::Invalid(format!(
            "{scope}.dedup_similarity must be between 0 and 1 (or above 1 to disable)"
        )));
    }
    if settings.gap_concurrency == 0 {
        return Err(ConfigError::Invalid(format!(
            "{scope}.gap_concurrency must be at least 1"
        )));
    }
    if settings.stage_timeout_secs == 0 {
        return Err(ConfigError::Invalid(format!(
            "{scope}.stage_timeout_secs must be positive"
        )));
    }
    Ok(())
}

fn resolve_flow(
    name: &str,
    section: &FlowSection,
    file: &ConfigFile,
    registry: &PluginRegistry,
) -> Result<FlowDefinition, ConfigError> {
    let schedule = ScheduleSpec::parse(section.schedule.as_deref().unwrap_or_default())?;

    // split flow params into pipeline overrides, the prompt and per-task tables
    let mut pipeline_overrides = toml::Table::new();
    let mut task_overrides = BTreeMap::<String, toml::Table>::new();
    let mut prompt = None;
    for (key, value) in &section.params {
        if PIPELINE_KEYS.contains(&key.as_str()) {
            pipeline_overrides.insert(key.clone(), value.clone());
        } else if key == "prompt" {
            prompt = value.as_str().map(str::to_string);
            if prompt.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "flow '{name}' params.prompt must be a string"
                )));
            }
        } else if let (true, Some(table)) = (section.tasks.contains(key), value.as_table()) {
            task_overrides.insert(key.clone(), table.clone());
        } else {
            return Err(ConfigError::Invalid(format!(
                "flow '{name}' has unknown param '{key}'"
            )));
        }
    }
    let settings = apply_pipeline_overrides(&file.pipeline, pipeline_overrides)
        .map_err(|reason| ConfigError::Invalid(format!("flow '{name}' params: {reason}")))?;
    validate_pipeline(&settings, &format!("flows.{name}.params"))?;

    let mut stages = Vec::new();
    for task_name in &section.tasks {
        let task = file
            .tasks
            .get(task_name)
            .ok_or_else(|| ConfigError::UnknownTask {
                flow: name.to_string(),
                task: task_name.clone(),
            })?;
        let plugin = task
            .plugin
            .clone()
            .unwrap_or_else(|| task.kind.default_plugin(&file.llm));
        let capability = task.kind.capability();
        if !registry.contains(capability, &plugin) {
            return Err(ConfigError::Resolution(ResolutionError::UnknownPlugin {
                capability,
                name: plugin,
            }));
        }

        let mut params = table_to_params(&task.params);
        if let Some(overrides) = task_overrides.get(task_name) {
            params = params.merged(&table_to_params(overrides));
        }
        match task.kind {
            TaskKind::GenerateSearchTerms | TaskKind::CompileKnowledge
                if plugin == file.llm.plugin =>
            {
                params = file.llm.params().merged(&params);
            }
            TaskKind::WriteKnowledge => {
                params.insert_default("dir", file.core.knowledge_dir.display().to_string());
            }
            _ => {}
        }

        stages.push(StageDefinition {
            name: task_name.clone(),
            kind: task.kind,
            plugin: PluginRef {
                name: plugin,
                params,
            },
            retries: task.retries.unwrap_or(settings.retries),
            timeout_secs: task
                .timeout_secs
                .unwrap_or(settings.stage_timeout_secs)
                .max(1),
        });
    }
    validate_stage_order(name, &stages)?;

    Ok(FlowDefinition {
        name: name.to_string(),
        schedule,
        enabled: section.enabled,
        stages,
        settings,
        prompt,
        llm: PluginRef {
            name: file.llm.plugin.clone(),
            params: file.llm.params(),
        },
    })
}

fn apply_pipeline_overrides(
    base: &PipelineSettings,
    overrides: toml::Table,
) -> Result<PipelineSettings, String> {
    if overrides.is_empty() {
        return Ok(base.clone());
    }
    let mut table = match toml::Value::try_from(base).map_err(|err| err.to_string())? {
        toml::Value::Table(table) => table,
        _ => return Err("pipeline settings did not serialize to a table".to_string()),
    };
    deep_merge(&mut table, overrides);
    toml::Value::Table(table)
        .try_into::<PipelineSettings>()
        .map_err(|err| err.to_string())
}

fn validate_stage_order(flow: &str, stages: &[StageDefinition]) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::Stages {
        flow: flow.to_string(),
        reason,
    };
    let mut previous: Option<usize> = None;
    for stage in stages {
        let position = TaskKind::ORDER
            .iter()
            .position(|kind| *kind == stage.kind)
            .unwrap_or(TaskKind::ORDER.len());
        if let Some(prev) = previous
            && position <= prev
        {
            return Err(invalid(format!(
                "task '{}' ({}) is out of order or repeated; expected {}",
                stage.name,
                stage.kind,
                TaskKind::ORDER
                    .iter()
                    .map(|kind| kind.as_str())
                    .collect::<Vec<&str>>()
                    .join(" -> ")
            )));
        }
        previous = Some(position);
    }
    for kind in TaskKind::ORDER.iter().filter(|kind| kind.is_required()) {
        if !stages.iter().any(|stage| stage.kind == *kind) {
            return Err(invalid(format!("missing required {kind} task")));
        }
    }
    Ok(())
}

pub fn table_to_params(table: &toml::Table) -> PluginParams {
    PluginParams::from_map(
        table
            .iter()
            .filter_map(|(key, value)| {
                serde_json::to_value(value)
                    .ok()
                    .map(|json| (key.clone(), json))
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const BASE: &str = r#"
[core]
knowledge_dir = "kb"
checkpoint_dir = "cp"

[pipeline]
max_gaps_to_process = 2

[tasks.identify]
kind = "identify_gaps"
plugin = "topics"
params = { topics = ["transport", "security"] }

[tasks.terms]
kind = "generate_search_terms"

[tasks.search]
kind = "web_search"
plugin = "none"
retries = 4

[tasks.compile]
kind = "compile_knowledge"

[tasks.write]
kind = "write_knowledge"

[flows.research]
schedule = "interval:3600"
tasks = ["identify", "terms", "search", "compile", "write"]
params = { max_gaps = 4, prompt = "Find MCP gaps", compile = { temperature = 0.2 } }

[agents.mcp]
flows = ["research"]
"#;

    fn write_base(dir: &Path, content: &str) {
        std::fs::write(dir.join(BASE_CONFIG_FILE), content).expect("config should write");
    }

    fn registry() -> PluginRegistry {
        PluginRegistry::with_builtins().expect("builtins should register")
    }

    fn load(dir: &Path, env: Option<&str>, vars: Vec<(&str, &str)>) -> Result<AgentConfig, ConfigError> {
        let source = ConfigSource::new(dir).with_env(env.map(str::to_string));
        load_config_with_vars(
            &source,
            &registry(),
            vars.into_iter()
                .map(|(key, value)| (key.to_string(), value.to_string())),
        )
    }

    #[test]
    fn base_layer_resolves_flows_and_defaults() {
        let dir = tempdir().expect("temp directory should create");
        write_base(dir.path(), BASE);
        let config = load(dir.path(), None, Vec::new()).expect("config should load");

        assert_eq!(config.core.knowledge_dir, PathBuf::from("kb"));
        assert_eq!(config.core.tick_interval_ms, 1000);
        let agent = config.agent("mcp").expect("agent should exist");
        let flow = agent.flow("research").expect("flow should exist");
        assert_eq!(flow.schedule, ScheduleSpec::Interval(3600));
        assert_eq!(flow.settings.max_gaps, 4);
        assert_eq!(flow.settings.max_gaps_to_process, 2);
        assert_eq!(flow.prompt.as_deref(), Some("Find MCP gaps"));
        assert_eq!(flow.stages.len(), 5);

        let search = flow.stage(TaskKind::WebSearch).expect("search stage");
        assert_eq!(search.retries, 4);
        let compile = flow.stage(TaskKind::CompileKnowledge).expect("compile stage");
        assert_eq!(compile.plugin.name, "template");
        assert_eq!(
            compile.plugin.params.get("temperature"),
            Some(&serde_json::json!(0.2))
        );
        let write = flow.stage(TaskKind::WriteKnowledge).expect("write stage");
        assert_eq!(write.plugin.params.get("dir"), Some(&serde_json::json!("kb")));
    }

    #[test]
    fn env_file_and_variables_override_in_order() {
        let dir = tempdir().expect("temp directory should create");
        write_base(dir.path(), BASE);
        std::fs::write(
            dir.path().join("config.prod.toml"),
            "[core]\ntick_interval_ms = 250\n\n[flows.research]\nschedule = \"cron:0 * * * *\"\n",
        )
        .expect("env layer should write");

        let config = load(
            dir.path(),
            Some("prod"),
            vec![
                ("KA_CORE__TICK_INTERVAL_MS", "500"),
                ("KA_PIPELINE__DEDUP_SIMILARITY", "0.9"),
                ("KA_CORE__TELEMETRY_ENABLED", "false"),
                ("UNRELATED", "1"),
            ],
        )
        .expect("config should load");

        assert_eq!(config.core.tick_interval_ms, 500);
        assert!(!config.core.telemetry_enabled);
        assert_eq!(config.pipeline.dedup_similarity, 0.9);
        let flow = config.agents[0].flow("research").expect("flow should exist");
        assert_eq!(flow.schedule.to_string(), "cron:0 * * * *");
        // tasks table survives the env layer through deep merge
        assert_eq!(flow.stages.len(), 5);
        assert_eq!(config.layers.len(), 3);
    }

    #[test]
    fn missing_env_layer_is_optional() {
        let dir = tempdir().expect("temp directory should create");
        write_base(dir.path(), BASE);
        let config = load(dir.path(), Some("staging"), Vec::new()).expect("config should load");
        assert_eq!(config.layers.len(), 1);
    }

    #[test]
    fn missing_base_layer_is_an_error() {
        let dir = tempdir().expect("temp directory should create");
        assert!(matches!(
            load(dir.path(), None, Vec::new()),
            Err(ConfigError::Layer { .. })
        ));
    }

    #[test]
    fn invalid_schedule_fails_at_load() {
        let dir = tempdir().expect("temp directory should create");
        write_base(dir.path(), &BASE.replace("interval:3600", "interval:0"));
        assert!(matches!(
            load(dir.path(), None, Vec::new()),
            Err(ConfigError::Schedule { .. })
        ));
    }

    #[test]
    fn unknown_task_and_flow_references_fail() {
        let dir = tempdir().expect("temp directory should create");
        write_base(dir.path(), &BASE.replace("\"terms\", ", "\"ghost\", "));
        assert!(matches!(
            load(dir.path(), None, Vec::new()),
            Err(ConfigError::UnknownTask { .. })
        ));

        write_base(dir.path(), &BASE.replace("flows = [\"research\"]", "flows = [\"nightly\"]"));
        assert!(matches!(
            load(dir.path(), None, Vec::new()),
            Err(ConfigError::UnknownFlow { .. })
        ));
    }

    #[test]
    fn unknown_plugin_fails_at_load() {
        let dir = tempdir().expect("temp directory should create");
        write_base(dir.path(), &BASE.replace("plugin = \"none\"", "plugin = \"bing\""));
        let err = load(dir.path(), None, Vec::new()).expect_err("unknown plugin should fail");
        assert_eq!(err.to_string(), "unknown search plugin 'bing'");
    }

    #[test]
    fn stage_order_and_required_stages_are_validated() {
        let dir = tempdir().expect("temp directory should create");
        write_base(
            dir.path(),
            &BASE.replace(
                "[\"identify\", \"terms\", \"search\", \"compile\", \"write\"]",
                "[\"identify\", \"compile\", \"search\", \"write\"]",
            ),
        );
        assert!(matches!(
            load(dir.path(), None, Vec::new()),
            Err(ConfigError::Stages { .. })
        ));

        write_base(
            dir.path(),
            &BASE.replace(
                "[\"identify\", \"terms\", \"search\", \"compile\", \"write\"]",
                "[\"identify\", \"compile\"]",
            ),
        );
        let err = load(dir.path(), None, Vec::new()).expect_err("missing write should fail");
        assert!(err.to_string().contains("missing required write_knowledge task"));
    }

    #[test]
    fn optional_stages_may_be_omitted() {
        let dir = tempdir().expect("temp directory should create");
        write_base(
            dir.path(),
            &BASE.replace(
                "[\"identify\", \"terms\", \"search\", \"compile\", \"write\"]",
                "[\"identify\", \"compile\", \"write\"]",
            ),
        );
        let config = load(dir.path(), None, Vec::new()).expect("config should load");
        let flow = config.agents[0].flow("research").expect("flow");
        assert!(flow.stage(TaskKind::WebSearch).is_none());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = tempdir().expect("temp directory should create");
        write_base(dir.path(), &format!("{BASE}\n[core2]\nx = 1\n"));
        assert!(matches!(
            load(dir.path(), None, Vec::new()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn coerces_env_values() {
        assert_eq!(coerce_env_value("TRUE"), toml::Value::Boolean(true));
        assert_eq!(coerce_env_value("42"), toml::Value::Integer(42));
        assert_eq!(coerce_env_value("0.5"), toml::Value::Float(0.5));
        assert_eq!(
            coerce_env_value("interval:60"),
            toml::Value::String("interval:60".to_string())
        );
    }

    #[test]
    fn env_overrides_nest_on_double_underscore() {
        let table = env_overrides(
            "KA_",
            vec![
                ("KA_FLOWS__RESEARCH__SCHEDULE".to_string(), "disabled".to_string()),
                ("KA_NOSECTION".to_string(), "1".to_string()),
            ],
        );
        assert_eq!(
            table["flows"]["research"]["schedule"],
            toml::Value::String("disabled".to_string())
        );
        assert!(!table.contains_key("nosection"));
    }

    #[test]
    fn sample_config_is_valid() {
        let dir = tempdir().expect("temp directory should create");
        write_base(dir.path(), include_str!("../config/config.toml"));
        let config = load(dir.path(), None, Vec::new()).expect("sample config should load");
        assert!(!config.agents.is_empty());
    }
}
