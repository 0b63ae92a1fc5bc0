/// Plugin registry and capability traits.
///
/// Every pipeline stage delegates to a plugin resolved by (capability, name).
/// Resolution happens once, when a flow is registered, and yields shared
/// `Arc<dyn Trait>` handles.
pub mod gaps;
#[cfg(feature = "http-plugins")]
mod http;
pub mod llm;
pub mod search;
pub mod writer;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use crate::artifact::KnowledgeArtifact;
use crate::error::{ResolutionError, StageError};
use crate::gaps::IdentifiedGap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    GapIdentifier,
    Search,
    Llm,
    DocumentWriter,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::GapIdentifier,
        Capability::Search,
        Capability::Llm,
        Capability::DocumentWriter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::GapIdentifier => "gap_identifier",
            Capability::Search => "search",
            Capability::Llm => "llm",
            Capability::DocumentWriter => "document_writer",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Flat string-keyed plugin parameters. Unknown keys are ignored by plugins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginParams(BTreeMap<String, Value>);

impl PluginParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Inserts only when the key is absent.
    pub fn insert_default(&mut self, key: &str, value: impl Into<Value>) {
        self.0.entry(key.to_string()).or_insert_with(|| value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a copy where keys from `overrides` win.
    pub fn merged(&self, overrides: &PluginParams) -> PluginParams {
        let mut merged = self.0.clone();
        for (key, value) in &overrides.0 {
            merged.insert(key.clone(), value.clone());
        }
        PluginParams(merged)
    }

    pub fn reader<'a>(&'a self, capability: Capability, plugin: &'a str) -> ParamReader<'a> {
        ParamReader {
            params: self,
            capability,
            plugin,
        }
    }
}

/// Typed accessors that report failures against the owning plugin.
pub struct ParamReader<'a> {
    params: &'a PluginParams,
    capability: Capability,
    plugin: &'a str,
}

impl ParamReader<'_> {
    fn invalid(&self, param: &str, reason: impl Into<String>) -> ResolutionError {
        ResolutionError::InvalidParam {
            capability: self.capability,
            name: self.plugin.to_string(),
            param: param.to_string(),
            reason: reason.into(),
        }
    }

    pub fn missing(&self, param: &str) -> ResolutionError {
        ResolutionError::MissingParam {
            capability: self.capability,
            name: self.plugin.to_string(),
            param: param.to_string(),
        }
    }

    pub fn optional_str(&self, key: &str) -> Result<Option<String>, ResolutionError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(Value::Number(value)) => Ok(Some(value.to_string())),
            Some(Value::Bool(value)) => Ok(Some(value.to_string())),
            Some(other) => Err(self.invalid(key, format!("expected a string, got {other}"))),
        }
    }

    pub fn required_str(&self, key: &str) -> Result<String, ResolutionError> {
        self.optional_str(key)?
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| self.missing(key))
    }

    pub fn str_or(&self, key: &str, default: &str) -> Result<String, ResolutionError> {
        Ok(self
            .optional_str(key)?
            .unwrap_or_else(|| default.to_string()))
    }

    pub fn u64_or(&self, key: &str, default: u64) -> Result<u64, ResolutionError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Number(value)) => value
                .as_u64()
                .ok_or_else(|| self.invalid(key, "expected a non-negative integer")),
            Some(Value::String(value)) => value
                .trim()
                .parse::<u64>()
                .map_err(|err| self.invalid(key, err.to_string())),
            Some(other) => Err(self.invalid(key, format!("expected an integer, got {other}"))),
        }
    }

    pub fn f64_or(&self, key: &str, default: f64) -> Result<f64, ResolutionError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Number(value)) => value
                .as_f64()
                .ok_or_else(|| self.invalid(key, "expected a number")),
            Some(Value::String(value)) => value
                .trim()
                .parse::<f64>()
                .map_err(|err| self.invalid(key, err.to_string())),
            Some(other) => Err(self.invalid(key, format!("expected a number, got {other}"))),
        }
    }

    /// Accepts an array of strings or a comma-separated string.
    pub fn string_list(&self, key: &str) -> Result<Vec<String>, ResolutionError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::String(value)) => Ok(value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| self.invalid(key, "expected an array of strings"))
                })
                .collect(),
            Some(other) => Err(self.invalid(key, format!("expected a list, got {other}"))),
        }
    }
}

/// Reads a secret from params, falling back to an environment variable.
pub fn param_or_env(
    reader: &ParamReader<'_>,
    key: &str,
    env_var: &str,
) -> Result<String, ResolutionError> {
    if let Some(value) = reader.optional_str(key)?.filter(|v| !v.trim().is_empty()) {
        return Ok(value);
    }
    std::env::var(env_var)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| reader.missing(key))
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct GapRequest {
    /// Summary of existing knowledge (artifact titles).
    pub summary: String,
    pub prompt: Option<String>,
    pub max_gaps: usize,
    /// Flow LLM, when the flow configures one.
    pub llm: Option<Arc<dyn LlmPlugin>>,
}

impl fmt::Debug for GapRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GapRequest")
            .field("summary", &self.summary)
            .field("prompt", &self.prompt)
            .field("max_gaps", &self.max_gaps)
            .field("llm", &self.llm.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmPrompt {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[async_trait::async_trait]
pub trait GapIdentifier: Send + Sync {
    async fn identify(&self, request: &GapRequest) -> Result<Vec<IdentifiedGap>, StageError>;
}

#[async_trait::async_trait]
pub trait SearchPlugin: Send + Sync {
    async fn search(&self, query: &str, max_results: usize)
    -> Result<Vec<SearchResult>, StageError>;
}

#[async_trait::async_trait]
pub trait LlmPlugin: Send + Sync {
    async fn generate(&self, prompt: &LlmPrompt) -> Result<String, StageError>;
}

#[async_trait::async_trait]
pub trait DocumentWriter: Send + Sync {
    async fn write(&self, artifact: &KnowledgeArtifact) -> Result<PathBuf, StageError>;
    async fn read(&self, path: &Path) -> Result<KnowledgeArtifact, StageError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub type GapIdentifierFactory =
    Arc<dyn Fn(&PluginParams) -> Result<Arc<dyn GapIdentifier>, ResolutionError> + Send + Sync>;
pub type SearchFactory =
    Arc<dyn Fn(&PluginParams) -> Result<Arc<dyn SearchPlugin>, ResolutionError> + Send + Sync>;
pub type LlmFactory =
    Arc<dyn Fn(&PluginParams) -> Result<Arc<dyn LlmPlugin>, ResolutionError> + Send + Sync>;
pub type DocumentWriterFactory =
    Arc<dyn Fn(&PluginParams) -> Result<Arc<dyn DocumentWriter>, ResolutionError> + Send + Sync>;

#[derive(Clone)]
pub enum PluginFactory {
    GapIdentifier(GapIdentifierFactory),
    Search(SearchFactory),
    Llm(LlmFactory),
    DocumentWriter(DocumentWriterFactory),
}

impl PluginFactory {
    pub fn capability(&self) -> Capability {
        match self {
            PluginFactory::GapIdentifier(_) => Capability::GapIdentifier,
            PluginFactory::Search(_) => Capability::Search,
            PluginFactory::Llm(_) => Capability::Llm,
            PluginFactory::DocumentWriter(_) => Capability::DocumentWriter,
        }
    }
}

#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: BTreeMap<(Capability, String), PluginFactory>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.list())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in plugin registered.
    pub fn with_builtins() -> Result<Self, ResolutionError> {
        let mut registry = Self::new();
        gaps::register(&mut registry)?;
        search::register(&mut registry)?;
        llm::register(&mut registry)?;
        writer::register(&mut registry)?;
        Ok(registry)
    }

    pub fn register(&mut self, name: &str, factory: PluginFactory) -> Result<(), ResolutionError> {
        let capability = factory.capability();
        let key = (capability, name.to_string());
        if self.factories.contains_key(&key) {
            return Err(ResolutionError::Duplicate {
                capability,
                name: name.to_string(),
            });
        }
        self.factories.insert(key, factory);
        Ok(())
    }

    pub fn register_gap_identifier<F>(&mut self, name: &str, factory: F) -> Result<(), ResolutionError>
    where
        F: Fn(&PluginParams) -> Result<Arc<dyn GapIdentifier>, ResolutionError> + Send + Sync + 'static,
    {
        self.register(name, PluginFactory::GapIdentifier(Arc::new(factory)))
    }

    pub fn register_search<F>(&mut self, name: &str, factory: F) -> Result<(), ResolutionError>
    where
        F: Fn(&PluginParams) -> Result<Arc<dyn SearchPlugin>, ResolutionError> + Send + Sync + 'static,
    {
        self.register(name, PluginFactory::Search(Arc::new(factory)))
    }

    pub fn register_llm<F>(&mut self, name: &str, factory: F) -> Result<(), ResolutionError>
    where
        F: Fn(&PluginParams) -> Result<Arc<dyn LlmPlugin>, ResolutionError> + Send + Sync + 'static,
    {
        self.register(name, PluginFactory::Llm(Arc::new(factory)))
    }

    pub fn register_document_writer<F>(
        &mut self,
        name: &str,
        factory: F,
    ) -> Result<(), ResolutionError>
    where
        F: Fn(&PluginParams) -> Result<Arc<dyn DocumentWriter>, ResolutionError>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, PluginFactory::DocumentWriter(Arc::new(factory)))
    }

    fn lookup(&self, capability: Capability, name: &str) -> Result<&PluginFactory, ResolutionError> {
        self.factories
            .get(&(capability, name.to_string()))
            .ok_or_else(|| ResolutionError::UnknownPlugin {
                capability,
                name: name.to_string(),
            })
    }

    pub fn contains(&self, capability: Capability, name: &str) -> bool {
        self.lookup(capability, name).is_ok()
    }

    pub fn resolve_gap_identifier(
        &self,
        name: &str,
        params: &PluginParams,
    ) -> Result<Arc<dyn GapIdentifier>, ResolutionError> {
        match self.lookup(Capability::GapIdentifier, name)? {
            PluginFactory::GapIdentifier(factory) => factory(params),
            _ => unreachable!("registry keys are capability-typed"),
        }
    }

    pub fn resolve_search(
        &self,
        name: &str,
        params: &PluginParams,
    ) -> Result<Arc<dyn SearchPlugin>, ResolutionError> {
        match self.lookup(Capability::Search, name)? {
            PluginFactory::Search(factory) => factory(params),
            _ => unreachable!("registry keys are capability-typed"),
        }
    }

    pub fn resolve_llm(
        &self,
        name: &str,
        params: &PluginParams,
    ) -> Result<Arc<dyn LlmPlugin>, ResolutionError> {
        match self.lookup(Capability::Llm, name)? {
            PluginFactory::Llm(factory) => factory(params),
            _ => unreachable!("registry keys are capability-typed"),
        }
    }

    pub fn resolve_document_writer(
        &self,
        name: &str,
        params: &PluginParams,
    ) -> Result<Arc<dyn DocumentWriter>, ResolutionError> {
        match self.lookup(Capability::DocumentWriter, name)? {
            PluginFactory::DocumentWriter(factory) => factory(params),
            _ => unreachable!("registry keys are capability-typed"),
        }
    }

    /// Registered (capability, name) pairs in stable order.
    pub fn list(&self) -> Vec<(Capability, String)> {
        self.factories.keys().cloned().collect()
    }

    pub fn names(&self, capability: Capability) -> Vec<String> {
        self.factories
            .keys()
            .filter(|(cap, _)| *cap == capability)
            .map(|(_, name)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoLlm;

    #[async_trait::async_trait]
    impl LlmPlugin for EchoLlm {
        async fn generate(&self, prompt: &LlmPrompt) -> Result<String, StageError> {
            Ok(prompt.user.clone())
        }
    }

    #[test]
    fn builtins_cover_every_capability() {
        let registry = PluginRegistry::with_builtins().expect("builtins should register");
        for capability in Capability::ALL {
            assert!(
                !registry.names(capability).is_empty(),
                "no builtin for {capability}"
            );
        }
        assert!(registry.contains(Capability::GapIdentifier, "llm"));
        assert!(registry.contains(Capability::Llm, "template"));
        assert!(registry.contains(Capability::DocumentWriter, "markdown"));
    }

    #[test]
    fn duplicate_registration_is_rejected_per_capability() {
        let mut registry = PluginRegistry::new();
        registry
            .register_llm("echo", |_| Ok(Arc::new(EchoLlm) as Arc<dyn LlmPlugin>))
            .expect("first registration should succeed");
        let err = registry
            .register_llm("echo", |_| Ok(Arc::new(EchoLlm) as Arc<dyn LlmPlugin>))
            .expect_err("duplicate should fail");
        assert_eq!(
            err,
            ResolutionError::Duplicate {
                capability: Capability::Llm,
                name: "echo".to_string()
            }
        );
        // separate namespace
        registry
            .register_search("echo", |_| {
                Ok(Arc::new(search::NoSearch) as Arc<dyn SearchPlugin>)
            })
            .expect("same name under another capability should succeed");
    }

    #[test]
    fn unknown_plugin_names_capability() {
        let registry = PluginRegistry::new();
        let err = registry
            .resolve_search("bing", &PluginParams::new())
            .err()
            .expect("unknown plugin should fail");
        assert_eq!(err.to_string(), "unknown search plugin 'bing'");
    }

    #[tokio::test]
    async fn resolved_handles_are_callable() {
        let mut registry = PluginRegistry::new();
        registry
            .register_llm("echo", |_| Ok(Arc::new(EchoLlm) as Arc<dyn LlmPlugin>))
            .expect("registration should succeed");
        let llm = registry
            .resolve_llm("echo", &PluginParams::new())
            .expect("echo should resolve");
        let out = llm
            .generate(&LlmPrompt {
                system: String::new(),
                user: "hello".to_string(),
                temperature: 0.0,
                max_tokens: 10,
            })
            .await
            .expect("generate should succeed");
        assert_eq!(out, "hello");
    }

    #[test]
    fn param_reader_coerces_and_reports() {
        let params = PluginParams::new()
            .with("count", "3")
            .with("ratio", 0.5)
            .with("topics", serde_json::json!(["a", "b"]))
            .with("csv", "x, y ,,z")
            .with("bad", serde_json::json!({"nested": true}));
        let reader = params.reader(Capability::Search, "demo");
        assert_eq!(reader.u64_or("count", 1).expect("count"), 3);
        assert_eq!(reader.u64_or("absent", 7).expect("default"), 7);
        assert_eq!(reader.f64_or("ratio", 1.0).expect("ratio"), 0.5);
        assert_eq!(reader.string_list("topics").expect("topics"), vec!["a", "b"]);
        assert_eq!(reader.string_list("csv").expect("csv"), vec!["x", "y", "z"]);
        assert!(matches!(
            reader.required_str("absent"),
            Err(ResolutionError::MissingParam { .. })
        ));
        assert!(matches!(
            reader.optional_str("bad"),
            Err(ResolutionError::InvalidParam { .. })
        ));
    }

    #[test]
    fn merged_params_prefer_overrides() {
        let base = PluginParams::new().with("a", 1).with("b", 2);
        let merged = base.merged(&PluginParams::new().with("b", 3));
        assert_eq!(merged.get("a"), Some(&Value::from(1)));
        assert_eq!(merged.get("b"), Some(&Value::from(3)));
    }
}
