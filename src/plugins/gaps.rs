/// Built-in gap identifiers.
use std::sync::Arc;

use crate::error::{ResolutionError, StageError};
use crate::gaps::{IdentifiedGap, normalize_description, parse_gap_lines};

use super::{Capability, GapIdentifier, GapRequest, LlmPrompt, PluginParams, PluginRegistry};

pub const DEFAULT_GAP_PROMPT: &str = "Identify knowledge gaps about MCP servers";

const GAP_SYSTEM_PROMPT: &str = "You are a knowledge management system for MCP (Model Context Protocol) servers.
Your task is to identify gaps in the current knowledge base.
Current knowledge files:
{summary}

Identify up to {max_gaps} specific areas where knowledge is missing or incomplete.
Focus on important technical aspects that would be valuable to document.
Answer with one gap per line and nothing else.";

pub const DEFAULT_TOPICS: &[&str] = &[
    "mcp server architecture",
    "mcp protocol basics",
    "mcp server implementation",
    "mcp client integration",
    "mcp security considerations",
    "mcp performance optimization",
];

pub fn register(registry: &mut PluginRegistry) -> Result<(), ResolutionError> {
    registry.register_gap_identifier("llm", |params| {
        Ok(Arc::new(LlmGapIdentifier::from_params(params)?) as Arc<dyn GapIdentifier>)
    })?;
    registry.register_gap_identifier("topics", |params| {
        Ok(Arc::new(TopicGapIdentifier::from_params(params)?) as Arc<dyn GapIdentifier>)
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Topic diff
// ---------------------------------------------------------------------------

/// Reports expected topics that no existing artifact title mentions.
#[derive(Debug, Clone)]
pub struct TopicGapIdentifier {
    topics: Vec<String>,
}

impl TopicGapIdentifier {
    pub fn new(topics: Vec<String>) -> Self {
        Self { topics }
    }

    pub fn from_params(params: &PluginParams) -> Result<Self, ResolutionError> {
        let reader = params.reader(Capability::GapIdentifier, "topics");
        let topics = reader.string_list("topics")?;
        if topics.is_empty() {
            return Ok(Self::new(
                DEFAULT_TOPICS.iter().map(|t| t.to_string()).collect(),
            ));
        }
        Ok(Self::new(topics))
    }

    pub fn missing_topics(&self, summary: &str, max_gaps: usize) -> Vec<IdentifiedGap> {
        let known = normalize_description(summary);
        self.topics
            .iter()
            .filter(|topic| !known.contains(&normalize_description(topic)))
            .take(max_gaps)
            .map(|topic| IdentifiedGap::new(format!("Missing knowledge about: {topic}")))
            .collect()
    }
}

#[async_trait::async_trait]
impl GapIdentifier for TopicGapIdentifier {
    async fn identify(&self, request: &GapRequest) -> Result<Vec<IdentifiedGap>, StageError> {
        Ok(self.missing_topics(&request.summary, request.max_gaps))
    }
}

// ---------------------------------------------------------------------------
// LLM
// ---------------------------------------------------------------------------

/// Asks the flow LLM for gaps and parses its list output.
///
/// Falls back to the topic diff when the model is unavailable or fails.
#[derive(Debug, Clone)]
pub struct LlmGapIdentifier {
    prompt: String,
    temperature: f32,
    max_tokens: u32,
    fallback: Option<TopicGapIdentifier>,
}

impl LlmGapIdentifier {
    pub fn from_params(params: &PluginParams) -> Result<Self, ResolutionError> {
        let reader = params.reader(Capability::GapIdentifier, "llm");
        let fallback_topics = reader.string_list("fallback_topics")?;
        let fallback = match reader.optional_str("fallback")?.as_deref() {
            Some("none") => None,
            _ if fallback_topics.is_empty() => Some(TopicGapIdentifier::new(
                DEFAULT_TOPICS.iter().map(|t| t.to_string()).collect(),
            )),
            _ => Some(TopicGapIdentifier::new(fallback_topics)),
        };
        Ok(Self {
            prompt: reader.str_or("prompt", DEFAULT_GAP_PROMPT)?,
            temperature: reader.f64_or("temperature", 0.7)? as f32,
            max_tokens: reader.u64_or("max_tokens", 300)? as u32,
            fallback,
        })
    }

    fn fallback_or(
        &self,
        request: &GapRequest,
        err: StageError,
    ) -> Result<Vec<IdentifiedGap>, StageError> {
        match &self.fallback {
            Some(topics) => {
                tracing::warn!(error = %err, "llm gap identification failed, using topic fallback");
                Ok(topics.missing_topics(&request.summary, request.max_gaps))
            }
            None => Err(err),
        }
    }
}

#[async_trait::async_trait]
impl GapIdentifier for LlmGapIdentifier {
    async fn identify(&self, request: &GapRequest) -> Result<Vec<IdentifiedGap>, StageError> {
        let Some(llm) = request.llm.as_ref() else {
            return self.fallback_or(
                request,
                StageError::permanent("llm gap identifier needs a flow llm"),
            );
        };
        let system = GAP_SYSTEM_PROMPT
            .replace("{summary}", &request.summary)
            .replace("{max_gaps}", &request.max_gaps.to_string());
        let prompt = LlmPrompt {
            system,
            user: request.prompt.clone().unwrap_or_else(|| self.prompt.clone()),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        match llm.generate(&prompt).await {
            Ok(text) if !text.trim().is_empty() => {
                let gaps = parse_gap_lines(&text, request.max_gaps);
                tracing::info!(count = gaps.len(), "llm identified knowledge gaps");
                Ok(gaps)
            }
            // transient failures go back to the retry loop before falling back
            Err(err) if err.is_transient() => Err(err),
            Ok(_) => self.fallback_or(request, StageError::permanent("llm returned no gaps")),
            Err(err) => self.fallback_or(request, err),
        }
    }
}
