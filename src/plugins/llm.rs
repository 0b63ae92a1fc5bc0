/// Built-in LLM plugins.
use std::sync::Arc;

use crate::error::{ResolutionError, StageError};

use super::{Capability, LlmPlugin, LlmPrompt, PluginParams, PluginRegistry};

pub fn register(registry: &mut PluginRegistry) -> Result<(), ResolutionError> {
    registry.register_llm("template", |params| {
        Ok(Arc::new(TemplateLlm::from_params(params)?) as Arc<dyn LlmPlugin>)
    })?;
    #[cfg(feature = "http-plugins")]
    registry.register_llm("openrouter", |params| {
        Ok(Arc::new(openrouter::OpenRouterLlm::from_params(params)?) as Arc<dyn LlmPlugin>)
    })?;
    Ok(())
}

/// Offline, deterministic model used for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct TemplateLlm {
    response: Option<String>,
}

impl TemplateLlm {
    pub fn from_params(params: &PluginParams) -> Result<Self, ResolutionError> {
        let reader = params.reader(Capability::Llm, "template");
        Ok(Self {
            response: reader.optional_str("response")?,
        })
    }
}

/// Subject of a request: text after the last ':' of the first user line.
fn prompt_subject(user: &str) -> String {
    let first = user.lines().next().unwrap_or_default().trim();
    first
        .rsplit_once(':')
        .map(|(_, subject)| subject.trim())
        .filter(|subject| !subject.is_empty())
        .unwrap_or(first)
        .to_string()
}

#[async_trait::async_trait]
impl LlmPlugin for TemplateLlm {
    async fn generate(&self, prompt: &LlmPrompt) -> Result<String, StageError> {
        if let Some(response) = &self.response {
            return Ok(response.clone());
        }
        let subject = prompt_subject(&prompt.user);
        if subject.is_empty() {
            return Err(StageError::permanent("template llm received an empty prompt"));
        }
        Ok(format!(
            "# {subject}\n\nThis entry is a placeholder for {subject}. \
             Configure a networked llm plugin to replace it with researched content."
        ))
    }
}

#[cfg(feature = "http-plugins")]
pub mod openrouter {
    //! OpenAI-compatible chat completions through OpenRouter.

    use serde::Deserialize;

    use crate::error::{ResolutionError, StageError};
    use crate::plugins::http::{build_client, send_error, status_error};
    use crate::plugins::{Capability, LlmPlugin, LlmPrompt, PluginParams, param_or_env};

    pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
    pub const DEFAULT_MODEL: &str = "google/gemini-2.0-flash-lite-001";

    pub struct OpenRouterLlm {
        client: reqwest::Client,
        api_key: String,
        base_url: String,
        model: String,
        max_tokens_cap: Option<u32>,
    }

    impl std::fmt::Debug for OpenRouterLlm {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("OpenRouterLlm")
                .field("base_url", &self.base_url)
                .field("model", &self.model)
                .finish_non_exhaustive()
        }
    }

    #[derive(Debug, Deserialize)]
    struct CompletionResponse {
        #[serde(default)]
        choices: Vec<Choice>,
    }

    #[derive(Debug, Deserialize)]
    struct Choice {
        message: Message,
    }

    #[derive(Debug, Deserialize)]
    struct Message {
        #[serde(default)]
        content: Option<String>,
    }

    impl OpenRouterLlm {
        pub fn from_params(params: &PluginParams) -> Result<Self, ResolutionError> {
            let reader = params.reader(Capability::Llm, "openrouter");
            let api_key = param_or_env(&reader, "api_key", "OPENROUTER_API_KEY")?;
            let max_tokens_cap = match reader.u64_or("max_tokens", 0)? {
                0 => None,
                cap => Some(u32::try_from(cap).unwrap_or(u32::MAX)),
            };
            Ok(Self {
                client: build_client(
                    Capability::Llm,
                    "openrouter",
                    reader.u64_or("timeout_secs", 30)?,
                )?,
                api_key,
                base_url: reader
                    .str_or("base_url", DEFAULT_BASE_URL)?
                    .trim_end_matches('/')
                    .to_string(),
                model: reader.str_or("model", DEFAULT_MODEL)?,
                max_tokens_cap,
            })
        }
    }

    #[async_trait::async_trait]
    impl LlmPlugin for OpenRouterLlm {
        async fn generate(&self, prompt: &LlmPrompt) -> Result<String, StageError> {
            let max_tokens = match self.max_tokens_cap {
                Some(cap) => prompt.max_tokens.min(cap),
                None => prompt.max_tokens,
            };
            let response = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("HTTP-Referer", "https://github.com/knowledge-agent")
                .json(&serde_json::json!({
                    "model": self.model,
                    "messages": [
                        {"role": "system", "content": prompt.system},
                        {"role": "user", "content": prompt.user},
                    ],
                    "temperature": prompt.temperature,
                    "max_tokens": max_tokens,
                }))
                .send()
                .await
                .map_err(|err| send_error("llm request failed", err))?;
            if !response.status().is_success() {
                return Err(status_error("llm request rejected", response).await);
            }
            let completion = response
                .json::<CompletionResponse>()
                .await
                .map_err(|err| StageError::permanent(format!("invalid llm response: {err}")))?;
            let content = completion
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .map(|content| content.trim().to_string())
                .filter(|content| !content.is_empty())
                .ok_or_else(|| StageError::permanent("llm response has no content"))?;
            tracing::debug!(model = %self.model, chars = content.len(), "llm completion received");
            Ok(content)
        }
    }
}
