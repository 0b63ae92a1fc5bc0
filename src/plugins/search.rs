/// Built-in search plugins.
use std::sync::Arc;

use crate::error::{ResolutionError, StageError};

use super::{PluginRegistry, SearchPlugin, SearchResult};

pub fn register(registry: &mut PluginRegistry) -> Result<(), ResolutionError> {
    registry.register_search("none", |_| Ok(Arc::new(NoSearch) as Arc<dyn SearchPlugin>))?;
    #[cfg(feature = "http-plugins")]
    registry.register_search("mcp", |params| {
        Ok(Arc::new(gateway::McpGatewaySearch::from_params(params)?) as Arc<dyn SearchPlugin>)
    })?;
    Ok(())
}

/// Always returns no results; compile then falls back to uncited content.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSearch;

#[async_trait::async_trait]
impl SearchPlugin for NoSearch {
    async fn search(
        &self,
        _query: &str,
        _max_results: usize,
    ) -> Result<Vec<SearchResult>, StageError> {
        Ok(Vec::new())
    }
}

#[cfg(feature = "http-plugins")]
pub mod gateway {
    //! Search through an MCP search gateway (handshake, then session-scoped
    //! `/search` calls).

    use serde::Deserialize;
    use tokio::sync::Mutex;

    use crate::error::{ResolutionError, StageError};
    use crate::plugins::http::{build_client, send_error, status_error};
    use crate::plugins::{Capability, PluginParams, SearchPlugin, SearchResult};

    pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080";

    #[derive(Debug)]
    pub struct McpGatewaySearch {
        client: reqwest::Client,
        server_url: String,
        session: Mutex<Option<String>>,
    }

    #[derive(Debug, Deserialize)]
    struct HandshakeResponse {
        session_id: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    struct SearchResponse {
        #[serde(default)]
        results: Vec<RawResult>,
    }

    #[derive(Debug, Deserialize)]
    struct RawResult {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        snippet: Option<String>,
        #[serde(default)]
        description: Option<String>,
    }

    impl McpGatewaySearch {
        pub fn from_params(params: &PluginParams) -> Result<Self, ResolutionError> {
            let reader = params.reader(Capability::Search, "mcp");
            let server_url = match reader.optional_str("server_url")? {
                Some(url) if !url.trim().is_empty() => url,
                _ => std::env::var("MCP_SERVER_URL")
                    .unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string()),
            };
            let timeout_secs = reader.u64_or("timeout_secs", 30)?;
            Ok(Self {
                client: build_client(Capability::Search, "mcp", timeout_secs)?,
                server_url: server_url.trim_end_matches('/').to_string(),
                session: Mutex::new(None),
            })
        }

        async fn session_id(&self) -> Result<String, StageError> {
            let mut session = self.session.lock().await;
            if let Some(id) = session.as_ref() {
                return Ok(id.clone());
            }
            let response = self
                .client
                .post(format!("{}/handshake", self.server_url))
                .json(&serde_json::json!({
                    "client_name": "knowledge-agent",
                    "client_version": env!("CARGO_PKG_VERSION"),
                }))
                .send()
                .await
                .map_err(|err| send_error("search gateway handshake failed", err))?;
            if !response.status().is_success() {
                return Err(status_error("search gateway handshake rejected", response).await);
            }
            let handshake = response
                .json::<HandshakeResponse>()
                .await
                .map_err(|err| StageError::permanent(format!("invalid handshake response: {err}")))?;
            let id = handshake
                .session_id
                .ok_or_else(|| StageError::permanent("handshake response has no session_id"))?;
            tracing::debug!(server = %self.server_url, "search gateway session opened");
            *session = Some(id.clone());
            Ok(id)
        }
    }

    #[async_trait::async_trait]
    impl SearchPlugin for McpGatewaySearch {
        async fn search(
            &self,
            query: &str,
            max_results: usize,
        ) -> Result<Vec<SearchResult>, StageError> {
            let session_id = self.session_id().await?;
            let response = self
                .client
                .post(format!("{}/search", self.server_url))
                .json(&serde_json::json!({
                    "session_id": session_id,
                    "query": query,
                    "max_results": max_results,
                }))
                .send()
                .await
                .map_err(|err| send_error("search request failed", err))?;
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 404 {
                // expired session: reconnect on the next attempt
                *self.session.lock().await = None;
                return Err(StageError::transient(format!(
                    "search session rejected with HTTP {status}"
                )));
            }
            if !status.is_success() {
                return Err(status_error("search request rejected", response).await);
            }
            let body = response
                .json::<SearchResponse>()
                .await
                .map_err(|err| StageError::permanent(format!("invalid search response: {err}")))?;
            let results = body
                .results
                .into_iter()
                .filter_map(|raw| {
                    let url = raw.url.filter(|url| !url.trim().is_empty())?;
                    Some(SearchResult {
                        title: raw.title.unwrap_or_else(|| url.clone()),
                        snippet: raw.snippet.or(raw.description).unwrap_or_default(),
                        url,
                    })
                })
                .take(max_results)
                .collect::<Vec<SearchResult>>();
            tracing::info!(query, count = results.len(), "search completed");
            Ok(results)
        }
    }
}
