/// Shared reqwest plumbing for the HTTP-backed plugins.
use std::time::Duration;

use crate::error::{ResolutionError, StageError, redact_sensitive_text};

use super::Capability;

pub(crate) fn build_client(
    capability: Capability,
    plugin: &str,
    timeout_secs: u64,
) -> Result<reqwest::Client, ResolutionError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .user_agent(concat!("knowledge-agent/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| ResolutionError::InvalidParam {
            capability,
            name: plugin.to_string(),
            param: "timeout_secs".to_string(),
            reason: err.to_string(),
        })
}

/// Connection failures and timeouts are retried; everything else is not.
pub(crate) fn send_error(context: &str, err: reqwest::Error) -> StageError {
    let message = redact_sensitive_text(&format!("{context}: {err}"));
    if err.is_timeout() || err.is_connect() || err.is_request() {
        StageError::transient(message)
    } else {
        StageError::permanent(message)
    }
}

/// Maps a non-success response into a stage error. Rate limits and server
/// errors are transient.
pub(crate) async fn status_error(context: &str, response: reqwest::Response) -> StageError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    let snippet = body.chars().take(200).collect::<String>();
    let message = redact_sensitive_text(&format!("{context}: HTTP {status}: {snippet}"));
    if status.as_u16() == 429 || status.is_server_error() {
        StageError::transient(message)
    } else {
        StageError::permanent(message)
    }
}
