use thiserror::Error;

use crate::plugins::Capability;

// ---------------------------------------------------------------------------
// Typed error taxonomy
// ---------------------------------------------------------------------------

/// Load-time configuration failure. Aborts startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config layer '{path}': {message}")]
    Layer { path: String, message: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("invalid schedule '{spec}': {reason}")]
    Schedule { spec: String, reason: String },
    #[error("flow '{flow}' references unknown task '{task}'")]
    UnknownTask { flow: String, task: String },
    #[error("agent '{agent}' references unknown flow '{flow}'")]
    UnknownFlow { agent: String, flow: String },
    #[error("flow '{flow}' has invalid stages: {reason}")]
    Stages { flow: String, reason: String },
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

/// Plugin lookup or instantiation failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("unknown {capability} plugin '{name}'")]
    UnknownPlugin { capability: Capability, name: String },
    #[error("{capability} plugin '{name}' is already registered")]
    Duplicate { capability: Capability, name: String },
    #[error("{capability} plugin '{name}' requires parameter '{param}'")]
    MissingParam {
        capability: Capability,
        name: String,
        param: String,
    },
    #[error("{capability} plugin '{name}' has invalid parameter '{param}': {reason}")]
    InvalidParam {
        capability: Capability,
        name: String,
        param: String,
        reason: String,
    },
    #[error("flow '{flow}' has no {stage} task")]
    MissingStage { flow: String, stage: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageErrorKind {
    /// Network, timeout, rate limit. Retried with backoff.
    Transient,
    /// Malformed input or output. Recorded without retry.
    Permanent,
}

impl std::fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageErrorKind::Transient => write!(f, "transient"),
            StageErrorKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Failure of a single pipeline stage call.
#[derive(Debug, Clone, Error)]
#[error("{kind} stage failure: {message}")]
pub struct StageError {
    pub kind: StageErrorKind,
    pub message: String,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == StageErrorKind::Transient
    }
}

/// Checkpoint durability failure. Prior durable state is left intact.
#[derive(Debug, Error)]
pub enum CheckpointIoError {
    #[error("checkpoint io failure at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize checkpoint for agent '{agent}': {message}")]
    Serialize { agent: String, message: String },
    #[error("refusing to move cycle_count backwards for agent '{agent}' ({stored} -> {attempted})")]
    Regression {
        agent: String,
        stored: u64,
        attempted: u64,
    },
}

/// Cycle-level failure surfaced to the scheduler and status.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointIoError),
    #[error("gap identification failed: {0}")]
    Identify(StageError),
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("agent manager is already started")]
    AlreadyStarted,
    #[error("agent '{0}' is not configured")]
    UnknownAgent(String),
    #[error("flow '{flow}' is not registered for agent '{agent}'")]
    UnknownFlow { agent: String, flow: String },
    #[error("flow '{flow}' of agent '{agent}' is already running; trigger skipped")]
    Overlap { agent: String, flow: String },
    #[error("agent '{0}' has a cycle in flight")]
    Busy(String),
    #[error("flow '{flow}' of agent '{agent}' could not be resolved: {source}")]
    Resolution {
        agent: String,
        flow: String,
        #[source]
        source: ResolutionError,
    },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointIoError),
    #[error(transparent)]
    Cycle(#[from] CycleError),
}

// ---------------------------------------------------------------------------
// CLI presentation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Plugin,
    Checkpoint,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Config => "CONFIG",
            ErrorCategory::Plugin => "PLUGIN",
            ErrorCategory::Checkpoint => "CHECKPOINT",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Config => {
                "Check config.toml, the --env overlay and KA_* environment overrides. Run knowledge-agent doctor."
            }
            ErrorCategory::Plugin => {
                "Check task plugin names and required params (for example OPENROUTER_API_KEY or MCP_SERVER_URL)."
            }
            ErrorCategory::Checkpoint => {
                "Check that core.checkpoint_dir is writable. Prior checkpoints are never overwritten partially."
            }
            ErrorCategory::Input => "Run knowledge-agent --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    for cause in err.chain() {
        if cause.downcast_ref::<ConfigError>().is_some() {
            return ErrorCategory::Config;
        }
        if cause.downcast_ref::<ResolutionError>().is_some() {
            return ErrorCategory::Plugin;
        }
        if cause.downcast_ref::<CheckpointIoError>().is_some() {
            return ErrorCategory::Checkpoint;
        }
        if let Some(manager) = cause.downcast_ref::<ManagerError>() {
            return match manager {
                ManagerError::UnknownAgent(_) | ManagerError::UnknownFlow { .. } => {
                    ErrorCategory::Input
                }
                ManagerError::Resolution { .. } => ErrorCategory::Plugin,
                ManagerError::Checkpoint(_) => ErrorCategory::Checkpoint,
                _ => ErrorCategory::Internal,
            };
        }
    }

    let msg = format!("{err:#}").to_ascii_lowercase();
    if msg.contains("--force") || msg.contains("invalid value") || msg.contains("unknown argument")
    {
        return ErrorCategory::Input;
    }
    if msg.contains("config") || msg.contains("schedule") {
        return ErrorCategory::Config;
    }
    if msg.contains("checkpoint") {
        return ErrorCategory::Checkpoint;
    }
    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error) -> String {
    let category = categorize_error(err);
    format!(
        "[{}] {}\nHint: {}",
        category.code(),
        redact_sensitive_text(&format!("{err:#}")),
        category.hint()
    )
}

const SECRET_MARKERS: &[&str] = &["api_key=", "token=", "bearer "];

/// Masks values that follow well-known secret markers.
pub fn redact_sensitive_text(text: &str) -> String {
    let mut out = text.to_string();
    for marker in SECRET_MARKERS {
        let mut cursor = 0usize;
        loop {
            let lower = out.to_ascii_lowercase();
            let Some(offset) = lower[cursor..].find(marker) else {
                break;
            };
            let value_start = cursor + offset + marker.len();
            let value_end = out[value_start..]
                .find(|ch: char| ch.is_whitespace() || matches!(ch, '&' | '"' | '\'' | ','))
                .map(|end| value_start + end)
                .unwrap_or(out.len());
            out.replace_range(value_start..value_end, "[REDACTED]");
            cursor = value_start + "[REDACTED]".len();
        }
    }
    out
}
