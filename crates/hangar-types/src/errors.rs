//! Error types and conversions

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Client-facing error taxonomy.
///
/// Every error surfaced to a caller is classified under exactly one kind.
/// The kind decides health accounting and batch retry eligibility; see
/// [`ErrorKind::counts_against_health`] and [`ErrorKind::is_retryable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Validation,
    Timeout,
    Transport,
    Protocol,
    LaunchFailed,
    CircuitOpen,
    NoHealthyMember,
    RateLimited,
    Cancelled,
    Configuration,
    Internal,
    ToolError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::LaunchFailed => "launch_failed",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::NoHealthyMember => "no_healthy_member",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Internal => "internal",
            ErrorKind::ToolError => "tool_error",
        }
    }

    /// Whether a failure of this kind increments `consecutive_failures`.
    ///
    /// Only infrastructure failures count. Tool-domain errors, validation
    /// rejections and cancellations leave health untouched.
    pub fn counts_against_health(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Transport | ErrorKind::Protocol
        )
    }

    /// Whether the batch executor may retry a call that failed with this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Transport | ErrorKind::Protocol
        )
    }

    /// JSON-RPC error code used when this kind crosses the hangar's own
    /// wire. Standard codes where JSON-RPC defines one, the `-320xx`
    /// application band otherwise.
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            ErrorKind::Protocol => -32700,
            ErrorKind::Validation => -32602,
            ErrorKind::Internal => -32603,
            ErrorKind::ToolError => -32000,
            ErrorKind::NotFound => -32001,
            ErrorKind::Timeout => -32002,
            ErrorKind::Transport => -32003,
            ErrorKind::LaunchFailed => -32004,
            ErrorKind::RateLimited => -32005,
            ErrorKind::CircuitOpen => -32006,
            ErrorKind::NoHealthyMember => -32007,
            ErrorKind::Cancelled => -32008,
            ErrorKind::Configuration => -32009,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum HangarError {
    #[error("unknown_provider: {0}")]
    ProviderNotFound(String),

    #[error("unknown_group: {0}")]
    GroupNotFound(String),

    #[error("unknown_tool: {tool} (provider: {provider})")]
    ToolNotFound { provider: String, tool: String },

    #[error("validation: {0}")]
    Validation(String),

    #[error("timeout: {operation} after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("transport: {0}")]
    Transport(String),

    #[error("protocol: {0}")]
    Protocol(String),

    /// Provider process failed to start or died during the handshake.
    ///
    /// Carries whatever diagnostics the launcher could recover so the
    /// caller sees more than "spawn failed".
    #[error("launch_failed: {provider}: {message}")]
    LaunchFailed {
        provider: String,
        message: String,
        stderr_tail: Option<String>,
        exit_code: Option<i32>,
        suggestion: Option<String>,
    },

    #[error("provider_degraded: {provider} (retry in {backoff_remaining_s:.1}s)")]
    Degraded {
        provider: String,
        backoff_remaining_s: f64,
    },

    #[error("circuit_open: {0}")]
    CircuitOpen(String),

    #[error("no_healthy_member: {0}")]
    NoHealthyMember(String),

    #[error("rate_limited: {0}")]
    RateLimited(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("configuration: {0}")]
    Configuration(String),

    #[error("internal: {0}")]
    Internal(String),

    /// Error returned by the upstream tool itself. Passed through verbatim
    /// and never counted against provider health.
    #[error("tool_error: {message}")]
    ToolError {
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type HangarResult<T> = Result<T, HangarError>;

impl HangarError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HangarError::ProviderNotFound(_)
            | HangarError::GroupNotFound(_)
            | HangarError::ToolNotFound { .. } => ErrorKind::NotFound,
            HangarError::Validation(_) => ErrorKind::Validation,
            HangarError::Timeout { .. } => ErrorKind::Timeout,
            HangarError::Transport(_) | HangarError::Io(_) => ErrorKind::Transport,
            HangarError::Protocol(_) | HangarError::Serialization(_) => ErrorKind::Protocol,
            HangarError::LaunchFailed { .. } | HangarError::Degraded { .. } => {
                ErrorKind::LaunchFailed
            }
            HangarError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            HangarError::NoHealthyMember(_) => ErrorKind::NoHealthyMember,
            HangarError::RateLimited(_) => ErrorKind::RateLimited,
            HangarError::Cancelled(_) => ErrorKind::Cancelled,
            HangarError::Configuration(_) => ErrorKind::Configuration,
            HangarError::Internal(_) => ErrorKind::Internal,
            HangarError::ToolError { .. } => ErrorKind::ToolError,
        }
    }

    pub fn counts_against_health(&self) -> bool {
        self.kind().counts_against_health()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Deep-copy an error so one outcome can fan out to many waiters.
    ///
    /// `Io` and `Serialization` variants wrap non-cloneable sources and
    /// collapse to their message form; the kind is preserved.
    pub fn duplicate(&self) -> HangarError {
        match self {
            HangarError::ProviderNotFound(s) => HangarError::ProviderNotFound(s.clone()),
            HangarError::GroupNotFound(s) => HangarError::GroupNotFound(s.clone()),
            HangarError::ToolNotFound { provider, tool } => HangarError::ToolNotFound {
                provider: provider.clone(),
                tool: tool.clone(),
            },
            HangarError::Validation(s) => HangarError::Validation(s.clone()),
            HangarError::Timeout {
                operation,
                elapsed_ms,
            } => HangarError::Timeout {
                operation: operation.clone(),
                elapsed_ms: *elapsed_ms,
            },
            HangarError::Transport(s) => HangarError::Transport(s.clone()),
            HangarError::Protocol(s) => HangarError::Protocol(s.clone()),
            HangarError::LaunchFailed {
                provider,
                message,
                stderr_tail,
                exit_code,
                suggestion,
            } => HangarError::LaunchFailed {
                provider: provider.clone(),
                message: message.clone(),
                stderr_tail: stderr_tail.clone(),
                exit_code: *exit_code,
                suggestion: suggestion.clone(),
            },
            HangarError::Degraded {
                provider,
                backoff_remaining_s,
            } => HangarError::Degraded {
                provider: provider.clone(),
                backoff_remaining_s: *backoff_remaining_s,
            },
            HangarError::CircuitOpen(s) => HangarError::CircuitOpen(s.clone()),
            HangarError::NoHealthyMember(s) => HangarError::NoHealthyMember(s.clone()),
            HangarError::RateLimited(s) => HangarError::RateLimited(s.clone()),
            HangarError::Cancelled(s) => HangarError::Cancelled(s.clone()),
            HangarError::Configuration(s) => HangarError::Configuration(s.clone()),
            HangarError::Internal(s) => HangarError::Internal(s.clone()),
            HangarError::ToolError { message, data } => HangarError::ToolError {
                message: message.clone(),
                data: data.clone(),
            },
            HangarError::Io(e) => HangarError::Transport(e.to_string()),
            HangarError::Serialization(e) => HangarError::Protocol(e.to_string()),
        }
    }

    /// Build the serializable envelope handed to clients.
    pub fn to_envelope(&self, provider_id: Option<&str>, operation: Option<&str>) -> ErrorEnvelope {
        let (details, recovery_hints) = match self {
            HangarError::LaunchFailed {
                stderr_tail,
                exit_code,
                suggestion,
                ..
            } => {
                let mut details = serde_json::Map::new();
                if let Some(tail) = stderr_tail {
                    details.insert("stderr_tail".into(), serde_json::json!(tail));
                }
                if let Some(code) = exit_code {
                    details.insert("exit_code".into(), serde_json::json!(code));
                }
                let hints = suggestion.as_ref().map(|s| vec![s.clone()]);
                let details = if details.is_empty() {
                    None
                } else {
                    Some(serde_json::Value::Object(details))
                };
                (details, hints)
            }
            HangarError::Degraded {
                backoff_remaining_s,
                ..
            } => (
                Some(serde_json::json!({ "backoff_remaining_s": backoff_remaining_s })),
                Some(vec![format!(
                    "Retry after {:.1}s or stop/start the provider explicitly",
                    backoff_remaining_s
                )]),
            ),
            HangarError::ToolError { data, .. } => (data.clone(), None),
            _ => (None, None),
        };

        ErrorEnvelope {
            error: self.to_string(),
            kind: self.kind(),
            provider_id: provider_id.map(str::to_string),
            operation: operation.map(str::to_string),
            details,
            recovery_hints,
        }
    }
}

/// Serializable error shape surfaced through the client-facing tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_hints: Option<Vec<String>>,
}
