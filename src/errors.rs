//! Typed error hierarchy for sandsmith.
//!
//! Four enums cover the seams between subsystems:
//! - `SandboxError`: remote sandbox transport and runtime failures
//! - `LlmError`: chat-completion provider failures (classified for retry)
//! - `ToolArgsError`: tool calls whose arguments fail validation
//! - `WorkflowError`: a failed durable step, a failed terminal write, or a
//!   failure an earlier attempt already recorded

use std::time::Duration;

use thiserror::Error;

/// Errors from a sandbox provider or a connected sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox {id} not found (it may have passed its idle timeout)")]
    NotFound { id: String },

    #[error("File not found in sandbox: {path}")]
    FileNotFound { path: String },

    #[error("Command exited with code {exit_code}{}", .message.as_deref().map(|m| format!(": {}", m)).unwrap_or_default())]
    CommandFailed {
        exit_code: i32,
        message: Option<String>,
    },

    #[error("Sandbox API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Sandbox transport error: {0}")]
    Transport(String),

    #[error("Malformed sandbox response: {0}")]
    Protocol(String),
}

/// Broad classes of LLM failures, used to decide whether a retry is worthwhile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    RateLimited,
    ServerError,
    ClientError,
    Network,
    Parse,
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LlmErrorKind::RateLimited => "rate limited",
            LlmErrorKind::ServerError => "server error",
            LlmErrorKind::ClientError => "client error",
            LlmErrorKind::Network => "network error",
            LlmErrorKind::Parse => "parse error",
        };
        f.write_str(s)
    }
}

/// A failed chat-completion request.
#[derive(Debug, Error)]
#[error("LLM {kind}{}: {message}", .status.map(|s| format!(" ({})", s)).unwrap_or_default())]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub status: Option<u16>,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn from_status(
        status: u16,
        body: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        Self {
            kind: classify_http_status(status),
            status: Some(status),
            message: body.into(),
            retry_after,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            LlmErrorKind::RateLimited | LlmErrorKind::ServerError | LlmErrorKind::Network
        )
    }
}

/// Map an HTTP status code onto an error class.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        500..=599 => LlmErrorKind::ServerError,
        _ => LlmErrorKind::ClientError,
    }
}

/// Tool call arguments that could not be turned into a typed invocation.
#[derive(Debug, Error)]
pub enum ToolArgsError {
    #[error("Unknown tool '{0}'")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {source}")]
    Malformed {
        tool: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid arguments for {tool}: {reason}")]
    Invalid { tool: String, reason: String },
}

/// Errors that end a workflow run.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Step '{step}' failed: {source:#}")]
    Step {
        step: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to persist terminal record: {0:#}")]
    Persist(#[source] anyhow::Error),

    /// An earlier attempt already wrote the run's ERROR record.
    #[error("{0}")]
    Recorded(String),
}

impl WorkflowError {
    /// Name of the failing step, if the failure came from one.
    pub fn step(&self) -> Option<&str> {
        match self {
            WorkflowError::Step { step, .. } => Some(step),
            WorkflowError::Persist(_) | WorkflowError::Recorded(_) => None,
        }
    }

    /// Whether the failure is already final for the run.
    pub fn is_recorded(&self) -> bool {
        matches!(self, WorkflowError::Recorded(_))
    }
}
