//! Structured errors surfaced to the agent runtime.
//!
//! Every tool-scoped failure names the server and tool it came from so the
//! caller can decide to switch tools. Remote payloads are truncated before
//! they are stored.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::mcp::ServerId;

/// Maximum number of characters of an upstream payload kept in an error.
pub const MAX_PAYLOAD_CHARS: usize = 512;

/// Truncate an upstream payload on a char boundary.
pub fn truncate_payload(payload: &str) -> String {
    match payload.char_indices().nth(MAX_PAYLOAD_CHARS) {
        Some((idx, _)) => format!("{}…", &payload[..idx]),
        None => payload.to_string(),
    }
}

/// Which timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    /// Opening a session.
    Connect,
    /// A single remote call.
    Call,
    /// The whole invocation including retries.
    Invocation,
}

impl TimeoutStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutStage::Connect => "connect",
            TimeoutStage::Call => "call",
            TimeoutStage::Invocation => "invocation",
        }
    }
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat discriminant of [`ToolError`], handy for log fields and matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Auth,
    RateLimited,
    ToolExecution,
    SchemaValidation,
    CircuitOpen,
    Timeout,
    UnknownServer,
    DuplicateServer,
    UnknownTool,
    InvalidConfig,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ToolExecution => "tool_execution",
            ErrorKind::SchemaValidation => "schema_validation",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Timeout => "timeout",
            ErrorKind::UnknownServer => "unknown_server",
            ErrorKind::DuplicateServer => "duplicate_server",
            ErrorKind::UnknownTool => "unknown_tool",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by connection, discovery and invocation operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolError {
    /// The session could not be opened or broke mid-call.
    #[error("connection to '{server_id}' failed: {message}")]
    Connection { server_id: ServerId, message: String },

    /// The endpoint rejected our credentials, or they could not be resolved.
    #[error("authentication with '{server_id}' failed: {message}")]
    Auth { server_id: ServerId, message: String },

    /// The server asked us to slow down.
    #[error("'{server_id}/{tool}' is rate limited: {message}")]
    RateLimited {
        server_id: ServerId,
        tool: String,
        retry_after: Option<Duration>,
        message: String,
    },

    /// The remote tool ran but failed or returned malformed output.
    #[error("'{server_id}/{tool}' failed: {payload}")]
    ToolExecution {
        server_id: ServerId,
        tool: String,
        payload: String,
    },

    /// Arguments did not match the tool's input schema.
    #[error("invalid arguments for '{server_id}/{tool}': {reason}")]
    SchemaValidation {
        server_id: ServerId,
        tool: String,
        reason: String,
    },

    /// The breaker for this tool is open; the server was not contacted.
    #[error("circuit open for '{server_id}/{tool}' after {failures} consecutive failures")]
    CircuitOpen {
        server_id: ServerId,
        tool: String,
        failures: u32,
    },

    #[error("{stage} timeout for '{server_id}' after {}ms", after.as_millis())]
    Timeout {
        server_id: ServerId,
        tool: Option<String>,
        stage: TimeoutStage,
        after: Duration,
    },

    #[error("unknown server '{0}'")]
    UnknownServer(ServerId),

    #[error("server '{0}' is already registered")]
    DuplicateServer(ServerId),

    #[error("server '{server_id}' does not expose tool '{tool}'")]
    UnknownTool { server_id: ServerId, tool: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invocation of '{server_id}/{tool}' was cancelled")]
    Cancelled { server_id: ServerId, tool: String },
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::Connection { .. } => ErrorKind::Connection,
            ToolError::Auth { .. } => ErrorKind::Auth,
            ToolError::RateLimited { .. } => ErrorKind::RateLimited,
            ToolError::ToolExecution { .. } => ErrorKind::ToolExecution,
            ToolError::SchemaValidation { .. } => ErrorKind::SchemaValidation,
            ToolError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            ToolError::Timeout { .. } => ErrorKind::Timeout,
            ToolError::UnknownServer(_) => ErrorKind::UnknownServer,
            ToolError::DuplicateServer(_) => ErrorKind::DuplicateServer,
            ToolError::UnknownTool { .. } => ErrorKind::UnknownTool,
            ToolError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            ToolError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Server this error is attributed to, if any.
    pub fn server_id(&self) -> Option<&ServerId> {
        match self {
            ToolError::Connection { server_id, .. }
            | ToolError::Auth { server_id, .. }
            | ToolError::RateLimited { server_id, .. }
            | ToolError::ToolExecution { server_id, .. }
            | ToolError::SchemaValidation { server_id, .. }
            | ToolError::CircuitOpen { server_id, .. }
            | ToolError::Timeout { server_id, .. }
            | ToolError::UnknownTool { server_id, .. }
            | ToolError::Cancelled { server_id, .. } => Some(server_id),
            ToolError::UnknownServer(id) | ToolError::DuplicateServer(id) => Some(id),
            ToolError::InvalidConfig(_) => None,
        }
    }

    pub fn tool_execution(server_id: &ServerId, tool: &str, payload: &str) -> Self {
        ToolError::ToolExecution {
            server_id: server_id.clone(),
            tool: tool.to_string(),
            payload: truncate_payload(payload),
        }
    }
}

/// More tools were available than an agent may hold.
///
/// Informational: it rides along in the selection report and is never
/// returned as an `Err`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{available} tools available for agent '{agent_id}', limit is {limit}; trimmed {}", trimmed.len())]
pub struct CapacityExceeded {
    pub agent_id: String,
    pub limit: usize,
    pub available: usize,
    /// `server_id/tool` names of every tool that was dropped.
    pub trimmed: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_payload_untouched() {
        assert_eq!(truncate_payload("boom"), "boom");
    }

    #[test]
    fn test_truncate_long_payload() {
        let long = "x".repeat(MAX_PAYLOAD_CHARS + 100);
        let truncated = truncate_payload(&long);
        assert_eq!(truncated.chars().count(), MAX_PAYLOAD_CHARS + 1);
        assert!(truncated.ends_with('…'));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let long = "é".repeat(MAX_PAYLOAD_CHARS * 2);
        let truncated = truncate_payload(&long);
        assert!(truncated.starts_with("éé"));
        assert_eq!(truncated.chars().count(), MAX_PAYLOAD_CHARS + 1);
    }

    #[test]
    fn test_kind_and_server_id() {
        let err = ToolError::CircuitOpen {
            server_id: ServerId::from("search"),
            tool: "lookup".into(),
            failures: 3,
        };
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(err.server_id().map(|s| s.as_str()), Some("search"));
        assert!(err.to_string().contains("search/lookup"));

        let err = ToolError::InvalidConfig("bad".into());
        assert_eq!(err.kind().as_str(), "invalid_config");
        assert!(err.server_id().is_none());
    }

    #[test]
    fn test_timeout_display() {
        let err = ToolError::Timeout {
            server_id: ServerId::from("slow"),
            tool: Some("crawl".into()),
            stage: TimeoutStage::Call,
            after: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "call timeout for 'slow' after 250ms");
    }

    #[test]
    fn test_capacity_exceeded_display() {
        let info = CapacityExceeded {
            agent_id: "researcher".into(),
            limit: 6,
            available: 8,
            trimmed: vec!["b/x".into(), "b/y".into()],
        };
        assert_eq!(
            info.to_string(),
            "8 tools available for agent 'researcher', limit is 6; trimmed 2"
        );
    }
}
