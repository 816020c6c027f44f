//! Uniform session contract over heterogeneous transports.
//!
//! A [`Connector`] opens one [`Session`] per server. Everything above this
//! layer talks to sessions only and never inspects the transport variant.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::server::{ServerId, TransportConfig};
use crate::error::{truncate_payload, ToolError};

/// Coarse reason a session operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    /// Could not open the session, or the channel broke.
    Connect,
    /// The endpoint refused our credentials.
    Auth,
    /// The server signalled it is overloaded.
    RateLimited,
    /// The remote operation ran and reported an error.
    Remote,
    /// The response could not be interpreted.
    Malformed,
    /// The session was closed locally.
    Closed,
}

impl TransportFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportFailure::Connect => "connect",
            TransportFailure::Auth => "auth",
            TransportFailure::RateLimited => "rate_limited",
            TransportFailure::Remote => "remote",
            TransportFailure::Malformed => "malformed",
            TransportFailure::Closed => "closed",
        }
    }
}

/// Failure reported by a session or connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub kind: TransportFailure,
    pub message: String,
    /// Server-provided hint for rate-limit signals.
    pub retry_after: Option<Duration>,
}

impl TransportError {
    pub fn new(kind: TransportFailure, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(TransportFailure::Connect, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: TransportFailure::RateLimited,
            message: message.into(),
            retry_after,
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(TransportFailure::Remote, message)
    }

    /// Attach server and tool context. Without a tool, remote and
    /// throttling failures count against the session itself.
    pub fn into_tool_error(self, server_id: &ServerId, tool: Option<&str>) -> ToolError {
        let server_id = server_id.clone();
        match (self.kind, tool) {
            (TransportFailure::Auth, _) => ToolError::Auth {
                server_id,
                message: truncate_payload(&self.message),
            },
            (TransportFailure::RateLimited, Some(tool)) => ToolError::RateLimited {
                server_id,
                tool: tool.to_string(),
                retry_after: self.retry_after,
                message: truncate_payload(&self.message),
            },
            (TransportFailure::Remote | TransportFailure::Malformed, Some(tool)) => {
                ToolError::tool_execution(&server_id, tool, &self.message)
            }
            _ => ToolError::Connection {
                server_id,
                message: truncate_payload(&self.to_string()),
            },
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for TransportError {}

/// Words that introduce a status code in error text.
const STATUS_WORDS: [&str; 4] = ["http", "status", "code", "error"];

/// Heuristic for throttling signals that arrive as free text.
///
/// A bare `429` only counts as its own word right after a status word, so
/// payloads that merely contain the digits are left alone.
pub fn mentions_rate_limit(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate-limit")
        || lower.contains("ratelimit")
        || lower.contains("too many requests")
        || mentions_status(&lower, &["429"])
}

/// Heuristic for credential rejections that arrive as free text.
pub fn mentions_auth_failure(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("unauthorized")
        || lower.contains("unauthorised")
        || lower.contains("forbidden")
        || mentions_status(&lower, &["401", "403"])
}

/// True when one of `codes` directly follows a status word, as in
/// `HTTP/1.1 429`, `status: 401` or `code=403`.
fn mentions_status(lower: &str, codes: &[&str]) -> bool {
    let separator =
        |c: char| c.is_whitespace() || matches!(c, ':' | '=' | ',' | ';' | '(' | ')' | '"');
    let words: Vec<&str> = lower.split(separator).filter(|w| !w.is_empty()).collect();
    words.windows(2).any(|pair| {
        let lead = pair[0].split('/').next().unwrap_or_default();
        STATUS_WORDS.contains(&lead) && codes.contains(&pair[1])
    })
}
