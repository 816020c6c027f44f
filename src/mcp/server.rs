//! Tool server registrations and the records the manager keeps for them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ToolError;

/// Globally unique identifier of a registered tool server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ids are non-empty and limited to `[A-Za-z0-9_-]`.
    pub fn validate(&self) -> Result<(), ToolError> {
        if self.0.is_empty() {
            return Err(ToolError::InvalidConfig("server id must not be empty".into()));
        }
        if let Some(bad) = self
            .0
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(ToolError::InvalidConfig(format!(
                "server id '{}' contains invalid character '{}'",
                self.0, bad
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ServerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle status of a tool server.
///
/// Transitions are owned by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Inactive,
    Connecting,
    Active,
    Error,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Inactive => "inactive",
            ServerStatus::Connecting => "connecting",
            ServerStatus::Active => "active",
            ServerStatus::Error => "error",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials presented to a network endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointAuth {
    /// Literal bearer token.
    Bearer(String),
    /// Name of an environment variable holding the bearer token.
    BearerEnv(String),
}

impl EndpointAuth {
    /// Resolve the bearer token, reading the environment if needed.
    pub fn resolve(&self) -> Result<String, String> {
        match self {
            EndpointAuth::Bearer(token) => Ok(token.clone()),
            EndpointAuth::BearerEnv(var) => std::env::var(var)
                .map_err(|_| format!("environment variable '{}' is not set", var)),
        }
    }
}

// Tokens never reach logs.
impl fmt::Debug for EndpointAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointAuth::Bearer(_) => f.write_str("Bearer(***)"),
            EndpointAuth::BearerEnv(var) => f.debug_tuple("BearerEnv").field(var).finish(),
        }
    }
}

/// How to reach a tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Spawn a process and speak MCP over its stdio.
    LocalProcess {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    /// Streamable HTTP session to a remote endpoint.
    NetworkEndpoint {
        url: String,
        #[serde(default)]
        auth: Option<EndpointAuth>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::LocalProcess { .. } => "local_process",
            TransportConfig::NetworkEndpoint { .. } => "network_endpoint",
        }
    }

    /// Short human-readable target: the command line or the URL.
    pub fn target(&self) -> String {
        match self {
            TransportConfig::LocalProcess { command, args, .. } => {
                if args.is_empty() {
                    command.clone()
                } else {
                    format!("{} {}", command, args.join(" "))
                }
            }
            TransportConfig::NetworkEndpoint { url, .. } => url.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ToolError> {
        match self {
            TransportConfig::LocalProcess { command, cwd, .. } => {
                if command.trim().is_empty() {
                    return Err(ToolError::InvalidConfig(
                        "local process command must not be empty".into(),
                    ));
                }
                if cwd.as_ref().is_some_and(|dir| dir.as_os_str().is_empty()) {
                    return Err(ToolError::InvalidConfig(
                        "local process working directory must not be empty".into(),
                    ));
                }
            }
            TransportConfig::NetworkEndpoint { url, auth } => {
                let url = url.trim();
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ToolError::InvalidConfig(format!(
                        "endpoint url '{}' must start with http:// or https://",
                        url
                    )));
                }
                if let Some(EndpointAuth::Bearer(token)) = auth {
                    if token.is_empty() {
                        return Err(ToolError::InvalidConfig("bearer token must not be empty".into()));
                    }
                }
                if let Some(EndpointAuth::BearerEnv(var)) = auth {
                    if var.is_empty() {
                        return Err(ToolError::InvalidConfig(
                            "bearer_env variable name must not be empty".into(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Registration request for a tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: ServerId,
    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    pub transport: TransportConfig,
}

impl ServerConfig {
    pub fn new(id: impl Into<ServerId>, transport: TransportConfig) -> Self {
        Self {
            id: id.into(),
            name: None,
            transport,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }

    pub fn validate(&self) -> Result<(), ToolError> {
        self.id.validate()?;
        self.transport.validate()
    }
}

/// A registered server as tracked by the connection manager.
#[derive(Debug, Clone)]
pub struct ToolServer {
    pub config: ServerConfig,
    pub status: ServerStatus,
    pub last_error: Option<String>,
    pub last_connected: Option<DateTime<Utc>>,
}

impl ToolServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            status: ServerStatus::Inactive,
            last_error: None,
            last_connected: None,
        }
    }

    pub fn id(&self) -> &ServerId {
        &self.config.id
    }
}

/// A tool as seen by the last successful discovery on its server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub server_id: ServerId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema for the arguments; absent when the server advertises none.
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,
}

impl ToolDescriptor {
    /// `server_id/tool` form used in reports.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.server_id, self.name)
    }
}
