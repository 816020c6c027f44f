//! Sessions backed by rmcp (official Rust MCP SDK).
//!
//! Local processes speak MCP over stdio via `TokioChildProcess`; network
//! endpoints use the streamable HTTP client transport.

use std::sync::Arc;

use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult, Tool},
    service::{RunningService, ServiceError, ServiceExt},
    transport::{
        streamable_http_client::StreamableHttpClientTransportConfig,
        StreamableHttpClientTransport, TokioChildProcess,
    },
    RoleClient,
};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

use super::server::{ServerId, TransportConfig};
use super::transport::{
    mentions_auth_failure, mentions_rate_limit, Connector, RawCallResult, RemoteTool, Session,
    TransportError, TransportFailure,
};

/// Type alias for the running MCP client service.
type McpService = RunningService<RoleClient, ()>;

/// JSON-RPC codes some servers use for throttling.
const RATE_LIMIT_CODES: [i32; 2] = [429, -32029];

/// Connector that opens real MCP sessions.
#[derive(Debug, Default, Clone)]
pub struct RmcpConnector;

impl RmcpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for RmcpConnector {
    #[instrument(name = "mcp.open", skip_all, fields(mcp.server = %server_id, mcp.transport = transport.kind()))]
    async fn open(
        &self,
        server_id: &ServerId,
        transport: &TransportConfig,
    ) -> Result<Arc<dyn Session>, TransportError> {
        let service = match transport {
            TransportConfig::LocalProcess {
                command,
                args,
                env,
                cwd,
            } => {
                let mut cmd = tokio::process::Command::new(command);
                cmd.args(args).envs(env);
                if let Some(dir) = cwd {
                    cmd.current_dir(dir);
                }
                let child = TokioChildProcess::new(cmd).map_err(|e| {
                    TransportError::connect(format!("failed to spawn '{}': {}", command, e))
                })?;
                ().serve(child).await.map_err(|e| init_error(format!("{:?}", e)))?
            }
            TransportConfig::NetworkEndpoint { url, auth } => {
                let mut config = StreamableHttpClientTransportConfig::with_uri(url.clone());
                if let Some(auth) = auth {
                    let token = auth
                        .resolve()
                        .map_err(|e| TransportError::new(TransportFailure::Auth, e))?;
                    config = config.auth_header(token);
                }
                let http = StreamableHttpClientTransport::from_config(config);
                ().serve(http).await.map_err(|e| init_error(format!("{:?}", e)))?
            }
        };

        info!(peer = ?service.peer_info().map(|p| &p.server_info.name), "session opened");
        Ok(Arc::new(RmcpSession { service }))
    }
}

fn init_error(message: String) -> TransportError {
    if mentions_auth_failure(&message) {
        TransportError::new(TransportFailure::Auth, message)
    } else {
        TransportError::connect(format!("failed to connect: {}", message))
    }
}

/// Map an rmcp service error onto the session failure kinds.
fn map_service_error(err: ServiceError) -> TransportError {
    match err {
        ServiceError::McpError(data) => {
            let message = data.message.to_string();
            if RATE_LIMIT_CODES.contains(&data.code.0) || mentions_rate_limit(&message) {
                TransportError::rate_limited(message, None)
            } else {
                TransportError::remote(format!("{} (code {})", message, data.code.0))
            }
        }
        ServiceError::TransportClosed => TransportError::connect("transport closed"),
        other => {
            let message = other.to_string();
            if mentions_rate_limit(&message) {
                TransportError::rate_limited(message, None)
            } else if mentions_auth_failure(&message) {
                TransportError::new(TransportFailure::Auth, message)
            } else {
                TransportError::connect(message)
            }
        }
    }
}

fn remote_tool(tool: Tool) -> RemoteTool {
    RemoteTool {
        name: tool.name.to_string(),
        description: tool.description.map(|d| d.to_string()),
        input_schema: Some(Value::Object((*tool.input_schema).clone())),
    }
}

fn raw_result(result: CallToolResult) -> RawCallResult {
    let text = result
        .content
        .iter()
        .filter_map(|c| c.as_text().map(|t| t.text.to_string()))
        .collect::<Vec<_>>()
        .join("\n");

    RawCallResult {
        text,
        structured: result.structured_content,
        is_error: result.is_error.unwrap_or(false),
    }
}

struct RmcpSession {
    service: McpService,
}

#[async_trait]
impl Session for RmcpSession {
    async fn list_tools(&self) -> Result<Vec<RemoteTool>, TransportError> {
        let result = self
            .service
            .list_tools(Default::default())
            .await
            .map_err(map_service_error)?;
        Ok(result.tools.into_iter().map(remote_tool).collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<RawCallResult, TransportError> {
        debug!(tool.name = %name, "calling tool");
        let result = self
            .service
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments,
            })
            .await
            .map_err(map_service_error)?;
        Ok(raw_result(result))
    }

    // tools/list round-trip doubles as the liveness probe.
    async fn ping(&self) -> Result<(), TransportError> {
        self.service
            .list_tools(Default::default())
            .await
            .map(|_| ())
            .map_err(map_service_error)
    }

    fn close(&self) {
        self.service.cancellation_token().cancel();
    }
}
