//! Capability discovery.
//!
//! Discovery only runs through a [`ConnectionLease`], so it always executes
//! inside a session that was actually opened.

use std::collections::HashSet;

use tracing::{debug, warn};

use super::manager::ConnectionLease;
use super::server::{ServerId, ToolDescriptor};
use super::transport::RemoteTool;
use crate::error::ToolError;

/// List the tools exposed by the leased session's server.
pub async fn discover(lease: &ConnectionLease) -> Result<Vec<ToolDescriptor>, ToolError> {
    let server_id = lease.server_id();
    let remote = lease
        .session()
        .list_tools()
        .await
        .map_err(|e| e.into_tool_error(server_id, None))?;
    let tools = describe(server_id, remote);
    debug!(mcp.server = %server_id, tool_count = tools.len(), "discovered tools");
    Ok(tools)
}

/// Attribute advertised tools to their server, keeping discovery order.
///
/// Nameless tools and repeated names are dropped; the first occurrence wins.
pub fn describe(server_id: &ServerId, remote: Vec<RemoteTool>) -> Vec<ToolDescriptor> {
    let mut seen = HashSet::new();
    let mut tools = Vec::with_capacity(remote.len());

    for tool in remote {
        if tool.name.is_empty() {
            warn!(mcp.server = %server_id, "skipping tool without a name");
            continue;
        }
        if !seen.insert(tool.name.clone()) {
            warn!(mcp.server = %server_id, tool.name = %tool.name, "duplicate tool name, keeping first");
            continue;
        }
        tools.push(ToolDescriptor {
            server_id: server_id.clone(),
            name: tool.name,
            description: tool.description.unwrap_or_default(),
            input_schema: tool.input_schema,
        });
    }

    tools
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::memory::tool;

    #[test]
    fn test_describe_keeps_order_and_attribution() {
        let id = ServerId::from("a");
        let tools = describe(&id, vec![tool("zeta"), tool("alpha"), tool("mid")]);
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["zeta", "alpha", "mid"]);
        assert!(tools.iter().all(|t| t.server_id == id));
        assert_eq!(tools[0].description, "zeta tool");
    }

    #[test]
    fn test_describe_drops_duplicates_and_blank_names() {
        let id = ServerId::from("a");
        let mut dup = tool("x");
        dup.description = Some("second".into());
        let tools = describe(&id, vec![tool("x"), tool(""), dup, tool("y")]);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].description, "x tool");
        assert_eq!(tools[1].name, "y");
    }

    #[test]
    fn test_describe_missing_description() {
        let id = ServerId::from("a");
        let tools = describe(
            &id,
            vec![RemoteTool {
                name: "bare".into(),
                description: None,
                input_schema: None,
            }],
        );
        assert_eq!(tools[0].description, "");
        assert!(tools[0].input_schema.is_none());
    }
}
