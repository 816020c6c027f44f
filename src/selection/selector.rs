//! Bounded tool-set computation for an agent.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use super::policy::{PolicyError, ServerPolicy, ToolFilter};
use crate::error::{CapacityExceeded, ToolError};
use crate::mcp::{ConnectionManager, ServerId, ToolDescriptor};

/// Why a selection came back empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyReason {
    /// The agent names no servers.
    NoServers,
    /// None of the named servers could be reached.
    AllServersUnavailable,
    /// Every usable policy was malformed.
    PolicyErrors,
    /// Servers were reachable but their policies admitted nothing.
    AllFilteredOut,
    /// Tools were available but the capacity limit is zero.
    CapacityZero,
}

impl fmt::Display for EmptyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            EmptyReason::NoServers => "no servers configured",
            EmptyReason::AllServersUnavailable => "all servers unavailable",
            EmptyReason::PolicyErrors => "all tool policies invalid",
            EmptyReason::AllFilteredOut => "all tools filtered out",
            EmptyReason::CapacityZero => "capacity limit is zero",
        };
        f.write_str(text)
    }
}

/// A server that could not contribute tools.
#[derive(Debug, Clone, PartialEq)]
pub struct UnavailableServer {
    pub server_id: ServerId,
    pub error: ToolError,
}

/// Per-server breakdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSelection {
    pub server_id: ServerId,
    pub discovered: usize,
    /// Admitted by the policy, before capacity trimming.
    pub admitted: usize,
    /// Names the policy lists that the server does not expose.
    pub missing: Vec<String>,
}

/// Diagnostics accompanying a selection.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionReport {
    pub agent_id: String,
    pub capacity_limit: usize,
    /// Tools admitted across all servers before trimming.
    pub available: usize,
    pub servers: Vec<ServerSelection>,
    pub unavailable: Vec<UnavailableServer>,
    pub policy_errors: Vec<PolicyError>,
    /// Present when tools were trimmed to fit the capacity limit.
    pub capacity: Option<CapacityExceeded>,
    /// Present when the selection is empty.
    pub empty: Option<EmptyReason>,
}

impl SelectionReport {
    /// `server_id/tool` names dropped by capacity trimming.
    pub fn trimmed(&self) -> &[String] {
        self.capacity
            .as_ref()
            .map(|c| c.trimmed.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_degraded(&self) -> bool {
        !self.unavailable.is_empty() || !self.policy_errors.is_empty() || self.empty.is_some()
    }
}

/// Selected descriptors plus the report.
#[derive(Debug, Clone)]
pub struct Selection {
    pub tools: Vec<ToolDescriptor>,
    pub report: SelectionReport,
}

/// Computes bounded tool sets from registrations and policies.
pub struct ToolSelector {
    manager: Arc<ConnectionManager>,
}

impl ToolSelector {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Select tools for `agent_id`.
    ///
    /// Servers that are not active are connected first. Tools are ordered
    /// by server registration order, then discovery order; the first
    /// `capacity_limit` are kept and the rest are named in the report.
    #[instrument(name = "tool.select", skip(self, policies), fields(agent = %agent_id, servers = policies.len()))]
    pub async fn compute(
        &self,
        agent_id: &str,
        policies: &[ServerPolicy],
        capacity_limit: usize,
    ) -> Selection {
        let mut policy_errors = Vec::new();
        let mut unavailable = Vec::new();

        // Decode policies first; a malformed one never triggers a connect.
        let mut seen = HashSet::new();
        let mut decoded: Vec<(ServerId, ToolFilter)> = Vec::new();
        for policy in policies {
            if !seen.insert(policy.server_id.clone()) {
                warn!(mcp.server = %policy.server_id, "server listed twice, keeping first policy");
                continue;
            }
            match policy.tools.parse() {
                Ok(filter) => decoded.push((policy.server_id.clone(), filter)),
                Err(reason) => {
                    warn!(mcp.server = %policy.server_id, reason = %reason, "tool policy rejected");
                    policy_errors.push(PolicyError {
                        server_id: policy.server_id.clone(),
                        reason,
                    });
                }
            }
        }

        let order = self.manager.server_ids();
        decoded.sort_by_key(|(id, _)| order.iter().position(|o| o == id).unwrap_or(usize::MAX));

        let ready = join_all(decoded.iter().map(|(id, _)| self.ready_tools(id))).await;

        let mut servers = Vec::new();
        let mut admitted_tools = Vec::new();
        for ((server_id, filter), tools) in decoded.into_iter().zip(ready) {
            let tools = match tools {
                Ok(tools) => tools,
                Err(error) => {
                    warn!(mcp.server = %server_id, error = %error, "server unavailable for selection");
                    unavailable.push(UnavailableServer { server_id, error });
                    continue;
                }
            };

            let admitted: Vec<ToolDescriptor> =
                tools.iter().filter(|t| filter.admits(&t.name)).cloned().collect();
            let missing = filter.missing_from(&tools);
            if !missing.is_empty() {
                debug!(mcp.server = %server_id, ?missing, "policy names tools the server does not expose");
            }
            servers.push(ServerSelection {
                server_id,
                discovered: tools.len(),
                admitted: admitted.len(),
                missing,
            });
            admitted_tools.extend(admitted);
        }

        let available = admitted_tools.len();
        let capacity = if available > capacity_limit {
            let trimmed: Vec<String> = admitted_tools
                .split_off(capacity_limit)
                .iter()
                .map(ToolDescriptor::qualified_name)
                .collect();
            let info = CapacityExceeded {
                agent_id: agent_id.to_string(),
                limit: capacity_limit,
                available,
                trimmed,
            };
            warn!(trimmed = ?info.trimmed, "{}", info);
            Some(info)
        } else {
            None
        };

        let empty = if !admitted_tools.is_empty() {
            None
        } else if policies.is_empty() {
            Some(EmptyReason::NoServers)
        } else if available > 0 {
            Some(EmptyReason::CapacityZero)
        } else if servers.is_empty() && !unavailable.is_empty() && policy_errors.is_empty() {
            Some(EmptyReason::AllServersUnavailable)
        } else if servers.is_empty() && !policy_errors.is_empty() {
            Some(EmptyReason::PolicyErrors)
        } else {
            Some(EmptyReason::AllFilteredOut)
        };

        match empty {
            Some(reason) => warn!(reason = %reason, "agent has no tools"),
            None => info!(selected = admitted_tools.len(), available, "tool set computed"),
        }

        Selection {
            tools: admitted_tools,
            report: SelectionReport {
                agent_id: agent_id.to_string(),
                capacity_limit,
                available,
                servers,
                unavailable,
                policy_errors,
                capacity,
                empty,
            },
        }
    }

    /// Current tool snapshot, connecting first when needed.
    async fn ready_tools(&self, server_id: &ServerId) -> Result<Arc<Vec<ToolDescriptor>>, ToolError> {
        self.manager.connect(server_id).await?;
        self.manager.tools(server_id)
    }
}
