//! Agent-runtime facade.
//!
//! [`ToolHub`] wires the connection manager, invoker, selector and
//! dispatcher together behind the operations an agent runtime uses:
//! register and connect servers, list tools, compute bounded tool sets and
//! call tools.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::{AgentProfile, HubConfig, ResilienceConfig};
use crate::dispatch::{BoundTool, Dispatcher};
use crate::error::ToolError;
use crate::invoker::{Invoker, ToolOutput};
use crate::mcp::{
    ConnectionManager, Connector, EventReceiver, ServerConfig, ServerId, ServerSnapshot,
    ServerStatus, ToolDescriptor,
};
use crate::resilience::BreakerKey;
use crate::selection::{SelectionReport, ServerPolicy, ToolSelector};

/// Invocable tools for one agent plus the selection diagnostics.
#[derive(Debug, Clone)]
pub struct ToolSet {
    pub tools: Vec<BoundTool>,
    pub report: SelectionReport,
}

impl ToolSet {
    /// `server_id/tool` names dropped to fit the capacity limit.
    pub fn trimmed(&self) -> &[String] {
        self.report.trimmed()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn get(&self, qualified_name: &str) -> Option<&BoundTool> {
        self.tools.iter().find(|t| t.qualified_name() == qualified_name)
    }
}

pub struct ToolHub {
    manager: Arc<ConnectionManager>,
    invoker: Arc<Invoker>,
    dispatcher: Dispatcher,
    selector: ToolSelector,
    agents: DashMap<String, AgentProfile>,
}

impl ToolHub {
    pub fn new(connector: Arc<dyn Connector>, resilience: &ResilienceConfig) -> Self {
        let manager = Arc::new(ConnectionManager::new(
            connector,
            resilience.connection_settings(),
        ));
        let invoker = Arc::new(Invoker::new(
            manager.clone(),
            resilience.breaker(),
            resilience.cache_max_entries,
            resilience.invoker(),
        ));
        Self {
            selector: ToolSelector::new(manager.clone()),
            dispatcher: Dispatcher::new(invoker.clone()),
            manager,
            invoker,
            agents: DashMap::new(),
        }
    }

    /// Build a hub and register everything `config` declares, in file order.
    pub fn from_config(config: &HubConfig, connector: Arc<dyn Connector>) -> Result<Self, ToolError> {
        let hub = Self::new(connector, &config.resilience);
        for server in &config.servers {
            hub.register_server(server.clone())?;
        }
        for rule in &config.cache {
            hub.enable_cache(&rule.server, &rule.tool, rule.ttl());
        }
        for agent in &config.agents {
            hub.add_agent(agent.clone());
        }
        info!(
            servers = config.servers.len(),
            cache_rules = config.cache.len(),
            agents = config.agents.len(),
            "hub configured"
        );
        Ok(hub)
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn invoker(&self) -> &Arc<Invoker> {
        &self.invoker
    }

    /// Receive server and breaker transitions.
    pub fn subscribe(&self) -> EventReceiver {
        self.manager.subscribe()
    }

    // ========================================================================
    // Servers
    // ========================================================================

    pub fn register_server(&self, config: ServerConfig) -> Result<ServerId, ToolError> {
        self.manager.register(config)
    }

    pub async fn connect_server(&self, server_id: &ServerId) -> Result<ServerStatus, ToolError> {
        self.manager.connect(server_id).await
    }

    /// Connect every registered server concurrently.
    ///
    /// Results follow registration order; one server's failure does not
    /// affect the others.
    #[instrument(name = "hub.connect_all", skip(self))]
    pub async fn connect_all(&self) -> Vec<(ServerId, Result<ServerStatus, ToolError>)> {
        let ids = self.manager.server_ids();
        let results = join_all(ids.iter().map(|id| self.manager.connect(id))).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!(failed, total = ids.len(), "some servers failed to connect");
        } else {
            info!(total = ids.len(), "all servers connected");
        }
        ids.into_iter().zip(results).collect()
    }

    /// Tools discovered on `server_id`, connecting first when needed.
    pub async fn list_tools(&self, server_id: &ServerId) -> Result<Vec<ToolDescriptor>, ToolError> {
        self.manager.connect(server_id).await?;
        Ok(self.manager.tools(server_id)?.as_ref().clone())
    }

    pub async fn refresh_tools(&self, server_id: &ServerId) -> Result<Vec<ToolDescriptor>, ToolError> {
        self.manager.refresh_tools(server_id).await
    }

    pub async fn health_check(&self, server_id: &ServerId) -> Result<ServerStatus, ToolError> {
        self.manager.health_check(server_id).await
    }

    pub async fn health_check_all(&self) -> Vec<(ServerId, Result<ServerStatus, ToolError>)> {
        let ids = self.manager.server_ids();
        let results = join_all(ids.iter().map(|id| self.manager.health_check(id))).await;
        ids.into_iter().zip(results).collect()
    }

    pub async fn disconnect_server(&self, server_id: &ServerId) -> Result<(), ToolError> {
        self.manager.disconnect(server_id).await
    }

    pub fn servers(&self) -> Vec<ServerSnapshot> {
        self.manager.list()
    }

    // ========================================================================
    // Tool sets
    // ========================================================================

    pub fn add_agent(&self, profile: AgentProfile) {
        self.agents.insert(profile.id.clone(), profile);
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentProfile> {
        self.agents.get(agent_id).map(|a| a.value().clone())
    }

    /// Compute the agent's bounded tool set and bind each tool.
    pub async fn get_tool_set(
        &self,
        agent_id: &str,
        policies: &[ServerPolicy],
        capacity_limit: usize,
    ) -> ToolSet {
        let selection = self.selector.compute(agent_id, policies, capacity_limit).await;
        ToolSet {
            tools: self.dispatcher.build_all(&selection.tools),
            report: selection.report,
        }
    }

    /// Tool set for an agent registered from configuration.
    pub async fn tool_set_for_agent(&self, agent_id: &str) -> Result<ToolSet, ToolError> {
        let profile = self
            .agent(agent_id)
            .ok_or_else(|| ToolError::InvalidConfig(format!("unknown agent '{}'", agent_id)))?;
        Ok(self
            .get_tool_set(&profile.id, &profile.servers, profile.capacity_limit)
            .await)
    }

    // ========================================================================
    // Calls
    // ========================================================================

    pub async fn call_tool(
        &self,
        server_id: &ServerId,
        tool: &str,
        arguments: Value,
    ) -> Result<ToolOutput, ToolError> {
        self.call_tool_with_cancel(server_id, tool, arguments, &CancellationToken::new())
            .await
    }

    /// Call a tool by name, validating against its discovered schema.
    ///
    /// Uses the last discovery of `server_id`, so a cached result or an
    /// open breaker answers without touching the server. A server that was
    /// never discovered is connected by the invoker, inside its retry,
    /// timeout and cancellation bounds.
    pub async fn call_tool_with_cancel(
        &self,
        server_id: &ServerId,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        match self.manager.tool(server_id, tool) {
            Ok(descriptor) => {
                self.dispatcher
                    .build(&descriptor, server_id)
                    .call_with_cancel(arguments, cancel)
                    .await
            }
            Err(e @ ToolError::UnknownTool { .. })
                if self.manager.status(server_id)? == ServerStatus::Active =>
            {
                Err(e)
            }
            Err(ToolError::UnknownTool { .. }) => {
                self.invoker
                    .invoke_undiscovered(server_id, tool, arguments, cancel)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Controls
    // ========================================================================

    /// Cache results of `server_id/tool` for `ttl`.
    pub fn enable_cache(&self, server_id: &ServerId, tool: &str, ttl: std::time::Duration) {
        self.invoker.cache().enable(server_id, tool, ttl);
    }

    /// Close the breaker for `server_id/tool` and forget its failures.
    pub fn reset_breaker(&self, server_id: &ServerId, tool: &str) {
        self.invoker.breaker().reset(&BreakerKey::new(server_id, tool));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::mcp::memory::Fault;
    use crate::mcp::{InMemoryConnector, RemoteTool, TransportConfig, TransportFailure};
    use crate::resilience::CircuitState;
    use serde_json::json;

    fn endpoint(id: &str) -> ServerConfig {
        ServerConfig::new(
            id,
            TransportConfig::NetworkEndpoint {
                url: format!("http://{}.invalid/mcp", id),
                auth: None,
            },
        )
    }

    fn hub(servers: &[(&str, &[&str])]) -> (Arc<InMemoryConnector>, ToolHub) {
        let connector = Arc::new(InMemoryConnector::new());
        let hub = ToolHub::new(connector.clone(), &ResilienceConfig::default());
        for (id, tools) in servers {
            connector.add_server(*id, tools);
            hub.register_server(endpoint(id)).unwrap();
        }
        (connector, hub)
    }

    #[tokio::test]
    async fn test_list_tools_connects_implicitly() {
        let (_, hub) = hub(&[("a", &["x", "y"])]);
        let tools = hub.list_tools(&ServerId::from("a")).await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["x", "y"]);
        assert_eq!(hub.servers()[0].status, ServerStatus::Active);
    }

    #[tokio::test]
    async fn test_connect_all_isolates_failures() {
        let (connector, hub) = hub(&[("a", &["x"]), ("b", &["y"]), ("c", &["z"])]);
        connector
            .server("b")
            .unwrap()
            .fail_connects(1, TransportFailure::Auth);

        let results = hub.connect_all().await;
        assert_eq!(results.len(), 3);
        assert!(results[0].1.is_ok());
        assert_eq!(results[1].1.as_ref().unwrap_err().kind(), ErrorKind::Auth);
        assert!(results[2].1.is_ok());

        let b = hub.manager().snapshot(&ServerId::from("b")).unwrap();
        assert_eq!(b.status, ServerStatus::Error);
        assert!(b.last_error.is_some());
    }

    #[tokio::test]
    async fn test_get_tool_set_binds_and_calls() {
        let (_, hub) = hub(&[("a", &["x", "y"]), ("b", &["z"])]);
        let set = hub
            .get_tool_set("agent", &[ServerPolicy::all("a"), ServerPolicy::only("b", ["z"])], 10)
            .await;
        assert_eq!(set.len(), 3);
        assert!(set.trimmed().is_empty());

        let out = set.get("b/z").unwrap().call(json!({})).await.unwrap();
        assert_eq!(out.content, "b/z");
    }

    #[tokio::test]
    async fn test_call_unknown_tool() {
        let (connector, hub) = hub(&[("a", &["x"])]);
        let err = hub
            .call_tool(&ServerId::from("a"), "nope", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownTool);
        assert_eq!(connector.server("a").unwrap().total_calls(), 0);
    }

    #[tokio::test]
    async fn test_reset_breaker() {
        let (connector, hub) = hub(&[("a", &["x"])]);
        let server = connector.server("a").unwrap();
        server.fail_always("x", Fault::ToolError("broken".into()));
        let id = ServerId::from("a");

        for _ in 0..3 {
            let _ = hub.call_tool(&id, "x", json!({})).await;
        }
        let key = BreakerKey::new(&id, "x");
        assert_eq!(hub.invoker().breaker().state(&key), CircuitState::Open);

        server.clear_faults();
        hub.reset_breaker(&id, "x");
        assert!(hub.call_tool(&id, "x", json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_open_breaker_answers_without_connecting() {
        let (connector, hub) = hub(&[("a", &["x"])]);
        let server = connector.server("a").unwrap();
        server.fail_always("x", Fault::ToolError("broken".into()));
        let id = ServerId::from("a");
        for _ in 0..3 {
            assert_eq!(
                hub.call_tool(&id, "x", json!({})).await.unwrap_err().kind(),
                ErrorKind::ToolExecution
            );
        }

        hub.disconnect_server(&id).await.unwrap();
        server.fail_connects(10, TransportFailure::Connect);
        let attempts = server.connect_attempts();

        let err = hub.call_tool(&id, "x", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(server.connect_attempts(), attempts);
        assert_eq!(server.calls("x"), 3);
    }

    #[tokio::test]
    async fn test_cached_result_served_while_server_down() {
        let (connector, hub) = hub(&[("a", &["x"])]);
        let server = connector.server("a").unwrap();
        let id = ServerId::from("a");
        hub.enable_cache(&id, "x", std::time::Duration::from_secs(60));

        let first = hub.call_tool(&id, "x", json!({"q": 1})).await.unwrap();
        hub.disconnect_server(&id).await.unwrap();
        server.fail_connects(10, TransportFailure::Connect);
        let attempts = server.connect_attempts();

        let second = hub.call_tool(&id, "x", json!({"q": 1})).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.content, first.content);
        assert_eq!(server.connect_attempts(), attempts);

        // Different arguments miss the cache and reach the dead server.
        let err = hub.call_tool(&id, "x", json!({"q": 2})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_unknown_tool_on_active_server_is_local() {
        let (connector, hub) = hub(&[("a", &["x"])]);
        let id = ServerId::from("a");
        hub.connect_server(&id).await.unwrap();
        let server = connector.server("a").unwrap();

        let err = hub.call_tool(&id, "nope", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownTool);
        assert_eq!(server.opens(), 1);
        assert_eq!(server.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_undiscovered_call_checks_fresh_schema() {
        let connector = Arc::new(InMemoryConnector::new());
        let hub = ToolHub::new(connector.clone(), &ResilienceConfig::default());
        let server = connector.add_server_with(
            "a",
            vec![RemoteTool {
                name: "search".into(),
                description: None,
                input_schema: Some(json!({
                    "type": "object",
                    "properties": { "query": { "type": "string" } },
                    "required": ["query"]
                })),
            }],
        );
        let id = hub.register_server(endpoint("a")).unwrap();

        let err = hub.call_tool(&id, "search", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaValidation);
        assert_eq!(server.total_calls(), 0);
        assert_eq!(hub.manager().status(&id).unwrap(), ServerStatus::Active);

        let out = hub.call_tool(&id, "search", json!({"query": "q"})).await.unwrap();
        assert_eq!(out.content, "a/search");
    }

    #[tokio::test]
    async fn test_from_config_registers_everything() {
        let config = HubConfig::parse(
            r#"
            [[servers]]
            id = "a"
            transport = { kind = "network_endpoint", url = "http://a.invalid" }

            [[cache]]
            server = "a"
            tool = "x"
            ttl_secs = 60

            [[agents]]
            id = "bot"
            capacity_limit = 1
            servers = [{ server = "a" }]
            "#,
        )
        .unwrap();
        let connector = Arc::new(InMemoryConnector::new());
        connector.add_server("a", &["x", "y"]);
        let hub = ToolHub::from_config(&config, connector.clone()).unwrap();

        let set = hub.tool_set_for_agent("bot").await.unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.trimmed(), ["a/y".to_string()]);

        let tool = &set.tools[0];
        tool.call(json!({})).await.unwrap();
        assert!(tool.call(json!({})).await.unwrap().from_cache);
        assert_eq!(connector.server("a").unwrap().calls("x"), 1);

        let err = hub.tool_set_for_agent("ghost").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn test_disconnect_then_call_reconnects() {
        let (connector, hub) = hub(&[("a", &["x"])]);
        let id = ServerId::from("a");
        hub.connect_server(&id).await.unwrap();
        hub.disconnect_server(&id).await.unwrap();
        assert_eq!(hub.manager().status(&id).unwrap(), ServerStatus::Inactive);

        hub.call_tool(&id, "x", json!({})).await.unwrap();
        assert_eq!(connector.server("a").unwrap().opens(), 2);
        assert_eq!(connector.server("a").unwrap().open_sessions(), 1);
    }
}
