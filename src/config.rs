//! Hub configuration
//!
//! ```toml
//! [resilience]
//! breaker_threshold = 3
//! call_timeout_secs = 30
//!
//! [[servers]]
//! id = "search"
//! transport = { kind = "network_endpoint", url = "https://search.example/mcp", auth = { bearer_env = "SEARCH_TOKEN" } }
//!
//! [[servers]]
//! id = "files"
//! name = "Local files"
//! transport = { kind = "local_process", command = "mcp-files", args = ["--root", "/srv"] }
//!
//! [[cache]]
//! server = "search"
//! tool = "lookup"
//! ttl_secs = 30
//!
//! [[agents]]
//! id = "researcher"
//! capacity_limit = 12
//! servers = [{ server = "search", tools = "all" }, { server = "files", tools = ["read"] }]
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::invoker::InvokerSettings;
use crate::mcp::{ConnectionSettings, ServerConfig, ServerId};
use crate::resilience::{BreakerConfig, RetryPolicy};
use crate::selection::ServerPolicy;

/// Whole configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    /// Opt-in result caching rules
    #[serde(default)]
    pub cache: Vec<CacheRule>,
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
}

/// Timeouts, retry bounds and breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub breaker_threshold: u32,
    /// Seconds before an open breaker admits a probe; 0 disables probing
    pub breaker_cooldown_secs: u64,
    pub max_attempts: u32,
    pub rate_limit_base_ms: u64,
    pub rate_limit_max_wait_ms: u64,
    pub rate_limit_max_retries: u32,
    pub connect_timeout_secs: u64,
    pub call_timeout_secs: u64,
    pub invocation_timeout_secs: u64,
    /// Per-server bulkhead size
    pub max_concurrent_calls: usize,
    pub cache_max_entries: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            breaker_threshold: 3,
            breaker_cooldown_secs: 30,
            max_attempts: 2,
            rate_limit_base_ms: 100,
            rate_limit_max_wait_ms: 3000,
            rate_limit_max_retries: 2,
            connect_timeout_secs: 10,
            call_timeout_secs: 60,
            invocation_timeout_secs: 120,
            max_concurrent_calls: 8,
            cache_max_entries: 1024,
        }
    }
}

impl ResilienceConfig {
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            max_concurrent_calls: self.max_concurrent_calls.max(1),
        }
    }

    pub fn breaker(&self) -> BreakerConfig {
        let cooldown = match self.breaker_cooldown_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        BreakerConfig::default()
            .with_threshold(self.breaker_threshold)
            .with_cooldown(cooldown)
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            rate_limit_base: Duration::from_millis(self.rate_limit_base_ms),
            rate_limit_max_wait: Duration::from_millis(self.rate_limit_max_wait_ms),
            rate_limit_max_retries: self.rate_limit_max_retries,
        }
    }

    pub fn invoker(&self) -> InvokerSettings {
        InvokerSettings {
            retry: self.retry(),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            invocation_timeout: Duration::from_secs(self.invocation_timeout_secs),
        }
    }
}

/// Cache one tool's results for `ttl_secs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRule {
    pub server: ServerId,
    pub tool: String,
    pub ttl_secs: u64,
}

impl CacheRule {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// An agent's servers, tool policies and capacity limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub capacity_limit: usize,
    #[serde(default)]
    pub servers: Vec<ServerPolicy>,
}

impl HubConfig {
    /// Load config from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!("config not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("failed to load {}", path.display()))?;

        tracing::info!(
            "loaded {} servers and {} agents from {}",
            config.servers.len(),
            config.agents.len(),
            path.display()
        );

        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: HubConfig = toml::from_str(content).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-references and per-server settings.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !ids.insert(&server.id) {
                bail!("server '{}' is configured twice", server.id);
            }
        }

        for rule in &self.cache {
            if !ids.contains(&rule.server) {
                bail!("cache rule names unknown server '{}'", rule.server);
            }
            if rule.ttl_secs == 0 {
                bail!("cache rule for '{}/{}' has a zero ttl", rule.server, rule.tool);
            }
        }

        let mut agents = HashSet::new();
        for agent in &self.agents {
            if !agents.insert(agent.id.as_str()) {
                bail!("agent '{}' is configured twice", agent.id);
            }
            // Policy text is decoded at selection time so it can be reported
            // per agent rather than failing the whole file.
            for policy in &agent.servers {
                if !ids.contains(&policy.server_id) {
                    bail!(
                        "agent '{}' names unknown server '{}'",
                        agent.id,
                        policy.server_id
                    );
                }
            }
        }
        Ok(())
    }

    pub fn agent(&self, id: &str) -> Option<&AgentProfile> {
        self.agents.iter().find(|a| a.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::{EndpointAuth, TransportConfig};
    use crate::selection::InclusionSpec;

    const SAMPLE: &str = r#"
        [resilience]
        breaker_threshold = 5
        call_timeout_secs = 30

        [[servers]]
        id = "search"
        transport = { kind = "network_endpoint", url = "https://search.example/mcp", auth = { bearer_env = "SEARCH_TOKEN" } }

        [[servers]]
        id = "files"
        name = "Local files"
        transport = { kind = "local_process", command = "mcp-files", args = ["--root", "/srv"], env = { RUST_LOG = "warn" } }

        [[cache]]
        server = "search"
        tool = "lookup"
        ttl_secs = 30

        [[agents]]
        id = "researcher"
        capacity_limit = 12
        servers = [{ server = "search", tools = "all" }, { server = "files", tools = ["read"] }]
    "#;

    #[test]
    fn test_parse_sample() {
        let config = HubConfig::parse(SAMPLE).unwrap();

        assert_eq!(config.resilience.breaker_threshold, 5);
        assert_eq!(config.resilience.call_timeout_secs, 30);
        assert_eq!(config.resilience.max_attempts, 2);

        assert_eq!(config.servers.len(), 2);
        match &config.servers[0].transport {
            TransportConfig::NetworkEndpoint { url, auth } => {
                assert_eq!(url, "https://search.example/mcp");
                assert_eq!(auth, &Some(EndpointAuth::BearerEnv("SEARCH_TOKEN".into())));
            }
            other => panic!("unexpected transport {:?}", other),
        }
        match &config.servers[1].transport {
            TransportConfig::LocalProcess { command, args, env, cwd } => {
                assert_eq!(command, "mcp-files");
                assert_eq!(args, &["--root", "/srv"]);
                assert_eq!(env.get("RUST_LOG").map(String::as_str), Some("warn"));
                assert!(cwd.is_none());
            }
            other => panic!("unexpected transport {:?}", other),
        }
        assert_eq!(config.servers[1].display_name(), "Local files");

        assert_eq!(config.cache[0].ttl(), Duration::from_secs(30));
        let agent = config.agent("researcher").unwrap();
        assert_eq!(agent.capacity_limit, 12);
        assert_eq!(agent.servers[0].tools, InclusionSpec::all());
        assert_eq!(agent.servers[1].tools, InclusionSpec::names(["read"]));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = HubConfig::parse("").unwrap();
        assert!(config.servers.is_empty());
        assert_eq!(config.resilience.invocation_timeout_secs, 120);
        assert_eq!(config.resilience.breaker().threshold, 3);
    }

    #[test]
    fn test_resilience_conversions() {
        let resilience = ResilienceConfig {
            breaker_cooldown_secs: 0,
            max_attempts: 0,
            rate_limit_max_wait_ms: 500,
            ..Default::default()
        };
        assert_eq!(resilience.breaker().cooldown, None);
        assert_eq!(resilience.retry().max_attempts, 1);
        assert_eq!(resilience.retry().rate_limit_max_wait, Duration::from_millis(500));
        assert_eq!(resilience.invoker().call_timeout, Duration::from_secs(60));
        assert_eq!(resilience.connection_settings().max_concurrent_calls, 8);
    }

    #[test]
    fn test_duplicate_server_rejected() {
        let text = r#"
            [[servers]]
            id = "a"
            transport = { kind = "network_endpoint", url = "http://a" }
            [[servers]]
            id = "a"
            transport = { kind = "network_endpoint", url = "http://b" }
        "#;
        let err = HubConfig::parse(text).unwrap_err();
        assert!(err.to_string().contains("configured twice"));
    }

    #[test]
    fn test_invalid_server_rejected() {
        let text = r#"
            [[servers]]
            id = "bad id"
            transport = { kind = "network_endpoint", url = "http://a" }
        "#;
        assert!(HubConfig::parse(text).is_err());

        let text = r#"
            [[servers]]
            id = "a"
            transport = { kind = "network_endpoint", url = "ftp://a" }
        "#;
        assert!(HubConfig::parse(text).is_err());
    }

    #[test]
    fn test_unknown_references_rejected() {
        let text = r#"
            [[agents]]
            id = "x"
            capacity_limit = 1
            servers = [{ server = "ghost" }]
        "#;
        let err = HubConfig::parse(text).unwrap_err();
        assert!(err.to_string().contains("unknown server 'ghost'"));

        let text = r#"
            [[servers]]
            id = "a"
            transport = { kind = "network_endpoint", url = "http://a" }
            [[cache]]
            server = "a"
            tool = "t"
            ttl_secs = 0
        "#;
        assert!(HubConfig::parse(text).is_err());
    }

    #[test]
    fn test_malformed_policy_text_still_loads() {
        let text = r#"
            [[servers]]
            id = "a"
            transport = { kind = "network_endpoint", url = "http://a" }
            [[agents]]
            id = "x"
            capacity_limit = 4
            servers = [{ server = "a", tools = "search,lookup" }]
        "#;
        let config = HubConfig::parse(text).unwrap();
        assert!(config.agents[0].servers[0].tools.parse().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = HubConfig::load("/nonexistent/toolgate.toml").unwrap();
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_load_reports_path_on_parse_error() {
        let path = std::env::temp_dir().join(format!("toolgate-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "servers = 5").unwrap();
        let err = HubConfig::load(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(format!("{:#}", err).contains(&path.display().to_string()));
    }
}
