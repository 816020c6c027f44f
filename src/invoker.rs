//! Single-call orchestration.
//!
//! `cache → breaker → acquire → call → classify → retry`, bounded by a
//! per-call timeout and an overall invocation timeout, and abortable through
//! a [`CancellationToken`]. Leases are RAII guards, so every exit path
//! (including cancellation, which drops the in-flight future) releases them.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::dispatch::validate_arguments;
use crate::error::{truncate_payload, TimeoutStage, ToolError};
use crate::mcp::{mentions_rate_limit, ConnectionLease, ConnectionManager, ServerEvent, ServerId};
use crate::resilience::{
    Admission, BreakerConfig, BreakerKey, CacheKey, CircuitBreaker, FailureOutcome, ResultCache,
    RetryDecision, RetryPlan, RetryPolicy,
};

/// Result of a successful invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutput {
    pub server_id: ServerId,
    pub tool: String,
    /// Text content blocks joined by newlines.
    pub content: String,
    pub structured: Option<Value>,
    /// Served from the result cache without contacting the server.
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
pub struct InvokerSettings {
    pub retry: RetryPolicy,
    pub call_timeout: Duration,
    /// Covers every attempt and backoff delay of one invocation.
    pub invocation_timeout: Duration,
}

impl Default for InvokerSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(60),
            invocation_timeout: Duration::from_secs(120),
        }
    }
}

/// Failures that say nothing about the remote tool's health.
fn counts_against_breaker(error: &ToolError) -> bool {
    !matches!(
        error,
        ToolError::SchemaValidation { .. }
            | ToolError::CircuitOpen { .. }
            | ToolError::Cancelled { .. }
            | ToolError::UnknownServer(_)
            | ToolError::UnknownTool { .. }
            | ToolError::DuplicateServer(_)
            | ToolError::InvalidConfig(_)
    )
}

pub struct Invoker {
    manager: Arc<ConnectionManager>,
    breaker: CircuitBreaker,
    cache: ResultCache<ToolOutput>,
    settings: InvokerSettings,
}

impl Invoker {
    pub fn new(
        manager: Arc<ConnectionManager>,
        breaker: BreakerConfig,
        cache_max_entries: usize,
        settings: InvokerSettings,
    ) -> Self {
        Self {
            manager,
            breaker: CircuitBreaker::new(breaker),
            cache: ResultCache::new(cache_max_entries),
            settings,
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn cache(&self) -> &ResultCache<ToolOutput> {
        &self.cache
    }

    pub fn settings(&self) -> &InvokerSettings {
        &self.settings
    }

    /// Invoke `server_id/tool` once, with retries as the failure allows.
    pub async fn invoke(
        &self,
        server_id: &ServerId,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        self.run(server_id, tool, arguments, cancel, false).await
    }

    /// Invoke a tool the server has not been discovered with yet.
    ///
    /// Cache and breaker are consulted first as for [`Invoker::invoke`].
    /// Once a session is up, the name and arguments are checked against
    /// the fresh discovery before anything is sent.
    pub async fn invoke_undiscovered(
        &self,
        server_id: &ServerId,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        self.run(server_id, tool, arguments, cancel, true).await
    }

    #[instrument(
        name = "tool.invoke",
        skip(self, arguments, cancel, verify),
        fields(invocation.id = %Uuid::new_v4(), mcp.server = %server_id, tool.name = %tool)
    )]
    async fn run(
        &self,
        server_id: &ServerId,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
        verify: bool,
    ) -> Result<ToolOutput, ToolError> {
        let arguments = match arguments {
            Value::Null => None,
            Value::Object(map) => Some(map),
            other => {
                return Err(ToolError::SchemaValidation {
                    server_id: server_id.clone(),
                    tool: tool.to_string(),
                    reason: format!("arguments must be a JSON object, got {}", json_type(&other)),
                })
            }
        };

        let cached = self.cache.ttl_for(server_id, tool).map(|ttl| {
            let canonical = arguments.clone().map(Value::Object).unwrap_or(Value::Null);
            (CacheKey::new(server_id, tool, &canonical), ttl)
        });
        if let Some((key, _)) = &cached {
            if let Some(hit) = self.cache.get(key) {
                debug!("cache hit");
                return Ok(ToolOutput {
                    from_cache: true,
                    ..hit
                });
            }
        }

        let breaker_key = BreakerKey::new(server_id, tool);
        let admission = self.breaker.admit(&breaker_key);
        match admission {
            Admission::Allowed => {}
            Admission::Probe => info!("circuit half-open, probing"),
            Admission::Rejected { failures } => {
                debug!(failures, "circuit open, not calling");
                return Err(ToolError::CircuitOpen {
                    server_id: server_id.clone(),
                    tool: tool.to_string(),
                    failures,
                });
            }
        }

        let limit = self.settings.invocation_timeout;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ToolError::Cancelled {
                server_id: server_id.clone(),
                tool: tool.to_string(),
            }),
            result = tokio::time::timeout(limit, self.attempts(server_id, tool, arguments, verify)) => {
                result.unwrap_or_else(|_| Err(ToolError::Timeout {
                    server_id: server_id.clone(),
                    tool: Some(tool.to_string()),
                    stage: TimeoutStage::Invocation,
                    after: limit,
                }))
            }
        };

        self.record_outcome(&breaker_key, admission, &outcome);

        if let (Ok(output), Some((key, ttl))) = (&outcome, cached) {
            self.cache.put(key, output.clone(), ttl, server_id, tool);
        }
        outcome
    }

    /// Only the probe caller may settle a half-open breaker.
    fn record_outcome(
        &self,
        key: &BreakerKey,
        admission: Admission,
        outcome: &Result<ToolOutput, ToolError>,
    ) {
        let probe = admission == Admission::Probe;
        let events = self.manager.events();
        match outcome {
            Ok(_) => {
                if self.breaker.on_success(key) {
                    info!("circuit closed");
                    events.send(ServerEvent::CircuitClosed {
                        server_id: key.server_id.clone(),
                        tool: key.tool.clone(),
                    });
                }
            }
            Err(error) if counts_against_breaker(error) => {
                let recorded = if probe {
                    self.breaker.on_probe_failure(key)
                } else {
                    self.breaker.on_failure(key)
                };
                if let FailureOutcome::Opened { failures } = recorded {
                    warn!(failures, error = %error, "circuit opened");
                    events.send(ServerEvent::CircuitOpened {
                        server_id: key.server_id.clone(),
                        tool: key.tool.clone(),
                        failures,
                    });
                }
            }
            Err(_) if probe => self.breaker.abandon(key),
            Err(_) => {}
        }
    }

    async fn attempts(
        &self,
        server_id: &ServerId,
        tool: &str,
        arguments: Option<Map<String, Value>>,
        verify: bool,
    ) -> Result<ToolOutput, ToolError> {
        let mut plan = RetryPlan::new(&self.settings.retry);
        loop {
            let attempt = plan.begin_attempt();
            let (result, lease) = match self.manager.acquire(server_id).await {
                Ok(lease) => {
                    if verify {
                        self.check_discovered(server_id, tool, arguments.as_ref())?;
                    }
                    (self.call_once(&lease, tool, arguments.clone()).await, Some(lease))
                }
                Err(e) => (Err(e), None),
            };

            let error = match result {
                Ok(output) => {
                    debug!(attempt, "call succeeded");
                    return Ok(output);
                }
                Err(error) => error,
            };

            match plan.on_failure(&error) {
                RetryDecision::GiveUp => {
                    warn!(attempt, error = %error, kind = %error.kind(), "call failed");
                    return Err(error);
                }
                RetryDecision::Retry { delay, reconnect } => {
                    if reconnect {
                        info!(attempt, error = %error, "connection failed, reconnecting");
                        if let Some(stale) = &lease {
                            self.manager.reconnect_stale(stale).await?;
                        }
                    }
                    drop(lease);
                    if !delay.is_zero() {
                        info!(attempt, delay_ms = delay.as_millis() as u64, "rate limited, backing off");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    /// Name and arguments against the discovery of the current session.
    fn check_discovered(
        &self,
        server_id: &ServerId,
        tool: &str,
        arguments: Option<&Map<String, Value>>,
    ) -> Result<(), ToolError> {
        let descriptor = self.manager.tool(server_id, tool)?;
        let arguments = arguments.cloned().map(Value::Object).unwrap_or(Value::Null);
        validate_arguments(descriptor.input_schema.as_ref(), &arguments).map_err(|reason| {
            ToolError::SchemaValidation {
                server_id: server_id.clone(),
                tool: tool.to_string(),
                reason,
            }
        })
    }

    async fn call_once(
        &self,
        lease: &ConnectionLease,
        tool: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<ToolOutput, ToolError> {
        let server_id = lease.server_id();
        let limit = self.settings.call_timeout;

        let raw = match tokio::time::timeout(limit, lease.session().call_tool(tool, arguments)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return Err(e.into_tool_error(server_id, Some(tool))),
            Err(_) => {
                return Err(ToolError::Timeout {
                    server_id: server_id.clone(),
                    tool: Some(tool.to_string()),
                    stage: TimeoutStage::Call,
                    after: limit,
                })
            }
        };
        self.manager.record_call(server_id, tool);

        if raw.is_error {
            if mentions_rate_limit(&raw.text) {
                return Err(ToolError::RateLimited {
                    server_id: server_id.clone(),
                    tool: tool.to_string(),
                    retry_after: None,
                    message: truncate_payload(&raw.text),
                });
            }
            return Err(ToolError::tool_execution(server_id, tool, &raw.text));
        }

        Ok(ToolOutput {
            server_id: server_id.clone(),
            tool: tool.to_string(),
            content: raw.text,
            structured: raw.structured,
            from_cache: false,
        })
    }
}

pub(crate) fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
