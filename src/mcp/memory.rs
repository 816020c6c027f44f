//! In-process connector with scriptable servers.
//!
//! Each scripted server has a tool catalog, optional faults per tool, and
//! counters for opened sessions and calls. Successful calls echo
//! `{server, tool, arguments, call}` so callers can check routing.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Map, Value};

use super::server::{ServerId, TransportConfig};
use super::transport::{
    Connector, RawCallResult, RemoteTool, Session, TransportError, TransportFailure,
};

/// A failure a scripted tool produces instead of its normal result.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Throttling signal with an optional retry hint.
    RateLimited(Option<Duration>),
    /// The tool ran and reported an error payload.
    ToolError(String),
    /// The channel broke mid-call.
    ConnectionLost,
    /// The call never completes.
    Hang,
}

#[derive(Default)]
struct ToolScript {
    queued: VecDeque<Fault>,
    always: Option<Fault>,
    calls: usize,
}

/// One scripted server.
pub struct ScriptedServer {
    id: ServerId,
    tools: Mutex<Vec<RemoteTool>>,
    scripts: Mutex<HashMap<String, ToolScript>>,
    connect_failures: AtomicU32,
    connect_failure_kind: Mutex<TransportFailure>,
    ping_fails: AtomicBool,
    call_delay: Mutex<Option<Duration>>,
    connect_attempts: AtomicUsize,
    opens: AtomicUsize,
    open_sessions: AtomicUsize,
    total_calls: AtomicUsize,
}

impl ScriptedServer {
    fn new(id: ServerId, tools: Vec<RemoteTool>) -> Self {
        Self {
            id,
            tools: Mutex::new(tools),
            scripts: Mutex::new(HashMap::new()),
            connect_failures: AtomicU32::new(0),
            connect_failure_kind: Mutex::new(TransportFailure::Connect),
            ping_fails: AtomicBool::new(false),
            call_delay: Mutex::new(None),
            connect_attempts: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            open_sessions: AtomicUsize::new(0),
            total_calls: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &ServerId {
        &self.id
    }

    /// Append a tool to the catalog; visible from the next discovery.
    pub fn add_tool(&self, tool: RemoteTool) {
        lock(&self.tools).push(tool);
    }

    pub fn set_tools(&self, tools: Vec<RemoteTool>) {
        *lock(&self.tools) = tools;
    }

    /// Fail the next `times` session opens with `kind`.
    pub fn fail_connects(&self, times: u32, kind: TransportFailure) {
        *lock(&self.connect_failure_kind) = kind;
        self.connect_failures.store(times, Ordering::SeqCst);
    }

    /// Queue `fault` for the next `times` calls of `tool`.
    pub fn fail_next(&self, tool: &str, fault: Fault, times: usize) {
        let mut scripts = lock(&self.scripts);
        let script = scripts.entry(tool.to_string()).or_default();
        script.queued.extend(std::iter::repeat(fault).take(times));
    }

    /// Make every call of `tool` fail with `fault` until cleared.
    pub fn fail_always(&self, tool: &str, fault: Fault) {
        lock(&self.scripts).entry(tool.to_string()).or_default().always = Some(fault);
    }

    pub fn clear_faults(&self) {
        for script in lock(&self.scripts).values_mut() {
            script.queued.clear();
            script.always = None;
        }
    }

    pub fn fail_pings(&self, fail: bool) {
        self.ping_fails.store(fail, Ordering::SeqCst);
    }

    /// Delay every successful call by `delay`.
    pub fn set_call_delay(&self, delay: Option<Duration>) {
        *lock(&self.call_delay) = delay;
    }

    /// Calls that reached this server for `tool`, faults included.
    pub fn calls(&self, tool: &str) -> usize {
        lock(&self.scripts).get(tool).map(|s| s.calls).unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    /// Session opens tried, scripted failures included.
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Successful session opens over the server's lifetime.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    fn catalog(&self) -> Vec<RemoteTool> {
        lock(&self.tools).clone()
    }

    fn has_tool(&self, name: &str) -> bool {
        lock(&self.tools).iter().any(|t| t.name == name)
    }

    /// Record a call and pick the fault it should hit, if any.
    fn next_fault(&self, tool: &str) -> (usize, Option<Fault>) {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        let mut scripts = lock(&self.scripts);
        let script = scripts.entry(tool.to_string()).or_default();
        script.calls += 1;
        let fault = script.queued.pop_front().or_else(|| script.always.clone());
        (script.calls, fault)
    }
}

// Poisoning only follows a panic in a test thread; keep serving the data.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Build a tool with a permissive object schema.
pub fn tool(name: &str) -> RemoteTool {
    RemoteTool {
        name: name.to_string(),
        description: Some(format!("{} tool", name)),
        input_schema: Some(json!({ "type": "object" })),
    }
}

/// Connector serving scripted in-process servers.
#[derive(Default)]
pub struct InMemoryConnector {
    servers: DashMap<ServerId, Arc<ScriptedServer>>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server advertising tools with the given names.
    pub fn add_server(&self, id: impl Into<ServerId>, tools: &[&str]) -> Arc<ScriptedServer> {
        self.add_server_with(id, tools.iter().map(|name| tool(name)).collect())
    }

    pub fn add_server_with(
        &self,
        id: impl Into<ServerId>,
        tools: Vec<RemoteTool>,
    ) -> Arc<ScriptedServer> {
        let id = id.into();
        let server = Arc::new(ScriptedServer::new(id.clone(), tools));
        self.servers.insert(id, server.clone());
        server
    }

    pub fn server(&self, id: &str) -> Option<Arc<ScriptedServer>> {
        self.servers.get(&ServerId::from(id)).map(|s| s.value().clone())
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn open(
        &self,
        server_id: &ServerId,
        _transport: &TransportConfig,
    ) -> Result<Arc<dyn Session>, TransportError> {
        let server = self
            .servers
            .get(server_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| TransportError::connect(format!("no endpoint for '{}'", server_id)))?;

        server.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = server.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            server.connect_failures.store(remaining - 1, Ordering::SeqCst);
            let kind = *lock(&server.connect_failure_kind);
            return Err(TransportError::new(kind, "scripted connect failure"));
        }

        server.opens.fetch_add(1, Ordering::SeqCst);
        server.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemorySession {
            server,
            closed: AtomicBool::new(false),
        }))
    }
}

struct InMemorySession {
    server: Arc<ScriptedServer>,
    closed: AtomicBool,
}

impl InMemorySession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::new(TransportFailure::Closed, "session closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Session for InMemorySession {
    async fn list_tools(&self) -> Result<Vec<RemoteTool>, TransportError> {
        self.ensure_open()?;
        Ok(self.server.catalog())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<RawCallResult, TransportError> {
        self.ensure_open()?;
        if !self.server.has_tool(name) {
            return Err(TransportError::remote(format!("unknown tool '{}'", name)));
        }

        let (call, fault) = self.server.next_fault(name);
        match fault {
            Some(Fault::RateLimited(hint)) => {
                return Err(TransportError::rate_limited("429 Too Many Requests", hint))
            }
            Some(Fault::ToolError(payload)) => {
                return Ok(RawCallResult {
                    text: payload,
                    structured: None,
                    is_error: true,
                })
            }
            Some(Fault::ConnectionLost) => {
                return Err(TransportError::connect("connection reset by peer"))
            }
            Some(Fault::Hang) => std::future::pending::<()>().await,
            None => {}
        }

        let delay = *lock(&self.server.call_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let arguments = arguments.map(Value::Object).unwrap_or(Value::Null);
        Ok(RawCallResult {
            text: format!("{}/{}", self.server.id, name),
            structured: Some(json!({
                "server": self.server.id.as_str(),
                "tool": name,
                "arguments": arguments,
                "call": call,
            })),
            is_error: false,
        })
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.server.ping_fails.load(Ordering::SeqCst) {
            return Err(TransportError::connect("ping failed"));
        }
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.server.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
