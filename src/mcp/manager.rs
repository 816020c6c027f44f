//! Connection manager with reference-counted session leases.
//!
//! Owns one session per registered server:
//! - `connect` serialises per server and discovers tools inside the new session
//! - `acquire` self-heals by connecting servers that are not active
//! - leases are RAII; a retired session closes when its last lease drops
//! - every status transition is broadcast as a [`ServerEvent`]

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

use super::discovery;
use super::events::{EventReceiver, EventSender, ServerEvent};
use super::server::{ServerConfig, ServerId, ServerStatus, ToolDescriptor, ToolServer};
use super::transport::{Connector, Session};
use crate::error::{ToolError, TimeoutStage};

/// Knobs for session management.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Bound on opening a session plus initial discovery.
    pub connect_timeout: Duration,
    /// Concurrent call leases per server (bulkhead size).
    pub max_concurrent_calls: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_concurrent_calls: 8,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct LeaseCount {
    refs: usize,
    retired: bool,
    closed: bool,
}

/// A live session plus its lease bookkeeping.
struct SessionHandle {
    server_id: ServerId,
    session: Arc<dyn Session>,
    count: Mutex<LeaseCount>,
}

impl SessionHandle {
    fn new(server_id: ServerId, session: Arc<dyn Session>) -> Self {
        Self {
            server_id,
            session,
            count: Mutex::new(LeaseCount::default()),
        }
    }

    /// Take a lease unless the session has been retired; the permit is
    /// handed back on refusal.
    fn lease(
        self: &Arc<Self>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<ConnectionLease, Option<OwnedSemaphorePermit>> {
        {
            let mut count = lock(&self.count);
            if count.retired {
                return Err(permit);
            }
            count.refs += 1;
        }
        Ok(ConnectionLease {
            handle: self.clone(),
            _permit: permit,
        })
    }

    fn release(&self) {
        let close = {
            let mut count = lock(&self.count);
            match count.refs.checked_sub(1) {
                Some(refs) => count.refs = refs,
                None => warn!(mcp.server = %self.server_id, "lease released with zero references"),
            }
            Self::should_close(&mut count)
        };
        if close {
            self.close();
        }
    }

    /// Stop handing out leases; close now if idle, otherwise on last release.
    fn retire(&self) {
        let close = {
            let mut count = lock(&self.count);
            count.retired = true;
            Self::should_close(&mut count)
        };
        if close {
            self.close();
        }
    }

    fn should_close(count: &mut LeaseCount) -> bool {
        if count.refs == 0 && count.retired && !count.closed {
            count.closed = true;
            return true;
        }
        false
    }

    fn close(&self) {
        debug!(mcp.server = %self.server_id, "closing session");
        self.session.close();
    }

    fn refs(&self) -> usize {
        lock(&self.count).refs
    }
}

/// Scoped use of a server's session.
///
/// Dropping the lease releases its reference and bulkhead permit.
pub struct ConnectionLease {
    handle: Arc<SessionHandle>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl ConnectionLease {
    pub fn server_id(&self) -> &ServerId {
        &self.handle.server_id
    }

    pub fn session(&self) -> &dyn Session {
        self.handle.session.as_ref()
    }

    fn is_lease_of(&self, handle: &Arc<SessionHandle>) -> bool {
        Arc::ptr_eq(&self.handle, handle)
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.handle.release();
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("server_id", &self.handle.server_id)
            .field("refs", &self.handle.refs())
            .finish()
    }
}

/// Point-in-time view of a server for status reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSnapshot {
    pub server_id: ServerId,
    pub name: String,
    /// "local_process" or "network_endpoint".
    pub transport: &'static str,
    pub target: String,
    pub status: ServerStatus,
    pub last_error: Option<String>,
    pub last_connected: Option<DateTime<Utc>>,
    pub tool_count: usize,
    /// Leases currently held on the live session.
    pub ref_count: usize,
    pub call_count: u64,
    pub last_tool: Option<String>,
}

struct SlotState {
    server: ToolServer,
    session: Option<Arc<SessionHandle>>,
    tools: Arc<Vec<ToolDescriptor>>,
    call_count: u64,
    last_tool: Option<String>,
}

struct ServerSlot {
    connect_lock: tokio::sync::Mutex<()>,
    bulkhead: Arc<Semaphore>,
    state: Mutex<SlotState>,
}

impl ServerSlot {
    fn state(&self) -> MutexGuard<'_, SlotState> {
        lock(&self.state)
    }

    fn status(&self) -> ServerStatus {
        self.state().server.status
    }

    fn is_live(&self) -> bool {
        let state = self.state();
        state.server.status == ServerStatus::Active && state.session.is_some()
    }

    /// Lease the active session, handing the permit back when there is none.
    fn try_lease(
        &self,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<ConnectionLease, Option<OwnedSemaphorePermit>> {
        let handle = {
            let state = self.state();
            match (&state.session, state.server.status) {
                (Some(handle), ServerStatus::Active) => handle.clone(),
                _ => return Err(permit),
            }
        };
        // Refused when retired between the check and the lease.
        handle.lease(permit)
    }

    fn snapshot(&self) -> ServerSnapshot {
        let state = self.state();
        let config = &state.server.config;
        ServerSnapshot {
            server_id: config.id.clone(),
            name: config.display_name().to_string(),
            transport: config.transport.kind(),
            target: config.transport.target(),
            status: state.server.status,
            last_error: state.server.last_error.clone(),
            last_connected: state.server.last_connected,
            tool_count: state.tools.len(),
            ref_count: state.session.as_ref().map(|h| h.refs()).unwrap_or(0),
            call_count: state.call_count,
            last_tool: state.last_tool.clone(),
        }
    }
}

/// Owns the registry of tool servers and their sessions.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    servers: DashMap<ServerId, Arc<ServerSlot>>,
    /// Registration order.
    order: RwLock<Vec<ServerId>>,
    events: EventSender,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, settings: ConnectionSettings) -> Self {
        Self::with_events(connector, settings, EventSender::default())
    }

    /// Create a manager that reports on an external event sender.
    pub fn with_events(
        connector: Arc<dyn Connector>,
        settings: ConnectionSettings,
        events: EventSender,
    ) -> Self {
        Self {
            connector,
            settings,
            servers: DashMap::new(),
            order: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    fn slot(&self, server_id: &ServerId) -> Result<Arc<ServerSlot>, ToolError> {
        self.servers
            .get(server_id)
            .map(|slot| slot.value().clone())
            .ok_or_else(|| ToolError::UnknownServer(server_id.clone()))
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Validate and store a server as inactive.
    #[instrument(skip_all, fields(mcp.server = %config.id))]
    pub fn register(&self, config: ServerConfig) -> Result<ServerId, ToolError> {
        config.validate()?;
        let server_id = config.id.clone();

        match self.servers.entry(server_id.clone()) {
            Entry::Occupied(_) => return Err(ToolError::DuplicateServer(server_id)),
            Entry::Vacant(vacant) => {
                let permits = self.settings.max_concurrent_calls.max(1);
                vacant.insert(Arc::new(ServerSlot {
                    connect_lock: tokio::sync::Mutex::new(()),
                    bulkhead: Arc::new(Semaphore::new(permits)),
                    state: Mutex::new(SlotState {
                        server: ToolServer::new(config),
                        session: None,
                        tools: Arc::new(Vec::new()),
                        call_count: 0,
                        last_tool: None,
                    }),
                }));
            }
        }
        self.order
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(server_id.clone());

        info!("registered server");
        self.events.send(ServerEvent::Registered {
            server_id: server_id.clone(),
        });
        Ok(server_id)
    }

    pub fn contains(&self, server_id: &ServerId) -> bool {
        self.servers.contains_key(server_id)
    }

    /// Registered server ids in registration order.
    pub fn server_ids(&self) -> Vec<ServerId> {
        self.order.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn status(&self, server_id: &ServerId) -> Result<ServerStatus, ToolError> {
        Ok(self.slot(server_id)?.status())
    }

    pub fn snapshot(&self, server_id: &ServerId) -> Result<ServerSnapshot, ToolError> {
        Ok(self.slot(server_id)?.snapshot())
    }

    /// Snapshots of every server in registration order.
    pub fn list(&self) -> Vec<ServerSnapshot> {
        self.server_ids()
            .iter()
            .filter_map(|id| self.slot(id).ok())
            .map(|slot| slot.snapshot())
            .collect()
    }

    /// Leases held on the server's current session.
    pub fn ref_count(&self, server_id: &ServerId) -> Result<usize, ToolError> {
        let slot = self.slot(server_id)?;
        let state = slot.state();
        Ok(state.session.as_ref().map(|h| h.refs()).unwrap_or(0))
    }

    /// Tools from the last successful discovery.
    pub fn tools(&self, server_id: &ServerId) -> Result<Arc<Vec<ToolDescriptor>>, ToolError> {
        Ok(self.slot(server_id)?.state().tools.clone())
    }

    pub fn tool(&self, server_id: &ServerId, name: &str) -> Result<ToolDescriptor, ToolError> {
        self.tools(server_id)?
            .iter()
            .find(|t| t.name == name)
            .cloned()
            .ok_or_else(|| ToolError::UnknownTool {
                server_id: server_id.clone(),
                tool: name.to_string(),
            })
    }

    /// Update per-server call statistics.
    pub fn record_call(&self, server_id: &ServerId, tool: &str) {
        if let Ok(slot) = self.slot(server_id) {
            let mut state = slot.state();
            state.call_count += 1;
            state.last_tool = Some(tool.to_string());
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open a session and discover its tools. No-op when already active.
    ///
    /// Concurrent calls for the same server serialise on a per-server lock,
    /// so first use never opens duplicate sessions.
    #[instrument(name = "mcp.connect", skip(self), fields(mcp.server = %server_id))]
    pub async fn connect(&self, server_id: &ServerId) -> Result<ServerStatus, ToolError> {
        let slot = self.slot(server_id)?;
        let _guard = slot.connect_lock.lock().await;
        if slot.is_live() {
            debug!("already active");
            return Ok(ServerStatus::Active);
        }
        self.open_session(server_id, &slot).await
    }

    /// Retire the current session and open a fresh one.
    #[instrument(name = "mcp.reconnect", skip(self), fields(mcp.server = %server_id))]
    pub async fn reconnect(&self, server_id: &ServerId) -> Result<ServerStatus, ToolError> {
        let slot = self.slot(server_id)?;
        let _guard = slot.connect_lock.lock().await;
        self.open_session(server_id, &slot).await
    }

    /// Replace the session behind a lease that hit a connection failure.
    ///
    /// If another caller already replaced it, the fresh session is kept.
    pub async fn reconnect_stale(&self, stale: &ConnectionLease) -> Result<ServerStatus, ToolError> {
        let server_id = stale.server_id().clone();
        let slot = self.slot(&server_id)?;
        let _guard = slot.connect_lock.lock().await;
        {
            let state = slot.state();
            if let Some(current) = &state.session {
                if !stale.is_lease_of(current) && state.server.status == ServerStatus::Active {
                    debug!(mcp.server = %server_id, "session already replaced");
                    return Ok(ServerStatus::Active);
                }
            }
        }
        self.open_session(&server_id, &slot).await
    }

    /// Caller must hold the slot's connect lock.
    async fn open_session(
        &self,
        server_id: &ServerId,
        slot: &ServerSlot,
    ) -> Result<ServerStatus, ToolError> {
        let (transport, previous) = {
            let mut state = slot.state();
            state.server.status = ServerStatus::Connecting;
            (state.server.config.transport.clone(), state.session.take())
        };
        if let Some(previous) = previous {
            previous.retire();
        }

        self.events.send(ServerEvent::Connecting {
            server_id: server_id.clone(),
        });
        info!(mcp.target = %transport.target(), "connecting");

        let limit = self.settings.connect_timeout;
        let timed_out = || ToolError::Timeout {
            server_id: server_id.clone(),
            tool: None,
            stage: TimeoutStage::Connect,
            after: limit,
        };

        let session = match tokio::time::timeout(limit, self.connector.open(server_id, &transport)).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(self.mark_failed(server_id, slot, e.into_tool_error(server_id, None))),
            Err(_) => return Err(self.mark_failed(server_id, slot, timed_out())),
        };

        let handle = Arc::new(SessionHandle::new(server_id.clone(), session));
        let discovered = match handle.lease(None) {
            Ok(lease) => match tokio::time::timeout(limit, discovery::discover(&lease)).await {
                Ok(result) => result,
                Err(_) => Err(timed_out()),
            },
            Err(_) => Err(ToolError::Connection {
                server_id: server_id.clone(),
                message: "session retired before discovery".into(),
            }),
        };

        let tools = match discovered {
            Ok(tools) => tools,
            Err(e) => {
                handle.retire();
                return Err(self.mark_failed(server_id, slot, e));
            }
        };

        let tool_count = tools.len();
        {
            let mut state = slot.state();
            state.session = Some(handle);
            state.tools = Arc::new(tools);
            state.server.status = ServerStatus::Active;
            state.server.last_error = None;
            state.server.last_connected = Some(Utc::now());
        }

        info!(tool_count, "connected");
        self.events.send(ServerEvent::Connected {
            server_id: server_id.clone(),
            tool_count,
        });
        Ok(ServerStatus::Active)
    }

    fn mark_failed(&self, server_id: &ServerId, slot: &ServerSlot, error: ToolError) -> ToolError {
        let message = error.to_string();
        {
            let mut state = slot.state();
            state.server.status = ServerStatus::Error;
            state.server.last_error = Some(message.clone());
        }
        warn!(error = %message, "connection failed");
        self.events.send(ServerEvent::ConnectFailed {
            server_id: server_id.clone(),
            error: message,
        });
        error
    }

    /// Lease the server's session for a call, connecting first if needed.
    ///
    /// Waits for a bulkhead permit, so saturating one server never blocks
    /// acquisitions on another.
    pub async fn acquire(&self, server_id: &ServerId) -> Result<ConnectionLease, ToolError> {
        let slot = self.slot(server_id)?;
        let permit = slot
            .bulkhead
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ToolError::Connection {
                server_id: server_id.clone(),
                message: "lease pool closed".into(),
            })?;
        self.lease_or_connect(server_id, &slot, Some(permit)).await
    }

    async fn lease_or_connect(
        &self,
        server_id: &ServerId,
        slot: &ServerSlot,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<ConnectionLease, ToolError> {
        let permit = match slot.try_lease(permit) {
            Ok(lease) => return Ok(lease),
            Err(permit) => permit,
        };

        debug!(mcp.server = %server_id, status = %slot.status(), "not active, connecting");
        self.connect(server_id).await?;

        slot.try_lease(permit).map_err(|_| ToolError::Connection {
            server_id: server_id.clone(),
            message: "session retired before it could be leased".into(),
        })
    }

    /// Re-run discovery inside the server's session.
    #[instrument(name = "mcp.refresh_tools", skip(self), fields(mcp.server = %server_id))]
    pub async fn refresh_tools(&self, server_id: &ServerId) -> Result<Vec<ToolDescriptor>, ToolError> {
        let slot = self.slot(server_id)?;
        let lease = self.lease_or_connect(server_id, &slot, None).await?;

        let limit = self.settings.connect_timeout;
        let tools = match tokio::time::timeout(limit, discovery::discover(&lease)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ToolError::Timeout {
                    server_id: server_id.clone(),
                    tool: None,
                    stage: TimeoutStage::Connect,
                    after: limit,
                })
            }
        };

        let tool_count = tools.len();
        {
            let mut state = slot.state();
            let current = state.session.as_ref().is_some_and(|h| lease.is_lease_of(h));
            if current {
                state.tools = Arc::new(tools.clone());
            }
        }

        info!(tool_count, "refreshed tools");
        self.events.send(ServerEvent::ToolsRefreshed {
            server_id: server_id.clone(),
            tool_count,
        });
        Ok(tools)
    }

    /// Ping the active session; demote to error on failure.
    ///
    /// A server without a live session is not connected by this call; its
    /// current status is returned as is.
    #[instrument(name = "mcp.health_check", skip(self), fields(mcp.server = %server_id))]
    pub async fn health_check(&self, server_id: &ServerId) -> Result<ServerStatus, ToolError> {
        let slot = self.slot(server_id)?;
        let lease = match slot.try_lease(None) {
            Ok(lease) => lease,
            Err(_) => return Ok(slot.status()),
        };

        let limit = self.settings.connect_timeout;
        let error = match tokio::time::timeout(limit, lease.session().ping()).await {
            Ok(Ok(())) => {
                debug!("healthy");
                return Ok(ServerStatus::Active);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("ping timed out after {}ms", limit.as_millis()),
        };

        let demoted = {
            let mut state = slot.state();
            let current = state.session.as_ref().is_some_and(|h| lease.is_lease_of(h));
            if current {
                state.server.status = ServerStatus::Error;
                state.server.last_error = Some(error.clone());
                state.session.take()
            } else {
                None
            }
        };

        match demoted {
            Some(handle) => {
                handle.retire();
                warn!(error = %error, "health check failed, demoted");
                self.events.send(ServerEvent::Demoted {
                    server_id: server_id.clone(),
                    error,
                });
                Ok(ServerStatus::Error)
            }
            None => Ok(slot.status()),
        }
    }

    /// Retire the session and mark the server inactive.
    ///
    /// The transport closes immediately when idle, otherwise when the last
    /// outstanding lease drops.
    #[instrument(name = "mcp.disconnect", skip(self), fields(mcp.server = %server_id))]
    pub async fn disconnect(&self, server_id: &ServerId) -> Result<(), ToolError> {
        let slot = self.slot(server_id)?;
        let _guard = slot.connect_lock.lock().await;

        let handle = {
            let mut state = slot.state();
            state.server.status = ServerStatus::Inactive;
            state.session.take()
        };

        if let Some(handle) = handle {
            info!(refs = handle.refs(), "disconnecting");
            handle.retire();
        }
        self.events.send(ServerEvent::Disconnected {
            server_id: server_id.clone(),
        });
        Ok(())
    }
}
