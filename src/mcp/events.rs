//! Server lifecycle events for status broadcasting.
//!
//! Uses `tokio::sync::broadcast` so an external state store, logs and
//! diagnostics can each subscribe. This core never persists server state
//! itself; subscribers do.

use tokio::sync::broadcast;

use super::server::ServerId;

/// Lifecycle event for subscribers.
///
/// Emitted by the connection manager on status transitions and by the
/// invoker when a breaker changes state.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Server stored as inactive.
    Registered { server_id: ServerId },

    /// Session open started.
    Connecting { server_id: ServerId },

    /// Session open and discovery succeeded.
    Connected {
        server_id: ServerId,
        /// Number of tools discovered.
        tool_count: usize,
    },

    /// Session open or discovery failed; status is now error.
    ConnectFailed { server_id: ServerId, error: String },

    /// Health check failed on an active server.
    Demoted { server_id: ServerId, error: String },

    /// Tool list replaced by a fresh discovery.
    ToolsRefreshed { server_id: ServerId, tool_count: usize },

    /// Session retired by an explicit disconnect.
    Disconnected { server_id: ServerId },

    /// A (server, tool) breaker opened.
    CircuitOpened {
        server_id: ServerId,
        tool: String,
        failures: u32,
    },

    /// A (server, tool) breaker closed after a successful call.
    CircuitClosed { server_id: ServerId, tool: String },
}

impl ServerEvent {
    /// Server the event is about.
    pub fn server_id(&self) -> &ServerId {
        match self {
            ServerEvent::Registered { server_id }
            | ServerEvent::Connecting { server_id }
            | ServerEvent::Connected { server_id, .. }
            | ServerEvent::ConnectFailed { server_id, .. }
            | ServerEvent::Demoted { server_id, .. }
            | ServerEvent::ToolsRefreshed { server_id, .. }
            | ServerEvent::Disconnected { server_id }
            | ServerEvent::CircuitOpened { server_id, .. }
            | ServerEvent::CircuitClosed { server_id, .. } => server_id,
        }
    }

    /// Returns true for failure transitions.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ServerEvent::ConnectFailed { .. }
                | ServerEvent::Demoted { .. }
                | ServerEvent::CircuitOpened { .. }
        )
    }
}

/// Broadcast sender for server events.
///
/// Clone this to share between components that emit events.
/// Sending to zero receivers silently succeeds.
#[derive(Clone)]
pub struct EventSender {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventSender {
    /// Create a sender buffering up to `capacity` events per receiver.
    ///
    /// Receivers further behind than that skip ahead rather than block.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Send an event to every current subscriber.
    ///
    /// Having no subscribers is not an error; the event is dropped.
    pub fn send(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }

    /// Create a subscriber that sees events sent from now on.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Receiver for server events.
///
/// A receiver that falls behind misses events but never blocks the sender.
pub struct EventReceiver {
    rx: broadcast::Receiver<ServerEvent>,
}

impl EventReceiver {
    /// Receive the next event. Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain everything currently queued.
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
