//! MCP integration: server registry, sessions, discovery and status events.
//!
//! Real sessions use rmcp (official Rust MCP SDK) over stdio child processes
//! or streamable HTTP. With the `testing` feature, `memory` provides an
//! in-process double.

mod discovery;
mod events;
mod manager;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
mod rmcp_transport;
mod server;
mod transport;

pub use discovery::{describe, discover};
pub use events::{EventReceiver, EventSender, ServerEvent};
pub use manager::{ConnectionLease, ConnectionManager, ConnectionSettings, ServerSnapshot};
#[cfg(any(test, feature = "testing"))]
pub use memory::InMemoryConnector;
pub use rmcp_transport::RmcpConnector;
pub use server::{
    EndpointAuth, ServerConfig, ServerId, ServerStatus, ToolDescriptor, ToolServer,
    TransportConfig,
};
pub use transport::{
    mentions_auth_failure, mentions_rate_limit, Connector, RawCallResult, RemoteTool, Session,
    TransportError, TransportFailure,
};
