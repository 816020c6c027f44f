//! toolgate - resilient tool-server connections and dispatch for agents
//!
//! Connects to MCP tool servers over stdio child processes or streamable
//! HTTP, discovers their tools, computes bounded per-agent tool sets and
//! invokes tools behind circuit breakers, retry with backoff and an opt-in
//! result cache. The diagnostic binary is in `main.rs`.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod hub;
pub mod invoker;
pub mod mcp;
pub mod paths;
pub mod resilience;
pub mod selection;

pub use dispatch::{BoundTool, Dispatcher};
pub use error::{CapacityExceeded, ErrorKind, ToolError};
pub use hub::{ToolHub, ToolSet};
pub use invoker::ToolOutput;
