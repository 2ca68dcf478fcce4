//! MCP stdio-to-HTTP proxying
//!
//! `session` owns individual stdio MCP server subprocesses, `proxy` keeps
//! the session registry and correlates JSON-RPC traffic, `types` carries
//! the JSON-RPC envelopes and tool descriptors shared with the HTTP layer.

pub mod proxy;
pub mod session;
pub mod types;

pub use proxy::McpProxy;
pub use session::{McpSession, SessionError, SessionState};
pub use types::{RpcPayload, ToolDescriptor};
