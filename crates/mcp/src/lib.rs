//! MCP (Model Context Protocol) server library.
//!
//! Exposes a sealed [`runtime::ToolRegistry`] to MCP clients over stdio,
//! HTTP+SSE or streamable HTTP. Each client gets a [`Session`] that decodes
//! JSON-RPC frames, dispatches `tools/call` requests concurrently and streams
//! intermediate chunks as `notifications/progress`.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{McpServer, ServerOptions, TransportKind};
//! use runtime::{Dispatcher, Lifecycle, ToolRegistry};
//!
//! # async fn example() -> mcp::Result<()> {
//! let lifecycle = Lifecycle::new();
//! let server = McpServer::new(
//!     Dispatcher::new(ToolRegistry::new()),
//!     lifecycle.clone(),
//!     ServerOptions::default(),
//! );
//! lifecycle.mark_ready().expect("fresh lifecycle");
//!
//! server
//!     .serve(TransportKind::Sse, "127.0.0.1:8000".parse().expect("valid address"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod protocol;
mod server;
mod session;
pub mod transport;

pub use error::{Error, Result};
pub use protocol::{
    CallToolParams, CallToolResult, CancelledParams, ClientInfo, Incoming, InitializeParams,
    InitializeResult, JsonRpcError, JsonRpcNotification, JsonRpcResponse, LATEST_PROTOCOL_VERSION,
    ListToolsResult, ProgressParams, RequestId, RequestMeta, SUPPORTED_PROTOCOL_VERSIONS,
    ServerCapabilities, ServerInfo, Tool, ToolContent, ToolsCapability,
};
pub use server::{DEFAULT_SESSION_IDLE, McpServer, ServerOptions, TransportKind};
pub use session::Session;
pub use transport::{MAX_FRAME_SIZE, OutboundFrame, Transport};
