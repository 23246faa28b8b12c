//! MCP error types.

use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize frame: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A frame arrived but is not text.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("unknown transport: {0} (expected stdio, sse or streamable-http)")]
    UnknownTransport(String),

    #[error("transport closed")]
    Closed,
}

impl Error {
    /// Whether the peer is gone and the session should end.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Closed)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
