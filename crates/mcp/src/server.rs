//! Server assembly: shared state, transport selection and serve loops.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use runtime::{Dispatcher, Lifecycle};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::error::{Error, Result};
use crate::protocol::ServerInfo;
use crate::session::Session;
use crate::transport::stdio::StdioTransport;
use crate::transport::{Transport, sse, streamable_http};

/// Which binding to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    #[default]
    Stdio,
    Sse,
    StreamableHttp,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable-http",
        }
    }

    /// Whether the binding listens on a socket.
    pub fn is_network(self) -> bool {
        !matches!(self, Self::Stdio)
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "sse" => Ok(Self::Sse),
            "streamable-http" | "streamable_http" | "http" => Ok(Self::StreamableHttp),
            other => Err(Error::UnknownTransport(other.to_string())),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long a streamable-HTTP session may sit without requests before it
/// is closed.
pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(30 * 60);

/// Server identity and session policy.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Sent during `initialize`.
    pub info: ServerInfo,
    pub instructions: Option<String>,
    /// Idle limit for streamable-HTTP sessions. A session with a request
    /// still streaming is never idle.
    pub session_idle: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            info: ServerInfo::default(),
            instructions: None,
            session_idle: DEFAULT_SESSION_IDLE,
        }
    }
}

/// State shared by every session.
pub(crate) struct ServerContext {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) info: ServerInfo,
    pub(crate) instructions: Option<String>,
    pub(crate) session_idle: Duration,
}

/// An MCP server over a sealed tool registry.
///
/// Cloning is cheap. The server accepts work while the lifecycle is `Ready`
/// and every session ends when the lifecycle terminates.
#[derive(Clone)]
pub struct McpServer {
    ctx: Arc<ServerContext>,
}

impl McpServer {
    pub fn new(dispatcher: Dispatcher, lifecycle: Lifecycle, options: ServerOptions) -> Self {
        Self {
            ctx: Arc::new(ServerContext {
                dispatcher,
                lifecycle,
                info: options.info,
                instructions: options.instructions,
                session_idle: options.session_idle,
            }),
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.ctx.lifecycle
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.ctx.dispatcher
    }

    pub fn session_idle(&self) -> Duration {
        self.ctx.session_idle
    }

    /// Bind a new session to `transport`. Call [`Session::run`] to serve it.
    pub fn session<T: Transport>(&self, transport: Arc<T>) -> Session<T> {
        Session::new(self.ctx.clone(), transport)
    }

    /// Serve until stdin closes, or until HTTP listeners are shut down and
    /// their sessions have ended.
    pub async fn serve(&self, kind: TransportKind, addr: SocketAddr) -> Result<()> {
        match kind {
            TransportKind::Stdio => self.serve_stdio().await,
            TransportKind::Sse => self.serve_router(sse::router(self.clone()), addr, kind).await,
            TransportKind::StreamableHttp => {
                self.serve_router(streamable_http::router(self.clone()), addr, kind)
                    .await
            }
        }
    }

    pub async fn serve_stdio(&self) -> Result<()> {
        info!("serving MCP over stdio");
        self.session(Arc::new(StdioTransport::stdio())).run().await
    }

    async fn serve_router(&self, router: Router, addr: SocketAddr, kind: TransportKind) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        info!(%addr, transport = %kind, "listening");

        let shutdown = self.ctx.lifecycle.shutdown_token();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}
