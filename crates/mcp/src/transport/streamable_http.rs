//! Streamable HTTP binding (MCP 2025-03-26).
//!
//! One endpoint, `/mcp`. Each posted request gets its own response stream that
//! carries the request's progress notifications and ends with its response.
//! Sessions are keyed by the `Mcp-Session-Id` header handed out on
//! `initialize`. A session ends on `DELETE /mcp`, at server shutdown, or once
//! it has gone [`ServerOptions::session_idle`] without a request.
//!
//! [`ServerOptions::session_idle`]: crate::ServerOptions::session_idle

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::post;
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{MAX_FRAME_SIZE, OutboundFrame, Transport};
use crate::error::Result;
use crate::protocol::{
    CancelledParams, Incoming, JsonRpcError, JsonRpcNotification, JsonRpcResponse, RequestId,
};
use crate::server::McpServer;

pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

const INBOUND_CAPACITY: usize = 64;

type Routes = Mutex<HashMap<RequestId, mpsc::UnboundedSender<OutboundFrame>>>;

fn lock(
    routes: &Routes,
) -> MutexGuard<'_, HashMap<RequestId, mpsc::UnboundedSender<OutboundFrame>>> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transport half of one streamable-HTTP session. Outbound frames are routed
/// to the response stream of the request they belong to.
pub struct StreamableHttpTransport {
    inbound: tokio::sync::Mutex<mpsc::Receiver<String>>,
    routes: Arc<Routes>,
}

impl Transport for StreamableHttpTransport {
    async fn receive(&self) -> Option<Result<String>> {
        self.inbound.lock().await.recv().await.map(Ok)
    }

    async fn send(&self, frame: OutboundFrame) -> Result<()> {
        let Some(id) = frame.correlation.clone() else {
            debug!("no response stream for uncorrelated frame");
            return Ok(());
        };
        let route = {
            let mut routes = lock(&self.routes);
            if frame.terminal {
                routes.remove(&id)
            } else {
                routes.get(&id).cloned()
            }
        };
        match route {
            Some(tx) => {
                if tx.send(frame).is_err() {
                    debug!(%id, "response stream already closed");
                }
            }
            None => debug!(%id, "no open response stream"),
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        lock(&self.routes).clear();
        Ok(())
    }
}

#[derive(Clone)]
struct HttpSession {
    inbound: mpsc::Sender<String>,
    routes: Arc<Routes>,
    cancel: CancellationToken,
    last_seen: Arc<Mutex<Instant>>,
}

impl HttpSession {
    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn last_seen(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether any request still has an open response stream.
    fn is_streaming(&self) -> bool {
        !lock(&self.routes).is_empty()
    }
}

type Sessions = Arc<RwLock<HashMap<String, HttpSession>>>;

/// Close `session` once it has seen no request for `idle`.
async fn expire_when_idle(sessions: Sessions, id: String, session: HttpSession, idle: Duration) {
    loop {
        let deadline = session.last_seen() + idle;
        tokio::select! {
            _ = session.cancel.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
        }
        if session.is_streaming() {
            session.touch();
            continue;
        }
        if session.last_seen() + idle <= Instant::now() {
            info!(session = %id, idle_secs = idle.as_secs(), "http session expired");
            sessions.write().await.remove(&id);
            session.cancel.cancel();
            return;
        }
    }
}

#[derive(Clone)]
struct HttpState {
    server: McpServer,
    sessions: Sessions,
}

impl HttpState {
    async fn open_session(&self) -> (String, HttpSession) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let routes: Arc<Routes> = Arc::default();
        let transport = StreamableHttpTransport {
            inbound: tokio::sync::Mutex::new(inbound_rx),
            routes: routes.clone(),
        };
        let session = self.server.session(Arc::new(transport));
        let id = session.id().to_string();
        let handle = HttpSession {
            inbound: inbound_tx,
            routes,
            cancel: session.cancel_token(),
            last_seen: Arc::new(Mutex::new(Instant::now())),
        };
        self.sessions.write().await.insert(id.clone(), handle.clone());
        info!(session = %id, "http session opened");

        tokio::spawn(expire_when_idle(
            self.sessions.clone(),
            id.clone(),
            handle.clone(),
            self.server.session_idle(),
        ));

        let sessions = self.sessions.clone();
        let session_id = id.clone();
        tokio::spawn(async move {
            if let Err(e) = session.run().await {
                warn!(session = %session_id, error = %e, "http session failed");
            }
            sessions.write().await.remove(&session_id);
        });

        (id, handle)
    }

    async fn find_session(&self, id: &str) -> Option<HttpSession> {
        self.sessions.read().await.get(id).cloned()
    }
}

/// Routes for the streamable-HTTP binding.
pub fn router(server: McpServer) -> Router {
    let state = HttpState {
        server,
        sessions: Arc::default(),
    };
    Router::new()
        .route("/mcp", post(handle_post).delete(handle_delete))
        .with_state(state)
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(MCP_SESSION_ID_HEADER)?.to_str().ok()
}

/// SSE unless the client explicitly asked for something else.
fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_none_or(|accept| accept.contains("text/event-stream") || accept.contains("*/*"))
}

fn rpc_error(status: StatusCode, error: JsonRpcError) -> Response {
    let body = JsonRpcResponse::error(None, error);
    (status, axum::Json(body)).into_response()
}

async fn handle_post(State(state): State<HttpState>, headers: HeaderMap, body: String) -> Response {
    if body.len() > MAX_FRAME_SIZE {
        return rpc_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            JsonRpcError::invalid_request(format!("frame exceeds {MAX_FRAME_SIZE} bytes")),
        );
    }
    let message = match Incoming::decode(&body) {
        Ok(message) => message,
        Err(error) => {
            warn!(%error, "undecodable frame");
            return rpc_error(StatusCode::BAD_REQUEST, error);
        }
    };

    let (session_id, session) = match session_header(&headers) {
        Some(id) => match state.find_session(id).await {
            Some(session) => (id.to_string(), session),
            None => return StatusCode::NOT_FOUND.into_response(),
        },
        None if matches!(&message, Incoming::Request { method, .. } if method == "initialize") => {
            state.open_session().await
        }
        None => {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                JsonRpcError::invalid_request("Mcp-Session-Id header is required"),
            );
        }
    };
    session.touch();

    let Some(id) = message.request_id().cloned() else {
        // Notifications and client responses are fire-and-forget.
        return match session.inbound.send(body).await {
            Ok(()) => StatusCode::ACCEPTED.into_response(),
            Err(_) => StatusCode::NOT_FOUND.into_response(),
        };
    };

    let (tx, rx) = mpsc::unbounded_channel();
    {
        let mut routes = lock(&session.routes);
        if routes.contains_key(&id) {
            return rpc_error(
                StatusCode::CONFLICT,
                JsonRpcError::invalid_request(format!("request {id} is already in flight")),
            );
        }
        routes.insert(id.clone(), tx);
    }
    if session.inbound.send(body).await.is_err() {
        lock(&session.routes).remove(&id);
        return StatusCode::NOT_FOUND.into_response();
    }

    let stream = RequestStream {
        frames: rx,
        guard: RequestGuard {
            id,
            session,
            finished: false,
        },
    };
    let mut response = if wants_event_stream(&headers) {
        stream.into_sse()
    } else {
        stream.into_json().await
    };
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response.headers_mut().insert(MCP_SESSION_ID_HEADER, value);
    }
    response
}

async fn handle_delete(State(state): State<HttpState>, headers: HeaderMap) -> StatusCode {
    let Some(id) = session_header(&headers) else {
        return StatusCode::BAD_REQUEST;
    };
    match state.sessions.write().await.remove(id) {
        Some(session) => {
            info!(session = %id, "http session closed by client");
            session.cancel.cancel();
            StatusCode::NO_CONTENT
        }
        None => StatusCode::NOT_FOUND,
    }
}

/// Cancels its request if dropped before the terminal frame went out.
struct RequestGuard {
    id: RequestId,
    session: HttpSession,
    finished: bool,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.session.touch();
        if self.finished {
            return;
        }
        lock(&self.session.routes).remove(&self.id);
        let notice = JsonRpcNotification::new(
            "notifications/cancelled",
            CancelledParams {
                request_id: self.id.clone(),
                reason: Some("response stream closed".to_string()),
            },
        );
        let delivered = serde_json::to_string(&notice)
            .ok()
            .is_some_and(|frame| self.session.inbound.try_send(frame).is_ok());
        debug!(id = %self.id, delivered, "response stream dropped before completion");
    }
}

struct RequestStream {
    frames: mpsc::UnboundedReceiver<OutboundFrame>,
    guard: RequestGuard,
}

impl RequestStream {
    fn into_sse(self) -> Response {
        let stream = futures::stream::unfold(self, |mut state| async move {
            if state.guard.finished {
                return None;
            }
            let frame = state.frames.recv().await?;
            state.guard.finished = frame.terminal;
            let event = Event::default().event("message").data(frame.body);
            Some((Ok::<_, Infallible>(event), state))
        });
        Sse::new(stream)
            .keep_alive(KeepAlive::default())
            .into_response()
    }

    /// Wait for the terminal frame and return it as a plain JSON body.
    /// Progress notifications have nowhere to go and are skipped.
    async fn into_json(mut self) -> Response {
        while let Some(frame) = self.frames.recv().await {
            if frame.terminal {
                self.guard.finished = true;
                return (
                    [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
                    frame.body,
                )
                    .into_response();
            }
        }
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerOptions;
    use axum::body::Body;
    use axum::http::Request;
    use runtime::{Dispatcher, Lifecycle, ToolDefinition, ToolRegistry, handler_fn};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn app() -> Router {
        app_with(ServerOptions::default())
    }

    fn app_with(options: ServerOptions) -> Router {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolDefinition::new("list_clusters", "List all clusters"),
                handler_fn(|_, chunks: runtime::ChunkSink| async move {
                    chunks.emit(json!({"page": 1}));
                    Ok(json!({"clusters": []}))
                }),
            )
            .unwrap();
        let lifecycle = Lifecycle::new();
        lifecycle.mark_ready().unwrap();
        router(McpServer::new(Dispatcher::new(registry), lifecycle, options))
    }

    fn post(session: Option<&str>, accept: &str, body: Value) -> Request<Body> {
        let mut builder = Request::post("/mcp")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, accept);
        if let Some(id) = session {
            builder = builder.header(MCP_SESSION_ID_HEADER, id);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn initialize(app: &Router) -> String {
        let response = app
            .clone()
            .oneshot(post(
                None,
                "application/json",
                json!({"jsonrpc": "2.0", "id": 0, "method": "initialize", "params": {}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let session = response.headers()[MCP_SESSION_ID_HEADER]
            .to_str()
            .unwrap()
            .to_string();
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["id"], 0);
        assert_eq!(body["result"]["serverInfo"]["name"], "databricks-mcp");
        session
    }

    #[tokio::test]
    async fn request_stream_ends_after_the_response() {
        let app = app();
        let session = initialize(&app).await;

        let response = app
            .clone()
            .oneshot(post(
                Some(&session),
                "application/json, text/event-stream",
                json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                    "params": {"name": "list_clusters", "arguments": {}}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.headers()["content-type"], "text/event-stream");

        // to_bytes only returns once the stream has ended.
        let text = body_text(response).await;
        let events: Vec<Value> = text
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .map(|data| serde_json::from_str(data).unwrap())
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["method"], "notifications/progress");
        assert_eq!(events[1]["id"], 1);
        assert_eq!(events[1]["result"]["isError"], false);
    }

    #[tokio::test]
    async fn notifications_are_accepted() {
        let app = app();
        let session = initialize(&app).await;
        let response = app
            .clone()
            .oneshot(post(
                Some(&session),
                "application/json",
                json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn unknown_session_is_404_and_delete_closes() {
        let app = app();
        let response = app
            .clone()
            .oneshot(post(
                Some("nope"),
                "application/json",
                json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let session = initialize(&app).await;
        let delete = |id: &str| {
            Request::delete("/mcp")
                .header(MCP_SESSION_ID_HEADER, id)
                .body(Body::empty())
                .unwrap()
        };
        let response = app.clone().oneshot(delete(&session)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = app.clone().oneshot(delete(&session)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_body_is_a_protocol_error() {
        let response = app()
            .oneshot(
                Request::post("/mcp")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["id"], Value::Null);
        assert_eq!(body["error"]["data"]["kind"], "ProtocolError");
    }

    #[tokio::test]
    async fn missing_session_header_is_rejected() {
        let response = app()
            .oneshot(post(
                None,
                "application/json",
                json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn dropped_stream_removes_its_route() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (inbound, mut inbound_rx) = mpsc::channel(4);
        let routes: Arc<Routes> = Arc::default();
        lock(&routes).insert(RequestId::Number(4), tx);
        let stream = RequestStream {
            frames: rx,
            guard: RequestGuard {
                id: RequestId::Number(4),
                session: HttpSession {
                    inbound,
                    routes: routes.clone(),
                    cancel: CancellationToken::new(),
                    last_seen: Arc::new(Mutex::new(Instant::now())),
                },
                finished: false,
            },
        };

        drop(stream.into_sse());

        assert!(lock(&routes).is_empty());
        let notice: Value = serde_json::from_str(&inbound_rx.recv().await.unwrap()).unwrap();
        assert_eq!(notice["method"], "notifications/cancelled");
        assert_eq!(notice["params"]["requestId"], 4);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_expire_and_active_ones_do_not() {
        let app = app_with(ServerOptions {
            session_idle: Duration::from_secs(60),
            ..Default::default()
        });
        let session = initialize(&app).await;
        let ping = |id: i64| {
            post(
                Some(&session),
                "application/json",
                json!({"jsonrpc": "2.0", "id": id, "method": "ping"}),
            )
        };

        // Each request pushes the deadline back.
        for id in 1..=3 {
            tokio::time::sleep(Duration::from_secs(40)).await;
            let response = app.clone().oneshot(ping(id)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        tokio::time::sleep(Duration::from_secs(61)).await;
        let response = app.clone().oneshot(ping(4)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn session_with_an_open_stream_is_not_idle() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (inbound, _inbound_rx) = mpsc::channel(4);
        let sessions: Sessions = Arc::default();
        let session = HttpSession {
            inbound,
            routes: Arc::default(),
            cancel: CancellationToken::new(),
            last_seen: Arc::new(Mutex::new(Instant::now())),
        };
        lock(&session.routes).insert(RequestId::Number(1), tx);
        sessions.write().await.insert("s1".to_string(), session.clone());

        let idle = Duration::from_secs(10);
        let watchdog = tokio::spawn(expire_when_idle(sessions.clone(), "s1".to_string(), session.clone(), idle));
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(!session.cancel.is_cancelled());
        assert!(sessions.read().await.contains_key("s1"));

        lock(&session.routes).clear();
        watchdog.await.unwrap();
        assert!(session.cancel.is_cancelled());
        assert!(sessions.read().await.is_empty());
    }
}
