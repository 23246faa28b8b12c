//! HTTP+SSE binding (MCP 2024-11-05).
//!
//! `GET /sse` opens the push stream and announces where to post;
//! `POST /messages?session_id=…` carries client frames. Responses travel back
//! over the stream in the order the client issued its requests.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Sse;
use axum::response::sse::{Event, KeepAlive};
use axum::routing::{get, post};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::{RwLock, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use super::outbox::OrderedOutbox;
use super::{MAX_FRAME_SIZE, OutboundFrame, Transport};
use crate::error::{Error, Result};
use crate::protocol::{CancelledParams, Incoming};
use crate::server::McpServer;

/// Posted frames buffered per session before `POST` applies backpressure.
const INBOUND_CAPACITY: usize = 64;

/// Transport half of one SSE client.
pub struct SseTransport {
    inbound: tokio::sync::Mutex<mpsc::Receiver<String>>,
    outbox: Mutex<OrderedOutbox>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl SseTransport {
    pub fn new(inbound: mpsc::Receiver<String>, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            inbound: tokio::sync::Mutex::new(inbound),
            outbox: Mutex::new(OrderedOutbox::new()),
            outbound: Mutex::new(Some(outbound)),
        }
    }

    fn outbox(&self) -> MutexGuard<'_, OrderedOutbox> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track issuance and cancellation so the outbox knows what to wait for.
    fn observe(&self, raw: &str) {
        match Incoming::decode(raw) {
            Ok(Incoming::Request { id, .. }) => self.outbox().issue(id),
            Ok(Incoming::Notification { method, params }) if method == "notifications/cancelled" => {
                let Some(Ok(cancel)) = params.map(serde_json::from_value::<CancelledParams>) else {
                    return;
                };
                let mut outbox = self.outbox();
                let released = outbox.forget(&cancel.request_id);
                if let Err(e) = self.emit(released) {
                    debug!(error = %e, "stream gone while releasing frames");
                }
            }
            _ => {}
        }
    }

    fn emit(&self, frames: Vec<OutboundFrame>) -> Result<()> {
        if frames.is_empty() {
            return Ok(());
        }
        let guard = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(Error::Closed)?;
        for frame in frames {
            tx.send(frame.body).map_err(|_| Error::Closed)?;
        }
        Ok(())
    }
}

impl Transport for SseTransport {
    async fn receive(&self) -> Option<Result<String>> {
        let raw = self.inbound.lock().await.recv().await?;
        self.observe(&raw);
        Some(Ok(raw))
    }

    async fn send(&self, frame: OutboundFrame) -> Result<()> {
        // Hold the outbox while emitting so concurrent senders cannot reorder.
        let mut outbox = self.outbox();
        let ready = outbox.push(frame);
        self.emit(ready)
    }

    async fn close(&self) -> Result<()> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}

#[derive(Clone)]
struct SseState {
    server: McpServer,
    sessions: Arc<RwLock<HashMap<String, mpsc::Sender<String>>>>,
}

/// Routes for the SSE binding.
pub fn router(server: McpServer) -> Router {
    let state = SseState {
        server,
        sessions: Arc::default(),
    };
    Router::new()
        .route("/sse", get(open_stream))
        .route("/messages", post(post_message))
        .with_state(state)
}

async fn open_stream(
    State(state): State<SseState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let session = state
        .server
        .session(Arc::new(SseTransport::new(inbound_rx, outbound_tx)));
    let session_id = session.id().to_string();
    // Dropping the response stream ends the session.
    let guard = session.cancel_token().drop_guard();

    state
        .sessions
        .write()
        .await
        .insert(session_id.clone(), inbound_tx);
    info!(session = %session_id, "sse client connected");

    let sessions = state.sessions.clone();
    let id = session_id.clone();
    tokio::spawn(async move {
        if let Err(e) = session.run().await {
            warn!(session = %id, error = %e, "sse session failed");
        }
        sessions.write().await.remove(&id);
    });

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages?session_id={session_id}"));
    let frames = UnboundedReceiverStream::new(outbound_rx).map(move |body| {
        let _guard = &guard;
        Event::default().event("message").data(body)
    });
    let stream = futures::stream::once(async move { endpoint })
        .chain(frames)
        .map(Ok::<_, Infallible>);

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    session_id: String,
}

async fn post_message(
    State(state): State<SseState>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> StatusCode {
    if body.len() > MAX_FRAME_SIZE {
        warn!(session = %query.session_id, bytes = body.len(), "frame too large");
        return StatusCode::PAYLOAD_TOO_LARGE;
    }
    let sender = state.sessions.read().await.get(&query.session_id).cloned();
    let Some(sender) = sender else {
        debug!(session = %query.session_id, "post for unknown session");
        return StatusCode::NOT_FOUND;
    };
    match sender.send(body).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::NOT_FOUND,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;
    use crate::server::ServerOptions;
    use axum::body::Body;
    use axum::http::Request;
    use runtime::{Dispatcher, Lifecycle, ToolRegistry};
    use tower::ServiceExt;

    fn terminal(id: i64, body: &str) -> OutboundFrame {
        OutboundFrame {
            correlation: Some(RequestId::Number(id)),
            terminal: true,
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn results_leave_in_issuance_order() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let transport = SseTransport::new(in_rx, out_tx);

        for id in 1..=2 {
            in_tx
                .send(format!(r#"{{"jsonrpc":"2.0","id":{id},"method":"tools/call"}}"#))
                .await
                .unwrap();
            transport.receive().await.unwrap().unwrap();
        }

        transport.send(terminal(2, "second")).await.unwrap();
        assert!(out_rx.try_recv().is_err());
        transport.send(terminal(1, "first")).await.unwrap();
        assert_eq!(out_rx.recv().await.unwrap(), "first");
        assert_eq!(out_rx.recv().await.unwrap(), "second");
    }

    #[tokio::test]
    async fn cancellation_unblocks_later_results() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let transport = SseTransport::new(in_rx, out_tx);

        for frame in [
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call"}"#,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call"}"#,
        ] {
            in_tx.send(frame.to_string()).await.unwrap();
            transport.receive().await.unwrap().unwrap();
        }
        transport.send(terminal(2, "second")).await.unwrap();

        in_tx
            .send(r#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":1}}"#.to_string())
            .await
            .unwrap();
        transport.receive().await.unwrap().unwrap();
        assert_eq!(out_rx.recv().await.unwrap(), "second");
    }

    fn app() -> Router {
        let lifecycle = Lifecycle::new();
        lifecycle.mark_ready().unwrap();
        let server = McpServer::new(
            Dispatcher::new(ToolRegistry::new()),
            lifecycle,
            ServerOptions::default(),
        );
        router(server)
    }

    #[tokio::test]
    async fn post_to_unknown_session_is_404() {
        let response = app()
            .oneshot(
                Request::post("/messages?session_id=missing")
                    .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stream_opens_with_an_endpoint_event() {
        let response = app()
            .oneshot(Request::get("/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        let text = String::from_utf8(first.to_vec()).unwrap();
        assert!(text.starts_with("event: endpoint\n"));
        assert!(text.contains("data: /messages?session_id="));
    }
}
