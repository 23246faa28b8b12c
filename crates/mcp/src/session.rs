//! One client conversation: decode frames, route methods, stream results.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use runtime::{
    ChunkSink, DispatchContext, Dispatcher, FailureKind, InvocationRequest, InvocationResult,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, CancelledParams, Incoming, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcNotification, JsonRpcResponse, ListToolsResult, ProgressParams,
    RequestId, ServerCapabilities, Tool,
};
use crate::server::ServerContext;
use crate::transport::{OutboundFrame, Transport};

/// Requests dispatched but not yet answered.
///
/// An id stays reserved until its final frame is written, so a reused id is
/// refused for the whole life of the original. The entry holds the cancel
/// handle until the dispatch task claims the right to answer; whoever takes
/// the handle (the task, or a cancellation) owns the outcome.
#[derive(Debug, Default)]
struct Pending {
    inner: Mutex<HashMap<RequestId, Option<CancellationToken>>>,
}

impl Pending {
    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, Option<CancellationToken>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// False if `id` is already reserved.
    fn insert(&self, id: RequestId, token: CancellationToken) -> bool {
        match self.lock().entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Some(token));
                true
            }
        }
    }

    fn contains(&self, id: &RequestId) -> bool {
        self.lock().contains_key(id)
    }

    /// Cancel `id` unless its result is already being delivered.
    fn cancel(&self, id: &RequestId) -> bool {
        let mut map = self.lock();
        let Entry::Occupied(mut slot) = map.entry(id.clone()) else {
            return false;
        };
        match slot.get_mut().take() {
            Some(token) => {
                slot.remove();
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Claim the right to answer `id`. The id stays reserved until
    /// [`Pending::release`].
    fn complete(&self, id: &RequestId) -> bool {
        self.lock()
            .get_mut(id)
            .and_then(Option::take)
            .is_some()
    }

    fn release(&self, id: &RequestId) {
        self.lock().remove(id);
    }

    fn cancel_all(&self) -> usize {
        let tokens: Vec<_> = self.lock().drain().filter_map(|(_, token)| token).collect();
        for token in &tokens {
            token.cancel();
        }
        tokens.len()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// A client session bound to one transport.
///
/// Requests are handled concurrently; each `tools/call` runs in its own task
/// tracked by the process lifecycle. Ending the session (disconnect, explicit
/// cancel or process termination) cancels everything still in flight.
pub struct Session<T> {
    id: String,
    transport: Arc<T>,
    ctx: Arc<ServerContext>,
    cancel: CancellationToken,
    pending: Arc<Pending>,
}

impl<T: Transport> Session<T> {
    pub(crate) fn new(ctx: Arc<ServerContext>, transport: Arc<T>) -> Self {
        let cancel = ctx.lifecycle.terminate_token().child_token();
        Self {
            id: Uuid::new_v4().to_string(),
            transport,
            ctx,
            cancel,
            pending: Arc::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Cancelling this token ends the session.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests dispatched and not yet answered.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Serve frames until the client disconnects or the session is cancelled.
    pub async fn run(self) -> Result<()> {
        info!(session = %self.id, "session started");
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                frame = self.transport.receive() => frame,
            };

            let outcome = match frame {
                None => {
                    debug!(session = %self.id, "client disconnected");
                    break;
                }
                Some(Ok(raw)) => self.handle_frame(&raw).await,
                Some(Err(e)) if e.is_disconnect() => {
                    warn!(session = %self.id, error = %e, "transport failed");
                    break;
                }
                Some(Err(e)) => {
                    warn!(session = %self.id, error = %e, "rejecting inbound frame");
                    let error = match e {
                        Error::InvalidFrame(_) => JsonRpcError::parse_error(e.to_string()),
                        _ => JsonRpcError::invalid_request(e.to_string()),
                    };
                    self.reply(None, JsonRpcResponse::error(None, error)).await
                }
            };

            if let Err(e) = outcome {
                if e.is_disconnect() {
                    debug!(session = %self.id, error = %e, "client went away");
                    break;
                }
                warn!(session = %self.id, error = %e, "failed to answer frame");
            }
        }

        let abandoned = self.pending.cancel_all();
        if abandoned > 0 {
            info!(session = %self.id, abandoned, "cancelled in-flight requests");
        }
        self.cancel.cancel();
        info!(session = %self.id, "session closed");
        self.transport.close().await
    }

    async fn handle_frame(&self, raw: &str) -> Result<()> {
        debug!(session = %self.id, frame = raw, "inbound");
        let message = match Incoming::decode(raw) {
            Ok(message) => message,
            Err(error) => {
                warn!(session = %self.id, %error, "undecodable frame");
                return self.reply(None, JsonRpcResponse::error(None, error)).await;
            }
        };

        match message {
            Incoming::Request { id, method, params } => {
                self.handle_request(id, &method, params).await
            }
            Incoming::Notification { method, params } => {
                self.handle_notification(&method, params);
                Ok(())
            }
            Incoming::Response { id } => {
                debug!(session = %self.id, ?id, "ignoring client response");
                Ok(())
            }
        }
    }

    async fn handle_request(&self, id: RequestId, method: &str, params: Option<Value>) -> Result<()> {
        if self.pending.contains(&id) {
            // Answering with this id would give the client a second final frame.
            warn!(session = %self.id, %id, method, "request id already in flight");
            let error = JsonRpcError::invalid_request(format!("request id {id} is already in flight"));
            return self.reply(None, JsonRpcResponse::error(None, error)).await;
        }

        match method {
            "initialize" => {
                let params: InitializeParams = params
                    .map(serde_json::from_value)
                    .transpose()
                    .ok()
                    .flatten()
                    .unwrap_or_default();
                if let Some(client) = &params.client_info {
                    info!(session = %self.id, client = %client.name, version = ?client.version, "client connected");
                }
                let result = InitializeResult {
                    protocol_version: params.negotiated_version().to_string(),
                    capabilities: ServerCapabilities::default(),
                    server_info: self.ctx.info.clone(),
                    instructions: self.ctx.instructions.clone(),
                };
                self.respond(id, result).await
            }
            "ping" => self.respond(id, json!({})).await,
            "tools/list" => {
                let tools = self
                    .ctx
                    .dispatcher
                    .registry()
                    .list()
                    .map(Tool::from)
                    .collect();
                self.respond(id, ListToolsResult { tools }).await
            }
            "tools/call" => self.call_tool(id, params).await,
            other => {
                debug!(session = %self.id, method = other, "unknown method");
                self.reply_error(id, JsonRpcError::method_not_found(other)).await
            }
        }
    }

    fn handle_notification(&self, method: &str, params: Option<Value>) {
        match method {
            "notifications/initialized" => debug!(session = %self.id, "client initialized"),
            "notifications/cancelled" => {
                match params.map(serde_json::from_value::<CancelledParams>) {
                    Some(Ok(cancel)) => {
                        if self.pending.cancel(&cancel.request_id) {
                            info!(
                                session = %self.id,
                                id = %cancel.request_id,
                                reason = ?cancel.reason,
                                "request cancelled by client"
                            );
                        } else {
                            debug!(session = %self.id, id = %cancel.request_id, "cancel for unknown or finished request");
                        }
                    }
                    _ => warn!(session = %self.id, "malformed cancellation notice"),
                }
            }
            other => debug!(session = %self.id, method = other, "ignoring notification"),
        }
    }

    async fn call_tool(&self, id: RequestId, params: Option<Value>) -> Result<()> {
        let params: CallToolParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(params)) => params,
            Ok(None) => {
                return self
                    .reply_error(id, JsonRpcError::invalid_params("tools/call requires params"))
                    .await;
            }
            Err(e) => {
                return self
                    .reply_error(id, JsonRpcError::invalid_params(format!("invalid tools/call params: {e}")))
                    .await;
            }
        };

        let lifecycle = &self.ctx.lifecycle;
        if !lifecycle.is_accepting() {
            let state = lifecycle.state();
            return self
                .reply_error(id, JsonRpcError::unavailable(format!("server is {state}, not accepting requests")))
                .await;
        }

        let token = self.cancel.child_token();
        if !self.pending.insert(id.clone(), token.clone()) {
            let error = JsonRpcError::invalid_request(format!("request id {id} is already in flight"));
            return self.reply(None, JsonRpcResponse::error(None, error)).await;
        }

        let meta = params.meta.unwrap_or_default();
        let progress_token = meta
            .progress_token
            .unwrap_or_else(|| serde_json::to_value(&id).unwrap_or(Value::Null));
        let mut dispatch_ctx = DispatchContext::new().with_cancel(token);
        if let Some(ms) = meta.timeout_ms {
            dispatch_ctx = dispatch_ctx.with_timeout(Duration::from_millis(ms));
        }
        let request = InvocationRequest::new(id, params.name, params.arguments.unwrap_or_default());

        let ctx = self.ctx.clone();
        let transport = self.transport.clone();
        let pending = self.pending.clone();
        let session = self.id.clone();
        lifecycle.spawn(async move {
            let result = dispatch_streaming(&ctx.dispatcher, &request, dispatch_ctx, transport.as_ref(), progress_token).await;

            if !pending.complete(&request.id) {
                debug!(%session, id = %request.id, "discarding result of cancelled request");
                return;
            }
            if result.failure_kind() == Some(FailureKind::Cancelled) {
                pending.release(&request.id);
                debug!(%session, id = %request.id, "discarding result of cancelled request");
                return;
            }

            let response = JsonRpcResponse::success(request.id.clone(), CallToolResult::from(&result));
            let sent = match OutboundFrame::terminal(Some(request.id.clone()), &response) {
                Ok(frame) => transport.send(frame).await,
                Err(e) => Err(e),
            };
            pending.release(&request.id);
            if let Err(e) = sent {
                warn!(%session, id = %request.id, error = %e, "failed to deliver result");
            }
        });
        Ok(())
    }

    async fn respond(&self, id: RequestId, result: impl serde::Serialize) -> Result<()> {
        let response = JsonRpcResponse::success(id.clone(), result);
        self.reply(Some(id), response).await
    }

    async fn reply_error(&self, id: RequestId, error: JsonRpcError) -> Result<()> {
        let response = JsonRpcResponse::error(Some(id.clone()), error);
        self.reply(Some(id), response).await
    }

    async fn reply(&self, id: Option<RequestId>, response: JsonRpcResponse) -> Result<()> {
        let frame = OutboundFrame::terminal(id, &response)?;
        self.transport.send(frame).await
    }
}

/// Dispatch one request, forwarding its chunks as progress notifications.
/// Every chunk is sent before the result is returned.
async fn dispatch_streaming<T: Transport>(
    dispatcher: &Dispatcher,
    request: &InvocationRequest,
    ctx: DispatchContext,
    transport: &T,
    progress_token: Value,
) -> InvocationResult {
    let cancel = ctx.cancel.clone();
    let (sink, mut chunks) = ChunkSink::channel();
    let dispatch = dispatcher.dispatch(request, ctx.with_chunks(sink));
    tokio::pin!(dispatch);

    let mut progress = 0u64;
    let result = loop {
        tokio::select! {
            result = &mut dispatch => break result,
            Some(chunk) = chunks.recv() => {
                progress += 1;
                forward_chunk(transport, request, &cancel, &progress_token, progress, chunk).await;
            }
        }
    };
    while let Ok(chunk) = chunks.try_recv() {
        progress += 1;
        forward_chunk(transport, request, &cancel, &progress_token, progress, chunk).await;
    }
    result
}

async fn forward_chunk<T: Transport>(
    transport: &T,
    request: &InvocationRequest,
    cancel: &CancellationToken,
    progress_token: &Value,
    progress: u64,
    data: Value,
) {
    if cancel.is_cancelled() {
        return;
    }
    let notification = JsonRpcNotification::new(
        "notifications/progress",
        ProgressParams {
            progress_token: progress_token.clone(),
            progress,
            data,
        },
    );
    let sent = match OutboundFrame::chunk(request.id.clone(), &notification) {
        Ok(frame) => transport.send(frame).await,
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        debug!(id = %request.id, error = %e, "dropping chunk");
    }
}
