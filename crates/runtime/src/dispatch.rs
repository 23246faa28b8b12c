//! Dispatch core: resolve, validate, invoke, classify.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::redact::Redactor;
use crate::registry::ToolRegistry;
use crate::result::{FailureKind, InvocationRequest, InvocationResult};
use crate::tool::ChunkSink;

/// Default bound on a single handler call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-dispatch inputs supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    /// Cancelling this token abandons the handler call.
    pub cancel: CancellationToken,
    /// Where intermediate chunks go.
    pub chunks: ChunkSink,
    /// Overrides both the tool's and the dispatcher's timeout.
    pub timeout: Option<Duration>,
}

impl DispatchContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_chunks(mut self, chunks: ChunkSink) -> Self {
        self.chunks = chunks;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Routes invocation requests to their handlers.
///
/// Holds no mutable state; one instance is shared by every session.
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    redactor: Redactor,
}

impl Dispatcher {
    /// Build a dispatcher over `registry`, sealing it if needed.
    pub fn new(mut registry: ToolRegistry) -> Self {
        registry.seal();
        Self {
            registry: Arc::new(registry),
            timeout: DEFAULT_TIMEOUT,
            redactor: Redactor::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Dispatch a request. Never fails; every error becomes a `Failure`.
    pub async fn dispatch(
        &self,
        request: &InvocationRequest,
        ctx: DispatchContext,
    ) -> InvocationResult {
        let span = info_span!("dispatch", id = %request.id, tool = %request.tool);
        async move {
            let result = self.run(request, ctx).await;
            match &result {
                InvocationResult::Success { .. } => info!("tool call succeeded"),
                InvocationResult::Failure { kind, message, .. } => {
                    warn!(%kind, %message, "tool call failed")
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run(&self, request: &InvocationRequest, ctx: DispatchContext) -> InvocationResult {
        let tool = match self.registry.lookup(&request.tool) {
            Ok(tool) => tool,
            Err(e) => return InvocationResult::failure(FailureKind::UnknownTool, e.to_string()),
        };

        let args = match tool.definition.schema.validate(&request.arguments) {
            Ok(args) => args,
            Err(violation) => {
                return InvocationResult::failure(
                    FailureKind::InvalidArguments,
                    violation.to_string(),
                );
            }
        };
        debug!(?args, "arguments validated");

        let timeout = ctx
            .timeout
            .or(tool.definition.timeout)
            .unwrap_or(self.timeout);
        let handler = Arc::clone(&tool.handler);
        let call = AssertUnwindSafe(handler.invoke(args, ctx.chunks)).catch_unwind();

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                InvocationResult::failure(FailureKind::Cancelled, "dispatch cancelled")
            }
            outcome = tokio::time::timeout(timeout, call) => match outcome {
                Err(_) => InvocationResult::failure(
                    FailureKind::Timeout,
                    format!("tool {} timed out after {timeout:?}", request.tool),
                ),
                Ok(Err(_panic)) => InvocationResult::failure(
                    FailureKind::InternalError,
                    format!("tool {} failed unexpectedly", request.tool),
                ),
                Ok(Ok(Ok(payload))) => InvocationResult::success(payload),
                Ok(Ok(Err(e))) => {
                    let kind = FailureKind::from(&e);
                    InvocationResult::failure(kind, self.redactor.redact(&e.to_string()))
                }
            },
        }
    }
}
