//! Tool definitions and the handler trait.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::BackendError;
use crate::schema::{ParamSchema, ParamSpec};

/// Validated tool arguments, keyed by parameter name.
pub type Arguments = Map<String, Value>;

/// A tool exposed to clients: name, description and parameter schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub schema: ParamSchema,
    /// Bound on one call, in place of the dispatcher's default.
    pub timeout: Option<Duration>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: ParamSchema::new(),
            timeout: None,
        }
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.schema = self.schema.param(spec);
        self
    }

    pub fn with_schema(mut self, schema: ParamSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Give this tool its own call timeout. A per-request timeout still wins.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// JSON Schema for the tool's input, as advertised over MCP.
    pub fn input_schema(&self) -> Value {
        self.schema.to_json_schema()
    }
}

/// Receives intermediate chunks from a running handler.
///
/// A sink with no receiver silently discards chunks. Chunks sent after the
/// dispatch has produced its terminal result are never delivered.
#[derive(Debug, Clone, Default)]
pub struct ChunkSink {
    tx: Option<mpsc::UnboundedSender<Value>>,
}

impl ChunkSink {
    /// Create a sink and the receiver that observes its chunks.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops everything.
    pub fn discard() -> Self {
        Self::default()
    }

    /// Emit a chunk. Returns `false` if nobody is listening.
    pub fn emit(&self, chunk: Value) -> bool {
        match &self.tx {
            Some(tx) => tx.send(chunk).is_ok(),
            None => false,
        }
    }
}

/// A tool's execution handler.
///
/// Implementations must be safe to call concurrently; one instance serves
/// every dispatch of its tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, args: Arguments, chunks: ChunkSink) -> Result<Value, BackendError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Arguments, ChunkSink) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, BackendError>> + Send,
{
    async fn invoke(&self, args: Arguments, chunks: ChunkSink) -> Result<Value, BackendError> {
        (self.0)(args, chunks).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Arguments, ChunkSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BackendError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ParamType;
    use serde_json::json;

    #[tokio::test]
    async fn fn_handler_invokes_closure() {
        let handler = handler_fn(|args: Arguments, _chunks| async move {
            Ok(json!({ "echo": args.get("x").cloned() }))
        });
        let mut args = Arguments::new();
        args.insert("x".into(), json!(1));
        let out = handler.invoke(args, ChunkSink::discard()).await.unwrap();
        assert_eq!(out, json!({ "echo": 1 }));
    }

    #[test]
    fn chunk_sink_delivers_in_order() {
        let (sink, mut rx) = ChunkSink::channel();
        assert!(sink.emit(json!(1)));
        assert!(sink.emit(json!(2)));
        assert_eq!(rx.try_recv().unwrap(), json!(1));
        assert_eq!(rx.try_recv().unwrap(), json!(2));
        drop(rx);
        assert!(!sink.emit(json!(3)));
        assert!(!ChunkSink::discard().emit(json!(4)));
    }

    #[test]
    fn definition_renders_input_schema() {
        let def = ToolDefinition::new("get_cluster", "Get a cluster")
            .param(ParamSpec::required("cluster_id", ParamType::String));
        assert_eq!(def.input_schema()["required"], json!(["cluster_id"]));
    }
}
