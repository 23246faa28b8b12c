//! Tool-dispatch runtime — registry, dispatch core and process lifecycle.
//!
//! This crate is transport-agnostic. It knows nothing about MCP framing or
//! Databricks; it routes named invocations to handlers and normalizes every
//! outcome into an [`InvocationResult`].
//!
//! # Overview
//!
//! - **ToolRegistry**: the catalog of [`ToolDefinition`]s and their
//!   [`ToolHandler`]s, sealed after startup.
//! - **Dispatcher**: resolves a request, validates its arguments against the
//!   tool's [`ParamSchema`], invokes the handler under a timeout and a
//!   cancellation token, and classifies the outcome.
//! - **Lifecycle**: `Starting → Ready → Draining → Stopped`, with tracked
//!   in-flight work and a bounded drain.
//!
//! # Example
//!
//! ```
//! use runtime::{
//!     DispatchContext, Dispatcher, InvocationRequest, ToolDefinition, ToolRegistry, handler_fn,
//! };
//! use serde_json::json;
//!
//! # async fn example() -> runtime::Result<()> {
//! let mut registry = ToolRegistry::new();
//! registry.register(
//!     ToolDefinition::new("list_clusters", "List all clusters"),
//!     handler_fn(|_, _| async { Ok(json!([{ "id": "c1", "state": "RUNNING" }])) }),
//! )?;
//!
//! let dispatcher = Dispatcher::new(registry);
//! let request = InvocationRequest::new(1i64, "list_clusters", Default::default());
//! let result = dispatcher.dispatch(&request, DispatchContext::new()).await;
//! assert!(result.is_success());
//! # Ok(())
//! # }
//! ```

mod dispatch;
mod error;
mod lifecycle;
mod redact;
mod registry;
mod result;
mod schema;
mod tool;

pub use dispatch::{DEFAULT_TIMEOUT, DispatchContext, Dispatcher};
pub use error::{BackendError, LifecycleError, RegistryError, Result};
pub use lifecycle::{DrainOutcome, Lifecycle, State};
pub use redact::Redactor;
pub use registry::{RegisteredTool, ToolRegistry};
pub use result::{FailureKind, InvocationRequest, InvocationResult, RequestId};
pub use schema::{ParamSchema, ParamSpec, ParamType, SchemaViolation};
pub use tool::{Arguments, ChunkSink, ToolDefinition, ToolHandler, handler_fn};
