//! The tool catalog: every Databricks operation bound to one API handle.

use std::future::Future;
use std::sync::Arc;

use runtime::{
    Arguments, BackendError, ChunkSink, ToolDefinition, ToolHandler, ToolRegistry, handler_fn,
};
use serde_json::Value;
use tracing::info;

use crate::client::DatabricksApi;
use crate::{clusters, dbfs, jobs, notebooks, sql};

/// Instructions sent to clients on `initialize`.
pub const INSTRUCTIONS: &str = "This server provides tools to interact with Databricks.";

pub(crate) type ToolEntry = (ToolDefinition, Arc<dyn ToolHandler>);

/// Adapt an operation taking the shared API handle into a [`ToolHandler`].
pub(crate) fn bind<F, Fut>(api: &Arc<dyn DatabricksApi>, f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Arc<dyn DatabricksApi>, Arguments, ChunkSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BackendError>> + Send + 'static,
{
    let api = Arc::clone(api);
    handler_fn(move |args, chunks| f(Arc::clone(&api), args, chunks))
}

/// Every tool in catalog order.
pub fn tools(api: Arc<dyn DatabricksApi>) -> Vec<(ToolDefinition, Arc<dyn ToolHandler>)> {
    let mut all = clusters::tools(&api);
    all.extend(jobs::tools(&api));
    all.extend(notebooks::tools(&api));
    all.extend(dbfs::tools(&api));
    all.extend(sql::tools(&api));
    all
}

/// Register the whole catalog. Fails on the first registry error, e.g. when a
/// tool of the same name is already present.
pub fn register_all(registry: &mut ToolRegistry, api: Arc<dyn DatabricksApi>) -> runtime::Result<()> {
    let entries = tools(api);
    let count = entries.len();
    for (definition, handler) in entries {
        registry.register(definition, handler)?;
    }
    info!(tools = count, "registered databricks tools");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubApi;
    use mcp::transport::stdio::StdioTransport;
    use mcp::{McpServer, ServerOptions};
    use runtime::{
        DispatchContext, Dispatcher, FailureKind, InvocationRequest, InvocationResult, Lifecycle,
    };
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex, split};

    fn dispatcher(api: StubApi) -> (Dispatcher, Arc<StubApi>) {
        let api = Arc::new(api);
        let mut registry = ToolRegistry::new();
        register_all(&mut registry, api.clone()).unwrap();
        (Dispatcher::new(registry), api)
    }

    fn request(tool: &str, args: Value) -> InvocationRequest {
        let Value::Object(args) = args else {
            panic!("arguments must be an object");
        };
        InvocationRequest::new(1i64, tool, args)
    }

    #[test]
    fn catalog_order_and_names() {
        let (dispatcher, _) = dispatcher(StubApi::new());
        assert_eq!(
            dispatcher.registry().tool_names(),
            [
                "list_clusters",
                "create_cluster",
                "terminate_cluster",
                "get_cluster",
                "start_cluster",
                "list_jobs",
                "get_job",
                "run_job",
                "get_run",
                "get_run_output",
                "cancel_run",
                "repair_run",
                "list_notebooks",
                "export_notebook",
                "list_files",
                "execute_sql",
            ]
        );
    }

    #[test]
    fn registering_twice_fails() {
        let api: Arc<dyn DatabricksApi> = Arc::new(StubApi::new());
        let mut registry = ToolRegistry::new();
        register_all(&mut registry, api.clone()).unwrap();
        assert!(register_all(&mut registry, api).is_err());
    }

    #[tokio::test]
    async fn unknown_job_surfaces_not_found_with_id() {
        let (dispatcher, api) = dispatcher(StubApi::new().respond(
            "/api/2.2/jobs/run-now",
            Err(BackendError::NotFound(
                "/api/2.2/jobs/run-now returned 400 Bad Request: RESOURCE_DOES_NOT_EXIST: Job abc does not exist."
                    .into(),
            )),
        ));

        let result = dispatcher
            .dispatch(&request("run_job", json!({"job_id": "abc"})), DispatchContext::new())
            .await;
        assert_eq!(result.failure_kind(), Some(FailureKind::BackendNotFound));
        let InvocationResult::Failure { message, .. } = result else {
            panic!("expected failure");
        };
        assert!(message.contains("abc"));
        assert_eq!(api.last_call().body.unwrap(), json!({"job_id": "abc"}));
    }

    #[tokio::test]
    async fn defaults_fill_optional_arguments() {
        let (dispatcher, api) = dispatcher(StubApi::new());
        let result = dispatcher
            .dispatch(
                &request(
                    "create_cluster",
                    json!({"cluster_name": "etl", "spark_version": "14.3.x-scala2.12", "node_type_id": "i3.xlarge"}),
                ),
                DispatchContext::new(),
            )
            .await;
        assert!(result.is_success());
        let body = api.last_call().body.unwrap();
        assert_eq!(body["num_workers"], 1);
        assert_eq!(body["autotermination_minutes"], 30);
    }

    #[tokio::test]
    async fn integer_run_ids_are_accepted() {
        let (dispatcher, api) = dispatcher(StubApi::new());
        let result = dispatcher
            .dispatch(&request("cancel_run", json!({"run_id": 314})), DispatchContext::new())
            .await;
        assert!(result.is_success());
        assert_eq!(api.last_call().body.unwrap(), json!({"run_id": 314}));
    }

    #[tokio::test]
    async fn bad_export_format_is_rejected_before_any_call() {
        let (dispatcher, api) = dispatcher(StubApi::new());
        let result = dispatcher
            .dispatch(
                &request("export_notebook", json!({"path": "/nb", "format": "PDF"})),
                DispatchContext::new(),
            )
            .await;
        assert_eq!(result.failure_kind(), Some(FailureKind::BackendInvalidRequest));
        assert!(api.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_run_job_outlasts_the_default_timeout_and_names_the_run() {
        let mut api = StubApi::new().respond("/api/2.2/jobs/run-now", Ok(json!({"run_id": 777})));
        for _ in 0..400 {
            api = api.respond(
                "/api/2.2/jobs/runs/get",
                Ok(json!({"run_id": 777, "state": {"life_cycle_state": "RUNNING"}})),
            );
        }
        let (dispatcher, _) = dispatcher(api);
        let (sink, mut rx) = ChunkSink::channel();

        let result = dispatcher
            .dispatch(
                &request("run_job", json!({"job_id": "42", "wait": true})),
                DispatchContext::new().with_chunks(sink),
            )
            .await;
        let InvocationResult::Failure { kind, message, .. } = result else {
            panic!("expected failure");
        };
        assert_eq!(kind, FailureKind::Timeout);
        assert_eq!(message, "timed out: job 42 run 777 still RUNNING after 3600s");

        // The run id reaches the client before any polling.
        assert_eq!(rx.try_recv().unwrap(), json!({"job_id": 42, "run_id": 777}));
        assert_eq!(rx.try_recv().unwrap()["life_cycle_state"], "RUNNING");
    }

    #[tokio::test(start_paused = true)]
    async fn run_job_wait_honors_a_shorter_timeout() {
        let mut api = StubApi::new().respond("/api/2.2/jobs/run-now", Ok(json!({"run_id": 778})));
        for _ in 0..10 {
            api = api.respond(
                "/api/2.2/jobs/runs/get",
                Ok(json!({"state": {"life_cycle_state": "PENDING"}})),
            );
        }
        let (dispatcher, _) = dispatcher(api);
        let result = dispatcher
            .dispatch(
                &request("run_job", json!({"job_id": "42", "wait": true, "timeout_secs": 30})),
                DispatchContext::new(),
            )
            .await;
        let InvocationResult::Failure { message, .. } = result else {
            panic!("expected failure");
        };
        assert!(message.ends_with("run 778 still PENDING after 30s"));
    }

    #[tokio::test]
    async fn list_clusters_over_a_session_echoes_the_id_and_array() {
        let clusters = json!([{"id": "c1", "state": "RUNNING"}]);
        let (dispatcher, api) =
            dispatcher(StubApi::new().respond("/api/2.0/clusters/list", Ok(clusters.clone())));
        let lifecycle = Lifecycle::new();
        lifecycle.mark_ready().unwrap();
        let server = McpServer::new(dispatcher, lifecycle, ServerOptions::default());

        let (client_io, server_io) = duplex(64 * 1024);
        let (server_read, server_write) = split(server_io);
        let transport = Arc::new(StdioTransport::new(BufReader::new(server_read), server_write));
        let session = tokio::spawn(server.session(transport).run());

        let (client_read, mut writer) = split(client_io);
        let mut lines = BufReader::new(client_read).lines();
        let call = json!({
            "jsonrpc": "2.0",
            "id": "req-7",
            "method": "tools/call",
            "params": {"name": "list_clusters", "arguments": {}}
        });
        writer.write_all(format!("{call}\n").as_bytes()).await.unwrap();

        let line = lines.next_line().await.unwrap().expect("stream ended");
        let resp: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(resp["id"], "req-7");
        assert_eq!(resp["result"]["isError"], false);
        // Arrays are not valid structured content; they travel as text only.
        assert!(resp["result"].get("structuredContent").is_none());
        let text = resp["result"]["content"][0]["text"].as_str().unwrap();
        assert_eq!(serde_json::from_str::<Value>(text).unwrap(), clusters);
        assert_eq!(api.last_call().path, "/api/2.0/clusters/list");

        writer.shutdown().await.unwrap();
        session.await.unwrap().unwrap();
    }
}
