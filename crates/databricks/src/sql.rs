//! SQL statement execution on a warehouse.

use std::sync::Arc;
use std::time::Duration;

use runtime::{BackendError, ChunkSink, ParamSpec, ParamType, ToolDefinition};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::args::{optional_str, required_str};
use crate::catalog::{ToolEntry, bind};
use crate::client::DatabricksApi;

/// Server-side wait requested on submission.
pub const WAIT_TIMEOUT: &str = "30s";

/// Delay between polls of a statement that outlived the server-side wait.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Longest a statement is polled before the call gives up on it.
pub const MAX_WAIT: Duration = Duration::from_secs(15 * 60);

/// Call timeout for `execute_sql`, just past [`MAX_WAIT`].
pub const EXECUTE_SQL_TIMEOUT: Duration = Duration::from_secs(MAX_WAIT.as_secs() + 30);

/// A statement to run.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement<'a> {
    pub statement: &'a str,
    pub warehouse_id: &'a str,
    pub catalog: Option<&'a str>,
    pub schema: Option<&'a str>,
}

fn state(payload: &Value) -> &str {
    payload["status"]["state"].as_str().unwrap_or("UNKNOWN")
}

fn is_pending(state: &str) -> bool {
    matches!(state, "PENDING" | "RUNNING")
}

/// Submit a statement and poll until it leaves `PENDING`/`RUNNING`.
///
/// The settled payload is returned as is, including `FAILED` statements,
/// whose `status.error` carries the warehouse's message. Polling stops after
/// [`MAX_WAIT`] with a timeout naming the statement.
pub async fn execute_statement(
    api: &dyn DatabricksApi,
    request: &Statement<'_>,
    chunks: &ChunkSink,
) -> Result<Value, BackendError> {
    info!(warehouse_id = request.warehouse_id, "executing statement");
    debug!(statement = request.statement, "statement text");

    let mut body = Map::new();
    body.insert("statement".into(), json!(request.statement));
    body.insert("warehouse_id".into(), json!(request.warehouse_id));
    body.insert("wait_timeout".into(), json!(WAIT_TIMEOUT));
    if let Some(catalog) = request.catalog {
        body.insert("catalog".into(), json!(catalog));
    }
    if let Some(schema) = request.schema {
        body.insert("schema".into(), json!(schema));
    }

    let payload = api.post("/api/2.0/sql/statements", Value::Object(body)).await?;
    if !is_pending(state(&payload)) {
        return Ok(payload);
    }

    let statement_id = payload["statement_id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| BackendError::Unknown("statement is still running but has no statement_id".to_string()))?;

    let polled = tokio::time::timeout(MAX_WAIT, poll_statement(api, &statement_id, payload, chunks)).await;
    let payload = match polled {
        Ok(result) => result
            .map_err(|e| e.context(format!("statement {statement_id} was submitted but polling failed")))?,
        Err(_) => {
            warn!(%statement_id, "gave up waiting for statement");
            return Err(BackendError::Timeout(format!(
                "statement {statement_id} did not finish within {}s",
                MAX_WAIT.as_secs()
            )));
        }
    };

    info!(%statement_id, state = state(&payload), "statement finished");
    Ok(payload)
}

async fn poll_statement(
    api: &dyn DatabricksApi,
    statement_id: &str,
    mut payload: Value,
    chunks: &ChunkSink,
) -> Result<Value, BackendError> {
    let path = format!("/api/2.0/sql/statements/{statement_id}");
    while is_pending(state(&payload)) {
        chunks.emit(json!({ "statement_id": statement_id, "state": state(&payload) }));
        tokio::time::sleep(POLL_INTERVAL).await;
        payload = api.get(&path, &[]).await?;
    }
    Ok(payload)
}

pub(crate) fn tools(api: &Arc<dyn DatabricksApi>) -> Vec<ToolEntry> {
    vec![(
        ToolDefinition::new(
            "execute_sql",
            "Execute a SQL statement on a SQL warehouse, streaming its state while it runs",
        )
        .param(ParamSpec::required("statement", ParamType::String))
        .param(ParamSpec::required("warehouse_id", ParamType::String))
        .param(ParamSpec::optional("catalog", ParamType::String))
        .param(ParamSpec::optional("schema", ParamType::String))
        .with_timeout(EXECUTE_SQL_TIMEOUT),
        bind(api, |api, args, chunks| async move {
            let request = Statement {
                statement: required_str(&args, "statement")?,
                warehouse_id: required_str(&args, "warehouse_id")?,
                catalog: optional_str(&args, "catalog"),
                schema: optional_str(&args, "schema"),
            };
            execute_statement(api.as_ref(), &request, &chunks).await
        }),
    )]
}
