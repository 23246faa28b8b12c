//! DBFS browsing.

use std::sync::Arc;

use runtime::{BackendError, ParamSpec, ParamType, ToolDefinition};
use serde_json::Value;
use tracing::info;

use crate::args::required_str;
use crate::catalog::{ToolEntry, bind};
use crate::client::DatabricksApi;

pub async fn list_files(api: &dyn DatabricksApi, dbfs_path: &str) -> Result<Value, BackendError> {
    info!(dbfs_path, "listing files");
    api.get("/api/2.0/dbfs/list", &[("path", dbfs_path.to_string())])
        .await
}

pub(crate) fn tools(api: &Arc<dyn DatabricksApi>) -> Vec<ToolEntry> {
    vec![(
        ToolDefinition::new("list_files", "List files and directories in a DBFS path").param(
            ParamSpec::required("dbfs_path", ParamType::String).describe("e.g. dbfs:/FileStore"),
        ),
        bind(api, |api, args, _| async move {
            list_files(api.as_ref(), required_str(&args, "dbfs_path")?).await
        }),
    )]
}
