//! Cluster management.

use std::sync::Arc;

use runtime::{BackendError, ParamSpec, ParamType, ToolDefinition};
use serde_json::{Value, json};
use tracing::info;

use crate::args::{optional_i64, required_str};
use crate::catalog::{ToolEntry, bind};
use crate::client::DatabricksApi;

/// Settings for a new cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSpec {
    pub cluster_name: String,
    pub spark_version: String,
    pub node_type_id: String,
    pub num_workers: i64,
    pub autotermination_minutes: i64,
}

pub async fn list_clusters(api: &dyn DatabricksApi) -> Result<Value, BackendError> {
    info!("listing clusters");
    api.get("/api/2.0/clusters/list", &[]).await
}

pub async fn create_cluster(api: &dyn DatabricksApi, spec: &ClusterSpec) -> Result<Value, BackendError> {
    info!(cluster_name = %spec.cluster_name, "creating cluster");
    let body = json!({
        "cluster_name": spec.cluster_name,
        "spark_version": spec.spark_version,
        "node_type_id": spec.node_type_id,
        "num_workers": spec.num_workers,
        "autotermination_minutes": spec.autotermination_minutes,
    });
    api.post("/api/2.0/clusters/create", body).await
}

/// Terminate (not permanently delete) a cluster.
pub async fn terminate_cluster(api: &dyn DatabricksApi, cluster_id: &str) -> Result<Value, BackendError> {
    info!(cluster_id, "terminating cluster");
    api.post("/api/2.0/clusters/delete", json!({ "cluster_id": cluster_id }))
        .await
}

pub async fn get_cluster(api: &dyn DatabricksApi, cluster_id: &str) -> Result<Value, BackendError> {
    info!(cluster_id, "getting cluster");
    api.get("/api/2.0/clusters/get", &[("cluster_id", cluster_id.to_string())])
        .await
}

pub async fn start_cluster(api: &dyn DatabricksApi, cluster_id: &str) -> Result<Value, BackendError> {
    info!(cluster_id, "starting cluster");
    api.post("/api/2.0/clusters/start", json!({ "cluster_id": cluster_id }))
        .await
}

fn cluster_id() -> ParamSpec {
    ParamSpec::required("cluster_id", ParamType::String).describe("Cluster identifier")
}

pub(crate) fn tools(api: &Arc<dyn DatabricksApi>) -> Vec<ToolEntry> {
    vec![
        (
            ToolDefinition::new("list_clusters", "List all Databricks clusters"),
            bind(api, |api, _, _| async move { list_clusters(api.as_ref()).await }),
        ),
        (
            ToolDefinition::new("create_cluster", "Create a new Databricks cluster")
                .param(ParamSpec::required("cluster_name", ParamType::String))
                .param(
                    ParamSpec::required("spark_version", ParamType::String)
                        .describe("Runtime version, e.g. 14.3.x-scala2.12"),
                )
                .param(
                    ParamSpec::required("node_type_id", ParamType::String)
                        .describe("Instance type, e.g. i3.xlarge"),
                )
                .param(ParamSpec::optional("num_workers", ParamType::Integer).with_default(1))
                .param(
                    ParamSpec::optional("autotermination_minutes", ParamType::Integer)
                        .with_default(30),
                ),
            bind(api, |api, args, _| async move {
                let spec = ClusterSpec {
                    cluster_name: required_str(&args, "cluster_name")?.to_string(),
                    spark_version: required_str(&args, "spark_version")?.to_string(),
                    node_type_id: required_str(&args, "node_type_id")?.to_string(),
                    num_workers: optional_i64(&args, "num_workers").unwrap_or(1),
                    autotermination_minutes: optional_i64(&args, "autotermination_minutes")
                        .unwrap_or(30),
                };
                create_cluster(api.as_ref(), &spec).await
            }),
        ),
        (
            ToolDefinition::new("terminate_cluster", "Terminate a Databricks cluster").param(cluster_id()),
            bind(api, |api, args, _| async move {
                terminate_cluster(api.as_ref(), required_str(&args, "cluster_id")?).await
            }),
        ),
        (
            ToolDefinition::new("get_cluster", "Get information about a specific Databricks cluster")
                .param(cluster_id()),
            bind(api, |api, args, _| async move {
                get_cluster(api.as_ref(), required_str(&args, "cluster_id")?).await
            }),
        ),
        (
            ToolDefinition::new("start_cluster", "Start a terminated Databricks cluster").param(cluster_id()),
            bind(api, |api, args, _| async move {
                start_cluster(api.as_ref(), required_str(&args, "cluster_id")?).await
            }),
        ),
    ]
}
