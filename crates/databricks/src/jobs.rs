//! Jobs and job runs.

use std::sync::Arc;
use std::time::Duration;

use runtime::{BackendError, ChunkSink, ParamSpec, ParamType, ToolDefinition};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::args::{
    id_text, numeric_id, optional_bool, optional_i64, optional_str, optional_value, required_str,
};
use crate::catalog::{ToolEntry, bind};
use crate::client::DatabricksApi;

/// Default delay between run polls when waiting for a run.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Longest `run_job` will follow a run before handing back its id.
pub const MAX_WAIT: Duration = Duration::from_secs(60 * 60);

/// Call timeout for `run_job`. Outlasts [`MAX_WAIT`] so the wait's own
/// deadline, which names the run, fires first.
pub const RUN_JOB_TIMEOUT: Duration = Duration::from_secs(MAX_WAIT.as_secs() + 60);

/// Life-cycle states after which a run will not change again.
const TERMINAL_STATES: &[&str] = &["TERMINATED", "SKIPPED", "INTERNAL_ERROR"];

pub async fn list_jobs(api: &dyn DatabricksApi) -> Result<Value, BackendError> {
    info!("listing jobs");
    api.get("/api/2.0/jobs/list", &[]).await
}

pub async fn get_job(api: &dyn DatabricksApi, job_id: &str) -> Result<Value, BackendError> {
    info!(job_id, "getting job");
    api.get("/api/2.0/jobs/get", &[("job_id", job_id.trim().to_string())])
        .await
}

/// Trigger a run. Returns the `run-now` response, which carries `run_id`.
pub async fn run_job(
    api: &dyn DatabricksApi,
    job_id: &str,
    job_parameters: Option<Value>,
) -> Result<Value, BackendError> {
    info!(job_id, "running job");
    let mut body = Map::new();
    body.insert("job_id".into(), numeric_id(job_id));
    if let Some(params) = job_parameters {
        body.insert("job_parameters".into(), params);
    }
    api.post("/api/2.2/jobs/run-now", Value::Object(body)).await
}

/// Trigger a run and follow it until it settles or `max_wait` runs out.
///
/// The first chunk carries the new `run_id`; after that one chunk is emitted
/// per observed life-cycle change. Returns the final `runs/get` payload. A
/// failed poll or an exhausted wait fails the call with a message naming the
/// run, which keeps running on the workspace.
pub async fn run_job_and_wait(
    api: &dyn DatabricksApi,
    job_id: &str,
    job_parameters: Option<Value>,
    poll_interval: Duration,
    max_wait: Duration,
    chunks: &ChunkSink,
) -> Result<Value, BackendError> {
    let started = run_job(api, job_id, job_parameters).await?;
    let run_id = started
        .get("run_id")
        .map(id_text)
        .ok_or_else(|| BackendError::Unknown(format!("run-now for job {job_id} returned no run_id")))?;
    chunks.emit(json!({ "job_id": numeric_id(job_id), "run_id": numeric_id(&run_id) }));

    let mut last_state: Option<String> = None;
    let followed = tokio::time::timeout(
        max_wait,
        follow_run(api, &run_id, poll_interval, chunks, &mut last_state),
    )
    .await;

    match followed {
        Ok(result) => result
            .map_err(|e| e.context(format!("job {job_id} started run {run_id} but polling failed"))),
        Err(_) => {
            let state = last_state.as_deref().unwrap_or("UNKNOWN");
            warn!(%run_id, state, ?max_wait, "gave up waiting for run");
            Err(BackendError::Timeout(format!(
                "job {job_id} run {run_id} still {state} after {}s",
                max_wait.as_secs()
            )))
        }
    }
}

async fn follow_run(
    api: &dyn DatabricksApi,
    run_id: &str,
    poll_interval: Duration,
    chunks: &ChunkSink,
    last_state: &mut Option<String>,
) -> Result<Value, BackendError> {
    loop {
        let run = get_run(api, run_id, false).await?;

        let state = &run["state"];
        let life_cycle = state["life_cycle_state"].as_str().unwrap_or("UNKNOWN");
        if last_state.as_deref() != Some(life_cycle) {
            debug!(run_id, life_cycle, "run state changed");
            chunks.emit(json!({
                "run_id": numeric_id(run_id),
                "life_cycle_state": life_cycle,
                "result_state": state.get("result_state"),
                "state_message": state.get("state_message"),
            }));
            *last_state = Some(life_cycle.to_string());
        }

        if TERMINAL_STATES.contains(&life_cycle) {
            info!(run_id, life_cycle, "run finished");
            return Ok(run);
        }
        tokio::time::sleep(poll_interval).await;
    }
}

pub async fn get_run(
    api: &dyn DatabricksApi,
    run_id: &str,
    include_history: bool,
) -> Result<Value, BackendError> {
    info!(run_id, include_history, "getting run");
    let mut query = vec![("run_id", run_id.trim().to_string())];
    if include_history {
        query.push(("include_history", "true".to_string()));
    }
    api.get("/api/2.2/jobs/runs/get", &query).await
}

/// Output of a single task run. The API caps the output at 5 MB.
pub async fn get_run_output(api: &dyn DatabricksApi, run_id: &str) -> Result<Value, BackendError> {
    info!(run_id, "getting run output");
    api.get("/api/2.2/jobs/runs/get-output", &[("run_id", run_id.trim().to_string())])
        .await
}

pub async fn cancel_run(api: &dyn DatabricksApi, run_id: &str) -> Result<Value, BackendError> {
    info!(run_id, "cancelling run");
    api.post("/api/2.0/jobs/runs/cancel", json!({ "run_id": numeric_id(run_id) }))
        .await
}

/// Optional fields of a repair request. Unset fields are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepairOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerun_tasks: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerun_all_failed_tasks: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerun_dependent_tasks: Option<bool>,
    /// Required by the API on every repair after the first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_repair_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_parameters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_params: Option<Value>,
    /// `PERFORMANCE_OPTIMIZED` or `STANDARD`, serverless jobs only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance_target: Option<String>,
}

/// Re-run failed tasks of a finished run. Returns the `repair_id`.
pub async fn repair_run(
    api: &dyn DatabricksApi,
    run_id: &str,
    options: &RepairOptions,
) -> Result<Value, BackendError> {
    let listed = options.rerun_tasks.as_ref().is_some_and(|t| !t.is_empty());
    if listed && options.rerun_all_failed_tasks == Some(true) {
        return Err(BackendError::InvalidRequest(
            "use either rerun_tasks or rerun_all_failed_tasks, not both".to_string(),
        ));
    }

    info!(run_id, "repairing run");
    let mut body = Map::new();
    body.insert("run_id".into(), numeric_id(run_id));
    let fields = serde_json::to_value(options)
        .map_err(|e| BackendError::Unknown(format!("failed to encode repair request: {e}")))?;
    if let Value::Object(fields) = fields {
        body.extend(fields);
    }
    api.post("/api/2.2/jobs/runs/repair", Value::Object(body)).await
}

fn job_id() -> ParamSpec {
    ParamSpec::required("job_id", ParamType::String).describe("Job identifier")
}

fn run_id() -> ParamSpec {
    ParamSpec::required("run_id", ParamType::String).describe("Run identifier")
}

fn repair_options(args: &runtime::Arguments) -> Result<RepairOptions, BackendError> {
    let rerun_tasks = optional_value(args, "rerun_tasks")
        .map(serde_json::from_value::<Vec<String>>)
        .transpose()
        .map_err(|e| BackendError::InvalidRequest(format!("rerun_tasks must be a list of task keys: {e}")))?;
    Ok(RepairOptions {
        rerun_tasks,
        rerun_all_failed_tasks: optional_bool(args, "rerun_all_failed_tasks"),
        rerun_dependent_tasks: optional_bool(args, "rerun_dependent_tasks"),
        latest_repair_id: optional_i64(args, "latest_repair_id"),
        job_parameters: optional_value(args, "job_parameters"),
        pipeline_params: optional_value(args, "pipeline_params"),
        performance_target: optional_str(args, "performance_target").map(str::to_string),
    })
}

pub(crate) fn tools(api: &Arc<dyn DatabricksApi>) -> Vec<ToolEntry> {
    vec![
        (
            ToolDefinition::new("list_jobs", "List all Databricks jobs"),
            bind(api, |api, _, _| async move { list_jobs(api.as_ref()).await }),
        ),
        (
            ToolDefinition::new("get_job", "Get information about a specific Databricks job").param(job_id()),
            bind(api, |api, args, _| async move {
                get_job(api.as_ref(), required_str(&args, "job_id")?).await
            }),
        ),
        (
            ToolDefinition::new(
                "run_job",
                "Run a Databricks job. With wait=true, follows the run and streams its state changes",
            )
            .param(job_id())
            .param(
                ParamSpec::optional("job_parameters", ParamType::Object)
                    .describe("Job-level parameters, e.g. {\"param\": \"overriding_val\"}"),
            )
            .param(ParamSpec::optional("wait", ParamType::Boolean).with_default(false))
            .param(
                ParamSpec::optional("poll_interval_secs", ParamType::Integer)
                    .with_default(DEFAULT_POLL_INTERVAL.as_secs())
                    .describe("Seconds between run polls when waiting"),
            )
            .param(
                ParamSpec::optional("timeout_secs", ParamType::Integer)
                    .with_default(MAX_WAIT.as_secs())
                    .describe("Seconds to follow the run before returning its id, at most 3600"),
            )
            .with_timeout(RUN_JOB_TIMEOUT),
            bind(api, |api, args, chunks| async move {
                let job_id = required_str(&args, "job_id")?;
                let job_parameters = optional_value(&args, "job_parameters");
                if !optional_bool(&args, "wait").unwrap_or(false) {
                    return run_job(api.as_ref(), job_id, job_parameters).await;
                }
                let poll = optional_i64(&args, "poll_interval_secs")
                    .map_or(DEFAULT_POLL_INTERVAL.as_secs(), |s| s.max(1) as u64);
                let max_wait = optional_i64(&args, "timeout_secs")
                    .map_or(MAX_WAIT.as_secs(), |s| s.clamp(1, MAX_WAIT.as_secs() as i64) as u64);
                run_job_and_wait(
                    api.as_ref(),
                    job_id,
                    job_parameters,
                    Duration::from_secs(poll),
                    Duration::from_secs(max_wait),
                    &chunks,
                )
                .await
            }),
        ),
        (
            ToolDefinition::new("get_run", "Get information about a specific job run")
                .param(run_id())
                .param(ParamSpec::optional("include_history", ParamType::Boolean).with_default(false)),
            bind(api, |api, args, _| async move {
                let include_history = optional_bool(&args, "include_history").unwrap_or(false);
                get_run(api.as_ref(), required_str(&args, "run_id")?, include_history).await
            }),
        ),
        (
            ToolDefinition::new(
                "get_run_output",
                "Get the output and metadata of a single task run",
            )
            .param(run_id()),
            bind(api, |api, args, _| async move {
                get_run_output(api.as_ref(), required_str(&args, "run_id")?).await
            }),
        ),
        (
            ToolDefinition::new("cancel_run", "Cancel a job run").param(run_id()),
            bind(api, |api, args, _| async move {
                cancel_run(api.as_ref(), required_str(&args, "run_id")?).await
            }),
        ),
        (
            ToolDefinition::new(
                "repair_run",
                "Repair a failed job run by re-running failed tasks",
            )
            .param(run_id())
            .param(ParamSpec::optional("rerun_tasks", ParamType::Array).describe("Task keys to rerun"))
            .param(ParamSpec::optional("rerun_all_failed_tasks", ParamType::Boolean))
            .param(ParamSpec::optional("rerun_dependent_tasks", ParamType::Boolean))
            .param(
                ParamSpec::optional("latest_repair_id", ParamType::Integer)
                    .describe("Required on every repair after the first"),
            )
            .param(ParamSpec::optional("job_parameters", ParamType::Object))
            .param(ParamSpec::optional("pipeline_params", ParamType::Object))
            .param(
                ParamSpec::optional("performance_target", ParamType::String)
                    .describe("PERFORMANCE_OPTIMIZED or STANDARD"),
            ),
            bind(api, |api, args, _| async move {
                let options = repair_options(&args)?;
                repair_run(api.as_ref(), required_str(&args, "run_id")?, &options).await
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubApi;

    fn run_state(life_cycle: &str) -> Result<Value, BackendError> {
        Ok(json!({"run_id": 99, "state": {"life_cycle_state": life_cycle}}))
    }

    #[tokio::test]
    async fn numeric_job_ids_are_sent_as_integers() {
        let api = StubApi::new();
        run_job(&api, "42", Some(json!({"env": "dev"}))).await.unwrap();
        let body = api.last_call().body.unwrap();
        assert_eq!(body, json!({"job_id": 42, "job_parameters": {"env": "dev"}}));

        run_job(&api, "abc", None).await.unwrap();
        assert_eq!(api.last_call().body.unwrap(), json!({"job_id": "abc"}));
    }

    #[tokio::test]
    async fn get_run_adds_history_flag_only_when_set() {
        let api = StubApi::new();
        get_run(&api, "5", false).await.unwrap();
        assert_eq!(api.last_call().query.len(), 1);
        get_run(&api, "5", true).await.unwrap();
        assert_eq!(
            api.last_call().query[1],
            ("include_history".to_string(), "true".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_streams_each_state_change() {
        let api = StubApi::new()
            .respond("/api/2.2/jobs/run-now", Ok(json!({"run_id": 99})))
            .respond("/api/2.2/jobs/runs/get", run_state("PENDING"))
            .respond("/api/2.2/jobs/runs/get", run_state("RUNNING"))
            .respond("/api/2.2/jobs/runs/get", run_state("RUNNING"))
            .respond("/api/2.2/jobs/runs/get", run_state("TERMINATED"));
        let (sink, mut rx) = ChunkSink::channel();

        let run = run_job_and_wait(&api, "42", None, Duration::from_secs(10), MAX_WAIT, &sink)
            .await
            .unwrap();
        assert_eq!(run["state"]["life_cycle_state"], "TERMINATED");

        let first = rx.try_recv().unwrap();
        assert_eq!(first, json!({"job_id": 42, "run_id": 99}));

        let mut states = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            assert_eq!(chunk["run_id"], 99);
            states.push(chunk["life_cycle_state"].as_str().unwrap().to_string());
        }
        assert_eq!(states, ["PENDING", "RUNNING", "TERMINATED"]);
    }

    #[tokio::test]
    async fn failed_poll_names_the_started_run() {
        let api = StubApi::new()
            .respond("/api/2.2/jobs/run-now", Ok(json!({"run_id": 99})))
            .respond(
                "/api/2.2/jobs/runs/get",
                Err(BackendError::Unavailable("503".into())),
            );
        let err = run_job_and_wait(&api, "42", None, Duration::from_secs(1), MAX_WAIT, &ChunkSink::discard())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
        assert!(err.message().contains("run 99"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_wait_names_the_run_and_its_state() {
        let mut api = StubApi::new().respond("/api/2.2/jobs/run-now", Ok(json!({"run_id": 99})));
        for _ in 0..10 {
            api = api.respond("/api/2.2/jobs/runs/get", run_state("RUNNING"));
        }
        let err = run_job_and_wait(
            &api,
            "42",
            None,
            Duration::from_secs(10),
            Duration::from_secs(45),
            &ChunkSink::discard(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)));
        assert_eq!(err.message(), "job 42 run 99 still RUNNING after 45s");
        assert!(api.calls().iter().all(|c| !c.path.ends_with("cancel")));
    }

    #[tokio::test]
    async fn repair_omits_unset_fields() {
        let api = StubApi::new();
        let options = RepairOptions {
            rerun_all_failed_tasks: Some(true),
            latest_repair_id: Some(3),
            ..Default::default()
        };
        repair_run(&api, "17", &options).await.unwrap();
        assert_eq!(
            api.last_call().body.unwrap(),
            json!({"run_id": 17, "rerun_all_failed_tasks": true, "latest_repair_id": 3})
        );
    }

    #[tokio::test]
    async fn repair_rejects_conflicting_selectors() {
        let api = StubApi::new();
        let options = RepairOptions {
            rerun_tasks: Some(vec!["ingest".into()]),
            rerun_all_failed_tasks: Some(true),
            ..Default::default()
        };
        let err = repair_run(&api, "17", &options).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidRequest(_)));
        assert!(api.calls().is_empty());
    }
}
