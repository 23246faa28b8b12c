//! Recording [`DatabricksApi`] for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use runtime::BackendError;
use serde_json::{Value, json};

use crate::client::DatabricksApi;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Call {
    pub method: &'static str,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

/// Replies from per-path queues, `{}` once a queue runs dry.
#[derive(Default)]
pub(crate) struct StubApi {
    calls: Mutex<Vec<Call>>,
    responses: Mutex<HashMap<String, VecDeque<Result<Value, BackendError>>>>,
}

impl StubApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, path: &str, response: Result<Value, BackendError>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(response);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn last_call(&self) -> Call {
        self.calls().pop().expect("no calls recorded")
    }

    fn record(&self, call: Call) -> Result<Value, BackendError> {
        let reply = self
            .responses
            .lock()
            .unwrap()
            .get_mut(&call.path)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(json!({})));
        self.calls.lock().unwrap().push(call);
        reply
    }
}

#[async_trait]
impl DatabricksApi for StubApi {
    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, BackendError> {
        self.record(Call {
            method: "GET",
            path: path.to_string(),
            query: query.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            body: None,
        })
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, BackendError> {
        self.record(Call {
            method: "POST",
            path: path.to_string(),
            query: Vec::new(),
            body: Some(body),
        })
    }
}
