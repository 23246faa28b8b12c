//! Databricks REST client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use runtime::{BackendError, Redactor};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{ClientError, Result};

/// Bound on establishing a connection. Whole-request time is bounded by the
/// dispatcher, which drops the request future on expiry.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest error body echoed into a failure message.
const MAX_ERROR_DETAIL: usize = 512;

/// Workspace URL and personal access token.
#[derive(Clone)]
pub struct Credentials {
    host: String,
    token: String,
}

impl Credentials {
    /// Normalize the host (scheme defaults to `https`, no trailing slash).
    pub fn new(host: impl AsRef<str>, token: impl Into<String>) -> Result<Self> {
        let host = host.as_ref().trim().trim_end_matches('/');
        if host.is_empty() {
            return Err(ClientError::MissingHost);
        }
        let token = token.into().trim().to_string();
        if token.is_empty() {
            return Err(ClientError::MissingToken);
        }

        let host = if host.contains("://") {
            host.to_string()
        } else {
            format!("https://{host}")
        };
        if !(host.starts_with("https://") || host.starts_with("http://")) {
            return Err(ClientError::InvalidHost {
                host,
                reason: "scheme must be http or https".to_string(),
            });
        }
        if host.split("://").nth(1).is_none_or(str::is_empty) {
            return Err(ClientError::InvalidHost {
                host,
                reason: "missing hostname".to_string(),
            });
        }

        Ok(Self { host, token })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// The two verbs every adapter operation is built from.
///
/// Implemented by [`DatabricksClient`] and by stubs in tests. Paths are
/// absolute API paths such as `/api/2.0/clusters/list`.
#[async_trait]
pub trait DatabricksApi: Send + Sync {
    async fn get(&self, path: &str, query: &[(&str, String)]) -> std::result::Result<Value, BackendError>;

    async fn post(&self, path: &str, body: Value) -> std::result::Result<Value, BackendError>;
}

/// Error body shape returned by the Databricks REST API.
#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// reqwest-backed [`DatabricksApi`].
pub struct DatabricksClient {
    http: reqwest::Client,
    credentials: Credentials,
    redactor: Redactor,
}

impl DatabricksClient {
    pub fn new(credentials: Credentials) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("databricks-mcp/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let redactor = Redactor::new().with_secret(credentials.token());
        Ok(Self {
            http,
            credentials,
            redactor,
        })
    }

    pub fn host(&self) -> &str {
        self.credentials.host()
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.credentials.host());
        self.http
            .request(method, url)
            .bearer_auth(self.credentials.token())
            .header("accept", "application/json")
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        request: RequestBuilder,
    ) -> std::result::Result<Value, BackendError> {
        debug!(%method, path, "databricks request");
        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(path, &e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.transport_error(path, &e))?;
        debug!(%method, path, %status, bytes = body.len(), "databricks response");

        if !status.is_success() {
            return Err(self.scrub(classify(status, path, &body)));
        }
        if body.trim().is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&body)
            .map_err(|e| BackendError::Unknown(format!("{path} returned invalid JSON: {e}")))
    }

    fn transport_error(&self, path: &str, err: &reqwest::Error) -> BackendError {
        let message = self.redactor.redact(&format!("{path}: {err}"));
        if err.is_timeout() || err.is_connect() {
            BackendError::Unavailable(message)
        } else {
            BackendError::Unknown(message)
        }
    }

    fn scrub(&self, err: BackendError) -> BackendError {
        let clean = self.redactor.redact(err.message());
        if clean == err.message() {
            return err;
        }
        match err {
            BackendError::NotFound(_) => BackendError::NotFound(clean),
            BackendError::PermissionDenied(_) => BackendError::PermissionDenied(clean),
            BackendError::RateLimited(_) => BackendError::RateLimited(clean),
            BackendError::InvalidRequest(_) => BackendError::InvalidRequest(clean),
            BackendError::Unavailable(_) => BackendError::Unavailable(clean),
            BackendError::Timeout(_) => BackendError::Timeout(clean),
            BackendError::Unknown(_) => BackendError::Unknown(clean),
        }
    }
}

impl std::fmt::Display for DatabricksClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "databricks({})", self.credentials.host())
    }
}

#[async_trait]
impl DatabricksApi for DatabricksClient {
    async fn get(&self, path: &str, query: &[(&str, String)]) -> std::result::Result<Value, BackendError> {
        let request = self.request(Method::GET, path).query(query);
        self.execute(Method::GET, path, request).await
    }

    async fn post(&self, path: &str, body: Value) -> std::result::Result<Value, BackendError> {
        let request = self.request(Method::POST, path).json(&body);
        self.execute(Method::POST, path, request).await
    }
}

/// Map a non-success response onto the backend error taxonomy.
pub(crate) fn classify(status: StatusCode, path: &str, body: &str) -> BackendError {
    let detail: ApiErrorBody = serde_json::from_str(body).unwrap_or_default();
    let reason = match (&detail.error_code, &detail.message) {
        (Some(code), Some(message)) => format!("{code}: {message}"),
        (None, Some(message)) => message.clone(),
        (Some(code), None) => code.clone(),
        (None, None) => truncate(body.trim(), MAX_ERROR_DETAIL),
    };
    let message = format!("{path} returned {status}: {reason}");

    if detail.error_code.as_deref() == Some("RESOURCE_DOES_NOT_EXIST") {
        return BackendError::NotFound(message);
    }
    match status {
        StatusCode::NOT_FOUND => BackendError::NotFound(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::PermissionDenied(message),
        StatusCode::TOO_MANY_REQUESTS => BackendError::RateLimited(message),
        StatusCode::BAD_REQUEST => BackendError::InvalidRequest(message),
        s if s.is_server_error() => BackendError::Unavailable(message),
        _ => BackendError::Unknown(message),
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
