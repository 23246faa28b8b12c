//! Workspace notebooks.

use std::sync::Arc;

use runtime::{BackendError, ParamSpec, ParamType, ToolDefinition};
use serde_json::Value;
use tracing::info;

use crate::args::{optional_str, required_str};
use crate::catalog::{ToolEntry, bind};
use crate::client::DatabricksApi;

/// Exported content longer than this many characters is cut.
pub const MAX_EXPORT_CHARS: usize = 1000;

/// Export formats accepted by `/api/2.0/workspace/export`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportFormat {
    #[default]
    Source,
    Html,
    Jupyter,
    Dbc,
}

impl ExportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "SOURCE",
            Self::Html => "HTML",
            Self::Jupyter => "JUPYTER",
            Self::Dbc => "DBC",
        }
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SOURCE" => Ok(Self::Source),
            "HTML" => Ok(Self::Html),
            "JUPYTER" => Ok(Self::Jupyter),
            "DBC" => Ok(Self::Dbc),
            _ => Err(BackendError::InvalidRequest(format!(
                "unsupported export format '{s}', expected one of SOURCE, HTML, JUPYTER, DBC"
            ))),
        }
    }
}

pub async fn list_notebooks(api: &dyn DatabricksApi, path: &str) -> Result<Value, BackendError> {
    info!(path, "listing notebooks");
    api.get("/api/2.0/workspace/list", &[("path", path.to_string())])
        .await
}

/// Export a notebook. Long `content` is truncated; see [`MAX_EXPORT_CHARS`].
pub async fn export_notebook(
    api: &dyn DatabricksApi,
    path: &str,
    format: ExportFormat,
) -> Result<Value, BackendError> {
    info!(path, format = format.as_str(), "exporting notebook");
    let mut exported = api
        .get(
            "/api/2.0/workspace/export",
            &[("path", path.to_string()), ("format", format.as_str().to_string())],
        )
        .await?;

    let truncated = exported
        .get("content")
        .and_then(Value::as_str)
        .and_then(|content| truncate_content(content, MAX_EXPORT_CHARS));
    if let Some(summary) = truncated {
        exported["content"] = Value::String(summary);
    }
    Ok(exported)
}

fn truncate_content(content: &str, max: usize) -> Option<String> {
    let total = content.chars().count();
    if total <= max {
        return None;
    }
    let head: String = content.chars().take(max).collect();
    Some(format!(
        "{head}... [content truncated, total length: {total} characters]"
    ))
}

pub(crate) fn tools(api: &Arc<dyn DatabricksApi>) -> Vec<ToolEntry> {
    vec![
        (
            ToolDefinition::new("list_notebooks", "List notebooks in a workspace directory").param(
                ParamSpec::required("path", ParamType::String).describe("Workspace directory path"),
            ),
            bind(api, |api, args, _| async move {
                list_notebooks(api.as_ref(), required_str(&args, "path")?).await
            }),
        ),
        (
            ToolDefinition::new("export_notebook", "Export a notebook from the workspace")
                .param(ParamSpec::required("path", ParamType::String))
                .param(
                    ParamSpec::optional("format", ParamType::String)
                        .with_default(ExportFormat::default().as_str())
                        .describe("One of SOURCE, HTML, JUPYTER, DBC"),
                ),
            bind(api, |api, args, _| async move {
                let format = optional_str(&args, "format")
                    .map(str::parse::<ExportFormat>)
                    .transpose()?
                    .unwrap_or_default();
                export_notebook(api.as_ref(), required_str(&args, "path")?, format).await
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubApi;
    use serde_json::json;

    #[tokio::test]
    async fn long_exports_are_truncated() {
        let content = "a".repeat(MAX_EXPORT_CHARS + 500);
        let api = StubApi::new().respond(
            "/api/2.0/workspace/export",
            Ok(json!({"content": content, "file_type": "py"})),
        );

        let out = export_notebook(&api, "/Users/me/nb", ExportFormat::Source)
            .await
            .unwrap();
        let text = out["content"].as_str().unwrap();
        assert!(text.starts_with(&"a".repeat(MAX_EXPORT_CHARS)));
        assert!(text.ends_with("... [content truncated, total length: 1500 characters]"));
        assert_eq!(out["file_type"], "py");

        let call = api.last_call();
        assert_eq!(call.query[1], ("format".to_string(), "SOURCE".to_string()));
    }

    #[tokio::test]
    async fn short_exports_are_untouched() {
        let api = StubApi::new().respond("/api/2.0/workspace/export", Ok(json!({"content": "print(1)"})));
        let out = export_notebook(&api, "/nb", ExportFormat::Jupyter).await.unwrap();
        assert_eq!(out["content"], "print(1)");
    }

    #[test]
    fn formats_parse_case_insensitively() {
        assert_eq!("jupyter".parse::<ExportFormat>().unwrap(), ExportFormat::Jupyter);
        let err = "pdf".parse::<ExportFormat>().unwrap_err();
        assert!(matches!(err, BackendError::InvalidRequest(_)));
    }
}
