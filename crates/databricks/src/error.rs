//! Client construction errors.
//!
//! Request failures are reported as [`runtime::BackendError`]; this enum only
//! covers what can go wrong before the first request.

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("DATABRICKS_HOST is empty")]
    MissingHost,

    #[error("DATABRICKS_TOKEN is empty")]
    MissingToken,

    #[error("invalid Databricks host {host:?}: {reason}")]
    InvalidHost { host: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
