//! CLI error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;

/// Fatal errors. Any of these ends the process with exit code 1.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The `--env-file` given could not be loaded.
    #[error("failed to load env file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },

    #[error("failed to initialize logging: {0}")]
    Logging(String),

    #[error("no address found for {0}")]
    Resolve(String),

    #[error(transparent)]
    Client(#[from] databricks::ClientError),

    #[error(transparent)]
    Registry(#[from] runtime::RegistryError),

    #[error(transparent)]
    Lifecycle(#[from] runtime::LifecycleError),

    /// The transport failed while serving.
    #[error(transparent)]
    Transport(#[from] mcp::Error),

    #[error("server task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
