//! Databricks workspace operations exposed as tools.
//!
//! Each operation is a plain async function over [`DatabricksApi`], so it can
//! be called directly or through the tool catalog. [`register_all`] binds the
//! whole catalog to one API handle and registers it with a
//! [`runtime::ToolRegistry`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use databricks::{Credentials, DatabricksClient, register_all};
//! use runtime::ToolRegistry;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = DatabricksClient::new(Credentials::new("adb-1.azuredatabricks.net", "dapi-...")?)?;
//! let mut registry = ToolRegistry::new();
//! register_all(&mut registry, Arc::new(client))?;
//! # Ok(())
//! # }
//! ```

mod args;
mod catalog;
mod client;
pub mod clusters;
pub mod dbfs;
mod error;
pub mod jobs;
pub mod notebooks;
pub mod sql;

#[cfg(test)]
mod stub;

pub use catalog::{INSTRUCTIONS, register_all, tools};
pub use client::{CONNECT_TIMEOUT, Credentials, DatabricksApi, DatabricksClient};
pub use error::{ClientError, Result};
