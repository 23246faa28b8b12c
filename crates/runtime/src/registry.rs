//! Tool registry: the sealed catalog of tools and their handlers.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{RegistryError, Result};
use crate::tool::{ToolDefinition, ToolHandler};

/// A tool definition bound to its handler.
#[derive(Clone)]
pub struct RegisteredTool {
    pub definition: ToolDefinition,
    pub handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

/// Catalog of available tools.
///
/// Populated during startup, then sealed. A sealed registry is read-only and
/// can be shared across tasks behind an `Arc` without further locking.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
    sealed: bool,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. On error the registry is left unchanged.
    pub fn register(
        &mut self,
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<()> {
        if self.sealed {
            return Err(RegistryError::RegistryClosed(definition.name));
        }
        if definition.name.trim().is_empty() {
            return Err(RegistryError::InvalidSchema {
                tool: definition.name,
                reason: "tool name is empty".to_string(),
            });
        }
        if self.index.contains_key(&definition.name) {
            return Err(RegistryError::DuplicateTool(definition.name));
        }
        definition
            .schema
            .check()
            .map_err(|reason| RegistryError::InvalidSchema {
                tool: definition.name.clone(),
                reason,
            })?;

        debug!(tool = %definition.name, "registered tool");
        self.index.insert(definition.name.clone(), self.tools.len());
        self.tools.push(RegisteredTool {
            definition,
            handler,
        });
        Ok(())
    }

    /// Freeze the registry. Further registrations fail with `RegistryClosed`.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Look up a tool by name.
    pub fn lookup(&self, name: &str) -> Result<&RegisteredTool> {
        self.index
            .get(name)
            .map(|&i| &self.tools[i])
            .ok_or_else(|| RegistryError::UnknownTool(name.to_string()))
    }

    /// All tool definitions in registration order.
    ///
    /// The iterator is lazy and can be cloned to restart from the beginning.
    pub fn list(&self) -> impl Iterator<Item = &ToolDefinition> + Clone + '_ {
        self.tools.iter().map(|t| &t.definition)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.definition.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
