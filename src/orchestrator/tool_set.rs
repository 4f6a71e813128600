use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::errors::Result;
use crate::registry::ConnectionRegistry;
use crate::tools::{strip_prefix, ToolDescriptor};

/// One line of a session's tool policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPolicyEntry {
    pub connection_name: String,
    /// Tool names to expose, raw or namespaced; empty means every tool of
    /// the connection.
    #[serde(default)]
    pub enabled_tool_names: Vec<String>,
}

impl ToolPolicyEntry {
    pub fn all(connection_name: impl Into<String>) -> Self {
        Self {
            connection_name: connection_name.into(),
            enabled_tool_names: Vec::new(),
        }
    }

    pub fn only<I, S>(connection_name: impl Into<String>, tool_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            connection_name: connection_name.into(),
            enabled_tool_names: tool_names.into_iter().map(Into::into).collect(),
        }
    }
}

/// Tools offered to the model for one run, with the connection owning each.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnabledToolSet {
    tools: Vec<ToolDescriptor>,
    owners: HashMap<String, String>,
}

impl EnabledToolSet {
    /// No policy entries means every tool of every registered connection.
    /// Listed connections must be registered.
    pub async fn resolve(registry: &ConnectionRegistry, policy: &[ToolPolicyEntry]) -> Result<Self> {
        let mut set = Self::default();
        if policy.is_empty() {
            for connection in registry.connections().await {
                let tools = connection.list_tools().await?;
                set.extend(connection.name(), tools);
            }
            return Ok(set);
        }

        for entry in policy {
            let connection = registry.get_or_err(&entry.connection_name).await?;
            let tools = connection.list_tools().await?;
            if entry.enabled_tool_names.is_empty() {
                set.extend(connection.name(), tools);
            } else {
                let allowed: HashSet<&str> =
                    entry.enabled_tool_names.iter().map(String::as_str).collect();
                let name = connection.name();
                let tools = tools.into_iter().filter(|tool| {
                    allowed.contains(tool.name.as_str())
                        || allowed.contains(strip_prefix(name, &tool.name))
                });
                set.extend(connection.name(), tools);
            }
        }
        Ok(set)
    }

    fn extend(&mut self, connection_name: &str, tools: impl IntoIterator<Item = ToolDescriptor>) {
        for tool in tools {
            if self.owners.contains_key(&tool.name) {
                continue;
            }
            self.owners
                .insert(tool.name.clone(), connection_name.to_string());
            self.tools.push(tool);
        }
    }

    pub fn descriptors(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// Connection owning a namespaced tool name, if the tool is enabled.
    pub fn owner_of(&self, tool_name: &str) -> Option<&str> {
        self.owners.get(tool_name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
