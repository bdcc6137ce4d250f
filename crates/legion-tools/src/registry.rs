// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use legion_collective::Participant;

use crate::tool::Tool;

/// A tool schema as advertised to providers.  Mirrors the model crate's
/// schema type but keeps this crate independent of it.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate tool name: {0}")]
    Duplicate(String),
}

/// Central registry holding all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    /// Register a tool.  Duplicate names are rejected — two tools silently
    /// shadowing each other is a wiring bug, not a feature.
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        self.register_shared(Arc::new(tool))
    }

    /// Register an already-shared tool (for callers assembling tool sets
    /// dynamically).
    pub fn register_shared(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Schemas for ALL registered tools, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// The participant's effective tool set: everything registered when the
    /// grant list contains `*`, otherwise the intersection of the grant list
    /// and the registry.
    pub fn definitions_for(&self, participant: &Participant) -> Vec<ToolDefinition> {
        self.definitions()
            .into_iter()
            .filter(|d| participant.grants_tool(&d.name))
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use legion_collective::{ModelRef, Participant};

    use super::*;
    use crate::tool::{ToolContext, ToolError};

    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, input: &Value, _ctx: &ToolContext) -> Result<String, ToolError> {
            Ok(format!("echo:{input}"))
        }
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" }).unwrap();
        assert!(reg.get("echo").is_some());
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "t" }).unwrap();
        let err = reg.register(EchoTool { name: "t" }).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(_)));
    }

    #[test]
    fn definitions_are_sorted_by_name() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "zeta" }).unwrap();
        reg.register(EchoTool { name: "alpha" }).unwrap();
        let definitions = reg.definitions();
        let names: Vec<&str> = definitions.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn wildcard_grant_sees_all_tools() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "a" }).unwrap();
        reg.register(EchoTool { name: "b" }).unwrap();
        let p = Participant::agent("x", "X", "p", ModelRef::new("mock", "m")).with_tools(["*"]);
        assert_eq!(reg.definitions_for(&p).len(), 2);
    }

    #[test]
    fn grant_list_intersects_with_registry() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "a" }).unwrap();
        let p = Participant::agent("x", "X", "p", ModelRef::new("mock", "m"))
            .with_tools(["a", "not_registered"]);
        let defs = reg.definitions_for(&p);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "a");
    }
}
