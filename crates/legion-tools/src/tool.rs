// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use legion_collective::Collective;

use crate::bridge::SuspensionBridge;
use crate::registry::ToolRegistry;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier assigned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub input: Value,
}

/// The result of executing one tool call.  Exactly one of these is produced
/// per input call, whatever happened.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// True when the tool execution failed non-fatally.
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), content: content.into(), is_error: false }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), content: msg.into(), is_error: true }
    }
}

/// A structural failure that must take the whole dispatch down, not just
/// one tool call.  Raised by the communicate tool when a nested send trips
/// the chain-depth guard; the runtime re-raises it after the batch's error
/// results are in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchAbort {
    DepthExceeded { depth: usize, max: usize },
}

impl std::fmt::Display for DispatchAbort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DepthExceeded { depth, max } => write!(
                f,
                "circular communication: chain depth {depth} reached the limit of {max}"
            ),
        }
    }
}

/// Failure raised by a tool's `execute`.
///
/// `InvalidInput` and `Failed` are converted into error-marked results and
/// never abort the dispatch; `Abort` cascades after error results are
/// synthesized for the batch.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0}")]
    Failed(String),
    #[error("{0}")]
    Abort(DispatchAbort),
}

/// The communication chain: participant ids from the outermost sender to
/// the innermost agent.  Immutable — `push` returns a new chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chain(Vec<String>);

impl Chain {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn push(&self, id: impl Into<String>) -> Self {
        let mut inner = self.0.clone();
        inner.push(id.into());
        Self(inner)
    }

    /// The immediate sender of the current dispatch.
    pub fn top(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.iter().any(|i| i == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Context handed to every tool invocation.  Carried by value through the
/// executor; cheap to clone (ids + shared references).
#[derive(Clone)]
pub struct ToolContext {
    /// Participant on whose behalf the tool runs
    pub caller: String,
    pub chain: Chain,
    pub conversation_id: String,
    pub session_id: String,
    pub registry: Arc<ToolRegistry>,
    pub collective: Arc<Collective>,
    pub bridge: Arc<SuspensionBridge>,
}

/// Trait every tool implements.
///
/// `execute` returns the tool's string payload; failures are surfaced as
/// [`ToolError`] and materialised into error results by the executor so the
/// calling agent can observe and adapt.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the input object
    fn input_schema(&self) -> Value;
    async fn execute(&self, input: &Value, ctx: &ToolContext) -> Result<String, ToolError>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_push_is_immutable() {
        let base = Chain::new().push("user");
        let extended = base.push("agent-a");
        assert_eq!(base.len(), 1);
        assert_eq!(extended.len(), 2);
        assert_eq!(extended.top(), Some("agent-a"));
    }

    #[test]
    fn chain_top_of_empty_is_none() {
        assert_eq!(Chain::new().top(), None);
    }

    #[test]
    fn chain_contains_all_pushed_ids() {
        let c = Chain::new().push("a").push("b");
        assert!(c.contains("a"));
        assert!(c.contains("b"));
        assert!(!c.contains("c"));
    }

    #[test]
    fn tool_output_constructors_set_error_flag() {
        assert!(!ToolOutput::ok("1", "fine").is_error);
        assert!(ToolOutput::err("1", "bad").is_error);
    }
}
