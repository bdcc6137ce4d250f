// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

// ─── Content blocks ───────────────────────────────────────────────────────────

/// A single content block inside a message.
///
/// Every message is an ordered list of these.  Provider adapters translate
/// them into their API-specific wire formats; tool-call ids must survive the
/// round trip verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolCall {
        /// Opaque identifier assigned by the model (forwarded verbatim)
        id: String,
        name: String,
        /// Parsed JSON argument object
        input: serde_json::Value,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
        is_error: bool,
    },
}

impl ContentBlock {
    /// Convenience constructor for a plain text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::ToolCall { id: id.into(), name: name.into(), input }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error,
        }
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, Self::ToolResult { .. })
    }

    pub fn is_tool_call(&self) -> bool {
        matches!(self, Self::ToolCall { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

// ─── Messages ─────────────────────────────────────────────────────────────────

/// A single message in a conversation history, as seen by providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub blocks: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, blocks: vec![ContentBlock::text(text)] }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, blocks: vec![ContentBlock::text(text)] }
    }

    pub fn new(role: Role, blocks: Vec<ContentBlock>) -> Self {
        Self { role, blocks }
    }

    /// Concatenation of all text blocks.  Empty string when there are none.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Ids of all tool-call blocks, in block order.
    pub fn tool_call_ids(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolCall { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// True when the message consists of tool-result blocks only.
    pub fn is_tool_results_only(&self) -> bool {
        !self.blocks.is_empty() && self.blocks.iter().all(ContentBlock::is_tool_result)
    }

    pub fn has_tool_calls(&self) -> bool {
        self.blocks.iter().any(ContentBlock::is_tool_call)
    }
}

// ─── Provider request/response types ──────────────────────────────────────────

/// A tool schema provided to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object
    pub input_schema: serde_json::Value,
}

/// Options for a single `chat` call.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub model: String,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolSchema>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop: Option<Vec<String>>,
}

/// A tool invocation requested by the model in one completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolUse,
    MaxTokens,
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// The result of one provider `chat` call.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Text content produced by the model (may be empty on pure tool turns).
    pub text: String,
    /// Requested tool calls, in the order the model emitted them.
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: FinishReason,
    pub usage: Option<TokenUsage>,
}

impl Completion {
    /// A plain text completion that ended normally.
    pub fn text_reply(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
            usage: None,
        }
    }

    /// A completion requesting a single tool call.
    pub fn tool_use(
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            text: String::new(),
            tool_calls: vec![ToolCallRequest { id: id.into(), name: name.into(), input }],
            finish_reason: FinishReason::ToolUse,
            usage: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
