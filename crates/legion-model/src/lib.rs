// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Canonical message model and provider adapters.
//!
//! Every conversation in the system is a list of [`ChatMessage`]s whose
//! content is an ordered list of [`ContentBlock`]s: text, tool-call, or
//! tool-result.  Provider adapters translate this canonical format to and
//! from their wire formats; the adapters — not their callers — own schema
//! drift and defensive repair of the tool-ordering invariant.

pub mod anthropic;
pub mod mock;
pub mod openai;
pub mod provider;
pub mod repair;
mod types;

pub use anthropic::AnthropicProvider;
pub use mock::{EchoProvider, ScriptedProvider};
pub use openai::OpenAiProvider;
pub use provider::{Provider, ProviderError};
pub use repair::repair_tool_ordering;
pub use types::{
    ChatMessage, ChatOptions, Completion, ContentBlock, FinishReason, Role, TokenUsage,
    ToolCallRequest, ToolSchema,
};
