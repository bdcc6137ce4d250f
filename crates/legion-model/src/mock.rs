// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{ChatMessage, ChatOptions, Completion, Provider, ProviderError};

/// Deterministic mock provider for tests.  Echoes the last user message back
/// as the assistant response.
#[derive(Default)]
pub struct EchoProvider;

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> Result<Completion, ProviderError> {
        let reply = messages
            .iter()
            .rev()
            .find(|m| m.role == crate::Role::User)
            .map(|m| m.text())
            .unwrap_or_else(|| "[no input]".into());
        Ok(Completion::text_reply(format!("ECHO: {reply}")))
    }
}

/// A pre-scripted provider.  Each call to `chat` pops the next completion
/// from the front of the queue, so tests can specify exact turn sequences —
/// including tool calls — without network access.
pub struct ScriptedProvider {
    scripts: Mutex<Vec<Completion>>,
    /// The messages and options of the last `chat` call, for assertions.
    #[allow(clippy::type_complexity)]
    pub last_request: Mutex<Option<(Vec<ChatMessage>, ChatOptions)>>,
}

impl ScriptedProvider {
    /// Build a provider from an ordered list of completions, one per call.
    pub fn new(scripts: Vec<Completion>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            last_request: Mutex::new(None),
        }
    }

    /// Convenience: provider whose every call returns the same text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Completion::text_reply(reply)])
    }

    /// Convenience: one tool call, then a text reply on the next turn.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: serde_json::Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            Completion::tool_use(tool_id, tool_name, input),
            Completion::text_reply(final_text),
        ])
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<Completion, ProviderError> {
        *self.last_request.lock().unwrap() = Some((messages.to_vec(), options.clone()));
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.is_empty() {
            // Deterministic fallback once all scripts are consumed; the last
            // script in a test should normally be a final text turn.
            return Ok(Completion::text_reply("[no more scripts]"));
        }
        Ok(scripts.remove(0))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
