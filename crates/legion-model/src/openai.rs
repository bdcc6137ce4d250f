// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::{
    repair::repair_tool_ordering, ChatMessage, ChatOptions, Completion, ContentBlock,
    FinishReason, Provider, ProviderError, Role, TokenUsage, ToolCallRequest,
};

/// Adapter for the OpenAI chat-completions wire format.
///
/// Unlike the Anthropic shape, this format uses a dedicated `tool` role with
/// one message per tool result, and carries tool-call arguments as
/// JSON-encoded strings inside an assistant-level `tool_calls` array.
/// The `is_error` flag has no wire slot here; the error text itself is the
/// payload the model sees.
pub struct OpenAiProvider {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".into()),
            client: reqwest::Client::new(),
        }
    }
}

/// Translate canonical messages into chat-completions messages.
///
/// One canonical message may expand into several wire messages: an assistant
/// message with tool-calls becomes one wire message, but a user message of k
/// tool-results becomes k `tool`-role messages.
pub fn to_wire(messages: &[ChatMessage]) -> Vec<Value> {
    let mut wire = Vec::with_capacity(messages.len());
    for m in messages {
        match m.role {
            Role::Assistant => {
                let text = m.text();
                let tool_calls: Vec<Value> = m
                    .blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolCall { id, name, input } => Some(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            },
                        })),
                        _ => None,
                    })
                    .collect();
                let mut msg = json!({ "role": "assistant" });
                msg["content"] = if text.is_empty() { Value::Null } else { json!(text) };
                if !tool_calls.is_empty() {
                    msg["tool_calls"] = Value::Array(tool_calls);
                }
                wire.push(msg);
            }
            Role::User => {
                // Tool results each become a dedicated `tool` message; any
                // plain text becomes a normal user message.
                let text = m.text();
                if !text.is_empty() {
                    wire.push(json!({ "role": "user", "content": text }));
                }
                for b in &m.blocks {
                    if let ContentBlock::ToolResult { tool_call_id, content, .. } = b {
                        wire.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_call_id,
                            "content": content,
                        }));
                    }
                }
            }
        }
    }
    wire
}

/// Translate chat-completions messages back into canonical form.
///
/// Consecutive `tool`-role messages collapse into one user message of
/// tool-result blocks, which is exactly the deterministic reordering the
/// canonical format prescribes.
pub fn from_wire(wire: &[Value]) -> Result<Vec<ChatMessage>, ProviderError> {
    let mut messages: Vec<ChatMessage> = Vec::new();
    let mut pending_results: Vec<ContentBlock> = Vec::new();

    let flush =
        |pending: &mut Vec<ContentBlock>, out: &mut Vec<ChatMessage>| {
            if !pending.is_empty() {
                out.push(ChatMessage::new(Role::User, std::mem::take(pending)));
            }
        };

    for m in wire {
        match m["role"].as_str() {
            Some("tool") => {
                pending_results.push(ContentBlock::tool_result(
                    m["tool_call_id"].as_str().unwrap_or(""),
                    m["content"].as_str().unwrap_or(""),
                    false,
                ));
            }
            Some("user") => {
                flush(&mut pending_results, &mut messages);
                messages.push(ChatMessage::user(m["content"].as_str().unwrap_or("")));
            }
            Some("assistant") => {
                flush(&mut pending_results, &mut messages);
                let mut blocks: Vec<ContentBlock> = Vec::new();
                if let Some(text) = m["content"].as_str() {
                    if !text.is_empty() {
                        blocks.push(ContentBlock::text(text));
                    }
                }
                if let Some(calls) = m["tool_calls"].as_array() {
                    for c in calls {
                        blocks.push(ContentBlock::ToolCall {
                            id: c["id"].as_str().unwrap_or("").to_string(),
                            name: c["function"]["name"].as_str().unwrap_or("").to_string(),
                            input: parse_arguments(c["function"]["arguments"].as_str()),
                        });
                    }
                }
                messages.push(ChatMessage::new(Role::Assistant, blocks));
            }
            Some("system") => {
                // System prompts travel in ChatOptions, not in the history.
                flush(&mut pending_results, &mut messages);
            }
            other => {
                return Err(ProviderError::Malformed(format!(
                    "unexpected message role: {other:?}"
                )))
            }
        }
    }
    flush(&mut pending_results, &mut messages);
    Ok(messages)
}

/// Parse a JSON-encoded argument string, substituting `{}` on failure.
fn parse_arguments(raw: Option<&str>) -> Value {
    match raw {
        None | Some("") => Value::Object(Default::default()),
        Some(s) => serde_json::from_str(s).unwrap_or_else(|e| {
            warn!(error = %e, "tool call had invalid JSON arguments; substituting {{}}");
            Value::Object(Default::default())
        }),
    }
}

/// Build the full request body for one `chat` call.
pub fn build_request_body(messages: &[ChatMessage], options: &ChatOptions) -> Value {
    let repaired = repair_tool_ordering(messages);
    let mut wire = Vec::new();
    if let Some(system) = &options.system_prompt {
        wire.push(json!({ "role": "system", "content": system }));
    }
    wire.extend(to_wire(&repaired));

    let mut body = json!({
        "model": options.model,
        "messages": wire,
    });
    if let Some(t) = options.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(mt) = options.max_tokens {
        body["max_tokens"] = json!(mt);
    }
    if let Some(stop) = &options.stop {
        body["stop"] = json!(stop);
    }
    if !options.tools.is_empty() {
        body["tools"] = Value::Array(
            options
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        },
                    })
                })
                .collect(),
        );
    }
    body
}

/// Parse a chat-completions response body into a [`Completion`].
pub fn parse_completion(body: &Value) -> Result<Completion, ProviderError> {
    let choice = body["choices"]
        .get(0)
        .ok_or_else(|| ProviderError::Malformed("response has no choices".into()))?;
    let message = &choice["message"];

    let text = message["content"].as_str().unwrap_or("").to_string();
    let mut tool_calls = Vec::new();
    if let Some(calls) = message["tool_calls"].as_array() {
        for c in calls {
            let id = c["id"].as_str().unwrap_or("").to_string();
            if id.is_empty() {
                return Err(ProviderError::Malformed("tool call without id".into()));
            }
            tool_calls.push(ToolCallRequest {
                id,
                name: c["function"]["name"].as_str().unwrap_or("").to_string(),
                input: parse_arguments(c["function"]["arguments"].as_str()),
            });
        }
    }

    let finish_reason = match choice["finish_reason"].as_str() {
        Some("stop") => FinishReason::Stop,
        Some("tool_calls") => FinishReason::ToolUse,
        Some("length") => FinishReason::MaxTokens,
        _ => FinishReason::Unknown,
    };

    let usage = body.get("usage").map(|u| TokenUsage {
        input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
    });

    Ok(Completion { text, tool_calls, finish_reason, usage })
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<Completion, ProviderError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Transport("OPENAI_API_KEY not set".into()))?;

        let body = build_request_body(messages, options);
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after_secs = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(ProviderError::RateLimited { retry_after_secs });
        }
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            });
        }
        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Malformed(format!("invalid response JSON: {e}")))?;
        parse_completion(&parsed)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
