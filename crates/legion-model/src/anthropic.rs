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

/// Adapter for the Anthropic messages API.
///
/// Wire shape: tool-uses are content blocks inside assistant messages, and
/// tool-results are content blocks inside role-`user` messages — the closest
/// wire format to the canonical one, so translation is mostly structural.
pub struct AnthropicProvider {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

const DEFAULT_MAX_TOKENS: u32 = 4096;
const API_VERSION: &str = "2023-06-01";

impl AnthropicProvider {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            client: reqwest::Client::new(),
        }
    }
}

/// Translate canonical messages into the Anthropic `messages` array.
pub fn to_wire(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let content: Vec<Value> = m
                .blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
                    ContentBlock::ToolCall { id, name, input } => json!({
                        "type": "tool_use", "id": id, "name": name, "input": input,
                    }),
                    ContentBlock::ToolResult { tool_call_id, content, is_error } => json!({
                        "type": "tool_result",
                        "tool_use_id": tool_call_id,
                        "content": content,
                        "is_error": is_error,
                    }),
                })
                .collect();
            json!({ "role": role, "content": content })
        })
        .collect()
}

/// Translate an Anthropic `messages` array back into canonical messages.
pub fn from_wire(wire: &[Value]) -> Result<Vec<ChatMessage>, ProviderError> {
    wire.iter()
        .map(|m| {
            let role = match m["role"].as_str() {
                Some("user") => Role::User,
                Some("assistant") => Role::Assistant,
                other => {
                    return Err(ProviderError::Malformed(format!(
                        "unexpected message role: {other:?}"
                    )))
                }
            };
            let blocks = m["content"]
                .as_array()
                .ok_or_else(|| ProviderError::Malformed("content is not an array".into()))?
                .iter()
                .map(parse_wire_block)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ChatMessage::new(role, blocks))
        })
        .collect()
}

fn parse_wire_block(block: &Value) -> Result<ContentBlock, ProviderError> {
    match block["type"].as_str() {
        Some("text") => Ok(ContentBlock::text(block["text"].as_str().unwrap_or(""))),
        Some("tool_use") => Ok(ContentBlock::ToolCall {
            id: block["id"].as_str().unwrap_or("").to_string(),
            name: block["name"].as_str().unwrap_or("").to_string(),
            input: block["input"].clone(),
        }),
        Some("tool_result") => Ok(ContentBlock::ToolResult {
            tool_call_id: block["tool_use_id"].as_str().unwrap_or("").to_string(),
            content: block["content"].as_str().unwrap_or("").to_string(),
            is_error: block["is_error"].as_bool().unwrap_or(false),
        }),
        other => Err(ProviderError::Malformed(format!(
            "unexpected content block type: {other:?}"
        ))),
    }
}

/// Build the full request body for one `chat` call.
pub fn build_request_body(messages: &[ChatMessage], options: &ChatOptions) -> Value {
    let repaired = repair_tool_ordering(messages);
    let mut body = json!({
        "model": options.model,
        "messages": to_wire(&repaired),
        "max_tokens": options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
    });
    if let Some(system) = &options.system_prompt {
        body["system"] = json!(system);
    }
    if let Some(t) = options.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(stop) = &options.stop {
        body["stop_sequences"] = json!(stop);
    }
    if !options.tools.is_empty() {
        body["tools"] = Value::Array(
            options
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect(),
        );
    }
    body
}

/// Parse an Anthropic response body into a [`Completion`].
pub fn parse_completion(body: &Value) -> Result<Completion, ProviderError> {
    let content = body["content"]
        .as_array()
        .ok_or_else(|| ProviderError::Malformed("response has no content array".into()))?;

    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<ToolCallRequest> = Vec::new();
    for block in content {
        match block["type"].as_str() {
            Some("text") => {
                if let Some(t) = block["text"].as_str() {
                    text_parts.push(t);
                }
            }
            Some("tool_use") => {
                let id = block["id"].as_str().unwrap_or("").to_string();
                if id.is_empty() {
                    return Err(ProviderError::Malformed("tool_use block without id".into()));
                }
                tool_calls.push(ToolCallRequest {
                    id,
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    input: block["input"].clone(),
                });
            }
            other => warn!(block_type = ?other, "ignoring unknown content block in response"),
        }
    }

    let finish_reason = match body["stop_reason"].as_str() {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("tool_use") => FinishReason::ToolUse,
        Some("max_tokens") => FinishReason::MaxTokens,
        _ => FinishReason::Unknown,
    };

    let usage = body.get("usage").map(|u| TokenUsage {
        input_tokens: u["input_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: u["output_tokens"].as_u64().unwrap_or(0) as u32,
    });

    Ok(Completion {
        text: text_parts.join(""),
        tool_calls,
        finish_reason,
        usage,
    })
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<Completion, ProviderError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Transport("ANTHROPIC_API_KEY not set".into()))?;

        let body = build_request_body(messages, options);
        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION)
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
