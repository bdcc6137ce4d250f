// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Defensive history repair applied by provider adapters before dispatch.
//!
//! The agent runtime is the normative enforcer of the tool-ordering
//! invariant (every assistant tool-call is immediately followed by one
//! user message carrying all its results).  Adapters still repair the
//! history defensively: provider APIs reject requests whose tool results
//! are missing, orphaned, or out of place, and a single misplaced block
//! would otherwise fail the whole dispatch.

use std::collections::HashMap;

use tracing::warn;

use crate::{ChatMessage, ContentBlock, Role};

/// Rebuild `messages` so that each assistant message with tool-calls is
/// immediately followed by exactly one user message containing the matching
/// tool-results, in call order.
///
/// - Results found elsewhere in the history are moved into place.
/// - Missing results are synthesised as error results.
/// - Orphaned results (no matching call) are dropped.
/// - All other blocks keep their relative order.
pub fn repair_tool_ordering(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    // Index every tool-result in the history by call id.
    let mut results: HashMap<String, ContentBlock> = HashMap::new();
    let mut known_calls: Vec<String> = Vec::new();
    for msg in messages {
        for block in &msg.blocks {
            match block {
                ContentBlock::ToolResult { tool_call_id, .. } => {
                    results.insert(tool_call_id.clone(), block.clone());
                }
                ContentBlock::ToolCall { id, .. } => known_calls.push(id.clone()),
                _ => {}
            }
        }
    }

    let mut repaired: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        // Strip tool-result blocks from their original position; they are
        // re-inserted right after the assistant message that requested them.
        let kept: Vec<ContentBlock> = msg
            .blocks
            .iter()
            .filter(|b| match b {
                ContentBlock::ToolResult { tool_call_id, .. } => {
                    let orphan = !known_calls.contains(tool_call_id);
                    if orphan {
                        warn!(tool_call_id = %tool_call_id, "dropping orphaned tool result");
                    }
                    false
                }
                _ => true,
            })
            .cloned()
            .collect();

        if !kept.is_empty() {
            repaired.push(ChatMessage::new(msg.role, kept));
        }

        if msg.role == Role::Assistant {
            let ids: Vec<String> =
                msg.tool_call_ids().into_iter().map(str::to_string).collect();
            if ids.is_empty() {
                continue;
            }
            let blocks: Vec<ContentBlock> = ids
                .iter()
                .map(|id| {
                    results.remove(id).unwrap_or_else(|| {
                        warn!(tool_call_id = %id, "synthesising missing tool result");
                        ContentBlock::tool_result(id, "tool result was lost", true)
                    })
                })
                .collect();
            repaired.push(ChatMessage::new(Role::User, blocks));
        }
    }

    repaired
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
