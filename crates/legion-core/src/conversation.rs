// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::warn;

use legion_model::{ChatMessage, ContentBlock, Role};

use crate::error::{LegionError, ParticipantError};

pub const DEFAULT_CONVERSATION: &str = "default";

/// Deterministic conversation id.  Injective because `>` and `:` are
/// outside the validated id/name charset; order-preserving by construction,
/// so the reverse direction is a different conversation.
pub fn conversation_id(initiator: &str, responder: &str, name: &str) -> String {
    format!("{initiator}>{responder}:{name}")
}

/// One persisted message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub author: String,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    pub blocks: Vec<ContentBlock>,
}

/// Serialisable snapshot of a conversation, one JSON file each.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub initiator: String,
    pub responder: String,
    pub name: String,
    pub messages: Vec<LogMessage>,
}

/// A directional, append-only message log between two participants.
///
/// Role assignment is derived, never supplied: messages authored by the
/// initiator are `user`, messages authored by the responder are
/// `assistant`, and messages whose content is only tool-results are `user`
/// regardless of author.  This removes per-perspective remapping.
pub struct Conversation {
    initiator: String,
    responder: String,
    name: String,
    id: String,
    messages: Mutex<Vec<LogMessage>>,
    /// Single-writer discipline: a dispatch holds this for its duration so
    /// no other task can interleave appends.
    writer: Arc<tokio::sync::Mutex<()>>,
}

impl Conversation {
    pub fn new(
        initiator: impl Into<String>,
        responder: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let initiator = initiator.into();
        let responder = responder.into();
        let name = name.into();
        let id = conversation_id(&initiator, &responder, &name);
        Self {
            initiator,
            responder,
            name,
            id,
            messages: Mutex::new(Vec::new()),
            writer: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn from_record(record: ConversationRecord) -> Self {
        let convo = Self::new(record.initiator, record.responder, record.name);
        *convo.messages.lock().unwrap() = record.messages;
        convo
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn initiator(&self) -> &str {
        &self.initiator
    }

    pub fn responder(&self) -> &str {
        &self.responder
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire the single-writer guard for the duration of a dispatch.
    pub async fn writer_lock(&self) -> OwnedMutexGuard<()> {
        self.writer.clone().lock_owned().await
    }

    /// Append a message under `author`, deriving its role.
    pub fn append(
        &self,
        author: &str,
        blocks: Vec<ContentBlock>,
    ) -> Result<(), LegionError> {
        let role = if !blocks.is_empty() && blocks.iter().all(ContentBlock::is_tool_result) {
            Role::User
        } else if author == self.initiator {
            Role::User
        } else if author == self.responder {
            Role::Assistant
        } else {
            return Err(LegionError::Participant(ParticipantError::Unknown(format!(
                "{author} is not a party to conversation {}",
                self.id
            ))));
        };
        self.messages.lock().unwrap().push(LogMessage {
            author: author.to_string(),
            role,
            timestamp: Utc::now(),
            blocks,
        });
        Ok(())
    }

    /// Ordered snapshot of the log.
    pub fn messages(&self) -> Vec<LogMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The provider-facing view of the log.
    pub fn chat_history(&self) -> Vec<ChatMessage> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| ChatMessage::new(m.role, m.blocks.clone()))
            .collect()
    }

    pub fn to_record(&self) -> ConversationRecord {
        ConversationRecord {
            initiator: self.initiator.clone(),
            responder: self.responder.clone(),
            name: self.name.clone(),
            messages: self.messages(),
        }
    }

    /// Verify the tool-ordering invariant: every assistant message with k
    /// tool-calls is immediately followed by one user message carrying
    /// exactly those k results, by id, in order.
    pub fn check_tool_ordering(&self) -> Result<(), String> {
        let messages = self.messages.lock().unwrap();
        for (i, msg) in messages.iter().enumerate() {
            if msg.role != Role::Assistant {
                continue;
            }
            let call_ids: Vec<&str> = msg
                .blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolCall { id, .. } => Some(id.as_str()),
                    _ => None,
                })
                .collect();
            if call_ids.is_empty() {
                continue;
            }
            let Some(next) = messages.get(i + 1) else {
                return Err(format!(
                    "assistant message {i} has tool calls but no following results"
                ));
            };
            let result_ids: Vec<&str> = next
                .blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
                    _ => None,
                })
                .collect();
            if next.role != Role::User || result_ids != call_ids {
                return Err(format!(
                    "message {} does not carry results {call_ids:?} (found {result_ids:?})",
                    i + 1
                ));
            }
        }
        Ok(())
    }

    /// Close-time assertion: the log never rejects appends itself, but a
    /// violated ordering at close means the runtime misbehaved.
    pub fn close(&self) {
        if let Err(violation) = self.check_tool_ordering() {
            warn!(conversation = %self.id, %violation, "tool ordering violated at close");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
