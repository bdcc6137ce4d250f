// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::LegionError;
use crate::events::Event;

/// How a human participant is reached.
///
/// The core does not mandate any wire protocol for human participation;
/// a medium is a single blocking prompt plus an optional display callback
/// for background events.
#[async_trait]
pub trait Medium: Send + Sync {
    /// Deliver `text` to the human and await their reply.
    async fn prompt(&self, text: &str) -> Result<String, LegionError>;

    /// Display a background event.  Default: ignore.
    fn notify(&self, _event: &Event) {}
}

/// A prompt in flight to an embedding UI.
pub struct MediumRequest {
    pub text: String,
    pub reply: oneshot::Sender<String>,
}

/// Medium backed by a channel pair: the embedding application receives
/// [`MediumRequest`]s and answers through the enclosed sender.
pub struct ChannelMedium {
    requests: mpsc::Sender<MediumRequest>,
}

impl ChannelMedium {
    pub fn new(requests: mpsc::Sender<MediumRequest>) -> Self {
        Self { requests }
    }
}

#[async_trait]
impl Medium for ChannelMedium {
    async fn prompt(&self, text: &str) -> Result<String, LegionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = MediumRequest { text: text.to_string(), reply: reply_tx };
        self.requests
            .send(request)
            .await
            .map_err(|_| LegionError::Suspension("medium channel closed".into()))?;
        reply_rx
            .await
            .map_err(|_| LegionError::Suspension("prompt was abandoned".into()))
    }
}

/// Deterministic medium for tests: pops pre-scripted replies in order and
/// records every prompt it was shown.
#[derive(Default)]
pub struct ScriptedMedium {
    replies: Mutex<VecDeque<String>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedMedium {
    pub fn new(replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl Medium for ScriptedMedium {
    async fn prompt(&self, text: &str) -> Result<String, LegionError> {
        self.prompts.lock().unwrap().push(text.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LegionError::Suspension("scripted medium has no more replies".into()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
