// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

/// Typed events fanned out to subscribers (UIs, loggers, external bridges).
/// Delivery is best-effort and synchronous with respect to the publisher;
/// a slow subscriber lags, it never blocks the runtime.
#[derive(Debug, Clone)]
pub enum Event {
    MessageSent {
        conversation: String,
        author: String,
        text: String,
    },
    ToolCall {
        conversation: String,
        caller: String,
        call_id: String,
        tool: String,
    },
    ToolResult {
        conversation: String,
        call_id: String,
        is_error: bool,
    },
    ApprovalRequested {
        /// Set when the request was parked for an agent approver.
        request_id: Option<String>,
        requester: String,
        tools: Vec<String>,
    },
    ApprovalResolved {
        request_id: Option<String>,
        approved: bool,
    },
    Iteration {
        conversation: String,
        agent: String,
        round: u32,
    },
    ParticipantSaved {
        id: String,
    },
    ParticipantRetired {
        id: String,
    },
    Error {
        context: String,
        message: String,
    },
}

/// Fan-out publisher backed by a broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event.  Having zero subscribers is fine.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
