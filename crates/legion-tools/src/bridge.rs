// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::tool::ToolCall;

/// Approver's verdict for one pending tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum Decision {
    Approved,
    Rejected { reason: Option<String> },
}

impl Decision {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected { reason: Some(reason.into()) }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

/// tool-call id → decision, one entry per pending call.
pub type DecisionMap = HashMap<String, Decision>;

/// One call awaiting approval, with the approver computed for it.
#[derive(Debug, Clone)]
pub struct PendingItem {
    pub call: ToolCall,
    pub approver: String,
}

/// Everything pending from a single LLM turn, submitted as one rendezvous.
#[derive(Debug, Clone)]
pub struct PendingBatch {
    /// The agent whose tool calls need approval
    pub requester: String,
    pub items: Vec<PendingItem>,
}

impl PendingBatch {
    /// A uniform decision applied to every item in the batch.
    pub fn uniform(&self, decision: Decision) -> DecisionMap {
        self.items
            .iter()
            .map(|i| (i.call.id.clone(), decision.clone()))
            .collect()
    }
}

/// A published suspension: the batch plus the resolver that resumes the
/// parked executor.  Dropping the signal without resolving rejects the
/// batch (the executor observes a closed channel).
#[derive(Debug)]
pub struct SuspensionSignal {
    pub batch: PendingBatch,
    resolver: oneshot::Sender<DecisionMap>,
}

impl SuspensionSignal {
    /// Fulfil the executor's future with the approver's decisions.
    pub fn resolve(self, decisions: DecisionMap) {
        // A dropped receiver means the dispatch was cancelled underneath us;
        // nothing useful remains to do with the decisions.
        let _ = self.resolver.send(decisions);
    }
}

/// Single-producer/single-consumer rendezvous between the tool executor and
/// whoever is racing the dispatch (normally the communicator).
///
/// One bridge exists per agent dispatch.  The executor publishes at most one
/// batch at a time and parks until the observer resolves it; the same bridge
/// may carry several suspensions over the lifetime of one tool-use loop.
pub struct SuspensionBridge {
    signal_tx: mpsc::Sender<SuspensionSignal>,
    signal_rx: Mutex<Option<mpsc::Receiver<SuspensionSignal>>>,
    observed: AtomicBool,
}

impl SuspensionBridge {
    pub fn new() -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(1);
        Self {
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            observed: AtomicBool::new(false),
        }
    }

    /// Claim the observer side.  Returns `None` if already claimed.
    pub fn take_signal_receiver(&self) -> Option<mpsc::Receiver<SuspensionSignal>> {
        let rx = self.signal_rx.lock().unwrap().take();
        if rx.is_some() {
            self.observed.store(true, Ordering::Release);
        }
        rx
    }

    /// Publish `batch` and park until the observer resolves it.
    ///
    /// With no observer attached (a wiring bug, or a tool executed outside a
    /// dispatch) this degrades to an immediate rejected-all map rather than
    /// parking forever.
    pub async fn request_approval(&self, batch: PendingBatch) -> DecisionMap {
        if !self.observed.load(Ordering::Acquire) {
            warn!(requester = %batch.requester, "approval requested with no observer attached");
            return batch.uniform(Decision::rejected("no approver available"));
        }
        let (resolver, decided) = oneshot::channel();
        let signal = SuspensionSignal { batch: batch.clone(), resolver };
        if self.signal_tx.send(signal).await.is_err() {
            return batch.uniform(Decision::rejected("approval channel closed"));
        }
        match decided.await {
            Ok(decisions) => decisions,
            Err(_) => batch.uniform(Decision::rejected("approval channel closed")),
        }
    }
}

impl Default for SuspensionBridge {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn batch(ids: &[&str]) -> PendingBatch {
        PendingBatch {
            requester: "worker".into(),
            items: ids
                .iter()
                .map(|id| PendingItem {
                    call: ToolCall { id: id.to_string(), name: "t".into(), input: json!({}) },
                    approver: "user".into(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn no_observer_rejects_immediately() {
        let bridge = SuspensionBridge::new();
        let decisions = bridge.request_approval(batch(&["t1", "t2"])).await;
        assert_eq!(decisions.len(), 2);
        assert!(decisions.values().all(|d| !d.is_approved()));
    }

    #[tokio::test]
    async fn observer_receives_batch_and_resolves() {
        let bridge = std::sync::Arc::new(SuspensionBridge::new());
        let mut rx = bridge.take_signal_receiver().unwrap();

        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.request_approval(batch(&["t1"])).await })
        };

        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.batch.requester, "worker");
        let decisions = signal.batch.uniform(Decision::Approved);
        signal.resolve(decisions);

        let decisions = waiter.await.unwrap();
        assert!(decisions["t1"].is_approved());
    }

    #[tokio::test]
    async fn dropped_signal_rejects_batch() {
        let bridge = std::sync::Arc::new(SuspensionBridge::new());
        let mut rx = bridge.take_signal_receiver().unwrap();

        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.request_approval(batch(&["t1"])).await })
        };

        let signal = rx.recv().await.unwrap();
        drop(signal); // observer dies without resolving

        let decisions = waiter.await.unwrap();
        assert!(!decisions["t1"].is_approved());
    }

    #[tokio::test]
    async fn receiver_can_only_be_taken_once() {
        let bridge = SuspensionBridge::new();
        assert!(bridge.take_signal_receiver().is_some());
        assert!(bridge.take_signal_receiver().is_none());
    }

    #[test]
    fn uniform_covers_every_item() {
        let b = batch(&["a", "b", "c"]);
        let d = b.uniform(Decision::Approved);
        assert_eq!(d.len(), 3);
        assert!(d.values().all(Decision::is_approved));
    }
}
