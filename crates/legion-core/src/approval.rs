// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::task::JoinHandle;
use uuid::Uuid;

use legion_tools::{Decision, SuspensionBridge, SuspensionSignal};

use crate::conversation::Conversation;
use crate::error::LegionError;

/// The in-flight half of an agent dispatch: everything the communicator
/// needs to keep racing the runtime against further suspension signals and
/// to finish the conversation when the runtime completes.
pub struct DispatchRun {
    pub join: JoinHandle<Result<String, LegionError>>,
    pub signal_rx: mpsc::Receiver<SuspensionSignal>,
    pub signal_rx_open: bool,
    pub conversation: Arc<Conversation>,
    /// The sender of the dispatch (`from`); decides the cascade path.
    pub from: String,
    /// The agent being driven (`to`).
    pub to: String,
    /// Active-conversation shortcut: skip response appends when set.
    pub skip_log: bool,
    /// Single-writer guard on the conversation, held across parking.
    pub guard: Option<OwnedMutexGuard<()>>,
    /// Bridge supplied by the calling dispatch, for upward re-emission.
    pub parent_bridge: Option<Arc<SuspensionBridge>>,
}

/// A dispatch parked mid-suspension: the unresolved signal plus the run to
/// resume once an approver decides.
pub struct ParkedDispatch {
    pub signal: SuspensionSignal,
    pub run: DispatchRun,
}

/// Process-local store of approval requests awaiting an agent approver.
///
/// While an entry is parked the inner conversation stays suspended but
/// intact; resolving the entry resumes the executor and the race.
#[derive(Default)]
pub struct PendingApprovalStore {
    inner: Mutex<HashMap<String, ParkedDispatch>>,
}

impl PendingApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a dispatch and return the fresh approval-request id.
    pub fn park(&self, signal: SuspensionSignal, run: DispatchRun) -> String {
        let id = Uuid::new_v4().to_string();
        self.inner
            .lock()
            .unwrap()
            .insert(id.clone(), ParkedDispatch { signal, run });
        id
    }

    /// Remove a parked dispatch for resolution.  `None` means the id is
    /// unknown or already resolved.
    pub fn take(&self, request_id: &str) -> Option<ParkedDispatch> {
        self.inner.lock().unwrap().remove(request_id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every parked dispatch with a rejected decision (session close
    /// or cancellation).  The runtime tasks finish in the background; their
    /// agents observe the rejections and wind down on their own.
    pub fn release_all(&self, reason: &str) -> usize {
        let drained: Vec<ParkedDispatch> = {
            let mut inner = self.inner.lock().unwrap();
            inner.drain().map(|(_, parked)| parked).collect()
        };
        let count = drained.len();
        for parked in drained {
            let decisions = parked.signal.batch.uniform(Decision::rejected(reason));
            parked.signal.resolve(decisions);
        }
        count
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use legion_tools::{PendingBatch, PendingItem, ToolCall};

    use super::*;

    async fn parked_pair() -> (Arc<SuspensionBridge>, JoinHandle<legion_tools::DecisionMap>, ParkedDispatch)
    {
        let bridge = Arc::new(SuspensionBridge::new());
        let mut rx = bridge.take_signal_receiver().unwrap();
        let requester = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .request_approval(PendingBatch {
                        requester: "worker".into(),
                        items: vec![PendingItem {
                            call: ToolCall { id: "t1".into(), name: "x".into(), input: json!({}) },
                            approver: "boss".into(),
                        }],
                    })
                    .await
            })
        };
        let signal = rx.recv().await.unwrap();
        let run = DispatchRun {
            join: tokio::spawn(async { Ok(String::new()) }),
            signal_rx: rx,
            signal_rx_open: true,
            conversation: Arc::new(crate::conversation::Conversation::new("a", "b", "default")),
            from: "a".into(),
            to: "b".into(),
            skip_log: false,
            guard: None,
            parent_bridge: None,
        };
        (bridge, requester, ParkedDispatch { signal, run })
    }

    #[tokio::test]
    async fn park_take_round_trip() {
        let store = PendingApprovalStore::new();
        let (_bridge, requester, parked) = parked_pair().await;
        let id = store.park(parked.signal, parked.run);
        assert_eq!(store.len(), 1);
        let taken = store.take(&id).unwrap();
        assert!(store.take(&id).is_none(), "second take must fail");
        let decisions = taken.signal.batch.uniform(Decision::Approved);
        taken.signal.resolve(decisions);
        let decisions = requester.await.unwrap();
        assert!(decisions["t1"].is_approved());
    }

    #[tokio::test]
    async fn release_all_rejects_everything() {
        let store = PendingApprovalStore::new();
        let (_bridge, requester, parked) = parked_pair().await;
        store.park(parked.signal, parked.run);
        assert_eq!(store.release_all("session closed"), 1);
        assert!(store.is_empty());
        let decisions = requester.await.unwrap();
        assert!(!decisions["t1"].is_approved());
    }
}
