// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::conversation::{Conversation, ConversationRecord};

/// One working unit: a collection of conversations plus their persistence
/// scoping.  Conversations are created lazily on first send; session data is
/// transient (unlike the collective pool, it is not meant to be versioned).
pub struct Session {
    id: String,
    dir: Option<PathBuf>,
    conversations: RwLock<HashMap<String, Arc<Conversation>>>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            dir: None,
            conversations: RwLock::new(HashMap::new()),
        }
    }

    /// A session persisted under `dir`, loading any conversation files
    /// already present (resuming a previous working unit).
    pub fn with_dir(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut map = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<ConversationRecord>(&text) {
                Ok(record) => {
                    let convo = Arc::new(Conversation::from_record(record));
                    debug!(id = %convo.id(), "loaded conversation");
                    map.insert(convo.id().to_string(), convo);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable conversation file")
                }
            }
        }
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            dir: Some(dir),
            conversations: RwLock::new(map),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, conversation_id: &str) -> Option<Arc<Conversation>> {
        self.conversations.read().unwrap().get(conversation_id).cloned()
    }

    pub fn get_or_create(
        &self,
        initiator: &str,
        responder: &str,
        name: &str,
    ) -> Arc<Conversation> {
        let id = crate::conversation::conversation_id(initiator, responder, name);
        if let Some(existing) = self.get(&id) {
            return existing;
        }
        let mut map = self.conversations.write().unwrap();
        map.entry(id)
            .or_insert_with(|| Arc::new(Conversation::new(initiator, responder, name)))
            .clone()
    }

    pub fn conversations(&self) -> Vec<Arc<Conversation>> {
        let mut all: Vec<Arc<Conversation>> =
            self.conversations.read().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// Write one conversation to its file.  A no-op without a session dir.
    /// The dot-separated file name is injective for the validated id charset.
    pub fn persist(&self, conversation: &Conversation) -> std::io::Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let file = format!(
            "{}.{}.{}.json",
            conversation.initiator(),
            conversation.responder(),
            conversation.name()
        );
        let path = dir.join(&file);
        let tmp = dir.join(format!(".{file}.tmp"));
        let record = conversation.to_record();
        std::fs::write(&tmp, serde_json::to_vec_pretty(&record)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// End the working unit: verify every conversation's tool ordering
    /// (logging violations) and persist final state.
    pub fn close(&self) {
        for convo in self.conversations() {
            convo.close();
            if let Err(e) = self.persist(&convo) {
                warn!(conversation = %convo.id(), error = %e, "failed to persist on close");
            }
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
