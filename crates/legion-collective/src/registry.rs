// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::CollectiveError;
use crate::participant::{Participant, ParticipantStatus};

const EVENT_CAPACITY: usize = 256;

/// Change notifications emitted by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectiveEvent {
    Saved(String),
    Retired(String),
    Unretired(String),
}

/// Filter for [`Collective::list`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ParticipantFilter {
    /// When false (default), retired participants are skipped.
    pub include_retired: bool,
    pub agents_only: bool,
    pub users_only: bool,
}

/// Registry of all participants, read-mostly with serialized writes.
///
/// When a pool directory is configured, every participant is mirrored to
/// `{dir}/{id}.json`; the pool is intended to be versioned with the project.
pub struct Collective {
    inner: RwLock<HashMap<String, Participant>>,
    /// Built-in ids that cannot be retired.
    protected: RwLock<HashSet<String>>,
    pool_dir: Option<PathBuf>,
    events: broadcast::Sender<CollectiveEvent>,
}

impl Collective {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: RwLock::new(HashMap::new()),
            protected: RwLock::new(HashSet::new()),
            pool_dir: None,
            events,
        }
    }

    /// Create a collective backed by an on-disk pool, loading any
    /// participant files already present.
    pub fn with_pool(dir: impl Into<PathBuf>) -> Result<Self, CollectiveError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut map = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<Participant>(&text) {
                Ok(p) => {
                    debug!(id = %p.id, "loaded participant");
                    map.insert(p.id.clone(), p);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable participant file"),
            }
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: RwLock::new(map),
            protected: RwLock::new(HashSet::new()),
            pool_dir: Some(dir),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollectiveEvent> {
        self.events.subscribe()
    }

    /// Mark an id as protected from retirement (built-ins).
    pub fn protect(&self, id: impl Into<String>) {
        self.protected.write().unwrap().insert(id.into());
    }

    pub fn get(&self, id: &str) -> Option<Participant> {
        self.inner.read().unwrap().get(id).cloned()
    }

    /// Like [`get`] but rejects unknown and retired participants.
    pub fn get_active(&self, id: &str) -> Result<Participant, CollectiveError> {
        let p = self
            .get(id)
            .ok_or_else(|| CollectiveError::Unknown(id.to_string()))?;
        if !p.is_active() {
            return Err(CollectiveError::Retired(id.to_string()));
        }
        Ok(p)
    }

    pub fn list(&self, filter: &ParticipantFilter) -> Vec<Participant> {
        let mut out: Vec<Participant> = self
            .inner
            .read()
            .unwrap()
            .values()
            .filter(|p| filter.include_retired || p.is_active())
            .filter(|p| !filter.agents_only || p.is_agent())
            .filter(|p| !filter.users_only || p.is_user())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// First active user participant, by id order.  Used as the approver of
    /// last resort.
    pub fn first_user(&self) -> Option<Participant> {
        self.list(&ParticipantFilter { users_only: true, ..Default::default() })
            .into_iter()
            .next()
    }

    /// Validate and store a participant config, overwriting any previous
    /// config under the same id.
    pub fn save(&self, participant: Participant) -> Result<(), CollectiveError> {
        participant.validate()?;
        let id = participant.id.clone();
        {
            let mut map = self.inner.write().unwrap();
            self.persist(&participant)?;
            map.insert(id.clone(), participant);
        }
        let _ = self.events.send(CollectiveEvent::Saved(id));
        Ok(())
    }

    /// Retire a participant.  Retirement is reversible metadata; the full
    /// config is preserved.
    pub fn retire(&self, id: &str) -> Result<(), CollectiveError> {
        if self.protected.read().unwrap().contains(id) {
            return Err(CollectiveError::Protected(id.to_string()));
        }
        {
            let mut map = self.inner.write().unwrap();
            let p = map
                .get_mut(id)
                .ok_or_else(|| CollectiveError::Unknown(id.to_string()))?;
            p.status = ParticipantStatus::Retired;
            p.retired_at = Some(Utc::now());
            let snapshot = p.clone();
            self.persist(&snapshot)?;
        }
        let _ = self.events.send(CollectiveEvent::Retired(id.to_string()));
        Ok(())
    }

    pub fn unretire(&self, id: &str) -> Result<(), CollectiveError> {
        {
            let mut map = self.inner.write().unwrap();
            let p = map
                .get_mut(id)
                .ok_or_else(|| CollectiveError::Unknown(id.to_string()))?;
            p.status = ParticipantStatus::Active;
            p.retired_at = None;
            let snapshot = p.clone();
            self.persist(&snapshot)?;
        }
        let _ = self.events.send(CollectiveEvent::Unretired(id.to_string()));
        Ok(())
    }

    /// Write one participant file.  Write-then-rename so a crash never
    /// leaves a torn file; callers hold the registry write lock, which
    /// serializes writes per file.
    fn persist(&self, participant: &Participant) -> Result<(), CollectiveError> {
        let Some(dir) = &self.pool_dir else {
            return Ok(());
        };
        let path = dir.join(format!("{}.json", participant.id));
        let tmp = dir.join(format!(".{}.json.tmp", participant.id));
        std::fs::write(&tmp, serde_json::to_vec_pretty(participant)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn pool_dir(&self) -> Option<&Path> {
        self.pool_dir.as_deref()
    }
}

impl Default for Collective {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
