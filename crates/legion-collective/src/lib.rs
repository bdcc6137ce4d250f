// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The collective: every addressable actor in the system and the registry
//! that owns them.
//!
//! A participant is an agent, a human, or a scripted mock — one identity
//! type with variant-specific arms.  Configs are validated at save time and
//! optionally mirrored to a per-participant JSON pool that is versioned with
//! the project.

mod error;
mod participant;
mod registry;

pub use error::CollectiveError;
pub use participant::{
    is_valid_id, mock_response, ApprovalAuthority, MockRule, ModelRef, Participant,
    ParticipantKind, ParticipantStatus, PolicyEntry, PolicyMode, ToolPolicy, WILDCARD,
};
pub use registry::{Collective, CollectiveEvent, ParticipantFilter};
