// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

use legion_collective::CollectiveError;
use legion_model::ProviderError;

#[derive(Debug, Error)]
pub enum ParticipantError {
    #[error("unknown participant: {0}")]
    Unknown(String),
    #[error("participant is retired: {0}")]
    Retired(String),
    #[error("cannot send a message to yourself: {0}")]
    SelfSend(String),
    #[error("no medium registered for '{0}'")]
    NoMedium(String),
}

/// The error taxonomy of the runtime core.
///
/// Propagation policy: tool failures, policy denials, and approval
/// rejections are recovered locally — the executor materialises them as
/// tool results so the agent can adapt.  Provider errors abort the dispatch
/// and surface as its (wrapped) response text.  Everything else aborts the
/// dispatch outright.  All aborts still satisfy the tool-ordering
/// invariant: error results are synthesized for outstanding tool calls.
#[derive(Debug, Error)]
pub enum LegionError {
    #[error(transparent)]
    Participant(#[from] ParticipantError),
    #[error("circular communication: chain depth {depth} reached the limit of {max}")]
    DepthExceeded { depth: usize, max: usize },
    #[error("agent did not finish within {0} iterations")]
    IterationExceeded(u32),
    #[error("tool error: {0}")]
    Tool(String),
    #[error("authorization error: {0}")]
    Auth(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("suspension error: {0}")]
    Suspension(String),
    #[error("dispatch was cancelled")]
    Cancelled,
}

impl From<CollectiveError> for LegionError {
    fn from(e: CollectiveError) -> Self {
        match e {
            CollectiveError::Unknown(id) => Self::Participant(ParticipantError::Unknown(id)),
            CollectiveError::Retired(id) => Self::Participant(ParticipantError::Retired(id)),
            other => Self::Suspension(other.to_string()),
        }
    }
}
