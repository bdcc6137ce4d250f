// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollectiveError {
    #[error("unknown participant: {0}")]
    Unknown(String),
    #[error("participant is retired: {0}")]
    Retired(String),
    #[error("participant is protected and cannot be retired: {0}")]
    Protected(String),
    #[error("invalid participant config '{id}': {reason}")]
    Invalid { id: String, reason: String },
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
