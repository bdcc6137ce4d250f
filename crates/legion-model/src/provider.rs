// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use thiserror::Error;

use crate::{ChatMessage, ChatOptions, Completion};

/// Failure modes of a provider `chat` call.
///
/// All transport, rate-limit, and response-shape problems surface through
/// this type; the runtime decides whether to abort the dispatch or to
/// materialise the failure as an error-marked tool result.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("malformed completion: {0}")]
    Malformed(String),
    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// A provider adapter normalises one LLM API to the canonical message and
/// tool format.
///
/// Adapters own all wire-format drift: they must preserve every tool-call id
/// across the round trip, repair the tool-ordering invariant defensively
/// before dispatch, and map the provider's finish reasons onto
/// [`crate::FinishReason`].
#[async_trait]
pub trait Provider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Send a conversation and return a single completion.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<Completion, ProviderError>;
}
