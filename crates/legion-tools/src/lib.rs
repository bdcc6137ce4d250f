// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool contract, authorization engine, suspension bridge, and the
//! three-phase batch executor.

pub mod auth;
pub mod bridge;
pub mod executor;
pub mod registry;
pub mod tool;

pub use auth::{can_approve, evaluate, glob_match, Authorization};
pub use bridge::{
    Decision, DecisionMap, PendingBatch, PendingItem, SuspensionBridge, SuspensionSignal,
};
pub use executor::{execute_batch, BatchOutcome};
pub use registry::{RegistryError, ToolDefinition, ToolRegistry};
pub use tool::{Chain, DispatchAbort, Tool, ToolCall, ToolContext, ToolError, ToolOutput};
