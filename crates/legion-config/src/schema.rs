// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Hard stop on LLM turns within one agent dispatch.
pub const DEFAULT_MAX_ITERATIONS: u32 = 50;
/// Hard stop on communication-chain nesting depth.
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Partial limit overrides.  Every layer (agent, workspace, global) provides
/// one of these; unset fields fall through to the next layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum LLM turns per dispatch
    pub max_iterations: Option<u32>,
    /// Maximum communication-chain depth
    pub max_depth: Option<usize>,
}

/// Fully resolved runtime limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_iterations: u32,
    pub max_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl Limits {
    /// Resolve limits from override layers, highest priority first
    /// (agent → workspace → global).  Unset fields use the built-in defaults.
    pub fn resolve(layers: &[&LimitsConfig]) -> Self {
        Self {
            max_iterations: layers
                .iter()
                .find_map(|l| l.max_iterations)
                .unwrap_or(DEFAULT_MAX_ITERATIONS),
            max_depth: layers
                .iter()
                .find_map(|l| l.max_depth)
                .unwrap_or(DEFAULT_MAX_DEPTH),
        }
    }

    /// Apply a single higher-priority override layer on top of `self`.
    pub fn with_overrides(self, overrides: &LimitsConfig) -> Self {
        Self {
            max_iterations: overrides.max_iterations.unwrap_or(self.max_iterations),
            max_depth: overrides.max_depth.unwrap_or(self.max_depth),
        }
    }
}

/// Workspace configuration file (`legion.yaml`).
///
/// Layered config search and merging belongs to the embedding application;
/// the core only consumes a single resolved file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Directory holding one JSON file per participant.  Intended to be
    /// versioned with the project.
    #[serde(default)]
    pub collective_dir: Option<PathBuf>,
    /// Directory holding transient session data, one file per conversation.
    #[serde(default)]
    pub sessions_dir: Option<PathBuf>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
