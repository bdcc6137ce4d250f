// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::WorkspaceConfig;

/// File names probed inside a workspace root, in priority order.
fn candidate_paths(root: &Path) -> Vec<PathBuf> {
    vec![
        root.join(".legion/config.yaml"),
        root.join(".legion/config.yml"),
        root.join("legion.yaml"),
        root.join("legion.yml"),
    ]
}

/// Load the workspace configuration.
///
/// `explicit` takes priority; otherwise the first existing candidate under
/// `root` is used.  A missing configuration is not an error — the defaults
/// apply.
pub fn load(root: &Path, explicit: Option<&Path>) -> anyhow::Result<WorkspaceConfig> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => candidate_paths(root).into_iter().find(|p| p.is_file()),
    };

    let Some(path) = path else {
        debug!(root = %root.display(), "no config file found; using defaults");
        return Ok(WorkspaceConfig::default());
    };

    debug!(path = %path.display(), "loading config");
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
