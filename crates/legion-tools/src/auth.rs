// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;
use serde_json::Value;

use legion_collective::{
    ApprovalAuthority, Collective, Participant, PolicyMode, ToolPolicy, WILDCARD,
};

use crate::tool::Chain;

/// Outcome of evaluating a tool call against a participant's policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Allowed,
    Denied { reason: String },
    PendingApproval { approver: String },
}

/// Convert a simple glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

/// True when `name` matches `pattern` (exact string, prefix-with-trailing
/// star, or the full wildcard).
pub fn glob_match(pattern: &str, name: &str) -> bool {
    if pattern == WILDCARD {
        return true;
    }
    if !pattern.contains(['*', '?']) {
        return pattern == name;
    }
    glob_to_regex(pattern).is_some_and(|re| re.is_match(name))
}

/// Find the policy governing `tool`: exact match first, then glob patterns
/// in insertion order.  `None` means no pattern matched.
fn find_policy<'a>(participant: &'a Participant, tool: &str) -> Option<&'a ToolPolicy> {
    if let Some(entry) = participant.policies.iter().find(|e| e.pattern == tool) {
        return Some(&entry.policy);
    }
    participant
        .policies
        .iter()
        .find(|e| glob_match(&e.pattern, tool))
        .map(|e| &e.policy)
}

/// Evaluate whether `participant` may run `tool` right now.
///
/// Unmatched tools default to `Allowed`.  On `requires_approval`, the
/// approver is the policy's explicit approver if set, else the immediate
/// sender (top of the chain), else the first user participant, else the
/// call is denied outright.
pub fn evaluate(
    participant: &Participant,
    tool: &str,
    _input: &Value,
    chain: &Chain,
    collective: &Collective,
) -> Authorization {
    let Some(policy) = find_policy(participant, tool) else {
        return Authorization::Allowed;
    };
    match policy.mode {
        PolicyMode::Auto => Authorization::Allowed,
        PolicyMode::RequiresApproval => {
            let approver = policy
                .approver
                .clone()
                .or_else(|| chain.top().map(str::to_string))
                .or_else(|| collective.first_user().map(|u| u.id));
            match approver {
                Some(approver) => Authorization::PendingApproval { approver },
                None => Authorization::Denied { reason: "no approver".into() },
            }
        }
    }
}

/// Whether `approver` may approve requests made by `requester_id`, applying
/// the same glob semantics over the approver's authority patterns.
pub fn can_approve(approver: &Participant, requester_id: &str) -> bool {
    match &approver.approval_authority {
        ApprovalAuthority::Any => true,
        ApprovalAuthority::Patterns(patterns) => {
            patterns.iter().any(|p| glob_match(p, requester_id))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
