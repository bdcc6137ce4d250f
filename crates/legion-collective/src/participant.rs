// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use legion_config::LimitsConfig;

use crate::error::CollectiveError;

/// The wildcard tool grant / pattern.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    #[default]
    Active,
    Retired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    #[default]
    Auto,
    RequiresApproval,
}

/// Per-tool policy attached to a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ToolPolicy {
    #[serde(default)]
    pub mode: PolicyMode,
    /// Explicit approver participant id.  When unset, the approver is
    /// computed from the communication chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
}

impl ToolPolicy {
    pub fn auto() -> Self {
        Self { mode: PolicyMode::Auto, approver: None }
    }

    pub fn requires_approval() -> Self {
        Self { mode: PolicyMode::RequiresApproval, approver: None }
    }

    pub fn approved_by(approver: impl Into<String>) -> Self {
        Self {
            mode: PolicyMode::RequiresApproval,
            approver: Some(approver.into()),
        }
    }
}

/// One tool-name-pattern → policy mapping.  Kept as a list because pattern
/// resolution depends on insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub pattern: String,
    pub policy: ToolPolicy,
}

/// Which requesters this participant may approve on behalf of.
///
/// Serialised as `"*"` (anyone), or a list of id patterns (empty = cannot
/// approve, the default).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "AuthorityRepr", into = "AuthorityRepr")]
pub enum ApprovalAuthority {
    Any,
    Patterns(Vec<String>),
}

impl Default for ApprovalAuthority {
    fn default() -> Self {
        Self::Patterns(Vec::new())
    }
}

impl ApprovalAuthority {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Patterns(p) if p.is_empty())
    }
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(untagged)]
enum AuthorityRepr {
    Star(String),
    List(Vec<String>),
}

impl From<AuthorityRepr> for ApprovalAuthority {
    fn from(repr: AuthorityRepr) -> Self {
        match repr {
            AuthorityRepr::Star(s) if s == WILDCARD => Self::Any,
            AuthorityRepr::Star(s) => Self::Patterns(vec![s]),
            AuthorityRepr::List(l) => Self::Patterns(l),
        }
    }
}

impl From<ApprovalAuthority> for AuthorityRepr {
    fn from(a: ApprovalAuthority) -> Self {
        match a {
            ApprovalAuthority::Any => Self::Star(WILDCARD.into()),
            ApprovalAuthority::Patterns(l) => Self::List(l),
        }
    }
}

/// Reference to a provider model used by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ModelRef {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Scripted trigger → reply rule for a mock participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockRule {
    /// Case-insensitive substring trigger; `*` matches anything.
    pub trigger: String,
    pub reply: String,
}

/// Pick the reply for `input`: case-insensitive substring match, `*` matches
/// anything, first match wins.
pub fn mock_response<'a>(rules: &'a [MockRule], input: &str) -> Option<&'a str> {
    let lowered = input.to_lowercase();
    rules
        .iter()
        .find(|r| r.trigger == WILDCARD || lowered.contains(&r.trigger.to_lowercase()))
        .map(|r| r.reply.as_str())
}

/// Variant-specific participant data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ParticipantKind {
    Agent {
        system_prompt: String,
        model: ModelRef,
        /// Runtime-limit overrides for this agent alone.
        #[serde(default)]
        limits: LimitsConfig,
    },
    User {
        /// Tag selecting the communication medium this user is reached by.
        medium: String,
    },
    Mock {
        responses: Vec<MockRule>,
    },
}

/// An addressable actor in the collective: agent, human, or mock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Granted tool names; may contain the wildcard `*`.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Tool-name-pattern → policy, resolved in insertion order.
    #[serde(default)]
    pub policies: Vec<PolicyEntry>,
    #[serde(default)]
    pub approval_authority: ApprovalAuthority,
    #[serde(default)]
    pub status: ParticipantStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retired_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub kind: ParticipantKind,
}

impl Participant {
    pub fn agent(
        id: impl Into<String>,
        name: impl Into<String>,
        system_prompt: impl Into<String>,
        model: ModelRef,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            tools: Vec::new(),
            policies: Vec::new(),
            approval_authority: ApprovalAuthority::default(),
            status: ParticipantStatus::Active,
            retired_at: None,
            kind: ParticipantKind::Agent {
                system_prompt: system_prompt.into(),
                model,
                limits: LimitsConfig::default(),
            },
        }
    }

    pub fn user(
        id: impl Into<String>,
        name: impl Into<String>,
        medium: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            tools: Vec::new(),
            policies: Vec::new(),
            // Humans can approve anyone unless configured otherwise.
            approval_authority: ApprovalAuthority::Any,
            status: ParticipantStatus::Active,
            retired_at: None,
            kind: ParticipantKind::User { medium: medium.into() },
        }
    }

    pub fn mock(
        id: impl Into<String>,
        name: impl Into<String>,
        responses: Vec<MockRule>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            tools: Vec::new(),
            policies: Vec::new(),
            approval_authority: ApprovalAuthority::default(),
            status: ParticipantStatus::Active,
            retired_at: None,
            kind: ParticipantKind::Mock { responses },
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_policy(mut self, pattern: impl Into<String>, policy: ToolPolicy) -> Self {
        self.policies.push(PolicyEntry { pattern: pattern.into(), policy });
        self
    }

    pub fn with_authority(mut self, authority: ApprovalAuthority) -> Self {
        self.approval_authority = authority;
        self
    }

    pub fn with_limits(mut self, limits: LimitsConfig) -> Self {
        if let ParticipantKind::Agent { limits: l, .. } = &mut self.kind {
            *l = limits;
        }
        self
    }

    pub fn is_agent(&self) -> bool {
        matches!(self.kind, ParticipantKind::Agent { .. })
    }

    pub fn is_user(&self) -> bool {
        matches!(self.kind, ParticipantKind::User { .. })
    }

    pub fn is_active(&self) -> bool {
        self.status == ParticipantStatus::Active
    }

    /// True when this participant's grant list covers `tool`.
    pub fn grants_tool(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t == WILDCARD || t == tool)
    }

    /// Schema validation applied at save time.
    pub fn validate(&self) -> Result<(), CollectiveError> {
        if !is_valid_id(&self.id) {
            return Err(CollectiveError::Invalid {
                id: self.id.clone(),
                reason: "id must be non-empty and contain only [A-Za-z0-9_-]".into(),
            });
        }
        if self.name.trim().is_empty() {
            return Err(CollectiveError::Invalid {
                id: self.id.clone(),
                reason: "name must not be empty".into(),
            });
        }
        for entry in &self.policies {
            if entry.pattern.is_empty() {
                return Err(CollectiveError::Invalid {
                    id: self.id.clone(),
                    reason: "policy pattern must not be empty".into(),
                });
            }
        }
        match &self.kind {
            ParticipantKind::Agent { model, .. } => {
                if model.provider.is_empty() || model.model.is_empty() {
                    return Err(CollectiveError::Invalid {
                        id: self.id.clone(),
                        reason: "agent model reference must name a provider and model".into(),
                    });
                }
            }
            ParticipantKind::User { medium } => {
                if medium.is_empty() {
                    return Err(CollectiveError::Invalid {
                        id: self.id.clone(),
                        reason: "user medium must not be empty".into(),
                    });
                }
            }
            ParticipantKind::Mock { responses } => {
                for rule in responses {
                    if rule.trigger.is_empty() {
                        return Err(CollectiveError::Invalid {
                            id: self.id.clone(),
                            reason: "mock trigger must not be empty (use '*')".into(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Participant ids share a restricted charset so that conversation ids built
/// from them (`initiator>responder:name`) are injective.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
