// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};

use legion_tools::{Decision, DispatchAbort, Tool, ToolContext, ToolError};

use crate::communicator::{Communicator, ParentContext};
use crate::error::LegionError;

/// Late-bound handle to the communicator.
///
/// The communicate tools live inside the tool registry, which the
/// communicator owns; a weak reference set after construction breaks the
/// cycle.
pub type CommunicatorSlot = Arc<OnceLock<Weak<Communicator>>>;

pub fn communicator_slot() -> CommunicatorSlot {
    Arc::new(OnceLock::new())
}

/// Bind `slot` to a constructed communicator.  Call once during wiring.
pub fn bind_communicator(slot: &CommunicatorSlot, communicator: &Arc<Communicator>) {
    let _ = slot.set(Arc::downgrade(communicator));
}

fn resolve(slot: &CommunicatorSlot) -> Result<Arc<Communicator>, ToolError> {
    slot.get()
        .and_then(Weak::upgrade)
        .ok_or_else(|| ToolError::Failed("communicator is not available".into()))
}

fn require_str<'a>(input: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    input[field]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::InvalidInput(format!("missing '{field}'")))
}

/// The universal peer-to-peer tool: send a message to another participant
/// and wait for their reply.
pub struct CommunicateTool {
    communicator: CommunicatorSlot,
}

impl CommunicateTool {
    pub fn new(communicator: CommunicatorSlot) -> Self {
        Self { communicator }
    }
}

#[async_trait]
impl Tool for CommunicateTool {
    fn name(&self) -> &str {
        "communicate"
    }

    fn description(&self) -> &str {
        "Send a message to another participant of the collective (agent, human, \
         or mock) and wait for their reply. The reply text is returned as the \
         tool result. If the target needs an approval you are entitled to give, \
         the result is an APPROVAL REQUEST to resolve with resolve_approval."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "target_id": {
                    "type": "string",
                    "description": "Id of the participant to contact"
                },
                "message": {
                    "type": "string",
                    "description": "The message to deliver"
                },
                "session_name": {
                    "type": "string",
                    "description": "Named conversation to use (default: 'default')"
                }
            },
            "required": ["target_id", "message"]
        })
    }

    async fn execute(&self, input: &Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let target = require_str(input, "target_id")?;
        let message = require_str(input, "message")?;
        let name = input["session_name"].as_str().filter(|s| !s.is_empty());

        let communicator = resolve(&self.communicator)?;
        let parent = ParentContext {
            chain: ctx.chain.clone(),
            bridge: Some(ctx.bridge.clone()),
            active_conversation: Some(ctx.conversation_id.clone()),
        };
        communicator
            .send(&ctx.caller, target, message, name, parent)
            .await
            .map_err(|e| match e {
                // A tripped depth guard is a failure of the whole chain, not
                // of this one call; it aborts every enclosing dispatch.
                LegionError::DepthExceeded { depth, max } => {
                    ToolError::Abort(DispatchAbort::DepthExceeded { depth, max })
                }
                other => ToolError::Failed(other.to_string()),
            })
    }
}

/// Resolve a parked approval request previously returned by communicate.
pub struct ResolveApprovalTool {
    communicator: CommunicatorSlot,
}

impl ResolveApprovalTool {
    pub fn new(communicator: CommunicatorSlot) -> Self {
        Self { communicator }
    }
}

#[async_trait]
impl Tool for ResolveApprovalTool {
    fn name(&self) -> &str {
        "resolve_approval"
    }

    fn description(&self) -> &str {
        "Approve or reject a pending APPROVAL REQUEST by id. On approval the \
         suspended agent resumes and this returns its final response; on \
         rejection the agent is told and may adapt before responding."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "request_id": {
                    "type": "string",
                    "description": "Id from the APPROVAL REQUEST text"
                },
                "decision": {
                    "type": "string",
                    "enum": ["approved", "rejected"]
                },
                "reason": {
                    "type": "string",
                    "description": "Optional reason, shown to the requesting agent on rejection"
                }
            },
            "required": ["request_id", "decision"]
        })
    }

    async fn execute(&self, input: &Value, _ctx: &ToolContext) -> Result<String, ToolError> {
        let request_id = require_str(input, "request_id")?;
        let decision = match require_str(input, "decision")? {
            "approved" => Decision::Approved,
            "rejected" => Decision::Rejected {
                reason: input["reason"].as_str().map(str::to_string),
            },
            other => {
                return Err(ToolError::InvalidInput(format!(
                    "decision must be 'approved' or 'rejected', got {other:?}"
                )))
            }
        };

        let communicator = resolve(&self.communicator)?;
        communicator
            .resolve_approval(request_id, decision)
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
