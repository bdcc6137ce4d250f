// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Three-phase batch executor: authorize, approve, run.
//!
//! Batching keeps the tool-ordering invariant intact with a single approval
//! round-trip per LLM turn, and never crashes the agent: denials and
//! rejections are materialised as observations the model can adapt to.

use std::collections::HashMap;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use legion_collective::Participant;

use crate::auth::{self, Authorization};
use crate::bridge::{Decision, DecisionMap, PendingBatch, PendingItem};
use crate::tool::{DispatchAbort, ToolCall, ToolContext, ToolError, ToolOutput};

/// The outcome of one batch: one output per input call (always), plus an
/// abort to re-raise once the outputs are logged.
pub struct BatchOutcome {
    pub outputs: Vec<ToolOutput>,
    pub abort: Option<DispatchAbort>,
}

/// Per-call outcome of the pre-scan phase.
enum Gate {
    Unknown,
    Allowed,
    Denied(String),
    Pending { approver: String },
}

/// Run one batch of tool calls on behalf of `participant`.
///
/// Always produces exactly one output per input call, preserving ids and
/// order, whatever happens in between.
pub async fn execute_batch(
    participant: &Participant,
    calls: Vec<ToolCall>,
    ctx: &ToolContext,
) -> BatchOutcome {
    // ── Phase 1: pre-scan ────────────────────────────────────────────────────
    let gates: Vec<Gate> = calls
        .iter()
        .map(|call| {
            if !participant.grants_tool(&call.name) || ctx.registry.get(&call.name).is_none() {
                return Gate::Unknown;
            }
            match auth::evaluate(participant, &call.name, &call.input, &ctx.chain, &ctx.collective)
            {
                Authorization::Allowed => Gate::Allowed,
                Authorization::Denied { reason } => Gate::Denied(reason),
                Authorization::PendingApproval { approver } => Gate::Pending { approver },
            }
        })
        .collect();

    // ── Phase 2: batch approval rendezvous ───────────────────────────────────
    let pending: Vec<PendingItem> = calls
        .iter()
        .zip(&gates)
        .filter_map(|(call, gate)| match gate {
            Gate::Pending { approver } => Some(PendingItem {
                call: call.clone(),
                approver: approver.clone(),
            }),
            _ => None,
        })
        .collect();

    let decisions: DecisionMap = if pending.is_empty() {
        HashMap::new()
    } else {
        debug!(
            requester = %participant.id,
            pending = pending.len(),
            "suspending batch for approval"
        );
        let batch = PendingBatch { requester: participant.id.clone(), items: pending };
        ctx.bridge.request_approval(batch).await
    };

    // ── Phase 3: execute in original order ───────────────────────────────────
    // Runnable calls execute in parallel; outputs are assembled in call order.
    let mut tasks: Vec<Option<JoinHandle<(ToolOutput, Option<DispatchAbort>)>>> =
        Vec::with_capacity(calls.len());
    for (call, gate) in calls.iter().zip(&gates) {
        let runnable = match gate {
            Gate::Allowed => true,
            Gate::Pending { .. } => decisions
                .get(&call.id)
                .is_some_and(Decision::is_approved),
            _ => false,
        };
        if !runnable {
            tasks.push(None);
            continue;
        }
        let tool = ctx
            .registry
            .get(&call.name)
            .expect("pre-scan verified the tool exists");
        let input = call.input.clone();
        let task_ctx = ctx.clone();
        let call_id = call.id.clone();
        tasks.push(Some(tokio::spawn(async move {
            match tool.execute(&input, &task_ctx).await {
                Ok(content) => (ToolOutput::ok(&call_id, content), None),
                Err(ToolError::Abort(abort)) => {
                    (ToolOutput::err(&call_id, abort.to_string()), Some(abort))
                }
                Err(e) => (ToolOutput::err(&call_id, e.to_string()), None),
            }
        })));
    }

    let mut abort: Option<DispatchAbort> = None;
    let mut outputs = Vec::with_capacity(calls.len());
    for ((call, gate), task) in calls.iter().zip(&gates).zip(tasks) {
        let output = match (gate, task) {
            (Gate::Unknown, _) => {
                ToolOutput::err(&call.id, format!("unknown tool: {}", call.name))
            }
            (Gate::Denied(reason), _) => {
                ToolOutput::err(&call.id, format!("denied by policy: {reason}"))
            }
            (Gate::Pending { approver }, None) => {
                // Rejected: a non-error observation so the agent can adapt.
                let reason = match decisions.get(&call.id) {
                    Some(Decision::Rejected { reason: Some(r) }) => r.clone(),
                    _ => "no reason given".into(),
                };
                ToolOutput::ok(
                    &call.id,
                    format!(
                        "Tool call '{}' was rejected by {approver}: {reason}. \
                         You may try a different approach.",
                        call.name
                    ),
                )
            }
            (_, Some(task)) => match task.await {
                Ok((output, task_abort)) => {
                    abort = abort.or(task_abort);
                    output
                }
                Err(e) => {
                    warn!(call_id = %call.id, error = %e, "tool task panicked");
                    ToolOutput::err(&call.id, format!("tool execution panicked: {e}"))
                }
            },
            (Gate::Allowed, None) => unreachable!("allowed calls are always spawned"),
        };
        outputs.push(output);
    }
    BatchOutcome { outputs, abort }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use legion_collective::{Collective, ModelRef, Participant, ToolPolicy};

    use super::*;
    use crate::bridge::SuspensionBridge;
    use crate::registry::ToolRegistry;
    use crate::tool::{Chain, Tool, ToolError};

    struct UpperTool;

    #[async_trait]
    impl Tool for UpperTool {
        fn name(&self) -> &str {
            "upper"
        }
        fn description(&self) -> &str {
            "uppercases the 'text' argument"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object", "properties": { "text": { "type": "string" } } })
        }
        async fn execute(&self, input: &Value, _ctx: &ToolContext) -> Result<String, ToolError> {
            let text = input["text"]
                .as_str()
                .ok_or_else(|| ToolError::InvalidInput("missing 'text'".into()))?;
            Ok(text.to_uppercase())
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, _input: &Value, _ctx: &ToolContext) -> Result<String, ToolError> {
            Err(ToolError::Failed("it broke".into()))
        }
    }

    fn context(collective: Arc<Collective>) -> (ToolContext, Arc<SuspensionBridge>) {
        let mut registry = ToolRegistry::new();
        registry.register(UpperTool).unwrap();
        registry.register(FailingTool).unwrap();
        let bridge = Arc::new(SuspensionBridge::new());
        let ctx = ToolContext {
            caller: "worker".into(),
            chain: Chain::new().push("user"),
            conversation_id: "user>worker:default".into(),
            session_id: "s1".into(),
            registry: Arc::new(registry),
            collective,
            bridge: bridge.clone(),
        };
        (ctx, bridge)
    }

    fn worker() -> Participant {
        Participant::agent("worker", "Worker", "p", ModelRef::new("mock", "m"))
            .with_tools(["*"])
    }

    fn call(id: &str, name: &str, input: Value) -> ToolCall {
        ToolCall { id: id.into(), name: name.into(), input }
    }

    #[tokio::test]
    async fn allowed_calls_run_and_preserve_order() {
        let (ctx, _bridge) = context(Arc::new(Collective::new()));
        let outputs = execute_batch(
            &worker(),
            vec![
                call("t1", "upper", json!({"text": "one"})),
                call("t2", "upper", json!({"text": "two"})),
            ],
            &ctx,
        )
        .await
        .outputs;
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].call_id, "t1");
        assert_eq!(outputs[0].content, "ONE");
        assert_eq!(outputs[1].content, "TWO");
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_result() {
        let (ctx, _bridge) = context(Arc::new(Collective::new()));
        let outputs = execute_batch(&worker(), vec![call("t1", "nope", json!({}))], &ctx)
            .await
            .outputs;
        assert!(outputs[0].is_error);
        assert!(outputs[0].content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn ungranted_tool_is_treated_as_unknown() {
        let (ctx, _bridge) = context(Arc::new(Collective::new()));
        let narrow = worker().with_tools(["broken"]);
        let outputs = execute_batch(&narrow, vec![call("t1", "upper", json!({}))], &ctx)
            .await
            .outputs;
        assert!(outputs[0].is_error);
        assert!(outputs[0].content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn tool_failure_becomes_error_result() {
        let (ctx, _bridge) = context(Arc::new(Collective::new()));
        let outputs = execute_batch(&worker(), vec![call("t1", "broken", json!({}))], &ctx)
            .await
            .outputs;
        assert!(outputs[0].is_error);
        assert!(outputs[0].content.contains("it broke"));
    }

    #[tokio::test]
    async fn denied_when_no_approver_resolvable() {
        let (ctx, _bridge) = context(Arc::new(Collective::new()));
        let p = worker().with_policy("upper", ToolPolicy::requires_approval());
        // Chainless context and no user in the collective → Denied.
        let ctx = ToolContext { chain: Chain::new(), ..ctx };
        let outputs = execute_batch(&p, vec![call("t1", "upper", json!({}))], &ctx)
            .await
            .outputs;
        assert!(outputs[0].is_error);
        assert!(outputs[0].content.contains("denied by policy"));
    }

    #[tokio::test]
    async fn pending_batch_goes_through_bridge_and_runs_approved() {
        let (ctx, bridge) = context(Arc::new(Collective::new()));
        let mut rx = bridge.take_signal_receiver().unwrap();
        let p = worker().with_policy("upper", ToolPolicy::requires_approval());

        let observer = tokio::spawn(async move {
            let signal = rx.recv().await.unwrap();
            let decisions = signal.batch.uniform(Decision::Approved);
            signal.resolve(decisions);
        });

        let outputs = execute_batch(
            &p,
            vec![call("t1", "upper", json!({"text": "go"}))],
            &ctx,
        )
        .await
        .outputs;
        observer.await.unwrap();
        assert!(!outputs[0].is_error);
        assert_eq!(outputs[0].content, "GO");
    }

    #[tokio::test]
    async fn rejection_is_a_non_error_observation() {
        let (ctx, bridge) = context(Arc::new(Collective::new()));
        let mut rx = bridge.take_signal_receiver().unwrap();
        let p = worker().with_policy("upper", ToolPolicy::requires_approval());

        let observer = tokio::spawn(async move {
            let signal = rx.recv().await.unwrap();
            let decisions = signal.batch.uniform(Decision::rejected("not now"));
            signal.resolve(decisions);
        });

        let outputs = execute_batch(
            &p,
            vec![call("t1", "upper", json!({"text": "go"}))],
            &ctx,
        )
        .await
        .outputs;
        observer.await.unwrap();
        assert!(!outputs[0].is_error, "rejection must not be an error result");
        assert!(outputs[0].content.contains("rejected"));
        assert!(outputs[0].content.contains("not now"));
    }

    #[tokio::test]
    async fn tool_abort_is_reported_alongside_outputs() {
        struct AbortingTool;

        #[async_trait]
        impl Tool for AbortingTool {
            fn name(&self) -> &str {
                "recurse"
            }
            fn description(&self) -> &str {
                "always trips the depth guard"
            }
            fn input_schema(&self) -> Value {
                json!({ "type": "object" })
            }
            async fn execute(
                &self,
                _input: &Value,
                _ctx: &ToolContext,
            ) -> Result<String, ToolError> {
                Err(ToolError::Abort(crate::tool::DispatchAbort::DepthExceeded {
                    depth: 10,
                    max: 10,
                }))
            }
        }

        let collective = Arc::new(Collective::new());
        let mut registry = ToolRegistry::new();
        registry.register(AbortingTool).unwrap();
        let bridge = Arc::new(SuspensionBridge::new());
        let ctx = ToolContext {
            caller: "worker".into(),
            chain: Chain::new().push("user"),
            conversation_id: "user>worker:default".into(),
            session_id: "s1".into(),
            registry: Arc::new(registry),
            collective,
            bridge,
        };
        let outcome = execute_batch(
            &worker(),
            vec![call("t1", "recurse", json!({}))],
            &ctx,
        )
        .await;
        assert!(outcome.abort.is_some());
        assert_eq!(outcome.outputs.len(), 1);
        assert!(outcome.outputs[0].is_error);
        assert!(outcome.outputs[0].content.contains("circular communication"));
    }

    #[tokio::test]
    async fn mixed_batch_uses_single_rendezvous_and_keeps_order() {
        let (ctx, bridge) = context(Arc::new(Collective::new()));
        let mut rx = bridge.take_signal_receiver().unwrap();
        let p = worker().with_policy("broken", ToolPolicy::requires_approval());

        let observer = tokio::spawn(async move {
            let signal = rx.recv().await.unwrap();
            // Only the 'broken' call is in the batch.
            assert_eq!(signal.batch.items.len(), 1);
            let decisions = signal.batch.uniform(Decision::rejected("skip it"));
            signal.resolve(decisions);
        });

        let outputs = execute_batch(
            &p,
            vec![
                call("t1", "upper", json!({"text": "a"})),
                call("t2", "broken", json!({})),
                call("t3", "missing_tool", json!({})),
            ],
            &ctx,
        )
        .await
        .outputs;
        observer.await.unwrap();
        assert_eq!(
            outputs.iter().map(|o| o.call_id.as_str()).collect::<Vec<_>>(),
            vec!["t1", "t2", "t3"]
        );
        assert_eq!(outputs[0].content, "A");
        assert!(outputs[1].content.contains("rejected"));
        assert!(outputs[2].is_error);
    }
}
