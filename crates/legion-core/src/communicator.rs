// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use legion_collective::{
    is_valid_id, mock_response, Collective, Participant, ParticipantKind,
};
use legion_config::Limits;
use legion_model::ContentBlock;
use legion_tools::{
    can_approve, Chain, Decision, PendingBatch, SuspensionBridge, SuspensionSignal,
    ToolContext, ToolRegistry,
};

use crate::approval::{DispatchRun, PendingApprovalStore};
use crate::conversation::DEFAULT_CONVERSATION;
use crate::error::{LegionError, ParticipantError};
use crate::events::{Event, EventBus};
use crate::medium::Medium;
use crate::runtime::{run_agent, ProviderFactory};
use crate::session::Session;

/// Context a nested send inherits from the dispatch it originates in.
#[derive(Clone, Default)]
pub struct ParentContext {
    pub chain: Chain,
    /// The calling dispatch's suspension bridge, for upward re-emission.
    pub bridge: Option<Arc<SuspensionBridge>>,
    /// The conversation the calling runtime is currently weaving, enabling
    /// the active-conversation shortcut.
    pub active_conversation: Option<String>,
}

/// What became of an agent dispatch.
pub(crate) enum AgentOutcome {
    Final(String),
    /// Stored in the pending-approval store; the text is the formatted
    /// APPROVAL REQUEST returned to the sender.
    Parked { request_id: String, text: String },
}

enum RaceResult {
    Completed(Result<String, LegionError>),
    Suspended(SuspensionSignal),
}

/// The universal peer-to-peer operation: deliver a message to a participant
/// and await its reply, cascading approvals up the communication chain.
pub struct Communicator {
    collective: Arc<Collective>,
    registry: Arc<ToolRegistry>,
    session: Arc<Session>,
    providers: Arc<dyn ProviderFactory>,
    events: EventBus,
    pending: Arc<PendingApprovalStore>,
    mediums: RwLock<HashMap<String, Arc<dyn Medium>>>,
    limits: Limits,
}

impl Communicator {
    pub fn new(
        collective: Arc<Collective>,
        registry: Arc<ToolRegistry>,
        session: Arc<Session>,
        providers: Arc<dyn ProviderFactory>,
        events: EventBus,
        pending: Arc<PendingApprovalStore>,
        limits: Limits,
    ) -> Arc<Self> {
        Arc::new(Self {
            collective,
            registry,
            session,
            providers,
            events,
            pending,
            mediums: RwLock::new(HashMap::new()),
            limits,
        })
    }

    pub fn register_medium(&self, tag: impl Into<String>, medium: Arc<dyn Medium>) {
        self.mediums.write().unwrap().insert(tag.into(), medium);
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn pending(&self) -> &Arc<PendingApprovalStore> {
        &self.pending
    }

    fn medium(&self, tag: &str) -> Result<Arc<dyn Medium>, LegionError> {
        self.mediums
            .read()
            .unwrap()
            .get(tag)
            .cloned()
            .ok_or_else(|| LegionError::Participant(ParticipantError::NoMedium(tag.to_string())))
    }

    /// Deliver `message` from `from` to `to` and return the reply text.
    pub async fn send(
        self: &Arc<Self>,
        from: &str,
        to: &str,
        message: &str,
        conversation_name: Option<&str>,
        parent: ParentContext,
    ) -> Result<String, LegionError> {
        self.send_inner(from, to, message, conversation_name, parent, None)
            .await
    }

    /// Like [`send`] but cancellable: resolving (or dropping) the sender
    /// half aborts the dispatch at its next suspension point.
    pub async fn send_with_cancel(
        self: &Arc<Self>,
        from: &str,
        to: &str,
        message: &str,
        conversation_name: Option<&str>,
        parent: ParentContext,
        cancel: oneshot::Receiver<()>,
    ) -> Result<String, LegionError> {
        self.send_inner(from, to, message, conversation_name, parent, Some(cancel))
            .await
    }

    async fn send_inner(
        self: &Arc<Self>,
        from: &str,
        to: &str,
        message: &str,
        conversation_name: Option<&str>,
        parent: ParentContext,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<String, LegionError> {
        // 1. Depth guard.
        if parent.chain.len() >= self.limits.max_depth {
            return Err(LegionError::DepthExceeded {
                depth: parent.chain.len(),
                max: self.limits.max_depth,
            });
        }

        // 2. Resolve both ends.
        if from == to {
            return Err(LegionError::Participant(ParticipantError::SelfSend(
                from.to_string(),
            )));
        }
        if self.collective.get(from).is_none() {
            return Err(LegionError::Participant(ParticipantError::Unknown(
                from.to_string(),
            )));
        }
        let target = self.collective.get_active(to)?;

        // 3. Directional conversation, created lazily.
        let name = conversation_name.unwrap_or(DEFAULT_CONVERSATION);
        if !is_valid_id(name) {
            return Err(LegionError::Tool(format!(
                "invalid conversation name: {name:?}"
            )));
        }
        let convo = self.session.get_or_create(from, to, name);

        // Active-conversation shortcut: the calling runtime is already
        // weaving this conversation through its tool-use loop; appending
        // here would corrupt the tool-ordering invariant.
        let skip_log = parent.active_conversation.as_deref() == Some(convo.id());
        let mut guard = if skip_log {
            None
        } else {
            Some(convo.writer_lock().await)
        };

        // 4. Append the incoming message.
        if !skip_log {
            convo.append(from, vec![ContentBlock::text(message)])?;
            self.events.publish(Event::MessageSent {
                conversation: convo.id().to_string(),
                author: from.to_string(),
                text: message.to_string(),
            });
        }

        // 5. Dispatch by participant variant.
        let reply = match &target.kind {
            ParticipantKind::Mock { responses } => mock_response(responses, message)
                .map(str::to_string)
                .unwrap_or_else(|| {
                    format!("[{}] has no scripted response for this message", target.id)
                }),
            ParticipantKind::User { medium } => {
                let medium = self.medium(medium)?;
                medium.prompt(message).await?
            }
            ParticipantKind::Agent { .. } => {
                let outcome = self
                    .dispatch_agent(from, &target, convo.clone(), message, skip_log, &parent, guard.take(), cancel)
                    .await?;
                match outcome {
                    AgentOutcome::Final(text) => return Ok(text),
                    // 6'. Early return: this text becomes the tool result of
                    // the sender's communicate call; the inner conversation
                    // stays suspended but intact.
                    AgentOutcome::Parked { text, .. } => return Ok(text),
                }
            }
        };

        // 6. Append the response and finish.
        if !skip_log {
            convo.append(to, vec![ContentBlock::text(&reply)])?;
            self.events.publish(Event::MessageSent {
                conversation: convo.id().to_string(),
                author: to.to_string(),
                text: reply.clone(),
            });
            if let Err(e) = self.session.persist(&convo) {
                warn!(conversation = %convo.id(), error = %e, "failed to persist conversation");
            }
        }
        drop(guard);
        Ok(reply)
    }

    /// Spawn the agent runtime and race its completion against suspension
    /// signals from its bridge.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_agent(
        self: &Arc<Self>,
        from: &str,
        agent: &Participant,
        conversation: Arc<crate::conversation::Conversation>,
        message: &str,
        skip_log: bool,
        parent: &ParentContext,
        guard: Option<tokio::sync::OwnedMutexGuard<()>>,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<AgentOutcome, LegionError> {
        let ParticipantKind::Agent { model, .. } = &agent.kind else {
            unreachable!("dispatch_agent called for a non-agent");
        };
        let provider = self.providers.create(model)?;

        let chain = parent.chain.push(from);
        let bridge = Arc::new(SuspensionBridge::new());
        let signal_rx = bridge
            .take_signal_receiver()
            .expect("fresh bridge has its receiver");

        let ctx = ToolContext {
            caller: agent.id.clone(),
            chain,
            conversation_id: conversation.id().to_string(),
            session_id: self.session.id().to_string(),
            registry: self.registry.clone(),
            collective: self.collective.clone(),
            bridge,
        };

        // On the shortcut path the incoming message exists only in the
        // working history, never in the conversation log.
        let extra_input = skip_log.then(|| message.to_string());
        debug!(from = %from, to = %agent.id, conversation = %conversation.id(), "dispatching agent");
        let join = tokio::spawn(run_agent(
            agent.clone(),
            provider,
            conversation.clone(),
            extra_input,
            ctx,
            self.limits,
            self.events.clone(),
            cancel,
        ));

        let run = DispatchRun {
            join,
            signal_rx,
            signal_rx_open: true,
            conversation,
            from: from.to_string(),
            to: agent.id.clone(),
            skip_log,
            guard,
            parent_bridge: parent.bridge.clone(),
        };
        self.drive(run).await
    }

    /// The completion/suspension race plus the approval cascade.  Shared by
    /// fresh dispatches and by parked dispatches being resumed.
    pub(crate) async fn drive(
        self: &Arc<Self>,
        mut run: DispatchRun,
    ) -> Result<AgentOutcome, LegionError> {
        loop {
            match race(&mut run).await {
                RaceResult::Completed(result) => {
                    let text = match result {
                        Ok(text) => text,
                        Err(LegionError::Provider(e)) => {
                            // Provider failures surface as the dispatch's
                            // (wrapped) response text plus an error event.
                            self.events.publish(Event::Error {
                                context: format!("dispatch to {}", run.to),
                                message: e.to_string(),
                            });
                            let wrapped = format!("[provider error] {e}");
                            if !run.skip_log {
                                run.conversation
                                    .append(&run.to, vec![ContentBlock::text(&wrapped)])?;
                            }
                            wrapped
                        }
                        Err(other) => return Err(other),
                    };
                    if !run.skip_log {
                        self.events.publish(Event::MessageSent {
                            conversation: run.conversation.id().to_string(),
                            author: run.to.clone(),
                            text: text.clone(),
                        });
                        if let Err(e) = self.session.persist(&run.conversation) {
                            warn!(
                                conversation = %run.conversation.id(),
                                error = %e,
                                "failed to persist conversation"
                            );
                        }
                    }
                    drop(run.guard.take());
                    return Ok(AgentOutcome::Final(text));
                }
                RaceResult::Suspended(signal) => {
                    match self.cascade(signal, run).await? {
                        CascadeStep::Continue(r) => run = r,
                        CascadeStep::Parked(outcome) => return Ok(outcome),
                    }
                }
            }
        }
    }

    /// Apply the approval-cascade policy to one suspension signal.
    async fn cascade(
        self: &Arc<Self>,
        signal: SuspensionSignal,
        run: DispatchRun,
    ) -> Result<CascadeStep, LegionError> {
        let sender = self.collective.get(&run.from).ok_or_else(|| {
            LegionError::Participant(ParticipantError::Unknown(run.from.clone()))
        })?;
        let tools: Vec<String> = signal
            .batch
            .items
            .iter()
            .map(|i| i.call.name.clone())
            .collect();

        match &sender.kind {
            // The immediate sender is a human: put each pending call to
            // their medium individually, then keep racing — the runtime may
            // suspend again on a later turn of the same loop.
            ParticipantKind::User { medium } => {
                self.events.publish(Event::ApprovalRequested {
                    request_id: None,
                    requester: signal.batch.requester.clone(),
                    tools,
                });
                let medium = self.medium(medium)?;
                let mut decisions = legion_tools::DecisionMap::new();
                for item in &signal.batch.items {
                    let prompt = format!(
                        "Approval required: agent '{}' wants to call {}({}).\n\
                         Reply 'approve' or 'reject[: reason]'.",
                        signal.batch.requester, item.call.name, item.call.input
                    );
                    let decision = match medium.prompt(&prompt).await {
                        Ok(reply) => parse_decision(&reply),
                        Err(e) => {
                            warn!(error = %e, "approval prompt failed; rejecting item");
                            Decision::rejected("approver unavailable")
                        }
                    };
                    decisions.insert(item.call.id.clone(), decision);
                }
                let approved = decisions.values().all(Decision::is_approved);
                self.events.publish(Event::ApprovalResolved {
                    request_id: None,
                    approved,
                });
                signal.resolve(decisions);
                Ok(CascadeStep::Continue(run))
            }

            // The immediate sender is an agent with authority over the
            // requester: park the dispatch and return early with a request
            // the sender can resolve via the resolve_approval tool.
            ParticipantKind::Agent { .. } if can_approve(&sender, &signal.batch.requester) => {
                let batch = signal.batch.clone();
                let request_id = self.pending.park(signal, run);
                self.events.publish(Event::ApprovalRequested {
                    request_id: Some(request_id.clone()),
                    requester: batch.requester.clone(),
                    tools,
                });
                let text = format_approval_request(&request_id, &batch);
                Ok(CascadeStep::Parked(AgentOutcome::Parked { request_id, text }))
            }

            // No authority, but a parent dispatch supplied its bridge:
            // re-emit the batch upward and relay the decisions back down.
            _ if run.parent_bridge.is_some() => {
                let parent_bridge = run.parent_bridge.clone().expect("checked above");
                self.events.publish(Event::ApprovalRequested {
                    request_id: None,
                    requester: signal.batch.requester.clone(),
                    tools,
                });
                let decisions = parent_bridge.request_approval(signal.batch.clone()).await;
                let approved = decisions.values().all(Decision::is_approved);
                self.events.publish(Event::ApprovalResolved {
                    request_id: None,
                    approved,
                });
                signal.resolve(decisions);
                Ok(CascadeStep::Continue(run))
            }

            // Nobody can decide: reject everything.  A safe fallback — the
            // agent observes the rejections and may adapt.
            _ => {
                self.events.publish(Event::ApprovalRequested {
                    request_id: None,
                    requester: signal.batch.requester.clone(),
                    tools,
                });
                let decisions = signal
                    .batch
                    .uniform(Decision::rejected("sender has no approval authority"));
                self.events.publish(Event::ApprovalResolved {
                    request_id: None,
                    approved: false,
                });
                signal.resolve(decisions);
                Ok(CascadeStep::Continue(run))
            }
        }
    }

    /// Resolve a parked approval request with a uniform decision and drive
    /// the inner dispatch onward.  Returns the agent's final text (or a
    /// fresh APPROVAL REQUEST if the runtime suspends again).
    pub async fn resolve_approval(
        self: &Arc<Self>,
        request_id: &str,
        decision: Decision,
    ) -> Result<String, LegionError> {
        let parked = self.pending.take(request_id).ok_or_else(|| {
            LegionError::Suspension(format!(
                "unknown or already-resolved approval request: {request_id}"
            ))
        })?;
        let verdict = if decision.is_approved() { "approved" } else { "rejected" };
        self.events.publish(Event::ApprovalResolved {
            request_id: Some(request_id.to_string()),
            approved: decision.is_approved(),
        });
        let decisions = parked.signal.batch.uniform(decision);
        parked.signal.resolve(decisions);

        match self.drive(parked.run).await? {
            AgentOutcome::Final(text) => Ok(format!(
                "Approval request {request_id} was {verdict}. Agent response:\n{text}"
            )),
            AgentOutcome::Parked { text, .. } => Ok(text),
        }
    }
}

enum CascadeStep {
    Continue(DispatchRun),
    Parked(AgentOutcome),
}

/// Race the runtime's completion against the next suspension signal.
async fn race(run: &mut DispatchRun) -> RaceResult {
    enum Arm {
        Completed(Result<Result<String, LegionError>, tokio::task::JoinError>),
        Signal(Option<SuspensionSignal>),
    }
    while run.signal_rx_open {
        let arm = tokio::select! {
            result = &mut run.join => Arm::Completed(result),
            signal = run.signal_rx.recv() => Arm::Signal(signal),
        };
        match arm {
            Arm::Completed(result) => return RaceResult::Completed(flatten(result)),
            Arm::Signal(Some(signal)) => return RaceResult::Suspended(signal),
            // Bridge dropped: the runtime is finishing; only the completion
            // arm remains.
            Arm::Signal(None) => run.signal_rx_open = false,
        }
    }
    RaceResult::Completed(flatten((&mut run.join).await))
}

fn flatten(
    result: Result<Result<String, LegionError>, tokio::task::JoinError>,
) -> Result<String, LegionError> {
    match result {
        Ok(inner) => inner,
        Err(e) if e.is_cancelled() => Err(LegionError::Cancelled),
        Err(e) => Err(LegionError::Suspension(format!("agent task failed: {e}"))),
    }
}

/// Interpret a human's free-text reply to an approval prompt.
fn parse_decision(reply: &str) -> Decision {
    let trimmed = reply.trim();
    let lower = trimmed.to_lowercase();
    if lower == "y" || lower == "yes" || lower.starts_with("approve") {
        Decision::Approved
    } else {
        let reason = trimmed
            .split_once(':')
            .map(|(_, r)| r.trim().to_string())
            .filter(|r| !r.is_empty());
        Decision::Rejected { reason }
    }
}

fn format_approval_request(request_id: &str, batch: &PendingBatch) -> String {
    let mut text = format!(
        "APPROVAL REQUEST {request_id}\n\
         Agent '{}' awaits approval for {} tool call(s):\n",
        batch.requester,
        batch.items.len()
    );
    for (i, item) in batch.items.iter().enumerate() {
        text.push_str(&format!("  {}. {}({})\n", i + 1, item.call.name, item.call.input));
    }
    text.push_str(&format!(
        "Resolve it with the resolve_approval tool: request_id '{request_id}', \
         decision 'approved' or 'rejected'."
    ));
    text
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_decision_accepts_approval_spellings() {
        assert!(parse_decision("approve").is_approved());
        assert!(parse_decision("Approved").is_approved());
        assert!(parse_decision("yes").is_approved());
        assert!(parse_decision(" y ").is_approved());
    }

    #[test]
    fn parse_decision_rejects_everything_else() {
        assert!(!parse_decision("no").is_approved());
        assert!(!parse_decision("reject").is_approved());
        assert!(!parse_decision("").is_approved());
    }

    #[test]
    fn parse_decision_extracts_reason_after_colon() {
        match parse_decision("reject: too risky") {
            Decision::Rejected { reason } => assert_eq!(reason.as_deref(), Some("too risky")),
            other => panic!("unexpected: {other:?}"),
        }
        match parse_decision("reject") {
            Decision::Rejected { reason } => assert!(reason.is_none()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn approval_request_text_names_every_call() {
        let batch = PendingBatch {
            requester: "worker".into(),
            items: vec![legion_tools::PendingItem {
                call: legion_tools::ToolCall {
                    id: "t1".into(),
                    name: "file_write".into(),
                    input: serde_json::json!({"path": "x"}),
                },
                approver: "boss".into(),
            }],
        };
        let text = format_approval_request("req-1", &batch);
        assert!(text.starts_with("APPROVAL REQUEST req-1"));
        assert!(text.contains("file_write"));
        assert!(text.contains("resolve_approval"));
    }
}
