// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use legion_collective::{ModelRef, Participant, ParticipantKind};
use legion_config::Limits;
use legion_model::{ChatMessage, ChatOptions, ContentBlock, Provider, ToolSchema};
use legion_tools::{execute_batch, DispatchAbort, ToolCall, ToolContext, ToolOutput};

use crate::conversation::Conversation;
use crate::error::{LegionError, ParticipantError};
use crate::events::{Event, EventBus};

/// Constructs providers for agents' model references.  The wiring layer
/// decides which concrete adapters exist; the runtime only asks.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, model: &ModelRef) -> Result<Arc<dyn Provider>, LegionError>;
}

/// Factory that hands the same provider to every agent.  Used by tests and
/// single-model deployments.
pub struct SingleProvider(pub Arc<dyn Provider>);

impl ProviderFactory for SingleProvider {
    fn create(&self, _model: &ModelRef) -> Result<Arc<dyn Provider>, LegionError> {
        Ok(self.0.clone())
    }
}

/// Drive one incoming message through an agent's bounded tool-use loop.
///
/// Appends the assistant/tool-result messages to `conversation` as the loop
/// progresses and returns the agent's final text.  The incoming message is
/// expected to already be in the conversation; `extra_input` carries it for
/// the active-conversation shortcut, where it exists only in the working
/// history.
#[allow(clippy::too_many_arguments)]
pub async fn run_agent(
    agent: Participant,
    provider: Arc<dyn Provider>,
    conversation: Arc<Conversation>,
    extra_input: Option<String>,
    ctx: ToolContext,
    base_limits: Limits,
    events: EventBus,
    mut cancel: Option<oneshot::Receiver<()>>,
) -> Result<String, LegionError> {
    let ParticipantKind::Agent { system_prompt, model, limits: overrides } = &agent.kind else {
        return Err(LegionError::Participant(ParticipantError::Unknown(format!(
            "{} is not an agent",
            agent.id
        ))));
    };
    let limits = base_limits.with_overrides(overrides);

    let tools: Vec<ToolSchema> = ctx
        .registry
        .definitions_for(&agent)
        .into_iter()
        .map(|d| ToolSchema {
            name: d.name,
            description: d.description,
            input_schema: d.input_schema,
        })
        .collect();

    let options = ChatOptions {
        model: model.model.clone(),
        system_prompt: Some(system_prompt.clone()),
        tools,
        temperature: model.temperature,
        max_tokens: model.max_tokens,
        stop: None,
    };

    let mut history = conversation.chat_history();
    if let Some(input) = extra_input {
        history.push(ChatMessage::user(input));
    }

    for round in 1..=limits.max_iterations {
        // Cooperative cancellation: checked between suspension points and
        // raced against the provider call itself.
        if let Some(c) = &mut cancel {
            match c.try_recv() {
                Err(oneshot::error::TryRecvError::Empty) => {}
                _ => return Err(LegionError::Cancelled),
            }
        }

        let completion = match &mut cancel {
            Some(c) => tokio::select! {
                biased;
                _ = c => return Err(LegionError::Cancelled),
                result = provider.chat(&history, &options) => result?,
            },
            None => provider.chat(&history, &options).await?,
        };

        events.publish(Event::Iteration {
            conversation: conversation.id().to_string(),
            agent: agent.id.clone(),
            round,
        });

        if completion.tool_calls.is_empty() {
            conversation.append(&agent.id, vec![ContentBlock::text(&completion.text)])?;
            return Ok(completion.text);
        }

        // Assistant turn: text (if any) plus every tool call, one message.
        let mut blocks = Vec::with_capacity(completion.tool_calls.len() + 1);
        if !completion.text.is_empty() {
            blocks.push(ContentBlock::text(&completion.text));
        }
        for tc in &completion.tool_calls {
            blocks.push(ContentBlock::tool_call(&tc.id, &tc.name, tc.input.clone()));
        }
        conversation.append(&agent.id, blocks.clone())?;
        history.push(ChatMessage::new(legion_model::Role::Assistant, blocks));

        let calls: Vec<ToolCall> = completion
            .tool_calls
            .iter()
            .map(|tc| ToolCall {
                id: tc.id.clone(),
                name: tc.name.clone(),
                input: tc.input.clone(),
            })
            .collect();
        for call in &calls {
            debug!(agent = %agent.id, tool = %call.name, call_id = %call.id, "tool call");
            events.publish(Event::ToolCall {
                conversation: conversation.id().to_string(),
                caller: agent.id.clone(),
                call_id: call.id.clone(),
                tool: call.name.clone(),
            });
        }

        let outcome = match &mut cancel {
            Some(c) => tokio::select! {
                biased;
                _ = c => {
                    // Abandon the in-flight executions but keep the log
                    // coherent: synthesize an error result per call.
                    let synthesized: Vec<ContentBlock> = calls
                        .iter()
                        .map(|call| ContentBlock::tool_result(&call.id, "cancelled", true))
                        .collect();
                    conversation.append(&agent.id, synthesized)?;
                    return Err(LegionError::Cancelled);
                }
                outcome = execute_batch(&agent, calls.clone(), &ctx) => outcome,
            },
            None => execute_batch(&agent, calls.clone(), &ctx).await,
        };
        let abort = outcome.abort;

        // One result per call, in call order — whatever the executor did.
        let mut by_id: HashMap<String, ToolOutput> = outcome
            .outputs
            .into_iter()
            .map(|o| (o.call_id.clone(), o))
            .collect();
        let results: Vec<ContentBlock> = calls
            .iter()
            .map(|call| {
                let output = by_id.remove(&call.id).unwrap_or_else(|| {
                    warn!(call_id = %call.id, "executor produced no result; synthesising error");
                    ToolOutput::err(&call.id, "tool executor produced no result")
                });
                events.publish(Event::ToolResult {
                    conversation: conversation.id().to_string(),
                    call_id: output.call_id.clone(),
                    is_error: output.is_error,
                });
                ContentBlock::tool_result(&output.call_id, &output.content, output.is_error)
            })
            .collect();

        conversation.append(&agent.id, results.clone())?;
        history.push(ChatMessage::new(legion_model::Role::User, results));

        // A structural abort cascades only after the batch's error results
        // are in place, so every level of the chain stays well-formed.
        if let Some(DispatchAbort::DepthExceeded { depth, max }) = abort {
            return Err(LegionError::DepthExceeded { depth, max });
        }
    }

    // Bounded failure: persisted like any reply so the conversation stays
    // coherent for whoever reads it next.
    let text = format!(
        "Stopped after {} iterations without reaching a final reply. \
         The work so far is recorded in this conversation.",
        limits.max_iterations
    );
    conversation.append(&agent.id, vec![ContentBlock::text(&text)])?;
    events.publish(Event::Error {
        context: format!("dispatch to {}", agent.id),
        message: format!("iteration limit of {} reached", limits.max_iterations),
    });
    Ok(text)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
