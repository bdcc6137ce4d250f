// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Communicator scenarios driven end-to-end against scripted providers and
//! mediums.  Deterministic; no network access.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use legion_collective::{Collective, MockRule, ModelRef, Participant, ToolPolicy};
use legion_config::Limits;
use legion_model::{Completion, ContentBlock, Provider, Role, ScriptedProvider};
use legion_tools::{Tool, ToolContext, ToolError, ToolRegistry};

use crate::{
    bind_communicator, communicator_slot, CommunicateTool, Communicator, Event, EventBus,
    LegionError, ParentContext, ParticipantError, PendingApprovalStore, ResolveApprovalTool,
    ScriptedMedium, Session, SingleProvider,
};

// ── Helpers ───────────────────────────────────────────────────────────────────

/// A trivial tool that returns a fixed payload.
struct FixedTool {
    name: &'static str,
    payload: &'static str,
}

#[async_trait]
impl Tool for FixedTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        "returns a fixed payload"
    }
    fn input_schema(&self) -> Value {
        json!({ "type": "object" })
    }
    async fn execute(&self, _input: &Value, _ctx: &ToolContext) -> Result<String, ToolError> {
        Ok(self.payload.to_string())
    }
}

struct Harness {
    communicator: Arc<Communicator>,
    collective: Arc<Collective>,
    medium: Arc<ScriptedMedium>,
}

fn harness(
    provider: Arc<dyn Provider>,
    participants: Vec<Participant>,
    medium_replies: &[&str],
    limits: Limits,
) -> Harness {
    let collective = Arc::new(Collective::new());
    collective
        .save(Participant::user("user", "Operator", "test"))
        .unwrap();
    for p in participants {
        collective.save(p).unwrap();
    }

    let slot = communicator_slot();
    let mut registry = ToolRegistry::new();
    registry.register(CommunicateTool::new(slot.clone())).unwrap();
    registry
        .register(ResolveApprovalTool::new(slot.clone()))
        .unwrap();
    registry
        .register(FixedTool { name: "file_read", payload: "content" })
        .unwrap();
    registry
        .register(FixedTool { name: "file_write", payload: "written" })
        .unwrap();

    let communicator = Communicator::new(
        collective.clone(),
        Arc::new(registry),
        Arc::new(Session::new()),
        Arc::new(SingleProvider(provider)),
        EventBus::new(),
        Arc::new(PendingApprovalStore::new()),
        limits,
    );
    bind_communicator(&slot, &communicator);
    let medium = Arc::new(ScriptedMedium::new(medium_replies.iter().copied()));
    communicator.register_medium("test", medium.clone());
    Harness { communicator, collective, medium }
}

fn agent(id: &str) -> Participant {
    Participant::agent(id, "Agent", "You are a helpful agent.", ModelRef::new("mock", "m"))
        .with_tools(["*"])
}

// ── Mock targets ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn mock_target_matches_trigger() {
    let h = harness(
        Arc::new(ScriptedProvider::new(vec![])),
        vec![Participant::mock(
            "greeter",
            "Greeter",
            vec![MockRule { trigger: "hello".into(), reply: "hi back".into() }],
        )],
        &[],
        Limits::default(),
    );
    let reply = h
        .communicator
        .send("user", "greeter", "Hello there", None, ParentContext::default())
        .await
        .unwrap();
    assert_eq!(reply, "hi back");
}

#[tokio::test]
async fn mock_target_without_match_is_deterministic() {
    let h = harness(
        Arc::new(ScriptedProvider::new(vec![])),
        vec![Participant::mock(
            "greeter",
            "Greeter",
            vec![MockRule { trigger: "hello".into(), reply: "hi".into() }],
        )],
        &[],
        Limits::default(),
    );
    let a = h
        .communicator
        .send("user", "greeter", "goodbye", None, ParentContext::default())
        .await
        .unwrap();
    assert!(a.contains("no scripted response"));
}

// ── User targets ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn user_target_is_prompted_through_medium() {
    let h = harness(
        Arc::new(ScriptedProvider::new(vec![])),
        vec![Participant::user("operator2", "Second", "test")],
        &["sure thing"],
        Limits::default(),
    );
    let reply = h
        .communicator
        .send("user", "operator2", "can you check?", None, ParentContext::default())
        .await
        .unwrap();
    assert_eq!(reply, "sure thing");
    assert_eq!(h.medium.prompts.lock().unwrap()[0], "can you check?");
}

#[tokio::test]
async fn missing_medium_is_a_participant_error() {
    let h = harness(
        Arc::new(ScriptedProvider::new(vec![])),
        vec![Participant::user("ghost", "Ghost", "unregistered")],
        &[],
        Limits::default(),
    );
    let err = h
        .communicator
        .send("user", "ghost", "hi", None, ParentContext::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LegionError::Participant(ParticipantError::NoMedium(_))
    ));
}

// ── Agent targets ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn agent_auto_single_turn() {
    let h = harness(
        Arc::new(ScriptedProvider::always_text("hi")),
        vec![agent("a").with_policy("*", ToolPolicy::auto())],
        &[],
        Limits::default(),
    );
    let reply = h
        .communicator
        .send("user", "a", "hello", None, ParentContext::default())
        .await
        .unwrap();
    assert_eq!(reply, "hi");

    let convo = h.communicator.session().get("user>a:default").unwrap();
    let messages = convo.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
}

#[tokio::test]
async fn agent_tool_call_under_auto_policy() {
    let h = harness(
        Arc::new(ScriptedProvider::tool_then_text(
            "t1",
            "file_read",
            json!({"path": "foo"}),
            "done",
        )),
        vec![agent("a")],
        &[],
        Limits::default(),
    );
    let reply = h
        .communicator
        .send("user", "a", "read file foo", None, ParentContext::default())
        .await
        .unwrap();
    assert_eq!(reply, "done");

    let convo = h.communicator.session().get("user>a:default").unwrap();
    assert!(convo.check_tool_ordering().is_ok());
    let messages = convo.messages();
    // user input, assistant tool call, tool result, assistant reply
    assert_eq!(messages.len(), 4);
    match &messages[2].blocks[0] {
        ContentBlock::ToolResult { content, is_error, .. } => {
            assert_eq!(content, "content");
            assert!(!is_error);
        }
        other => panic!("expected tool result, got {other:?}"),
    }
}

#[tokio::test]
async fn approval_cascades_to_user_medium_and_approves() {
    let h = harness(
        Arc::new(ScriptedProvider::tool_then_text(
            "t1",
            "file_write",
            json!({"path": "x", "content": "y"}),
            "ok",
        )),
        vec![agent("a").with_policy("file_write", ToolPolicy::requires_approval())],
        &["approve"],
        Limits::default(),
    );
    let mut events = h.communicator.events().subscribe();
    let reply = h
        .communicator
        .send("user", "a", "write it", None, ParentContext::default())
        .await
        .unwrap();
    assert_eq!(reply, "ok");
    assert_eq!(h.medium.prompt_count(), 1, "one prompt per pending item");

    // The tool really ran after approval.
    let convo = h.communicator.session().get("user>a:default").unwrap();
    let messages = convo.messages();
    match &messages[2].blocks[0] {
        ContentBlock::ToolResult { content, is_error, .. } => {
            assert_eq!(content, "written");
            assert!(!is_error);
        }
        other => panic!("expected tool result, got {other:?}"),
    }

    let mut saw_resolved_approved = false;
    while let Ok(event) = events.try_recv() {
        if let Event::ApprovalResolved { approved: true, .. } = event {
            saw_resolved_approved = true;
        }
    }
    assert!(saw_resolved_approved);
}

#[tokio::test]
async fn rejected_cascade_lets_the_agent_adapt() {
    let h = harness(
        Arc::new(ScriptedProvider::tool_then_text(
            "t1",
            "file_write",
            json!({"path": "x"}),
            "I'll try another way",
        )),
        vec![agent("a").with_policy("file_write", ToolPolicy::requires_approval())],
        &["reject: too risky"],
        Limits::default(),
    );
    let reply = h
        .communicator
        .send("user", "a", "write it", None, ParentContext::default())
        .await
        .unwrap();
    assert_eq!(reply, "I'll try another way");

    let convo = h.communicator.session().get("user>a:default").unwrap();
    match &convo.messages()[2].blocks[0] {
        ContentBlock::ToolResult { content, is_error, .. } => {
            assert!(!is_error, "a rejection is an observation, not an error");
            assert!(content.contains("rejected"));
            assert!(content.contains("too risky"));
        }
        other => panic!("expected tool result, got {other:?}"),
    }
}

#[tokio::test]
async fn agent_sender_without_authority_gets_rejections() {
    // 'a' sends to 'b'; nobody up the (empty-authority) chain can approve,
    // and there is no parent bridge, so the batch is rejected wholesale.
    let h = harness(
        Arc::new(ScriptedProvider::tool_then_text(
            "t1",
            "file_write",
            json!({}),
            "adapted",
        )),
        vec![
            agent("a"),
            agent("b").with_policy("file_write", ToolPolicy::requires_approval()),
        ],
        &[],
        Limits::default(),
    );
    let reply = h
        .communicator
        .send("a", "b", "please write", None, ParentContext::default())
        .await
        .unwrap();
    assert_eq!(reply, "adapted");
    let convo = h.communicator.session().get("a>b:default").unwrap();
    match &convo.messages()[2].blocks[0] {
        ContentBlock::ToolResult { content, is_error, .. } => {
            assert!(!is_error);
            assert!(content.contains("no approval authority"));
        }
        other => panic!("expected tool result, got {other:?}"),
    }
}

// ── Guards & errors ───────────────────────────────────────────────────────────

#[tokio::test]
async fn depth_guard_fails_with_circular_error() {
    let h = harness(
        Arc::new(ScriptedProvider::always_text("never")),
        vec![agent("a")],
        &[],
        Limits { max_depth: 0, ..Limits::default() },
    );
    let err = h
        .communicator
        .send("user", "a", "hi", None, ParentContext::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LegionError::DepthExceeded { .. }));
}

#[tokio::test]
async fn unknown_target_and_self_send_are_rejected() {
    let h = harness(
        Arc::new(ScriptedProvider::new(vec![])),
        vec![],
        &[],
        Limits::default(),
    );
    assert!(matches!(
        h.communicator
            .send("user", "nobody", "hi", None, ParentContext::default())
            .await,
        Err(LegionError::Participant(ParticipantError::Unknown(_)))
    ));
    assert!(matches!(
        h.communicator
            .send("user", "user", "hi", None, ParentContext::default())
            .await,
        Err(LegionError::Participant(ParticipantError::SelfSend(_)))
    ));
}

#[tokio::test]
async fn retired_target_is_rejected() {
    let h = harness(
        Arc::new(ScriptedProvider::new(vec![])),
        vec![agent("a")],
        &[],
        Limits::default(),
    );
    h.collective.retire("a").unwrap();
    let err = h
        .communicator
        .send("user", "a", "hi", None, ParentContext::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LegionError::Participant(ParticipantError::Retired(_))
    ));
}

#[tokio::test]
async fn provider_failure_surfaces_as_wrapped_response() {
    let h = harness(
        Arc::new(legion_model::AnthropicProvider::new(None, None)),
        vec![agent("a")],
        &[],
        Limits::default(),
    );
    let mut events = h.communicator.events().subscribe();
    let reply = h
        .communicator
        .send("user", "a", "hi", None, ParentContext::default())
        .await
        .unwrap();
    assert!(reply.starts_with("[provider error]"));

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, Event::Error { .. }) {
            saw_error = true;
        }
    }
    assert!(saw_error);
}

#[tokio::test]
async fn invalid_conversation_name_is_rejected() {
    let h = harness(
        Arc::new(ScriptedProvider::new(vec![])),
        vec![agent("a")],
        &[],
        Limits::default(),
    );
    let err = h
        .communicator
        .send("user", "a", "hi", Some("bad name!"), ParentContext::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LegionError::Tool(_)));
}

// ── Conversations ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn named_conversations_are_distinct() {
    let h = harness(
        Arc::new(ScriptedProvider::new(vec![
            Completion::text_reply("one"),
            Completion::text_reply("two"),
        ])),
        vec![agent("a")],
        &[],
        Limits::default(),
    );
    h.communicator
        .send("user", "a", "first", None, ParentContext::default())
        .await
        .unwrap();
    h.communicator
        .send("user", "a", "second", Some("review"), ParentContext::default())
        .await
        .unwrap();
    let session = h.communicator.session();
    assert!(session.get("user>a:default").is_some());
    assert!(session.get("user>a:review").is_some());
    assert_eq!(session.get("user>a:default").unwrap().len(), 2);
}

#[tokio::test]
async fn active_conversation_shortcut_skips_text_appends() {
    let h = harness(
        Arc::new(ScriptedProvider::new(vec![])),
        vec![Participant::mock(
            "m",
            "Mock",
            vec![MockRule { trigger: "*".into(), reply: "pong".into() }],
        )],
        &[],
        Limits::default(),
    );
    let parent = ParentContext {
        active_conversation: Some(crate::conversation_id("user", "m", "default")),
        ..Default::default()
    };
    let reply = h
        .communicator
        .send("user", "m", "ping", None, parent)
        .await
        .unwrap();
    assert_eq!(reply, "pong");
    // Neither the message nor the response was logged.
    let convo = h.communicator.session().get("user>m:default").unwrap();
    assert!(convo.is_empty());
}

#[tokio::test]
async fn identical_sends_yield_identical_conversations() {
    let script = || {
        Arc::new(ScriptedProvider::tool_then_text(
            "t1",
            "file_read",
            json!({"path": "foo"}),
            "done",
        ))
    };
    let run = |provider: Arc<ScriptedProvider>| async move {
        let h = harness(provider, vec![agent("a")], &[], Limits::default());
        h.communicator
            .send("user", "a", "read file foo", None, ParentContext::default())
            .await
            .unwrap();
        let convo = h.communicator.session().get("user>a:default").unwrap();
        convo
            .messages()
            .iter()
            .map(|m| (m.author.clone(), m.role, m.blocks.clone()))
            .collect::<Vec<_>>()
    };
    let first = run(script()).await;
    let second = run(script()).await;
    assert_eq!(first, second);
}
