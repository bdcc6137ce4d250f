// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Legion — a peer-to-peer orchestration runtime for a persistent collective
//! of AI agents and human operators.
//!
//! This crate wires the layers together: the collective registry, the tool
//! registry with the two universal tools, the event bus, the pending
//! approval store, and the communicator.  The interactive front-end, full
//! layered configuration, and the wider tool catalogue are external
//! collaborators that embed this runtime.

use std::sync::Arc;

use anyhow::Context;
use tracing::warn;

pub use legion_collective::{
    ApprovalAuthority, Collective, CollectiveError, CollectiveEvent, MockRule, ModelRef,
    Participant, ParticipantFilter, ParticipantKind, ParticipantStatus, PolicyMode, ToolPolicy,
};
pub use legion_config::{Limits, LimitsConfig, WorkspaceConfig};
pub use legion_core::{
    ChannelMedium, CommunicateTool, Communicator, Event, EventBus, LegionError, Medium,
    MediumRequest, ParentContext, ParticipantError, PendingApprovalStore, ResolveApprovalTool,
    ScriptedMedium, Session,
};
pub use legion_model::{
    AnthropicProvider, ChatMessage, ChatOptions, Completion, ContentBlock, EchoProvider,
    FinishReason, OpenAiProvider, Provider, ProviderError, Role, ScriptedProvider,
};
pub use legion_tools::{Decision, Tool, ToolContext, ToolError, ToolRegistry};

pub use legion_core::{ProviderFactory, SingleProvider};

use legion_core::{bind_communicator, communicator_slot};

/// The built-in human operator.
pub const BUILTIN_USER: &str = "user";
/// Bootstrap agent: designs new agents and workflows for the collective.
pub const BUILTIN_ARCHITECT: &str = "architect";
/// Bootstrap agent: maintains the collective registry itself.
pub const BUILTIN_STEWARD: &str = "steward";

const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Provider factory reading API keys from the environment.
struct EnvProviderFactory;

impl ProviderFactory for EnvProviderFactory {
    fn create(&self, model: &ModelRef) -> Result<Arc<dyn Provider>, LegionError> {
        match model.provider.as_str() {
            "anthropic" => Ok(Arc::new(AnthropicProvider::new(
                std::env::var("ANTHROPIC_API_KEY").ok(),
                None,
            ))),
            "openai" => Ok(Arc::new(OpenAiProvider::new(
                std::env::var("OPENAI_API_KEY").ok(),
                None,
            ))),
            "mock" => Ok(Arc::new(EchoProvider)),
            other => Err(LegionError::Provider(ProviderError::Transport(format!(
                "no adapter for provider '{other}'"
            )))),
        }
    }
}

/// Builder for a wired runtime.
pub struct LegionBuilder {
    config: WorkspaceConfig,
    default_model: ModelRef,
    providers: Option<Arc<dyn ProviderFactory>>,
    mediums: Vec<(String, Arc<dyn Medium>)>,
    tools: Vec<Arc<dyn Tool>>,
}

impl LegionBuilder {
    pub fn new(config: WorkspaceConfig) -> Self {
        Self {
            config,
            default_model: ModelRef::new("anthropic", DEFAULT_MODEL),
            providers: None,
            mediums: Vec::new(),
            tools: Vec::new(),
        }
    }

    /// Model reference given to the bootstrap agents.
    pub fn default_model(mut self, model: ModelRef) -> Self {
        self.default_model = model;
        self
    }

    /// Replace the environment-based provider factory (tests inject
    /// scripted providers here).
    pub fn provider_factory(mut self, factory: Arc<dyn ProviderFactory>) -> Self {
        self.providers = Some(factory);
        self
    }

    /// Register a medium under its tag ("terminal", "slack", …).
    pub fn medium(mut self, tag: impl Into<String>, medium: Arc<dyn Medium>) -> Self {
        self.mediums.push((tag.into(), medium));
        self
    }

    /// Add a tool beyond the two universal ones.
    pub fn tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    /// Wire everything.  Must be called within a tokio runtime (the
    /// collective-event forwarder is spawned here).
    pub fn build(self) -> anyhow::Result<Legion> {
        let collective = match &self.config.collective_dir {
            Some(dir) => Arc::new(Collective::with_pool(dir).context("loading collective pool")?),
            None => Arc::new(Collective::new()),
        };
        for builtin in builtin_participants(&self.default_model) {
            let id = builtin.id.clone();
            if collective.get(&id).is_none() {
                collective.save(builtin).context("saving built-in participant")?;
            }
            collective.protect(id);
        }

        let slot = communicator_slot();
        let mut registry = ToolRegistry::new();
        registry
            .register(CommunicateTool::new(slot.clone()))
            .context("registering communicate")?;
        registry
            .register(ResolveApprovalTool::new(slot.clone()))
            .context("registering resolve_approval")?;
        for tool in self.tools {
            let name = tool.name().to_string();
            registry
                .register_shared(tool)
                .with_context(|| format!("registering tool '{name}'"))?;
        }

        let session = match &self.config.sessions_dir {
            Some(dir) => Arc::new(Session::with_dir(dir).context("opening session dir")?),
            None => Arc::new(Session::new()),
        };

        let events = EventBus::new();
        let pending = Arc::new(PendingApprovalStore::new());
        let limits = Limits::default().with_overrides(&self.config.limits);
        let providers = self
            .providers
            .unwrap_or_else(|| Arc::new(EnvProviderFactory));

        let communicator = Communicator::new(
            collective.clone(),
            Arc::new(registry),
            session.clone(),
            providers,
            events.clone(),
            pending.clone(),
            limits,
        );
        bind_communicator(&slot, &communicator);
        for (tag, medium) in self.mediums {
            communicator.register_medium(tag, medium);
        }

        spawn_collective_forwarder(&collective, events.clone());

        Ok(Legion {
            collective,
            communicator,
            session,
            events,
            pending,
        })
    }
}

fn builtin_participants(model: &ModelRef) -> Vec<Participant> {
    vec![
        Participant::user(BUILTIN_USER, "Operator", "terminal")
            .with_description("The human operator of this collective"),
        Participant::agent(
            BUILTIN_ARCHITECT,
            "Architect",
            "You design this collective: propose new agents, their prompts, \
             tool grants, and policies. Communicate with the operator before \
             changing anything.",
            model.clone(),
        )
        .with_description("Designs new agents and workflows")
        .with_tools(["*"]),
        Participant::agent(
            BUILTIN_STEWARD,
            "Steward",
            "You maintain the collective registry: create, update, and retire \
             participants as the operator directs.",
            model.clone(),
        )
        .with_description("Maintains the collective registry")
        .with_tools(["*"]),
    ]
}

/// Forward registry change events onto the main bus.
fn spawn_collective_forwarder(collective: &Arc<Collective>, events: EventBus) {
    let mut rx = collective.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(CollectiveEvent::Saved(id)) | Ok(CollectiveEvent::Unretired(id)) => {
                    events.publish(Event::ParticipantSaved { id });
                }
                Ok(CollectiveEvent::Retired(id)) => {
                    events.publish(Event::ParticipantRetired { id });
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "collective event forwarder lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// A wired runtime: the outer loop's entry point into the collective.
pub struct Legion {
    collective: Arc<Collective>,
    communicator: Arc<Communicator>,
    session: Arc<Session>,
    events: EventBus,
    pending: Arc<PendingApprovalStore>,
}

impl Legion {
    pub fn builder(config: WorkspaceConfig) -> LegionBuilder {
        LegionBuilder::new(config)
    }

    /// Deliver a message in the default conversation and await the reply.
    pub async fn send(&self, from: &str, to: &str, message: &str) -> Result<String, LegionError> {
        self.communicator
            .send(from, to, message, None, ParentContext::default())
            .await
    }

    /// Deliver a message in a named conversation.
    pub async fn send_in(
        &self,
        from: &str,
        to: &str,
        message: &str,
        conversation: &str,
    ) -> Result<String, LegionError> {
        self.communicator
            .send(from, to, message, Some(conversation), ParentContext::default())
            .await
    }

    /// Resolve a parked approval request from outside the agent loop.
    pub async fn resolve_approval(
        &self,
        request_id: &str,
        decision: Decision,
    ) -> Result<String, LegionError> {
        self.communicator.resolve_approval(request_id, decision).await
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn collective(&self) -> &Arc<Collective> {
        &self.collective
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn communicator(&self) -> &Arc<Communicator> {
        &self.communicator
    }

    /// End the working unit: release parked approvals with rejections and
    /// persist + verify every conversation.
    pub fn close(&self) {
        let released = self.pending.release_all("session closed");
        if released > 0 {
            warn!(released, "rejected parked approval requests at close");
        }
        self.session.close();
    }
}
