// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The agent facade (C6, §4.6): a single-session, single-flight wrapper
//! around the loop (C5) that tracks live state, fans events out to any
//! number of subscribers, and exposes steering/follow-up queues.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use agentcore_credentials::{no_refresher, CredentialStore};
use agentcore_model::{AgentMessage, CompletionOptions, ModelProvider, ReasoningLevel, StopReason};
use agentcore_session::{SessionEntry, SessionStore};
use agentcore_tools::ToolRegistry;

use crate::agent_loop::{agent_loop, agent_loop_continue, AgentLoopConfig, LoopHooks};
use crate::events::AgentEvent;
use crate::retry::RetryConfig;

/// How a queue releases its contents to the next turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeuePolicy {
    /// Hand back everything queued since the last drain, in order.
    All,
    /// Hand back one message per drain, leaving the rest queued.
    OneAtATime,
}

struct MessageQueue {
    policy: DequeuePolicy,
    items: VecDeque<AgentMessage>,
}

impl MessageQueue {
    fn new(policy: DequeuePolicy) -> Self {
        Self { policy, items: VecDeque::new() }
    }

    fn push(&mut self, message: AgentMessage) {
        self.items.push_back(message);
    }

    fn drain(&mut self) -> Vec<AgentMessage> {
        match self.policy {
            DequeuePolicy::All => self.items.drain(..).collect(),
            DequeuePolicy::OneAtATime => self.items.pop_front().into_iter().collect(),
        }
    }

    fn clear(&mut self) {
        self.items.clear();
    }
}

#[derive(Debug, Clone)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Live state mirrored from the event stream of the run currently (or most
/// recently) in flight.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub messages: Vec<AgentMessage>,
    pub is_streaming: bool,
    pub stream_message: Option<AgentMessage>,
    pub pending_tool_calls: Vec<PendingToolCall>,
    pub error: Option<String>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self { messages: Vec::new(), is_streaming: false, stream_message: None, pending_tool_calls: Vec::new(), error: None }
    }
}

/// The full state a subscriber (a TUI, a test) would render — configuration
/// fields plus the live [`AgentState`].
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub system_prompt: Option<String>,
    pub thinking_level: ReasoningLevel,
    pub tools: Vec<String>,
    pub messages: Vec<AgentMessage>,
    pub is_streaming: bool,
    pub stream_message: Option<AgentMessage>,
    pub pending_tool_calls: Vec<PendingToolCall>,
    pub error: Option<String>,
}

struct AgentHooks {
    steering: Arc<StdMutex<MessageQueue>>,
    follow_up: Arc<StdMutex<MessageQueue>>,
    credentials: Option<Arc<CredentialStore>>,
    provider_name: String,
    api_key_override: Option<String>,
}

#[async_trait]
impl LoopHooks for AgentHooks {
    fn convert_to_llm(&self, messages: &[AgentMessage]) -> Vec<AgentMessage> {
        messages.to_vec()
    }

    async fn get_api_key(&self) -> anyhow::Result<Option<String>> {
        // A per-agent override already sits in `base_options.api_key`; only
        // consult the credential store when there is none, so an explicit
        // `with_api_key` always wins over a stored/refreshed credential.
        if self.api_key_override.is_some() {
            return Ok(None);
        }
        match &self.credentials {
            Some(store) => Ok(store.resolve(&self.provider_name, None, &no_refresher(), None).await?),
            None => Ok(None),
        }
    }

    fn get_steering_messages(&self) -> Vec<AgentMessage> {
        self.steering.lock().unwrap().drain()
    }

    fn get_follow_up_messages(&self) -> Vec<AgentMessage> {
        self.follow_up.lock().unwrap().drain()
    }
}

fn event_handler(state: Arc<StdMutex<AgentState>>, events: broadcast::Sender<AgentEvent>) -> impl Fn(AgentEvent) + Send + Sync + 'static {
    move |event: AgentEvent| {
        {
            let mut s = state.lock().unwrap();
            match &event {
                AgentEvent::AgentStart => {
                    s.is_streaming = true;
                    s.error = None;
                }
                AgentEvent::AgentEnd { .. } => {
                    s.is_streaming = false;
                    s.stream_message = None;
                }
                AgentEvent::MessageStart { message } | AgentEvent::MessageUpdate { message, .. } => {
                    s.stream_message = Some(message.clone());
                }
                AgentEvent::MessageEnd { message } => {
                    s.stream_message = None;
                    if let AgentMessage::Assistant { stop_reason: StopReason::Error, error_message, .. } = message {
                        s.error = error_message.clone();
                    }
                    s.messages.push(message.clone());
                }
                AgentEvent::TurnEnd { tool_results, .. } => {
                    s.messages.extend(tool_results.clone());
                }
                AgentEvent::ToolExecutionStart { tool_call_id, tool_name, args } => {
                    s.pending_tool_calls.push(PendingToolCall { id: tool_call_id.clone(), name: tool_name.clone(), args: args.clone() });
                }
                AgentEvent::ToolExecutionEnd { tool_call_id, .. } => {
                    s.pending_tool_calls.retain(|c| &c.id != tool_call_id);
                }
                _ => {}
            }
        }
        // A lagging/absent subscriber is not an error — there may be none yet.
        let _ = events.send(event);
    }
}

fn persist_new_messages(session: &Arc<StdMutex<SessionStore>>, messages: &[AgentMessage]) {
    let mut store = session.lock().unwrap();
    for message in messages {
        let entry = SessionEntry::Message {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
            timestamp: chrono::Utc::now(),
            message: message.clone(),
        };
        if let Err(err) = store.append(entry) {
            tracing::warn!(error = %err, "failed to persist message to session store");
        }
    }
}

/// A single conversational agent: one provider, one tool registry, one
/// conversation history, driven one run (`prompt`/`continue_`) at a time.
pub struct Agent {
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    retry: RetryConfig,
    system_prompt: Option<String>,
    thinking_level: ReasoningLevel,
    api_key_override: Option<String>,
    credentials: Option<Arc<CredentialStore>>,
    session: Option<Arc<StdMutex<SessionStore>>>,
    state: Arc<StdMutex<AgentState>>,
    events: broadcast::Sender<AgentEvent>,
    steering: Arc<StdMutex<MessageQueue>>,
    follow_up: Arc<StdMutex<MessageQueue>>,
    cancel: Arc<StdMutex<CancellationToken>>,
    running: AsyncMutex<Option<JoinHandle<Vec<AgentMessage>>>>,
}

impl Agent {
    pub fn new(provider: Arc<dyn ModelProvider>, tools: Arc<ToolRegistry>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            provider,
            tools,
            retry: RetryConfig::default(),
            system_prompt: None,
            thinking_level: ReasoningLevel::Off,
            api_key_override: None,
            credentials: None,
            session: None,
            state: Arc::new(StdMutex::new(AgentState::default())),
            events,
            steering: Arc::new(StdMutex::new(MessageQueue::new(DequeuePolicy::All))),
            follow_up: Arc::new(StdMutex::new(MessageQueue::new(DequeuePolicy::OneAtATime))),
            cancel: Arc::new(StdMutex::new(CancellationToken::new())),
            running: AsyncMutex::new(None),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_thinking_level(mut self, level: ReasoningLevel) -> Self {
        self.thinking_level = level;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key_override = Some(key.into());
        self
    }

    /// Resolve the provider's API key through a [`CredentialStore`] when no
    /// per-call override is set, instead of requiring `with_api_key` up
    /// front. Takes the full precedence order (§4.7) into account on every
    /// run, so a stored key refreshed between runs is picked up without
    /// rebuilding the agent.
    pub fn with_credentials(mut self, store: Arc<CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    /// Persist every new message a run produces to a session store (§4.8).
    /// Only messages beyond the history already on disk when the run
    /// started are appended, so replaying a reopened session never
    /// double-writes its own history back to itself.
    pub fn with_session(mut self, store: Arc<StdMutex<SessionStore>>) -> Self {
        self.session = Some(store);
        self
    }

    pub fn with_steering_policy(self, policy: DequeuePolicy) -> Self {
        self.steering.lock().unwrap().policy = policy;
        self
    }

    pub fn with_follow_up_policy(self, policy: DequeuePolicy) -> Self {
        self.follow_up.lock().unwrap().policy = policy;
        self
    }

    /// Subscribe to the agent-level event stream (§4.1). Each subscriber
    /// gets every event from the point of subscription onward.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        let s = self.state.lock().unwrap();
        AgentSnapshot {
            system_prompt: self.system_prompt.clone(),
            thinking_level: self.thinking_level,
            tools: self.tools.names(),
            messages: s.messages.clone(),
            is_streaming: s.is_streaming,
            stream_message: s.stream_message.clone(),
            pending_tool_calls: s.pending_tool_calls.clone(),
            error: s.error.clone(),
        }
    }

    /// Queue a steering message. Injected at the next opportunity — even
    /// mid-tool-phase of the run currently in flight — ahead of anything
    /// else (§4.5, §9: steering takes priority over follow-up).
    pub fn steer(&self, text: impl Into<String>) {
        self.steering.lock().unwrap().push(AgentMessage::user(text));
    }

    /// Queue a follow-up message, delivered only once the current run would
    /// otherwise stop with no steering pending.
    pub fn follow_up(&self, text: impl Into<String>) {
        self.follow_up.lock().unwrap().push(AgentMessage::user(text));
    }

    /// Signal cancellation to the run in flight, if any. The loop commits
    /// whatever partial assistant message it has and stops; it does not
    /// throw.
    pub fn abort(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    /// Await the run currently in flight, if any.
    pub async fn wait_for_idle(&self) {
        let handle = self.running.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn completion_options(&self) -> CompletionOptions {
        CompletionOptions { api_key: self.api_key_override.clone(), reasoning: self.thinking_level, ..CompletionOptions::default() }
    }

    fn hooks(&self) -> Arc<dyn LoopHooks> {
        Arc::new(AgentHooks {
            steering: self.steering.clone(),
            follow_up: self.follow_up.clone(),
            credentials: self.credentials.clone(),
            provider_name: self.provider.name().to_string(),
            api_key_override: self.api_key_override.clone(),
        })
    }

    async fn spawn_run<F, Fut>(&self, baseline_len: usize, run: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Vec<AgentMessage>> + Send + 'static,
    {
        let state_for_final = self.state.clone();
        let session = self.session.clone();
        let handle = tokio::spawn(async move {
            let messages = run().await;
            state_for_final.lock().unwrap().messages = messages.clone();
            if let Some(session) = session {
                persist_new_messages(&session, &messages[baseline_len.min(messages.len())..]);
            }
            messages
        });
        *self.running.lock().await = Some(handle);
    }

    /// Start a fresh turn: append `text` as a user message and drive the
    /// loop until it stops. Waits for any run already in flight first —
    /// this facade is single-flight; use [`Agent::steer`] to interrupt a
    /// running turn instead of racing a second `prompt`.
    pub async fn prompt(&self, text: impl Into<String>) {
        self.wait_for_idle().await;

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = cancel.clone();

        let provider = self.provider.clone();
        let hooks = self.hooks();
        let config = AgentLoopConfig { tools: self.tools.clone(), retry: self.retry.clone() };
        let history = self.state.lock().unwrap().messages.clone();
        let baseline_len = history.len();
        let system_prompt = self.system_prompt.clone();
        let options = self.completion_options();
        let prompt_message = AgentMessage::user(text);
        let handler = event_handler(self.state.clone(), self.events.clone());

        self.spawn_run(baseline_len, move || {
            agent_loop(provider, hooks, config, history, prompt_message, system_prompt, options, cancel, handler)
        })
        .await;
    }

    /// Resume the existing history without adding a new user message — e.g.
    /// after a session was reopened with pending follow-up messages queued.
    pub async fn continue_(&self) {
        self.wait_for_idle().await;

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = cancel.clone();

        let provider = self.provider.clone();
        let hooks = self.hooks();
        let config = AgentLoopConfig { tools: self.tools.clone(), retry: self.retry.clone() };
        let messages = self.state.lock().unwrap().messages.clone();
        let baseline_len = messages.len();
        let system_prompt = self.system_prompt.clone();
        let options = self.completion_options();
        let handler = event_handler(self.state.clone(), self.events.clone());

        self.spawn_run(baseline_len, move || {
            agent_loop_continue(provider, hooks, config, messages, system_prompt, options, cancel, handler)
        })
        .await;
    }

    /// Clear conversation history and both queues. Refuses while a run is
    /// in flight to avoid racing the background task's final state write.
    pub fn reset(&self) -> anyhow::Result<()> {
        if self.running.try_lock().is_err() {
            anyhow::bail!("cannot reset while a run is in flight; call wait_for_idle() or abort() first");
        }
        *self.state.lock().unwrap() = AgentState::default();
        self.steering.lock().unwrap().clear();
        self.follow_up.lock().unwrap().clear();
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use agentcore_model::ScriptedMockProvider;

    use super::*;

    fn agent_with_reply(text: &str) -> Agent {
        let provider: Arc<dyn ModelProvider> = Arc::new(ScriptedMockProvider::always_text(text));
        Agent::new(provider, Arc::new(ToolRegistry::new()))
    }

    #[tokio::test]
    async fn prompt_updates_snapshot_messages_and_clears_streaming_flag() {
        let agent = agent_with_reply("hello");
        agent.prompt("hi").await;
        agent.wait_for_idle().await;

        let snap = agent.snapshot();
        assert!(!snap.is_streaming);
        assert_eq!(snap.messages.len(), 2);
        assert_eq!(snap.messages.last().unwrap().as_text().as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn subscribe_receives_agent_start_and_end() {
        let agent = agent_with_reply("hello");
        let mut rx = agent.subscribe();
        agent.prompt("hi").await;
        agent.wait_for_idle().await;

        let mut saw_start = false;
        let mut saw_end = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                AgentEvent::AgentStart => saw_start = true,
                AgentEvent::AgentEnd { .. } => saw_end = true,
                _ => {}
            }
        }
        assert!(saw_start && saw_end);
    }

    #[tokio::test]
    async fn steer_message_is_picked_up_on_next_turn_after_tool_use() {
        let provider: Arc<dyn ModelProvider> =
            Arc::new(ScriptedMockProvider::tool_then_text("c1", "noop", serde_json::json!({}), "done"));
        let agent = Agent::new(provider, Arc::new(ToolRegistry::new()));
        agent.steer("look at this too");
        agent.prompt("go").await;
        agent.wait_for_idle().await;

        let snap = agent.snapshot();
        // user "go", assistant tool-call, tool error (unregistered "noop"),
        // and onward — the steering message must at least have been drained
        // from the queue by the time the run completes.
        assert!(snap.messages.len() >= 3);
    }

    #[tokio::test]
    async fn reset_clears_history_and_queues_once_idle() {
        let agent = agent_with_reply("hello");
        agent.prompt("hi").await;
        agent.wait_for_idle().await;
        agent.follow_up("queued");

        agent.reset().unwrap();

        let snap = agent.snapshot();
        assert!(snap.messages.is_empty());
        assert!(agent.follow_up.lock().unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn abort_with_no_run_in_flight_is_a_harmless_no_op() {
        let agent = agent_with_reply("hello");
        agent.abort();
        agent.prompt("hi").await;
        agent.wait_for_idle().await;

        let snap = agent.snapshot();
        assert!(!snap.is_streaming);
    }

    #[tokio::test]
    async fn credential_store_key_is_sent_when_no_override_is_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = agentcore_credentials::CredentialStore::new(dir.path().join("auth.json"));
        store.store_api_key("scripted-mock", "stored-key").unwrap();

        let provider = Arc::new(ScriptedMockProvider::always_text("hello"));
        let agent = Agent::new(provider.clone(), Arc::new(ToolRegistry::new()))
            .with_credentials(Arc::new(store));
        agent.prompt("hi").await;
        agent.wait_for_idle().await;

        let sent = provider.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(sent.options.api_key.as_deref(), Some("stored-key"));
    }

    #[tokio::test]
    async fn explicit_api_key_override_wins_over_credential_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = agentcore_credentials::CredentialStore::new(dir.path().join("auth.json"));
        store.store_api_key("scripted-mock", "stored-key").unwrap();

        let provider = Arc::new(ScriptedMockProvider::always_text("hello"));
        let agent = Agent::new(provider.clone(), Arc::new(ToolRegistry::new()))
            .with_credentials(Arc::new(store))
            .with_api_key("override-key");
        agent.prompt("hi").await;
        agent.wait_for_idle().await;

        let sent = provider.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(sent.options.api_key.as_deref(), Some("override-key"));
    }

    #[tokio::test]
    async fn prompt_persists_new_messages_to_the_session_store() {
        let dir = tempfile::tempdir().unwrap();
        let session = agentcore_session::SessionStore::create("/work", dir.path()).unwrap();
        let session = Arc::new(StdMutex::new(session));

        let agent = agent_with_reply("hello").with_session(session.clone());
        agent.prompt("hi").await;
        agent.wait_for_idle().await;

        let leaf = session.lock().unwrap().leaf().map(str::to_string);
        assert!(leaf.is_some(), "the run's messages should have been appended");
    }
}
