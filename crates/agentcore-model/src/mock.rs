// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Deterministic mock providers for tests — no network access required.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::catalog::InputModality;
use crate::event::{channel, AssistantStreamEvent, EventStream};
use crate::provider::ModelProvider;
use crate::types::{AgentMessage, CompletionRequest, ContentBlock, ModelIdentity, StopReason, Usage};

/// Echoes the last user message back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find_map(|m| match m {
                AgentMessage::User { .. } => m.as_text(),
                _ => None,
            })
            .unwrap_or_else(|| "[no input]".to_string());

        let model = ModelIdentity { api: "mock".into(), provider: "mock".into(), id: "mock-model".into() };
        let events = text_reply_events(format!("MOCK: {reply}"), model);
        Ok(play_script(events))
    }
}

/// Build the canonical `Start → TextStart → TextDelta → TextEnd → Done`
/// sequence for a plain-text reply.
pub fn text_reply_events(text: impl Into<String>, model: ModelIdentity) -> Vec<AssistantStreamEvent> {
    let text = text.into();
    let partial = AgentMessage::Assistant {
        content: vec![],
        usage: Usage::default(),
        stop_reason: StopReason::Stop,
        error_message: None,
        model: model.clone(),
        timestamp: chrono::Utc::now(),
    };
    let usage = Usage { input: 5, output: 5, cache_read: 0, cache_write: 0, total_tokens: 10, cost: None };
    let message = AgentMessage::Assistant {
        content: vec![ContentBlock::text(text.clone())],
        usage,
        stop_reason: StopReason::Stop,
        error_message: None,
        model,
        timestamp: chrono::Utc::now(),
    };
    vec![
        AssistantStreamEvent::Start { partial },
        AssistantStreamEvent::TextStart { content_index: 0 },
        AssistantStreamEvent::TextDelta { content_index: 0, delta: text.clone() },
        AssistantStreamEvent::TextEnd { content_index: 0, content: text, signature: None },
        AssistantStreamEvent::Done { reason: StopReason::Stop, message },
    ]
}

/// Build the canonical sequence for a single tool call with no accompanying text.
pub fn tool_call_events(id: impl Into<String>, name: impl Into<String>, arguments: Value, model: ModelIdentity) -> Vec<AssistantStreamEvent> {
    let id = id.into();
    let name = name.into();
    let partial = AgentMessage::Assistant {
        content: vec![],
        usage: Usage::default(),
        stop_reason: StopReason::Stop,
        error_message: None,
        model: model.clone(),
        timestamp: chrono::Utc::now(),
    };
    let message = AgentMessage::Assistant {
        content: vec![ContentBlock::tool_call(id.clone(), name.clone(), arguments.clone())],
        usage: Usage { input: 5, output: 5, cache_read: 0, cache_write: 0, total_tokens: 10, cost: None },
        stop_reason: StopReason::ToolUse,
        error_message: None,
        model,
        timestamp: chrono::Utc::now(),
    };
    vec![
        AssistantStreamEvent::Start { partial },
        AssistantStreamEvent::ToolCallStart { content_index: 0, id: id.clone(), name: name.clone() },
        AssistantStreamEvent::ToolCallEnd { content_index: 0, tool_call: (id, name, arguments) },
        AssistantStreamEvent::Done { reason: StopReason::ToolUse, message },
    ]
}

/// Feed a pre-built event sequence through a real channel, matching the
/// backpressure behavior every live provider exhibits.
fn play_script(events: Vec<AssistantStreamEvent>) -> EventStream {
    let (sink, stream) = channel();
    tokio::spawn(async move {
        for ev in events {
            if !sink.send(ev).await {
                return;
            }
        }
    });
    stream
}

/// A pre-scripted mock provider. Each call to `stream` pops the next script
/// from the front of the queue, letting tests drive exact event sequences —
/// including tool calls — across multiple agent-loop turns.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<Vec<AssistantStreamEvent>>>>,
    name: String,
    modalities: Vec<InputModality>,
    /// The last `CompletionRequest` seen by this provider, for assertions.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedMockProvider {
    pub fn new(scripts: Vec<Vec<AssistantStreamEvent>>) -> Self {
        Self { scripts: Arc::new(Mutex::new(scripts)), name: "scripted-mock".into(), modalities: vec![InputModality::Text], last_request: Arc::new(Mutex::new(None)) }
    }

    /// Declare that this mock supports image input as well as text, so
    /// `strip_images_if_unsupported` does not strip images before they
    /// reach it.
    pub fn with_vision(mut self) -> Self {
        self.modalities = vec![InputModality::Text, InputModality::Image];
        self
    }

    fn model_identity(&self) -> ModelIdentity {
        ModelIdentity { api: "mock".into(), provider: self.name.clone(), id: "scripted-mock-model".into() }
    }

    pub fn always_text(reply: impl Into<String>) -> Self {
        let model = ModelIdentity { api: "mock".into(), provider: "scripted-mock".into(), id: "scripted-mock-model".into() };
        Self::new(vec![text_reply_events(reply, model)])
    }

    /// Provider that returns a tool call, then (once the loop feeds the
    /// result back) a closing text reply.
    pub fn tool_then_text(tool_id: impl Into<String>, tool_name: impl Into<String>, args: Value, final_text: impl Into<String>) -> Self {
        let model = ModelIdentity { api: "mock".into(), provider: "scripted-mock".into(), id: "scripted-mock-model".into() };
        Self::new(vec![tool_call_events(tool_id, tool_name, args, model.clone()), text_reply_events(final_text, model)])
    }
}

#[async_trait]
impl ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        &self.name
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    fn input_modalities(&self) -> Vec<InputModality> {
        self.modalities.clone()
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        *self.last_request.lock().unwrap() = Some(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                text_reply_events("[no more scripts]", self.model_identity())
            } else {
                scripts.remove(0)
            }
        };
        Ok(play_script(events))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn empty_req() -> CompletionRequest {
        CompletionRequest {
            model: crate::types::ModelDescriptor {
                api: "mock".into(),
                provider: "mock".into(),
                id: "mock-model".into(),
                base_url: String::new(),
                max_tokens: 4096,
                context_window: 100_000,
                input_text: true,
                input_image: false,
                reasoning: false,
                headers: Default::default(),
            },
            messages: vec![AgentMessage::user("hi")],
            tools: vec![],
            options: Default::default(),
            system_dynamic_suffix: None,
        }
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let p = MockProvider;
        let mut stream = p.stream(empty_req()).await.unwrap();
        let mut last_text = None;
        while let Some(ev) = stream.recv().await {
            if let AssistantStreamEvent::Done { message, .. } = ev {
                last_text = message.as_text();
                break;
            }
        }
        assert_eq!(last_text.as_deref(), Some("MOCK: hi"));
    }

    #[tokio::test]
    async fn scripted_single_text_reply() {
        let p = ScriptedMockProvider::always_text("hello world");
        let mut stream = p.stream(empty_req()).await.unwrap();
        while let Some(ev) = stream.recv().await {
            if let AssistantStreamEvent::Done { message, .. } = ev {
                assert_eq!(message.as_text().as_deref(), Some("hello world"));
                return;
            }
        }
        panic!("stream ended before Done");
    }

    #[tokio::test]
    async fn scripted_tool_then_text_two_rounds() {
        let p = ScriptedMockProvider::tool_then_text("call-1", "shell", json!({"command": "ls"}), "done");

        let mut stream = p.stream(empty_req()).await.unwrap();
        let mut saw_tool_call = false;
        while let Some(ev) = stream.recv().await {
            if let AssistantStreamEvent::Done { message, .. } = ev {
                saw_tool_call = message.tool_calls().iter().any(|(_, name, _)| name == "shell");
                break;
            }
        }
        assert!(saw_tool_call);

        let mut stream2 = p.stream(empty_req()).await.unwrap();
        while let Some(ev) = stream2.recv().await {
            if let AssistantStreamEvent::Done { message, .. } = ev {
                assert_eq!(message.as_text().as_deref(), Some("done"));
                return;
            }
        }
        panic!("stream ended before Done");
    }

    #[tokio::test]
    async fn scripted_fallback_when_scripts_exhausted() {
        let p = ScriptedMockProvider::new(vec![]);
        let mut stream = p.stream(empty_req()).await.unwrap();
        while let Some(ev) = stream.recv().await {
            if let AssistantStreamEvent::Done { message, .. } = ev {
                assert!(message.as_text().unwrap().contains("no more scripts"));
                return;
            }
        }
        panic!("stream ended before Done");
    }

    #[tokio::test]
    async fn scripted_records_last_request() {
        let p = ScriptedMockProvider::always_text("hi");
        let req = empty_req();
        let _ = p.stream(req).await.unwrap();
        assert!(p.last_request.lock().unwrap().is_some());
    }
}
