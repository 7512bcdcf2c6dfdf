// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared driver for OpenAI-compatible `/chat/completions` APIs.
//!
//! Several provider families speak the same wire format: OpenAI's own
//! chat-completions models, Groq, xAI, and local servers (Ollama, llama.cpp,
//! vLLM). This module provides one `OpenAICompatProvider` that every such
//! driver configures with its own base URL, auth style, and extra body
//! fields; `registry.rs` picks the concrete configuration per provider id.
//!
//! # Auth styles
//! - `Bearer` — `Authorization: Bearer <key>` (most providers)
//! - `ApiKeyHeader` — `api-key: <key>` (Azure OpenAI)
//! - `None` — no authentication (local servers)

use std::collections::BTreeMap;

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::debug;

use crate::catalog::{static_catalog, InputModality, ModelCatalogEntry};
use crate::event::{channel, AssistantStreamEvent, EventSink, EventStream, StreamErrorReason};
use crate::provider::ModelProvider;
use crate::sanitize::apply_universal_transforms;
use crate::types::{AgentMessage, CompletionRequest, ContentBlock, ModelIdentity, StopReason, Usage};

/// How to send the API key in HTTP requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStyle {
    Bearer,
    ApiKeyHeader,
    None,
}

pub struct OpenAICompatProvider {
    driver_name: &'static str,
    model: String,
    api_key: Option<String>,
    chat_url: String,
    models_url: Option<String>,
    client: reqwest::Client,
    extra_headers: Vec<(String, String)>,
    auth_style: AuthStyle,
    /// Extra key-value pairs merged verbatim into the request body, e.g.
    /// `reasoning_format` for llama.cpp or `parse_tool_calls: false`.
    extra_body: Value,
}

impl OpenAICompatProvider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        extra_headers: Vec<(String, String)>,
        auth_style: AuthStyle,
        extra_body: Value,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name,
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            models_url: Some(format!("{base}/models")),
            client: reqwest::Client::new(),
            extra_headers,
            auth_style,
            extra_body,
        }
    }

    /// Build a provider from a pre-built chat completions URL, for drivers
    /// (e.g. Azure OpenAI) whose deployment name/API version live in the
    /// path or query rather than a clean `{base}/chat/completions` join.
    #[allow(clippy::too_many_arguments)]
    pub fn with_full_chat_url(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        chat_url: impl Into<String>,
        extra_headers: Vec<(String, String)>,
        auth_style: AuthStyle,
        extra_body: Value,
    ) -> Self {
        Self {
            driver_name,
            model,
            api_key,
            chat_url: chat_url.into(),
            models_url: None,
            client: reqwest::Client::new(),
            extra_headers,
            auth_style,
            extra_body,
        }
    }

    fn apply_auth(&self, mut req: reqwest::RequestBuilder) -> anyhow::Result<reqwest::RequestBuilder> {
        req = match self.auth_style {
            AuthStyle::Bearer => {
                let key = self.api_key.as_deref().context("API key not set for this provider")?;
                req.bearer_auth(key)
            }
            AuthStyle::ApiKeyHeader => {
                let key = self.api_key.as_deref().context("API key not set for this provider")?;
                req.header("api-key", key)
            }
            AuthStyle::None => req,
        };
        for (name, val) in &self.extra_headers {
            req = req.header(name.as_str(), val.as_str());
        }
        Ok(req)
    }

    fn build_body(&self, req: &CompletionRequest) -> Value {
        let mut modalities = vec![InputModality::Text];
        if req.model.input_image {
            modalities.push(InputModality::Image);
        }
        let mut messages = apply_universal_transforms(req.messages.clone(), &modalities);
        if let Some(suffix) = &req.system_dynamic_suffix {
            append_system_suffix(&mut messages, suffix);
        }
        let wire_messages = build_openai_messages(&messages);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| json!({ "type": "function", "function": { "name": t.name, "description": t.description, "parameters": t.parameters } }))
            .collect();

        // gpt-5/o1/o3 only accept the implicit default temperature and use a
        // differently named output-token-limit field.
        let is_reasoning_model =
            self.driver_name == "openai" && (self.model.starts_with("o1-") || self.model.starts_with("o3-") || self.model.starts_with("gpt-5"));
        let max_tokens_key = if self.driver_name == "openai" { "max_completion_tokens" } else { "max_tokens" };

        let mut body = json!({
            "model": self.model,
            "messages": wire_messages,
            "stream": true,
            max_tokens_key: req.options.max_tokens.unwrap_or(4096),
            "stream_options": { "include_usage": true },
        });
        if !is_reasoning_model {
            body["temperature"] = json!(req.options.temperature.unwrap_or(0.2));
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        if let Some(map) = self.extra_body.as_object() {
            for (k, v) in map {
                body[k] = v.clone();
            }
        }
        body
    }
}

fn append_system_suffix(messages: &mut [AgentMessage], suffix: &str) {
    for m in messages.iter_mut() {
        if let AgentMessage::Custom(v) = m {
            if v.get("kind").and_then(|k| k.as_str()) == Some("system") {
                if let Some(text) = v.get("text").and_then(|t| t.as_str()) {
                    let combined = format!("{text}\n\n{suffix}");
                    *v = json!({ "kind": "system", "text": combined });
                }
                return;
            }
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAICompatProvider {
    fn name(&self) -> &str {
        self.driver_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelCatalogEntry>> {
        let catalog_entries: Vec<ModelCatalogEntry> =
            static_catalog().into_iter().filter(|e| e.provider == self.driver_name).collect();

        let Some(url) = &self.models_url else { return Ok(catalog_entries) };
        let Some(key) = &self.api_key else { return Ok(catalog_entries) };

        let mut req = self.client.get(url);
        req = match self.auth_style {
            AuthStyle::Bearer => req.bearer_auth(key),
            AuthStyle::ApiKeyHeader => req.header("api-key", key),
            AuthStyle::None => req,
        };
        for (name, val) in &self.extra_headers {
            req = req.header(name.as_str(), val.as_str());
        }

        let Ok(resp) = req.send().await else { return Ok(catalog_entries) };
        if !resp.status().is_success() {
            return Ok(catalog_entries);
        }
        let Ok(body) = resp.json::<Value>().await else { return Ok(catalog_entries) };

        let mut entries: Vec<ModelCatalogEntry> = Vec::new();
        if let Some(data) = body["data"].as_array() {
            for item in data {
                let Some(id) = item["id"].as_str() else { continue };
                match catalog_entries.iter().find(|e| e.id == id) {
                    Some(cat) => entries.push(cat.clone()),
                    None => entries.push(ModelCatalogEntry {
                        id: id.to_string(),
                        name: id.to_string(),
                        provider: self.driver_name.to_string(),
                        context_window: 0,
                        max_output_tokens: 0,
                        description: String::new(),
                        input_modalities: vec![InputModality::Text],
                        reasoning: false,
                        prices: Default::default(),
                    }),
                }
            }
        }
        if entries.is_empty() {
            return Ok(catalog_entries);
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        let body = self.build_body(&req);
        debug!(driver = self.driver_name, model = %self.model, "sending chat completion request");

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        http_req = self.apply_auth(http_req)?;

        let resp = http_req.send().await.with_context(|| format!("{} request failed", self.driver_name))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            if crate::overflow::is_overflow_status(status.as_u16(), text.is_empty()) || crate::overflow::is_overflow_message(&text) {
                bail!("{} overflow: {status} {text}", self.driver_name);
            }
            bail!("{} error {status}: {text}", self.driver_name);
        }

        let model_identity = ModelIdentity { api: "openai-chat".into(), provider: self.driver_name.to_string(), id: self.model.clone() };
        let (sink, stream) = channel();
        tokio::spawn(drive_events(resp.bytes_stream(), sink, model_identity));
        Ok(stream)
    }
}

/// Per-tool-call streaming state, keyed by the wire `index` field.
#[derive(Default)]
struct ToolCallAccum {
    id: String,
    name: String,
    args_buf: String,
}

async fn drive_events(mut byte_stream: impl Stream<Item = reqwest::Result<Bytes>> + Unpin, sink: EventSink, model: ModelIdentity) {
    let mut line_buf = String::new();
    let mut text = String::new();
    let mut text_idx: Option<usize> = None;
    let mut thinking = String::new();
    let mut thinking_idx: Option<usize> = None;
    let mut tool_order: Vec<u32> = Vec::new();
    let mut tools: BTreeMap<u32, ToolCallAccum> = BTreeMap::new();
    let mut usage = Usage::default();
    let mut stop_reason = StopReason::Stop;
    let mut sent_start = false;

    macro_rules! emit {
        ($ev:expr) => {
            if !sink.send($ev).await {
                return;
            }
        };
    }
    macro_rules! ensure_start {
        () => {
            if !sent_start {
                sent_start = true;
                emit!(AssistantStreamEvent::Start {
                    partial: AgentMessage::Assistant {
                        content: vec![],
                        usage: Usage::default(),
                        stop_reason: StopReason::Stop,
                        error_message: None,
                        model: model.clone(),
                        timestamp: chrono::Utc::now(),
                    }
                });
            }
        };
    }

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                emit!(AssistantStreamEvent::Error { reason: StreamErrorReason::Error, error: e.to_string() });
                return;
            }
        };
        line_buf.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(nl) = line_buf.find('\n') {
            let line = line_buf[..nl].trim_end_matches('\r').to_string();
            line_buf = line_buf[nl + 1..].to_string();
            let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else { continue };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                ensure_start!();
                let mut content = Vec::new();
                if let Some(idx) = thinking_idx {
                    emit!(AssistantStreamEvent::ThinkingEnd { content_index: idx, content: thinking.clone(), signature: None });
                    content.push(ContentBlock::Thinking { thinking: thinking.clone(), thinking_signature: None });
                }
                if let Some(idx) = text_idx {
                    emit!(AssistantStreamEvent::TextEnd { content_index: idx, content: text.clone(), signature: None });
                    content.push(ContentBlock::text(text.clone()));
                }
                for key in &tool_order {
                    let Some(t) = tools.get(key) else { continue };
                    let args = crate::partial_json::parse(&t.args_buf);
                    let idx = content.len();
                    emit!(AssistantStreamEvent::ToolCallEnd { content_index: idx, tool_call: (t.id.clone(), t.name.clone(), args.clone()) });
                    content.push(ContentBlock::tool_call(t.id.clone(), t.name.clone(), args));
                }
                usage.total_tokens = usage.input + usage.output + usage.cache_read + usage.cache_write;
                let message = AgentMessage::Assistant {
                    content,
                    usage,
                    stop_reason,
                    error_message: None,
                    model: model.clone(),
                    timestamp: chrono::Utc::now(),
                };
                emit!(AssistantStreamEvent::Done { reason: stop_reason, message });
                return;
            }

            let Ok(v) = serde_json::from_str::<Value>(data) else { continue };
            ensure_start!();

            if let Some(u) = v.get("usage").filter(|u| !u.is_null()) {
                usage.input = u["prompt_tokens"].as_u64().unwrap_or(0) as u32;
                usage.output = u["completion_tokens"].as_u64().unwrap_or(0) as u32;
                usage.cache_read = u
                    .get("prompt_tokens_details")
                    .and_then(|d| d.get("cached_tokens"))
                    .and_then(|t| t.as_u64())
                    .or_else(|| u.get("prompt_cache_hit_tokens").and_then(|t| t.as_u64()))
                    .unwrap_or(0) as u32;
                continue;
            }

            let choice = &v["choices"][0];
            if let Some(reason) = choice["finish_reason"].as_str() {
                stop_reason = map_finish_reason(reason);
            }
            let delta = &choice["delta"];

            if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
                for tc in tool_calls {
                    let index = tc["index"].as_u64().unwrap_or(0) as u32;
                    if !tools.contains_key(&index) {
                        tool_order.push(index);
                        tools.insert(index, ToolCallAccum::default());
                        emit!(AssistantStreamEvent::ToolCallStart {
                            content_index: tool_order.len() - 1,
                            id: tc["id"].as_str().unwrap_or_default().to_string(),
                            name: tc["function"]["name"].as_str().unwrap_or_default().to_string(),
                        });
                    }
                    let entry = tools.get_mut(&index).unwrap();
                    if let Some(id) = tc["id"].as_str().filter(|s| !s.is_empty()) {
                        entry.id = id.to_string();
                    }
                    if let Some(name) = tc["function"]["name"].as_str().filter(|s| !s.is_empty()) {
                        entry.name = name.to_string();
                    }
                    if let Some(frag) = tc["function"]["arguments"].as_str() {
                        entry.args_buf.push_str(frag);
                        if !frag.is_empty() {
                            emit!(AssistantStreamEvent::ToolCallDelta { content_index: index as usize, delta: frag.to_string() });
                        }
                    }
                }
                continue;
            }

            let thinking_delta = delta
                .get("reasoning_content")
                .and_then(|c| c.as_str())
                .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
            if let Some(t) = thinking_delta.filter(|t| !t.is_empty()) {
                if thinking_idx.is_none() {
                    thinking_idx = Some(0);
                    emit!(AssistantStreamEvent::ThinkingStart { content_index: 0 });
                }
                thinking.push_str(t);
                emit!(AssistantStreamEvent::ThinkingDelta { content_index: 0, delta: t.to_string() });
                continue;
            }

            if let Some(t) = delta.get("content").and_then(|c| c.as_str()) {
                if text_idx.is_none() && !t.is_empty() {
                    text_idx = Some(thinking_idx.map(|_| 1).unwrap_or(0));
                    emit!(AssistantStreamEvent::TextStart { content_index: text_idx.unwrap() });
                }
                if let Some(idx) = text_idx {
                    text.push_str(t);
                    if !t.is_empty() {
                        emit!(AssistantStreamEvent::TextDelta { content_index: idx, delta: t.to_string() });
                    }
                }
            }
        }
    }
}

fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "stop" => StopReason::Stop,
        "length" => StopReason::Length,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "content_filter" => StopReason::Error,
        _ => StopReason::Stop,
    }
}

/// Convert normalized messages into OpenAI chat-completions wire JSON.
///
/// OpenAI requires every tool call from one assistant turn to live inside a
/// single assistant message's `tool_calls` array; this walks an assistant
/// message's content blocks and collects all `ToolCall`s into one entry.
pub(crate) fn build_openai_messages(messages: &[AgentMessage]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len());
    for m in messages {
        match m {
            AgentMessage::Custom(v) if v.get("kind").and_then(|k| k.as_str()) == Some("system") => {
                out.push(json!({ "role": "system", "content": v.get("text").and_then(|t| t.as_str()).unwrap_or("") }));
            }
            AgentMessage::Custom(_) => {}
            AgentMessage::User { content, .. } => out.push(json!({ "role": "user", "content": content_to_value(content) })),
            AgentMessage::Assistant { content, .. } => {
                let tool_calls: Vec<Value> = content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolCall { id, name, arguments, .. } => Some(json!({
                            "id": id,
                            "type": "function",
                            "function": { "name": name, "arguments": arguments.to_string() },
                        })),
                        _ => None,
                    })
                    .collect();
                let text_only: Vec<&ContentBlock> = content.iter().filter(|b| !matches!(b, ContentBlock::ToolCall { .. })).collect();
                let mut msg = json!({ "role": "assistant" });
                if !text_only.is_empty() {
                    msg["content"] = content_to_value(&text_only.into_iter().cloned().collect::<Vec<_>>());
                }
                if !tool_calls.is_empty() {
                    msg["tool_calls"] = json!(tool_calls);
                }
                out.push(msg);
            }
            AgentMessage::ToolResult { tool_call_id, content, .. } => {
                out.push(json!({ "role": "tool", "tool_call_id": tool_call_id, "content": content_to_value(content) }));
            }
        }
    }
    out
}

fn content_to_value(content: &[ContentBlock]) -> Value {
    if content.len() == 1 {
        if let ContentBlock::Text { text, .. } = &content[0] {
            return json!(text);
        }
    }
    let parts: Vec<Value> = content
        .iter()
        .map(|b| match b {
            ContentBlock::Text { text, .. } => json!({ "type": "text", "text": text }),
            ContentBlock::Image { data, mime_type } => json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{mime_type};base64,{data}") },
            }),
            ContentBlock::Thinking { thinking, .. } => json!({ "type": "text", "text": thinking }),
            ContentBlock::ToolCall { .. } => json!({ "type": "text", "text": "" }),
        })
        .collect();
    json!(parts)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
