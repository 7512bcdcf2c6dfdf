// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Anthropic Messages API adapter.
//!
//! `POST {base_url}/v1/messages` with `stream:true`. SSE event sequence per
//! turn: `message_start` → repeated `content_block_start/delta/stop` →
//! `message_delta` → `message_stop`. Tool-call arguments arrive as
//! `input_json_delta` fragments; extended thinking arrives as
//! `thinking_delta`/`signature_delta`.

use anyhow::{bail, Context};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::catalog::InputModality;
use crate::event::{channel, AssistantStreamEvent, EventSink, EventStream, StreamErrorReason};
use crate::provider::ModelProvider;
use crate::sanitize::apply_universal_transforms;
use crate::types::{
    AgentMessage, CacheRetention, CompletionRequest, ContentBlock, ModelIdentity, StopReason, Usage,
};

const API_VERSION: &str = "2023-06-01";
const BETA_HEADERS: &str = "fine-grained-tool-streaming-2025-05-14,interleaved-thinking-2025-05-14";

pub struct AnthropicProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(model: impl Into<String>, api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            model: model.into(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            client: reqwest::Client::new(),
        }
    }

    fn headers(&self, req: &CompletionRequest) -> anyhow::Result<reqwest::header::HeaderMap> {
        use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
        let mut headers = HeaderMap::new();
        let key = req
            .options
            .api_key
            .clone()
            .or_else(|| self.api_key.clone())
            .context("anthropic: no api key resolved")?;
        headers.insert("x-api-key", HeaderValue::from_str(&key)?);
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        headers.insert("anthropic-beta", HeaderValue::from_static(BETA_HEADERS));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        for (k, v) in &req.options.headers {
            headers.insert(HeaderName::try_from(k.as_str())?, HeaderValue::from_str(v)?);
        }
        Ok(headers)
    }

    fn build_body(&self, req: &CompletionRequest) -> Value {
        let mut modalities = vec![InputModality::Text];
        if req.model.input_image {
            modalities.push(InputModality::Image);
        }
        let messages = apply_universal_transforms(req.messages.clone(), &modalities);
        let cache = req.options.cache_retention;

        let mut system_blocks = Vec::new();
        let system_text = collect_system_text(&messages);
        if !system_text.is_empty() {
            let mut block = json!({ "type": "text", "text": system_text });
            if cache != CacheRetention::None {
                block["cache_control"] = cache_control_json(cache);
            }
            system_blocks.push(block);
        }
        if let Some(suffix) = &req.system_dynamic_suffix {
            system_blocks.push(json!({ "type": "text", "text": suffix }));
        }

        let wire_messages = to_anthropic_messages(&messages, cache);

        let mut body = json!({
            "model": self.model,
            "stream": true,
            "max_tokens": req.options.max_tokens.unwrap_or(4096),
            "messages": wire_messages,
        });
        if !system_blocks.is_empty() {
            body["system"] = Value::Array(system_blocks);
        }
        if let Some(t) = req.options.temperature {
            body["temperature"] = json!(t);
        }
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(
                req.tools
                    .iter()
                    .map(|t| json!({ "name": t.name, "description": t.description, "input_schema": t.parameters }))
                    .collect(),
            );
        }
        if let Some(budget) = req.options.thinking_budget_tokens {
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
        }
        body
    }
}

fn cache_control_json(retention: CacheRetention) -> Value {
    match retention {
        CacheRetention::Long => json!({ "type": "ephemeral", "ttl": "1h" }),
        _ => json!({ "type": "ephemeral" }),
    }
}

/// System content does not live in `AgentMessage` (the agent facade carries
/// it separately). Callers that want a system prompt pass it as a leading
/// `Custom({"kind":"system","text":...})` message.
fn collect_system_text(messages: &[AgentMessage]) -> String {
    messages
        .iter()
        .filter_map(|m| match m {
            AgentMessage::Custom(v) if v.get("kind").and_then(|k| k.as_str()) == Some("system") => {
                v.get("text").and_then(|t| t.as_str()).map(|s| s.to_string())
            }
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn to_anthropic_messages(messages: &[AgentMessage], cache: CacheRetention) -> Vec<Value> {
    let conversational: Vec<&AgentMessage> = messages
        .iter()
        .filter(|m| !matches!(m, AgentMessage::Custom(v) if v.get("kind").and_then(|k| k.as_str()) == Some("system")))
        .collect();

    let last_user_idx = conversational
        .iter()
        .rposition(|m| matches!(m, AgentMessage::User { .. } | AgentMessage::ToolResult { .. }));

    conversational
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let breakpoint = cache != CacheRetention::None && Some(i) == last_user_idx;
            message_to_value(m, breakpoint, cache)
        })
        .collect()
}

fn message_to_value(message: &AgentMessage, cache_breakpoint: bool, cache: CacheRetention) -> Value {
    match message {
        AgentMessage::User { content, .. } => json!({
            "role": "user",
            "content": content.iter().enumerate()
                .map(|(i, b)| block_to_value(b, cache_breakpoint && i == content.len() - 1, cache))
                .collect::<Vec<_>>(),
        }),
        AgentMessage::Assistant { content, .. } => json!({
            "role": "assistant",
            "content": content.iter().map(|b| block_to_value(b, false, cache)).collect::<Vec<_>>(),
        }),
        AgentMessage::ToolResult { tool_call_id, content, is_error, .. } => json!({
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": tool_call_id,
                "is_error": is_error,
                "content": content.iter().map(|b| block_to_value(b, false, cache)).collect::<Vec<_>>(),
            }],
        }),
        AgentMessage::Custom(_) => json!({ "role": "user", "content": [] }),
    }
}

fn block_to_value(block: &ContentBlock, cache_breakpoint: bool, cache: CacheRetention) -> Value {
    let mut v = match block {
        ContentBlock::Text { text, .. } => json!({ "type": "text", "text": text }),
        ContentBlock::Thinking { thinking, thinking_signature } => match thinking_signature {
            Some(sig) => json!({ "type": "thinking", "thinking": thinking, "signature": sig }),
            // No signature to replay — downgrade to text rather than risk rejection.
            None => json!({ "type": "text", "text": thinking }),
        },
        ContentBlock::ToolCall { id, name, arguments, .. } => {
            json!({ "type": "tool_use", "id": id, "name": name, "input": arguments })
        }
        ContentBlock::Image { data, mime_type } => json!({
            "type": "image",
            "source": { "type": "base64", "media_type": mime_type, "data": data },
        }),
    };
    if cache_breakpoint {
        v["cache_control"] = cache_control_json(cache);
    }
    v
}

#[async_trait::async_trait]
impl ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        let headers = self.headers(&req)?;
        let body = self.build_body(&req);
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let model_identity =
            ModelIdentity { api: "anthropic-messages".into(), provider: "anthropic".into(), id: self.model.clone() };

        let resp = self.client.post(&url).headers(headers).json(&body).send().await.context("anthropic: request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            if crate::overflow::is_overflow_status(status.as_u16(), text.is_empty()) || crate::overflow::is_overflow_message(&text) {
                bail!("anthropic overflow: {status} {text}");
            }
            bail!("anthropic: http {status}: {text}");
        }

        let (sink, stream) = channel();
        tokio::spawn(drive_events(resp.bytes_stream(), sink, model_identity));
        Ok(stream)
    }
}

/// Parse the SSE body and re-emit normalized events, rebuilding the assistant
/// message's content blocks as the stream progresses.
async fn drive_events(
    mut byte_stream: impl Stream<Item = reqwest::Result<Bytes>> + Unpin,
    sink: EventSink,
    model: ModelIdentity,
) {
    let mut buf = String::new();
    let mut blocks: Vec<ContentBlock> = Vec::new();
    let mut partial_jsons: std::collections::HashMap<usize, String> = std::collections::HashMap::new();
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

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                emit!(AssistantStreamEvent::Error { reason: StreamErrorReason::Error, error: e.to_string() });
                return;
            }
        };
        buf.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buf.find("\n\n") {
            let raw_event: String = buf.drain(..pos + 2).collect();
            let Some(data_line) = raw_event.lines().find(|l| l.starts_with("data:")) else { continue };
            let payload = data_line.trim_start_matches("data:").trim();
            if payload == "[DONE]" {
                continue;
            }
            let Ok(event) = serde_json::from_str::<Value>(payload) else { continue };
            let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or_default();

            if !sent_start {
                sent_start = true;
                let partial = AgentMessage::Assistant {
                    content: vec![],
                    usage: Usage::default(),
                    stop_reason: StopReason::Stop,
                    error_message: None,
                    model: model.clone(),
                    timestamp: chrono::Utc::now(),
                };
                emit!(AssistantStreamEvent::Start { partial });
            }

            match event_type {
                "content_block_start" => {
                    let idx = event["index"].as_u64().unwrap_or(0) as usize;
                    let block = &event["content_block"];
                    match block["type"].as_str().unwrap_or_default() {
                        "text" => {
                            blocks.push(ContentBlock::text(""));
                            emit!(AssistantStreamEvent::TextStart { content_index: idx });
                        }
                        "thinking" => {
                            blocks.push(ContentBlock::Thinking { thinking: String::new(), thinking_signature: None });
                            emit!(AssistantStreamEvent::ThinkingStart { content_index: idx });
                        }
                        "tool_use" => {
                            let id = block["id"].as_str().unwrap_or_default().to_string();
                            let name = block["name"].as_str().unwrap_or_default().to_string();
                            blocks.push(ContentBlock::tool_call(id.clone(), name.clone(), json!({})));
                            partial_jsons.insert(idx, String::new());
                            emit!(AssistantStreamEvent::ToolCallStart { content_index: idx, id, name });
                        }
                        _ => {}
                    }
                }
                "content_block_delta" => {
                    let idx = event["index"].as_u64().unwrap_or(0) as usize;
                    let delta = &event["delta"];
                    match delta["type"].as_str().unwrap_or_default() {
                        "text_delta" => {
                            let text = delta["text"].as_str().unwrap_or_default().to_string();
                            if let Some(ContentBlock::Text { text: t, .. }) = blocks.get_mut(idx) {
                                t.push_str(&text);
                            }
                            emit!(AssistantStreamEvent::TextDelta { content_index: idx, delta: text });
                        }
                        "thinking_delta" => {
                            let text = delta["thinking"].as_str().unwrap_or_default().to_string();
                            if let Some(ContentBlock::Thinking { thinking, .. }) = blocks.get_mut(idx) {
                                thinking.push_str(&text);
                            }
                            emit!(AssistantStreamEvent::ThinkingDelta { content_index: idx, delta: text });
                        }
                        "signature_delta" => {
                            let sig = delta["signature"].as_str().unwrap_or_default().to_string();
                            if let Some(ContentBlock::Thinking { thinking_signature, .. }) = blocks.get_mut(idx) {
                                *thinking_signature = Some(sig);
                            }
                        }
                        "input_json_delta" => {
                            let fragment = delta["partial_json"].as_str().unwrap_or_default().to_string();
                            let acc = partial_jsons.entry(idx).or_default();
                            acc.push_str(&fragment);
                            let parsed = crate::partial_json::parse(acc);
                            if let Some(ContentBlock::ToolCall { arguments, partial_json, .. }) = blocks.get_mut(idx) {
                                *arguments = parsed;
                                *partial_json = Some(acc.clone());
                            }
                            emit!(AssistantStreamEvent::ToolCallDelta { content_index: idx, delta: fragment });
                        }
                        _ => {}
                    }
                }
                "content_block_stop" => {
                    let idx = event["index"].as_u64().unwrap_or(0) as usize;
                    let raw = partial_jsons.remove(&idx).unwrap_or_default();
                    match blocks.get_mut(idx) {
                        Some(ContentBlock::Text { text, .. }) => {
                            emit!(AssistantStreamEvent::TextEnd { content_index: idx, content: text.clone(), signature: None });
                        }
                        Some(ContentBlock::Thinking { thinking, thinking_signature }) => {
                            emit!(AssistantStreamEvent::ThinkingEnd {
                                content_index: idx,
                                content: thinking.clone(),
                                signature: thinking_signature.clone(),
                            });
                        }
                        Some(ContentBlock::ToolCall { id, name, arguments, partial_json }) => {
                            let parsed = serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| crate::partial_json::parse(&raw));
                            *arguments = parsed.clone();
                            *partial_json = None;
                            let tool_call = (id.clone(), name.clone(), parsed);
                            emit!(AssistantStreamEvent::ToolCallEnd { content_index: idx, tool_call });
                        }
                        _ => {}
                    }
                }
                "message_delta" => {
                    if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                        stop_reason = map_stop_reason(reason);
                    }
                    if let Some(u) = event.get("usage") {
                        usage.output = u["output_tokens"].as_u64().unwrap_or(0) as u32;
                        usage.cache_read = u["cache_read_input_tokens"].as_u64().unwrap_or(0) as u32;
                        usage.cache_write = u["cache_creation_input_tokens"].as_u64().unwrap_or(0) as u32;
                    }
                }
                "message_start" => {
                    if let Some(u) = event["message"].get("usage") {
                        usage.input = u["input_tokens"].as_u64().unwrap_or(0) as u32;
                        usage.cache_read = u["cache_read_input_tokens"].as_u64().unwrap_or(0) as u32;
                        usage.cache_write = u["cache_creation_input_tokens"].as_u64().unwrap_or(0) as u32;
                    }
                }
                "message_stop" => {
                    usage.total_tokens = usage.input + usage.output + usage.cache_read + usage.cache_write;
                    let message = AgentMessage::Assistant {
                        content: blocks.clone(),
                        usage,
                        stop_reason,
                        error_message: None,
                        model: model.clone(),
                        timestamp: chrono::Utc::now(),
                    };
                    emit!(AssistantStreamEvent::Done { reason: stop_reason, message });
                    return;
                }
                "error" => {
                    let msg = event["error"]["message"].as_str().unwrap_or("unknown anthropic error").to_string();
                    warn!(error = %msg, "anthropic stream error event");
                    emit!(AssistantStreamEvent::Error { reason: StreamErrorReason::Error, error: msg });
                    return;
                }
                other => debug!(event_type = other, "unhandled anthropic SSE event"),
            }
        }
    }
}

fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "end_turn" | "stop_sequence" => StopReason::Stop,
        "max_tokens" => StopReason::Length,
        "tool_use" => StopReason::ToolUse,
        _ => StopReason::Stop,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
