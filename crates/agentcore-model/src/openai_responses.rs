// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI Responses API driver — `POST {base_url}/v1/responses`.
//!
//! Distinct from the Chat-Completions wire format handled by
//! `openai_compat`: requests carry a flat `input` item array plus top-level
//! `instructions`, and streaming is a sequence of typed `response.*` events
//! rather than `choices[0].delta` fragments. Reasoning items carry opaque
//! server-side ids (`item_id`) that must be echoed back verbatim on the next
//! request — carried here via `ContentBlock::Thinking::thinking_signature`.

use std::collections::BTreeMap;

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::catalog::{static_catalog, ModelCatalogEntry};
use crate::event::{channel, AssistantStreamEvent, EventSink, EventStream, StreamErrorReason};
use crate::provider::ModelProvider;
use crate::sanitize::apply_universal_transforms;
use crate::types::{AgentMessage, CompletionRequest, ContentBlock, InputModality, ModelIdentity, StopReason, Usage};

pub struct OpenAIResponsesProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIResponsesProvider {
    pub fn new(model: String, api_key: Option<String>, base_url: Option<String>) -> Self {
        Self { model, api_key, base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".into()), client: reqwest::Client::new() }
    }

    fn build_body(&self, req: &CompletionRequest) -> Value {
        let mut modalities = vec![InputModality::Text];
        if req.model.input_image {
            modalities.push(InputModality::Image);
        }
        let messages = apply_universal_transforms(req.messages.clone(), &modalities);

        let mut instructions = String::new();
        let mut input: Vec<Value> = Vec::new();
        for m in &messages {
            match m {
                AgentMessage::Custom(v) if v.get("kind").and_then(|k| k.as_str()) == Some("system") => {
                    if let Some(t) = v.get("text").and_then(|t| t.as_str()) {
                        if !instructions.is_empty() {
                            instructions.push_str("\n\n");
                        }
                        instructions.push_str(t);
                    }
                }
                AgentMessage::Custom(_) => {}
                AgentMessage::User { content, .. } => input.push(json!({ "type": "message", "role": "user", "content": content_to_parts(content, true) })),
                AgentMessage::Assistant { content, .. } => {
                    let text_parts: Vec<&ContentBlock> = content.iter().filter(|b| matches!(b, ContentBlock::Text { .. })).collect();
                    if !text_parts.is_empty() {
                        let parts: Vec<Value> = text_parts.iter().map(|b| match b {
                            ContentBlock::Text { text, .. } => json!({ "type": "output_text", "text": text }),
                            _ => unreachable!(),
                        }).collect();
                        input.push(json!({ "type": "message", "role": "assistant", "content": parts }));
                    }
                    for b in content {
                        if let ContentBlock::Thinking { thinking, thinking_signature } = b {
                            if let Some(id) = thinking_signature {
                                input.push(json!({ "type": "reasoning", "id": id, "summary": [{ "type": "summary_text", "text": thinking }] }));
                            }
                        }
                        if let ContentBlock::ToolCall { id, name, arguments, .. } = b {
                            input.push(json!({ "type": "function_call", "call_id": id, "name": name, "arguments": arguments.to_string() }));
                        }
                    }
                }
                AgentMessage::ToolResult { tool_call_id, content, .. } => {
                    let output = content
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Text { text, .. } => Some(text.clone()),
                            _ => None,
                        })
                        .collect::<Vec<_>>()
                        .join("\n");
                    input.push(json!({ "type": "function_call_output", "call_id": tool_call_id, "output": output }));
                }
            }
        }
        if let Some(suffix) = &req.system_dynamic_suffix {
            if !suffix.trim().is_empty() {
                if !instructions.is_empty() {
                    instructions.push_str("\n\n");
                }
                instructions.push_str(suffix);
            }
        }

        let tools: Vec<Value> =
            req.tools.iter().map(|t| json!({ "type": "function", "name": t.name, "description": t.description, "parameters": t.parameters })).collect();

        let mut body = json!({
            "model": self.model,
            "input": input,
            "stream": true,
            "max_output_tokens": req.options.max_tokens.unwrap_or(4096),
        });
        if !instructions.is_empty() {
            body["instructions"] = json!(instructions);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        if let Some(t) = req.options.temperature {
            body["temperature"] = json!(t);
        }
        body
    }
}

fn content_to_parts(content: &[ContentBlock], is_input: bool) -> Value {
    let text_type = if is_input { "input_text" } else { "output_text" };
    let parts: Vec<Value> = content
        .iter()
        .map(|b| match b {
            ContentBlock::Text { text, .. } => json!({ "type": text_type, "text": text }),
            ContentBlock::Image { data, mime_type } => json!({ "type": "input_image", "image_url": format!("data:{mime_type};base64,{data}") }),
            ContentBlock::Thinking { thinking, .. } => json!({ "type": text_type, "text": thinking }),
            ContentBlock::ToolCall { .. } => json!({ "type": text_type, "text": "" }),
        })
        .collect();
    json!(parts)
}

#[async_trait]
impl ModelProvider for OpenAIResponsesProvider {
    fn name(&self) -> &str {
        "openai-responses"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelCatalogEntry>> {
        Ok(static_catalog().into_iter().filter(|e| e.provider == "openai").collect())
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        let key = req.options.api_key.clone().or_else(|| self.api_key.clone()).context("openai-responses: no api key resolved")?;
        let body = self.build_body(&req);
        debug!(model = %self.model, "sending OpenAI Responses request");

        let resp = self
            .client
            .post(format!("{}/responses", self.base_url.trim_end_matches('/')))
            .bearer_auth(&key)
            .json(&body)
            .send()
            .await
            .context("OpenAI Responses request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            if crate::overflow::is_overflow_status(status.as_u16(), text.is_empty()) || crate::overflow::is_overflow_message(&text) {
                bail!("openai-responses overflow: {status} {text}");
            }
            bail!("OpenAI Responses error {status}: {text}");
        }

        let model_identity = ModelIdentity { api: "openai-responses".into(), provider: "openai".into(), id: self.model.clone() };
        let (sink, stream) = channel();
        tokio::spawn(drive_events(resp.bytes_stream(), sink, model_identity));
        Ok(stream)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Message,
    Reasoning,
    FunctionCall,
}

struct ItemState {
    kind: ItemKind,
    content_index: usize,
    text: String,
    item_id: String,
    call_id: String,
    call_name: String,
    args_buf: String,
}

async fn drive_events(mut byte_stream: impl Stream<Item = reqwest::Result<Bytes>> + Unpin, sink: EventSink, model: ModelIdentity) {
    let mut line_buf = String::new();
    let mut items: BTreeMap<u64, ItemState> = BTreeMap::new();
    let mut next_content_index = 0usize;
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
        line_buf.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(nl) = line_buf.find('\n') {
            let line = line_buf[..nl].trim_end_matches('\r').to_string();
            line_buf = line_buf[nl + 1..].to_string();
            let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else { continue };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            let Ok(v) = serde_json::from_str::<Value>(data) else { continue };
            let Some(kind) = v["type"].as_str() else { continue };

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

            match kind {
                "response.output_item.added" => {
                    let output_index = v["output_index"].as_u64().unwrap_or(0);
                    let item = &v["item"];
                    let item_kind = match item["type"].as_str().unwrap_or("") {
                        "function_call" => ItemKind::FunctionCall,
                        "reasoning" => ItemKind::Reasoning,
                        _ => ItemKind::Message,
                    };
                    let content_index = next_content_index;
                    next_content_index += 1;
                    let state = ItemState {
                        kind: item_kind,
                        content_index,
                        text: String::new(),
                        item_id: item["id"].as_str().unwrap_or_default().to_string(),
                        call_id: item["call_id"].as_str().unwrap_or_default().to_string(),
                        call_name: item["name"].as_str().unwrap_or_default().to_string(),
                        args_buf: String::new(),
                    };
                    match item_kind {
                        ItemKind::Message => emit!(AssistantStreamEvent::TextStart { content_index }),
                        ItemKind::Reasoning => emit!(AssistantStreamEvent::ThinkingStart { content_index }),
                        ItemKind::FunctionCall => emit!(AssistantStreamEvent::ToolCallStart {
                            content_index,
                            id: state.call_id.clone(),
                            name: state.call_name.clone(),
                        }),
                    }
                    items.insert(output_index, state);
                }
                "response.output_text.delta" => {
                    let output_index = v["output_index"].as_u64().unwrap_or(0);
                    let delta = v["delta"].as_str().unwrap_or_default().to_string();
                    if let Some(s) = items.get_mut(&output_index) {
                        s.text.push_str(&delta);
                        emit!(AssistantStreamEvent::TextDelta { content_index: s.content_index, delta });
                    }
                }
                "response.reasoning_summary_text.delta" => {
                    let output_index = v["output_index"].as_u64().unwrap_or(0);
                    let delta = v["delta"].as_str().unwrap_or_default().to_string();
                    if let Some(s) = items.get_mut(&output_index) {
                        s.text.push_str(&delta);
                        emit!(AssistantStreamEvent::ThinkingDelta { content_index: s.content_index, delta });
                    }
                }
                "response.function_call_arguments.delta" => {
                    let output_index = v["output_index"].as_u64().unwrap_or(0);
                    let delta = v["delta"].as_str().unwrap_or_default().to_string();
                    if let Some(s) = items.get_mut(&output_index) {
                        s.args_buf.push_str(&delta);
                        emit!(AssistantStreamEvent::ToolCallDelta { content_index: s.content_index, delta });
                    }
                }
                "response.output_item.done" => {
                    let output_index = v["output_index"].as_u64().unwrap_or(0);
                    let Some(s) = items.get_mut(&output_index) else { continue };
                    match s.kind {
                        ItemKind::Message => {
                            emit!(AssistantStreamEvent::TextEnd { content_index: s.content_index, content: s.text.clone(), signature: None })
                        }
                        ItemKind::Reasoning => emit!(AssistantStreamEvent::ThinkingEnd {
                            content_index: s.content_index,
                            content: s.text.clone(),
                            signature: Some(s.item_id.clone()),
                        }),
                        ItemKind::FunctionCall => {
                            let args = crate::partial_json::parse(&s.args_buf);
                            emit!(AssistantStreamEvent::ToolCallEnd {
                                content_index: s.content_index,
                                tool_call: (s.call_id.clone(), s.call_name.clone(), args),
                            });
                        }
                    }
                }
                "response.completed" | "response.incomplete" => {
                    if let Some(u) = v["response"].get("usage") {
                        usage.input = u["input_tokens"].as_u64().unwrap_or(0) as u32;
                        usage.output = u["output_tokens"].as_u64().unwrap_or(0) as u32;
                        usage.cache_read = u.get("input_tokens_details").and_then(|d| d.get("cached_tokens")).and_then(|t| t.as_u64()).unwrap_or(0) as u32;
                        usage.total_tokens = usage.input + usage.output + usage.cache_read + usage.cache_write;
                    }
                    stop_reason = if kind == "response.incomplete" {
                        StopReason::Length
                    } else if items.values().any(|s| matches!(s.kind, ItemKind::FunctionCall)) {
                        StopReason::ToolUse
                    } else {
                        StopReason::Stop
                    };

                    let mut content: Vec<(usize, ContentBlock)> = Vec::new();
                    for s in items.values() {
                        let block = match s.kind {
                            ItemKind::Message => ContentBlock::text(s.text.clone()),
                            ItemKind::Reasoning => ContentBlock::Thinking { thinking: s.text.clone(), thinking_signature: Some(s.item_id.clone()) },
                            ItemKind::FunctionCall => ContentBlock::tool_call(s.call_id.clone(), s.call_name.clone(), crate::partial_json::parse(&s.args_buf)),
                        };
                        content.push((s.content_index, block));
                    }
                    content.sort_by_key(|(idx, _)| *idx);
                    let message = AgentMessage::Assistant {
                        content: content.into_iter().map(|(_, b)| b).collect(),
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
                    let msg = v["error"]["message"].as_str().unwrap_or("unknown error").to_string();
                    warn!(error = %msg, "openai responses stream error");
                    emit!(AssistantStreamEvent::Error { reason: StreamErrorReason::Error, error: msg });
                    return;
                }
                _ => debug!(event_type = kind, "unhandled openai responses event"),
            }
        }
    }
}
