// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Google Gemini driver — native Generative Language API.
//!
//! Uses the `streamGenerateContent?alt=sse` endpoint. Supports text, tool
//! calls, and thinking deltas via `thought` parts.
//!
//! # Auth
//! API key passed as a `?key=...` query parameter.
//!
//! # Endpoint pattern
//! `POST https://generativelanguage.googleapis.com/v1beta/models/{model}:streamGenerateContent?alt=sse`

use std::collections::HashMap;

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::debug;

use crate::catalog::{static_catalog, ModelCatalogEntry};
use crate::event::{channel, AssistantStreamEvent, EventSink, EventStream, StreamErrorReason};
use crate::provider::ModelProvider;
use crate::sanitize::apply_universal_transforms;
use crate::types::{AgentMessage, CompletionRequest, ContentBlock, InputModality, ModelIdentity, StopReason, Usage};

pub struct GoogleProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(model: String, api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
            client: reqwest::Client::new(),
        }
    }

    /// Build the `contents`/`systemInstruction`/`tools` request body.
    ///
    /// `tc_name_map` resolves a tool_call_id to the function name Gemini
    /// expects in `functionResponse.name` — Gemini matches responses to
    /// calls by name, not by the opaque id the agent loop assigns.
    fn build_body(&self, req: &CompletionRequest) -> Value {
        let mut modalities = vec![InputModality::Text];
        if req.model.input_image {
            modalities.push(InputModality::Image);
        }
        let messages = apply_universal_transforms(req.messages.clone(), &modalities);

        let mut tc_name_map: HashMap<String, String> = HashMap::new();
        for m in &messages {
            if let AgentMessage::Assistant { content, .. } = m {
                for b in content {
                    if let ContentBlock::ToolCall { id, name, .. } = b {
                        tc_name_map.insert(id.clone(), name.clone());
                    }
                }
            }
        }

        let mut system_parts: Vec<Value> = Vec::new();
        let mut contents: Vec<Value> = Vec::new();
        for m in &messages {
            match m {
                AgentMessage::Custom(v) if v.get("kind").and_then(|k| k.as_str()) == Some("system") => {
                    if let Some(t) = v.get("text").and_then(|t| t.as_str()) {
                        system_parts.push(json!({ "text": t }));
                    }
                }
                AgentMessage::Custom(_) => {}
                AgentMessage::User { content, .. } => contents.push(json!({ "role": "user", "parts": blocks_to_parts(content, &tc_name_map) })),
                AgentMessage::ToolResult { .. } => contents.push(json!({ "role": "user", "parts": message_to_parts(m, &tc_name_map) })),
                AgentMessage::Assistant { content, .. } => contents.push(json!({ "role": "model", "parts": blocks_to_parts(content, &tc_name_map) })),
            }
        }
        if let Some(suffix) = &req.system_dynamic_suffix {
            if !suffix.trim().is_empty() {
                system_parts.push(json!({ "text": suffix }));
            }
        }

        let tools_section: Option<Value> = if req.tools.is_empty() {
            None
        } else {
            let function_declarations: Vec<Value> =
                req.tools.iter().map(|t| json!({ "name": t.name, "description": t.description, "parameters": t.parameters })).collect();
            Some(json!([{ "functionDeclarations": function_declarations }]))
        };

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": req.options.max_tokens.unwrap_or(8192),
                "temperature": req.options.temperature.unwrap_or(0.2),
            }
        });
        if !system_parts.is_empty() {
            body["systemInstruction"] = json!({ "parts": system_parts });
        }
        if let Some(tools) = tools_section {
            body["tools"] = tools;
        }
        body
    }
}

#[async_trait]
impl ModelProvider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelCatalogEntry>> {
        let mut entries: Vec<ModelCatalogEntry> = static_catalog().into_iter().filter(|e| e.provider == "google").collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        let key = req.options.api_key.clone().or_else(|| self.api_key.clone()).context("google: no api key resolved")?;
        let body = self.build_body(&req);
        let url = format!("{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}", self.base_url.trim_end_matches('/'), self.model, key);

        debug!(model = %self.model, "sending Google Gemini request");
        let resp = self.client.post(&url).json(&body).send().await.context("Google Gemini request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            if crate::overflow::is_overflow_status(status.as_u16(), text.is_empty()) || crate::overflow::is_overflow_message(&text) {
                bail!("google overflow: {status} {text}");
            }
            bail!("Google Gemini error {status}: {text}");
        }

        let model_identity = ModelIdentity { api: "google".into(), provider: "google".into(), id: self.model.clone() };
        let (sink, stream) = channel();
        tokio::spawn(drive_events(resp.bytes_stream(), sink, model_identity));
        Ok(stream)
    }
}

fn message_to_parts(m: &AgentMessage, tc_name_map: &HashMap<String, String>) -> Vec<Value> {
    match m {
        AgentMessage::ToolResult { tool_call_id, content, is_error, .. } => {
            let fn_name = tc_name_map.get(tool_call_id).map(|s| s.as_str()).unwrap_or(tool_call_id);
            let output_text: String = content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text, .. } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            let output_text = if output_text.is_empty() { "[see attached images]".to_string() } else { output_text };
            let mut result = vec![json!({
                "functionResponse": {
                    "name": fn_name,
                    "response": if *is_error { json!({ "error": output_text }) } else { json!({ "output": output_text }) },
                }
            })];
            for b in content {
                if let ContentBlock::Image { data, mime_type } = b {
                    result.push(json!({ "inline_data": { "mime_type": mime_type, "data": data } }));
                }
            }
            result
        }
        _ => vec![],
    }
}

fn blocks_to_parts(content: &[ContentBlock], tc_name_map: &HashMap<String, String>) -> Vec<Value> {
    let _ = tc_name_map;
    if content.is_empty() {
        return vec![json!({ "text": "" })];
    }
    content
        .iter()
        .map(|b| match b {
            ContentBlock::Text { text, .. } => json!({ "text": text }),
            ContentBlock::Thinking { thinking, .. } => json!({ "text": thinking, "thought": true }),
            ContentBlock::Image { data, mime_type } => json!({ "inline_data": { "mime_type": mime_type, "data": data } }),
            ContentBlock::ToolCall { name, arguments, .. } => json!({ "functionCall": { "name": name, "args": arguments } }),
        })
        .collect()
}

async fn drive_events(mut byte_stream: impl Stream<Item = reqwest::Result<Bytes>> + Unpin, sink: EventSink, model: ModelIdentity) {
    let mut line_buf = String::new();
    let mut text = String::new();
    let mut text_idx: Option<usize> = None;
    let mut thinking = String::new();
    let mut thinking_idx: Option<usize> = None;
    let mut tool_calls: Vec<(String, String, Value)> = Vec::new();
    let mut usage = Usage::default();
    let mut stop_reason = StopReason::Stop;
    let mut sent_start = false;
    let mut finished = false;

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
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            let Ok(v) = serde_json::from_str::<Value>(data) else { continue };
            ensure_start!();

            if let Some(meta) = v.get("usageMetadata") {
                usage.input = meta["promptTokenCount"].as_u64().unwrap_or(0) as u32;
                usage.output = meta["candidatesTokenCount"].as_u64().unwrap_or(0) as u32;
                usage.cache_read = meta["cachedContentTokenCount"].as_u64().unwrap_or(0) as u32;
            }

            let candidate = &v["candidates"][0];
            if let Some(reason) = candidate["finishReason"].as_str() {
                stop_reason = map_finish_reason(reason);
                finished = true;
            }
            let Some(parts) = candidate["content"]["parts"].as_array() else { continue };
            for part in parts {
                if part.get("thought").and_then(|t| t.as_bool()) == Some(true) {
                    if let Some(t) = part["text"].as_str() {
                        if thinking_idx.is_none() {
                            thinking_idx = Some(0);
                            emit!(AssistantStreamEvent::ThinkingStart { content_index: 0 });
                        }
                        thinking.push_str(t);
                        emit!(AssistantStreamEvent::ThinkingDelta { content_index: 0, delta: t.to_string() });
                    }
                    continue;
                }
                if let Some(fc) = part.get("functionCall") {
                    let name = fc["name"].as_str().unwrap_or_default().to_string();
                    let args = fc["args"].clone();
                    let idx = 1 + tool_calls.len();
                    emit!(AssistantStreamEvent::ToolCallStart { content_index: idx, id: name.clone(), name: name.clone() });
                    emit!(AssistantStreamEvent::ToolCallEnd { content_index: idx, tool_call: (name.clone(), name.clone(), args.clone()) });
                    tool_calls.push((name.clone(), name, args));
                    continue;
                }
                if let Some(t) = part["text"].as_str() {
                    if text_idx.is_none() {
                        text_idx = Some(thinking_idx.map(|_| 1).unwrap_or(0));
                        emit!(AssistantStreamEvent::TextStart { content_index: text_idx.unwrap() });
                    }
                    text.push_str(t);
                    emit!(AssistantStreamEvent::TextDelta { content_index: text_idx.unwrap(), delta: t.to_string() });
                }
            }
        }
    }

    if !sent_start {
        return;
    }
    let mut content = Vec::new();
    if let Some(idx) = thinking_idx {
        emit!(AssistantStreamEvent::ThinkingEnd { content_index: idx, content: thinking.clone(), signature: None });
        content.push(ContentBlock::Thinking { thinking, thinking_signature: None });
    }
    if let Some(idx) = text_idx {
        emit!(AssistantStreamEvent::TextEnd { content_index: idx, content: text.clone(), signature: None });
        content.push(ContentBlock::text(text));
    }
    for (id, name, args) in tool_calls {
        content.push(ContentBlock::tool_call(id, name, args));
    }
    usage.total_tokens = usage.input + usage.output + usage.cache_read + usage.cache_write;
    if !finished && matches!(stop_reason, StopReason::Stop) && content.iter().any(|b| matches!(b, ContentBlock::ToolCall { .. })) {
        stop_reason = StopReason::ToolUse;
    }
    let message =
        AgentMessage::Assistant { content, usage, stop_reason, error_message: None, model: model.clone(), timestamp: chrono::Utc::now() };
    emit!(AssistantStreamEvent::Done { reason: stop_reason, message });
}

fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "STOP" => StopReason::Stop,
        "MAX_TOKENS" => StopReason::Length,
        "SAFETY" | "RECITATION" | "OTHER" => StopReason::Error,
        _ => StopReason::Stop,
    }
}
