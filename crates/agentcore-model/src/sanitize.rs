// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Universal request transforms applied before any per-provider conversion.
//!
//! Every adapter runs its outgoing message list through these four passes,
//! in order, before translating it into its own wire schema:
//! 1. [`strip_unpaired_surrogates`] — some model output round-tripped through
//!    JS `String`s contains lone UTF-16 surrogate halves that are not valid
//!    UTF-8 and crash strict JSON encoders downstream.
//! 2. [`drop_empty_assistant_messages`].
//! 3. [`strip_images_if_unsupported`].
//! 4. [`normalize_tool_call_id`] — applied per tool-call block.

use std::sync::LazyLock;
use regex::Regex;

use crate::catalog::InputModality;
use crate::types::{AgentMessage, ContentBlock};

const IMAGE_OMITTED: &str = "[image omitted: model does not support image input]";

/// Run all universal transforms in the order the spec prescribes.
pub fn apply_universal_transforms(
    messages: Vec<AgentMessage>,
    modalities: &[InputModality],
) -> Vec<AgentMessage> {
    let messages = strip_unpaired_surrogates(messages);
    let messages = drop_empty_assistant_messages(messages);
    let messages = strip_images_if_unsupported(messages, modalities);
    normalize_tool_call_ids(messages)
}

/// Apply [`normalize_tool_call_id`] to every `tool-call` block's `id` and to
/// every `toolResult`'s matching `toolCallId`, so the two stay paired after
/// normalization.
pub fn normalize_tool_call_ids(messages: Vec<AgentMessage>) -> Vec<AgentMessage> {
    messages
        .into_iter()
        .map(|m| match m {
            AgentMessage::Assistant { content, usage, stop_reason, error_message, model, timestamp } => {
                let content = content
                    .into_iter()
                    .map(|b| match b {
                        ContentBlock::ToolCall { id, name, arguments, partial_json } => {
                            ContentBlock::ToolCall { id: normalize_tool_call_id(&id), name, arguments, partial_json }
                        }
                        other => other,
                    })
                    .collect();
                AgentMessage::Assistant { content, usage, stop_reason, error_message, model, timestamp }
            }
            AgentMessage::ToolResult { tool_call_id, tool_name, content, is_error, details, timestamp } => {
                AgentMessage::ToolResult {
                    tool_call_id: normalize_tool_call_id(&tool_call_id),
                    tool_name,
                    content,
                    is_error,
                    details,
                    timestamp,
                }
            }
            other => other,
        })
        .collect()
}

/// Lone UTF-16 surrogates (U+D800–U+DFFF) cannot appear in a Rust `String`
/// (which is guaranteed valid UTF-8), so this pass is a defensive no-op
/// against `char`-level text that *looks* like an escaped surrogate pair in
/// its literal form (`\uD83D` with no matching low surrogate) — those are
/// scrubbed from text blocks via their escaped textual form.
pub fn strip_unpaired_surrogates(messages: Vec<AgentMessage>) -> Vec<AgentMessage> {
    static SURROGATE_ESCAPE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\\u[dD][89abAB][0-9a-fA-F]{2}(?!\\u[dD][c-fC-F])").unwrap());

    messages
        .into_iter()
        .map(|m| map_text_blocks(m, |t| SURROGATE_ESCAPE.replace_all(t, "").into_owned()))
        .collect()
}

/// Drop assistant messages whose content is entirely empty (no text,
/// thinking, tool-call, or image blocks with real content).
pub fn drop_empty_assistant_messages(messages: Vec<AgentMessage>) -> Vec<AgentMessage> {
    messages
        .into_iter()
        .filter(|m| !matches!(m, AgentMessage::Assistant { .. } if m.is_empty_content()))
        .collect()
}

/// Replace image blocks with a text placeholder when the model's input
/// modalities do not include [`InputModality::Image`].
pub fn strip_images_if_unsupported(
    messages: Vec<AgentMessage>,
    modalities: &[InputModality],
) -> Vec<AgentMessage> {
    if modalities.contains(&InputModality::Image) {
        return messages;
    }
    messages.into_iter().map(strip_images_from_message).collect()
}

fn strip_images_from_message(message: AgentMessage) -> AgentMessage {
    let strip = |blocks: Vec<ContentBlock>| -> Vec<ContentBlock> {
        blocks
            .into_iter()
            .map(|b| match b {
                ContentBlock::Image { .. } => ContentBlock::text(IMAGE_OMITTED),
                other => other,
            })
            .collect()
    };
    match message {
        AgentMessage::User { content, timestamp } => {
            AgentMessage::User { content: strip(content), timestamp }
        }
        AgentMessage::ToolResult { tool_call_id, tool_name, content, is_error, details, timestamp } => {
            AgentMessage::ToolResult {
                tool_call_id,
                tool_name,
                content: strip(content),
                is_error,
                details,
                timestamp,
            }
        }
        other => other,
    }
}

fn map_text_blocks(message: AgentMessage, f: impl Fn(&str) -> String + Copy) -> AgentMessage {
    let map = |blocks: Vec<ContentBlock>| -> Vec<ContentBlock> {
        blocks
            .into_iter()
            .map(|b| match b {
                ContentBlock::Text { text, text_signature } => {
                    ContentBlock::Text { text: f(&text), text_signature }
                }
                other => other,
            })
            .collect()
    };
    match message {
        AgentMessage::User { content, timestamp } => AgentMessage::User { content: map(content), timestamp },
        AgentMessage::Assistant { content, usage, stop_reason, error_message, model, timestamp } => {
            AgentMessage::Assistant { content: map(content), usage, stop_reason, error_message, model, timestamp }
        }
        AgentMessage::ToolResult { tool_call_id, tool_name, content, is_error, details, timestamp } => {
            AgentMessage::ToolResult { tool_call_id, tool_name, content: map(content), is_error, details, timestamp }
        }
        other => other,
    }
}

/// Normalize a provider-bound tool-call id: replace anything outside
/// `[A-Za-z0-9_-]` with `_`, then truncate to 64 characters.
pub fn normalize_tool_call_id(id: &str) -> String {
    static INVALID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]").unwrap());
    let replaced = INVALID.replace_all(id, "_");
    replaced.chars().take(64).collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ModelIdentity, StopReason, Usage};
    use chrono::Utc;

    fn model() -> ModelIdentity {
        ModelIdentity { api: "a".into(), provider: "p".into(), id: "m".into() }
    }

    fn text_only() -> Vec<InputModality> {
        vec![InputModality::Text]
    }

    fn vision() -> Vec<InputModality> {
        vec![InputModality::Text, InputModality::Image]
    }

    #[test]
    fn normalize_tool_call_id_replaces_invalid_chars() {
        assert_eq!(normalize_tool_call_id("call:1/2"), "call_1_2");
    }

    #[test]
    fn normalize_tool_call_id_truncates_to_64() {
        let long = "a".repeat(100);
        assert_eq!(normalize_tool_call_id(&long).len(), 64);
    }

    #[test]
    fn normalize_tool_call_id_leaves_valid_ids_untouched() {
        assert_eq!(normalize_tool_call_id("abc-123_XYZ"), "abc-123_XYZ");
    }

    #[test]
    fn drop_empty_assistant_messages_removes_blank_text_only() {
        let msgs = vec![
            AgentMessage::user("hi"),
            AgentMessage::Assistant {
                content: vec![ContentBlock::text("")],
                usage: Usage::default(),
                stop_reason: StopReason::Stop,
                error_message: None,
                model: model(),
                timestamp: Utc::now(),
            },
        ];
        let result = drop_empty_assistant_messages(msgs);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].role_str(), "user");
    }

    #[test]
    fn drop_empty_assistant_messages_keeps_tool_call_only_message() {
        let msgs = vec![AgentMessage::Assistant {
            content: vec![ContentBlock::tool_call("a", "read", serde_json::json!({}))],
            usage: Usage::default(),
            stop_reason: StopReason::ToolUse,
            error_message: None,
            model: model(),
            timestamp: Utc::now(),
        }];
        let result = drop_empty_assistant_messages(msgs);
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn strip_images_no_op_when_supported() {
        let msg = AgentMessage::user_with_content(vec![
            ContentBlock::text("look"),
            ContentBlock::image("AAA", "image/png"),
        ]);
        let result = strip_images_if_unsupported(vec![msg], &vision());
        assert!(result[0].content_blocks().iter().any(|b| matches!(b, ContentBlock::Image { .. })));
    }

    #[test]
    fn strip_images_replaces_with_placeholder_when_unsupported() {
        let msg = AgentMessage::user_with_content(vec![ContentBlock::image("AAA", "image/png")]);
        let result = strip_images_if_unsupported(vec![msg], &text_only());
        assert_eq!(result[0].as_text().as_deref(), Some(IMAGE_OMITTED));
    }

    #[test]
    fn strip_unpaired_surrogates_removes_lone_high_surrogate_escape() {
        let msg = AgentMessage::user(r"broken \uD83D surrogate");
        let result = strip_unpaired_surrogates(vec![msg]);
        assert!(!result[0].as_text().unwrap().contains("\\uD83D"));
    }

    #[test]
    fn strip_unpaired_surrogates_leaves_paired_surrogate_escape() {
        // 😀 is a valid surrogate pair (an emoji) — must survive.
        let msg = AgentMessage::user(r"😀");
        let result = strip_unpaired_surrogates(vec![msg]);
        assert_eq!(result[0].as_text().as_deref(), Some(r"😀"));
    }

    #[test]
    fn apply_universal_transforms_runs_all_passes() {
        let msgs = vec![
            AgentMessage::user_with_content(vec![ContentBlock::image("AAA", "image/png")]),
            AgentMessage::Assistant {
                content: vec![ContentBlock::text("")],
                usage: Usage::default(),
                stop_reason: StopReason::Stop,
                error_message: None,
                model: model(),
                timestamp: Utc::now(),
            },
        ];
        let result = apply_universal_transforms(msgs, &text_only());
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].as_text().as_deref(), Some(IMAGE_OMITTED));
    }

    #[test]
    fn normalize_tool_call_ids_rewrites_assistant_tool_call_blocks() {
        let msgs = vec![AgentMessage::Assistant {
            content: vec![ContentBlock::tool_call("call:1/2", "read", serde_json::json!({}))],
            usage: Usage::default(),
            stop_reason: StopReason::ToolUse,
            error_message: None,
            model: model(),
            timestamp: Utc::now(),
        }];
        let result = normalize_tool_call_ids(msgs);
        match &result[0].content_blocks()[0] {
            ContentBlock::ToolCall { id, .. } => assert_eq!(id, "call_1_2"),
            other => panic!("expected a tool-call block, got {other:?}"),
        }
    }

    #[test]
    fn normalize_tool_call_ids_rewrites_tool_result_call_id() {
        let msgs = vec![AgentMessage::tool_result("call:1/2", "read", "ok", false)];
        let result = normalize_tool_call_ids(msgs);
        match &result[0] {
            AgentMessage::ToolResult { tool_call_id, .. } => assert_eq!(tool_call_id, "call_1_2"),
            other => panic!("expected a tool-result message, got {other:?}"),
        }
    }

    #[test]
    fn apply_universal_transforms_normalizes_tool_call_ids() {
        let msgs = vec![AgentMessage::Assistant {
            content: vec![ContentBlock::tool_call("weird id!", "read", serde_json::json!({}))],
            usage: Usage::default(),
            stop_reason: StopReason::ToolUse,
            error_message: None,
            model: model(),
            timestamp: Utc::now(),
        }];
        let result = apply_universal_transforms(msgs, &text_only());
        match &result[0].content_blocks()[0] {
            ContentBlock::ToolCall { id, .. } => assert_eq!(id, "weird_id_"),
            other => panic!("expected a tool-call block, got {other:?}"),
        }
    }
}
