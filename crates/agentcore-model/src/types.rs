// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Content blocks ────────────────────────────────────────────────────────

/// One piece of content inside a message.
///
/// Order is preserved exactly as produced by the provider: thinking before
/// text before tool-calls is typical but never enforced here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        /// Opaque id some providers require echoed back to keep reasoning
        /// and tool-call pairing intact across turns.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text_signature: Option<String>,
    },
    Thinking {
        thinking: String,
        /// Opaque signature. If missing on replay, the caller must downgrade
        /// this block to `Text` before sending it back to the provider.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking_signature: Option<String>,
    },
    ToolCall {
        id: String,
        name: String,
        /// Best-effort parsed arguments; authoritative once the block is
        /// finalized (`toolcall_end`).
        arguments: Value,
        /// Raw JSON-fragment buffer accumulated during streaming. Cleared
        /// once `arguments` is finalized.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial_json: Option<String>,
    },
    Image {
        /// Base64-encoded image bytes (no data-url prefix).
        data: String,
        mime_type: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into(), text_signature: None }
    }

    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::Image { data: data.into(), mime_type: mime_type.into() }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self::ToolCall { id: id.into(), name: name.into(), arguments, partial_json: None }
    }

    /// Approximate token contribution of this block: ~4 chars/token for
    /// text, OpenAI's fixed per-image estimates otherwise.
    pub fn approx_tokens(&self) -> usize {
        match self {
            Self::Text { text, .. } => text.len() / 4,
            Self::Thinking { thinking, .. } => thinking.len() / 4,
            Self::ToolCall { name, arguments, .. } => {
                (name.len() + arguments.to_string().len()) / 4
            }
            // No per-block detail flag at this layer; providers that need the
            // 85-token "low detail" discount apply it themselves when they
            // serialize the block onto the wire.
            Self::Image { .. } => 765,
        }
    }
}

// ─── Model identity & usage ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelIdentity {
    pub api: String,
    pub provider: String,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Cost {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input: u32,
    pub output: u32,
    pub cache_read: u32,
    pub cache_write: u32,
    pub total_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<Cost>,
}

impl Usage {
    pub fn new(input: u32, output: u32, cache_read: u32, cache_write: u32) -> Self {
        Self {
            input,
            output,
            cache_read,
            cache_write,
            total_tokens: input + output + cache_read + cache_write,
            cost: None,
        }
    }

    /// Apply a per-million-token price table, filling in `cost`.
    pub fn with_cost(mut self, prices: &crate::catalog::PriceTable) -> Self {
        let per_tok = |n: u32, price_per_million: f64| (n as f64) * price_per_million / 1_000_000.0;
        let cost = Cost {
            input: per_tok(self.input, prices.input_per_million),
            output: per_tok(self.output, prices.output_per_million),
            cache_read: per_tok(self.cache_read, prices.cache_read_per_million),
            cache_write: per_tok(self.cache_write, prices.cache_write_per_million),
            total: 0.0,
        };
        let total = cost.input + cost.output + cost.cache_read + cost.cache_write;
        self.cost = Some(Cost { total, ..cost });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    Length,
    ToolUse,
    Aborted,
    Error,
}

/// Static capabilities and limits of a model, resolved from the catalog or
/// supplied directly by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Wire protocol family, e.g. "anthropic-messages", "openai-responses".
    pub api: String,
    /// Logical provider id, e.g. "anthropic", "groq".
    pub provider: String,
    pub id: String,
    pub base_url: String,
    pub max_tokens: u32,
    pub context_window: u32,
    pub input_text: bool,
    pub input_image: bool,
    pub reasoning: bool,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
}

// ─── Messages ──────────────────────────────────────────────────────────────

/// Normalized message — the unit of conversation history the whole runtime
/// operates on. Tagged union over the four roles the spec recognizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum AgentMessage {
    User {
        content: Vec<ContentBlock>,
        timestamp: DateTime<Utc>,
    },
    Assistant {
        content: Vec<ContentBlock>,
        usage: Usage,
        stop_reason: StopReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        model: ModelIdentity,
        timestamp: DateTime<Utc>,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: Vec<ContentBlock>,
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
        timestamp: DateTime<Utc>,
    },
    /// Extension-owned. The loop never inspects this; a caller-supplied
    /// `convert_to_llm` function must reduce it to one of the other three
    /// variants before the message reaches a provider.
    Custom(Value),
}

impl AgentMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User { content: vec![ContentBlock::text(text)], timestamp: Utc::now() }
    }

    pub fn user_with_content(content: Vec<ContentBlock>) -> Self {
        Self::User { content, timestamp: Utc::now() }
    }

    pub fn assistant_text(text: impl Into<String>, model: ModelIdentity) -> Self {
        Self::Assistant {
            content: vec![ContentBlock::text(text)],
            usage: Usage::default(),
            stop_reason: StopReason::Stop,
            error_message: None,
            model,
            timestamp: Utc::now(),
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        text: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: vec![ContentBlock::text(text)],
            is_error,
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn role_str(&self) -> &'static str {
        match self {
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::ToolResult { .. } => "tool_result",
            Self::Custom(_) => "custom",
        }
    }

    /// Content blocks for the variants that carry them (`Custom` has none).
    pub fn content_blocks(&self) -> &[ContentBlock] {
        match self {
            Self::User { content, .. } => content,
            Self::Assistant { content, .. } => content,
            Self::ToolResult { content, .. } => content,
            Self::Custom(_) => &[],
        }
    }

    /// Concatenation of all `Text` blocks, if any.
    pub fn as_text(&self) -> Option<String> {
        let texts: Vec<&str> = self
            .content_blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if texts.is_empty() { None } else { Some(texts.join("")) }
    }

    /// All tool-call blocks present in this message, in wire order.
    pub fn tool_calls(&self) -> Vec<(&str, &str, &Value)> {
        self.content_blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolCall { id, name, arguments, .. } => {
                    Some((id.as_str(), name.as_str(), arguments))
                }
                _ => None,
            })
            .collect()
    }

    /// `true` if this message carries no non-empty content (used to decide
    /// whether a partial assistant message should be committed on abort).
    pub fn is_empty_content(&self) -> bool {
        match self {
            Self::Custom(_) => false,
            _ => self.content_blocks().iter().all(|b| match b {
                ContentBlock::Text { text, .. } => text.is_empty(),
                ContentBlock::Thinking { thinking, .. } => thinking.is_empty(),
                ContentBlock::ToolCall { .. } => false,
                ContentBlock::Image { .. } => false,
            }),
        }
    }

    /// 4-chars-per-token heuristic over all content blocks, floored at 1.
    pub fn approx_tokens(&self) -> usize {
        match self {
            Self::Custom(v) => (v.to_string().len() / 4).max(1),
            _ => self.content_blocks().iter().map(ContentBlock::approx_tokens).sum::<usize>().max(1),
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::User { timestamp, .. } => Some(*timestamp),
            Self::Assistant { timestamp, .. } => Some(*timestamp),
            Self::ToolResult { timestamp, .. } => Some(*timestamp),
            Self::Custom(_) => None,
        }
    }
}

// ─── Tool schema & completion request ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningLevel {
    Off,
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheRetention {
    None,
    Short,
    Long,
}

/// Per-call options threaded through to a provider's `stream` call.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub reasoning: ReasoningLevel,
    pub session_id: Option<String>,
    pub thinking_budget_tokens: Option<u32>,
    pub cache_retention: CacheRetention,
    pub headers: std::collections::HashMap<String, String>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            api_key: None,
            temperature: None,
            max_tokens: None,
            reasoning: ReasoningLevel::Off,
            session_id: None,
            thinking_budget_tokens: None,
            cache_retention: CacheRetention::None,
            headers: std::collections::HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: ModelDescriptor,
    pub messages: Vec<AgentMessage>,
    pub tools: Vec<ToolSchema>,
    /// See [`CompletionOptions`] for the per-call knobs; carried separately
    /// so callers can reuse a request across retries with a fresh api key.
    pub options: CompletionOptions,
    /// Dynamic context (branch/commit/CI info) appended to the system
    /// message outside the cached prefix. See `sanitize::split_cacheable_system`.
    pub system_dynamic_suffix: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ModelIdentity {
        ModelIdentity { api: "anthropic-messages".into(), provider: "anthropic".into(), id: "claude".into() }
    }

    #[test]
    fn user_message_role_and_text() {
        let m = AgentMessage::user("hello");
        assert_eq!(m.role_str(), "user");
        assert_eq!(m.as_text().as_deref(), Some("hello"));
    }

    #[test]
    fn assistant_text_sets_stop_reason_and_model() {
        let m = AgentMessage::assistant_text("hi", model());
        match &m {
            AgentMessage::Assistant { stop_reason, model, .. } => {
                assert_eq!(*stop_reason, StopReason::Stop);
                assert_eq!(model.provider, "anthropic");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn tool_result_sets_error_flag() {
        let m = AgentMessage::tool_result("t1", "read", "boom", true);
        match &m {
            AgentMessage::ToolResult { is_error, tool_call_id, .. } => {
                assert!(is_error);
                assert_eq!(tool_call_id, "t1");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn tool_calls_extracts_blocks_in_order() {
        let m = AgentMessage::Assistant {
            content: vec![
                ContentBlock::tool_call("a", "read", serde_json::json!({"path":"x"})),
                ContentBlock::tool_call("b", "write", serde_json::json!({"path":"y"})),
            ],
            usage: Usage::default(),
            stop_reason: StopReason::ToolUse,
            error_message: None,
            model: model(),
            timestamp: Utc::now(),
        };
        let calls = m.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "a");
        assert_eq!(calls[1].0, "b");
    }

    #[test]
    fn is_empty_content_true_for_blank_text() {
        let m = AgentMessage::User { content: vec![ContentBlock::text("")], timestamp: Utc::now() };
        assert!(m.is_empty_content());
    }

    #[test]
    fn is_empty_content_false_with_tool_call() {
        let m = AgentMessage::Assistant {
            content: vec![ContentBlock::tool_call("a", "read", serde_json::json!({}))],
            usage: Usage::default(),
            stop_reason: StopReason::ToolUse,
            error_message: None,
            model: model(),
            timestamp: Utc::now(),
        };
        assert!(!m.is_empty_content());
    }

    #[test]
    fn approx_tokens_floors_at_one() {
        let m = AgentMessage::user("hi");
        assert_eq!(m.approx_tokens(), 1);
    }

    #[test]
    fn approx_tokens_divides_by_four() {
        let m = AgentMessage::user("12345678");
        assert_eq!(m.approx_tokens(), 2);
    }

    #[test]
    fn usage_total_tokens_is_sum_of_components() {
        let u = Usage::new(10, 20, 5, 3);
        assert_eq!(u.total_tokens, 38);
    }

    #[test]
    fn usage_with_cost_computes_total() {
        let prices = crate::catalog::PriceTable {
            input_per_million: 3.0,
            output_per_million: 15.0,
            cache_read_per_million: 0.3,
            cache_write_per_million: 3.75,
        };
        let u = Usage::new(1_000_000, 1_000_000, 0, 0).with_cost(&prices);
        let cost = u.cost.unwrap();
        assert!((cost.input - 3.0).abs() < 1e-9);
        assert!((cost.output - 15.0).abs() < 1e-9);
        assert!((cost.total - 18.0).abs() < 1e-9);
    }

    #[test]
    fn message_serializes_with_role_tag() {
        let m = AgentMessage::user("x");
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"role\":\"user\""));
    }

    #[test]
    fn message_round_trips_through_json() {
        let m = AgentMessage::assistant_text("reply", model());
        let json = serde_json::to_string(&m).unwrap();
        let back: AgentMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_text().as_deref(), Some("reply"));
    }

    #[test]
    fn custom_message_round_trips_as_opaque_value() {
        let m = AgentMessage::Custom(serde_json::json!({"kind": "notification", "text": "hi"}));
        let json = serde_json::to_string(&m).unwrap();
        let back: AgentMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, AgentMessage::Custom(_)));
    }

    #[test]
    fn content_block_image_tokens_fixed_estimate() {
        let b = ContentBlock::image("AAA", "image/png");
        assert_eq!(b.approx_tokens(), 765);
    }
}
