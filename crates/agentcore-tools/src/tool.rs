// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim).
    pub id: String,
    pub name: String,
    /// Coerced JSON arguments.
    pub args: Value,
}

/// A single content item in a rich tool output.
///
/// Most tools produce only `Text`. Vision-capable tools may produce a mix of
/// `Text` and `Image` items.
#[derive(Debug, Clone)]
pub enum ToolOutputPart {
    /// Plain UTF-8 text.
    Text(String),
    /// Base64 data URL: `data:<mime>;base64,<b64>`.
    Image(String),
}

/// A partial result a tool reports while still running, via `on_update`.
///
/// The executor forwards this as a `tool_execution_update` agent event. If
/// the call is later cancelled (e.g. due to a steering interruption) any
/// update already emitted may simply be discarded — it never lands in the
/// conversation on its own.
#[derive(Debug, Clone, Default)]
pub struct ToolUpdate {
    pub parts: Vec<ToolOutputPart>,
}

/// What a tool returns on success, before the executor wraps it into a
/// [`ToolOutput`] addressed to a specific call.
#[derive(Debug, Clone, Default)]
pub struct ToolSuccess {
    pub parts: Vec<ToolOutputPart>,
    /// Opaque, UI-facing detail blob. Never interpreted by the executor.
    pub details: Option<Value>,
}

impl ToolSuccess {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            parts: vec![ToolOutputPart::Text(content.into())],
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// The result of executing a tool, addressed to a specific `toolCallId`.
///
/// `content` is always the plain-text representation of the output (the
/// concatenation of all `Text` parts) so callers that only need text never
/// have to match on `parts`.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    pub parts: Vec<ToolOutputPart>,
    pub details: Option<Value>,
    /// If true, the execution failed; `content` carries the error message.
    pub is_error: bool,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let text = content.into();
        Self {
            call_id: call_id.into(),
            content: text.clone(),
            parts: vec![ToolOutputPart::Text(text)],
            details: None,
            is_error: false,
        }
    }

    /// Error result containing a plain-text error message.
    ///
    /// This is the shape the executor synthesizes both for a tool that
    /// returned `Err` and for calls skipped due to a steering interruption.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        let text = msg.into();
        Self {
            call_id: call_id.into(),
            content: text.clone(),
            parts: vec![ToolOutputPart::Text(text)],
            details: None,
            is_error: true,
        }
    }

    pub fn from_success(call_id: impl Into<String>, success: ToolSuccess) -> Self {
        let text = success
            .parts
            .iter()
            .filter_map(|p| match p {
                ToolOutputPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            call_id: call_id.into(),
            content: text,
            parts: success.parts,
            details: success.details,
            is_error: false,
        }
    }

    pub fn has_images(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, ToolOutputPart::Image(_)))
    }
}

/// Describes the shape of a tool's text output for context-aware truncation.
///
/// The executor never enforces truncation itself — each tool is responsible
/// for keeping its own output within budget — but callers that *do* trim
/// (e.g. a context-compaction pass) use this hint to pick an extraction
/// strategy instead of a blind character cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Terminal / process output: keep the first N + last M lines so both
    /// the command preamble and the final result stay visible.
    HeadTail,
    /// Ordered match list: keep the leading matches, the highest-relevance
    /// ones first.
    MatchList,
    /// File content: keep a head and tail window so both the top (imports,
    /// declarations) and the end (recent changes) survive a cut.
    FileContent,
    /// Generic text: hard-truncate at the character boundary.
    #[default]
    Generic,
}

/// Trait every tool the agent loop can invoke must implement.
///
/// `execute` receives the arguments already coerced against
/// [`Tool::parameters_schema`], a cancellation token the loop fires when a
/// steering message interrupts the turn, and an `on_update` callback for
/// reporting incremental progress. A tool signals failure by returning
/// `Err`; the executor — never the tool — is responsible for turning that
/// into an `isError` [`ToolOutput`], so a failing tool never needs to know
/// about the surrounding conversation.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    /// Short, human-readable label (distinct from `name`, which is the
    /// wire identifier the model emits in `tool-call` blocks).
    fn label(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters.
    fn parameters_schema(&self) -> Value;
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }
    async fn execute(
        &self,
        call_id: &str,
        args: &Value,
        cancel: &CancellationToken,
        on_update: &(dyn Fn(ToolUpdate) + Send + Sync),
    ) -> anyhow::Result<ToolSuccess>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use serde_json::json;

    use super::*;

    #[test]
    fn output_category_default_is_generic() {
        assert_eq!(OutputCategory::default(), OutputCategory::Generic);
    }

    #[test]
    fn output_category_variants_are_distinct() {
        assert_ne!(OutputCategory::HeadTail, OutputCategory::MatchList);
        assert_ne!(OutputCategory::HeadTail, OutputCategory::FileContent);
        assert_ne!(OutputCategory::HeadTail, OutputCategory::Generic);
        assert_ne!(OutputCategory::MatchList, OutputCategory::FileContent);
        assert_ne!(OutputCategory::MatchList, OutputCategory::Generic);
        assert_ne!(OutputCategory::FileContent, OutputCategory::Generic);
    }

    #[test]
    fn output_category_copy_semantics() {
        let a = OutputCategory::HeadTail;
        let b = a;
        assert_eq!(a, b);
    }

    #[test]
    fn tool_output_ok_mirrors_content_into_parts() {
        let out = ToolOutput::ok("c1", "hello");
        assert!(!out.is_error);
        assert_eq!(out.content, "hello");
        assert!(matches!(&out.parts[0], ToolOutputPart::Text(t) if t == "hello"));
    }

    #[test]
    fn tool_output_err_is_flagged() {
        let out = ToolOutput::err("c1", "boom");
        assert!(out.is_error);
        assert_eq!(out.content, "boom");
    }

    #[test]
    fn tool_output_has_images_detects_image_parts() {
        let out = ToolOutput::from_success(
            "c1",
            ToolSuccess {
                parts: vec![
                    ToolOutputPart::Text("caption".into()),
                    ToolOutputPart::Image("data:image/png;base64,AA==".into()),
                ],
                details: None,
            },
        );
        assert!(out.has_images());
        assert_eq!(out.content, "caption");
    }

    struct MinimalTool;

    #[async_trait]
    impl Tool for MinimalTool {
        fn name(&self) -> &str {
            "minimal"
        }
        fn label(&self) -> &str {
            "Minimal"
        }
        fn description(&self) -> &str {
            "a minimal tool"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(
            &self,
            _call_id: &str,
            _args: &Value,
            _cancel: &CancellationToken,
            _on_update: &(dyn Fn(ToolUpdate) + Send + Sync),
        ) -> anyhow::Result<ToolSuccess> {
            Ok(ToolSuccess::text("ok"))
        }
    }

    struct HeadTailTool;

    #[async_trait]
    impl Tool for HeadTailTool {
        fn name(&self) -> &str {
            "ht"
        }
        fn label(&self) -> &str {
            "Head/Tail"
        }
        fn description(&self) -> &str {
            "produces terminal output"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn output_category(&self) -> OutputCategory {
            OutputCategory::HeadTail
        }
        async fn execute(
            &self,
            _call_id: &str,
            _args: &Value,
            _cancel: &CancellationToken,
            _on_update: &(dyn Fn(ToolUpdate) + Send + Sync),
        ) -> anyhow::Result<ToolSuccess> {
            Ok(ToolSuccess::text("ok"))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "failing"
        }
        fn label(&self) -> &str {
            "Failing"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(
            &self,
            _call_id: &str,
            _args: &Value,
            _cancel: &CancellationToken,
            _on_update: &(dyn Fn(ToolUpdate) + Send + Sync),
        ) -> anyhow::Result<ToolSuccess> {
            Err(anyhow!("disk on fire"))
        }
    }

    #[test]
    fn tool_default_output_category_is_generic() {
        assert_eq!(MinimalTool.output_category(), OutputCategory::Generic);
    }

    #[test]
    fn tool_can_override_output_category() {
        assert_eq!(HeadTailTool.output_category(), OutputCategory::HeadTail);
    }

    #[test]
    fn overridden_category_differs_from_default() {
        assert_ne!(
            HeadTailTool.output_category(),
            MinimalTool.output_category()
        );
    }

    #[tokio::test]
    async fn failing_tool_returns_err_not_panic() {
        let cancel = CancellationToken::new();
        let result = FailingTool
            .execute("c1", &json!({}), &cancel, &|_| {})
            .await;
        assert!(result.is_err());
    }
}
