// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context transformations (C9, §4.9): token-budget compaction and branch
//! summarization.

use std::collections::BTreeSet;

use agentcore_config::CompactionStrategy;
use agentcore_model::AgentMessage;
use agentcore_tools::OutputCategory;

// ─── Compaction prompts ───────────────────────────────────────────────────────

const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, file \
     names, code snippets, and tool outputs that may be relevant to future work. \
     The summary will replace the original history to free up context space.";

const STRUCTURED_COMPACTION_PROMPT: &str = "\
You are a context compaction assistant for a software engineering agent. \
Produce a structured state checkpoint from the conversation history below. \
Use EXACTLY the following Markdown sections — do not add or remove sections. \
Be information-dense: preserve file paths, function names, error messages, \
code snippets, test names, and technical decisions verbatim where they matter.

## Active Task
Describe in 1-3 sentences what the agent is currently working on.

## Key Decisions & Rationale
List every significant technical decision made and why (bullet points). \
Include file or component names.

## Files & Artifacts
List every file that was read, modified, or created, with a brief note on what was done.

## Constraints & Requirements
List every requirement, constraint, or user preference that must be preserved.

## Pending Items
List every unfinished subtask or open question.

## Session Narrative
Write a dense technical summary (2-5 paragraphs) of what happened, \
capturing the essential flow of events, tool outputs, and reasoning. \
Focus on facts the agent will need to continue correctly.";

// ─── Public API ───────────────────────────────────────────────────────────────

/// Strategy-aware compaction: replaces `messages` with a single summarization
/// request. The caller sends this request to the model and rebuilds history
/// from the reply; this function only performs the deterministic rewrite.
pub fn compact_session(messages: &mut Vec<AgentMessage>, strategy: CompactionStrategy) -> usize {
    let before = messages.len();
    let prompt = match strategy {
        CompactionStrategy::Structured => STRUCTURED_COMPACTION_PROMPT,
        CompactionStrategy::Narrative => SUMMARIZE_PROMPT,
    };
    let history_text = serialize_transcript(messages);
    let summary_request = AgentMessage::user(format!("{prompt}\n\n---\n\n{history_text}"));
    messages.clear();
    messages.push(summary_request);
    before
}

/// Emergency fallback compaction for a session too large to fit even a
/// compaction prompt. Drops all but the last `keep_n` messages and prepends a
/// canned notice. Deterministic — no model call, always succeeds.
pub fn emergency_compact(messages: &mut Vec<AgentMessage>, keep_n: usize) -> usize {
    let before = messages.len();
    let keep = keep_n.min(messages.len());
    let preserved: Vec<AgentMessage> = messages[messages.len() - keep..].to_vec();
    let notice = AgentMessage::assistant_text(
        "[Context emergency-compacted: earlier history was dropped to prevent a \
         context-window overflow. The agent may lack full context for earlier \
         decisions. Proceed carefully and ask the user to re-provide any missing \
         requirements if needed.]",
        agentcore_model::ModelIdentity { api: String::new(), provider: String::new(), id: String::new() },
    );
    messages.clear();
    messages.push(notice);
    messages.extend(preserved);
    before
}

/// Deterministic, content-aware tool-result truncation.
///
/// Returns `content` unchanged when it fits within `cap_tokens`. Otherwise
/// applies a category-specific extraction strategy that preserves the most
/// useful portion of the output. Dispatching on [`OutputCategory`] (not tool
/// name) keeps this independent of any concrete tool list.
///
/// - [`OutputCategory::HeadTail`]: first 60 + last 40 lines, so both the
///   command preamble and the final result stay visible.
/// - [`OutputCategory::MatchList`]: leading matches only — later matches are
///   less relevant, so the tail is not preserved.
/// - [`OutputCategory::FileContent`]: balanced head + tail, preserving both
///   imports/declarations and the most recent changes.
/// - [`OutputCategory::Generic`]: hard truncation at the nearest line
///   boundary.
///
/// Every truncated result ends with a notice so the model knows more content
/// exists.
pub fn smart_truncate(content: &str, category: OutputCategory, cap_tokens: usize) -> String {
    if cap_tokens == 0 {
        return content.to_string();
    }
    let cap_chars = cap_tokens * 4;
    if content.len() <= cap_chars {
        return content.to_string();
    }
    let omitted_bytes = content.len().saturating_sub(cap_chars);
    match category {
        OutputCategory::HeadTail => head_tail_lines(
            content,
            cap_chars,
            60,
            40,
            &format!("[... {{lines}} lines / {omitted_bytes} bytes omitted ...]"),
        ),
        OutputCategory::MatchList => head_lines(
            content,
            cap_chars,
            &format!(
                "[... {{lines}} more matches omitted ({omitted_bytes} bytes); \
                     use a more specific pattern to see them ...]"
            ),
        ),
        OutputCategory::FileContent => head_tail_lines(
            content,
            cap_chars,
            usize::MAX,
            usize::MAX,
            &format!(
                "[... {{lines}} lines omitted ({omitted_bytes} bytes); \
                     re-read with a narrower offset/limit to see more ...]"
            ),
        ),
        OutputCategory::Generic => {
            let cut = content[..cap_chars].rfind('\n').map(|p| p + 1).unwrap_or(cap_chars);
            format!(
                "{}\n[... {omitted_bytes} bytes omitted; \
                 content truncated to fit context budget ...]",
                &content[..cut]
            )
        }
    }
}

/// Serialize a message history into the fixed plain-text transcript format
/// consumed by both the compaction prompts above and branch summarization:
/// `[User]:`, `[Assistant]:`, `[Assistant tool calls]:`, `[Tool result]:`.
pub fn serialize_transcript(messages: &[AgentMessage]) -> String {
    let mut blocks = Vec::with_capacity(messages.len());
    for m in messages {
        match m {
            AgentMessage::User { .. } => {
                if let Some(text) = m.as_text() {
                    blocks.push(format!("[User]:\n{text}"));
                }
            }
            AgentMessage::Assistant { .. } => {
                if let Some(text) = m.as_text() {
                    if !text.is_empty() {
                        blocks.push(format!("[Assistant]:\n{text}"));
                    }
                }
                let calls = m.tool_calls();
                if !calls.is_empty() {
                    let rendered = calls
                        .iter()
                        .map(|(id, name, args)| format!("{name}({args}) [{id}]"))
                        .collect::<Vec<_>>()
                        .join("\n");
                    blocks.push(format!("[Assistant tool calls]:\n{rendered}"));
                }
            }
            AgentMessage::ToolResult { .. } => {
                if let Some(text) = m.as_text() {
                    blocks.push(format!("[Tool result]:\n{text}"));
                }
            }
            AgentMessage::Custom(_) => {}
        }
    }
    blocks.join("\n\n")
}

/// Cumulative file touches observed along a branch, used to seed a
/// checkpoint of "what this branch has already looked at / changed" without
/// replaying every tool call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchSummary {
    pub read_files: Vec<String>,
    pub modified_files: Vec<String>,
}

/// Walk `messages` (the path from the deepest common ancestor down to the
/// branch tip — resolution of that path is the session store's job, C8)
/// and accumulate the files it read versus modified.
///
/// A `read`-named tool call contributes to `read_files`; `write` or `edit`
/// contribute to `modified_files`. Args are inspected for a `path` or `file`
/// string field; calls without one are ignored. Order is call order with
/// duplicates collapsed, first occurrence wins.
pub fn summarize_branch(messages: &[AgentMessage]) -> BranchSummary {
    let mut read_files = Vec::new();
    let mut modified_files = Vec::new();
    let mut seen_read = BTreeSet::new();
    let mut seen_modified = BTreeSet::new();

    for m in messages {
        if let AgentMessage::Assistant { .. } = m {
            for (_, name, args) in m.tool_calls() {
                let Some(path) = extract_path(args) else { continue };
                match name {
                    "read" => {
                        if seen_read.insert(path.clone()) {
                            read_files.push(path);
                        }
                    }
                    "write" | "edit" => {
                        if seen_modified.insert(path.clone()) {
                            modified_files.push(path);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    BranchSummary { read_files, modified_files }
}

fn extract_path(args: &serde_json::Value) -> Option<String> {
    args.get("path")
        .or_else(|| args.get("file"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

// ─── Private helpers ──────────────────────────────────────────────────────────

/// Keep only the leading lines that fit within `cap_chars`.
fn head_lines(content: &str, cap_chars: usize, notice_template: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let mut kept = String::with_capacity(cap_chars);
    let mut kept_count = 0usize;
    for line in &lines {
        let needed = if kept.is_empty() { line.len() } else { line.len() + 1 };
        if kept.len() + needed > cap_chars {
            break;
        }
        if !kept.is_empty() {
            kept.push('\n');
        }
        kept.push_str(line);
        kept_count += 1;
    }
    let omitted = lines.len().saturating_sub(kept_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{kept}\n{notice}")
}

/// Keep `max_head` leading lines and `max_tail` trailing lines, inserting a
/// notice between them. Pass `usize::MAX` to split evenly by character budget.
fn head_tail_lines(content: &str, cap_chars: usize, max_head: usize, max_tail: usize, notice_template: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let half_cap = cap_chars / 2;

    let mut head = String::with_capacity(half_cap);
    let mut head_count = 0usize;
    for line in lines.iter().take(max_head) {
        let needed = if head.is_empty() { line.len() } else { line.len() + 1 };
        if head.len() + needed > half_cap {
            break;
        }
        if !head.is_empty() {
            head.push('\n');
        }
        head.push_str(line);
        head_count += 1;
    }

    let mut tail_lines: Vec<&str> = Vec::new();
    let mut tail_chars = 0usize;
    for line in lines.iter().rev().take(max_tail) {
        let needed = if tail_lines.is_empty() { line.len() } else { line.len() + 1 };
        if tail_chars + needed > half_cap {
            break;
        }
        tail_chars += needed;
        tail_lines.push(line);
    }
    tail_lines.reverse();
    let tail_count = tail_lines.len();
    let tail = tail_lines.join("\n");

    let omitted = lines.len().saturating_sub(head_count + tail_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{head}\n{notice}\n{tail}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use agentcore_model::ModelIdentity;
    use serde_json::json;

    use super::*;

    fn model() -> ModelIdentity {
        ModelIdentity { api: "mock".into(), provider: "mock".into(), id: "mock-model".into() }
    }

    fn make_history() -> Vec<AgentMessage> {
        vec![
            AgentMessage::user("What is Rust?"),
            AgentMessage::assistant_text("Rust is a systems programming language.", model()),
            AgentMessage::user("Show me an example."),
            AgentMessage::assistant_text("fn main() { println!(\"Hello\"); }", model()),
        ]
    }

    #[test]
    fn compact_session_returns_original_message_count() {
        let mut msgs = make_history();
        let before = compact_session(&mut msgs, CompactionStrategy::Narrative);
        assert_eq!(before, 4);
    }

    #[test]
    fn compact_session_replaces_history_with_single_user_request() {
        let mut msgs = make_history();
        compact_session(&mut msgs, CompactionStrategy::Narrative);
        assert_eq!(msgs.len(), 1);
        assert!(matches!(msgs[0], AgentMessage::User { .. }));
    }

    #[test]
    fn compact_session_summary_contains_original_text() {
        let mut msgs = make_history();
        compact_session(&mut msgs, CompactionStrategy::Narrative);
        let text = msgs[0].as_text().unwrap();
        assert!(text.contains("What is Rust?"));
        assert!(text.contains("systems programming language"));
    }

    #[test]
    fn compact_session_structured_uses_structured_prompt() {
        let mut msgs = make_history();
        compact_session(&mut msgs, CompactionStrategy::Structured);
        let text = msgs[0].as_text().unwrap();
        assert!(text.contains("## Active Task"));
        assert!(text.contains("## Session Narrative"));
    }

    #[test]
    fn emergency_compact_keeps_only_last_n_messages() {
        let mut msgs = make_history();
        emergency_compact(&mut msgs, 2);
        // notice + last 2 preserved
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs.last().unwrap().as_text().as_deref(), Some("fn main() { println!(\"Hello\"); }"));
    }

    #[test]
    fn emergency_compact_notice_is_first() {
        let mut msgs = make_history();
        emergency_compact(&mut msgs, 1);
        assert!(msgs[0].as_text().unwrap().contains("emergency-compacted"));
    }

    #[test]
    fn emergency_compact_keep_n_larger_than_history_keeps_everything() {
        let mut msgs = make_history();
        let original_len = msgs.len();
        emergency_compact(&mut msgs, 100);
        assert_eq!(msgs.len(), original_len + 1);
    }

    #[test]
    fn smart_truncate_returns_content_unchanged_when_under_cap() {
        let content = "short";
        assert_eq!(smart_truncate(content, OutputCategory::Generic, 1000), content);
    }

    #[test]
    fn smart_truncate_generic_cuts_at_line_boundary() {
        let content = (0..100).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let truncated = smart_truncate(&content, OutputCategory::Generic, 10);
        assert!(truncated.contains("bytes omitted"));
        assert!(truncated.len() < content.len());
    }

    #[test]
    fn smart_truncate_head_tail_preserves_both_ends() {
        let content = (0..200).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let truncated = smart_truncate(&content, OutputCategory::HeadTail, 50);
        assert!(truncated.contains("line 0"));
        assert!(truncated.contains("line 199"));
        assert!(truncated.contains("omitted"));
    }

    #[test]
    fn smart_truncate_match_list_keeps_only_head() {
        let content = (0..200).map(|i| format!("match {i}")).collect::<Vec<_>>().join("\n");
        let truncated = smart_truncate(&content, OutputCategory::MatchList, 20);
        assert!(truncated.contains("match 0"));
        assert!(!truncated.contains("match 199"));
    }

    // ── serialize_transcript ─────────────────────────────────────────────────

    #[test]
    fn serialize_transcript_tags_each_role() {
        let messages = vec![
            AgentMessage::user("hi"),
            AgentMessage::assistant_text("hello", model()),
            AgentMessage::tool_result("call-1", "shell", "output", false),
        ];
        let text = serialize_transcript(&messages);
        assert!(text.contains("[User]:\nhi"));
        assert!(text.contains("[Assistant]:\nhello"));
        assert!(text.contains("[Tool result]:\noutput"));
    }

    #[test]
    fn serialize_transcript_renders_tool_calls_distinctly_from_text() {
        let assistant_with_call = AgentMessage::Assistant {
            content: vec![agentcore_model::ContentBlock::tool_call("call-1", "shell", json!({"command": "ls"}))],
            usage: Default::default(),
            stop_reason: agentcore_model::StopReason::ToolUse,
            error_message: None,
            model: model(),
            timestamp: chrono::Utc::now(),
        };
        let text = serialize_transcript(std::slice::from_ref(&assistant_with_call));
        assert!(text.contains("[Assistant tool calls]:"));
        assert!(text.contains("shell("));
    }

    #[test]
    fn serialize_transcript_skips_custom_messages() {
        let messages = vec![AgentMessage::Custom(json!({"kind": "internal"}))];
        assert_eq!(serialize_transcript(&messages), "");
    }

    // ── summarize_branch ─────────────────────────────────────────────────────

    fn tool_call_message(name: &str, args: serde_json::Value) -> AgentMessage {
        AgentMessage::Assistant {
            content: vec![agentcore_model::ContentBlock::tool_call("c1", name, args)],
            usage: Default::default(),
            stop_reason: agentcore_model::StopReason::ToolUse,
            error_message: None,
            model: model(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn summarize_branch_collects_read_and_modified_files_separately() {
        let messages = vec![
            tool_call_message("read", json!({"path": "a.rs"})),
            tool_call_message("write", json!({"path": "b.rs"})),
            tool_call_message("edit", json!({"path": "c.rs"})),
        ];
        let summary = summarize_branch(&messages);
        assert_eq!(summary.read_files, vec!["a.rs"]);
        assert_eq!(summary.modified_files, vec!["b.rs", "c.rs"]);
    }

    #[test]
    fn summarize_branch_dedupes_repeated_paths_keeping_first_occurrence_order() {
        let messages = vec![
            tool_call_message("read", json!({"path": "a.rs"})),
            tool_call_message("read", json!({"path": "b.rs"})),
            tool_call_message("read", json!({"path": "a.rs"})),
        ];
        let summary = summarize_branch(&messages);
        assert_eq!(summary.read_files, vec!["a.rs", "b.rs"]);
    }

    #[test]
    fn summarize_branch_ignores_calls_without_a_path_argument() {
        let messages = vec![tool_call_message("read", json!({"pattern": "*.rs"}))];
        let summary = summarize_branch(&messages);
        assert!(summary.read_files.is_empty());
    }

    #[test]
    fn summarize_branch_ignores_unrelated_tool_names() {
        let messages = vec![tool_call_message("shell", json!({"path": "a.rs"}))];
        let summary = summarize_branch(&messages);
        assert!(summary.read_files.is_empty());
        assert!(summary.modified_files.is_empty());
    }
}
