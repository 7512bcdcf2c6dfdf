// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Best-effort JSON parser for incrementally-streamed tool-call arguments.
//!
//! Providers stream tool-call arguments as raw JSON text fragments that are
//! only valid JSON once fully assembled. [`parse`] lets the agent loop show
//! a live, best-effort `arguments` object after every delta instead of
//! waiting for `toolcall_end`. It never panics and never returns `Err`:
//! irrecoverable input yields `{}`.

use serde_json::Value;

/// Parse `buf` as JSON, repairing an incomplete-but-well-formed-so-far
/// streaming fragment by closing any strings/arrays/objects left open.
pub fn parse(buf: &str) -> Value {
    if buf.trim().is_empty() {
        return Value::Object(Default::default());
    }
    if let Ok(v) = serde_json::from_str(buf) {
        return v;
    }
    let completed = complete_structurally(buf);
    serde_json::from_str(&completed).unwrap_or_else(|_| Value::Object(Default::default()))
}

/// Close every open string, array, and object in `buf`, in the correct
/// nesting order, so the result is syntactically valid JSON (though its
/// values may be truncated).
fn complete_structurally(buf: &str) -> String {
    let mut out = String::with_capacity(buf.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut chars = buf.chars().peekable();

    while let Some(c) = chars.next() {
        out.push(c);
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    // An open string at EOF: close it so the rest of the structure can close.
    if in_string {
        out.push('"');
    }
    // Drop a dangling key/value separator or trailing comma so closing
    // braces don't produce `{"a":}` or `{"a":1,}`.
    let trimmed = out.trim_end();
    let out = if trimmed.ends_with(':') || trimmed.ends_with(',') {
        trimmed[..trimmed.len() - 1].to_string()
    } else {
        out
    };

    let mut out = out;
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
