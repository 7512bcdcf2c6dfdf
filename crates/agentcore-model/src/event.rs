// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The provider-level event channel (C2).
//!
//! A cold, single-producer/single-consumer stream of [`AssistantStreamEvent`]s
//! with a terminal predicate. Built on a capacity-1 `tokio::mpsc` channel so
//! the producer (a provider adapter) blocks on `send` until the consumer
//! (the agent loop) has drained the previous event — that blocking is the
//! channel's backpressure.

use tokio::sync::mpsc;

use crate::types::{AgentMessage, StopReason};

/// One event produced while streaming a single assistant turn.
#[derive(Debug, Clone)]
pub enum AssistantStreamEvent {
    Start { partial: AgentMessage },
    TextStart { content_index: usize },
    TextDelta { content_index: usize, delta: String },
    TextEnd { content_index: usize, content: String, signature: Option<String> },
    ThinkingStart { content_index: usize },
    ThinkingDelta { content_index: usize, delta: String },
    ThinkingEnd { content_index: usize, content: String, signature: Option<String> },
    ToolCallStart { content_index: usize, id: String, name: String },
    ToolCallDelta { content_index: usize, delta: String },
    ToolCallEnd { content_index: usize, tool_call: (String, String, serde_json::Value) },
    Done { reason: StopReason, message: AgentMessage },
    Error { reason: StreamErrorReason, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorReason {
    Aborted,
    Error,
}

impl AssistantStreamEvent {
    /// `true` for the two events that end a stream: `done` and `error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// Producer half of the event stream. Held by a provider adapter.
pub struct EventSink {
    tx: mpsc::Sender<AssistantStreamEvent>,
}

impl EventSink {
    /// Send one event, suspending until the consumer has room. Returns
    /// `false` if the consumer has been dropped (e.g. on abort) — callers
    /// should stop producing further events.
    pub async fn send(&self, event: AssistantStreamEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

/// Consumer half of the event stream. Held by the agent loop.
pub struct EventStream {
    rx: mpsc::Receiver<AssistantStreamEvent>,
}

impl EventStream {
    /// Await the next event. Returns `None` once the producer has finished
    /// and dropped its sink (which only happens after a terminal event has
    /// already been yielded, or the producer task was aborted).
    pub async fn recv(&mut self) -> Option<AssistantStreamEvent> {
        self.rx.recv().await
    }
}

/// Construct a fresh, unbuffered (capacity 1) event channel.
pub fn channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::channel(1);
    (EventSink { tx }, EventStream { rx })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
