// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Agent-level events (§4.1), layered by the loop (C5) and the facade (C6)
//! over the provider-level [`agentcore_model::event::AssistantStreamEvent`]
//! stream (C2).

use agentcore_model::event::AssistantStreamEvent;
use agentcore_model::AgentMessage;
use agentcore_tools::ToolOutputPart;
use serde_json::Value;

/// One event in the agent-level stream a subscriber of [`crate::Agent`]
/// receives. Unlike [`AssistantStreamEvent`] these span a whole turn or the
/// whole run, not just one assistant message.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The run has begun (first turn of `agent_loop`/`agent_loop_continue`).
    AgentStart,
    /// The run has finished — no further turns will occur. Always emitted,
    /// even after cancellation, so subscribers can drain cleanly.
    AgentEnd { messages: Vec<AgentMessage> },

    /// A turn (one stream call plus its tool phase, if any) has begun.
    TurnStart,
    /// A turn has finished. `tool_results` is empty when the turn ended
    /// without a tool-use stop reason.
    TurnEnd {
        message: AgentMessage,
        tool_results: Vec<AgentMessage>,
    },

    /// A new assistant message has started streaming.
    MessageStart { message: AgentMessage },
    /// The assistant message's partial form changed; `event` is the
    /// provider-level event that caused the update.
    MessageUpdate {
        message: AgentMessage,
        event: AssistantStreamEvent,
    },
    /// The assistant message reached its terminal (committed) form.
    MessageEnd { message: AgentMessage },

    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    ToolExecutionUpdate {
        tool_call_id: String,
        tool_name: String,
        args: Value,
        partial_result: Vec<ToolOutputPart>,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        result: Vec<ToolOutputPart>,
        is_error: bool,
    },
}
