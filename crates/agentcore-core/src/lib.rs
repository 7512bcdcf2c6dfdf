// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod agent_loop;
mod compact;
mod events;
mod retry;
#[cfg(test)]
mod tests;

pub use agent::{Agent, AgentSnapshot, AgentState, DequeuePolicy, PendingToolCall};
pub use agent_loop::{agent_loop, agent_loop_continue, AgentLoopConfig, LoopHooks};
pub use compact::{
    compact_session, emergency_compact, serialize_transcript, smart_truncate, summarize_branch,
    BranchSummary,
};
pub use events::AgentEvent;
pub use retry::{is_transient_message, retry_with_backoff, Attempt, RetryConfig};
