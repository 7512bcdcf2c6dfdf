// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Integration tests for the [`crate::Agent`] facade end to end, against
//! [`agentcore_model::ScriptedMockProvider`]. Turn-sequencing edge cases
//! (retry, one-shot auth refresh, cancellation mid-stream) are covered at
//! the lower [`crate::agent_loop`] level instead — these exercise the
//! facade's bookkeeping on top of that loop.

#[cfg(test)]
mod agent_facade_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    use agentcore_model::ScriptedMockProvider;
    use agentcore_tools::{Tool, ToolRegistry, ToolSuccess, ToolUpdate};

    use crate::{Agent, AgentEvent};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn label(&self) -> &str {
            "Echo"
        }
        fn description(&self) -> &str {
            "Echoes its input argument back as the result."
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(
            &self,
            _call_id: &str,
            args: &Value,
            _cancel: &CancellationToken,
            _on_update: &(dyn Fn(ToolUpdate) + Send + Sync),
        ) -> anyhow::Result<ToolSuccess> {
            Ok(ToolSuccess::text(args.get("text").and_then(Value::as_str).unwrap_or("").to_string()))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn label(&self) -> &str {
            "Slow"
        }
        fn description(&self) -> &str {
            "Sleeps past the test's cancellation deadline."
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(
            &self,
            _call_id: &str,
            _args: &Value,
            cancel: &CancellationToken,
            _on_update: &(dyn Fn(ToolUpdate) + Send + Sync),
        ) -> anyhow::Result<ToolSuccess> {
            tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("cancelled"),
                _ = tokio::time::sleep(Duration::from_secs(5)) => Ok(ToolSuccess::text("done")),
            }
        }
    }

    // ── Plain text turn ──────────────────────────────────────────────────

    #[tokio::test]
    async fn plain_text_prompt_produces_user_and_assistant_messages() {
        let provider: Arc<dyn agentcore_model::ModelProvider> = Arc::new(ScriptedMockProvider::always_text("hi there"));
        let agent = Agent::new(provider, Arc::new(ToolRegistry::new()));

        agent.prompt("hello").await;
        agent.wait_for_idle().await;

        let snap = agent.snapshot();
        assert_eq!(snap.messages.len(), 2);
        assert_eq!(snap.messages[1].as_text().as_deref(), Some("hi there"));
        assert!(snap.error.is_none());
    }

    // ── Tool round-trip ───────────────────────────────────────────────────

    #[tokio::test]
    async fn tool_call_round_trip_feeds_result_back_into_history() {
        let provider: Arc<dyn agentcore_model::ModelProvider> = Arc::new(ScriptedMockProvider::tool_then_text(
            "call-1",
            "echo",
            json!({"text": "ping"}),
            "got it",
        ));
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        let agent = Agent::new(provider, Arc::new(tools));

        agent.prompt("please echo ping").await;
        agent.wait_for_idle().await;

        let snap = agent.snapshot();
        // user, assistant(tool-call), tool-result, assistant(final text)
        assert_eq!(snap.messages.len(), 4);
        assert_eq!(snap.messages[3].as_text().as_deref(), Some("got it"));
        assert!(snap.pending_tool_calls.is_empty());
    }

    // ── Steering takes priority over follow-up ───────────────────────────

    #[tokio::test]
    async fn queued_follow_up_triggers_a_second_turn_once_the_first_stops() {
        let provider: Arc<dyn agentcore_model::ModelProvider> = Arc::new(ScriptedMockProvider::always_text("ack"));
        let agent = Agent::new(provider, Arc::new(ToolRegistry::new()));

        agent.follow_up("and then what");
        agent.prompt("first").await;
        agent.wait_for_idle().await;

        let snap = agent.snapshot();
        // user("first"), assistant("ack"), user("and then what") injected as
        // follow-up, assistant("ack") again.
        assert_eq!(snap.messages.len(), 4);
        assert_eq!(snap.messages[2].as_text().as_deref(), Some("and then what"));
    }

    // ── Abort mid tool-phase ──────────────────────────────────────────────

    #[tokio::test]
    async fn abort_during_a_slow_tool_call_ends_the_run_without_completing_it() {
        let provider: Arc<dyn agentcore_model::ModelProvider> =
            Arc::new(ScriptedMockProvider::tool_then_text("call-1", "slow", json!({}), "never reached"));
        let mut tools = ToolRegistry::new();
        tools.register(SlowTool);
        let agent = Agent::new(provider, Arc::new(tools));

        agent.prompt("kick off the slow tool").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        agent.abort();
        agent.wait_for_idle().await;

        let snap = agent.snapshot();
        assert!(!snap.is_streaming);
        assert!(snap.messages.iter().all(|m| m.as_text().as_deref() != Some("never reached")));
    }

    // ── Subscribers see every event once, in order ───────────────────────

    #[tokio::test]
    async fn two_subscribers_each_see_the_full_event_sequence() {
        let provider: Arc<dyn agentcore_model::ModelProvider> = Arc::new(ScriptedMockProvider::always_text("ok"));
        let agent = Agent::new(provider, Arc::new(ToolRegistry::new()));

        let mut rx_a = agent.subscribe();
        let mut rx_b = agent.subscribe();
        agent.prompt("go").await;
        agent.wait_for_idle().await;

        let count_ends = |rx: &mut tokio::sync::broadcast::Receiver<AgentEvent>| {
            let mut seen = 0usize;
            while let Ok(event) = rx.try_recv() {
                if matches!(event, AgentEvent::AgentEnd { .. }) {
                    seen += 1;
                }
            }
            seen
        };
        assert_eq!(count_ends(&mut rx_a), 1);
        assert_eq!(count_ends(&mut rx_b), 1);
    }

    // ── Error turn surfaces as a visible error, loop still terminates ────

    #[tokio::test]
    async fn unregistered_tool_call_surfaces_as_error_result_not_a_crash() {
        let provider: Arc<dyn agentcore_model::ModelProvider> =
            Arc::new(ScriptedMockProvider::tool_then_text("call-1", "nonexistent", json!({}), "recovered"));
        let agent = Agent::new(provider, Arc::new(ToolRegistry::new()));

        agent.prompt("try a tool that doesn't exist").await;
        agent.wait_for_idle().await;

        let snap = agent.snapshot();
        assert_eq!(snap.messages.last().unwrap().as_text().as_deref(), Some("recovered"));
    }

    // ── Reset ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn reset_after_idle_clears_messages_and_pending_queues() {
        let provider: Arc<dyn agentcore_model::ModelProvider> = Arc::new(ScriptedMockProvider::always_text("ok"));
        let agent = Agent::new(provider, Arc::new(ToolRegistry::new()));

        agent.prompt("go").await;
        agent.wait_for_idle().await;
        agent.reset().expect("idle agent should reset cleanly");

        assert!(agent.snapshot().messages.is_empty());
    }
}
