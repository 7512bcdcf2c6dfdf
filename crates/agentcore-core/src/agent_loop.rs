// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The agent loop (C5, §4.5): drives one provider through turns until a
//! stop condition is reached, running the tool phase between turns and
//! giving steering messages priority over everything else.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use agentcore_model::event::{AssistantStreamEvent, StreamErrorReason};
use agentcore_model::{
    descriptor_for, AgentMessage, CompletionOptions, CompletionRequest, ContentBlock,
    ModelIdentity, ModelProvider, StopReason, ToolSchema as ModelToolSchema, Usage,
};
use agentcore_tools::{ToolCall, ToolOutputPart, ToolRegistry};

use crate::events::AgentEvent;
use crate::retry::{is_transient_message, retry_with_backoff, Attempt, RetryConfig};

/// Host-supplied behavior the loop cannot decide on its own: context
/// compaction, reducing extension-owned messages to wire form, credential
/// refresh, and the steering/follow-up queues (§4.6).
#[async_trait]
pub trait LoopHooks: Send + Sync {
    /// Apply compaction/branch-summary transforms before sending, if the
    /// context is over budget (§4.9). Default: no transform.
    async fn transform_context(&self, messages: &[AgentMessage]) -> anyhow::Result<Vec<AgentMessage>> {
        Ok(messages.to_vec())
    }

    /// Reduce any `AgentMessage::Custom` entries to one of the three
    /// wire-sendable variants. The loop never interprets `Custom` itself.
    fn convert_to_llm(&self, messages: &[AgentMessage]) -> Vec<AgentMessage>;

    /// Resolve the API key for the next provider call. Called once before
    /// the first attempt of a turn and, at most once more, after a 401.
    async fn get_api_key(&self) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    /// Drain queued steering messages. Polled before each turn and after
    /// every tool-call completion during the tool phase (§4.5 step 5).
    fn get_steering_messages(&self) -> Vec<AgentMessage> {
        Vec::new()
    }

    /// Drain queued follow-up messages. Polled only once the loop would
    /// otherwise stop with no steering pending.
    fn get_follow_up_messages(&self) -> Vec<AgentMessage> {
        Vec::new()
    }
}

#[derive(Clone)]
pub struct AgentLoopConfig {
    pub tools: Arc<ToolRegistry>,
    pub retry: RetryConfig,
}

enum TurnOutcome {
    /// Streaming ended via cancellation before or during a tool phase.
    Aborted,
    /// The turn ended without a tool call, or follow-up/steering found
    /// nothing further to inject.
    Stopped,
    /// A tool phase ran; `steering` holds any steering messages captured
    /// mid-phase, which take priority over continuing automatically.
    ToolUse { steering: Vec<AgentMessage> },
}

fn model_identity(provider: &dyn ModelProvider) -> ModelIdentity {
    let d = descriptor_for(provider);
    ModelIdentity { api: d.api, provider: d.provider, id: d.id }
}

fn is_unauthorized(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("401") || m.contains("unauthorized")
}

/// Place `block` at `index` in `content`, mirroring the way each adapter's
/// own `blocks` vector grows: the common case is a fresh block appended at
/// the next index; an index already present is overwritten in place. An
/// index further ahead than the current length (a provider emitting
/// out-of-order) is padded with empty text blocks rather than panicking.
fn set_content_block(content: &mut Vec<ContentBlock>, index: usize, block: ContentBlock) {
    match index.cmp(&content.len()) {
        std::cmp::Ordering::Less => content[index] = block,
        std::cmp::Ordering::Equal => content.push(block),
        std::cmp::Ordering::Greater => {
            content.resize(index, ContentBlock::text(""));
            content.push(block);
        }
    }
}

/// Mirror one non-terminal stream event onto the loop's locally held
/// partial assistant message, the same accumulation each adapter already
/// performs internally (see e.g. anthropic.rs's `blocks`) but replayed here
/// from the event fields alone so subscribers and an aborted turn's
/// committed message see more than the empty snapshot `Start` carried.
fn apply_partial_update(
    partial: &mut Option<AgentMessage>,
    partial_jsons: &mut HashMap<usize, String>,
    event: &AssistantStreamEvent,
) {
    let Some(AgentMessage::Assistant { content, .. }) = partial else { return };

    match event {
        AssistantStreamEvent::TextStart { content_index } => {
            set_content_block(content, *content_index, ContentBlock::text(""));
        }
        AssistantStreamEvent::TextDelta { content_index, delta } => {
            if let Some(ContentBlock::Text { text, .. }) = content.get_mut(*content_index) {
                text.push_str(delta);
            }
        }
        AssistantStreamEvent::TextEnd { content_index, content: full, signature } => {
            if let Some(ContentBlock::Text { text, text_signature }) = content.get_mut(*content_index) {
                *text = full.clone();
                *text_signature = signature.clone();
            }
        }
        AssistantStreamEvent::ThinkingStart { content_index } => {
            set_content_block(
                content,
                *content_index,
                ContentBlock::Thinking { thinking: String::new(), thinking_signature: None },
            );
        }
        AssistantStreamEvent::ThinkingDelta { content_index, delta } => {
            if let Some(ContentBlock::Thinking { thinking, .. }) = content.get_mut(*content_index) {
                thinking.push_str(delta);
            }
        }
        AssistantStreamEvent::ThinkingEnd { content_index, content: full, signature } => {
            if let Some(ContentBlock::Thinking { thinking, thinking_signature }) = content.get_mut(*content_index) {
                *thinking = full.clone();
                *thinking_signature = signature.clone();
            }
        }
        AssistantStreamEvent::ToolCallStart { content_index, id, name } => {
            set_content_block(
                content,
                *content_index,
                ContentBlock::tool_call(id.clone(), name.clone(), serde_json::json!({})),
            );
            partial_jsons.insert(*content_index, String::new());
        }
        AssistantStreamEvent::ToolCallDelta { content_index, delta } => {
            let acc = partial_jsons.entry(*content_index).or_default();
            acc.push_str(delta);
            let parsed = agentcore_model::partial_json::parse(acc);
            if let Some(ContentBlock::ToolCall { arguments, partial_json, .. }) = content.get_mut(*content_index) {
                *arguments = parsed;
                *partial_json = Some(acc.clone());
            }
        }
        AssistantStreamEvent::ToolCallEnd { content_index, tool_call } => {
            partial_jsons.remove(content_index);
            if let Some(ContentBlock::ToolCall { id, name, arguments, partial_json }) = content.get_mut(*content_index) {
                *id = tool_call.0.clone();
                *name = tool_call.1.clone();
                *arguments = tool_call.2.clone();
                *partial_json = None;
            }
        }
        AssistantStreamEvent::Start { .. } | AssistantStreamEvent::Done { .. } | AssistantStreamEvent::Error { .. } => {}
    }
}

/// If a successful turn's own usage report claims more input tokens than
/// the model's context window, the window silently overran even though the
/// provider returned an ordinary completion (§4.2 point 7(c), glossary
/// "Silent overflow"). Rewrite the committed message the same way the
/// adapters' own loud-overflow bail paths do: `stop_reason=error` with a
/// message carrying the same "overflow" marker, so a caller watching for
/// that marker does not need two separate checks.
fn check_silent_overflow(message: AgentMessage, context_window: u32) -> AgentMessage {
    match message {
        AgentMessage::Assistant { content, usage, stop_reason, error_message, model, timestamp }
            if agentcore_model::overflow::is_silent_overflow(usage.input, context_window) =>
        {
            let error_message = error_message.or_else(|| {
                Some(format!(
                    "{} overflow: usage reports {} input tokens, exceeding the model's {context_window}-token context window",
                    model.provider, usage.input
                ))
            });
            AgentMessage::Assistant { content, usage, stop_reason: StopReason::Error, error_message, model, timestamp }
        }
        other => other,
    }
}

/// Drive one `stream()` call to its terminal event, translating it into an
/// [`Attempt`]. Cancellation is folded into a normal `Done` carrying a
/// `StopReason::Aborted` message rather than an error, so the retry driver
/// never sees it as something to retry.
async fn stream_once(
    provider: &dyn ModelProvider,
    req: CompletionRequest,
    cancel: &CancellationToken,
    emit: &(dyn Fn(AgentEvent) + Send + Sync),
) -> Attempt<AgentMessage> {
    let context_window = req.model.context_window;
    let mut stream = match provider.stream(req).await {
        Ok(s) => s,
        Err(e) => {
            let msg = e.to_string();
            return if is_transient_message(&msg) {
                Attempt::Retry { error: e, retry_after: None }
            } else {
                Attempt::Fatal(e)
            };
        }
    };

    let mut partial: Option<AgentMessage> = None;
    let mut partial_jsons: HashMap<usize, String> = HashMap::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Attempt::Done(aborted_message(partial.as_ref(), None));
            }
            event = stream.recv() => {
                match event {
                    None => {
                        return Attempt::Retry {
                            error: anyhow::anyhow!("provider stream ended without a terminal event"),
                            retry_after: None,
                        };
                    }
                    Some(AssistantStreamEvent::Start { partial: p }) => {
                        emit(AgentEvent::MessageStart { message: p.clone() });
                        partial = Some(p);
                    }
                    Some(AssistantStreamEvent::Done { message, .. }) => {
                        let message = check_silent_overflow(message, context_window);
                        emit(AgentEvent::MessageEnd { message: message.clone() });
                        return Attempt::Done(message);
                    }
                    Some(AssistantStreamEvent::Error { reason, error }) => {
                        return match reason {
                            StreamErrorReason::Aborted => Attempt::Done(aborted_message(partial.as_ref(), Some(error))),
                            StreamErrorReason::Error if is_unauthorized(&error) => {
                                Attempt::Fatal(anyhow::anyhow!(error))
                            }
                            StreamErrorReason::Error if is_transient_message(&error) => {
                                Attempt::Retry { error: anyhow::anyhow!(error), retry_after: None }
                            }
                            StreamErrorReason::Error => Attempt::Fatal(anyhow::anyhow!(error)),
                        };
                    }
                    Some(other) => {
                        apply_partial_update(&mut partial, &mut partial_jsons, &other);
                        if let Some(p) = &partial {
                            emit(AgentEvent::MessageUpdate { message: p.clone(), event: other });
                        }
                    }
                }
            }
        }
    }
}

fn aborted_message(partial: Option<&AgentMessage>, error_message: Option<String>) -> AgentMessage {
    let (content, model) = match partial {
        Some(m @ AgentMessage::Assistant { model, .. }) => (m.content_blocks().to_vec(), model.clone()),
        _ => (vec![], ModelIdentity { api: String::new(), provider: String::new(), id: String::new() }),
    };
    AgentMessage::Assistant {
        content,
        usage: Usage::default(),
        stop_reason: StopReason::Aborted,
        error_message,
        model,
        timestamp: chrono::Utc::now(),
    }
}

/// Drive a turn's provider call through retry/backoff, with a one-shot
/// credential refresh when the first failure looks like an expired token.
async fn run_model_turn(
    provider: Arc<dyn ModelProvider>,
    req: CompletionRequest,
    hooks: Arc<dyn LoopHooks>,
    retry_cfg: &RetryConfig,
    cancel: CancellationToken,
    emit: Arc<dyn Fn(AgentEvent) + Send + Sync>,
) -> anyhow::Result<AgentMessage> {
    let req = Arc::new(AsyncMutex::new(req));
    let refreshed = Arc::new(AsyncMutex::new(false));

    retry_with_backoff(retry_cfg, move |_attempt| {
        let provider = provider.clone();
        let hooks = hooks.clone();
        let emit = emit.clone();
        let cancel = cancel.clone();
        let req = req.clone();
        let refreshed = refreshed.clone();
        async move {
            let current = req.lock().await.clone();
            let attempt = stream_once(provider.as_ref(), current, &cancel, emit.as_ref()).await;

            if let Attempt::Fatal(error) = &attempt {
                if is_unauthorized(&error.to_string()) {
                    let mut already_refreshed = refreshed.lock().await;
                    if !*already_refreshed {
                        *already_refreshed = true;
                        drop(already_refreshed);
                        if let Ok(Some(key)) = hooks.get_api_key().await {
                            req.lock().await.options.api_key = Some(key);
                        }
                        return Attempt::Retry {
                            error: anyhow::anyhow!("{error}"),
                            retry_after: Some(Duration::ZERO),
                        };
                    }
                }
            }

            attempt
        }
    })
    .await
}

fn to_model_tool_schema(schema: agentcore_tools::ToolSchema) -> ModelToolSchema {
    ModelToolSchema { name: schema.name, description: schema.description, parameters: schema.parameters }
}

fn tool_result_content(output: &agentcore_tools::ToolOutput) -> Vec<ContentBlock> {
    if output.parts.is_empty() {
        return vec![ContentBlock::text(output.content.clone())];
    }
    output
        .parts
        .iter()
        .map(|p| match p {
            ToolOutputPart::Text(t) => ContentBlock::text(t.clone()),
            ToolOutputPart::Image(data) => ContentBlock::image(data.clone(), "image/png"),
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
async fn run_one_turn(
    provider: &Arc<dyn ModelProvider>,
    hooks: &Arc<dyn LoopHooks>,
    tools: &Arc<ToolRegistry>,
    retry_cfg: &RetryConfig,
    cancel: &CancellationToken,
    emit: &Arc<dyn Fn(AgentEvent) + Send + Sync>,
    messages: &mut Vec<AgentMessage>,
    system_prompt: &Option<String>,
    base_options: &CompletionOptions,
) -> anyhow::Result<TurnOutcome> {
    emit(AgentEvent::TurnStart);

    let context = hooks.transform_context(messages).await?;
    let llm_messages = hooks.convert_to_llm(&context);

    let mut options = base_options.clone();
    if let Some(key) = hooks.get_api_key().await? {
        options.api_key = Some(key);
    }

    let tools_schema: Vec<ModelToolSchema> = tools.schemas().into_iter().map(to_model_tool_schema).collect();
    let req = CompletionRequest {
        model: descriptor_for(provider.as_ref()),
        messages: llm_messages,
        tools: tools_schema,
        options,
        system_dynamic_suffix: system_prompt.clone(),
    };

    let message = match run_model_turn(provider.clone(), req, hooks.clone(), retry_cfg, cancel.clone(), emit.clone()).await {
        Ok(m) => m,
        Err(e) => {
            let err_message = AgentMessage::Assistant {
                content: vec![],
                usage: Usage::default(),
                stop_reason: StopReason::Error,
                error_message: Some(e.to_string()),
                model: model_identity(provider.as_ref()),
                timestamp: chrono::Utc::now(),
            };
            messages.push(err_message.clone());
            emit(AgentEvent::TurnEnd { message: err_message, tool_results: vec![] });
            return Ok(TurnOutcome::Stopped);
        }
    };
    messages.push(message.clone());

    if matches!(&message, AgentMessage::Assistant { stop_reason: StopReason::Aborted, .. }) {
        emit(AgentEvent::TurnEnd { message, tool_results: vec![] });
        return Ok(TurnOutcome::Aborted);
    }

    let tool_calls = message.tool_calls();
    if tool_calls.is_empty() {
        emit(AgentEvent::TurnEnd { message, tool_results: vec![] });
        return Ok(TurnOutcome::Stopped);
    }

    let calls: Vec<ToolCall> = tool_calls
        .iter()
        .map(|(id, name, args)| ToolCall { id: id.to_string(), name: name.to_string(), args: (*args).clone() })
        .collect();
    let names: HashMap<String, String> = calls.iter().map(|c| (c.id.clone(), c.name.clone())).collect();
    let args_by_id: HashMap<String, Value> = calls.iter().map(|c| (c.id.clone(), c.args.clone())).collect();

    for call in &calls {
        emit(AgentEvent::ToolExecutionStart {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.args.clone(),
        });
    }

    // execute_batch's steering poll only returns a bool, so the actual
    // messages it observed are captured here for injection once the batch
    // settles.
    let steering_capture: Arc<StdMutex<Vec<AgentMessage>>> = Arc::new(StdMutex::new(Vec::new()));
    let poll_hooks = hooks.clone();
    let poll_capture = steering_capture.clone();
    let poll_steering = move || {
        let pending = poll_hooks.get_steering_messages();
        if pending.is_empty() {
            false
        } else {
            poll_capture.lock().unwrap().extend(pending);
            true
        }
    };

    let update_names = names.clone();
    let update_args = args_by_id.clone();
    let emit_for_update = emit.clone();
    let batch = tools
        .execute_batch(&calls, cancel, poll_steering, move |call_id, update| {
            let tool_name = update_names.get(&call_id).cloned().unwrap_or_default();
            let args = update_args.get(&call_id).cloned().unwrap_or(Value::Null);
            emit_for_update(AgentEvent::ToolExecutionUpdate {
                tool_call_id: call_id,
                tool_name,
                args,
                partial_result: update.parts,
            });
        })
        .await;

    let mut tool_result_messages = Vec::with_capacity(batch.outputs.len());
    for output in &batch.outputs {
        let tool_name = names.get(&output.call_id).cloned().unwrap_or_default();
        emit(AgentEvent::ToolExecutionEnd {
            tool_call_id: output.call_id.clone(),
            tool_name: tool_name.clone(),
            result: output.parts.clone(),
            is_error: output.is_error,
        });
        let result = AgentMessage::ToolResult {
            tool_call_id: output.call_id.clone(),
            tool_name,
            content: tool_result_content(output),
            is_error: output.is_error,
            details: output.details.clone(),
            timestamp: chrono::Utc::now(),
        };
        messages.push(result.clone());
        tool_result_messages.push(result);
    }

    emit(AgentEvent::TurnEnd { message, tool_results: tool_result_messages });

    if cancel.is_cancelled() {
        return Ok(TurnOutcome::Aborted);
    }
    let steering = std::mem::take(&mut *steering_capture.lock().unwrap());
    Ok(TurnOutcome::ToolUse { steering })
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    provider: Arc<dyn ModelProvider>,
    hooks: Arc<dyn LoopHooks>,
    config: &AgentLoopConfig,
    mut messages: Vec<AgentMessage>,
    system_prompt: Option<String>,
    options: CompletionOptions,
    cancel: CancellationToken,
    emit: Arc<dyn Fn(AgentEvent) + Send + Sync>,
) -> Vec<AgentMessage> {
    loop {
        if cancel.is_cancelled() {
            return messages;
        }

        let outcome = match run_one_turn(
            &provider,
            &hooks,
            &config.tools,
            &config.retry,
            &cancel,
            &emit,
            &mut messages,
            &system_prompt,
            &options,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                messages.push(AgentMessage::Assistant {
                    content: vec![],
                    usage: Usage::default(),
                    stop_reason: StopReason::Error,
                    error_message: Some(e.to_string()),
                    model: model_identity(provider.as_ref()),
                    timestamp: chrono::Utc::now(),
                });
                return messages;
            }
        };

        match outcome {
            TurnOutcome::Aborted => return messages,
            TurnOutcome::ToolUse { steering } => {
                // Priority 1: a steering message observed mid-tool-phase
                // wins over continuing the tool-use turn automatically.
                if !steering.is_empty() {
                    messages.extend(steering);
                }
            }
            TurnOutcome::Stopped => {
                let steering = hooks.get_steering_messages();
                if !steering.is_empty() {
                    messages.extend(steering);
                    continue;
                }
                let follow_up = hooks.get_follow_up_messages();
                if !follow_up.is_empty() {
                    messages.extend(follow_up);
                    continue;
                }
                return messages;
            }
        }
    }
}

/// Start a fresh run: append `prompt` to `history` and drive turns until
/// the loop stops, emitting `AgentStart`/`AgentEnd` around the whole run.
#[allow(clippy::too_many_arguments)]
pub async fn agent_loop(
    provider: Arc<dyn ModelProvider>,
    hooks: Arc<dyn LoopHooks>,
    config: AgentLoopConfig,
    mut history: Vec<AgentMessage>,
    prompt: AgentMessage,
    system_prompt: Option<String>,
    options: CompletionOptions,
    cancel: CancellationToken,
    on_event: impl Fn(AgentEvent) + Send + Sync + 'static,
) -> Vec<AgentMessage> {
    let emit: Arc<dyn Fn(AgentEvent) + Send + Sync> = Arc::new(on_event);
    emit(AgentEvent::AgentStart);
    history.push(prompt);
    let messages = run_loop(provider, hooks, &config, history, system_prompt, options, cancel, emit.clone()).await;
    emit(AgentEvent::AgentEnd { messages: messages.clone() });
    messages
}

/// Resume an already-started run — e.g. after a follow-up message was
/// queued once the previous run had already stopped — without emitting a
/// second `AgentStart`.
#[allow(clippy::too_many_arguments)]
pub async fn agent_loop_continue(
    provider: Arc<dyn ModelProvider>,
    hooks: Arc<dyn LoopHooks>,
    config: AgentLoopConfig,
    messages: Vec<AgentMessage>,
    system_prompt: Option<String>,
    options: CompletionOptions,
    cancel: CancellationToken,
    on_event: impl Fn(AgentEvent) + Send + Sync + 'static,
) -> Vec<AgentMessage> {
    let emit: Arc<dyn Fn(AgentEvent) + Send + Sync> = Arc::new(on_event);
    let messages = run_loop(provider, hooks, &config, messages, system_prompt, options, cancel, emit.clone()).await;
    emit(AgentEvent::AgentEnd { messages: messages.clone() });
    messages
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
