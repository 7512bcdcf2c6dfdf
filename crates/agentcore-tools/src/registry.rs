// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{Tool, ToolCall, ToolOutput, ToolUpdate};

/// A tool schema handed to a provider adapter when building the per-turn
/// request — mirrors `agentcore_model::ToolSchema` but keeps this crate
/// independent from the model crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry holding all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Execute a single call against the registry, converting an unknown
    /// tool or a tool-returned error into an `isError` [`ToolOutput`] — a
    /// failing tool never surfaces as an `Err` outside this function.
    pub async fn execute_one(
        &self,
        call: &ToolCall,
        cancel: &CancellationToken,
        on_update: &(dyn Fn(ToolUpdate) + Send + Sync),
    ) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(tool) => match tool.execute(&call.id, &call.args, cancel, on_update).await {
                Ok(success) => ToolOutput::from_success(call.id.clone(), success),
                Err(err) => ToolOutput::err(call.id.clone(), err.to_string()),
            },
            None => ToolOutput::err(&call.id, format!("unknown tool: {}", call.name)),
        }
    }

    /// Run every call from one assistant turn concurrently, preserving
    /// call order in the returned outputs (not completion order).
    ///
    /// After each completion, `poll_steering` is invoked; the first time it
    /// returns `true`, every call that has not yet produced a result is
    /// cancelled and filled in with a fixed skip message, and the batch
    /// returns immediately without waiting further. `on_update` is called
    /// with `(call_id, update)` for incremental progress from any call
    /// still in flight.
    pub async fn execute_batch(
        &self,
        calls: &[ToolCall],
        cancel: &CancellationToken,
        mut poll_steering: impl FnMut() -> bool,
        on_update: impl Fn(String, ToolUpdate) + Send + Sync + 'static,
    ) -> ToolBatchOutcome {
        let on_update = Arc::new(on_update);
        let mut set: JoinSet<(usize, ToolOutput)> = JoinSet::new();
        let mut tokens = Vec::with_capacity(calls.len());

        for (idx, call) in calls.iter().cloned().enumerate() {
            let tool = self.tools.get(&call.name).cloned();
            let token = cancel.child_token();
            tokens.push(token.clone());
            let on_update = on_update.clone();
            set.spawn(async move {
                let call_id = call.id.clone();
                let output = match tool {
                    Some(tool) => {
                        let cb_id = call_id.clone();
                        let cb = {
                            let on_update = on_update.clone();
                            move |update: ToolUpdate| on_update(cb_id.clone(), update)
                        };
                        match tool.execute(&call.id, &call.args, &token, &cb).await {
                            Ok(success) => ToolOutput::from_success(call_id, success),
                            Err(err) => ToolOutput::err(call_id, err.to_string()),
                        }
                    }
                    None => ToolOutput::err(call_id, format!("unknown tool: {}", call.name)),
                };
                (idx, output)
            });
        }

        let mut outputs: Vec<Option<ToolOutput>> = (0..calls.len()).map(|_| None).collect();
        let mut steering_interrupted = false;

        while let Some(joined) = set.join_next().await {
            if let Ok((idx, output)) = joined {
                outputs[idx] = Some(output);
            }
            if poll_steering() {
                steering_interrupted = true;
                break;
            }
        }

        if steering_interrupted {
            set.abort_all();
            for token in &tokens {
                token.cancel();
            }
        }

        let outputs = outputs
            .into_iter()
            .enumerate()
            .map(|(idx, out)| {
                out.unwrap_or_else(|| {
                    ToolOutput::err(
                        calls[idx].id.clone(),
                        "Tool execution skipped due to steering interruption",
                    )
                })
            })
            .collect();

        ToolBatchOutcome {
            outputs,
            steering_interrupted,
        }
    }
}

/// Result of running a concurrent tool phase.
pub struct ToolBatchOutcome {
    /// One output per input call, in the same order as the calls.
    pub outputs: Vec<ToolOutput>,
    pub steering_interrupted: bool,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
